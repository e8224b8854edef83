use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection checkout timed out")]
    CheckoutTimeout,

    #[error("unknown shard: {0}")]
    UnknownShard(usize),

    #[error("pool is not ready")]
    NotReady,

    #[error("{0}")]
    Backend(#[from] crate::backend::Error),
}
