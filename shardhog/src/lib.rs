//! shardhog is a sharded object store over many SQL databases.
//!
//! Objects live on a home shard chosen by the top bits of their id;
//! secondary lookup rows (alias digests, name prefixes, phonetic codes)
//! live on shards of their own. Mutations that touch two shards run
//! under two-phase commit: the first shard's transaction is prepared
//! before the mirror shard is touched, then committed or rolled back
//! depending on how the mirror write went.

pub mod api;
pub mod backend;
pub mod context;
pub mod error;
pub mod plans;
pub mod pool;
pub mod sharding;
pub mod storage;
pub mod timer;
pub mod two_pc;

pub use api::{Dmetaphone, Store};
pub use context::{ContextMeta, Endpoint, Registry, SearchClass};
pub use error::Error;
pub use pool::Pool;
pub use storage::{StorageClass, Value};

pub use shardhog_config as config;

/// Set up logging for tests and embedding binaries.
pub fn logger() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
