//! Shard-scoped connection pooling.

pub mod error;
pub mod guard;
pub mod pool_impl;

pub use error::Error;
pub use guard::Guard;
pub use pool_impl::Pool;
