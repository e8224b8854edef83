//! Errors surfaced to API callers.

use thiserror::Error;

use crate::{backend, pool};

#[derive(Debug, Error)]
pub enum Error {
    /// The pool was configured read-only and a mutation was attempted.
    #[error("pool is read-only")]
    ReadOnly,

    /// The context is not registered, or is registered for a different
    /// table kind than the operation expects.
    #[error("bad context: {0}")]
    BadContext(i32),

    /// A union relationship was created without concrete endpoint
    /// contexts.
    #[error("context {0} requires base_ctx and rel_ctx to be supplied")]
    MissingContext(i32),

    /// A flag not registered for the context.
    #[error("flag {flag} is not registered for context {ctx}")]
    BadFlag { flag: u16, ctx: i32 },

    /// The object a mutation hangs off doesn't exist.
    #[error("no object {kind}<{ctx}/{id}>")]
    NoObject {
        kind: &'static str,
        ctx: i32,
        id: i64,
    },

    /// The alias digest is owned by a different base object.
    #[error("alias {alias:?} is already in use for context {ctx}")]
    AliasInUse { alias: String, ctx: i32 },

    /// The value doesn't satisfy the context's storage class.
    #[error("storage class error: {0}")]
    StorageClass(String),

    /// The operation deadline fired and cancelled an in-flight query.
    #[error("operation timed out")]
    Timeout,

    /// A two-phase handle was asked to continue after failing.
    #[error("two-phase transaction already failed")]
    TwoPcFailed,

    #[error("{0}")]
    Pool(#[from] pool::Error),

    #[error("{0}")]
    Backend(#[from] backend::Error),

    #[error("{0}")]
    Config(#[from] shardhog_config::Error),
}

impl Error {
    /// The driver reported that its current query was cancelled,
    /// which the timer translates into [`Error::Timeout`].
    pub fn query_canceled(&self) -> bool {
        matches!(
            self,
            Error::Backend(backend::Error::QueryCanceled)
                | Error::Pool(pool::Error::Backend(backend::Error::QueryCanceled))
        )
    }

    /// The database rejected a write on a uniqueness constraint.
    pub fn unique_violation(&self) -> bool {
        matches!(
            self,
            Error::Backend(backend::Error::UniqueViolation)
                | Error::Pool(pool::Error::Backend(backend::Error::UniqueViolation))
        )
    }
}
