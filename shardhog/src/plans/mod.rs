//! Multi-shard operation plans.
//!
//! Each plan drives one compound mutation across its shards: local
//! work on the primary shard under a two-phase handle, then mirror
//! work elsewhere, then commit or rollback. Orderings within a plan
//! are load-bearing; see the individual modules.

pub mod alias;
pub mod estate;
pub mod name;
pub mod node;
pub mod property;
pub mod relationship;

use crate::context::Registry;
use crate::Error;

/// The object a mutation hangs off doesn't exist.
pub(crate) fn no_object(registry: &Registry, ctx: i32, id: i64) -> Error {
    Error::NoObject {
        kind: registry.kind_name(ctx),
        ctx,
        id,
    }
}
