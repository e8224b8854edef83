//! The public surface: a [`Store`] with per-kind operations.
//!
//! Every operation validates its context against the registry,
//! enforces the pool's read-only fence before touching any shard,
//! converts flag sets and values at the boundary, and delegates the
//! actual work to the plans.

pub mod alias;
pub mod name;
pub mod node;
pub mod property;
pub mod relationship;

#[cfg(test)]
pub mod test;

use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::{AliasRow, EdgeRow, NameHit, NameRow, NodeRow, PropertyRow, RelationshipRow};
use crate::context::Registry;
use crate::pool::Pool;
use crate::storage::{storage_unwrap, Value};
use crate::Error;

pub use crate::plans::name::SearchCursor;

/// Double-metaphone: primary code plus optional alternate. Injected
/// at store construction; the coordinator only uses the codes as
/// shard keys.
pub type Dmetaphone = fn(&str) -> (String, Option<String>);

/// A sharded object store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool,
    registry: Arc<Registry>,
    dmetaphone: Dmetaphone,
}

impl Store {
    pub fn new(pool: Pool, registry: Arc<Registry>, dmetaphone: Dmetaphone) -> Self {
        Self {
            pool,
            registry,
            dmetaphone,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The read-only fence: mutations stop here, before any shard is
    /// touched.
    pub(crate) fn writable(&self) -> Result<(), Error> {
        if self.pool.readonly() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn decode_flags(&self, ctx: i32, bitmap: u32) -> Result<HashSet<u16>, Error> {
        self.registry.int_to_flags(ctx, bitmap)
    }

    pub(crate) fn node_from_row(&self, row: NodeRow) -> Result<Node, Error> {
        Ok(Node {
            id: row.id,
            ctx: row.ctx,
            value: storage_unwrap(&self.registry, row.ctx, &row.value)?,
            flags: self.decode_flags(row.ctx, row.flags)?,
        })
    }

    pub(crate) fn property_from_row(&self, row: PropertyRow) -> Result<Property, Error> {
        Ok(Property {
            base_id: row.base_id,
            ctx: row.ctx,
            value: storage_unwrap(&self.registry, row.ctx, &row.value)?,
            flags: self.decode_flags(row.ctx, row.flags)?,
        })
    }

    pub(crate) fn alias_from_row(&self, row: AliasRow) -> Result<Alias, Error> {
        Ok(Alias {
            base_id: row.base_id,
            ctx: row.ctx,
            value: row.value,
            flags: self.decode_flags(row.ctx, row.flags)?,
        })
    }

    pub(crate) fn relationship_from_row(
        &self,
        row: RelationshipRow,
    ) -> Result<Relationship, Error> {
        Ok(Relationship {
            base_id: row.base_id,
            rel_id: row.rel_id,
            ctx: row.ctx,
            base_ctx: row.base_ctx,
            rel_ctx: row.rel_ctx,
            value: storage_unwrap(&self.registry, row.ctx, &row.value)?,
            flags: self.decode_flags(row.ctx, row.flags)?,
        })
    }

    pub(crate) fn name_from_row(&self, row: NameRow) -> Result<Name, Error> {
        Ok(Name {
            base_id: row.base_id,
            ctx: row.ctx,
            value: row.value,
            flags: self.decode_flags(row.ctx, row.flags)?,
        })
    }

    pub(crate) fn name_from_hit(&self, hit: NameHit) -> Result<Name, Error> {
        Ok(Name {
            base_id: hit.base_id,
            ctx: hit.ctx,
            value: hit.value,
            flags: self.decode_flags(hit.ctx, hit.flags)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub ctx: i32,
    pub value: Value,
    pub flags: HashSet<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub base_id: i64,
    pub ctx: i32,
    pub value: Value,
    pub flags: HashSet<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub base_id: i64,
    pub ctx: i32,
    pub value: String,
    pub flags: HashSet<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub base_id: i64,
    pub rel_id: i64,
    pub ctx: i32,
    pub base_ctx: i32,
    pub rel_ctx: i32,
    pub value: Value,
    pub flags: HashSet<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Name {
    pub base_id: i64,
    pub ctx: i32,
    pub value: String,
    pub flags: HashSet<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub base_id: i64,
    pub ctx: i32,
    pub child_id: i64,
    pub pos: usize,
}

impl From<EdgeRow> for Edge {
    fn from(row: EdgeRow) -> Self {
        Self {
            base_id: row.base_id,
            ctx: row.ctx,
            child_id: row.child_id,
            pos: row.pos,
        }
    }
}
