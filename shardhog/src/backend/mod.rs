//! The per-shard query layer the coordinator drives.
//!
//! Each method of [`Connection`] corresponds to one statement (or one
//! tight statement batch) against a single shard. The coordinator
//! never sees SQL; it sees this facade. The in-memory implementation
//! in [`memory`] backs the test suite; a networked SQL backend
//! implements the same traits out of tree.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;

use crate::storage::Stored;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The in-flight query was cancelled out from under the driver.
    #[error("query canceled")]
    QueryCanceled,

    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violation")]
    UniqueViolation,

    #[error("backend connection failed: {0}")]
    Connect(String),

    #[error("backend error: {0}")]
    Other(String),
}

/// An alias digest (HMAC output).
pub type Digest = Vec<u8>;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub id: i64,
    pub ctx: i32,
    pub value: Stored,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRow {
    pub base_id: i64,
    pub ctx: i32,
    pub value: Stored,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AliasRow {
    pub base_id: i64,
    pub ctx: i32,
    pub value: String,
    pub flags: u32,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AliasLookupRow {
    pub base_id: i64,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipRow {
    pub base_id: i64,
    pub rel_id: i64,
    pub ctx: i32,
    pub base_ctx: i32,
    pub rel_ctx: i32,
    pub forward: bool,
    pub value: Stored,
    pub flags: u32,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameRow {
    pub base_id: i64,
    pub ctx: i32,
    pub value: String,
    pub flags: u32,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRow {
    pub base_id: i64,
    pub ctx: i32,
    pub child_id: i64,
    pub pos: usize,
}

/// A prefix-lookup search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct NameHit {
    pub base_id: i64,
    pub ctx: i32,
    pub value: String,
    pub flags: u32,
}

/// A phonetic-lookup search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct PhoneticHit {
    pub base_id: i64,
    pub ctx: i32,
    pub value: String,
    pub flags: u32,
    pub code: String,
}

/// Outcome of an alias-lookup insert attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AliasInsert {
    Inserted,
    /// The (digest, ctx) slot is taken; here's who by.
    Exists { owner: i64 },
}

/// A relationship row descriptor, as collected and removed by the
/// estate collector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelMirror {
    pub base_id: i64,
    pub ctx: i32,
    pub forward: bool,
    pub rel_id: i64,
}

/// Everything needed to insert one relationship row.
#[derive(Debug, Clone)]
pub struct RelationshipInsert {
    pub base_id: i64,
    pub rel_id: i64,
    pub ctx: i32,
    pub base_ctx: i32,
    pub rel_ctx: i32,
    pub forward: bool,
    pub value: Stored,
    pub index: Option<usize>,
    pub flags: u32,
}

/// Identifies the row a flag mutation applies to.
#[derive(Debug, Clone)]
pub enum FlagsTarget<'a> {
    Node {
        id: i64,
        ctx: i32,
    },
    Property {
        base_id: i64,
        ctx: i32,
    },
    Alias {
        base_id: i64,
        ctx: i32,
        value: &'a str,
    },
    AliasLookup {
        digest: &'a [u8],
        ctx: i32,
    },
    Relationship {
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        forward: bool,
    },
    Name {
        base_id: i64,
        ctx: i32,
        value: &'a str,
    },
    PrefixLookup {
        base_id: i64,
        ctx: i32,
        value: &'a str,
    },
    PhoneticLookup {
        base_id: i64,
        ctx: i32,
        code: &'a str,
        value: &'a str,
    },
}

/// Connection factory, one per store.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    async fn connect(&self, shard: usize) -> Result<Box<dyn Connection>, Error>;
}

/// One connection pinned to one shard.
///
/// Mutating statements outside a transaction take effect immediately.
/// `tpc_*` verbs drive the driver's distributed-transaction support:
/// a transaction begun with `tpc_begin` can be prepared, after which
/// any other connection to the same shard can commit or roll it back
/// by xid.
#[async_trait]
pub trait Connection: Send {
    // Transaction control.
    async fn begin(&mut self) -> Result<(), Error>;
    async fn commit(&mut self) -> Result<(), Error>;
    async fn rollback(&mut self) -> Result<(), Error>;
    async fn tpc_begin(&mut self, xid: &str) -> Result<(), Error>;
    async fn tpc_prepare(&mut self) -> Result<(), Error>;
    async fn tpc_commit(&mut self, xid: &str) -> Result<(), Error>;
    async fn tpc_rollback(&mut self, xid: &str) -> Result<(), Error>;
    fn in_transaction(&self) -> bool;

    /// Token that cancels this connection's in-flight query.
    fn cancellation(&self) -> CancellationToken;

    // Nodes.
    async fn insert_node(&mut self, ctx: i32, value: &Stored, flags: u32)
        -> Result<NodeRow, Error>;
    async fn select_node(&mut self, id: i64, ctx: i32) -> Result<Option<NodeRow>, Error>;
    async fn update_node(
        &mut self,
        id: i64,
        ctx: i32,
        value: &Stored,
        old_value: Option<&Stored>,
    ) -> Result<bool, Error>;
    /// Tombstone the given node ids; returns the ids actually removed.
    async fn remove_nodes(&mut self, ids: &[i64]) -> Result<Vec<i64>, Error>;

    // Edges.
    async fn insert_edge(
        &mut self,
        base_id: i64,
        ctx: i32,
        child_id: i64,
        index: Option<usize>,
        require_base: bool,
    ) -> Result<bool, Error>;
    async fn remove_edge(&mut self, base_id: i64, ctx: i32, child_id: i64)
        -> Result<bool, Error>;
    async fn select_edges(
        &mut self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
    ) -> Result<Vec<EdgeRow>, Error>;
    async fn reorder_edge(
        &mut self,
        base_id: i64,
        ctx: i32,
        child_id: i64,
        index: usize,
    ) -> Result<bool, Error>;
    /// Tombstone all edges hanging off the given bases; returns the
    /// child ids that were attached.
    async fn remove_edges_for_bases(&mut self, ids: &[i64]) -> Result<Vec<i64>, Error>;

    // Properties.
    /// Insert a property row. Fails with [`Error::UniqueViolation`]
    /// if a live row already exists; returns `false` if the base
    /// object is missing.
    async fn upsert_property(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &Stored,
        flags: u32,
    ) -> Result<bool, Error>;
    async fn update_property(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &Stored,
    ) -> Result<bool, Error>;
    async fn select_property(&mut self, base_id: i64, ctx: i32)
        -> Result<Option<PropertyRow>, Error>;
    async fn remove_property(&mut self, base_id: i64, ctx: i32) -> Result<bool, Error>;
    async fn remove_properties_for_bases(&mut self, ids: &[i64]) -> Result<(), Error>;

    // Aliases.
    /// Returns `false` if the base object is missing.
    async fn insert_alias(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: Option<usize>,
        flags: u32,
    ) -> Result<bool, Error>;
    async fn remove_alias(&mut self, base_id: i64, ctx: i32, value: &str) -> Result<bool, Error>;
    async fn select_aliases(
        &mut self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
    ) -> Result<Vec<AliasRow>, Error>;
    async fn reorder_alias(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: usize,
    ) -> Result<bool, Error>;
    /// Tombstone all aliases of the given bases; returns their
    /// (value, ctx) pairs.
    async fn remove_aliases_for_bases(&mut self, ids: &[i64])
        -> Result<Vec<(String, i32)>, Error>;

    // Alias lookups.
    async fn insert_alias_lookup(
        &mut self,
        digest: &[u8],
        ctx: i32,
        base_id: i64,
        flags: u32,
    ) -> Result<AliasInsert, Error>;
    async fn select_alias_lookup(
        &mut self,
        digest: &[u8],
        ctx: i32,
    ) -> Result<Option<AliasLookupRow>, Error>;
    async fn remove_alias_lookup(
        &mut self,
        digest: &[u8],
        ctx: i32,
        base_id: i64,
    ) -> Result<bool, Error>;
    /// Remove the given (digest, ctx) pairs; returns those removed.
    async fn remove_alias_lookups(
        &mut self,
        pairs: &[(Digest, i32)],
    ) -> Result<Vec<(Digest, i32)>, Error>;

    // Relationships.
    /// Insert one relationship row. Fails with
    /// [`Error::UniqueViolation`] on a duplicate; returns `false` if
    /// the anchoring object is missing.
    async fn insert_relationship(&mut self, row: &RelationshipInsert) -> Result<bool, Error>;
    async fn update_relationship(
        &mut self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        value: &Stored,
        old_value: Option<&Stored>,
        forward: bool,
    ) -> Result<bool, Error>;
    async fn remove_relationship(
        &mut self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        forward: bool,
    ) -> Result<bool, Error>;
    async fn select_relationships(
        &mut self,
        id: i64,
        ctx: i32,
        forward: bool,
        limit: usize,
        start: usize,
        rel_id: Option<i64>,
    ) -> Result<Vec<RelationshipRow>, Error>;
    async fn reorder_relationship(
        &mut self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        forward: bool,
        index: usize,
    ) -> Result<bool, Error>;
    /// Tombstone all relationship rows anchored at the given bases;
    /// returns descriptors of the removed rows.
    async fn remove_relationships_for_bases(
        &mut self,
        ids: &[i64],
    ) -> Result<Vec<RelMirror>, Error>;
    async fn remove_relationships(&mut self, mirrors: &[RelMirror]) -> Result<(), Error>;
    /// Re-densify positions in the given (anchor, ctx) lists.
    async fn bulk_reorder_relationships(
        &mut self,
        anchors: &[(i64, i32)],
        forward: bool,
    ) -> Result<(), Error>;

    // Flags (all tables).
    /// Apply `add`/`clear` to the target row's bitmap; returns the new
    /// bitmap, or `None` if there is no live row.
    async fn set_flags(
        &mut self,
        target: FlagsTarget<'_>,
        add: u32,
        clear: u32,
    ) -> Result<Option<u32>, Error>;

    // Names.
    /// Fails with [`Error::UniqueViolation`] on a duplicate; returns
    /// `false` if the base object is missing.
    async fn insert_name(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
        flags: u32,
        index: Option<usize>,
    ) -> Result<bool, Error>;
    async fn remove_name(&mut self, base_id: i64, ctx: i32, value: &str) -> Result<bool, Error>;
    async fn select_names(
        &mut self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
    ) -> Result<Vec<NameRow>, Error>;
    async fn reorder_name(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: usize,
    ) -> Result<bool, Error>;
    async fn remove_names_for_bases(
        &mut self,
        ids: &[i64],
    ) -> Result<Vec<(i64, i32, String)>, Error>;

    // Prefix lookups.
    async fn insert_prefix_lookup(
        &mut self,
        value: &str,
        flags: u32,
        ctx: i32,
        base_id: i64,
    ) -> Result<bool, Error>;
    async fn remove_prefix_lookup(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
    ) -> Result<bool, Error>;
    async fn prefix_lookup_exists(
        &mut self,
        value: &str,
        ctx: i32,
        base_id: i64,
    ) -> Result<bool, Error>;
    async fn search_prefixes(
        &mut self,
        prefix: &str,
        ctx: i32,
        limit: usize,
        start: &str,
    ) -> Result<Vec<NameHit>, Error>;
    async fn remove_prefix_lookups(
        &mut self,
        triples: &[(i64, i32, String)],
    ) -> Result<Vec<(i64, i32, String)>, Error>;

    // Phonetic lookups.
    async fn insert_phonetic_lookup(
        &mut self,
        value: &str,
        code: &str,
        flags: u32,
        ctx: i32,
        base_id: i64,
    ) -> Result<bool, Error>;
    async fn remove_phonetic_lookup(
        &mut self,
        base_id: i64,
        ctx: i32,
        code: &str,
        value: &str,
    ) -> Result<bool, Error>;
    async fn phonetic_lookup_exists(
        &mut self,
        code: &str,
        ctx: i32,
        value: &str,
        base_id: i64,
    ) -> Result<bool, Error>;
    async fn search_phonetics(
        &mut self,
        code: &str,
        ctx: i32,
        limit: usize,
        start: i64,
    ) -> Result<Vec<PhoneticHit>, Error>;
    /// Remove phonetic lookups (all codes) for the given
    /// (base_id, ctx, value) triples; returns those removed.
    async fn remove_phonetic_lookups(
        &mut self,
        triples: &[(i64, i32, String)],
    ) -> Result<Vec<(i64, i32, String)>, Error>;
}
