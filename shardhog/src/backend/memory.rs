//! In-memory shard backend.
//!
//! Implements the full [`Connection`] facade over per-shard tables
//! held in process memory, including snapshot-based transactions and
//! a prepared-xid registry, so the coordinator can be exercised end
//! to end without a database. Rows are tombstoned with a timestamp
//! the way the SQL layout does it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    AliasInsert, AliasLookupRow, AliasRow, Backend, Connection, Digest, EdgeRow, Error,
    FlagsTarget, NameHit, NameRow, NodeRow, PhoneticHit, PropertyRow, RelMirror,
    RelationshipInsert, RelationshipRow,
};
use crate::storage::Stored;

/// A row plus its tombstone.
#[derive(Debug, Clone)]
struct Rec<T> {
    row: T,
    removed: Option<DateTime<Utc>>,
}

impl<T> Rec<T> {
    fn new(row: T) -> Self {
        Self { row, removed: None }
    }

    fn live(&self) -> bool {
        self.removed.is_none()
    }

    fn tombstone(&mut self) {
        self.removed = Some(Utc::now());
    }
}

#[derive(Debug, Clone)]
struct AliasLookupRec {
    digest: Digest,
    ctx: i32,
    base_id: i64,
    flags: u32,
}

#[derive(Debug, Clone)]
struct PrefixRec {
    base_id: i64,
    ctx: i32,
    value: String,
    flags: u32,
}

#[derive(Debug, Clone)]
struct PhoneticRec {
    base_id: i64,
    ctx: i32,
    code: String,
    value: String,
    flags: u32,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    nodes: Vec<Rec<NodeRow>>,
    node_seq: u64,
    properties: Vec<Rec<PropertyRow>>,
    aliases: Vec<Rec<AliasRow>>,
    alias_lookups: Vec<Rec<AliasLookupRec>>,
    relationships: Vec<Rec<RelationshipRow>>,
    names: Vec<Rec<NameRow>>,
    prefix_lookups: Vec<Rec<PrefixRec>>,
    phonetic_lookups: Vec<Rec<PhoneticRec>>,
    edges: Vec<Rec<EdgeRow>>,
}

impl Tables {
    fn node_live(&self, id: i64) -> bool {
        self.nodes.iter().any(|rec| rec.live() && rec.row.id == id)
    }

    fn node_live_ctx(&self, id: i64, ctx: i32) -> bool {
        self.nodes
            .iter()
            .any(|rec| rec.live() && rec.row.id == id && rec.row.ctx == ctx)
    }
}

#[derive(Debug, Default)]
struct ShardState {
    tables: Tables,
    // xid → pre-transaction snapshot, restored on rollback.
    prepared: HashMap<String, Tables>,
    latency: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    shard_bits: u32,
    shards: Vec<Mutex<ShardState>>,
    statements: AtomicU64,
}

/// The in-memory backend: a set of shards behind the standard facade.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

/// Live-row counts for one shard, for test assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveCounts {
    pub nodes: usize,
    pub properties: usize,
    pub aliases: usize,
    pub alias_lookups: usize,
    pub relationships: usize,
    pub names: usize,
    pub prefix_lookups: usize,
    pub phonetic_lookups: usize,
    pub edges: usize,
}

impl MemoryBackend {
    pub fn new(shards: usize, shard_bits: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                shard_bits,
                shards: (0..shards).map(|_| Mutex::new(ShardState::default())).collect(),
                statements: AtomicU64::new(0),
            }),
        }
    }

    /// Total statements executed, across all shards.
    pub fn statements(&self) -> u64 {
        self.inner.statements.load(Ordering::Relaxed)
    }

    /// Inject per-statement latency on one shard.
    pub fn set_latency(&self, shard: usize, latency: Option<Duration>) {
        self.inner.shards[shard].lock().latency = latency;
    }

    /// Number of prepared transactions outstanding anywhere.
    pub fn prepared_transactions(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.lock().prepared.len())
            .sum()
    }

    pub fn live_counts(&self, shard: usize) -> LiveCounts {
        let state = self.inner.shards[shard].lock();
        let tables = &state.tables;
        fn live<T>(rows: &[Rec<T>]) -> usize {
            rows.iter().filter(|rec| rec.live()).count()
        }
        LiveCounts {
            nodes: live(&tables.nodes),
            properties: live(&tables.properties),
            aliases: live(&tables.aliases),
            alias_lookups: live(&tables.alias_lookups),
            relationships: live(&tables.relationships),
            names: live(&tables.names),
            prefix_lookups: live(&tables.prefix_lookups),
            phonetic_lookups: live(&tables.phonetic_lookups),
            edges: live(&tables.edges),
        }
    }

    /// Live relationship rows on one shard, in storage order.
    pub fn relationship_rows(&self, shard: usize) -> Vec<RelationshipRow> {
        self.inner.shards[shard]
            .lock()
            .tables
            .relationships
            .iter()
            .filter(|rec| rec.live())
            .map(|rec| rec.row.clone())
            .collect()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self, shard: usize) -> Result<Box<dyn Connection>, Error> {
        if shard >= self.inner.shards.len() {
            return Err(Error::Connect(format!("no shard {}", shard)));
        }
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
            shard,
            token: CancellationToken::new(),
            txn: None,
        }))
    }
}

#[derive(Debug, Clone)]
struct Txn {
    snapshot: Tables,
    xid: Option<String>,
}

struct MemoryConnection {
    inner: Arc<Inner>,
    shard: usize,
    token: CancellationToken,
    txn: Option<Txn>,
}

impl Drop for MemoryConnection {
    // A connection dying with an unfinished transaction aborts it,
    // the way the server would.
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            self.inner.shards[self.shard].lock().tables = txn.snapshot;
        }
    }
}

// Dense-position list maintenance shared by every ordered table.
trait Positioned {
    fn pos(&self) -> usize;
    fn set_pos(&mut self, pos: usize);
}

impl Positioned for AliasRow {
    fn pos(&self) -> usize {
        self.pos
    }
    fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }
}

impl Positioned for NameRow {
    fn pos(&self) -> usize {
        self.pos
    }
    fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }
}

impl Positioned for RelationshipRow {
    fn pos(&self) -> usize {
        self.pos
    }
    fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }
}

impl Positioned for EdgeRow {
    fn pos(&self) -> usize {
        self.pos
    }
    fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }
}

fn list_len<T: Positioned>(rows: &[Rec<T>], in_list: &dyn Fn(&T) -> bool) -> usize {
    rows.iter()
        .filter(|rec| rec.live() && in_list(&rec.row))
        .count()
}

/// Insert `row` into its list at `index` (end if omitted or past the
/// end), shifting later rows up.
fn dense_insert<T: Positioned>(
    rows: &mut Vec<Rec<T>>,
    in_list: &dyn Fn(&T) -> bool,
    mut row: T,
    index: Option<usize>,
) {
    let len = list_len(rows, in_list);
    let index = index.unwrap_or(len).min(len);
    for rec in rows.iter_mut().filter(|rec| rec.live() && in_list(&rec.row)) {
        if rec.row.pos() >= index {
            let pos = rec.row.pos();
            rec.row.set_pos(pos + 1);
        }
    }
    row.set_pos(index);
    rows.push(Rec::new(row));
}

/// Close the hole left at `removed_pos` after a row was tombstoned.
fn dense_remove<T: Positioned>(
    rows: &mut Vec<Rec<T>>,
    in_list: &dyn Fn(&T) -> bool,
    removed_pos: usize,
) {
    for rec in rows.iter_mut().filter(|rec| rec.live() && in_list(&rec.row)) {
        if rec.row.pos() > removed_pos {
            let pos = rec.row.pos();
            rec.row.set_pos(pos - 1);
        }
    }
}

/// Reassign positions 0..n preserving current order.
fn redensify<T: Positioned>(rows: &mut Vec<Rec<T>>, in_list: &dyn Fn(&T) -> bool) {
    let mut members: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, rec)| rec.live() && in_list(&rec.row))
        .map(|(at, _)| at)
        .collect();
    members.sort_by_key(|at| rows[*at].row.pos());
    for (pos, at) in members.into_iter().enumerate() {
        rows[at].row.set_pos(pos);
    }
}

/// Move the row matching `select` to `index` within its list.
fn dense_reorder<T: Positioned>(
    rows: &mut Vec<Rec<T>>,
    in_list: &dyn Fn(&T) -> bool,
    select: &dyn Fn(&T) -> bool,
    index: usize,
) -> bool {
    let old = match rows
        .iter()
        .find(|rec| rec.live() && in_list(&rec.row) && select(&rec.row))
    {
        Some(rec) => rec.row.pos(),
        None => return false,
    };
    let len = list_len(rows, in_list);
    let new = index.min(len.saturating_sub(1));

    for rec in rows.iter_mut().filter(|rec| rec.live() && in_list(&rec.row)) {
        let pos = rec.row.pos();
        if select(&rec.row) {
            rec.row.set_pos(new);
        } else if old < new && pos > old && pos <= new {
            rec.row.set_pos(pos - 1);
        } else if new < old && pos >= new && pos < old {
            rec.row.set_pos(pos + 1);
        }
    }
    true
}

impl MemoryConnection {
    /// Per-statement gate: counts the statement, applies injected
    /// latency, and honors cancellation.
    async fn gate(&self) -> Result<(), Error> {
        self.inner.statements.fetch_add(1, Ordering::Relaxed);

        if self.token.is_cancelled() {
            return Err(Error::QueryCanceled);
        }

        let latency = self.inner.shards[self.shard].lock().latency;
        if let Some(latency) = latency {
            tokio::select! {
                _ = tokio::time::sleep(latency) => {}
                _ = self.token.cancelled() => return Err(Error::QueryCanceled),
            }
        }

        Ok(())
    }

    fn with_tables<R>(&mut self, work: impl FnOnce(&mut Tables) -> R) -> R {
        let mut state = self.inner.shards[self.shard].lock();
        work(&mut state.tables)
    }

    /// Mutating statements join an implicit transaction, opened on
    /// first use and closed by an explicit commit or rollback.
    fn mutate<R>(&mut self, work: impl FnOnce(&mut Tables) -> R) -> R {
        if self.txn.is_none() {
            let snapshot = self.inner.shards[self.shard].lock().tables.clone();
            self.txn = Some(Txn {
                snapshot,
                xid: None,
            });
        }
        self.with_tables(work)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), Error> {
        self.gate().await?;
        if self.txn.is_none() {
            let snapshot = self.inner.shards[self.shard].lock().tables.clone();
            self.txn = Some(Txn {
                snapshot,
                xid: None,
            });
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), Error> {
        self.gate().await?;
        self.txn = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        self.gate().await?;
        if let Some(txn) = self.txn.take() {
            self.inner.shards[self.shard].lock().tables = txn.snapshot;
        }
        Ok(())
    }

    async fn tpc_begin(&mut self, xid: &str) -> Result<(), Error> {
        self.gate().await?;
        if self.txn.is_some() {
            return Err(Error::Other("transaction already in progress".into()));
        }
        let snapshot = self.inner.shards[self.shard].lock().tables.clone();
        self.txn = Some(Txn {
            snapshot,
            xid: Some(xid.to_string()),
        });
        Ok(())
    }

    async fn tpc_prepare(&mut self) -> Result<(), Error> {
        self.gate().await?;
        match self.txn.take() {
            Some(Txn {
                snapshot,
                xid: Some(xid),
            }) => {
                self.inner.shards[self.shard]
                    .lock()
                    .prepared
                    .insert(xid, snapshot);
                Ok(())
            }
            _ => Err(Error::Other("no two-phase transaction to prepare".into())),
        }
    }

    async fn tpc_commit(&mut self, xid: &str) -> Result<(), Error> {
        self.gate().await?;
        self.inner.shards[self.shard].lock().prepared.remove(xid);
        Ok(())
    }

    async fn tpc_rollback(&mut self, xid: &str) -> Result<(), Error> {
        self.gate().await?;
        let mut state = self.inner.shards[self.shard].lock();
        if let Some(snapshot) = state.prepared.remove(xid) {
            state.tables = snapshot;
        } else if let Some(txn) = self.txn.take() {
            if txn.xid.as_deref() == Some(xid) {
                state.tables = txn.snapshot;
            }
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn insert_node(
        &mut self,
        ctx: i32,
        value: &Stored,
        flags: u32,
    ) -> Result<NodeRow, Error> {
        self.gate().await?;
        let shard = self.shard as u64;
        let shard_bits = self.inner.shard_bits;
        Ok(self.mutate(|tables| {
            tables.node_seq += 1;
            let id = ((shard << (64 - shard_bits)) | tables.node_seq) as i64;
            let row = NodeRow {
                id,
                ctx,
                value: value.clone(),
                flags,
            };
            tables.nodes.push(Rec::new(row.clone()));
            row
        }))
    }

    async fn select_node(&mut self, id: i64, ctx: i32) -> Result<Option<NodeRow>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            tables
                .nodes
                .iter()
                .find(|rec| rec.live() && rec.row.id == id && rec.row.ctx == ctx)
                .map(|rec| rec.row.clone())
        }))
    }

    async fn update_node(
        &mut self,
        id: i64,
        ctx: i32,
        value: &Stored,
        old_value: Option<&Stored>,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.nodes.iter_mut() {
                if rec.live() && rec.row.id == id && rec.row.ctx == ctx {
                    if let Some(old_value) = old_value {
                        if rec.row.value != *old_value {
                            return false;
                        }
                    }
                    rec.row.value = value.clone();
                    return true;
                }
            }
            false
        }))
    }

    async fn remove_nodes(&mut self, ids: &[i64]) -> Result<Vec<i64>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed = vec![];
            for rec in tables.nodes.iter_mut() {
                if rec.live() && ids.contains(&rec.row.id) {
                    rec.tombstone();
                    removed.push(rec.row.id);
                }
            }
            removed
        }))
    }

    async fn insert_edge(
        &mut self,
        base_id: i64,
        ctx: i32,
        child_id: i64,
        index: Option<usize>,
        require_base: bool,
    ) -> Result<bool, Error> {
        self.gate().await?;
        self.mutate(|tables| {
            if require_base && !tables.node_live(base_id) {
                return Ok(false);
            }
            if tables
                .edges
                .iter()
                .any(|rec| rec.live() && rec.row.ctx == ctx && rec.row.child_id == child_id)
            {
                return Err(Error::UniqueViolation);
            }
            let in_list =
                move |row: &EdgeRow| row.base_id == base_id && row.ctx == ctx;
            dense_insert(
                &mut tables.edges,
                &in_list,
                EdgeRow {
                    base_id,
                    ctx,
                    child_id,
                    pos: 0,
                },
                index,
            );
            Ok(true)
        })
    }

    async fn remove_edge(
        &mut self,
        base_id: i64,
        ctx: i32,
        child_id: i64,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed_pos = None;
            for rec in tables.edges.iter_mut() {
                if rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.child_id == child_id
                {
                    removed_pos = Some(rec.row.pos);
                    rec.tombstone();
                    break;
                }
            }
            match removed_pos {
                Some(pos) => {
                    let in_list =
                        move |row: &EdgeRow| row.base_id == base_id && row.ctx == ctx;
                    dense_remove(&mut tables.edges, &in_list, pos);
                    true
                }
                None => false,
            }
        }))
    }

    async fn select_edges(
        &mut self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
    ) -> Result<Vec<EdgeRow>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            let mut rows: Vec<EdgeRow> = tables
                .edges
                .iter()
                .filter(|rec| {
                    rec.live()
                        && rec.row.base_id == base_id
                        && rec.row.ctx == ctx
                        && rec.row.pos >= start
                })
                .map(|rec| rec.row.clone())
                .collect();
            rows.sort_by_key(|row| row.pos);
            rows.truncate(limit);
            rows
        }))
    }

    async fn reorder_edge(
        &mut self,
        base_id: i64,
        ctx: i32,
        child_id: i64,
        index: usize,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let in_list = move |row: &EdgeRow| row.base_id == base_id && row.ctx == ctx;
            let select = move |row: &EdgeRow| row.child_id == child_id;
            dense_reorder(&mut tables.edges, &in_list, &select, index)
        }))
    }

    async fn remove_edges_for_bases(&mut self, ids: &[i64]) -> Result<Vec<i64>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut children = vec![];
            for rec in tables.edges.iter_mut() {
                if rec.live() && ids.contains(&rec.row.base_id) {
                    rec.tombstone();
                    children.push(rec.row.child_id);
                }
            }
            children
        }))
    }

    async fn upsert_property(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &Stored,
        flags: u32,
    ) -> Result<bool, Error> {
        self.gate().await?;
        self.mutate(|tables| {
            if tables
                .properties
                .iter()
                .any(|rec| rec.live() && rec.row.base_id == base_id && rec.row.ctx == ctx)
            {
                return Err(Error::UniqueViolation);
            }
            if !tables.node_live(base_id) {
                return Ok(false);
            }
            tables.properties.push(Rec::new(PropertyRow {
                base_id,
                ctx,
                value: value.clone(),
                flags,
            }));
            Ok(true)
        })
    }

    async fn update_property(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &Stored,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.properties.iter_mut() {
                if rec.live() && rec.row.base_id == base_id && rec.row.ctx == ctx {
                    rec.row.value = value.clone();
                    return true;
                }
            }
            false
        }))
    }

    async fn select_property(
        &mut self,
        base_id: i64,
        ctx: i32,
    ) -> Result<Option<PropertyRow>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            tables
                .properties
                .iter()
                .find(|rec| rec.live() && rec.row.base_id == base_id && rec.row.ctx == ctx)
                .map(|rec| rec.row.clone())
        }))
    }

    async fn remove_property(&mut self, base_id: i64, ctx: i32) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.properties.iter_mut() {
                if rec.live() && rec.row.base_id == base_id && rec.row.ctx == ctx {
                    rec.tombstone();
                    return true;
                }
            }
            false
        }))
    }

    async fn remove_properties_for_bases(&mut self, ids: &[i64]) -> Result<(), Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.properties.iter_mut() {
                if rec.live() && ids.contains(&rec.row.base_id) {
                    rec.tombstone();
                }
            }
        }))
    }

    async fn insert_alias(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: Option<usize>,
        flags: u32,
    ) -> Result<bool, Error> {
        self.gate().await?;
        self.mutate(|tables| {
            if !tables.node_live(base_id) {
                return Ok(false);
            }
            if tables
                .aliases
                .iter()
                .any(|rec| {
                    rec.live()
                        && rec.row.base_id == base_id
                        && rec.row.ctx == ctx
                        && rec.row.value == value
                })
            {
                return Err(Error::UniqueViolation);
            }
            let in_list = move |row: &AliasRow| row.base_id == base_id && row.ctx == ctx;
            dense_insert(
                &mut tables.aliases,
                &in_list,
                AliasRow {
                    base_id,
                    ctx,
                    value: value.to_string(),
                    flags,
                    pos: 0,
                },
                index,
            );
            Ok(true)
        })
    }

    async fn remove_alias(&mut self, base_id: i64, ctx: i32, value: &str) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed_pos = None;
            for rec in tables.aliases.iter_mut() {
                if rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.value == value
                {
                    removed_pos = Some(rec.row.pos);
                    rec.tombstone();
                    break;
                }
            }
            match removed_pos {
                Some(pos) => {
                    let in_list =
                        move |row: &AliasRow| row.base_id == base_id && row.ctx == ctx;
                    dense_remove(&mut tables.aliases, &in_list, pos);
                    true
                }
                None => false,
            }
        }))
    }

    async fn select_aliases(
        &mut self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
    ) -> Result<Vec<AliasRow>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            let mut rows: Vec<AliasRow> = tables
                .aliases
                .iter()
                .filter(|rec| {
                    rec.live()
                        && rec.row.base_id == base_id
                        && rec.row.ctx == ctx
                        && rec.row.pos >= start
                })
                .map(|rec| rec.row.clone())
                .collect();
            rows.sort_by_key(|row| row.pos);
            rows.truncate(limit);
            rows
        }))
    }

    async fn reorder_alias(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: usize,
    ) -> Result<bool, Error> {
        self.gate().await?;
        let value = value.to_string();
        Ok(self.mutate(|tables| {
            let in_list = move |row: &AliasRow| row.base_id == base_id && row.ctx == ctx;
            let select = move |row: &AliasRow| row.value == value;
            dense_reorder(&mut tables.aliases, &in_list, &select, index)
        }))
    }

    async fn remove_aliases_for_bases(
        &mut self,
        ids: &[i64],
    ) -> Result<Vec<(String, i32)>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed = vec![];
            for rec in tables.aliases.iter_mut() {
                if rec.live() && ids.contains(&rec.row.base_id) {
                    rec.tombstone();
                    removed.push((rec.row.value.clone(), rec.row.ctx));
                }
            }
            removed
        }))
    }

    async fn insert_alias_lookup(
        &mut self,
        digest: &[u8],
        ctx: i32,
        base_id: i64,
        flags: u32,
    ) -> Result<AliasInsert, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            if let Some(rec) = tables
                .alias_lookups
                .iter()
                .find(|rec| rec.live() && rec.row.digest == digest && rec.row.ctx == ctx)
            {
                return AliasInsert::Exists {
                    owner: rec.row.base_id,
                };
            }
            tables.alias_lookups.push(Rec::new(AliasLookupRec {
                digest: digest.to_vec(),
                ctx,
                base_id,
                flags,
            }));
            AliasInsert::Inserted
        }))
    }

    async fn select_alias_lookup(
        &mut self,
        digest: &[u8],
        ctx: i32,
    ) -> Result<Option<AliasLookupRow>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            tables
                .alias_lookups
                .iter()
                .find(|rec| rec.live() && rec.row.digest == digest && rec.row.ctx == ctx)
                .map(|rec| AliasLookupRow {
                    base_id: rec.row.base_id,
                    flags: rec.row.flags,
                })
        }))
    }

    async fn remove_alias_lookup(
        &mut self,
        digest: &[u8],
        ctx: i32,
        base_id: i64,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.alias_lookups.iter_mut() {
                if rec.live()
                    && rec.row.digest == digest
                    && rec.row.ctx == ctx
                    && rec.row.base_id == base_id
                {
                    rec.tombstone();
                    return true;
                }
            }
            false
        }))
    }

    async fn remove_alias_lookups(
        &mut self,
        pairs: &[(Digest, i32)],
    ) -> Result<Vec<(Digest, i32)>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed = vec![];
            for rec in tables.alias_lookups.iter_mut() {
                if rec.live()
                    && pairs
                        .iter()
                        .any(|(digest, ctx)| *digest == rec.row.digest && *ctx == rec.row.ctx)
                {
                    rec.tombstone();
                    removed.push((rec.row.digest.clone(), rec.row.ctx));
                }
            }
            removed
        }))
    }

    async fn insert_relationship(&mut self, row: &RelationshipInsert) -> Result<bool, Error> {
        self.gate().await?;
        self.mutate(|tables| {
            let anchor_id = if row.forward { row.base_id } else { row.rel_id };
            let anchor_ctx = if row.forward { row.base_ctx } else { row.rel_ctx };

            if tables.relationships.iter().any(|rec| {
                rec.live()
                    && rec.row.base_id == row.base_id
                    && rec.row.ctx == row.ctx
                    && rec.row.rel_id == row.rel_id
                    && rec.row.forward == row.forward
            }) {
                return Err(Error::UniqueViolation);
            }

            if !tables.node_live_ctx(anchor_id, anchor_ctx) {
                return Ok(false);
            }

            let (ctx, forward) = (row.ctx, row.forward);
            let in_list = move |other: &RelationshipRow| {
                other.ctx == ctx
                    && other.forward == forward
                    && (if forward {
                        other.base_id == anchor_id
                    } else {
                        other.rel_id == anchor_id
                    })
            };
            dense_insert(
                &mut tables.relationships,
                &in_list,
                RelationshipRow {
                    base_id: row.base_id,
                    rel_id: row.rel_id,
                    ctx: row.ctx,
                    base_ctx: row.base_ctx,
                    rel_ctx: row.rel_ctx,
                    forward: row.forward,
                    value: row.value.clone(),
                    flags: row.flags,
                    pos: 0,
                },
                row.index,
            );
            Ok(true)
        })
    }

    async fn update_relationship(
        &mut self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        value: &Stored,
        old_value: Option<&Stored>,
        forward: bool,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.relationships.iter_mut() {
                if rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.rel_id == rel_id
                    && rec.row.ctx == ctx
                    && rec.row.forward == forward
                {
                    if let Some(old_value) = old_value {
                        if rec.row.value != *old_value {
                            return false;
                        }
                    }
                    rec.row.value = value.clone();
                    return true;
                }
            }
            false
        }))
    }

    async fn remove_relationship(
        &mut self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        forward: bool,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed = None;
            for rec in tables.relationships.iter_mut() {
                if rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.rel_id == rel_id
                    && rec.row.ctx == ctx
                    && rec.row.forward == forward
                {
                    removed = Some(rec.row.pos);
                    rec.tombstone();
                    break;
                }
            }
            match removed {
                Some(pos) => {
                    let anchor_id = if forward { base_id } else { rel_id };
                    let in_list = move |other: &RelationshipRow| {
                        other.ctx == ctx
                            && other.forward == forward
                            && (if forward {
                                other.base_id == anchor_id
                            } else {
                                other.rel_id == anchor_id
                            })
                    };
                    dense_remove(&mut tables.relationships, &in_list, pos);
                    true
                }
                None => false,
            }
        }))
    }

    async fn select_relationships(
        &mut self,
        id: i64,
        ctx: i32,
        forward: bool,
        limit: usize,
        start: usize,
        rel_id: Option<i64>,
    ) -> Result<Vec<RelationshipRow>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            let mut rows: Vec<RelationshipRow> = tables
                .relationships
                .iter()
                .filter(|rec| {
                    let row = &rec.row;
                    rec.live()
                        && row.ctx == ctx
                        && row.forward == forward
                        && (if forward { row.base_id } else { row.rel_id }) == id
                        && row.pos >= start
                        && rel_id
                            .map(|rel_id| {
                                (if forward { row.rel_id } else { row.base_id }) == rel_id
                            })
                            .unwrap_or(true)
                })
                .map(|rec| rec.row.clone())
                .collect();
            rows.sort_by_key(|row| row.pos);
            rows.truncate(limit);
            rows
        }))
    }

    async fn reorder_relationship(
        &mut self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        forward: bool,
        index: usize,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let anchor_id = if forward { base_id } else { rel_id };
            let in_list = move |row: &RelationshipRow| {
                row.ctx == ctx
                    && row.forward == forward
                    && (if forward {
                        row.base_id == anchor_id
                    } else {
                        row.rel_id == anchor_id
                    })
            };
            let select = move |row: &RelationshipRow| {
                row.base_id == base_id && row.rel_id == rel_id
            };
            dense_reorder(&mut tables.relationships, &in_list, &select, index)
        }))
    }

    async fn remove_relationships_for_bases(
        &mut self,
        ids: &[i64],
    ) -> Result<Vec<RelMirror>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed = vec![];
            for rec in tables.relationships.iter_mut() {
                let anchor = if rec.row.forward {
                    rec.row.base_id
                } else {
                    rec.row.rel_id
                };
                if rec.live() && ids.contains(&anchor) {
                    rec.tombstone();
                    removed.push(RelMirror {
                        base_id: rec.row.base_id,
                        ctx: rec.row.ctx,
                        forward: rec.row.forward,
                        rel_id: rec.row.rel_id,
                    });
                }
            }
            removed
        }))
    }

    async fn remove_relationships(&mut self, mirrors: &[RelMirror]) -> Result<(), Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.relationships.iter_mut() {
                if rec.live()
                    && mirrors.iter().any(|mirror| {
                        mirror.base_id == rec.row.base_id
                            && mirror.ctx == rec.row.ctx
                            && mirror.forward == rec.row.forward
                            && mirror.rel_id == rec.row.rel_id
                    })
                {
                    rec.tombstone();
                }
            }
        }))
    }

    async fn bulk_reorder_relationships(
        &mut self,
        anchors: &[(i64, i32)],
        forward: bool,
    ) -> Result<(), Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for (anchor_id, ctx) in anchors.iter().copied() {
                let in_list = move |row: &RelationshipRow| {
                    row.ctx == ctx
                        && row.forward == forward
                        && (if forward {
                            row.base_id == anchor_id
                        } else {
                            row.rel_id == anchor_id
                        })
                };
                redensify(&mut tables.relationships, &in_list);
            }
        }))
    }

    async fn set_flags(
        &mut self,
        target: FlagsTarget<'_>,
        add: u32,
        clear: u32,
    ) -> Result<Option<u32>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let flags: Option<&mut u32> = match target {
                FlagsTarget::Node { id, ctx } => tables
                    .nodes
                    .iter_mut()
                    .find(|rec| rec.live() && rec.row.id == id && rec.row.ctx == ctx)
                    .map(|rec| &mut rec.row.flags),
                FlagsTarget::Property { base_id, ctx } => tables
                    .properties
                    .iter_mut()
                    .find(|rec| rec.live() && rec.row.base_id == base_id && rec.row.ctx == ctx)
                    .map(|rec| &mut rec.row.flags),
                FlagsTarget::Alias {
                    base_id,
                    ctx,
                    value,
                } => tables
                    .aliases
                    .iter_mut()
                    .find(|rec| {
                        rec.live()
                            && rec.row.base_id == base_id
                            && rec.row.ctx == ctx
                            && rec.row.value == value
                    })
                    .map(|rec| &mut rec.row.flags),
                FlagsTarget::AliasLookup { digest, ctx } => tables
                    .alias_lookups
                    .iter_mut()
                    .find(|rec| rec.live() && rec.row.digest == digest && rec.row.ctx == ctx)
                    .map(|rec| &mut rec.row.flags),
                FlagsTarget::Relationship {
                    base_id,
                    rel_id,
                    ctx,
                    forward,
                } => tables
                    .relationships
                    .iter_mut()
                    .find(|rec| {
                        rec.live()
                            && rec.row.base_id == base_id
                            && rec.row.rel_id == rel_id
                            && rec.row.ctx == ctx
                            && rec.row.forward == forward
                    })
                    .map(|rec| &mut rec.row.flags),
                FlagsTarget::Name {
                    base_id,
                    ctx,
                    value,
                } => tables
                    .names
                    .iter_mut()
                    .find(|rec| {
                        rec.live()
                            && rec.row.base_id == base_id
                            && rec.row.ctx == ctx
                            && rec.row.value == value
                    })
                    .map(|rec| &mut rec.row.flags),
                FlagsTarget::PrefixLookup {
                    base_id,
                    ctx,
                    value,
                } => tables
                    .prefix_lookups
                    .iter_mut()
                    .find(|rec| {
                        rec.live()
                            && rec.row.base_id == base_id
                            && rec.row.ctx == ctx
                            && rec.row.value == value
                    })
                    .map(|rec| &mut rec.row.flags),
                FlagsTarget::PhoneticLookup {
                    base_id,
                    ctx,
                    code,
                    value,
                } => tables
                    .phonetic_lookups
                    .iter_mut()
                    .find(|rec| {
                        rec.live()
                            && rec.row.base_id == base_id
                            && rec.row.ctx == ctx
                            && rec.row.code == code
                            && rec.row.value == value
                    })
                    .map(|rec| &mut rec.row.flags),
            };

            flags.map(|flags| {
                *flags = (*flags | add) & !clear;
                *flags
            })
        }))
    }

    async fn insert_name(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
        flags: u32,
        index: Option<usize>,
    ) -> Result<bool, Error> {
        self.gate().await?;
        self.mutate(|tables| {
            if tables.names.iter().any(|rec| {
                rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.value == value
            }) {
                return Err(Error::UniqueViolation);
            }
            if !tables.node_live(base_id) {
                return Ok(false);
            }
            let in_list = move |row: &NameRow| row.base_id == base_id && row.ctx == ctx;
            dense_insert(
                &mut tables.names,
                &in_list,
                NameRow {
                    base_id,
                    ctx,
                    value: value.to_string(),
                    flags,
                    pos: 0,
                },
                index,
            );
            Ok(true)
        })
    }

    async fn remove_name(&mut self, base_id: i64, ctx: i32, value: &str) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed_pos = None;
            for rec in tables.names.iter_mut() {
                if rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.value == value
                {
                    removed_pos = Some(rec.row.pos);
                    rec.tombstone();
                    break;
                }
            }
            match removed_pos {
                Some(pos) => {
                    let in_list = move |row: &NameRow| row.base_id == base_id && row.ctx == ctx;
                    dense_remove(&mut tables.names, &in_list, pos);
                    true
                }
                None => false,
            }
        }))
    }

    async fn select_names(
        &mut self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
    ) -> Result<Vec<NameRow>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            let mut rows: Vec<NameRow> = tables
                .names
                .iter()
                .filter(|rec| {
                    rec.live()
                        && rec.row.base_id == base_id
                        && rec.row.ctx == ctx
                        && rec.row.pos >= start
                })
                .map(|rec| rec.row.clone())
                .collect();
            rows.sort_by_key(|row| row.pos);
            rows.truncate(limit);
            rows
        }))
    }

    async fn reorder_name(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: usize,
    ) -> Result<bool, Error> {
        self.gate().await?;
        let value = value.to_string();
        Ok(self.mutate(|tables| {
            let in_list = move |row: &NameRow| row.base_id == base_id && row.ctx == ctx;
            let select = move |row: &NameRow| row.value == value;
            dense_reorder(&mut tables.names, &in_list, &select, index)
        }))
    }

    async fn remove_names_for_bases(
        &mut self,
        ids: &[i64],
    ) -> Result<Vec<(i64, i32, String)>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed = vec![];
            for rec in tables.names.iter_mut() {
                if rec.live() && ids.contains(&rec.row.base_id) {
                    rec.tombstone();
                    removed.push((rec.row.base_id, rec.row.ctx, rec.row.value.clone()));
                }
            }
            removed
        }))
    }

    async fn insert_prefix_lookup(
        &mut self,
        value: &str,
        flags: u32,
        ctx: i32,
        base_id: i64,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            if tables.prefix_lookups.iter().any(|rec| {
                rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.value == value
            }) {
                return false;
            }
            tables.prefix_lookups.push(Rec::new(PrefixRec {
                base_id,
                ctx,
                value: value.to_string(),
                flags,
            }));
            true
        }))
    }

    async fn remove_prefix_lookup(
        &mut self,
        base_id: i64,
        ctx: i32,
        value: &str,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.prefix_lookups.iter_mut() {
                if rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.value == value
                {
                    rec.tombstone();
                    return true;
                }
            }
            false
        }))
    }

    async fn prefix_lookup_exists(
        &mut self,
        value: &str,
        ctx: i32,
        base_id: i64,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            tables.prefix_lookups.iter().any(|rec| {
                rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.value == value
            })
        }))
    }

    async fn search_prefixes(
        &mut self,
        prefix: &str,
        ctx: i32,
        limit: usize,
        start: &str,
    ) -> Result<Vec<NameHit>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            let mut hits: Vec<NameHit> = tables
                .prefix_lookups
                .iter()
                .filter(|rec| {
                    rec.live()
                        && rec.row.ctx == ctx
                        && rec.row.value.starts_with(prefix)
                        && rec.row.value.as_str() > start
                })
                .map(|rec| NameHit {
                    base_id: rec.row.base_id,
                    ctx: rec.row.ctx,
                    value: rec.row.value.clone(),
                    flags: rec.row.flags,
                })
                .collect();
            hits.sort_by(|a, b| a.value.cmp(&b.value));
            hits.truncate(limit);
            hits
        }))
    }

    async fn remove_prefix_lookups(
        &mut self,
        triples: &[(i64, i32, String)],
    ) -> Result<Vec<(i64, i32, String)>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed = vec![];
            for rec in tables.prefix_lookups.iter_mut() {
                if rec.live()
                    && triples.iter().any(|(base_id, ctx, value)| {
                        *base_id == rec.row.base_id
                            && *ctx == rec.row.ctx
                            && *value == rec.row.value
                    })
                {
                    rec.tombstone();
                    removed.push((rec.row.base_id, rec.row.ctx, rec.row.value.clone()));
                }
            }
            removed
        }))
    }

    async fn insert_phonetic_lookup(
        &mut self,
        value: &str,
        code: &str,
        flags: u32,
        ctx: i32,
        base_id: i64,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            if tables.phonetic_lookups.iter().any(|rec| {
                rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.code == code
                    && rec.row.value == value
            }) {
                return false;
            }
            tables.phonetic_lookups.push(Rec::new(PhoneticRec {
                base_id,
                ctx,
                code: code.to_string(),
                value: value.to_string(),
                flags,
            }));
            true
        }))
    }

    async fn remove_phonetic_lookup(
        &mut self,
        base_id: i64,
        ctx: i32,
        code: &str,
        value: &str,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            for rec in tables.phonetic_lookups.iter_mut() {
                if rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.code == code
                    && rec.row.value == value
                {
                    rec.tombstone();
                    return true;
                }
            }
            false
        }))
    }

    async fn phonetic_lookup_exists(
        &mut self,
        code: &str,
        ctx: i32,
        value: &str,
        base_id: i64,
    ) -> Result<bool, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            tables.phonetic_lookups.iter().any(|rec| {
                rec.live()
                    && rec.row.base_id == base_id
                    && rec.row.ctx == ctx
                    && rec.row.code == code
                    && rec.row.value == value
            })
        }))
    }

    async fn search_phonetics(
        &mut self,
        code: &str,
        ctx: i32,
        limit: usize,
        start: i64,
    ) -> Result<Vec<PhoneticHit>, Error> {
        self.gate().await?;
        Ok(self.with_tables(|tables| {
            let mut hits: Vec<PhoneticHit> = tables
                .phonetic_lookups
                .iter()
                .filter(|rec| {
                    rec.live()
                        && rec.row.ctx == ctx
                        && rec.row.code == code
                        && rec.row.base_id > start
                })
                .map(|rec| PhoneticHit {
                    base_id: rec.row.base_id,
                    ctx: rec.row.ctx,
                    value: rec.row.value.clone(),
                    flags: rec.row.flags,
                    code: rec.row.code.clone(),
                })
                .collect();
            hits.sort_by_key(|hit| hit.base_id);
            hits.truncate(limit);
            hits
        }))
    }

    async fn remove_phonetic_lookups(
        &mut self,
        triples: &[(i64, i32, String)],
    ) -> Result<Vec<(i64, i32, String)>, Error> {
        self.gate().await?;
        Ok(self.mutate(|tables| {
            let mut removed = vec![];
            for rec in tables.phonetic_lookups.iter_mut() {
                if rec.live()
                    && triples.iter().any(|(base_id, ctx, value)| {
                        *base_id == rec.row.base_id
                            && *ctx == rec.row.ctx
                            && *value == rec.row.value
                    })
                {
                    rec.tombstone();
                    removed.push((rec.row.base_id, rec.row.ctx, rec.row.value.clone()));
                }
            }
            removed
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_tpc_rollback_restores() {
        let backend = MemoryBackend::new(1, 8);
        let mut conn = backend.connect(0).await.unwrap();

        let node = conn.insert_node(1, &Stored::Null, 0).await.unwrap();
        conn.commit().await.unwrap();

        conn.tpc_begin("xid-1").await.unwrap();
        conn.insert_alias(node.id, 5, "hello", None, 0).await.unwrap();
        conn.tpc_prepare().await.unwrap();
        assert_eq!(backend.prepared_transactions(), 1);
        assert_eq!(backend.live_counts(0).aliases, 1);

        let mut other = backend.connect(0).await.unwrap();
        other.tpc_rollback("xid-1").await.unwrap();
        assert_eq!(backend.prepared_transactions(), 0);
        assert_eq!(backend.live_counts(0).aliases, 0);
    }

    #[tokio::test]
    async fn test_dense_positions() {
        let backend = MemoryBackend::new(1, 8);
        let mut conn = backend.connect(0).await.unwrap();
        let node = conn.insert_node(1, &Stored::Null, 0).await.unwrap();

        for name in ["a", "b", "c"] {
            conn.insert_name(node.id, 3, name, 0, None).await.unwrap();
        }
        // move "c" to the front
        assert!(conn.reorder_name(node.id, 3, "c", 0).await.unwrap());
        let names = conn.select_names(node.id, 3, 100, 0).await.unwrap();
        let order: Vec<&str> = names.iter().map(|row| row.value.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);

        assert!(conn.remove_name(node.id, 3, "a").await.unwrap());
        let names = conn.select_names(node.id, 3, 100, 0).await.unwrap();
        let positions: Vec<usize> = names.iter().map(|row| row.pos).collect();
        assert_eq!(positions, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_cancellation_kills_statement() {
        let backend = MemoryBackend::new(1, 8);
        backend.set_latency(0, Some(Duration::from_secs(5)));
        let mut conn = backend.connect(0).await.unwrap();

        let token = conn.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let err = conn.select_node(1, 1).await.unwrap_err();
        assert!(matches!(err, Error::QueryCanceled));
    }
}
