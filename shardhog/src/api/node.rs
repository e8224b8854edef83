//! Node operations.

use std::collections::HashSet;
use std::time::Duration;

use super::{Edge, Node, Store};
use crate::backend::FlagsTarget;
use crate::context::TableKind;
use crate::plans;
use crate::storage::{storage_wrap, Value};
use crate::timer::Timer;
use crate::Error;

impl Store {
    /// Create a node: rootless (placed by the insert plan), or under
    /// a parent with the parent→child edge in the same transaction.
    pub async fn create_node(
        &self,
        base_id: Option<i64>,
        ctx: i32,
        value: &Value,
        index: Option<usize>,
        flags: &[u16],
        timeout: Option<Duration>,
    ) -> Result<Node, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Node)?;
        let flags = self.registry().flags_to_int(ctx, flags)?;
        let stored = storage_wrap(self.registry(), ctx, value)?;

        let row = plans::node::create(
            self.pool(),
            self.registry(),
            base_id,
            ctx,
            &stored,
            index,
            flags,
            timeout,
        )
        .await?;

        self.node_from_row(row)
    }

    pub async fn get_node(
        &self,
        id: i64,
        ctx: i32,
        timeout: Option<Duration>,
    ) -> Result<Option<Node>, Error> {
        self.registry().expect(ctx, TableKind::Node)?;
        let mut conn = self.pool().get_by_id(id, timeout).await?;
        match conn.select_node(id, ctx).await? {
            Some(row) => Ok(Some(self.node_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Update a node's value, optionally only when the current value
    /// matches `old_value`.
    pub async fn update_node(
        &self,
        id: i64,
        ctx: i32,
        value: &Value,
        old_value: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Node)?;
        let stored = storage_wrap(self.registry(), ctx, value)?;
        let old_stored = match old_value {
            Some(old_value) => Some(storage_wrap(self.registry(), ctx, old_value)?),
            None => None,
        };

        let mut conn = self.pool().get_by_id(id, timeout).await?;
        let updated = conn
            .update_node(id, ctx, &stored, old_stored.as_ref())
            .await?;
        conn.commit().await?;
        Ok(updated)
    }

    /// List a node's children as edges, in position order. Returns
    /// the edges and the position to continue from.
    pub async fn list_children(
        &self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Edge>, usize), Error> {
        self.registry().expect(ctx, TableKind::Node)?;
        let mut conn = self.pool().get_by_id(base_id, timeout).await?;
        let rows = conn.select_edges(base_id, ctx, limit, start).await?;
        let next = rows.last().map(|row| row.pos + 1).unwrap_or(start);
        Ok((rows.into_iter().map(Edge::from).collect(), next))
    }

    pub async fn set_node_flags(
        &self,
        id: i64,
        ctx: i32,
        add: &[u16],
        clear: &[u16],
        timeout: Option<Duration>,
    ) -> Result<Option<HashSet<u16>>, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Node)?;
        let add = self.registry().flags_to_int(ctx, add)?;
        let clear = self.registry().flags_to_int(ctx, clear)?;

        let mut conn = self.pool().get_by_id(id, timeout).await?;
        let result = conn
            .set_flags(FlagsTarget::Node { id, ctx }, add, clear)
            .await?;
        conn.commit().await?;
        match result {
            Some(bitmap) => Ok(Some(self.decode_flags(ctx, bitmap)?)),
            None => Ok(None),
        }
    }

    /// Move a child to `index` within its parent's edge list.
    pub async fn shift_node(
        &self,
        id: i64,
        ctx: i32,
        base_id: i64,
        index: usize,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Node)?;
        let mut conn = self.pool().get_by_id(base_id, timeout).await?;
        let shifted = conn.reorder_edge(base_id, ctx, id, index).await?;
        conn.commit().await?;
        Ok(shifted)
    }

    /// Re-parent a node from `base_id` to `new_base_id`.
    pub async fn move_node(
        &self,
        id: i64,
        ctx: i32,
        base_id: i64,
        new_base_id: i64,
        index: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Node)?;

        let timer = Timer::start(timeout);
        let result =
            plans::node::move_node(self.pool(), id, ctx, base_id, new_base_id, index, &timer)
                .await;
        timer.finish(result)
    }

    /// Remove a node and everything reachable from it.
    pub async fn remove_node(
        &self,
        id: i64,
        ctx: i32,
        base_id: i64,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Node)?;

        let timer = Timer::start(timeout);
        let result =
            plans::estate::remove_node(self.pool(), self.registry(), id, ctx, base_id, &timer)
                .await;
        timer.finish(result)
    }
}
