//! Relationship operations.

use std::collections::HashSet;
use std::time::Duration;

use super::{Relationship, Store};
use crate::context::{ContextMeta, TableKind};
use crate::plans;
use crate::plans::relationship::CreatePair;
use crate::storage::{storage_wrap, Value};
use crate::timer::Timer;
use crate::Error;

impl Store {
    /// Create a relationship between two objects. For union contexts
    /// the concrete endpoint contexts must be supplied; they are
    /// recorded on the rows. Returns `false` when the pair already
    /// exists.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_relationship(
        &self,
        ctx: i32,
        base_id: i64,
        rel_id: i64,
        base_ctx: Option<i32>,
        rel_ctx: Option<i32>,
        value: &Value,
        forward_index: Option<usize>,
        reverse_index: Option<usize>,
        flags: &[u16],
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;

        let (base_ctx, rel_ctx) =
            match self.registry().expect(ctx, TableKind::Relationship)? {
                ContextMeta::Relationship {
                    base_ctx: base_endpoint,
                    rel_ctx: rel_endpoint,
                    ..
                } => (
                    base_endpoint.resolve(ctx, base_ctx)?,
                    rel_endpoint.resolve(ctx, rel_ctx)?,
                ),
                _ => return Err(Error::BadContext(ctx)),
            };

        let flags = self.registry().flags_to_int(ctx, flags)?;
        let stored = storage_wrap(self.registry(), ctx, value)?;

        let timer = Timer::start(timeout);
        let result = plans::relationship::create_pair(
            self.pool(),
            self.registry(),
            CreatePair {
                base_id,
                rel_id,
                ctx,
                base_ctx,
                rel_ctx,
                value: stored,
                forward_index,
                reverse_index,
                flags,
            },
            &timer,
        )
        .await;
        timer.finish(result)
    }

    /// List the relationships anchored at `id`, in position order.
    /// For undirected contexts both directions read the forward
    /// orientation. Returns the rows and the position to continue
    /// from.
    pub async fn list_relationships(
        &self,
        id: i64,
        ctx: i32,
        forward: bool,
        limit: usize,
        start: usize,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Relationship>, usize), Error> {
        let directed = self.registry().directed(ctx)?;
        let orientation = if directed { forward } else { true };

        let mut conn = self.pool().get_by_id(id, timeout).await?;
        let rows = conn
            .select_relationships(id, ctx, orientation, limit, start, None)
            .await?;
        let next = rows.last().map(|row| row.pos + 1).unwrap_or(start);
        let rels = rows
            .into_iter()
            .map(|row| self.relationship_from_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rels, next))
    }

    pub async fn get_relationship(
        &self,
        ctx: i32,
        base_id: i64,
        rel_id: i64,
        timeout: Option<Duration>,
    ) -> Result<Option<Relationship>, Error> {
        self.registry().expect(ctx, TableKind::Relationship)?;
        let mut conn = self.pool().get_by_id(base_id, timeout).await?;
        let rows = conn
            .select_relationships(base_id, ctx, true, 1, 0, Some(rel_id))
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(self.relationship_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Update the value on both rows, optionally compare-and-swap
    /// against `old_value`. Returns `false` when either side didn't
    /// match.
    pub async fn update_relationship(
        &self,
        ctx: i32,
        base_id: i64,
        rel_id: i64,
        value: &Value,
        old_value: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Relationship)?;
        let stored = storage_wrap(self.registry(), ctx, value)?;
        let old_stored = match old_value {
            Some(old_value) => Some(storage_wrap(self.registry(), ctx, old_value)?),
            None => None,
        };

        let timer = Timer::start(timeout);
        let result = plans::relationship::update(
            self.pool(),
            self.registry(),
            base_id,
            rel_id,
            ctx,
            &stored,
            old_stored.as_ref(),
            &timer,
        )
        .await;
        Ok(timer.finish(result)?.is_some())
    }

    pub async fn set_relationship_flags(
        &self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        add: &[u16],
        clear: &[u16],
        timeout: Option<Duration>,
    ) -> Result<Option<HashSet<u16>>, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Relationship)?;
        let add = self.registry().flags_to_int(ctx, add)?;
        let clear = self.registry().flags_to_int(ctx, clear)?;

        let timer = Timer::start(timeout);
        let result = plans::relationship::set_flags(
            self.pool(),
            self.registry(),
            base_id,
            rel_id,
            ctx,
            add,
            clear,
            &timer,
        )
        .await;
        match timer.finish(result)? {
            Some(bitmap) => Ok(Some(self.decode_flags(ctx, bitmap)?)),
            None => Ok(None),
        }
    }

    /// Move a relationship to `index` in one of its two ordered
    /// lists: `base_id`'s forward list or `rel_id`'s reverse list.
    #[allow(clippy::too_many_arguments)]
    pub async fn shift_relationship(
        &self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        forward: bool,
        index: usize,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Relationship)?;

        let anchor_id = if forward { base_id } else { rel_id };
        let mut conn = self.pool().get_by_id(anchor_id, timeout).await?;
        let shifted = conn
            .reorder_relationship(base_id, rel_id, ctx, forward, index)
            .await?;
        conn.commit().await?;
        Ok(shifted)
    }

    /// Remove both rows of a relationship.
    pub async fn remove_relationship(
        &self,
        base_id: i64,
        rel_id: i64,
        ctx: i32,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Relationship)?;

        let timer = Timer::start(timeout);
        let result =
            plans::relationship::remove_pair(self.pool(), self.registry(), base_id, rel_id, ctx, &timer)
                .await;
        timer.finish(result)
    }
}
