//! Name operations.

use std::collections::HashSet;
use std::time::Duration;

use super::{Name, SearchCursor, Store};
use crate::context::TableKind;
use crate::plans;
use crate::timer::Timer;
use crate::Error;

impl Store {
    /// Create a name and its search lookup row(s). Returns `false`
    /// when the name already exists.
    pub async fn create_name(
        &self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: Option<usize>,
        flags: &[u16],
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Name)?;
        let flags = self.registry().flags_to_int(ctx, flags)?;

        let timer = Timer::start(timeout);
        let result = plans::name::create(
            self.pool(),
            self.registry(),
            self.dmetaphone,
            base_id,
            ctx,
            value,
            flags,
            index,
            &timer,
        )
        .await;
        timer.finish(result)
    }

    /// Search for names matching `value` under the context's search
    /// class. Returns the hits and a continuation cursor.
    pub async fn search_names(
        &self,
        value: &str,
        ctx: i32,
        limit: usize,
        start: Option<SearchCursor>,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Name>, SearchCursor), Error> {
        self.registry().expect(ctx, TableKind::Name)?;

        let timer = Timer::start(timeout);
        let result = plans::name::search(
            self.pool(),
            self.registry(),
            self.dmetaphone,
            value,
            ctx,
            limit,
            start,
            &timer,
        )
        .await;
        let (hits, cursor) = timer.finish(result)?;
        let names = hits
            .into_iter()
            .map(|hit| self.name_from_hit(hit))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((names, cursor))
    }

    /// List an object's names in position order. Returns the names
    /// and the position to continue from.
    pub async fn list_names(
        &self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Name>, usize), Error> {
        self.registry().expect(ctx, TableKind::Name)?;
        let mut conn = self.pool().get_by_id(base_id, timeout).await?;
        let rows = conn.select_names(base_id, ctx, limit, start).await?;
        let next = rows.last().map(|row| row.pos + 1).unwrap_or(start);
        let names = rows
            .into_iter()
            .map(|row| self.name_from_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((names, next))
    }

    pub async fn set_name_flags(
        &self,
        base_id: i64,
        ctx: i32,
        value: &str,
        add: &[u16],
        clear: &[u16],
        timeout: Option<Duration>,
    ) -> Result<Option<HashSet<u16>>, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Name)?;
        let add = self.registry().flags_to_int(ctx, add)?;
        let clear = self.registry().flags_to_int(ctx, clear)?;

        let timer = Timer::start(timeout);
        let result = plans::name::set_flags(
            self.pool(),
            self.registry(),
            self.dmetaphone,
            base_id,
            ctx,
            value,
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

    /// Move a name to `index` within its owner's list.
    pub async fn shift_name(
        &self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: usize,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Name)?;

        let timer = Timer::start(timeout);
        let result =
            plans::name::reorder(self.pool(), base_id, ctx, value, index, &timer).await;
        timer.finish(result)
    }

    /// Remove a name and its lookup row(s).
    pub async fn remove_name(
        &self,
        base_id: i64,
        ctx: i32,
        value: &str,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Name)?;

        let timer = Timer::start(timeout);
        let result = plans::name::remove(
            self.pool(),
            self.registry(),
            self.dmetaphone,
            base_id,
            ctx,
            value,
            &timer,
        )
        .await;
        timer.finish(result)
    }
}
