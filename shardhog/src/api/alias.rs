//! Alias operations.

use std::collections::HashSet;
use std::time::Duration;

use super::{Alias, Store};
use crate::context::TableKind;
use crate::plans;
use crate::timer::Timer;
use crate::Error;

impl Store {
    /// Point `value` at `base_id`. Returns `true` if the alias was
    /// newly created, `false` if this owner already held it.
    pub async fn set_alias(
        &self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: Option<usize>,
        flags: &[u16],
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Alias)?;
        let flags = self.registry().flags_to_int(ctx, flags)?;

        let timer = Timer::start(timeout);
        let result = plans::alias::set_alias(
            self.pool(),
            self.registry(),
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

    /// List an object's aliases in position order. Returns the
    /// aliases and the position to continue from.
    pub async fn list_aliases(
        &self,
        base_id: i64,
        ctx: i32,
        limit: usize,
        start: usize,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Alias>, usize), Error> {
        self.registry().expect(ctx, TableKind::Alias)?;
        let mut conn = self.pool().get_by_id(base_id, timeout).await?;
        let rows = conn.select_aliases(base_id, ctx, limit, start).await?;
        let next = rows.last().map(|row| row.pos + 1).unwrap_or(start);
        let aliases = rows
            .into_iter()
            .map(|row| self.alias_from_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((aliases, next))
    }

    /// Find the owner of an alias value, probing the digest's read
    /// list in order.
    pub async fn lookup_alias(
        &self,
        value: &str,
        ctx: i32,
        timeout: Option<Duration>,
    ) -> Result<Option<Alias>, Error> {
        self.registry().expect(ctx, TableKind::Alias)?;
        let digest = self.pool().alias_digest(value);

        let timer = Timer::start(timeout);
        let result = plans::alias::lookup_alias(self.pool(), &digest, ctx, &timer).await;
        match timer.finish(result)? {
            Some(row) => Ok(Some(Alias {
                base_id: row.base_id,
                ctx,
                value: value.to_string(),
                flags: self.decode_flags(ctx, row.flags)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn set_alias_flags(
        &self,
        base_id: i64,
        ctx: i32,
        value: &str,
        add: &[u16],
        clear: &[u16],
        timeout: Option<Duration>,
    ) -> Result<Option<HashSet<u16>>, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Alias)?;
        let add = self.registry().flags_to_int(ctx, add)?;
        let clear = self.registry().flags_to_int(ctx, clear)?;

        let timer = Timer::start(timeout);
        let result =
            plans::alias::set_alias_flags(self.pool(), base_id, ctx, value, add, clear, &timer)
                .await;
        match timer.finish(result)? {
            Some(bitmap) => Ok(Some(self.decode_flags(ctx, bitmap)?)),
            None => Ok(None),
        }
    }

    /// Move an alias to `index` within its owner's list.
    pub async fn shift_alias(
        &self,
        base_id: i64,
        ctx: i32,
        value: &str,
        index: usize,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Alias)?;
        let mut conn = self.pool().get_by_id(base_id, timeout).await?;
        let shifted = conn.reorder_alias(base_id, ctx, value, index).await?;
        conn.commit().await?;
        Ok(shifted)
    }

    /// Remove an alias and its lookup row.
    pub async fn remove_alias(
        &self,
        base_id: i64,
        ctx: i32,
        value: &str,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Alias)?;

        let timer = Timer::start(timeout);
        let result = plans::alias::remove_alias(self.pool(), base_id, ctx, value, &timer).await;
        timer.finish(result)
    }
}
