//! Property operations. Properties live with their base object, so
//! everything here is single-shard.

use std::collections::HashSet;
use std::time::Duration;

use super::{Property, Store};
use crate::backend::FlagsTarget;
use crate::context::TableKind;
use crate::plans;
use crate::storage::{storage_wrap, Value};
use crate::Error;

impl Store {
    /// Set a property. Returns `true` when the row was created,
    /// `false` when an existing row was updated.
    pub async fn set_property(
        &self,
        base_id: i64,
        ctx: i32,
        value: &Value,
        flags: &[u16],
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Property)?;
        let flags = self.registry().flags_to_int(ctx, flags)?;
        let stored = storage_wrap(self.registry(), ctx, value)?;

        plans::property::set_property(
            self.pool(),
            self.registry(),
            base_id,
            ctx,
            &stored,
            flags,
            timeout,
        )
        .await
    }

    pub async fn get_property(
        &self,
        base_id: i64,
        ctx: i32,
        timeout: Option<Duration>,
    ) -> Result<Option<Property>, Error> {
        self.registry().expect(ctx, TableKind::Property)?;
        let mut conn = self.pool().get_by_id(base_id, timeout).await?;
        match conn.select_property(base_id, ctx).await? {
            Some(row) => Ok(Some(self.property_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn set_property_flags(
        &self,
        base_id: i64,
        ctx: i32,
        add: &[u16],
        clear: &[u16],
        timeout: Option<Duration>,
    ) -> Result<Option<HashSet<u16>>, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Property)?;
        let add = self.registry().flags_to_int(ctx, add)?;
        let clear = self.registry().flags_to_int(ctx, clear)?;

        let mut conn = self.pool().get_by_id(base_id, timeout).await?;
        let result = conn
            .set_flags(FlagsTarget::Property { base_id, ctx }, add, clear)
            .await?;
        conn.commit().await?;
        match result {
            Some(bitmap) => Ok(Some(self.decode_flags(ctx, bitmap)?)),
            None => Ok(None),
        }
    }

    pub async fn remove_property(
        &self,
        base_id: i64,
        ctx: i32,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        self.writable()?;
        self.registry().expect(ctx, TableKind::Property)?;
        plans::property::remove_property(self.pool(), base_id, ctx, timeout).await
    }
}
