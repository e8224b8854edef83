//! Property upsert.

use std::time::Duration;

use super::no_object;
use crate::context::Registry;
use crate::pool::Pool;
use crate::storage::Stored;
use crate::Error;

/// Set a property on its base object's shard. Returns `true` when the
/// row was created, `false` when an existing row was updated in place
/// (the insert lost to a unique violation and retried as an update).
pub async fn set_property(
    pool: &Pool,
    registry: &Registry,
    base_id: i64,
    ctx: i32,
    value: &Stored,
    flags: u32,
    timeout: Option<Duration>,
) -> Result<bool, Error> {
    let base_ctx = registry.base_ctx(ctx).unwrap_or(ctx);
    let mut conn = pool.get_by_id(base_id, timeout).await?;

    match conn.upsert_property(base_id, ctx, value, flags).await {
        Ok(true) => {
            conn.commit().await?;
            Ok(true)
        }
        Ok(false) => {
            conn.rollback().await?;
            Err(no_object(registry, base_ctx, base_id))
        }
        Err(err) if matches!(err, crate::backend::Error::UniqueViolation) => {
            // State diverged under us; the row exists, so update it.
            conn.rollback().await?;
            if conn.update_property(base_id, ctx, value).await? {
                conn.commit().await?;
                Ok(false)
            } else {
                conn.rollback().await?;
                Err(no_object(registry, base_ctx, base_id))
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Remove a property row.
pub async fn remove_property(
    pool: &Pool,
    base_id: i64,
    ctx: i32,
    timeout: Option<Duration>,
) -> Result<bool, Error> {
    let mut conn = pool.get_by_id(base_id, timeout).await?;
    let removed = conn.remove_property(base_id, ctx).await?;
    if removed {
        conn.commit().await?;
    } else {
        conn.rollback().await?;
    }
    Ok(removed)
}
