//! Alias plans.
//!
//! An alias row lives on its owner's shard; the globally-unique
//! lookup row keyed by HMAC digest lives on a shard of its own. The
//! lookup side is always the two-phase primary: uniqueness is decided
//! there before the owner's row is touched.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::no_object;
use crate::backend::{AliasInsert, AliasLookupRow, FlagsTarget};
use crate::context::Registry;
use crate::pool::Pool;
use crate::timer::Timer;
use crate::two_pc::TwoPc;
use crate::Error;

fn digest_b64(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

/// Find the owner of an alias digest, probing the read list in order.
pub async fn lookup_alias(
    pool: &Pool,
    digest: &[u8],
    ctx: i32,
    timer: &Timer,
) -> Result<Option<AliasLookupRow>, Error> {
    for shard in pool.map().shards_for_lookup_hash(digest) {
        let mut conn = pool.get_by_shard(shard, None).await?;
        timer.bind(&conn);
        let found = conn.select_alias_lookup(digest, ctx).await;
        timer.unbind();

        if let Some(row) = found? {
            return Ok(Some(row));
        }
    }

    Ok(None)
}

/// Point an alias at `base_id`. Returns `false` when the same owner
/// already holds it; fails with `AliasInUse` when a different owner
/// does.
pub async fn set_alias(
    pool: &Pool,
    registry: &Registry,
    base_id: i64,
    ctx: i32,
    alias: &str,
    flags: u32,
    index: Option<usize>,
    timer: &Timer,
) -> Result<bool, Error> {
    let digest = pool.alias_digest(alias);
    let insert_shard = pool.map().shard_for_alias_write(&digest);

    // Check for a pre-existing owner everywhere but the insert shard.
    let mut owner = None;
    for shard in pool.map().shards_for_lookup_hash(&digest) {
        if shard == insert_shard {
            continue;
        }

        let mut conn = pool.get_by_shard(shard, None).await?;
        timer.bind(&conn);
        let found = conn.select_alias_lookup(&digest, ctx).await;
        timer.unbind();

        owner = found?;
        if owner.is_some() {
            break;
        }
    }

    if let Some(owner) = owner {
        if owner.base_id == base_id {
            return Ok(false);
        }
        return Err(Error::AliasInUse {
            alias: alias.to_string(),
            ctx,
        });
    }

    let mut tpc = TwoPc::new(
        pool,
        insert_shard,
        "set_alias",
        &[base_id.to_string(), ctx.to_string(), digest_b64(&digest)],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let inserted = conn.insert_alias_lookup(&digest, ctx, base_id, flags).await;
    timer.unbind();

    match inserted {
        Ok(AliasInsert::Inserted) => {
            tpc.exit(conn, true).await?;
        }
        Ok(AliasInsert::Exists { owner }) => {
            tpc.exit(conn, false).await?;
            if owner == base_id {
                return Ok(false);
            }
            return Err(Error::AliasInUse {
                alias: alias.to_string(),
                ctx,
            });
        }
        Err(err) if matches!(err, crate::backend::Error::UniqueViolation) => {
            // Lost a race with another writer; see who won.
            let winner = conn.select_alias_lookup(&digest, ctx).await?;
            tpc.exit(conn, false).await?;
            match winner {
                Some(row) if row.base_id == base_id => return Ok(false),
                _ => {
                    return Err(Error::AliasInUse {
                        alias: alias.to_string(),
                        ctx,
                    })
                }
            }
        }
        Err(err) => {
            tpc.exit(conn, false).await.ok();
            return Err(err.into());
        }
    }

    let outcome: Result<bool, Error> = async {
        let mut conn = pool.get_by_id(base_id, None).await?;
        timer.bind(&conn);
        let inserted = conn.insert_alias(base_id, ctx, alias, index, flags).await;
        timer.unbind();

        if !inserted? {
            conn.rollback().await?;
            tpc.fail();
            let base_ctx = registry.base_ctx(ctx).unwrap_or(ctx);
            return Err(no_object(registry, base_ctx, base_id));
        }
        conn.commit().await?;
        Ok(true)
    }
    .await;

    tpc.elsewhere(outcome).await
}

/// Locate the lookup shard holding this owner's digest row.
async fn find_lookup_shard(
    pool: &Pool,
    digest: &[u8],
    ctx: i32,
    base_id: i64,
    timer: &Timer,
) -> Result<Option<usize>, Error> {
    for shard in pool.map().shards_for_lookup_hash(digest) {
        let mut conn = pool.get_by_shard(shard, None).await?;
        timer.bind(&conn);
        let found = conn.select_alias_lookup(digest, ctx).await;
        timer.unbind();

        if let Some(owner) = found? {
            if owner.base_id != base_id {
                return Ok(None);
            }
            return Ok(Some(shard));
        }
    }

    Ok(None)
}

/// Flag mutation mirrored between the lookup row and the alias row.
/// Returns the new bitmap, or `None` when the alias isn't there (or
/// isn't ours, or the two sides disagreed).
pub async fn set_alias_flags(
    pool: &Pool,
    base_id: i64,
    ctx: i32,
    alias: &str,
    add: u32,
    clear: u32,
    timer: &Timer,
) -> Result<Option<u32>, Error> {
    let digest = pool.alias_digest(alias);

    let lookup_shard = match find_lookup_shard(pool, &digest, ctx, base_id, timer).await? {
        Some(shard) => shard,
        None => return Ok(None),
    };

    let mut tpc = TwoPc::new(
        pool,
        lookup_shard,
        "set_alias_flags",
        &[
            base_id.to_string(),
            ctx.to_string(),
            digest_b64(&digest),
            add.to_string(),
            clear.to_string(),
        ],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let result = conn
        .set_flags(
            FlagsTarget::AliasLookup {
                digest: &digest,
                ctx,
            },
            add,
            clear,
        )
        .await;
    timer.unbind();

    let result_flags = match result {
        Ok(Some(flags)) => {
            tpc.exit(conn, true).await?;
            flags
        }
        Ok(None) => {
            tpc.exit(conn, false).await?;
            return Ok(None);
        }
        Err(err) => {
            tpc.exit(conn, false).await.ok();
            return Err(err.into());
        }
    };

    let outcome: Result<Option<u32>, Error> = async {
        let mut conn = pool.get_by_id(base_id, None).await?;
        timer.bind(&conn);
        let result = conn
            .set_flags(
                FlagsTarget::Alias {
                    base_id,
                    ctx,
                    value: alias,
                },
                add,
                clear,
            )
            .await;
        timer.unbind();

        match result? {
            Some(flags) if flags == result_flags => {
                conn.commit().await?;
                Ok(Some(result_flags))
            }
            _ => {
                conn.rollback().await?;
                tpc.fail();
                Ok(None)
            }
        }
    }
    .await;

    tpc.elsewhere(outcome).await
}

/// Remove an alias and its lookup row. Returns `false` when there was
/// nothing (owned by us) to remove.
pub async fn remove_alias(
    pool: &Pool,
    base_id: i64,
    ctx: i32,
    alias: &str,
    timer: &Timer,
) -> Result<bool, Error> {
    let digest = pool.alias_digest(alias);

    let lookup_shard = match find_lookup_shard(pool, &digest, ctx, base_id, timer).await? {
        Some(shard) => shard,
        None => return Ok(false),
    };

    let mut tpc = TwoPc::new(
        pool,
        lookup_shard,
        "remove_alias",
        &[base_id.to_string(), ctx.to_string(), digest_b64(&digest)],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let removed = conn.remove_alias_lookup(&digest, ctx, base_id).await;
    timer.unbind();

    match removed {
        Ok(true) => tpc.exit(conn, true).await?,
        Ok(false) => {
            tpc.exit(conn, false).await?;
            return Ok(false);
        }
        Err(err) => {
            tpc.exit(conn, false).await.ok();
            return Err(err.into());
        }
    }

    let outcome: Result<bool, Error> = async {
        let mut conn = pool.get_by_id(base_id, None).await?;
        timer.bind(&conn);
        let removed = conn.remove_alias(base_id, ctx, alias).await;
        timer.unbind();

        if !removed? {
            conn.rollback().await?;
            tpc.fail();
            return Ok(false);
        }
        conn.commit().await?;
        Ok(true)
    }
    .await;

    tpc.elsewhere(outcome).await
}
