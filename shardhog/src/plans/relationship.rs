//! Relationship plans.
//!
//! A relationship is two rows: the forward row on the base object's
//! shard and a mirror on the related object's shard. Directed
//! contexts mirror with a reverse row; undirected contexts store the
//! mirror as another forward row with the ids swapped.

use super::no_object;
use crate::backend::{FlagsTarget, RelationshipInsert};
use crate::context::Registry;
use crate::pool::Pool;
use crate::storage::Stored;
use crate::timer::Timer;
use crate::two_pc::TwoPc;
use crate::Error;

/// Arguments shared by the pair-creation plan.
#[derive(Debug, Clone)]
pub struct CreatePair {
    pub base_id: i64,
    pub rel_id: i64,
    pub ctx: i32,
    pub base_ctx: i32,
    pub rel_ctx: i32,
    pub value: Stored,
    pub forward_index: Option<usize>,
    pub reverse_index: Option<usize>,
    pub flags: u32,
}

/// The mirror row for a forward relationship, shaped by directedness.
fn mirror_insert(args: &CreatePair, directed: bool) -> RelationshipInsert {
    if directed {
        RelationshipInsert {
            base_id: args.base_id,
            rel_id: args.rel_id,
            ctx: args.ctx,
            base_ctx: args.base_ctx,
            rel_ctx: args.rel_ctx,
            forward: false,
            value: args.value.clone(),
            index: args.reverse_index,
            flags: args.flags,
        }
    } else {
        RelationshipInsert {
            base_id: args.rel_id,
            rel_id: args.base_id,
            ctx: args.ctx,
            base_ctx: args.rel_ctx,
            rel_ctx: args.base_ctx,
            forward: true,
            value: args.value.clone(),
            index: args.reverse_index,
            flags: args.flags,
        }
    }
}

/// Create both rows of a relationship. Returns `false` when the pair
/// already exists.
pub async fn create_pair(
    pool: &Pool,
    registry: &Registry,
    args: CreatePair,
    timer: &Timer,
) -> Result<bool, Error> {
    let directed = registry.directed(args.ctx)?;

    let mut tpc = TwoPc::new(
        pool,
        pool.map().shard_by_id(args.base_id),
        "create_relationship_pair",
        &[
            args.base_id.to_string(),
            args.rel_id.to_string(),
            args.ctx.to_string(),
        ],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let inserted = conn
        .insert_relationship(&RelationshipInsert {
            base_id: args.base_id,
            rel_id: args.rel_id,
            ctx: args.ctx,
            base_ctx: args.base_ctx,
            rel_ctx: args.rel_ctx,
            forward: true,
            value: args.value.clone(),
            index: args.forward_index,
            flags: args.flags,
        })
        .await;
    timer.unbind();

    match inserted {
        Ok(true) => tpc.exit(conn, true).await?,
        Ok(false) => {
            tpc.exit(conn, false).await?;
            return Err(no_object(registry, args.base_ctx, args.base_id));
        }
        Err(err) if matches!(err, crate::backend::Error::UniqueViolation) => {
            tpc.exit(conn, false).await?;
            return Ok(false);
        }
        Err(err) => {
            tpc.exit(conn, false).await.ok();
            return Err(err.into());
        }
    }

    let outcome: Result<bool, Error> = async {
        let mut conn = pool.get_by_id(args.rel_id, None).await?;
        timer.bind(&conn);
        let inserted = conn.insert_relationship(&mirror_insert(&args, directed)).await;
        timer.unbind();

        match inserted {
            Ok(true) => {
                conn.commit().await?;
                Ok(true)
            }
            Ok(false) => {
                conn.rollback().await?;
                tpc.fail();
                Err(no_object(registry, args.rel_ctx, args.rel_id))
            }
            Err(err) => Err(err.into()),
        }
    }
    .await;

    match tpc.elsewhere(outcome).await {
        Err(err) if err.unique_violation() => Ok(false),
        other => other,
    }
}

/// Where the mirror row of `(base_id, ctx, rel_id)` lives, as
/// arguments for a statement against the `rel_id` shard.
fn mirror_key(base_id: i64, rel_id: i64, directed: bool) -> (i64, i64, bool) {
    if directed {
        (base_id, rel_id, false)
    } else {
        (rel_id, base_id, true)
    }
}

/// Update the value of both rows with an optional compare against the
/// old value. Returns `None` when either side didn't match.
pub async fn update(
    pool: &Pool,
    registry: &Registry,
    base_id: i64,
    rel_id: i64,
    ctx: i32,
    value: &Stored,
    old_value: Option<&Stored>,
    timer: &Timer,
) -> Result<Option<()>, Error> {
    let directed = registry.directed(ctx)?;

    let mut tpc = TwoPc::new(
        pool,
        pool.map().shard_by_id(base_id),
        "update_relationship",
        &[base_id.to_string(), rel_id.to_string(), ctx.to_string()],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let updated = conn
        .update_relationship(base_id, rel_id, ctx, value, old_value, true)
        .await;
    timer.unbind();

    match updated {
        Ok(true) => tpc.exit(conn, true).await?,
        Ok(false) => {
            tpc.exit(conn, false).await?;
            return Ok(None);
        }
        Err(err) => {
            tpc.exit(conn, false).await.ok();
            return Err(err.into());
        }
    }

    let outcome: Result<Option<()>, Error> = async {
        let (mirror_base, mirror_rel, forward) = mirror_key(base_id, rel_id, directed);
        let mut conn = pool.get_by_id(rel_id, None).await?;
        timer.bind(&conn);
        let updated = conn
            .update_relationship(mirror_base, mirror_rel, ctx, value, old_value, forward)
            .await;
        timer.unbind();

        if !updated? {
            conn.rollback().await?;
            tpc.fail();
            return Ok(None);
        }
        conn.commit().await?;
        Ok(Some(()))
    }
    .await;

    tpc.elsewhere(outcome).await
}

/// Flag mutation mirrored between the two rows. Returns the new
/// bitmap, or `None` when the rows are missing or disagreed.
pub async fn set_flags(
    pool: &Pool,
    registry: &Registry,
    base_id: i64,
    rel_id: i64,
    ctx: i32,
    add: u32,
    clear: u32,
    timer: &Timer,
) -> Result<Option<u32>, Error> {
    let directed = registry.directed(ctx)?;

    let mut tpc = TwoPc::new(
        pool,
        pool.map().shard_by_id(base_id),
        "set_relationship_flags",
        &[
            base_id.to_string(),
            rel_id.to_string(),
            ctx.to_string(),
            add.to_string(),
            clear.to_string(),
        ],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let result = conn
        .set_flags(
            FlagsTarget::Relationship {
                base_id,
                rel_id,
                ctx,
                forward: true,
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
        let (mirror_base, mirror_rel, forward) = mirror_key(base_id, rel_id, directed);
        let mut conn = pool.get_by_id(rel_id, None).await?;
        timer.bind(&conn);
        let result = conn
            .set_flags(
                FlagsTarget::Relationship {
                    base_id: mirror_base,
                    rel_id: mirror_rel,
                    ctx,
                    forward,
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

/// Remove both rows. Returns `false` when the forward row wasn't
/// there.
pub async fn remove_pair(
    pool: &Pool,
    registry: &Registry,
    base_id: i64,
    rel_id: i64,
    ctx: i32,
    timer: &Timer,
) -> Result<bool, Error> {
    let directed = registry.directed(ctx)?;

    let mut tpc = TwoPc::new(
        pool,
        pool.map().shard_by_id(base_id),
        "remove_relationship_pair",
        &[base_id.to_string(), rel_id.to_string(), ctx.to_string()],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let removed = conn.remove_relationship(base_id, rel_id, ctx, true).await;
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

    // The mirror transaction is committed and rolled back by hand so
    // the connection doesn't see a second COMMIT from its scope exit.
    let outcome: Result<bool, Error> = async {
        let (mirror_base, mirror_rel, forward) = mirror_key(base_id, rel_id, directed);
        let mut conn = pool.get_by_id(rel_id, None).await?;
        conn.begin().await?;
        timer.bind(&conn);
        let removed = conn
            .remove_relationship(mirror_base, mirror_rel, ctx, forward)
            .await;
        timer.unbind();

        match removed {
            Ok(true) => {
                conn.commit().await?;
                Ok(true)
            }
            Ok(false) => {
                conn.rollback().await?;
                tpc.fail();
                Ok(false)
            }
            Err(err) => {
                conn.rollback().await.ok();
                tpc.fail();
                Err(err.into())
            }
        }
    }
    .await;

    tpc.elsewhere(outcome).await
}
