//! Node creation and movement.

use std::time::Duration;

use super::no_object;
use crate::backend::NodeRow;
use crate::context::Registry;
use crate::pool::Pool;
use crate::storage::Stored;
use crate::timer::Timer;
use crate::two_pc::TwoPc;
use crate::Error;

/// Create a node, either rootless on a shard from the insert plan or
/// under a parent on the parent's shard (with the parent→child edge
/// in the same transaction).
pub async fn create(
    pool: &Pool,
    registry: &Registry,
    base_id: Option<i64>,
    ctx: i32,
    value: &Stored,
    index: Option<usize>,
    flags: u32,
    timeout: Option<Duration>,
) -> Result<NodeRow, Error> {
    let shard = match base_id {
        None => pool.map().shard_for_root_insert(),
        Some(base_id) => pool.map().shard_by_id(base_id),
    };

    let mut conn = pool.get_by_shard(shard, timeout).await?;
    conn.begin().await?;
    let node = conn.insert_node(ctx, value, flags).await?;

    if let Some(base_id) = base_id {
        if !conn.insert_edge(base_id, ctx, node.id, index, true).await? {
            conn.rollback().await?;
            let base_ctx = registry.base_ctx(ctx).unwrap_or(ctx);
            return Err(no_object(registry, base_ctx, base_id));
        }
    }

    conn.commit().await?;
    Ok(node)
}

/// Re-parent a node: remove the old edge, insert the new one. Both
/// edges on one shard stay in one local transaction; otherwise the
/// removal prepares first.
pub async fn move_node(
    pool: &Pool,
    node_id: i64,
    ctx: i32,
    base_id: i64,
    new_base_id: i64,
    index: Option<usize>,
    timer: &Timer,
) -> Result<bool, Error> {
    let map = pool.map();

    if map.shard_by_id(base_id) == map.shard_by_id(new_base_id) {
        let mut conn = pool.get_by_id(base_id, None).await?;
        conn.begin().await?;
        timer.bind(&conn);
        let result: Result<bool, crate::backend::Error> = async {
            if !conn.remove_edge(base_id, ctx, node_id).await? {
                return Ok(false);
            }
            conn.insert_edge(new_base_id, ctx, node_id, index, true).await
        }
        .await;
        timer.unbind();

        return match result {
            Ok(true) => {
                conn.commit().await?;
                Ok(true)
            }
            Ok(false) => {
                conn.rollback().await?;
                Ok(false)
            }
            Err(err) => {
                conn.rollback().await.ok();
                Err(err.into())
            }
        };
    }

    let mut tpc = TwoPc::new(
        pool,
        map.shard_by_id(base_id),
        "move_node",
        &[
            node_id.to_string(),
            ctx.to_string(),
            base_id.to_string(),
            new_base_id.to_string(),
        ],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let removed = conn.remove_edge(base_id, ctx, node_id).await;
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
        let mut conn = pool.get_by_id(new_base_id, None).await?;
        timer.bind(&conn);
        let inserted = conn
            .insert_edge(new_base_id, ctx, node_id, index, true)
            .await;
        timer.unbind();

        if !inserted? {
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
