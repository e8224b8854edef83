//! Recursive node removal.
//!
//! Removing a node cascades to its transitive descendants and every
//! dependent lookup row. Work is batched per shard in an estate map;
//! each visited shard runs under its own two-phase handle, and every
//! handle stays prepared until the whole estate has been collected,
//! so the operation commits everywhere or nowhere.

use std::collections::{HashMap, HashSet};

use crate::backend::{Digest, RelMirror};
use crate::context::{Registry, SearchClass};
use crate::pool::{Guard, Pool};
use crate::timer::Timer;
use crate::two_pc::TwoPc;
use crate::Error;

#[derive(Debug, Default)]
struct Estate {
    alias_lookups: HashSet<(Digest, i32)>,
    name_lookups: HashSet<(i64, i32, String)>,
    rel_mirrors: Vec<RelMirror>,
    pending: Vec<i64>,
}

type EstateMap = HashMap<usize, Estate>;

/// Remove the edge pointing at `id`, then collect and delete its
/// whole estate. Returns `false` when the edge wasn't there.
pub async fn remove_node(
    pool: &Pool,
    registry: &Registry,
    id: i64,
    ctx: i32,
    base_id: i64,
    timer: &Timer,
) -> Result<bool, Error> {
    let shard = pool.map().shard_by_id(base_id);
    let mut tpcs: Vec<TwoPc> = vec![];

    let mut tpc = TwoPc::new(
        pool,
        shard,
        "remove_node_edge",
        &[
            id.to_string(),
            ctx.to_string(),
            base_id.to_string(),
            shard.to_string(),
        ],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let removed = conn.remove_edge(base_id, ctx, id).await;
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
    tpcs.push(tpc);

    let mut estates = EstateMap::new();
    estates
        .entry(pool.map().shard_by_id(id))
        .or_default()
        .pending
        .push(id);

    let result: Result<(), Error> = async {
        while let Some(shard) = estates.keys().next().copied() {
            let mut tpc = TwoPc::new(
                pool,
                shard,
                "remove_node_shard",
                &[
                    id.to_string(),
                    ctx.to_string(),
                    base_id.to_string(),
                    shard.to_string(),
                ],
            );

            let mut conn = tpc.begin().await?;
            timer.bind(&conn);
            let work =
                remove_local_estate(shard, pool, registry, &mut conn, &mut estates, false).await;
            timer.unbind();

            let ok = work.is_ok();
            tpc.exit(conn, ok).await.ok();
            tpcs.push(tpc);
            work?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            for tpc in tpcs.iter_mut() {
                tpc.commit().await?;
            }
            Ok(true)
        }
        Err(err) => {
            // unwind newest-first
            for tpc in tpcs.iter_mut().rev() {
                let _ = tpc.rollback().await;
            }
            Err(err)
        }
    }
}

/// Drain one shard's share of the estate: tombstone nodes,
/// properties, aliases, names, relationships and edges in rounds,
/// feeding newly discovered work back into the map, then apply the
/// lookup and mirror removals other shards queued for us.
async fn remove_local_estate(
    shard: usize,
    pool: &Pool,
    registry: &Registry,
    conn: &mut Guard,
    estates: &mut EstateMap,
    node_base: bool,
) -> Result<(), Error> {
    let map = pool.map();
    let mut node_base = node_base;
    let mut ids = std::mem::take(&mut estates.entry(shard).or_default().pending);

    while !ids.is_empty() {
        if !node_base {
            ids = conn.remove_nodes(&ids).await?;
            if ids.is_empty() {
                break;
            }
        }
        node_base = false;

        conn.remove_properties_for_bases(&ids).await?;

        let aliases = conn.remove_aliases_for_bases(&ids).await?;
        for (value, alias_ctx) in aliases {
            let digest = pool.alias_digest(&value);
            // the lookup row may live on any shard in its read list
            for target in map.shards_for_lookup_hash(&digest) {
                estates
                    .entry(target)
                    .or_default()
                    .alias_lookups
                    .insert((digest.clone(), alias_ctx));
            }
        }

        let names = conn.remove_names_for_bases(&ids).await?;
        for (name_base, name_ctx, name_value) in names {
            for target in map.shards_for_lookup_prefix(name_value.as_bytes()) {
                estates
                    .entry(target)
                    .or_default()
                    .name_lookups
                    .insert((name_base, name_ctx, name_value.clone()));
            }
        }

        let rels = conn.remove_relationships_for_bases(&ids).await?;
        for rel in rels {
            let directed = registry.directed(rel.ctx).unwrap_or(true);
            let (target, mirror) = if directed || !rel.forward {
                let target = if rel.forward {
                    map.shard_by_id(rel.rel_id)
                } else {
                    map.shard_by_id(rel.base_id)
                };
                (
                    target,
                    RelMirror {
                        base_id: rel.base_id,
                        ctx: rel.ctx,
                        forward: !rel.forward,
                        rel_id: rel.rel_id,
                    },
                )
            } else {
                // undirected mirrors are forward rows with swapped ids
                (
                    map.shard_by_id(rel.rel_id),
                    RelMirror {
                        base_id: rel.rel_id,
                        ctx: rel.ctx,
                        forward: true,
                        rel_id: rel.base_id,
                    },
                )
            };
            if target == shard {
                continue;
            }
            estates.entry(target).or_default().rel_mirrors.push(mirror);
        }

        let children = conn.remove_edges_for_bases(&ids).await?;
        for child in children {
            estates
                .entry(map.shard_by_id(child))
                .or_default()
                .pending
                .push(child);
        }

        ids = std::mem::take(&mut estates.entry(shard).or_default().pending);
    }

    let Estate {
        alias_lookups,
        name_lookups,
        rel_mirrors,
        ..
    } = estates.remove(&shard).unwrap_or_default();

    if !alias_lookups.is_empty() {
        let pairs: Vec<(Digest, i32)> = alias_lookups.into_iter().collect();
        let removed = conn.remove_alias_lookups(&pairs).await?;
        for pair in removed {
            // no other shard needs to try this one anymore
            for target in map.shards_for_lookup_hash(&pair.0) {
                if target == shard {
                    continue;
                }
                if let Some(estate) = estates.get_mut(&target) {
                    estate.alias_lookups.remove(&pair);
                }
            }
        }
    }

    if !name_lookups.is_empty() {
        let mut prefixes = vec![];
        let mut phonetics = vec![];
        for triple in name_lookups {
            match registry.search(triple.1) {
                Some(SearchClass::Prefix) => prefixes.push(triple),
                Some(SearchClass::Phonetic) => phonetics.push(triple),
                None => {}
            }
        }

        let mut removed = conn.remove_prefix_lookups(&prefixes).await?;
        removed.extend(conn.remove_phonetic_lookups(&phonetics).await?);

        for triple in removed {
            for target in map.shards_for_lookup_prefix(triple.2.as_bytes()) {
                if target == shard {
                    continue;
                }
                if let Some(estate) = estates.get_mut(&target) {
                    estate.name_lookups.remove(&triple);
                }
            }
        }
    }

    if !rel_mirrors.is_empty() {
        conn.remove_relationships(&rel_mirrors).await?;

        let mut forward_anchors = HashSet::new();
        let mut reverse_anchors = HashSet::new();
        for mirror in &rel_mirrors {
            if mirror.forward {
                forward_anchors.insert((mirror.base_id, mirror.ctx));
            } else {
                reverse_anchors.insert((mirror.rel_id, mirror.ctx));
            }
        }
        if !forward_anchors.is_empty() {
            let anchors: Vec<(i64, i32)> = forward_anchors.into_iter().collect();
            conn.bulk_reorder_relationships(&anchors, true).await?;
        }
        if !reverse_anchors.is_empty() {
            let anchors: Vec<(i64, i32)> = reverse_anchors.into_iter().collect();
            conn.bulk_reorder_relationships(&anchors, false).await?;
        }
    }

    Ok(())
}
