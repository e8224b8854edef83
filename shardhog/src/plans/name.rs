//! Name plans.
//!
//! A name row lives on its owner's shard and mirrors into search
//! lookups: one prefix-lookup row, or one or two phonetic-lookup rows
//! (primary code, plus the alternate code under `phonetic_loose`).
//! Lookup rows for the same value can sit on an older shard while a
//! rebalance is in flight, so flag and remove plans locate them by
//! probing the read list first.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::api::Dmetaphone;
use crate::backend::{FlagsTarget, NameHit};
use crate::context::{Registry, SearchClass};
use crate::pool::Pool;
use crate::timer::Timer;
use crate::two_pc::TwoPc;
use crate::Error;

/// Where a name's lookup rows were found.
#[derive(Debug, Clone, Copy)]
pub enum NameLookup {
    Prefix(usize),
    Phonetic { primary: usize, alt: Option<usize> },
}

/// Continuation token for [`search`]. Serializable so callers can
/// hand it back across process boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchCursor {
    /// Largest value emitted.
    Prefix(String),
    /// Largest base_id emitted per phonetic code.
    Phonetic(HashMap<String, i64>),
}

fn ascii_uniq(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii()).collect()
}

/// Create a name and its lookup row(s). Returns `false` when the name
/// already exists or the base object is missing from its shard.
pub async fn create(
    pool: &Pool,
    registry: &Registry,
    dmetaphone: Dmetaphone,
    base_id: i64,
    ctx: i32,
    value: &str,
    flags: u32,
    index: Option<usize>,
    timer: &Timer,
) -> Result<bool, Error> {
    let mut tpc = TwoPc::new(
        pool,
        pool.map().shard_by_id(base_id),
        "create_name",
        &[base_id.to_string(), ctx.to_string(), ascii_uniq(value)],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let inserted = conn.insert_name(base_id, ctx, value, flags, index).await;
    timer.unbind();

    match inserted {
        Ok(true) => tpc.exit(conn, true).await?,
        Ok(false) => {
            tpc.exit(conn, false).await?;
            return Ok(false);
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
        let written =
            write_lookup(pool, registry, dmetaphone, base_id, ctx, value, flags, timer).await?;
        if !written {
            tpc.fail();
            return Ok(false);
        }
        Ok(true)
    }
    .await;

    tpc.elsewhere(outcome).await
}

async fn write_lookup(
    pool: &Pool,
    registry: &Registry,
    dmetaphone: Dmetaphone,
    base_id: i64,
    ctx: i32,
    value: &str,
    flags: u32,
    timer: &Timer,
) -> Result<bool, Error> {
    match registry.search(ctx) {
        Some(SearchClass::Prefix) => {
            let shard = pool.map().shard_for_prefix_write(value.as_bytes());
            let mut conn = pool.get_by_shard(shard, None).await?;
            timer.bind(&conn);
            let inserted = conn.insert_prefix_lookup(value, flags, ctx, base_id).await;
            timer.unbind();
            let inserted = inserted?;
            if inserted {
                conn.commit().await?;
            } else {
                conn.rollback().await?;
            }
            Ok(inserted)
        }
        Some(SearchClass::Phonetic) => {
            write_phonetic_lookups(pool, registry, dmetaphone, base_id, ctx, value, flags, timer)
                .await
        }
        None => Err(Error::BadContext(ctx)),
    }
}

/// Write the phonetic lookups under their own two-phase plan: the
/// primary code's shard prepares before the alternate's is touched.
async fn write_phonetic_lookups(
    pool: &Pool,
    registry: &Registry,
    dmetaphone: Dmetaphone,
    base_id: i64,
    ctx: i32,
    value: &str,
    flags: u32,
    timer: &Timer,
) -> Result<bool, Error> {
    let (dm, dmalt) = dmetaphone(value);
    let shard = pool.map().shard_for_phonetic_write(&dm);

    let mut tpc = TwoPc::new(
        pool,
        shard,
        "phonetic_lookup_writes",
        &[
            base_id.to_string(),
            ctx.to_string(),
            ascii_uniq(value),
            shard.to_string(),
        ],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let inserted = conn
        .insert_phonetic_lookup(value, &dm, flags, ctx, base_id)
        .await;
    timer.unbind();

    let inserted = match inserted {
        Ok(inserted) => {
            tpc.exit(conn, true).await?;
            inserted
        }
        Err(err) => {
            tpc.exit(conn, false).await.ok();
            return Err(err.into());
        }
    };

    if !inserted {
        tpc.rollback().await?;
        return Ok(false);
    }

    let dmalt = match dmalt {
        Some(dmalt) if registry.phonetic_loose(ctx) => dmalt,
        _ => {
            tpc.commit().await?;
            return Ok(true);
        }
    };

    let outcome: Result<bool, Error> = async {
        let shard = pool.map().shard_for_phonetic_write(&dmalt);
        let mut conn = pool.get_by_shard(shard, None).await?;
        timer.bind(&conn);
        let inserted = conn
            .insert_phonetic_lookup(value, &dmalt, flags, ctx, base_id)
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

/// Probe the read lists for the shard(s) actually holding this name's
/// lookup rows.
pub async fn find_lookup(
    pool: &Pool,
    registry: &Registry,
    dmetaphone: Dmetaphone,
    base_id: i64,
    ctx: i32,
    value: &str,
    timer: &Timer,
) -> Result<Option<NameLookup>, Error> {
    match registry.search(ctx) {
        Some(SearchClass::Prefix) => {
            for shard in pool.map().shards_for_lookup_prefix(value.as_bytes()) {
                let mut conn = pool.get_by_shard(shard, None).await?;
                timer.bind(&conn);
                let found = conn.prefix_lookup_exists(value, ctx, base_id).await;
                timer.unbind();
                if found? {
                    return Ok(Some(NameLookup::Prefix(shard)));
                }
            }
            Ok(None)
        }
        Some(SearchClass::Phonetic) => {
            let (dm, dmalt) = dmetaphone(value);

            let mut primary = None;
            for shard in pool.map().shards_for_lookup_phonetic(&dm) {
                let mut conn = pool.get_by_shard(shard, None).await?;
                timer.bind(&conn);
                let found = conn.phonetic_lookup_exists(&dm, ctx, value, base_id).await;
                timer.unbind();
                if found? {
                    primary = Some(shard);
                    break;
                }
            }
            let primary = match primary {
                Some(shard) => shard,
                None => return Ok(None),
            };

            let dmalt = match dmalt {
                Some(dmalt) if registry.phonetic_loose(ctx) => dmalt,
                _ => {
                    return Ok(Some(NameLookup::Phonetic {
                        primary,
                        alt: None,
                    }))
                }
            };

            for shard in pool.map().shards_for_lookup_phonetic(&dmalt) {
                let mut conn = pool.get_by_shard(shard, None).await?;
                timer.bind(&conn);
                let found = conn
                    .phonetic_lookup_exists(&dmalt, ctx, value, base_id)
                    .await;
                timer.unbind();
                if found? {
                    return Ok(Some(NameLookup::Phonetic {
                        primary,
                        alt: Some(shard),
                    }));
                }
            }
            Ok(None)
        }
        None => Err(Error::BadContext(ctx)),
    }
}

/// Flag mutation mirrored between the name row and its lookup(s).
pub async fn set_flags(
    pool: &Pool,
    registry: &Registry,
    dmetaphone: Dmetaphone,
    base_id: i64,
    ctx: i32,
    value: &str,
    add: u32,
    clear: u32,
    timer: &Timer,
) -> Result<Option<u32>, Error> {
    let lookup = match find_lookup(pool, registry, dmetaphone, base_id, ctx, value, timer).await? {
        Some(lookup) => lookup,
        None => return Ok(None),
    };

    let mut tpc = TwoPc::new(
        pool,
        pool.map().shard_by_id(base_id),
        "set_name_flags",
        &[
            base_id.to_string(),
            ctx.to_string(),
            ascii_uniq(value),
            add.to_string(),
            clear.to_string(),
        ],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let result = conn
        .set_flags(
            FlagsTarget::Name {
                base_id,
                ctx,
                value,
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
        let applied = match lookup {
            NameLookup::Prefix(shard) => {
                apply_flags_to_prefix(pool, shard, base_id, ctx, value, add, clear, result_flags, timer)
                    .await?
            }
            NameLookup::Phonetic { primary, alt } => {
                apply_flags_to_phonetics(
                    pool, dmetaphone, primary, alt, base_id, ctx, value, add, clear, result_flags,
                    timer,
                )
                .await?
            }
        };
        if !applied {
            tpc.fail();
            return Ok(None);
        }
        Ok(Some(result_flags))
    }
    .await;

    tpc.elsewhere(outcome).await
}

#[allow(clippy::too_many_arguments)]
async fn apply_flags_to_prefix(
    pool: &Pool,
    shard: usize,
    base_id: i64,
    ctx: i32,
    value: &str,
    add: u32,
    clear: u32,
    expected: u32,
    timer: &Timer,
) -> Result<bool, Error> {
    let mut conn = pool.get_by_shard(shard, None).await?;
    timer.bind(&conn);
    let result = conn
        .set_flags(
            FlagsTarget::PrefixLookup {
                base_id,
                ctx,
                value,
            },
            add,
            clear,
        )
        .await;
    timer.unbind();

    match result? {
        Some(flags) if flags == expected => {
            conn.commit().await?;
            Ok(true)
        }
        _ => {
            conn.rollback().await?;
            Ok(false)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply_flags_to_phonetics(
    pool: &Pool,
    dmetaphone: Dmetaphone,
    primary: usize,
    alt: Option<usize>,
    base_id: i64,
    ctx: i32,
    value: &str,
    add: u32,
    clear: u32,
    expected: u32,
    timer: &Timer,
) -> Result<bool, Error> {
    let (dm, dmalt) = dmetaphone(value);

    let alt = match alt {
        None => {
            // One lookup row; a plain mirrored write.
            let mut conn = pool.get_by_shard(primary, None).await?;
            timer.bind(&conn);
            let result = conn
                .set_flags(
                    FlagsTarget::PhoneticLookup {
                        base_id,
                        ctx,
                        code: &dm,
                        value,
                    },
                    add,
                    clear,
                )
                .await;
            timer.unbind();

            return match result? {
                Some(flags) if flags == expected => {
                    conn.commit().await?;
                    Ok(true)
                }
                _ => {
                    conn.rollback().await?;
                    Ok(false)
                }
            };
        }
        Some(alt) => alt,
    };

    let dmalt = match dmalt {
        Some(dmalt) => dmalt,
        None => return Ok(false),
    };

    // Two lookup rows on two shards; nest a two-phase plan.
    let mut tpc = TwoPc::new(
        pool,
        primary,
        "apply_flag_phonetic",
        &[
            base_id.to_string(),
            ctx.to_string(),
            add.to_string(),
            clear.to_string(),
        ],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let result = conn
        .set_flags(
            FlagsTarget::PhoneticLookup {
                base_id,
                ctx,
                code: &dm,
                value,
            },
            add,
            clear,
        )
        .await;
    timer.unbind();

    match result {
        Ok(Some(flags)) if flags == expected => tpc.exit(conn, true).await?,
        Ok(_) => {
            tpc.exit(conn, false).await?;
            return Ok(false);
        }
        Err(err) => {
            tpc.exit(conn, false).await.ok();
            return Err(err.into());
        }
    }

    let outcome: Result<bool, Error> = async {
        let mut conn = pool.get_by_shard(alt, None).await?;
        timer.bind(&conn);
        let result = conn
            .set_flags(
                FlagsTarget::PhoneticLookup {
                    base_id,
                    ctx,
                    code: &dmalt,
                    value,
                },
                add,
                clear,
            )
            .await;
        timer.unbind();

        match result? {
            Some(flags) if flags == expected => {
                conn.commit().await?;
                Ok(true)
            }
            _ => {
                conn.rollback().await?;
                tpc.fail();
                Ok(false)
            }
        }
    }
    .await;

    tpc.elsewhere(outcome).await
}

/// Remove a name and its lookup row(s). Returns `false` when there
/// was nothing to remove.
pub async fn remove(
    pool: &Pool,
    registry: &Registry,
    dmetaphone: Dmetaphone,
    base_id: i64,
    ctx: i32,
    value: &str,
    timer: &Timer,
) -> Result<bool, Error> {
    let lookup = match find_lookup(pool, registry, dmetaphone, base_id, ctx, value, timer).await? {
        Some(lookup) => lookup,
        None => return Ok(false),
    };

    let mut tpc = TwoPc::new(
        pool,
        pool.map().shard_by_id(base_id),
        "remove_name",
        &[base_id.to_string(), ctx.to_string(), ascii_uniq(value)],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let removed = conn.remove_name(base_id, ctx, value).await;
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
        let removed =
            remove_lookup(pool, dmetaphone, lookup, base_id, ctx, value, timer).await?;
        if !removed {
            tpc.fail();
            return Ok(false);
        }
        Ok(true)
    }
    .await;

    tpc.elsewhere(outcome).await
}

async fn remove_lookup(
    pool: &Pool,
    dmetaphone: Dmetaphone,
    lookup: NameLookup,
    base_id: i64,
    ctx: i32,
    value: &str,
    timer: &Timer,
) -> Result<bool, Error> {
    match lookup {
        NameLookup::Prefix(shard) => {
            let mut conn = pool.get_by_shard(shard, None).await?;
            timer.bind(&conn);
            let removed = conn.remove_prefix_lookup(base_id, ctx, value).await;
            timer.unbind();
            let removed = removed?;
            if removed {
                conn.commit().await?;
            } else {
                conn.rollback().await?;
            }
            Ok(removed)
        }
        NameLookup::Phonetic { primary, alt: None } => {
            let (dm, _) = dmetaphone(value);
            let mut conn = pool.get_by_shard(primary, None).await?;
            timer.bind(&conn);
            let removed = conn.remove_phonetic_lookup(base_id, ctx, &dm, value).await;
            timer.unbind();
            let removed = removed?;
            if removed {
                conn.commit().await?;
            } else {
                conn.rollback().await?;
            }
            Ok(removed)
        }
        NameLookup::Phonetic {
            primary,
            alt: Some(alt),
        } => {
            remove_phonetic_lookups_both(pool, dmetaphone, primary, alt, base_id, ctx, value, timer)
                .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn remove_phonetic_lookups_both(
    pool: &Pool,
    dmetaphone: Dmetaphone,
    primary: usize,
    alt: usize,
    base_id: i64,
    ctx: i32,
    value: &str,
    timer: &Timer,
) -> Result<bool, Error> {
    let (dm, dmalt) = dmetaphone(value);
    let dmalt = match dmalt {
        Some(dmalt) => dmalt,
        None => return Ok(false),
    };

    let mut tpc = TwoPc::new(
        pool,
        primary,
        "remove_phonetic_lookups",
        &[base_id.to_string(), ctx.to_string(), ascii_uniq(value)],
    );

    let mut conn = tpc.begin().await?;
    timer.bind(&conn);
    let removed = conn.remove_phonetic_lookup(base_id, ctx, &dm, value).await;
    timer.unbind();

    let removed = match removed {
        Ok(removed) => {
            tpc.exit(conn, true).await?;
            removed
        }
        Err(err) => {
            tpc.exit(conn, false).await.ok();
            return Err(err.into());
        }
    };

    if !removed {
        tpc.rollback().await?;
        return Ok(false);
    }

    // Manual commit/rollback on the alternate shard's connection.
    let outcome: Result<bool, Error> = async {
        let mut conn = pool.get_by_shard(alt, None).await?;
        conn.begin().await?;
        timer.bind(&conn);
        let removed = conn
            .remove_phonetic_lookup(base_id, ctx, &dmalt, value)
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

/// Move a name within its owner's ordered list.
pub async fn reorder(
    pool: &Pool,
    base_id: i64,
    ctx: i32,
    value: &str,
    index: usize,
    timer: &Timer,
) -> Result<bool, Error> {
    let mut conn = pool.get_by_id(base_id, None).await?;
    conn.begin().await?;
    timer.bind(&conn);
    let result = conn.reorder_name(base_id, ctx, value, index).await;
    timer.unbind();

    match result {
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
    }
}

/// Fan a search out across every candidate shard, then merge.
pub async fn search(
    pool: &Pool,
    registry: &Registry,
    dmetaphone: Dmetaphone,
    value: &str,
    ctx: i32,
    limit: usize,
    start: Option<SearchCursor>,
    timer: &Timer,
) -> Result<(Vec<NameHit>, SearchCursor), Error> {
    match registry.search(ctx) {
        Some(SearchClass::Prefix) => search_prefix(pool, value, ctx, limit, start, timer).await,
        Some(SearchClass::Phonetic) => {
            search_phonetic(pool, registry, dmetaphone, value, ctx, limit, start, timer).await
        }
        None => Err(Error::BadContext(ctx)),
    }
}

async fn search_prefix(
    pool: &Pool,
    value: &str,
    ctx: i32,
    limit: usize,
    start: Option<SearchCursor>,
    timer: &Timer,
) -> Result<(Vec<NameHit>, SearchCursor), Error> {
    let start = match start {
        Some(SearchCursor::Prefix(start)) => start,
        _ => String::new(),
    };

    let shards = pool.map().shards_for_lookup_prefix(value.as_bytes());
    let mut names = vec![];
    for shard in shards.iter().copied() {
        let mut conn = pool.get_by_shard(shard, None).await?;
        timer.bind(&conn);
        let hits = conn.search_prefixes(value, ctx, limit, &start).await;
        timer.unbind();
        names.extend(hits?);
    }

    if shards.len() > 1 {
        names.sort_by(|a, b| a.value.cmp(&b.value));
        names.truncate(limit);
    }

    let cursor = names.last().map(|hit| hit.value.clone()).unwrap_or(start);
    Ok((names, SearchCursor::Prefix(cursor)))
}

#[allow(clippy::too_many_arguments)]
async fn search_phonetic(
    pool: &Pool,
    registry: &Registry,
    dmetaphone: Dmetaphone,
    value: &str,
    ctx: i32,
    limit: usize,
    start: Option<SearchCursor>,
    timer: &Timer,
) -> Result<(Vec<NameHit>, SearchCursor), Error> {
    let start = match start {
        Some(SearchCursor::Phonetic(start)) => start,
        _ => HashMap::new(),
    };

    let (dm, dmalt) = dmetaphone(value);
    let mut codes = vec![dm];
    if let Some(dmalt) = dmalt {
        if registry.phonetic_loose(ctx) {
            codes.push(dmalt);
        }
    }

    let mut results = vec![];
    for code in &codes {
        let after = start.get(code).copied().unwrap_or(0);
        for shard in pool.map().shards_for_lookup_phonetic(code) {
            let mut conn = pool.get_by_shard(shard, None).await?;
            timer.bind(&conn);
            let hits = conn.search_phonetics(code, ctx, limit, after).await;
            timer.unbind();
            results.extend(hits?);
        }
    }

    // Sort by shard-local id then full id so pagination is stable
    // across shards.
    let mask = pool.map().local_id_mask();
    results.sort_by_key(|hit| ((hit.base_id as u64) & mask, hit.base_id));

    let mut seen = HashSet::new();
    let mut merged = vec![];
    let mut cursor = HashMap::new();
    for hit in results {
        if !seen.insert((hit.base_id, hit.ctx, hit.value.clone())) {
            continue;
        }
        if merged.len() == limit {
            break;
        }
        cursor.insert(hit.code.clone(), hit.base_id);
        merged.push(NameHit {
            base_id: hit.base_id,
            ctx: hit.ctx,
            value: hit.value,
            flags: hit.flags,
        });
    }

    Ok((merged, SearchCursor::Phonetic(cursor)))
}
