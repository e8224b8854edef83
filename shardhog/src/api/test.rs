//! End-to-end scenarios against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use super::Store;
use crate::backend::memory::MemoryBackend;
use crate::context::{ContextMeta, Endpoint, Registry, SearchClass};
use crate::pool::Pool;
use crate::storage::{StorageClass, Value};
use crate::Error;
use shardhog_config::{Config, Shard};

const NODE: i32 = 1;
const OTHER_NODE: i32 = 2;
const PREFIX_NAME: i32 = 3;
const PHONETIC_NAME: i32 = 4;
const ALIAS: i32 = 5;
const PROPERTY: i32 = 6;
const UNION_REL: i32 = 7;
const DIRECTED_REL: i32 = 8;

fn registry() -> Arc<Registry> {
    let mut registry = Registry::new();

    registry
        .set_context(
            NODE,
            ContextMeta::Node {
                base_ctx: None,
                storage: StorageClass::Null,
                schema: None,
            },
        )
        .unwrap();
    registry
        .set_context(
            OTHER_NODE,
            ContextMeta::Node {
                base_ctx: None,
                storage: StorageClass::Null,
                schema: None,
            },
        )
        .unwrap();
    registry
        .set_context(
            PREFIX_NAME,
            ContextMeta::Name {
                base_ctx: NODE,
                search: SearchClass::Prefix,
                phonetic_loose: false,
            },
        )
        .unwrap();
    registry
        .set_context(
            PHONETIC_NAME,
            ContextMeta::Name {
                base_ctx: NODE,
                search: SearchClass::Phonetic,
                phonetic_loose: true,
            },
        )
        .unwrap();
    registry
        .set_context(ALIAS, ContextMeta::Alias { base_ctx: NODE })
        .unwrap();
    registry
        .set_context(
            PROPERTY,
            ContextMeta::Property {
                base_ctx: NODE,
                storage: StorageClass::Int,
                schema: None,
            },
        )
        .unwrap();
    registry
        .set_context(
            UNION_REL,
            ContextMeta::Relationship {
                base_ctx: Endpoint::Union([NODE, OTHER_NODE].into_iter().collect()),
                rel_ctx: Endpoint::Union([NODE, OTHER_NODE].into_iter().collect()),
                directed: false,
                storage: StorageClass::Null,
                schema: None,
            },
        )
        .unwrap();
    registry
        .set_context(
            DIRECTED_REL,
            ContextMeta::Relationship {
                base_ctx: Endpoint::Fixed(NODE),
                rel_ctx: Endpoint::Fixed(NODE),
                directed: true,
                storage: StorageClass::Int,
                schema: None,
            },
        )
        .unwrap();

    for ctx in [NODE, ALIAS, PREFIX_NAME, PHONETIC_NAME, PROPERTY, UNION_REL, DIRECTED_REL] {
        registry.set_flag(ctx, 1).unwrap();
        registry.set_flag(ctx, 2).unwrap();
    }

    Arc::new(registry)
}

fn dmetaphone(value: &str) -> (String, Option<String>) {
    match value {
        "Catherine" | "Katheryn" => ("KORN".to_string(), Some("KTRN".to_string())),
        other => (
            other
                .chars()
                .filter(|c| c.is_ascii_alphabetic())
                .take(4)
                .collect::<String>()
                .to_uppercase(),
            None,
        ),
    }
}

fn config(shards: usize, readonly: bool) -> Config {
    let mut config = Config::default();
    config.general.shard_bits = 8;
    config.general.digest_key = "dGVzdC1kaWdlc3Qta2V5".into();
    config.general.readonly = readonly;
    config.shards = (0..shards).map(|_| Shard::default()).collect();
    config.lookup_insertion_plans = (0..shards).map(|shard| vec![shard]).collect();
    config
}

fn store(shards: usize) -> (Store, MemoryBackend) {
    let backend = MemoryBackend::new(shards, 8);
    let pool = Pool::new(&config(shards, false), Arc::new(backend.clone())).unwrap();
    (Store::new(pool, registry(), dmetaphone), backend)
}

fn readonly_store(shards: usize) -> (Store, MemoryBackend) {
    let backend = MemoryBackend::new(shards, 8);
    let pool = Pool::new(&config(shards, true), Arc::new(backend.clone())).unwrap();
    (Store::new(pool, registry(), dmetaphone), backend)
}

async fn root(store: &Store, ctx: i32) -> super::Node {
    store
        .create_node(None, ctx, &Value::Null, None, &[], None)
        .await
        .unwrap()
}

fn total_counts(backend: &MemoryBackend, shards: usize) -> crate::backend::memory::LiveCounts {
    let mut total = crate::backend::memory::LiveCounts::default();
    for shard in 0..shards {
        let counts = backend.live_counts(shard);
        total.nodes += counts.nodes;
        total.properties += counts.properties;
        total.aliases += counts.aliases;
        total.alias_lookups += counts.alias_lookups;
        total.relationships += counts.relationships;
        total.names += counts.names;
        total.prefix_lookups += counts.prefix_lookups;
        total.phonetic_lookups += counts.phonetic_lookups;
        total.edges += counts.edges;
    }
    total
}

#[tokio::test]
async fn test_alias_contention() {
    crate::logger();
    let (store, backend) = store(4);

    let a = root(&store, NODE).await;
    let b = root(&store, NODE).await;

    assert!(store
        .set_alias(a.id, ALIAS, "hello", None, &[], None)
        .await
        .unwrap());
    // idempotent for the same owner
    assert!(!store
        .set_alias(a.id, ALIAS, "hello", None, &[], None)
        .await
        .unwrap());
    // taken for anyone else
    let err = store
        .set_alias(b.id, ALIAS, "hello", None, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AliasInUse { .. }));

    // alias bijection: one alias row, one lookup row, same owner
    let total = total_counts(&backend, 4);
    assert_eq!(total.aliases, 1);
    assert_eq!(total.alias_lookups, 1);
    let owner = store.lookup_alias("hello", ALIAS, None).await.unwrap().unwrap();
    assert_eq!(owner.base_id, a.id);

    assert_eq!(backend.prepared_transactions(), 0);
}

#[tokio::test]
async fn test_alias_flags_mirror() {
    let (store, _) = store(4);
    let a = root(&store, NODE).await;
    store
        .set_alias(a.id, ALIAS, "flagged", None, &[], None)
        .await
        .unwrap();

    let flags = store
        .set_alias_flags(a.id, ALIAS, "flagged", &[1, 2], &[], None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flags, [1, 2].into_iter().collect());

    // both sides read back the same set
    let owner = store.lookup_alias("flagged", ALIAS, None).await.unwrap().unwrap();
    assert_eq!(owner.flags, flags);
    let (aliases, _) = store.list_aliases(a.id, ALIAS, 10, 0, None).await.unwrap();
    assert_eq!(aliases[0].flags, flags);

    // unknown owner
    assert!(store
        .set_alias_flags(a.id + 1, ALIAS, "flagged", &[1], &[], None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_alias_remove() {
    let (store, backend) = store(4);
    let a = root(&store, NODE).await;
    store
        .set_alias(a.id, ALIAS, "gone-soon", None, &[], None)
        .await
        .unwrap();

    assert!(store.remove_alias(a.id, ALIAS, "gone-soon", None).await.unwrap());
    assert!(!store.remove_alias(a.id, ALIAS, "gone-soon", None).await.unwrap());

    let total = total_counts(&backend, 4);
    assert_eq!(total.aliases, 0);
    assert_eq!(total.alias_lookups, 0);
}

#[tokio::test]
async fn test_undirected_relationship() {
    let (store, backend) = store(4);

    let a = root(&store, NODE).await;
    let b = root(&store, OTHER_NODE).await;

    // union endpoints must be supplied
    let err = store
        .create_relationship(UNION_REL, a.id, b.id, None, None, &Value::Null, None, None, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingContext(UNION_REL)));

    assert!(store
        .create_relationship(
            UNION_REL,
            a.id,
            b.id,
            Some(NODE),
            Some(OTHER_NODE),
            &Value::Null,
            None,
            None,
            &[],
            None,
        )
        .await
        .unwrap());

    let (forward, _) = store
        .list_relationships(a.id, UNION_REL, true, 100, 0, None)
        .await
        .unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].rel_id, b.id);

    let (reverse, _) = store
        .list_relationships(b.id, UNION_REL, false, 100, 0, None)
        .await
        .unwrap();
    assert_eq!(reverse.len(), 1);
    assert_eq!(reverse[0].rel_id, a.id);

    // mirror flag agreement through the undirected swap
    let flags = store
        .set_relationship_flags(a.id, b.id, UNION_REL, &[2], &[], None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flags, [2].into_iter().collect());
    let (reverse, _) = store
        .list_relationships(b.id, UNION_REL, false, 100, 0, None)
        .await
        .unwrap();
    assert_eq!(reverse[0].flags, flags);

    // two forward-shaped rows total
    let total = total_counts(&backend, 4);
    assert_eq!(total.relationships, 2);
    assert_eq!(backend.prepared_transactions(), 0);
}

#[tokio::test]
async fn test_directed_relationship_lifecycle() {
    let (store, backend) = store(4);

    let a = root(&store, NODE).await;
    let b = root(&store, NODE).await;

    assert!(store
        .create_relationship(
            DIRECTED_REL,
            a.id,
            b.id,
            None,
            None,
            &Value::Int(7),
            None,
            None,
            &[1],
            None,
        )
        .await
        .unwrap());
    // already exists
    assert!(!store
        .create_relationship(
            DIRECTED_REL,
            a.id,
            b.id,
            None,
            None,
            &Value::Int(7),
            None,
            None,
            &[],
            None,
        )
        .await
        .unwrap());

    let rel = store
        .get_relationship(DIRECTED_REL, a.id, b.id, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rel.value, Value::Int(7));
    assert_eq!(rel.flags, [1].into_iter().collect());

    // CAS update propagates to the mirror
    assert!(store
        .update_relationship(DIRECTED_REL, a.id, b.id, &Value::Int(8), Some(&Value::Int(7)), None)
        .await
        .unwrap());
    // stale old value doesn't
    assert!(!store
        .update_relationship(DIRECTED_REL, a.id, b.id, &Value::Int(9), Some(&Value::Int(7)), None)
        .await
        .unwrap());

    assert!(store
        .remove_relationship(a.id, b.id, DIRECTED_REL, None)
        .await
        .unwrap());
    assert!(!store
        .remove_relationship(a.id, b.id, DIRECTED_REL, None)
        .await
        .unwrap());

    assert_eq!(total_counts(&backend, 4).relationships, 0);
    assert_eq!(backend.prepared_transactions(), 0);
}

#[tokio::test]
async fn test_relationship_missing_endpoint() {
    let (store, backend) = store(4);
    let a = root(&store, NODE).await;

    let err = store
        .create_relationship(
            DIRECTED_REL,
            a.id,
            a.id + 99,
            None,
            None,
            &Value::Int(0),
            None,
            None,
            &[],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoObject { .. }));

    // the prepared forward insert was rolled back
    assert_eq!(total_counts(&backend, 4).relationships, 0);
    assert_eq!(backend.prepared_transactions(), 0);
}

#[tokio::test]
async fn test_node_estate_removal() {
    crate::logger();
    let (store, backend) = store(4);

    // root r and subtree parent p live on shard 0
    let r = root(&store, NODE).await;
    let p = store
        .create_node(Some(r.id), NODE, &Value::Null, None, &[], None)
        .await
        .unwrap();
    let c1 = store
        .create_node(Some(p.id), NODE, &Value::Null, None, &[], None)
        .await
        .unwrap();

    // u seeds shard 1; its child c2 is born there, then moves under p
    let u = root(&store, NODE).await;
    let c2 = store
        .create_node(Some(u.id), NODE, &Value::Null, None, &[], None)
        .await
        .unwrap();
    assert!(store
        .move_node(c2.id, NODE, u.id, p.id, None, None)
        .await
        .unwrap());

    let map = store.pool().map();
    assert_ne!(map.shard_by_id(c1.id), map.shard_by_id(c2.id));

    // x on a third shard takes relationships from both descendants,
    // plus one from the unrelated y that must survive
    let x = root(&store, NODE).await;
    let y = root(&store, NODE).await;
    let x_shard = map.shard_by_id(x.id);
    assert!(![map.shard_by_id(c1.id), map.shard_by_id(c2.id)].contains(&x_shard));

    for descendant in [c1.id, c2.id, y.id] {
        assert!(store
            .create_relationship(
                DIRECTED_REL,
                descendant,
                x.id,
                None,
                None,
                &Value::Int(0),
                None,
                None,
                &[],
                None,
            )
            .await
            .unwrap());
    }

    store
        .set_alias(c1.id, ALIAS, "estate-one", None, &[], None)
        .await
        .unwrap();
    store
        .set_alias(c2.id, ALIAS, "estate-two", None, &[], None)
        .await
        .unwrap();
    store
        .set_property(c1.id, PROPERTY, &Value::Int(5), &[], None)
        .await
        .unwrap();

    assert!(store.remove_node(p.id, NODE, r.id, None).await.unwrap());

    // p, c1, c2 and everything they owned are gone
    let total = total_counts(&backend, 4);
    assert_eq!(total.nodes, 4); // r, u, x, y
    assert_eq!(total.properties, 0);
    assert_eq!(total.aliases, 0);
    assert_eq!(total.alias_lookups, 0);
    assert!(store.get_node(p.id, NODE, None).await.unwrap().is_none());
    assert!(store.get_node(c1.id, NODE, None).await.unwrap().is_none());
    assert!(store.get_node(c2.id, NODE, None).await.unwrap().is_none());
    assert!(store
        .lookup_alias("estate-one", ALIAS, None)
        .await
        .unwrap()
        .is_none());
    assert!(store
        .lookup_alias("estate-two", ALIAS, None)
        .await
        .unwrap()
        .is_none());

    // x's shard keeps exactly the surviving mirror, re-densified
    let rows = backend.relationship_rows(x_shard);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].base_id, y.id);
    assert_eq!(rows[0].pos, 0);

    // y's own forward row survives too
    let (from_y, _) = store
        .list_relationships(y.id, DIRECTED_REL, true, 10, 0, None)
        .await
        .unwrap();
    assert_eq!(from_y.len(), 1);

    assert_eq!(backend.prepared_transactions(), 0);
}

#[tokio::test]
async fn test_phonetic_name_loose_matching() {
    let (store, backend) = store(4);
    let n = root(&store, NODE).await;

    assert!(store
        .create_name(n.id, PHONETIC_NAME, "Catherine", None, &[], None)
        .await
        .unwrap());

    // primary and alternate code rows exist
    assert_eq!(total_counts(&backend, 4).phonetic_lookups, 2);

    // a same-coded query finds it
    let (hits, _) = store
        .search_names("Katheryn", PHONETIC_NAME, 10, None, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].base_id, n.id);
    assert_eq!(hits[0].value, "Catherine");

    assert!(store
        .remove_name(n.id, PHONETIC_NAME, "Catherine", None)
        .await
        .unwrap());
    assert_eq!(total_counts(&backend, 4).phonetic_lookups, 0);
    let (hits, _) = store
        .search_names("Katheryn", PHONETIC_NAME, 10, None, None)
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert_eq!(backend.prepared_transactions(), 0);
}

#[tokio::test]
async fn test_prefix_name_search() {
    let (store, backend) = store(4);
    let n = root(&store, NODE).await;

    for name in ["Cat", "Catherine", "Catnip", "Dog"] {
        assert!(store
            .create_name(n.id, PREFIX_NAME, name, None, &[], None)
            .await
            .unwrap());
    }
    assert_eq!(total_counts(&backend, 4).prefix_lookups, 4);

    let (hits, cursor) = store
        .search_names("Cat", PREFIX_NAME, 2, None, None)
        .await
        .unwrap();
    let values: Vec<&str> = hits.iter().map(|hit| hit.value.as_str()).collect();
    assert_eq!(values, vec!["Cat", "Catherine"]);

    // continuation picks up where the last page stopped
    let (hits, _) = store
        .search_names("Cat", PREFIX_NAME, 2, Some(cursor), None)
        .await
        .unwrap();
    let values: Vec<&str> = hits.iter().map(|hit| hit.value.as_str()).collect();
    assert_eq!(values, vec!["Catnip"]);

    // name flags mirror into the prefix lookup
    let flags = store
        .set_name_flags(n.id, PREFIX_NAME, "Cat", &[1], &[], None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flags, [1].into_iter().collect());
    let (hits, _) = store
        .search_names("Cat", PREFIX_NAME, 1, None, None)
        .await
        .unwrap();
    assert_eq!(hits[0].flags, flags);
}

#[tokio::test]
async fn test_dense_positions_after_shift() {
    let (store, _) = store(4);
    let n = root(&store, NODE).await;

    for name in ["a", "b", "c", "d"] {
        store
            .create_name(n.id, PREFIX_NAME, name, None, &[], None)
            .await
            .unwrap();
    }

    // move "d" to the front
    assert!(store.shift_name(n.id, PREFIX_NAME, "d", 0, None).await.unwrap());
    let (names, _) = store.list_names(n.id, PREFIX_NAME, 10, 0, None).await.unwrap();
    let values: Vec<&str> = names.iter().map(|name| name.value.as_str()).collect();
    assert_eq!(values, vec!["d", "a", "b", "c"]);

    // an index past the end clamps to the last slot
    assert!(store.shift_name(n.id, PREFIX_NAME, "d", 99, None).await.unwrap());
    let (names, _) = store.list_names(n.id, PREFIX_NAME, 10, 0, None).await.unwrap();
    let values: Vec<&str> = names.iter().map(|name| name.value.as_str()).collect();
    assert_eq!(values, vec!["a", "b", "c", "d"]);

    // an insert with an explicit index lands there
    store
        .create_name(n.id, PREFIX_NAME, "e", Some(1), &[], None)
        .await
        .unwrap();
    let (names, _) = store.list_names(n.id, PREFIX_NAME, 10, 0, None).await.unwrap();
    let values: Vec<&str> = names.iter().map(|name| name.value.as_str()).collect();
    assert_eq!(values, vec!["a", "e", "b", "c", "d"]);
}

#[tokio::test]
async fn test_timeout_during_mirror() {
    crate::logger();
    let (store, backend) = store(4);

    let a = root(&store, NODE).await;
    let b = root(&store, NODE).await;
    let map = store.pool().map();
    let a_shard = map.shard_by_id(a.id);
    let b_shard = map.shard_by_id(b.id);
    assert_ne!(a_shard, b_shard);

    // the reverse-shard insert hangs past the deadline
    backend.set_latency(b_shard, Some(Duration::from_secs(5)));

    let err = store
        .create_relationship(
            DIRECTED_REL,
            a.id,
            b.id,
            None,
            None,
            &Value::Int(0),
            None,
            None,
            &[],
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    backend.set_latency(b_shard, None);

    // the prepared forward insert was rolled back everywhere
    assert_eq!(backend.prepared_transactions(), 0);
    assert_eq!(backend.live_counts(a_shard).relationships, 0);
    assert_eq!(backend.live_counts(b_shard).relationships, 0);
}

#[tokio::test]
async fn test_read_only_pool() {
    let (store, backend) = readonly_store(2);

    let results: Vec<Result<(), Error>> = vec![
        store
            .create_node(None, NODE, &Value::Null, None, &[], None)
            .await
            .map(|_| ()),
        store
            .set_property(1, PROPERTY, &Value::Int(1), &[], None)
            .await
            .map(|_| ()),
        store.set_alias(1, ALIAS, "nope", None, &[], None).await.map(|_| ()),
        store
            .create_relationship(
                DIRECTED_REL,
                1,
                2,
                None,
                None,
                &Value::Int(0),
                None,
                None,
                &[],
                None,
            )
            .await
            .map(|_| ()),
        store
            .update_relationship(DIRECTED_REL, 1, 2, &Value::Int(0), None, None)
            .await
            .map(|_| ()),
        store
            .set_relationship_flags(1, 2, DIRECTED_REL, &[1], &[], None)
            .await
            .map(|_| ()),
        store
            .shift_relationship(1, 2, DIRECTED_REL, true, 0, None)
            .await
            .map(|_| ()),
        store.remove_relationship(1, 2, DIRECTED_REL, None).await.map(|_| ()),
        store
            .create_name(1, PREFIX_NAME, "nope", None, &[], None)
            .await
            .map(|_| ()),
        store.shift_name(1, PREFIX_NAME, "nope", 0, None).await.map(|_| ()),
        store.remove_name(1, PREFIX_NAME, "nope", None).await.map(|_| ()),
        store.move_node(1, NODE, 2, 3, None, None).await.map(|_| ()),
        store.remove_node(1, NODE, 2, None).await.map(|_| ()),
    ];

    for result in results {
        assert!(matches!(result, Err(Error::ReadOnly)));
    }

    // the fence held before any shard was touched
    assert_eq!(backend.statements(), 0);
}

#[tokio::test]
async fn test_property_upsert() {
    let (store, _) = store(4);
    let n = root(&store, NODE).await;

    // first set creates
    assert!(store
        .set_property(n.id, PROPERTY, &Value::Int(1), &[], None)
        .await
        .unwrap());
    // second set updates in place
    assert!(!store
        .set_property(n.id, PROPERTY, &Value::Int(2), &[], None)
        .await
        .unwrap());

    let prop = store.get_property(n.id, PROPERTY, None).await.unwrap().unwrap();
    assert_eq!(prop.value, Value::Int(2));

    // wrong storage class is rejected at the boundary
    let err = store
        .set_property(n.id, PROPERTY, &Value::Utf8("nope".into()), &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StorageClass(_)));

    assert!(store.remove_property(n.id, PROPERTY, None).await.unwrap());
    assert!(store.get_property(n.id, PROPERTY, None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_under_missing_parent() {
    let (store, backend) = store(4);

    let err = store
        .create_node(Some((1i64 << 56) | 999), NODE, &Value::Null, None, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoObject { .. }));

    // the node insert rolled back with the failed edge
    assert_eq!(total_counts(&backend, 4).nodes, 0);
}

#[tokio::test]
async fn test_bad_flag_and_context() {
    let (store, _) = store(4);
    let n = root(&store, NODE).await;

    let err = store
        .set_alias(n.id, ALIAS, "x", None, &[9], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadFlag { flag: 9, ctx: ALIAS }));

    // an alias ctx is not a relationship ctx
    let err = store
        .remove_relationship(n.id, n.id, ALIAS, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadContext(ALIAS)));
}
