//! Shard placement.
//!
//! Objects live on the shard named by the top `shard_bits` of their id.
//! Secondary lookup rows route through "insertion plans": an ordered
//! list of candidate shards per key. Writes always target the first
//! shard of the plan; reads probe the whole list in order, so a key's
//! home can be moved by listing the new shard first and the old one
//! after it until the old rows age out.

use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};

use fnv::FnvHasher;
use shardhog_config::Config;

#[derive(Debug)]
pub struct ShardMap {
    shard_bits: u32,
    shards: usize,
    lookup_plans: Vec<Vec<usize>>,
    root_insert: Vec<usize>,
    root_cursor: AtomicUsize,
}

impl ShardMap {
    pub fn new(config: &Config) -> Self {
        let shards = config.shards.len().max(1);
        let root_insert = if config.root_insert_shards.is_empty() {
            (0..shards).collect()
        } else {
            config.root_insert_shards.clone()
        };

        Self {
            shard_bits: config.general.shard_bits,
            shards,
            lookup_plans: config.lookup_insertion_plans.clone(),
            root_insert,
            root_cursor: AtomicUsize::new(0),
        }
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    pub fn shard_bits(&self) -> u32 {
        self.shard_bits
    }

    /// Mask selecting the shard-local portion of an id.
    pub fn local_id_mask(&self) -> u64 {
        (1u64 << (64 - self.shard_bits)) - 1
    }

    /// Home shard of an object id: the top `shard_bits` bits.
    pub fn shard_by_id(&self, id: i64) -> usize {
        ((id as u64) >> (64 - self.shard_bits)) as usize % self.shards
    }

    /// Shard for a brand-new rootless node, rotating through the
    /// admin-configured insert plan.
    pub fn shard_for_root_insert(&self) -> usize {
        let cursor = self.root_cursor.fetch_add(1, Ordering::Relaxed);
        self.root_insert[cursor % self.root_insert.len()]
    }

    /// Shard that receives a new alias-lookup row.
    pub fn shard_for_alias_write(&self, digest: &[u8]) -> usize {
        self.plan(digest)[0]
    }

    /// Probe order for alias-lookup reads.
    pub fn shards_for_lookup_hash(&self, digest: &[u8]) -> Vec<usize> {
        self.plan(digest)
    }

    /// Shard that receives a new prefix-lookup row.
    ///
    /// Prefix keys route by their leading byte so that a search prefix
    /// and every value extending it agree on a plan.
    pub fn shard_for_prefix_write(&self, value: &[u8]) -> usize {
        self.plan(prefix_key(value))[0]
    }

    /// Probe order for prefix-lookup reads.
    pub fn shards_for_lookup_prefix(&self, value: &[u8]) -> Vec<usize> {
        self.plan(prefix_key(value))
    }

    /// Shard that receives a new phonetic-lookup row.
    pub fn shard_for_phonetic_write(&self, code: &str) -> usize {
        self.plan(code.as_bytes())[0]
    }

    /// Probe order for phonetic-lookup reads.
    pub fn shards_for_lookup_phonetic(&self, code: &str) -> Vec<usize> {
        self.plan(code.as_bytes())
    }

    fn plan(&self, key: &[u8]) -> Vec<usize> {
        let hash = fnv1a(key);
        if self.lookup_plans.is_empty() {
            return vec![hash as usize % self.shards];
        }
        self.lookup_plans[hash as usize % self.lookup_plans.len()].clone()
    }
}

fn prefix_key(value: &[u8]) -> &[u8] {
    value.get(..1).unwrap_or(value)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::*;
    use shardhog_config::Shard;

    fn map(shards: usize, bits: u32, plans: Vec<Vec<usize>>) -> ShardMap {
        let mut config = Config::default();
        config.general.shard_bits = bits;
        config.shards = (0..shards).map(|_| Shard::default()).collect();
        config.lookup_insertion_plans = plans;
        ShardMap::new(&config)
    }

    #[test]
    fn test_shard_by_id_top_bits() {
        let map = map(8, 3, vec![]);
        let id = (0b101u64 << 61) as i64 | 77;
        assert_eq!(map.shard_by_id(id), 0b101);
        assert_eq!(map.local_id_mask(), (1 << 61) - 1);
    }

    #[test]
    fn test_write_targets_first_read_shard() {
        let map = map(4, 2, vec![vec![1, 3], vec![2]]);
        for key in [&b"alpha"[..], b"beta", b"gamma", b""] {
            let reads = map.shards_for_lookup_hash(key);
            assert_eq!(map.shard_for_alias_write(key), reads[0]);
        }
    }

    #[test]
    fn test_prefix_routes_by_leading_byte() {
        let map = map(4, 2, vec![vec![0], vec![1], vec![2], vec![3]]);
        assert_eq!(
            map.shards_for_lookup_prefix(b"Catherine"),
            map.shards_for_lookup_prefix(b"Cat"),
        );
        assert_eq!(
            map.shard_for_prefix_write(b"Catherine"),
            map.shards_for_lookup_prefix(b"C")[0],
        );
    }

    #[test]
    fn test_root_insert_rotates() {
        let map = map(4, 2, vec![]);
        let first = map.shard_for_root_insert();
        let second = map.shard_for_root_insert();
        assert_ne!(first, second);
    }
}
