// Submodules
pub mod error;
pub mod general;
pub mod shard;

pub use error::Error;
pub use general::General;
pub use shard::Shard;

use std::fs::read_to_string;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration for a shardhog store.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: General,

    /// The shards, in shard-number order. A shard's position in this
    /// list is its shard number; ids whose top `shard_bits` decode to
    /// that number live there.
    #[serde(default)]
    pub shards: Vec<Shard>,

    /// Probe plans for secondary lookup rows (alias digests, name
    /// prefixes, phonetic codes). A lookup key is hashed to one of
    /// these lists; writes go to the first shard in the list, reads
    /// probe the whole list in order. Listing an old shard after a new
    /// one lets lookups keep resolving while a key's home moves.
    #[serde(default)]
    pub lookup_insertion_plans: Vec<Vec<usize>>,

    /// Shards eligible to receive new rootless nodes, used round-robin.
    #[serde(default)]
    pub root_insert_shards: Vec<usize>,
}

impl Config {
    /// Load configuration from disk or use defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config: Config = if let Ok(config) = read_to_string(path) {
            let config = match toml::from_str(&config) {
                Ok(config) => config,
                Err(err) => return Err(Error::Toml(err)),
            };
            info!("loaded \"{}\"", path.display());
            config
        } else {
            warn!(
                "\"{}\" doesn't exist, loading defaults instead",
                path.display()
            );
            Config::default()
        };

        config.check()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn check(&self) -> Result<(), Error> {
        let shards = self.shards.len();

        if self.general.shard_bits == 0 || self.general.shard_bits > 16 {
            return Err(Error::Invalid(format!(
                "shard_bits must be between 1 and 16, got {}",
                self.general.shard_bits
            )));
        }

        if shards > (1 << self.general.shard_bits) {
            return Err(Error::Invalid(format!(
                "{} shards don't fit in {} shard bits",
                shards, self.general.shard_bits
            )));
        }

        for plan in &self.lookup_insertion_plans {
            if plan.is_empty() {
                return Err(Error::Invalid("empty lookup insertion plan".into()));
            }
            for shard in plan {
                if *shard >= shards {
                    return Err(Error::Invalid(format!(
                        "lookup insertion plan references unknown shard {}",
                        shard
                    )));
                }
            }
        }

        for shard in &self.root_insert_shards {
            if *shard >= shards {
                return Err(Error::Invalid(format!(
                    "root insert plan references unknown shard {}",
                    shard
                )));
            }
        }

        Ok(())
    }

    /// Decode the alias digest key.
    pub fn digest_key(&self) -> Result<Vec<u8>, Error> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        STANDARD
            .decode(&self.general.digest_key)
            .map_err(|_| Error::Invalid("digest_key is not valid base64".into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config_serializable() {
        let config = Config::default();
        toml::to_string(&config).unwrap();
    }

    #[test]
    fn test_parse() {
        let config: Config = toml::from_str(
            r#"
            lookup_insertion_plans = [[0], [1, 0]]
            root_insert_shards = [0, 1]

            [general]
            shard_bits = 4
            digest_key = "c2VjcmV0"

            [[shards]]
            host = "10.0.0.1"
            database_name = "hog0"

            [[shards]]
            host = "10.0.0.2"
            database_name = "hog1"
        "#,
        )
        .unwrap();

        config.check().unwrap();
        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.digest_key().unwrap(), b"secret");
        assert_eq!(config.lookup_insertion_plans[1], vec![1, 0]);
    }

    #[test]
    fn test_check_rejects_bad_plan() {
        let mut config = Config::default();
        config.shards.push(Shard::default());
        config.lookup_insertion_plans.push(vec![3]);
        assert!(config.check().is_err());
    }
}
