use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings that apply to the store as a whole.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct General {
    /// Number of high bits of an object id that select its home shard.
    ///
    /// _Default:_ `8`
    #[serde(default = "General::shard_bits")]
    pub shard_bits: u32,

    /// Base64-encoded HMAC key for alias digests. All stores sharing a
    /// dataset must agree on this value.
    #[serde(default)]
    pub digest_key: String,

    /// Reject all mutations with a read-only error.
    ///
    /// _Default:_ `false`
    #[serde(default)]
    pub readonly: bool,

    /// Maximum number of idle connections kept per shard.
    ///
    /// _Default:_ `10`
    #[serde(default = "General::pool_size")]
    pub pool_size: usize,

    /// How long to wait for a connection checkout, in milliseconds.
    ///
    /// _Default:_ `5000`
    #[serde(default = "General::checkout_timeout")]
    pub checkout_timeout: u64,
}

impl General {
    fn shard_bits() -> u32 {
        8
    }

    fn pool_size() -> usize {
        10
    }

    fn checkout_timeout() -> u64 {
        5_000
    }

    pub fn checkout_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout)
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            shard_bits: Self::shard_bits(),
            digest_key: String::new(),
            readonly: false,
            pool_size: Self::pool_size(),
            checkout_timeout: Self::checkout_timeout(),
        }
    }
}
