//! The connection pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use aws_lc_rs::hmac;
use parking_lot::Mutex;
use tokio::spawn;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::{Error, Guard};
use crate::backend::{Backend, Connection};
use crate::sharding::ShardMap;
use shardhog_config::Config;

struct ShardPool {
    idle: Mutex<VecDeque<Box<dyn Connection>>>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    shards: Vec<ShardPool>,
    map: ShardMap,
    readonly: bool,
    digest_key: Vec<u8>,
    pool_size: usize,
    checkout_timeout: Duration,
    ready: tokio::sync::watch::Sender<bool>,
}

/// Hands out shard-pinned connections. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("shards", &self.inner.shards.len())
            .field("readonly", &self.inner.readonly)
            .finish()
    }
}

impl Pool {
    pub fn new(config: &Config, backend: Arc<dyn Backend>) -> Result<Self, crate::Error> {
        config.check()?;
        let map = ShardMap::new(config);
        let (ready, _) = tokio::sync::watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                shards: (0..map.shards())
                    .map(|_| ShardPool {
                        idle: Mutex::new(VecDeque::new()),
                    })
                    .collect(),
                map,
                readonly: config.general.readonly,
                digest_key: config.digest_key()?,
                pool_size: config.general.pool_size,
                checkout_timeout: config.general.checkout_timeout_duration(),
                ready,
            }),
        })
    }

    /// Warm one connection per shard in the background; the pool is
    /// ready once every shard has answered.
    pub fn start(&self) {
        let pool = self.clone();
        spawn(async move {
            for shard in 0..pool.inner.shards.len() {
                match pool.inner.backend.connect(shard).await {
                    Ok(conn) => pool.checkin(shard, conn),
                    Err(err) => {
                        error!("shard {} warmup failed: {}", shard, err);
                        return;
                    }
                }
            }
            info!("pool ready, {} shards", pool.inner.shards.len());
            let _ = pool.inner.ready.send(true);
        });
    }

    pub async fn wait_ready(&self, wait: Duration) -> Result<(), Error> {
        let mut ready = self.inner.ready.subscribe();
        timeout(wait, async {
            while !*ready.borrow_and_update() {
                if ready.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|_| Error::NotReady)
    }

    /// Checkout a connection to the home shard of `id`.
    pub async fn get_by_id(&self, id: i64, wait: Option<Duration>) -> Result<Guard, Error> {
        self.get_by_shard(self.inner.map.shard_by_id(id), wait).await
    }

    /// Checkout a connection pinned to a shard.
    pub async fn get_by_shard(&self, shard: usize, wait: Option<Duration>) -> Result<Guard, Error> {
        if shard >= self.inner.shards.len() {
            return Err(Error::UnknownShard(shard));
        }

        if let Some(conn) = self.inner.shards[shard].idle.lock().pop_front() {
            return Ok(Guard::new(self.clone(), conn, shard));
        }

        let wait = wait.unwrap_or(self.inner.checkout_timeout);
        let conn = timeout(wait, self.inner.backend.connect(shard))
            .await
            .map_err(|_| Error::CheckoutTimeout)??;

        Ok(Guard::new(self.clone(), conn, shard))
    }

    /// Return a connection to its shard's idle queue.
    pub(super) fn checkin(&self, shard: usize, conn: Box<dyn Connection>) {
        if conn.cancellation().is_cancelled() || conn.in_transaction() {
            debug!("discarding connection [shard {}]", shard);
            return;
        }

        let mut idle = self.inner.shards[shard].idle.lock();
        if idle.len() < self.inner.pool_size {
            idle.push_back(conn);
        }
    }

    /// All mutations are refused when set.
    pub fn readonly(&self) -> bool {
        self.inner.readonly
    }

    pub fn map(&self) -> &ShardMap {
        &self.inner.map
    }

    pub fn shard_bits(&self) -> u32 {
        self.inner.map.shard_bits()
    }

    /// HMAC-SHA1 digest of an alias under the pool's digest key.
    pub fn alias_digest(&self, alias: &str) -> Vec<u8> {
        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &self.inner.digest_key);
        hmac::sign(&key, alias.as_bytes()).as_ref().to_vec()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use shardhog_config::Shard;

    fn config(shards: usize) -> Config {
        let mut config = Config::default();
        config.general.shard_bits = 8;
        config.shards = (0..shards).map(|_| Shard::default()).collect();
        config
    }

    fn pool(shards: usize) -> (Pool, MemoryBackend) {
        let backend = MemoryBackend::new(shards, 8);
        let pool = Pool::new(&config(shards), Arc::new(backend.clone())).unwrap();
        (pool, backend)
    }

    #[tokio::test]
    async fn test_checkout_and_checkin() {
        let (pool, _) = pool(2);
        let conn = pool.get_by_shard(1, None).await.unwrap();
        assert_eq!(conn.shard(), 1);
        drop(conn);

        // The connection went back to the idle queue.
        assert_eq!(pool.inner.shards[1].idle.lock().len(), 1);
        let _conn = pool.get_by_shard(1, None).await.unwrap();
        assert_eq!(pool.inner.shards[1].idle.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_shard() {
        let (pool, _) = pool(2);
        assert!(matches!(
            pool.get_by_shard(7, None).await,
            Err(Error::UnknownShard(7))
        ));
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let (pool, _) = pool(2);
        pool.start();
        pool.wait_ready(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_digest_is_keyed() {
        let backend = MemoryBackend::new(1, 8);
        let mut config = config(1);
        config.general.digest_key = "a2V5LW9uZQ==".into(); // "key-one"
        let one = Pool::new(&config, Arc::new(backend.clone())).unwrap();
        config.general.digest_key = "a2V5LXR3bw==".into(); // "key-two"
        let two = Pool::new(&config, Arc::new(backend)).unwrap();

        assert_eq!(one.alias_digest("hello").len(), 20);
        assert_ne!(one.alias_digest("hello"), two.alias_digest("hello"));
    }
}
