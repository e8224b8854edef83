//! Two-phase commit.
//!
//! One [`TwoPc`] drives one prepared transaction on one shard. The
//! lifecycle matches how the plans use it: `begin` opens the
//! transaction and yields the connection for local work, `exit`
//! prepares (or rolls back) and returns the connection, and once the
//! other shards' work has run, [`TwoPc::elsewhere`] commits the
//! prepared transaction on success or rolls it back on failure.

use rand::Rng;
use tracing::{debug, error};

use crate::pool::{Guard, Pool};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Open,
    Prepared,
    Committed,
    RolledBack,
}

pub struct TwoPc {
    pool: Pool,
    shard: usize,
    xid: String,
    failed: bool,
    state: State,
}

impl TwoPc {
    /// Build a handle for `shard`. The transaction id is derived from
    /// a random 31-bit number, the operation name, and up to 64 bytes
    /// of operation-unique data.
    pub fn new(pool: &Pool, shard: usize, name: &str, uniq_data: &[String]) -> Self {
        let uniq: String = uniq_data.join("-").chars().take(64).collect();
        let random: u32 = rand::rng().random_range(0..(1 << 31));
        let xid = format!("{}_{}_{}", random, name, uniq);

        Self {
            pool: pool.clone(),
            shard,
            xid,
            failed: false,
            state: State::Init,
        }
    }

    pub fn xid(&self) -> &str {
        &self.xid
    }

    /// Open the distributed transaction and yield the connection for
    /// the first shard's work.
    pub async fn begin(&mut self) -> Result<Guard, Error> {
        let mut conn = self.pool.get_by_shard(self.shard, None).await?;
        conn.tpc_begin(&self.xid).await?;
        self.state = State::Open;
        debug!("two-phase begin '{}' [shard {}]", self.xid, self.shard);
        Ok(conn)
    }

    /// Mark the handle so every subsequent exit rolls back.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Close the first shard's scope. Prepares the transaction when
    /// the enclosed work succeeded and the handle wasn't failed;
    /// rolls back otherwise. The connection goes back to the pool
    /// either way.
    pub async fn exit(&mut self, mut conn: Guard, ok: bool) -> Result<(), Error> {
        if self.failed || !ok {
            self.failed = true;
            self.state = State::RolledBack;
            conn.rollback().await?;
        } else {
            conn.tpc_prepare().await?;
            self.state = State::Prepared;
            debug!("two-phase prepared '{}' [shard {}]", self.xid, self.shard);
        }
        Ok(())
    }

    /// Finalize after the remaining shards' work ran. Commits the
    /// prepared transaction when the work succeeded and the handle
    /// wasn't failed; rolls it back otherwise, re-raising the work's
    /// error after rollback.
    pub async fn elsewhere<T>(&mut self, outcome: Result<T, Error>) -> Result<T, Error> {
        match outcome {
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    error!(
                        "two-phase rollback of '{}' failed: {} [shard {}]",
                        self.xid, rollback_err, self.shard
                    );
                }
                Err(err)
            }
            Ok(value) => {
                if self.failed {
                    self.rollback().await?;
                } else if self.state == State::Prepared {
                    self.commit().await?;
                } else {
                    return Err(Error::TwoPcFailed);
                }
                Ok(value)
            }
        }
    }

    /// Commit the prepared transaction.
    pub async fn commit(&mut self) -> Result<(), Error> {
        if self.state == State::Prepared {
            let mut conn = self.pool.get_by_shard(self.shard, None).await?;
            conn.tpc_commit(&self.xid).await?;
            self.state = State::Committed;
            debug!("two-phase commit '{}' [shard {}]", self.xid, self.shard);
        }
        Ok(())
    }

    /// Roll back the transaction, prepared or not.
    pub async fn rollback(&mut self) -> Result<(), Error> {
        self.failed = true;
        if matches!(self.state, State::Open | State::Prepared) {
            self.state = State::RolledBack;
            let mut conn = self.pool.get_by_shard(self.shard, None).await?;
            conn.tpc_rollback(&self.xid).await?;
            debug!("two-phase rollback '{}' [shard {}]", self.xid, self.shard);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::storage::Stored;
    use shardhog_config::{Config, Shard};
    use std::sync::Arc;

    fn pool() -> (Pool, MemoryBackend) {
        let backend = MemoryBackend::new(2, 8);
        let mut config = Config::default();
        config.general.shard_bits = 8;
        config.shards = vec![Shard::default(), Shard::default()];
        let pool = Pool::new(&config, Arc::new(backend.clone())).unwrap();
        (pool, backend)
    }

    #[tokio::test]
    async fn test_prepare_then_commit() {
        let (pool, backend) = pool();
        let mut tpc = TwoPc::new(&pool, 0, "test", &["1".into()]);

        let mut conn = tpc.begin().await.unwrap();
        conn.insert_node(1, &Stored::Null, 0).await.unwrap();
        tpc.exit(conn, true).await.unwrap();
        assert_eq!(backend.prepared_transactions(), 1);

        tpc.elsewhere(Ok(())).await.unwrap();
        assert_eq!(backend.prepared_transactions(), 0);
        assert_eq!(backend.live_counts(0).nodes, 1);
    }

    #[tokio::test]
    async fn test_elsewhere_failure_rolls_back() {
        let (pool, backend) = pool();
        let mut tpc = TwoPc::new(&pool, 0, "test", &["2".into()]);

        let mut conn = tpc.begin().await.unwrap();
        conn.insert_node(1, &Stored::Null, 0).await.unwrap();
        tpc.exit(conn, true).await.unwrap();

        let outcome: Result<(), Error> = Err(Error::BadContext(9));
        assert!(tpc.elsewhere(outcome).await.is_err());
        assert_eq!(backend.prepared_transactions(), 0);
        assert_eq!(backend.live_counts(0).nodes, 0);
    }

    #[tokio::test]
    async fn test_failed_handle_rolls_back_on_exit() {
        let (pool, backend) = pool();
        let mut tpc = TwoPc::new(&pool, 0, "test", &["3".into()]);

        let mut conn = tpc.begin().await.unwrap();
        conn.insert_node(1, &Stored::Null, 0).await.unwrap();
        tpc.fail();
        tpc.exit(conn, true).await.unwrap();

        assert_eq!(backend.prepared_transactions(), 0);
        assert_eq!(backend.live_counts(0).nodes, 0);
    }

    #[test]
    fn test_xid_truncates_uniq_data() {
        let (pool, _) = pool();
        // uniq data well past 64 chars still yields a bounded xid
        let long: Vec<String> = (0..40).map(|n| n.to_string()).collect();
        let tpc = TwoPc::new(&pool, 0, "bulky", &long);
        assert!(tpc.xid().len() <= "2147483647_bulky_".len() + 64);
        assert!(tpc.xid().contains("_bulky_"));
    }
}
