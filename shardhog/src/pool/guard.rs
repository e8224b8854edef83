//! Connection guard.

use std::ops::{Deref, DerefMut};

use tokio::spawn;
use tracing::debug;

use super::Pool;
use crate::backend::Connection;

/// RAII wrapper around a checked-out connection. Returns the
/// connection to the pool on drop, rolling back any transaction it
/// was left in.
pub struct Guard {
    conn: Option<Box<dyn Connection>>,
    pool: Pool,
    shard: usize,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("shard", &self.shard)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl Guard {
    pub(super) fn new(pool: Pool, conn: Box<dyn Connection>, shard: usize) -> Self {
        Self {
            conn: Some(conn),
            pool,
            shard,
        }
    }

    pub fn shard(&self) -> usize {
        self.shard
    }
}

impl Deref for Guard {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &**self.conn.as_ref().unwrap()
    }
}

impl DerefMut for Guard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn.as_mut().unwrap()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let pool = self.pool.clone();
            let shard = self.shard;

            if conn.cancellation().is_cancelled() {
                debug!("dropping cancelled connection [shard {}]", shard);
            } else if conn.in_transaction() {
                // Can't await in Drop; roll back off to the side.
                spawn(async move {
                    if conn.rollback().await.is_ok() {
                        pool.checkin(shard, conn);
                    }
                });
            } else {
                pool.checkin(shard, conn);
            }
        }
    }
}
