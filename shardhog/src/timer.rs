//! Per-operation deadline.
//!
//! A plan binds the timer to whichever connection it is about to use;
//! when the deadline fires, the currently-bound connection's in-flight
//! query is cancelled. The resulting "query canceled" driver error is
//! translated to [`Error::Timeout`](crate::Error::Timeout) when the
//! plan finishes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pool::Guard;
use crate::Error;

pub struct Timer {
    slot: Arc<Mutex<Option<CancellationToken>>>,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    /// `None` disables the timer without changing anything else.
    pub fn start(deadline: Option<Duration>) -> Self {
        let slot: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

        let task = deadline.map(|deadline| {
            let slot = slot.clone();
            tokio::spawn(async move {
                sleep(deadline).await;
                debug!("operation deadline fired after {:?}", deadline);
                if let Some(token) = slot.lock().as_ref() {
                    token.cancel();
                }
            })
        });

        Self { slot, task }
    }

    /// Point the deadline at this connection.
    pub fn bind(&self, conn: &Guard) {
        *self.slot.lock() = Some(conn.cancellation());
    }

    pub fn unbind(&self) {
        *self.slot.lock() = None;
    }

    /// Close the timer scope, translating a cancelled query into a
    /// timeout.
    pub fn finish<T>(self, result: Result<T, Error>) -> Result<T, Error> {
        match result {
            Err(err) if err.query_canceled() => Err(Error::Timeout),
            other => other,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend;

    #[tokio::test]
    async fn test_disabled_timer_is_inert() {
        let timer = Timer::start(None);
        assert!(timer.task.is_none());
        let result: Result<u32, Error> = timer.finish(Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_finish_translates_cancellation() {
        let timer = Timer::start(Some(Duration::from_secs(10)));
        let result: Result<(), Error> =
            timer.finish(Err(backend::Error::QueryCanceled.into()));
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
