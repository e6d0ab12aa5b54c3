//! Durable timers.
//!
//! Deadlines are rows in the store, not in-process timers, so any instance can
//! fire them and nothing is lost across restarts. A [`Timer`] just asks its
//! [`DueSource`] to fire whatever is due, once on start and then every tick.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{clock::Clock, error::Error};

pub trait DueSource: Send + Sync + 'static {
    /// Fires every entry due at `now`, returning how many were fired.
    fn fire_due<'a>(&'a self, now: DateTime<Utc>) -> BoxFuture<'a, Result<usize, Error>>;
}

pub struct Timer {
    name: &'static str,
    source: Arc<dyn DueSource>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

impl Timer {
    pub fn new(
        name: &'static str,
        source: Arc<dyn DueSource>,
        clock: Arc<dyn Clock>,
        tick: Duration,
    ) -> Self {
        Self {
            name,
            source,
            clock,
            tick,
        }
    }

    /// Runs until `cancel` fires. Errors are logged and retried on the next
    /// tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(timer = self.name, "timer starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.source.fire_due(self.clock.now()).await {
                Ok(0) => {}
                Ok(fired) => debug!(timer = self.name, fired, "fired due entries"),
                Err(error) => error!(timer = self.name, error = %error, "firing due entries failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.tick) => {}
                () = cancel.cancelled() => break,
            }
        }

        info!(timer = self.name, "timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::clock::SystemClock;

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl DueSource for Counting {
        fn fire_due<'a>(&'a self, _now: DateTime<Utc>) -> BoxFuture<'a, Result<usize, Error>> {
            Box::pin(async move {
                let calls = self.calls.fetch_add(1, Ordering::SeqCst);
                if calls == 0 {
                    Err(Error::invalid_parameter("first tick fails"))
                } else {
                    Ok(1)
                }
            })
        }
    }

    #[tokio::test]
    async fn test_timer_keeps_ticking_after_errors() {
        let source = Arc::new(Counting::default());
        let timer = Timer::new(
            "test",
            source.clone(),
            Arc::new(SystemClock),
            Duration::from_millis(5),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { timer.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(source.calls.load(Ordering::SeqCst) >= 2);
    }
}
