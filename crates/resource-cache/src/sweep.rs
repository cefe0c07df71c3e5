use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::CacheInner;

/// The shortest interval the sweep runs at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to the background task that periodically sweeps the cache.
pub(crate) struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(cache: Weak<CacheInner>, interval: Duration, runtime: &Handle) -> Self {
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run(cache, interval, cancel.clone()));
        Self { cancel, handle }
    }

    /// Signals the task to stop, without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stops the task and waits for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::error!(error = %err, "cache sweep task failed");
        }
    }
}

async fn run(cache: Weak<CacheInner>, interval: Duration, cancel: CancellationToken) {
    let interval = interval.max(MIN_INTERVAL);
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // the cache is gone, nothing left to sweep
        let Some(cache) = cache.upgrade() else {
            break;
        };
        cache.sweep();
    }
}
