//! Background task driving [`CachePool::sweep_once`].

use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::CachePool;

/// Handle to a running sweep task.
///
/// The task only holds a weak reference to the pool and exits on its own
/// once the pool is dropped.
#[derive(Debug)]
pub(crate) struct Sweeper {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn spawn(pool: &Arc<CachePool>) -> Self {
        let shutdown = Arc::new(Notify::new());
        let period = pool.config().sweep_interval;
        let weak: Weak<CachePool> = Arc::downgrade(pool);
        let stop = Arc::clone(&shutdown);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = stop.notified() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = weak.upgrade() else { break };
                        let report = pool.sweep_once().await;
                        if report.is_empty() {
                            trace!("Sweep found nothing to do");
                        } else {
                            debug!(
                                flushed = report.flushed,
                                failures = report.flush_failures,
                                expired = report.expired_blocks,
                                dropped = report.dropped_files,
                                "Cache sweep"
                            );
                        }
                    }
                }
            }
            debug!("Cache sweeper stopped");
        });
        debug!(period = ?period, "Cache sweeper started");

        Self { shutdown, task }
    }

    /// Signals the task and waits for it to finish its current sweep.
    pub(crate) async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.task.await;
    }
}
