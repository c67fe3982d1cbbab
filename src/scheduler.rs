//! # Scheduler
//! Owns the background loops (polling, automation cycle, approval sweep).
//! Each loop runs on its own fixed-interval ticker and watches a shared stop
//! signal, so shutdown lands within one tick boundary instead of mid-scope.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct Scheduler {
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            handles: Vec::new(),
        }
    }

    /// Spawn a named loop that runs `task` every `every`. Task errors are
    /// logged and the loop keeps ticking; the next tick starts from a clean
    /// state.
    pub fn spawn_loop<F, Fut>(&mut self, name: &'static str, every: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(target: "scheduler", name, every_secs = every.as_secs_f64(), "loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task().await {
                            tracing::warn!(target: "scheduler", name, error = ?e, "tick failed");
                        }
                    }
                    res = stop_rx.changed() => {
                        if res.is_err() || *stop_rx.borrow() {
                            tracing::info!(target: "scheduler", name, "loop stopping");
                            break;
                        }
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Signal every loop to stop and wait for them to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
