//! Per-session heartbeat timer.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Emits a tick every window until cancelled or dropped.
pub struct HeartbeatMonitor {
    cancel: CancellationToken,
    ticks: mpsc::Receiver<Instant>,
}

impl HeartbeatMonitor {
    pub fn start(window: Duration) -> Self {
        let cancel = CancellationToken::new();
        let (tx, ticks) = mpsc::channel(1);

        let token = cancel.clone();
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + window, window);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    tick = interval.tick() => {
                        if tx.send(tick).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { cancel, ticks }
    }

    /// Next tick, or `None` once the monitor has stopped.
    pub async fn tick(&mut self) -> Option<Instant> {
        self.ticks.recv().await
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
