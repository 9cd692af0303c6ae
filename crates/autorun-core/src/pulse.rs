use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Liveness channel from long-blocking work (planning, reflection) to the
/// stream bridge, which turns each beat into a heartbeat event.
#[derive(Debug, Clone, Default)]
pub struct PulseSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl PulseSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink nobody listens to.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn beat(&self, label: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(label.to_string());
        }
    }

    /// Drives `work` to completion, beating every `period` while it runs.
    pub async fn while_running<F>(&self, label: &str, period: Duration, work: F) -> F::Output
    where
        F: Future,
    {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => self.beat(label),
            }
        }
    }
}
