//! Turns a run's step sequence into a throttled, cancellable event stream.

mod bridge;
mod coalesce;

use std::sync::Arc;

use async_trait::async_trait;

use autorun_types::StreamEvent;

use crate::pulse::PulseSink;

pub use bridge::{bridge, EventStream};
pub use coalesce::Coalescer;

/// Polled on every bridge tick; returning true aborts the run.
pub type StopCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// A cooperative producer of run events. `None` means the sequence is done.
#[async_trait]
pub trait StepSequence: Send {
    async fn next_event(&mut self) -> Option<anyhow::Result<StreamEvent>>;

    /// Called once the bridge no longer wants events, whether or not the
    /// sequence finished.
    async fn close(&mut self);

    fn bind_pulse(&mut self, _pulse: PulseSink) {}
}
