mod action;
mod event;
mod plan;
mod provider;
mod run;
mod state;

pub use action::*;
pub use event::*;
pub use plan::*;
pub use provider::*;
pub use run::*;
pub use state::*;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
