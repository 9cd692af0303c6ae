use std::time::Duration;

use tokio::time::Instant;

use autorun_types::{PlanItemChange, StreamEvent};

/// Throttles plan snapshots and plan deltas. Pending plan state is released
/// when the interval elapses, or right before an interactive or terminal
/// event.
pub struct Coalescer {
    interval: Duration,
    snapshot: Option<StreamEvent>,
    changes: Vec<PlanItemChange>,
    deadline: Option<Instant>,
}

impl Coalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            snapshot: None,
            changes: Vec::new(),
            deadline: None,
        }
    }

    /// Feeds one event and returns whatever should be delivered now.
    pub fn push(&mut self, event: StreamEvent, now: Instant) -> Vec<StreamEvent> {
        match event {
            StreamEvent::Plan { .. } => {
                // A snapshot already carries every pending status.
                self.changes.clear();
                self.snapshot = Some(event);
                self.arm(now);
                Vec::new()
            }
            StreamEvent::PlanDelta { changes } => {
                for change in changes {
                    match self.changes.iter_mut().find(|c| c.id == change.id) {
                        Some(pending) => pending.merge(change),
                        None => self.changes.push(change),
                    }
                }
                self.arm(now);
                Vec::new()
            }
            event if event.forces_flush() => {
                let mut out = self.flush();
                out.push(event);
                out
            }
            event => vec![event],
        }
    }

    /// When pending plan state is due, if any is held.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.changes.is_empty()
    }

    /// Releases pending plan state: the snapshot first, then merged changes.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        self.deadline = None;
        let mut out = Vec::new();
        if let Some(snapshot) = self.snapshot.take() {
            out.push(snapshot);
        }
        if !self.changes.is_empty() {
            out.push(StreamEvent::PlanDelta {
                changes: std::mem::take(&mut self.changes),
            });
        }
        out
    }

    fn arm(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autorun_types::{PauseKind, PlanItem, Step, StepStatus};

    fn change(id: &str, status: StepStatus) -> StreamEvent {
        StreamEvent::PlanDelta {
            changes: vec![PlanItemChange {
                id: id.to_string(),
                step_order: 0,
                status: Some(status),
                brief: None,
                title: None,
            }],
        }
    }

    #[test]
    fn deltas_merge_per_step_until_need_input() {
        let now = Instant::now();
        let mut coalescer = Coalescer::new(Duration::from_millis(250));
        assert!(coalescer.push(change("a", StepStatus::Running), now).is_empty());
        assert!(coalescer.push(change("b", StepStatus::Running), now).is_empty());
        assert!(coalescer.push(change("a", StepStatus::Done), now).is_empty());
        assert_eq!(coalescer.deadline(), Some(now + Duration::from_millis(250)));

        let out = coalescer.push(
            StreamEvent::NeedInput {
                question: "which file?".to_string(),
                kind: PauseKind::UserInput,
            },
            now,
        );
        assert_eq!(out.len(), 2);
        match &out[0] {
            StreamEvent::PlanDelta { changes } => {
                assert_eq!(changes.len(), 2);
                assert_eq!(changes[0].id, "a");
                assert_eq!(changes[0].status, Some(StepStatus::Done));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out[1].name(), "need_input");
        assert!(coalescer.is_empty());
        assert!(coalescer.deadline().is_none());
    }

    #[test]
    fn latest_snapshot_supersedes_pending_changes() {
        let now = Instant::now();
        let mut coalescer = Coalescer::new(Duration::from_millis(250));
        let step = Step::new("a", "draft notes", [autorun_types::ActionKind::LlmCall]);
        coalescer.push(change("a", StepStatus::Running), now);
        coalescer.push(
            StreamEvent::Plan {
                items: vec![PlanItem::from_step(0, &step)],
            },
            now,
        );
        let passthrough = coalescer.push(StreamEvent::delta("working"), now);
        assert_eq!(passthrough.len(), 1);

        let out = coalescer.flush();
        let names: Vec<&str> = out.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["plan"]);
    }
}
