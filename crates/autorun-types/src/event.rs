use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{ActionKind, PauseKind, Step, StepStatus};

/// UI projection of one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: String,
    pub step_order: usize,
    pub title: String,
    pub brief: String,
    pub status: StepStatus,
    pub allow: BTreeSet<ActionKind>,
}

impl PlanItem {
    pub fn from_step(step_order: usize, step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            step_order,
            title: step.title.clone(),
            brief: step.brief.clone(),
            status: step.status,
            allow: step.allow.clone(),
        }
    }
}

/// Incremental change to one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItemChange {
    pub id: String,
    pub step_order: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl PlanItemChange {
    pub fn status(step_order: usize, step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            step_order,
            status: Some(step.status),
            brief: None,
            title: None,
        }
    }

    /// Folds a later change for the same step into this one.
    pub fn merge(&mut self, later: PlanItemChange) {
        self.step_order = later.step_order;
        if later.status.is_some() {
            self.status = later.status;
        }
        if later.brief.is_some() {
            self.brief = later.brief;
        }
        if later.title.is_some() {
            self.title = later.title;
        }
    }
}

/// Events delivered to a live client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    RunCreated {
        task_id: String,
        run_id: String,
    },
    Plan {
        items: Vec<PlanItem>,
    },
    PlanDelta {
        changes: Vec<PlanItemChange>,
    },
    Delta {
        text: String,
    },
    NeedInput {
        question: String,
        kind: PauseKind,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Error {
        message: String,
    },
    Heartbeat {
        ts_ms: u64,
    },
}

impl StreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        StreamEvent::Delta { text: text.into() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::RunCreated { .. } => "run_created",
            StreamEvent::Plan { .. } => "plan",
            StreamEvent::PlanDelta { .. } => "plan_delta",
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::NeedInput { .. } => "need_input",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Interactive or terminal events force pending coalesced state out first.
    pub fn forces_flush(&self) -> bool {
        matches!(
            self,
            StreamEvent::NeedInput { .. } | StreamEvent::Done { .. } | StreamEvent::Error { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_is_tagged_by_type() {
        let event = StreamEvent::NeedInput {
            question: "ok?".to_string(),
            kind: PauseKind::Feedback,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "need_input");
        assert_eq!(value["kind"], "feedback");
    }

    #[test]
    fn merge_keeps_latest_fields() {
        let mut change = PlanItemChange {
            id: "s1".to_string(),
            step_order: 0,
            status: Some(StepStatus::Running),
            brief: Some("first".to_string()),
            title: None,
        };
        change.merge(PlanItemChange {
            id: "s1".to_string(),
            step_order: 0,
            status: Some(StepStatus::Done),
            brief: None,
            title: Some("renamed".to_string()),
        });
        assert_eq!(change.status, Some(StepStatus::Done));
        assert_eq!(change.brief.as_deref(), Some("first"));
        assert_eq!(change.title.as_deref(), Some("renamed"));
    }
}
