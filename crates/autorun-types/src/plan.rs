use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::{ActionKind, PlanItem};

pub const FEEDBACK_STEP_ID: &str = "confirm_satisfaction";
pub const FEEDBACK_STEP_TITLE: &str = "confirm satisfaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Waiting,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    /// A settled step no longer blocks dependents.
    pub fn is_settled(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Waiting => "waiting",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub brief: String,
    pub allow: BTreeSet<ActionKind>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        allow: impl IntoIterator<Item = ActionKind>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            brief: String::new(),
            allow: allow.into_iter().collect(),
            status: StepStatus::Pending,
            note: None,
        }
    }

    pub fn with_brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = brief.into();
        self
    }

    /// The trailing confirm-satisfaction step.
    pub fn feedback() -> Self {
        Self::new(FEEDBACK_STEP_ID, FEEDBACK_STEP_TITLE, [ActionKind::AskUser])
            .with_brief("Ask whether the result is satisfactory")
    }

    pub fn allows(&self, kind: ActionKind) -> bool {
        self.allow.contains(&kind)
    }

    pub fn is_terminal(&self) -> bool {
        self.allows(ActionKind::FinalOutput)
    }

    pub fn is_feedback(&self) -> bool {
        self.id == FEEDBACK_STEP_ID
    }

    /// Extracts `<target>` from titles shaped like `<prefix>:<target> rest`.
    pub fn title_target(&self, prefix: &str) -> Option<String> {
        let title = self.title.trim();
        let head = title.get(..prefix.len())?;
        if !head.eq_ignore_ascii_case(prefix) {
            return None;
        }
        let rest = title[prefix.len()..].trim_start().strip_prefix(':')?;
        let target = rest.split_whitespace().next()?.trim_matches(|c| c == '`' || c == '"');
        if target.is_empty() {
            None
        } else {
            Some(target.to_string())
        }
    }

    /// `<kind>:` title prefix, used when the planner omitted `allow`.
    pub fn title_kind(title: &str) -> Option<ActionKind> {
        let (head, _) = title.trim().split_once(':')?;
        ActionKind::parse(head)
    }
}

/// Parses allow-set strings, accepting aliases.
pub fn parse_allow<S: AsRef<str>>(raw: &[S]) -> Result<BTreeSet<ActionKind>, String> {
    let mut out = BTreeSet::new();
    for entry in raw {
        let entry = entry.as_ref();
        match ActionKind::parse(entry) {
            Some(kind) => {
                out.insert(kind);
            }
            None => return Err(entry.to_string()),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanInvariantError {
    Empty,
    MissingTerminal,
    MultipleTerminal(usize),
    TerminalNotLast { index: usize },
}

impl fmt::Display for PlanInvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "plan has no steps"),
            Self::MissingTerminal => write!(f, "plan has no final_output step"),
            Self::MultipleTerminal(n) => write!(f, "plan has {} final_output steps", n),
            Self::TerminalNotLast { index } => {
                write!(f, "final_output step at index {} is not the last step", index)
            }
        }
    }
}

impl std::error::Error for PlanInvariantError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PatchStep {
    pub title: String,
    #[serde(default)]
    pub brief: String,
    #[serde(default)]
    pub allow: Vec<String>,
}

/// In-place patch carried by an action. Either inserts steps right after the
/// cursor or replaces fields of the next step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlanPatch {
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insert_steps: Vec<PatchStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    TargetOutOfRange { step_index: usize, cursor: usize },
    Empty,
    TerminalInsert,
    ProtectedStep(String),
    TerminalRemoved,
    UnknownAllow(String),
    Invariant(PlanInvariantError),
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetOutOfRange { step_index, cursor } => write!(
                f,
                "plan_patch.step_index {} must be {} or an append",
                step_index,
                cursor + 1
            ),
            Self::Empty => write!(f, "plan_patch changes nothing"),
            Self::TerminalInsert => write!(f, "plan_patch may not add a final_output step"),
            Self::ProtectedStep(id) => write!(f, "step '{}' cannot be replaced", id),
            Self::TerminalRemoved => {
                write!(f, "plan_patch may not drop final_output from the last step")
            }
            Self::UnknownAllow(raw) => write!(f, "unknown action type '{}' in allow", raw),
            Self::Invariant(e) => write!(f, "plan_patch breaks plan: {}", e),
        }
    }
}

impl std::error::Error for PatchError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchEffect {
    Inserted { at: usize, count: usize },
    Replaced { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Plan {
    #[serde(default)]
    pub revision: u64,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Plan {
    pub fn new(steps: Vec<Step>, artifacts: Vec<String>) -> Self {
        Self {
            revision: 0,
            steps,
            artifacts,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Steps excluding the feedback trailer.
    pub fn work_steps(&self) -> impl Iterator<Item = (usize, &Step)> {
        self.steps.iter().enumerate().filter(|(_, s)| !s.is_feedback())
    }

    pub fn terminal_index(&self) -> Option<usize> {
        self.work_steps()
            .find(|(_, s)| s.is_terminal())
            .map(|(i, _)| i)
    }

    pub fn write_step_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.allows(ActionKind::WriteFile))
            .count()
    }

    pub fn bump(&mut self) {
        self.revision += 1;
    }

    /// At most one terminal step, and if present it is the last work step.
    pub fn check_terminal_position(&self) -> Result<(), PlanInvariantError> {
        let terminals: Vec<usize> = self
            .work_steps()
            .filter(|(_, s)| s.is_terminal())
            .map(|(i, _)| i)
            .collect();
        if terminals.len() > 1 {
            return Err(PlanInvariantError::MultipleTerminal(terminals.len()));
        }
        if let Some(&index) = terminals.first() {
            let last_work = self.work_steps().map(|(i, _)| i).last();
            if last_work != Some(index) {
                return Err(PlanInvariantError::TerminalNotLast { index });
            }
        }
        Ok(())
    }

    /// Full structural check for a freshly produced plan.
    pub fn validate(&self) -> Result<(), PlanInvariantError> {
        if self.work_steps().next().is_none() {
            return Err(PlanInvariantError::Empty);
        }
        self.check_terminal_position()?;
        if self.terminal_index().is_none() {
            return Err(PlanInvariantError::MissingTerminal);
        }
        Ok(())
    }

    pub fn unique_id(&self, base: &str) -> String {
        let existing: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        if !existing.contains(base) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}_{}", base, n);
            if !existing.contains(candidate.as_str()) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Inserts steps at `at`, rewriting colliding ids. Returns the count.
    pub fn insert_steps(&mut self, at: usize, steps: Vec<Step>) -> usize {
        let at = at.min(self.steps.len());
        let count = steps.len();
        for (offset, mut step) in steps.into_iter().enumerate() {
            step.id = self.unique_id(&step.id);
            self.steps.insert(at + offset, step);
        }
        count
    }

    /// Applies an action-carried patch relative to `cursor`. The plan is left
    /// untouched on error.
    pub fn apply_patch(
        &mut self,
        cursor: usize,
        patch: &PlanPatch,
    ) -> Result<PatchEffect, PatchError> {
        let next = cursor + 1;
        let is_append = patch.step_index >= self.steps.len() && patch.step_index > cursor;
        if patch.step_index != next && !is_append {
            return Err(PatchError::TargetOutOfRange {
                step_index: patch.step_index,
                cursor,
            });
        }

        let mut candidate = self.clone();
        let effect = if !patch.insert_steps.is_empty() {
            let mut steps = Vec::with_capacity(patch.insert_steps.len());
            for (i, raw) in patch.insert_steps.iter().enumerate() {
                let mut allow = parse_allow(&raw.allow).map_err(PatchError::UnknownAllow)?;
                if allow.is_empty() {
                    if let Some(kind) = Step::title_kind(&raw.title) {
                        allow.insert(kind);
                    }
                }
                if allow.contains(&ActionKind::FinalOutput) {
                    return Err(PatchError::TerminalInsert);
                }
                steps.push(
                    Step::new(format!("patch_{}_{}", self.revision, i + 1), &raw.title, allow)
                        .with_brief(&raw.brief),
                );
            }
            let at = if is_append {
                // Appends land before the feedback trailer.
                match candidate.steps.last() {
                    Some(last) if last.is_feedback() => candidate.steps.len() - 1,
                    _ => candidate.steps.len(),
                }
                .max(next)
            } else {
                next
            };
            let count = candidate.insert_steps(at, steps);
            PatchEffect::Inserted { at, count }
        } else {
            if patch.title.is_none() && patch.brief.is_none() && patch.allow.is_none() {
                return Err(PatchError::Empty);
            }
            // Field replacement only ever targets the step right after the cursor.
            if patch.step_index != next {
                return Err(PatchError::TargetOutOfRange {
                    step_index: patch.step_index,
                    cursor,
                });
            }
            let Some(step) = candidate.steps.get_mut(next) else {
                return Err(PatchError::TargetOutOfRange {
                    step_index: patch.step_index,
                    cursor,
                });
            };
            if step.is_feedback() {
                return Err(PatchError::ProtectedStep(step.id.clone()));
            }
            if let Some(title) = &patch.title {
                step.title = title.clone();
            }
            if let Some(brief) = &patch.brief {
                step.brief = brief.clone();
            }
            if let Some(raw) = &patch.allow {
                let allow = parse_allow(raw).map_err(PatchError::UnknownAllow)?;
                let keeps_terminal = allow.contains(&ActionKind::FinalOutput);
                if keeps_terminal && !step.is_terminal() {
                    return Err(PatchError::TerminalInsert);
                }
                if !keeps_terminal && step.is_terminal() {
                    return Err(PatchError::TerminalRemoved);
                }
                step.allow = allow;
            }
            step.status = StepStatus::Pending;
            PatchEffect::Replaced { index: next }
        };

        candidate
            .check_terminal_position()
            .map_err(PatchError::Invariant)?;
        candidate.bump();
        *self = candidate;
        Ok(effect)
    }

    /// Guarantees exactly one feedback step, at the tail. The first removed
    /// instance keeps its status so a resumed run does not re-ask.
    pub fn ensure_feedback_tail(&mut self) -> bool {
        let mut kept: Option<Step> = None;
        let last_is_feedback = self.steps.last().map(Step::is_feedback).unwrap_or(false);
        let feedback_count = self.steps.iter().filter(|s| s.is_feedback()).count();
        if last_is_feedback && feedback_count == 1 {
            return false;
        }
        self.steps.retain(|s| {
            if s.is_feedback() {
                if kept.is_none() {
                    kept = Some(s.clone());
                }
                false
            } else {
                true
            }
        });
        self.steps.push(kept.unwrap_or_else(Step::feedback));
        true
    }

    pub fn remove_feedback(&mut self) {
        self.steps.retain(|s| !s.is_feedback());
    }

    pub fn items(&self) -> Vec<PlanItem> {
        self.steps
            .iter()
            .enumerate()
            .map(|(order, step)| PlanItem::from_step(order, step))
            .collect()
    }
}
