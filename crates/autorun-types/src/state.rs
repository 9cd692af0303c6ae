use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{now_ms, ActionKind, Plan};

pub const STATE_VERSION: u32 = 1;
pub const MAX_FAILURE_SIGNATURES: usize = 20;
pub const MAX_PERSISTED_OBSERVATIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Do,
    Think,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    UserInput,
    Feedback,
}

impl PauseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseKind::UserInput => "user_input",
            PauseKind::Feedback => "feedback",
        }
    }
}

/// Where a paused run resumes and what it asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseInfo {
    pub question: String,
    pub kind: PauseKind,
    pub step_index: usize,
    /// Think mode: the batch that was in flight when the pause happened.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch: Vec<usize>,
    pub paused_at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCounters {
    #[serde(default)]
    pub replan_attempts: u32,
    #[serde(default)]
    pub artifact_autofix_attempts: u32,
    #[serde(default)]
    pub reflection_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub signature: String,
    pub hits: u32,
    pub last_seen_ms: u64,
}

/// Hit counters for normalised failure signatures, most recent last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureLedger {
    entries: Vec<FailureEntry>,
}

impl FailureLedger {
    /// Records one hit and returns the updated count.
    pub fn record(&mut self, signature: &str) -> u32 {
        let now = now_ms();
        let hits = match self.entries.iter().position(|e| e.signature == signature) {
            Some(pos) => {
                let mut entry = self.entries.remove(pos);
                entry.hits += 1;
                entry.last_seen_ms = now;
                let hits = entry.hits;
                self.entries.push(entry);
                hits
            }
            None => {
                self.entries.push(FailureEntry {
                    signature: signature.to_string(),
                    hits: 1,
                    last_seen_ms: now,
                });
                1
            }
        };
        if self.entries.len() > MAX_FAILURE_SIGNATURES {
            let overflow = self.entries.len() - MAX_FAILURE_SIGNATURES;
            self.entries.drain(..overflow);
        }
        hits
    }

    pub fn hits(&self, signature: &str) -> u32 {
        self.entries
            .iter()
            .find(|e| e.signature == signature)
            .map(|e| e.hits)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FailureEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub step_index: usize,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ActionKind>,
    pub ok: bool,
    pub summary: String,
    pub ts_ms: u64,
}

impl Observation {
    pub fn new(
        step_index: usize,
        step_id: impl Into<String>,
        kind: Option<ActionKind>,
        ok: bool,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            step_index,
            step_id: step_id.into(),
            kind,
            ok,
            summary: summary.into(),
            ts_ms: now_ms(),
        }
    }

    pub fn render(&self) -> String {
        let status = if self.ok { "ok" } else { "failed" };
        match self.kind {
            Some(kind) => format!(
                "[{}#{} {} {}] {}",
                self.step_id, self.step_index, kind, status, self.summary
            ),
            None => format!("[{}#{} {}] {}", self.step_id, self.step_index, status, self.summary),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationLog {
    entries: Vec<Observation>,
}

impl ObservationLog {
    pub fn push(&mut self, observation: Observation) {
        self.entries.push(observation);
        if self.entries.len() > MAX_PERSISTED_OBSERVATIONS {
            let overflow = self.entries.len() - MAX_PERSISTED_OBSERVATIONS;
            self.entries.drain(..overflow);
        }
    }

    pub fn recent(&self, n: usize) -> &[Observation] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorRole {
    Doc,
    Code,
    Test,
    Generic,
}

impl ExecutorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorRole::Doc => "doc",
            ExecutorRole::Code => "code",
            ExecutorRole::Test => "test",
            ExecutorRole::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub candidate_id: String,
    pub planners: Vec<String>,
}

/// Think-mode fields. Step keys are plan indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(default)]
    pub votes: Vec<VoteRecord>,
    #[serde(default)]
    pub alternatives: Vec<Plan>,
    #[serde(default)]
    pub dependencies: BTreeMap<usize, Vec<usize>>,
    #[serde(default)]
    pub roles: BTreeMap<usize, ExecutorRole>,
}

impl ThinkState {
    pub fn deps_of(&self, index: usize) -> &[usize] {
        self.dependencies
            .get(&index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn role_of(&self, index: usize) -> ExecutorRole {
        self.roles
            .get(&index)
            .copied()
            .unwrap_or(ExecutorRole::Generic)
    }

    /// Shifts indices after `failed` by `count` fix steps inserted right after
    /// it. Dependents of the failed step now wait on the last fix step, and fix
    /// steps inherit the failed step's own edges.
    pub fn insert_fix_steps(&mut self, failed: usize, count: usize) {
        if count == 0 {
            return;
        }
        let shift = |i: usize| if i > failed { i + count } else { i };
        let last_fix = failed + count;

        let mut deps = BTreeMap::new();
        for (step, edges) in std::mem::take(&mut self.dependencies) {
            let mut edges: Vec<usize> = edges
                .into_iter()
                .map(|d| if d == failed { last_fix } else { shift(d) })
                .collect();
            edges.sort_unstable();
            edges.dedup();
            deps.insert(shift(step), edges);
        }
        let inherited = deps.get(&failed).cloned().unwrap_or_default();
        let role = self.roles.get(&failed).copied();
        for k in 1..=count {
            let mut edges = inherited.clone();
            if k > 1 {
                edges.push(failed + k - 1);
            }
            deps.insert(failed + k, edges);
        }
        self.dependencies = deps;

        let mut roles = BTreeMap::new();
        for (step, r) in std::mem::take(&mut self.roles) {
            roles.insert(shift(step), r);
        }
        if let Some(role) = role {
            for k in 1..=count {
                roles.insert(failed + k, role);
            }
        }
        self.roles = roles;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackState {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_answer: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for FeedbackState {
    fn default() -> Self {
        Self {
            enabled: true,
            rounds: 0,
            last_answer: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_llm_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(default)]
    pub synthesized: bool,
}

/// Mutable checkpointed state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default = "state_version")]
    pub version: u32,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub cursor: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseInfo>,
    #[serde(default)]
    pub recovery: RecoveryCounters,
    #[serde(default)]
    pub failures: FailureLedger,
    #[serde(default)]
    pub observations: ObservationLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think: Option<ThinkState>,
    #[serde(default)]
    pub feedback: FeedbackState,
    #[serde(default)]
    pub output: OutputState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_failure: Option<String>,
}

fn state_version() -> u32 {
    STATE_VERSION
}

impl AgentState {
    pub fn new(mode: RunMode) -> Self {
        Self {
            version: STATE_VERSION,
            mode,
            cursor: 0,
            pause: None,
            recovery: RecoveryCounters::default(),
            failures: FailureLedger::default(),
            observations: ObservationLog::default(),
            think: match mode {
                RunMode::Think => Some(ThinkState::default()),
                RunMode::Do => None,
            },
            feedback: FeedbackState::default(),
            output: OutputState::default(),
            critical_failure: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new(RunMode::Do)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_ledger_caps_distinct_signatures() {
        let mut ledger = FailureLedger::default();
        for i in 0..25 {
            ledger.record(&format!("sig-{}", i));
        }
        assert_eq!(ledger.len(), MAX_FAILURE_SIGNATURES);
        assert_eq!(ledger.hits("sig-0"), 0);
        assert_eq!(ledger.hits("sig-24"), 1);
        assert_eq!(ledger.record("sig-24"), 2);
    }

    #[test]
    fn failure_ledger_refreshes_recency_on_hit() {
        let mut ledger = FailureLedger::default();
        ledger.record("old");
        for i in 0..19 {
            ledger.record(&format!("sig-{}", i));
        }
        ledger.record("old");
        ledger.record("newest");
        assert_eq!(ledger.hits("old"), 2);
        assert_eq!(ledger.hits("sig-0"), 0);
    }

    #[test]
    fn observation_log_recent_window() {
        let mut log = ObservationLog::default();
        for i in 0..70 {
            log.push(Observation::new(i, format!("s{}", i), None, true, "ok"));
        }
        assert_eq!(log.len(), MAX_PERSISTED_OBSERVATIONS);
        let recent = log.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].step_index, 69);
    }

    #[test]
    fn insert_fix_steps_remaps_dependencies() {
        let mut think = ThinkState::default();
        // 0 -> 1 -> 2, and 3 depends on 1
        think.dependencies.insert(1, vec![0]);
        think.dependencies.insert(2, vec![1]);
        think.dependencies.insert(3, vec![1, 2]);
        think.roles.insert(1, ExecutorRole::Code);
        think.roles.insert(3, ExecutorRole::Test);

        think.insert_fix_steps(1, 2);

        assert_eq!(think.deps_of(2), &[0]);
        assert_eq!(think.deps_of(3), &[0, 2]);
        assert_eq!(think.deps_of(4), &[3]);
        assert_eq!(think.deps_of(5), &[3, 4]);
        assert_eq!(think.role_of(2), ExecutorRole::Code);
        assert_eq!(think.role_of(5), ExecutorRole::Test);
    }

    #[test]
    fn state_deserializes_from_sparse_json() {
        let state: AgentState = serde_json::from_str(r#"{"mode":"think","cursor":2}"#).unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.mode, RunMode::Think);
        assert!(state.feedback.enabled);
        assert!(state.think.is_none());
    }
}
