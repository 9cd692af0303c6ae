//! Seams to the outside world: side-effecting executors and knowledge hints.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use autorun_types::{Action, ActionKind, AskUser, ToolCall};

/// Where an action runs, passed to every executor call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub task_id: String,
    pub run_id: String,
    pub step_index: usize,
    pub step_id: String,
    pub step_title: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub ok: bool,
    pub summary: String,
}

impl ActionOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            ok: true,
            summary: summary.into(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            ok: false,
            summary: summary.into(),
        }
    }
}

/// Performs file, shell, HTTP, tool and memory actions. This is the only
/// place real side effects happen.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, action: &Action) -> anyhow::Result<ActionOutcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HintQuery {
    pub message: String,
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Opaque retrieval output; `text` is pasted into prompts verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hints {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub solutions: Vec<String>,
}

impl Hints {
    pub fn is_cold(&self) -> bool {
        self.skills.is_empty() && self.tools.is_empty()
    }
}

#[async_trait]
pub trait KnowledgeHints: Send + Sync {
    async fn hints(&self, query: &HintQuery) -> anyhow::Result<Hints>;
}

/// Retrieval disabled.
pub struct NoHints;

#[async_trait]
impl KnowledgeHints for NoHints {
    async fn hints(&self, _query: &HintQuery) -> anyhow::Result<Hints> {
        Ok(Hints::default())
    }
}

/// Decides what happens to an `ask_user` action before it pauses the run.
pub trait ColdStartPolicy: Send + Sync {
    /// Returns a replacement action, or `None` to keep asking the user.
    fn override_ask(&self, ask: &AskUser, hints: &Hints, message: &str) -> Option<Action>;
}

/// With neither skills nor tools retrieved, drafts a skill instead of asking.
pub struct DraftSkillOnColdStart;

pub const DRAFT_SKILL_TOOL: &str = "skill.draft";

impl ColdStartPolicy for DraftSkillOnColdStart {
    fn override_ask(&self, ask: &AskUser, hints: &Hints, message: &str) -> Option<Action> {
        if !hints.is_cold() {
            return None;
        }
        Some(Action::ToolCall(ToolCall {
            tool: DRAFT_SKILL_TOOL.to_string(),
            args: json!({
                "goal": message,
                "open_question": ask.question,
            }),
        }))
    }
}

/// Always lets `ask_user` through.
pub struct KeepAskUser;

impl ColdStartPolicy for KeepAskUser {
    fn override_ask(&self, _ask: &AskUser, _hints: &Hints, _message: &str) -> Option<Action> {
        None
    }
}

/// Action kinds the engine handles itself instead of the executor.
pub fn is_engine_handled(kind: ActionKind) -> bool {
    matches!(
        kind,
        ActionKind::LlmCall | ActionKind::ParseJson | ActionKind::FinalOutput | ActionKind::AskUser
    )
}
