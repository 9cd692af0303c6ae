//! Scripted collaborators shared by the crate's tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use autorun_providers::{AdaptiveLimiter, LimiterConfig, LlmClient, LlmGateway, LlmRequest, LlmResponse};
use autorun_types::{Action, ActionKind, ModelSpec};

use crate::collaborators::{ActionExecutor, ActionOutcome, ExecutionContext, HintQuery, Hints, KnowledgeHints};

struct Rule {
    needle: String,
    model: Option<String>,
    replies: VecDeque<Result<String, String>>,
}

/// Answers prompts by substring match. Each rule replays its queued replies
/// in order and repeats the last one forever.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, String)>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, needle: &str, model: Option<&str>, reply: Result<String, String>) {
        let mut rules = self.rules.lock().unwrap();
        match rules
            .iter_mut()
            .find(|r| r.needle == needle && r.model.as_deref() == model)
        {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                needle: needle.to_string(),
                model: model.map(str::to_string),
                replies: VecDeque::from([reply]),
            }),
        }
    }

    pub fn reply(&self, needle: &str, text: &str) {
        self.push(needle, None, Ok(text.to_string()));
    }

    pub fn reply_for_model(&self, model_id: &str, needle: &str, text: &str) {
        self.push(needle, Some(model_id), Ok(text.to_string()));
    }

    pub fn fail(&self, needle: &str, error: &str) {
        self.push(needle, None, Err(error.to_string()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Model ids of calls whose prompt contains `needle`.
    pub fn models_for(&self, needle: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.contains(needle))
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.prompts().iter().filter(|p| p.contains(needle)).count()
    }

    fn answer(&self, prompt: &str, model_id: &str) -> Result<String, String> {
        let mut rules = self.rules.lock().unwrap();
        let specific = rules
            .iter()
            .position(|r| r.model.as_deref() == Some(model_id) && prompt.contains(&r.needle));
        let generic = || {
            rules
                .iter()
                .position(|r| r.model.is_none() && prompt.contains(&r.needle))
        };
        let Some(index) = specific.or_else(generic) else {
            return Err(format!("no scripted reply for prompt: {}", prompt));
        };
        let replies = &mut rules[index].replies;
        if replies.len() > 1 {
            replies.pop_front().unwrap()
        } else {
            replies.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((request.model.model_id.clone(), request.prompt.clone()));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.answer(&request.prompt, &request.model.model_id) {
            Ok(text) => Ok(LlmResponse {
                text,
                call_id: format!("call-{}", self.calls.lock().unwrap().len()),
            }),
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

pub fn gateway(llm: Arc<ScriptedLlm>) -> LlmGateway {
    gateway_with_timeout(llm, Duration::from_secs(60))
}

pub fn gateway_with_timeout(llm: Arc<ScriptedLlm>, timeout: Duration) -> LlmGateway {
    LlmGateway::new(
        llm,
        AdaptiveLimiter::new(LimiterConfig::default()),
        ModelSpec::default(),
        timeout,
    )
}

/// Executes file actions inside its root; everything else succeeds with a
/// canned summary unless a failure was queued for that action kind.
#[derive(Default)]
pub struct RecordingExecutor {
    root: PathBuf,
    actions: Mutex<Vec<Action>>,
    failures: Mutex<HashMap<ActionKind, VecDeque<String>>>,
}

impl RecordingExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            ..Default::default()
        })
    }

    pub fn fail_next(&self, kind: ActionKind, error: &str) {
        self.failures
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(error.to_string());
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.actions().iter().map(Action::kind).collect()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, _ctx: &ExecutionContext, action: &Action) -> anyhow::Result<ActionOutcome> {
        self.actions.lock().unwrap().push(action.clone());
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&action.kind())
            .and_then(VecDeque::pop_front);
        if let Some(error) = queued {
            anyhow::bail!(error);
        }
        match action {
            Action::WriteFile(w) => {
                let path = self.root.join(&w.path);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &w.content).await?;
                Ok(ActionOutcome::ok(format!("wrote {} bytes to {}", w.content.len(), w.path)))
            }
            Action::ReadFile(p) => {
                let content = tokio::fs::read_to_string(self.root.join(&p.path)).await?;
                Ok(ActionOutcome::ok(content))
            }
            Action::ShellCommand(s) => Ok(ActionOutcome::ok(format!("$ {}\nexit 0", s.command))),
            other => Ok(ActionOutcome::ok(other.describe())),
        }
    }
}

pub struct FixedHints(pub Hints);

#[async_trait]
impl KnowledgeHints for FixedHints {
    async fn hints(&self, query: &HintQuery) -> anyhow::Result<Hints> {
        let mut hints = self.0.clone();
        if !query.filters.is_empty() {
            hints.text = format!("{}\nfilters: {}", hints.text, query.filters.join(","));
        }
        Ok(hints)
    }
}
