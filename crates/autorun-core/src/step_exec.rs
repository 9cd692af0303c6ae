//! One step attempt: generate an action, normalise and gate it, execute it.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::Level;

use autorun_observability::{emit_event, ObservabilityEvent, ProcessKind};
use autorun_providers::{CallParams, CallTag, LlmGateway, RetryPolicy};
use autorun_types::{
    Action, ActionEnvelope, ActionKind, ModelSpec, Observation, Plan, PlanPatch, RawAction, Step,
};

use crate::collaborators::{ActionExecutor, ColdStartPolicy, ExecutionContext, Hints};
use crate::config::EngineConfig;
use crate::plan::{normalize_path, parse_lenient};
use crate::prompt::{self, ActionPromptInput};
use crate::recovery::FailureClass;

const COMPONENT: &str = "step_executor";
const OBSERVATION_MAX_CHARS: usize = 600;

/// Everything one step attempt needs, owned so attempts can run on their own
/// tasks in think mode.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub task_id: String,
    pub run_id: String,
    pub message: String,
    pub plan: Plan,
    pub index: usize,
    pub observations: Vec<Observation>,
    pub hints: Arc<Hints>,
    pub last_llm_response: Option<String>,
    /// Role override for this step's LLM calls.
    pub model: Option<ModelSpec>,
    pub temperature: Option<f32>,
}

impl StepRequest {
    fn step(&self) -> Option<&Step> {
        self.plan.get(self.index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        kind: ActionKind,
        summary: String,
        llm_text: Option<String>,
        patch: Option<PlanPatch>,
    },
    NeedsInput {
        question: String,
    },
    Final {
        content: String,
    },
    Failed {
        class: FailureClass,
        kind: Option<ActionKind>,
        message: String,
    },
}

#[derive(Debug, Clone)]
enum GenError {
    Llm(String),
    Invalid(String),
}

impl fmt::Display for GenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenError::Llm(e) => write!(f, "action generation call failed: {}", e),
            GenError::Invalid(e) => write!(f, "invalid action: {}", e),
        }
    }
}

#[derive(Clone)]
pub struct StepExecutor {
    gateway: LlmGateway,
    executor: Arc<dyn ActionExecutor>,
    policy: Arc<dyn ColdStartPolicy>,
    config: Arc<EngineConfig>,
}

impl StepExecutor {
    pub fn new(
        gateway: LlmGateway,
        executor: Arc<dyn ActionExecutor>,
        policy: Arc<dyn ColdStartPolicy>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            gateway,
            executor,
            policy,
            config,
        }
    }

    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    pub async fn run_step(&self, request: &StepRequest) -> StepOutcome {
        let Some(step) = request.step() else {
            return StepOutcome::Failed {
                class: FailureClass::ActionInvalid,
                kind: None,
                message: format!("no step at index {}", request.index),
            };
        };

        let (mut action, patch) = match self.generate(request, None).await {
            Ok(generated) => generated,
            Err(err) => {
                return StepOutcome::Failed {
                    class: FailureClass::ActionInvalid,
                    kind: None,
                    message: err.to_string(),
                }
            }
        };

        if !step.allows(action.kind()) {
            let rejected = action.kind();
            tracing::info!(
                run_id = %request.run_id,
                step = request.index,
                action = rejected.as_str(),
                "action outside allow-set, re-prompting"
            );
            action = match self.generate(request, Some(rejected)).await {
                Ok((retry, _)) if step.allows(retry.kind()) => retry,
                Ok((retry, _)) => {
                    return StepOutcome::Failed {
                        class: FailureClass::AllowViolation,
                        kind: Some(retry.kind()),
                        message: format!(
                            "action `{}` is not allowed for step `{}` (allowed: {})",
                            retry.kind(),
                            step.title,
                            prompt::render_allow(step)
                        ),
                    }
                }
                Err(err) => {
                    return StepOutcome::Failed {
                        class: FailureClass::AllowViolation,
                        kind: Some(rejected),
                        message: format!("action `{}` is not allowed: {}", rejected, err),
                    }
                }
            };
        }

        if let Action::AskUser(ask) = &action {
            if let Some(replacement) =
                self.policy
                    .override_ask(ask, &request.hints, &request.message)
            {
                tracing::info!(
                    run_id = %request.run_id,
                    step = request.index,
                    replacement = replacement.kind().as_str(),
                    "cold-start policy replaced ask_user"
                );
                action = replacement;
            }
        }

        self.execute(request, step, action, patch).await
    }

    async fn generate(
        &self,
        request: &StepRequest,
        reminder: Option<ActionKind>,
    ) -> Result<(Action, Option<PlanPatch>), GenError> {
        let policy = match reminder {
            None => self.config.action.retry.clone(),
            Some(_) => RetryPolicy::new(1)
                .with_temperatures(vec![0.0])
                .with_strict_from(0),
        };
        policy
            .run_while(
                |attempt| async move {
                    let temperature = if attempt.is_first() {
                        request.temperature.or(attempt.temperature)
                    } else {
                        attempt.temperature
                    };
                    let prompt = prompt::action_prompt(
                        &self.config.prompt,
                        &ActionPromptInput {
                            message: &request.message,
                            plan: &request.plan,
                            index: request.index,
                            observations: &request.observations,
                            hints: &request.hints,
                            strict: attempt.strict,
                            allow_reminder: reminder,
                        },
                    );
                    let response = self
                        .gateway
                        .complete(
                            CallTag::new(COMPONENT).run(&request.run_id).step(request.index),
                            &prompt,
                            request.model.as_ref(),
                            CallParams::default().json().with_temperature(temperature),
                        )
                        .await
                        .map_err(|e| GenError::Llm(e.to_string()))?;
                    self.parse_action(request, &response.text).await
                },
                |err: &GenError| matches!(err, GenError::Invalid(_)),
            )
            .await
            .map_err(|exhausted| exhausted.last)
    }

    async fn parse_action(
        &self,
        request: &StepRequest,
        text: &str,
    ) -> Result<(Action, Option<PlanPatch>), GenError> {
        let value: Value = parse_lenient(text).map_err(GenError::Invalid)?;
        let envelope = if value.get("action").is_some() {
            serde_json::from_value::<ActionEnvelope>(value)
                .map_err(|e| GenError::Invalid(e.to_string()))?
        } else {
            ActionEnvelope {
                action: serde_json::from_value::<RawAction>(value)
                    .map_err(|e| GenError::Invalid(e.to_string()))?,
                plan_patch: None,
            }
        };
        let kind = ActionKind::parse(&envelope.action.kind).ok_or_else(|| {
            GenError::Invalid(format!("unknown action type `{}`", envelope.action.kind))
        })?;
        let mut payload = match envelope.action.payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(GenError::Invalid(format!(
                    "{} payload must be a JSON object, got {}",
                    kind, other
                )))
            }
        };
        self.backfill(request, kind, &mut payload).await?;
        let action = Action::from_parts(kind, Value::Object(payload))
            .map_err(|e| GenError::Invalid(e.to_string()))?;
        Ok((action, envelope.plan_patch))
    }

    /// Fills fields the model left out from the step title or run context.
    async fn backfill(
        &self,
        request: &StepRequest,
        kind: ActionKind,
        payload: &mut Map<String, Value>,
    ) -> Result<(), GenError> {
        let Some(step) = request.step() else {
            return Ok(());
        };
        let missing = |payload: &Map<String, Value>, field: &str| {
            payload
                .get(field)
                .and_then(Value::as_str)
                .map(|s| s.trim().is_empty())
                .unwrap_or(true)
        };

        match kind {
            ActionKind::WriteFile
            | ActionKind::AppendFile
            | ActionKind::ReadFile
            | ActionKind::DeleteFile => {
                if missing(payload, "path") {
                    let target = step
                        .title_target(kind.as_str())
                        .or_else(|| step.title_target("write_file"));
                    if let Some(path) = target {
                        payload.insert("path".into(), json!(normalize_path(&path)));
                    }
                }
            }
            ActionKind::ListDir => {
                if missing(payload, "path") {
                    payload.insert("path".into(), json!("."));
                }
            }
            ActionKind::ShellCommand => {
                if missing(payload, "workdir") {
                    payload.insert(
                        "workdir".into(),
                        json!(self.config.workspace_root.to_string_lossy()),
                    );
                }
                if payload.get("timeout_secs").and_then(Value::as_u64).is_none() {
                    payload.insert(
                        "timeout_secs".into(),
                        json!(self.config.action.default_shell_timeout_secs),
                    );
                }
            }
            ActionKind::ToolCall => {
                if missing(payload, "tool") {
                    let target = step
                        .title_target("tool")
                        .or_else(|| step.title_target("tool_call"));
                    if let Some(tool) = target {
                        payload.insert("tool".into(), json!(tool));
                    }
                }
            }
            ActionKind::LlmCall => {
                if missing(payload, "prompt") {
                    let text = if step.brief.trim().is_empty() {
                        &step.title
                    } else {
                        &step.brief
                    };
                    payload.insert("prompt".into(), json!(text));
                }
            }
            ActionKind::MemoryWrite => {
                if missing(payload, "key") {
                    payload.insert("key".into(), json!(step.id));
                }
                if missing(payload, "content") {
                    if let Some(last) = &request.last_llm_response {
                        payload.insert("content".into(), json!(last));
                    }
                }
            }
            ActionKind::AskUser => {
                if missing(payload, "question") && !step.brief.trim().is_empty() {
                    payload.insert("question".into(), json!(step.brief));
                }
            }
            ActionKind::FinalOutput => {
                if missing(payload, "content") {
                    let content = match request
                        .last_llm_response
                        .as_ref()
                        .filter(|s| !s.trim().is_empty())
                    {
                        Some(last) => last.clone(),
                        None => self.force_final_content(request).await?,
                    };
                    payload.insert("content".into(), json!(content));
                }
            }
            ActionKind::HttpRequest | ActionKind::ParseJson => {}
        }
        Ok(())
    }

    async fn force_final_content(&self, request: &StepRequest) -> Result<String, GenError> {
        let prompt = prompt::final_output_prompt(
            &self.config.prompt,
            &request.message,
            &request.observations,
        );
        let response = self
            .gateway
            .complete(
                CallTag::new(COMPONENT).run(&request.run_id).step(request.index),
                &prompt,
                request.model.as_ref(),
                CallParams::default().with_temperature(Some(0.0)),
            )
            .await
            .map_err(|e| GenError::Llm(e.to_string()))?;
        let text = response.text.trim().to_string();
        if text.is_empty() {
            return Err(GenError::Invalid(
                "final_output requires non-empty `content`".to_string(),
            ));
        }
        Ok(text)
    }

    async fn execute(
        &self,
        request: &StepRequest,
        step: &Step,
        action: Action,
        patch: Option<PlanPatch>,
    ) -> StepOutcome {
        let kind = action.kind();
        emit_event(
            Level::DEBUG,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(&request.run_id),
                task_id: Some(&request.task_id),
                step: Some(request.index),
                action: Some(kind.as_str()),
                detail: Some(&action.describe()),
                ..ObservabilityEvent::new("step.action", COMPONENT)
            },
        );

        let failed = |message: String| StepOutcome::Failed {
            class: FailureClass::StepExecution,
            kind: Some(kind),
            message,
        };

        match action {
            Action::FinalOutput(output) => StepOutcome::Final {
                content: output.content,
            },
            Action::AskUser(ask) => StepOutcome::NeedsInput {
                question: ask.question,
            },
            Action::LlmCall(call) => {
                let response = self
                    .gateway
                    .complete(
                        CallTag::new(COMPONENT).run(&request.run_id).step(request.index),
                        &call.prompt,
                        request.model.as_ref(),
                        CallParams::default().with_temperature(request.temperature),
                    )
                    .await;
                match response {
                    Ok(response) => StepOutcome::Completed {
                        kind,
                        summary: prompt::truncate_tail(&response.text, OBSERVATION_MAX_CHARS),
                        llm_text: Some(response.text),
                        patch,
                    },
                    Err(err) => failed(err.to_string()),
                }
            }
            Action::ParseJson(parse) => match parse_lenient::<Value>(&parse.text) {
                Ok(value) => StepOutcome::Completed {
                    kind,
                    summary: prompt::truncate_tail(&value.to_string(), OBSERVATION_MAX_CHARS),
                    llm_text: None,
                    patch,
                },
                Err(err) => failed(format!("parse_json failed: {}", err)),
            },
            action @ (Action::WriteFile(_)
            | Action::ReadFile(_)
            | Action::AppendFile(_)
            | Action::DeleteFile(_)
            | Action::ListDir(_)
            | Action::ShellCommand(_)
            | Action::HttpRequest(_)
            | Action::ToolCall(_)
            | Action::MemoryWrite(_)) => {
                let ctx = ExecutionContext {
                    task_id: request.task_id.clone(),
                    run_id: request.run_id.clone(),
                    step_index: request.index,
                    step_id: step.id.clone(),
                    step_title: step.title.clone(),
                    workdir: self.config.workspace_root.clone(),
                };
                match self.executor.execute(&ctx, &action).await {
                    Ok(outcome) if outcome.ok => StepOutcome::Completed {
                        kind,
                        summary: prompt::truncate_tail(&outcome.summary, OBSERVATION_MAX_CHARS),
                        llm_text: None,
                        patch,
                    },
                    Ok(outcome) => failed(outcome.summary),
                    Err(err) => failed(format!("{:#}", err)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{DraftSkillOnColdStart, KeepAskUser, DRAFT_SKILL_TOOL};
    use crate::testing::{gateway, RecordingExecutor, ScriptedLlm};
    use tempfile::tempdir;

    const ACTION_NEEDLE: &str = "## Action format";

    fn plan() -> Plan {
        Plan::new(
            vec![
                Step::new("step_1", "write_file:notes/out.txt draft", [ActionKind::WriteFile]),
                Step::new("step_2", "tool:grep search", [ActionKind::ToolCall, ActionKind::AskUser]),
                Step::new("step_3", "final_output", [ActionKind::FinalOutput]),
            ],
            vec!["notes/out.txt".to_string()],
        )
    }

    fn request(index: usize) -> StepRequest {
        StepRequest {
            task_id: "t1".to_string(),
            run_id: "r1".to_string(),
            message: "write notes".to_string(),
            plan: plan(),
            index,
            observations: Vec::new(),
            hints: Arc::new(Hints::default()),
            last_llm_response: None,
            model: None,
            temperature: None,
        }
    }

    fn executor_in(
        llm: &Arc<ScriptedLlm>,
        dir: &std::path::Path,
        policy: Arc<dyn ColdStartPolicy>,
    ) -> (StepExecutor, Arc<RecordingExecutor>) {
        let recorder = RecordingExecutor::new(dir);
        let config = EngineConfig {
            workspace_root: dir.to_path_buf(),
            ..EngineConfig::default()
        };
        (
            StepExecutor::new(gateway(llm.clone()), recorder.clone(), policy, Arc::new(config)),
            recorder,
        )
    }

    #[tokio::test]
    async fn write_path_is_recovered_from_title() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            ACTION_NEEDLE,
            r#"{"action":{"type":"write_file","payload":{"content":"hello"}}}"#,
        );
        let (exec, recorder) = executor_in(&llm, dir.path(), Arc::new(KeepAskUser));
        let outcome = exec.run_step(&request(0)).await;
        assert!(matches!(outcome, StepOutcome::Completed { kind: ActionKind::WriteFile, .. }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes/out.txt")).unwrap(),
            "hello"
        );
        assert_eq!(recorder.kinds(), vec![ActionKind::WriteFile]);
    }

    #[tokio::test]
    async fn invalid_json_is_retried_then_reported() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(ACTION_NEEDLE, "not json at all");
        let (exec, _) = executor_in(&llm, dir.path(), Arc::new(KeepAskUser));
        let outcome = exec.run_step(&request(0)).await;
        let StepOutcome::Failed { class, .. } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(class, FailureClass::ActionInvalid);
        assert_eq!(llm.count(ACTION_NEEDLE), 3);
    }

    #[tokio::test]
    async fn disallowed_action_is_reprompted_once() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            ACTION_NEEDLE,
            r#"{"action":{"type":"shell_command","payload":{"command":"ls"}}}"#,
        );
        let (exec, recorder) = executor_in(&llm, dir.path(), Arc::new(KeepAskUser));
        let outcome = exec.run_step(&request(0)).await;
        let StepOutcome::Failed { class, kind, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(class, FailureClass::AllowViolation);
        assert_eq!(kind, Some(ActionKind::ShellCommand));
        assert_eq!(llm.count("is not allowed here"), 1);
        assert!(recorder.actions().is_empty());
    }

    #[tokio::test]
    async fn tool_name_comes_from_title_and_patch_is_returned() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            ACTION_NEEDLE,
            r#"{"action":{"type":"tool","payload":{"args":{"q":"x"}}},
                "plan_patch":{"step_index":2,"insert_steps":[{"title":"read_file:notes/out.txt"}]}}"#,
        );
        let (exec, recorder) = executor_in(&llm, dir.path(), Arc::new(KeepAskUser));
        let outcome = exec.run_step(&request(1)).await;
        let StepOutcome::Completed { patch, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(patch.unwrap().step_index, 2);
        let Action::ToolCall(call) = &recorder.actions()[0] else {
            panic!("expected tool call");
        };
        assert_eq!(call.tool, "grep");
    }

    #[tokio::test]
    async fn ask_user_pauses_or_drafts_a_skill_on_cold_start() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            ACTION_NEEDLE,
            r#"{"action":{"type":"ask_user","payload":{"question":"Which repo?"}}}"#,
        );
        let (keep, _) = executor_in(&llm, dir.path(), Arc::new(KeepAskUser));
        assert_eq!(
            keep.run_step(&request(1)).await,
            StepOutcome::NeedsInput {
                question: "Which repo?".to_string()
            }
        );

        let (draft, recorder) = executor_in(&llm, dir.path(), Arc::new(DraftSkillOnColdStart));
        assert!(matches!(
            draft.run_step(&request(1)).await,
            StepOutcome::Completed { kind: ActionKind::ToolCall, .. }
        ));
        let Action::ToolCall(call) = &recorder.actions()[0] else {
            panic!("expected tool call");
        };
        assert_eq!(call.tool, DRAFT_SKILL_TOOL);
    }

    #[tokio::test]
    async fn final_output_content_is_backfilled() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(ACTION_NEEDLE, r#"{"type":"final_output","payload":{}}"#);
        llm.reply("Write the final answer", "All notes written.");
        let (exec, _) = executor_in(&llm, dir.path(), Arc::new(KeepAskUser));

        let mut with_last = request(2);
        with_last.last_llm_response = Some("Summary from earlier".to_string());
        assert_eq!(
            exec.run_step(&with_last).await,
            StepOutcome::Final {
                content: "Summary from earlier".to_string()
            }
        );
        assert_eq!(llm.count("Write the final answer"), 0);

        assert_eq!(
            exec.run_step(&request(2)).await,
            StepOutcome::Final {
                content: "All notes written.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn executor_error_is_a_step_execution_failure() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            ACTION_NEEDLE,
            r#"{"action":{"type":"write_file","payload":{"content":"x"}}}"#,
        );
        let (exec, recorder) = executor_in(&llm, dir.path(), Arc::new(KeepAskUser));
        recorder.fail_next(ActionKind::WriteFile, "disk full");
        let outcome = exec.run_step(&request(0)).await;
        assert_eq!(
            outcome,
            StepOutcome::Failed {
                class: FailureClass::StepExecution,
                kind: Some(ActionKind::WriteFile),
                message: "disk full".to_string(),
            }
        );
    }
}
