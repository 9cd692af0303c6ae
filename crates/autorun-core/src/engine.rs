//! Entry point for hosts: starts, resumes and stops runs, handing back a live
//! event stream for each pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use autorun_observability::{emit_event, ObservabilityEvent, ProcessKind};
use autorun_providers::{AdaptiveLimiter, LlmClient, LlmGateway};
use autorun_types::{OutputEntry, RunMode, RunRecord, RunStatus, StepLogEntry};

use crate::collaborators::{
    ActionExecutor, ColdStartPolicy, DraftSkillOnColdStart, KnowledgeHints, NoHints,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::plan::Planner;
use crate::runner::{RunDeps, RunSequence};
use crate::step_exec::StepExecutor;
use crate::store::RunStore;
use crate::stream::{bridge, EventStream, StepSequence, StopCheck};

const COMPONENT: &str = "engine";

/// Per-stream controls a host may attach to a pass.
#[derive(Clone, Default)]
pub struct StreamControl {
    pub stop: Option<StopCheck>,
    pub cancel: CancellationToken,
}

/// A started run and the stream of its first pass.
pub struct RunHandle {
    pub run_id: String,
    pub events: EventStream,
}

/// Live streams by run id. Each registration gets its own serial so a stale
/// stream never unregisters a newer one for the same run.
#[derive(Default)]
struct ActiveRuns {
    tokens: Mutex<HashMap<String, (u64, CancellationToken)>>,
    serial: AtomicU64,
}

impl ActiveRuns {
    fn register(self: &Arc<Self>, run_id: &str, token: CancellationToken) -> ActiveGuard {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(run_id.to_string(), (serial, token));
        ActiveGuard {
            runs: self.clone(),
            run_id: run_id.to_string(),
            serial,
        }
    }

    fn cancel(&self, run_id: &str) -> bool {
        match self.lock().get(run_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_active(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, CancellationToken)>> {
        self.tokens.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct ActiveGuard {
    runs: Arc<ActiveRuns>,
    run_id: String,
    serial: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut tokens = self.runs.lock();
        if tokens.get(&self.run_id).map(|(serial, _)| *serial) == Some(self.serial) {
            tokens.remove(&self.run_id);
        }
    }
}

pub struct Engine {
    config: Arc<EngineConfig>,
    gateway: LlmGateway,
    executor: Arc<dyn ActionExecutor>,
    hints: Arc<dyn KnowledgeHints>,
    policy: Arc<dyn ColdStartPolicy>,
    store: Arc<dyn RunStore>,
    active: Arc<ActiveRuns>,
}

impl Engine {
    /// Builds the process-wide gateway and limiter from `config`.
    pub fn new(
        config: EngineConfig,
        client: Arc<dyn LlmClient>,
        executor: Arc<dyn ActionExecutor>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        let gateway = LlmGateway::new(
            client,
            AdaptiveLimiter::new(config.llm.limiter.clone()),
            config.llm.default_model.clone(),
            config.call_timeout(),
        );
        Self::with_gateway(config, gateway, executor, store)
    }

    /// Shares an existing gateway, and with it the limiter pools.
    pub fn with_gateway(
        config: EngineConfig,
        gateway: LlmGateway,
        executor: Arc<dyn ActionExecutor>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            executor,
            hints: Arc::new(NoHints),
            policy: Arc::new(DraftSkillOnColdStart),
            store,
            active: Arc::new(ActiveRuns::default()),
        }
    }

    pub fn with_hints(mut self, hints: Arc<dyn KnowledgeHints>) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_cold_start_policy(mut self, policy: Arc<dyn ColdStartPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    fn deps(&self) -> RunDeps {
        RunDeps {
            config: self.config.clone(),
            planner: Planner::new(self.gateway.clone(), self.config.clone()),
            steps: StepExecutor::new(
                self.gateway.clone(),
                self.executor.clone(),
                self.policy.clone(),
                self.config.clone(),
            ),
            hints: self.hints.clone(),
            store: self.store.clone(),
        }
    }

    /// Creates a run, checkpoints it, and returns the stream that plans and
    /// executes it.
    pub async fn start_run(
        &self,
        task_id: &str,
        message: &str,
        mode: RunMode,
    ) -> Result<RunHandle> {
        self.start_run_with(task_id, message, mode, StreamControl::default())
            .await
    }

    pub async fn start_run_with(
        &self,
        task_id: &str,
        message: &str,
        mode: RunMode,
        control: StreamControl,
    ) -> Result<RunHandle> {
        if message.trim().is_empty() {
            return Err(EngineError::InvalidOperation(
                "run message must not be empty".to_string(),
            ));
        }
        let mut record = RunRecord::new(task_id, message, mode);
        record.state.feedback.enabled = self.config.feedback.enabled;
        self.store.upsert_run(&record)?;
        let run_id = record.run_id.clone();

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(&run_id),
                task_id: Some(task_id),
                status: Some(match mode {
                    RunMode::Do => "do",
                    RunMode::Think => "think",
                }),
                ..ObservabilityEvent::new("run.start", COMPONENT)
            },
        );

        let sequence = RunSequence::start(self.deps(), record);
        let events = self.open(&run_id, sequence, control);
        Ok(RunHandle { run_id, events })
    }

    /// Answers the pending question of a waiting run and continues it.
    pub async fn resume_run(&self, run_id: &str, answer: &str) -> Result<EventStream> {
        self.resume_run_with(run_id, answer, StreamControl::default())
            .await
    }

    pub async fn resume_run_with(
        &self,
        run_id: &str,
        answer: &str,
        control: StreamControl,
    ) -> Result<EventStream> {
        let record = self.store.load_run(run_id)?;
        if record.status != RunStatus::Waiting || record.state.pause.is_none() {
            return Err(EngineError::InvalidOperation(format!(
                "run {} is {} and not waiting for input",
                run_id,
                record.status.as_str()
            )));
        }
        tracing::info!(run_id = %run_id, "resuming run with answer");
        let sequence = RunSequence::resume(self.deps(), record, answer.to_string());
        Ok(self.open(run_id, sequence, control))
    }

    /// Continues an interrupted run from its last checkpoint.
    pub async fn proceed_run(&self, run_id: &str) -> Result<EventStream> {
        let record = self.store.load_run(run_id)?;
        if record.status.is_terminal() || record.status == RunStatus::Waiting {
            return Err(EngineError::InvalidOperation(format!(
                "run {} is {} and cannot proceed",
                run_id,
                record.status.as_str()
            )));
        }
        let deps = self.deps();
        let sequence = if record.plan.is_empty() {
            RunSequence::start(deps, record)
        } else {
            RunSequence::proceed(deps, record)
        };
        Ok(self.open(run_id, sequence, StreamControl::default()))
    }

    /// Stops a run. A live stream is cancelled and records the stop itself;
    /// otherwise the stored record is marked. Finished and waiting runs are
    /// left alone. Returns whether anything was stopped.
    pub async fn stop_run(&self, run_id: &str) -> Result<bool> {
        if self.active.cancel(run_id) {
            tracing::info!(run_id = %run_id, "cancelled live run");
            return Ok(true);
        }
        let mut record = self.store.load_run(run_id)?;
        if record.status.is_terminal() || record.status == RunStatus::Waiting {
            return Ok(false);
        }
        record.status = RunStatus::Stopped;
        record.touch();
        self.store.upsert_run(&record)?;
        tracing::info!(run_id = %run_id, "stopped stored run");
        Ok(true)
    }

    /// True while a stream for `run_id` is open.
    pub fn is_live(&self, run_id: &str) -> bool {
        self.active.is_active(run_id)
    }

    pub fn load_run(&self, run_id: &str) -> Result<RunRecord> {
        self.store.load_run(run_id)
    }

    pub fn run_steps(&self, run_id: &str) -> Result<Vec<StepLogEntry>> {
        self.store.load_steps(run_id)
    }

    pub fn run_outputs(&self, run_id: &str) -> Result<Vec<OutputEntry>> {
        self.store.load_outputs(run_id)
    }

    fn open<S>(&self, run_id: &str, sequence: S, control: StreamControl) -> EventStream
    where
        S: StepSequence + 'static,
    {
        let guard = self.active.register(run_id, control.cancel.clone());
        let events = bridge(
            sequence,
            self.config.stream.clone(),
            control.stop,
            control.cancel,
        );
        // The registration lives exactly as long as the stream.
        Box::pin(events.map(move |event| {
            let _registered = &guard;
            event
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use autorun_types::{ActionKind, PauseKind, StepStatus, StreamEvent};
    use tempfile::tempdir;

    use crate::store::MemoryRunStore;
    use crate::testing::{gateway, RecordingExecutor, ScriptedLlm};

    const PLAN: &str = "## Plan format";
    const REPLAN: &str = "## Remaining steps format";

    fn engine(
        root: &Path,
        llm: &Arc<ScriptedLlm>,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> (Engine, Arc<RecordingExecutor>, Arc<MemoryRunStore>) {
        let mut config = EngineConfig {
            workspace_root: root.to_path_buf(),
            ..EngineConfig::default()
        };
        config.feedback.enabled = false;
        configure(&mut config);
        let executor = RecordingExecutor::new(root);
        let store = Arc::new(MemoryRunStore::new());
        let engine = Engine::with_gateway(config, gateway(llm.clone()), executor.clone(), store.clone());
        (engine, executor, store)
    }

    async fn drain(events: EventStream) -> Vec<StreamEvent> {
        events.collect().await
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(StreamEvent::name)
            .filter(|name| *name != "heartbeat")
            .collect()
    }

    fn action(kind: &str, payload: &str) -> String {
        format!(r#"{{"action":{{"type":"{}","payload":{}}}}}"#, kind, payload)
    }

    fn allowed(kind: &str) -> String {
        format!("Allowed types for this step: {}", kind)
    }

    #[tokio::test]
    async fn do_run_replans_after_failed_write_and_finishes() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            PLAN,
            r#"{"steps":[
                {"id":"step_1","title":"write_file:out.txt greeting","allow":["write_file"]},
                {"id":"step_2","title":"final_output","allow":["final_output"]}
            ],"artifacts":["out.txt"]}"#,
        );
        llm.reply(
            REPLAN,
            r#"{"steps":[
                {"title":"write_file:out.txt greeting","allow":["write_file"]},
                {"title":"shell_command: verify out.txt exists","allow":["shell_command"]},
                {"title":"final_output","allow":["final_output"]}
            ],"artifacts":["out.txt"]}"#,
        );
        llm.reply(
            &allowed("write_file"),
            &action("write_file", r#"{"path":"out.txt","content":"hello"}"#),
        );
        llm.reply(
            &allowed("shell_command"),
            &action("shell_command", r#"{"command":"test -s out.txt"}"#),
        );
        llm.reply(
            &allowed("final_output"),
            &action("final_output", r#"{"content":"Wrote out.txt with a greeting."}"#),
        );
        let (engine, executor, store) = engine(dir.path(), &llm, |_| {});
        executor.fail_next(ActionKind::WriteFile, "disk full");

        let handle = engine.start_run("t1", "write a greeting to out.txt", RunMode::Do).await.unwrap();
        let events = drain(handle.events).await;
        let names = names(&events);
        assert_eq!(names.first(), Some(&"run_created"));
        assert_eq!(names.last(), Some(&"done"));

        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Done);
        assert_eq!(record.state.recovery.replan_attempts, 1);
        assert_eq!(record.plan.steps[0].status, StepStatus::Skipped);
        assert!(record.plan.steps[1..].iter().all(|s| s.status == StepStatus::Done));
        assert!(!record.plan.steps.iter().any(|s| s.is_feedback()));
        assert_eq!(
            record.state.output.final_output.as_deref(),
            Some("Wrote out.txt with a greeting.")
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello");
        assert_eq!(
            executor.kinds(),
            vec![ActionKind::WriteFile, ActionKind::WriteFile, ActionKind::ShellCommand]
        );

        let outputs = store.load_outputs(&handle.run_id).unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(!store.load_steps(&handle.run_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn think_run_votes_and_runs_independent_steps() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        let majority = r#"{"steps":[
            {"id":"notes","title":"write_file:notes.md draft notes","allow":["write_file"]},
            {"id":"names","title":"llm_call: brainstorm names","allow":["llm_call"]},
            {"id":"done","title":"final_output","allow":["final_output"]}
        ]}"#;
        llm.reply_for_model("m1", PLAN, majority);
        llm.reply_for_model(
            "m2",
            PLAN,
            r#"{"steps":[{"title":"final_output","allow":["final_output"]}]}"#,
        );
        llm.reply_for_model("m3", PLAN, majority);
        llm.reply("## Dependency format", r#"{"dependencies":[]}"#);
        llm.reply(
            &allowed("write_file"),
            &action("write_file", r#"{"path":"notes.md","content":"- idea"}"#),
        );
        llm.reply(
            &allowed("llm_call"),
            &action("llm_call", r#"{"prompt":"Suggest three product names"}"#),
        );
        llm.reply(
            &allowed("final_output"),
            &action("final_output", r#"{"content":"Notes written; names: Nimbus."}"#),
        );
        llm.reply("Suggest three product names", "Nimbus, Cirrus, Stratus");

        let (engine, _executor, _store) = engine(dir.path(), &llm, |config| {
            config.think.planners = ["m1", "m2", "m3"]
                .iter()
                .map(|m| crate::config::PlannerProfile {
                    id: format!("planner-{}", m),
                    model: Some(autorun_types::ModelSpec::new("scripted", *m)),
                    temperature: None,
                    filters: Vec::new(),
                })
                .collect();
        });

        let handle = engine
            .start_run("t2", "draft notes and name the product", RunMode::Think)
            .await
            .unwrap();
        let events = drain(handle.events).await;
        assert_eq!(names(&events).last(), Some(&"done"));

        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Done);
        let think = record.state.think.as_ref().unwrap();
        assert_eq!(think.winner.as_deref(), Some("planner-m1"));
        assert_eq!(think.votes.len(), 2);
        assert_eq!(think.votes[0].planners, vec!["planner-m1", "planner-m3"]);
        assert_eq!(think.alternatives.len(), 1);
        assert!(think.deps_of(1).is_empty());
        assert!(record.plan.steps.iter().all(|s| s.status == StepStatus::Done));
        assert_eq!(record.state.output.last_llm_response.as_deref(), Some("Nimbus, Cirrus, Stratus"));
        assert_eq!(llm.count("## Dependency format"), 1);
    }

    #[tokio::test]
    async fn think_batch_that_fails_and_asks_resumes_the_asking_step() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            PLAN,
            r#"{"steps":[
                {"id":"fetch","title":"shell_command: fetch fonts","allow":["shell_command"]},
                {"id":"colour","title":"ask_user: pick a colour","allow":["ask_user"]},
                {"id":"z","title":"final_output","allow":["final_output"]}
            ]}"#,
        );
        llm.reply(
            "## Dependency format",
            r#"{"dependencies":[{"step":"z","after":["fetch","colour"]}]}"#,
        );
        llm.reply(
            "## Fix format",
            r#"{"fix_steps":[{"title":"shell_command: free disk","allow":["shell_command"]}]}"#,
        );
        llm.reply(
            &allowed("shell_command"),
            &action("shell_command", r#"{"command":"make fonts"}"#),
        );
        llm.reply(
            &allowed("ask_user"),
            &action("ask_user", r#"{"question":"Which colour?"}"#),
        );
        llm.reply(
            &allowed("final_output"),
            &action("final_output", r#"{"content":"Poster ready in blue."}"#),
        );
        let (engine, executor, _store) = engine(dir.path(), &llm, |_| {});
        let engine = engine.with_cold_start_policy(Arc::new(crate::collaborators::KeepAskUser));
        executor.fail_next(ActionKind::ShellCommand, "no space left on device");

        let handle = engine.start_run("t7", "make a poster", RunMode::Think).await.unwrap();
        let events = drain(handle.events).await;
        assert_eq!(names(&events).last(), Some(&"need_input"));

        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Waiting);
        let titles: Vec<&str> = record.plan.steps.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "shell_command: fetch fonts",
                "shell_command: free disk",
                "ask_user: pick a colour",
                "final_output"
            ]
        );
        let pause = record.state.pause.clone().unwrap();
        assert_eq!(pause.step_index, 2);
        assert_eq!(pause.batch, vec![2]);
        assert_eq!(record.plan.steps[0].status, StepStatus::Skipped);
        assert_eq!(record.plan.steps[1].status, StepStatus::Pending);
        assert_eq!(record.plan.steps[2].status, StepStatus::Waiting);
        assert_eq!(record.state.recovery.reflection_attempts, 1);

        let events = drain(engine.resume_run(&handle.run_id, "blue").await.unwrap()).await;
        assert_eq!(names(&events).last(), Some(&"done"));
        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Done);
        assert_eq!(record.plan.steps[2].note.as_deref(), Some("blue"));
        assert!(record.plan.steps[1..].iter().all(|s| s.status == StepStatus::Done));
        // The fix step really ran instead of absorbing the answer.
        assert_eq!(
            executor.kinds(),
            vec![ActionKind::ShellCommand, ActionKind::ShellCommand]
        );
        assert_eq!(
            record.state.output.final_output.as_deref(),
            Some("Poster ready in blue.")
        );
    }

    #[tokio::test]
    async fn think_failed_step_is_replaced_by_fix_steps_its_dependents_wait_on() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            PLAN,
            r#"{"steps":[
                {"id":"deps","title":"shell_command: install deps","allow":["shell_command"]},
                {"id":"build","title":"shell_command: build site","allow":["shell_command"]},
                {"id":"z","title":"final_output","allow":["final_output"]}
            ]}"#,
        );
        llm.reply(
            "## Dependency format",
            r#"{"dependencies":[{"step":"build","after":["deps"]},{"step":"z","after":["build"]}]}"#,
        );
        llm.reply(
            "## Fix format",
            r#"{"fix_steps":[
                {"title":"shell_command: clear the package cache","allow":["shell_command"]},
                {"title":"shell_command: install deps offline","allow":["shell_command"]}
            ]}"#,
        );
        llm.reply(
            &allowed("shell_command"),
            &action("shell_command", r#"{"command":"make"}"#),
        );
        llm.reply(
            &allowed("final_output"),
            &action("final_output", r#"{"content":"Site built."}"#),
        );
        let (engine, executor, _store) = engine(dir.path(), &llm, |_| {});
        executor.fail_next(ActionKind::ShellCommand, "registry unreachable");

        let handle = engine.start_run("t8", "build the site", RunMode::Think).await.unwrap();
        let events = drain(handle.events).await;
        assert_eq!(names(&events).last(), Some(&"done"));

        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Done);
        let statuses: Vec<StepStatus> = record.plan.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Skipped,
                StepStatus::Done,
                StepStatus::Done,
                StepStatus::Done,
                StepStatus::Done
            ]
        );
        assert_eq!(record.plan.steps[3].id, "build");
        let think = record.state.think.as_ref().unwrap();
        assert_eq!(think.deps_of(2), &[1]);
        assert_eq!(think.deps_of(3), &[2]);
        assert_eq!(executor.kinds().len(), 4);
        assert_eq!(llm.count("## Fix format"), 1);

        // Build ran only after both fix steps finished.
        let order: Vec<String> = engine
            .run_steps(&handle.run_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.status == StepStatus::Done)
            .map(|e| e.step_id)
            .collect();
        let build = order.iter().position(|id| id == "build").unwrap();
        assert_eq!(build, 2);
    }

    #[tokio::test]
    async fn think_failed_terminal_step_runs_again_after_fix_steps() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            PLAN,
            r#"{"steps":[
                {"id":"draft","title":"llm_call: draft the summary","allow":["llm_call"]},
                {"id":"z","title":"final_output","allow":["final_output"]}
            ]}"#,
        );
        llm.reply("## Dependency format", r#"{"dependencies":[]}"#);
        llm.reply(
            "## Fix format",
            r#"{"fix_steps":[{"title":"llm_call: tighten the summary","allow":["llm_call"]}]}"#,
        );
        llm.reply(&allowed("llm_call"), &action("llm_call", r#"{"prompt":"Summarise the notes"}"#));
        llm.fail(&allowed("final_output"), "response was cut off");
        llm.reply(
            &allowed("final_output"),
            &action("final_output", r#"{"content":"A tight summary."}"#),
        );
        llm.reply("Summarise the notes", "short summary");
        let (engine, _executor, _store) = engine(dir.path(), &llm, |_| {});

        let handle = engine.start_run("t9", "summarise my notes", RunMode::Think).await.unwrap();
        let events = drain(handle.events).await;
        assert_eq!(names(&events).last(), Some(&"done"));

        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Done);
        let titles: Vec<&str> = record.plan.steps.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["llm_call: draft the summary", "llm_call: tighten the summary", "final_output"]
        );
        assert!(record.plan.steps.iter().all(|s| s.status == StepStatus::Done));
        assert!(record.plan.steps[2].is_terminal());
        assert_eq!(record.state.recovery.reflection_attempts, 1);
        let think = record.state.think.as_ref().unwrap();
        assert_eq!(think.deps_of(1), &[0]);
        assert_eq!(think.deps_of(2), &[1]);
        assert_eq!(llm.count(&allowed("final_output")), 2);
        assert_eq!(record.state.output.final_output.as_deref(), Some("A tight summary."));
    }

    #[tokio::test]
    async fn unsatisfied_feedback_replans_then_satisfied_finishes() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            PLAN,
            r#"{"steps":[
                {"title":"llm_call: outline the poem","allow":["llm_call"]},
                {"title":"final_output","allow":["final_output"]}
            ]}"#,
        );
        llm.reply(
            REPLAN,
            r#"{"steps":[
                {"title":"llm_call: rewrite with rhymes","allow":["llm_call"]},
                {"title":"final_output","allow":["final_output"]}
            ]}"#,
        );
        llm.reply(&allowed("llm_call"), &action("llm_call", r#"{"prompt":"Write four lines"}"#));
        llm.reply(
            &allowed("final_output"),
            &action("final_output", r#"{"content":"roses and rain"}"#),
        );
        llm.reply("Write four lines", "roses and rain");
        let (engine, _executor, _store) = engine(dir.path(), &llm, |config| {
            config.feedback.enabled = true;
        });

        let handle = engine.start_run("t3", "write a short poem", RunMode::Do).await.unwrap();
        let events = drain(handle.events).await;
        match events.iter().filter(|e| e.name() != "heartbeat").last() {
            Some(StreamEvent::NeedInput { kind, .. }) => assert_eq!(*kind, PauseKind::Feedback),
            other => panic!("expected feedback question, got {:?}", other),
        }
        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Waiting);
        assert!(record.plan.steps.last().unwrap().is_feedback());

        let events = drain(engine.resume_run(&handle.run_id, "no, it should rhyme").await.unwrap()).await;
        assert_eq!(names(&events).last(), Some(&"need_input"));
        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Waiting);
        assert_eq!(record.state.feedback.rounds, 1);
        assert_eq!(record.state.recovery.replan_attempts, 1);
        assert_eq!(llm.count(REPLAN), 1);
        assert!(llm
            .prompts()
            .iter()
            .any(|p| p.contains(REPLAN) && p.contains("not satisfied")));

        let events = drain(engine.resume_run(&handle.run_id, "yes, thanks").await.unwrap()).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Done { output: Some(_) })));
        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Done);
        assert_eq!(record.state.feedback.rounds, 2);
        assert!(record.state.pause.is_none());

        let err = engine.resume_run(&handle.run_id, "again").await;
        assert!(matches!(err, Err(EngineError::InvalidOperation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_calls_keep_the_stream_alive() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(
            PLAN,
            r#"{"steps":[
                {"title":"llm_call: outline the talk","allow":["llm_call"]},
                {"title":"final_output","allow":["final_output"]}
            ]}"#,
        );
        llm.reply(&allowed("llm_call"), &action("llm_call", r#"{"prompt":"Outline a talk"}"#));
        llm.reply(
            &allowed("final_output"),
            &action("final_output", r#"{"content":"Three sections."}"#),
        );
        llm.reply("Outline a talk", "intro, body, close");
        llm.set_delay(std::time::Duration::from_secs(3));
        let (engine, _executor, _store) = engine(dir.path(), &llm, |config| {
            config.stream.idle_timeout_ms = 2_000;
            config.planning.heartbeat_ms = 500;
            config.action.heartbeat_ms = 500;
        });

        let handle = engine.start_run("t10", "outline my talk", RunMode::Do).await.unwrap();
        let events = drain(handle.events).await;
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
        assert_eq!(names(&events).last(), Some(&"done"));
        assert!(events.iter().filter(|e| e.name() == "heartbeat").count() >= 5);
        assert_eq!(engine.load_run(&handle.run_id).unwrap().status, RunStatus::Done);
    }

    #[tokio::test]
    async fn planning_failure_fails_the_run_with_summary() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        llm.reply(PLAN, r#"{"steps":[]}"#);
        let (engine, _executor, store) = engine(dir.path(), &llm, |_| {});

        let handle = engine.start_run("t4", "do something", RunMode::Do).await.unwrap();
        let events = drain(handle.events).await;
        assert_eq!(names(&events), vec!["run_created", "error"]);
        let record = engine.load_run(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.as_deref().unwrap_or_default().contains("empty_plan"));
        assert!(record.state.output.synthesized);
        assert_eq!(store.load_outputs(&handle.run_id).unwrap().len(), 1);
    }

    #[test]
    fn stale_registration_keeps_the_newer_stream() {
        let runs = Arc::new(ActiveRuns::default());
        let older = runs.register("r1", CancellationToken::new());
        let newer_token = CancellationToken::new();
        let newer = runs.register("r1", newer_token.clone());

        drop(older);
        assert!(runs.is_active("r1"));
        assert!(runs.cancel("r1"));
        assert!(newer_token.is_cancelled());

        drop(newer);
        assert!(!runs.is_active("r1"));
        assert!(!runs.cancel("r1"));
    }

    #[tokio::test]
    async fn stop_marks_stored_run_once() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlm::new();
        let (engine, _executor, store) = engine(dir.path(), &llm, |_| {});
        let mut record = RunRecord::new("t5", "interrupted work", RunMode::Do);
        record.status = RunStatus::Running;
        store.upsert_run(&record).unwrap();

        assert!(engine.stop_run(&record.run_id).await.unwrap());
        assert_eq!(engine.load_run(&record.run_id).unwrap().status, RunStatus::Stopped);
        assert!(!engine.stop_run(&record.run_id).await.unwrap());
        assert!(engine.resume_run(&record.run_id, "hi").await.is_err());
        assert!(engine.start_run("t6", "  ", RunMode::Do).await.is_err());
    }
}
