//! Run lifecycle: the record being driven, the events it produces, and the
//! bookkeeping shared by the do-mode loop and the think orchestrator.

mod do_mode;
mod sequence;

pub use sequence::RunSequence;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::Level;

use autorun_observability::{emit_event, ObservabilityEvent, ProcessKind};
use autorun_types::{
    now_ms, ActionKind, Observation, OutputEntry, OutputKind, PauseInfo, PauseKind, Plan,
    PlanItemChange, PlanPatch, RunRecord, RunStatus, StepLogEntry, StepStatus, StreamEvent,
};

use crate::collaborators::{HintQuery, Hints, KnowledgeHints};
use crate::config::{EngineConfig, RoleModel};
use crate::error::{EngineError, Result};
use crate::feedback::{classify_answer, Satisfaction};
use crate::gates::{output_gates, GateEnv, GateOutcome};
use crate::plan::{Planner, ReplanRequest};
use crate::pulse::PulseSink;
use crate::step_exec::{StepExecutor, StepRequest};
use crate::store::RunStore;
use crate::think;

const COMPONENT: &str = "runner";
const NOTE_MAX_CHARS: usize = 400;
const SUMMARY_EVIDENCE: usize = 5;

/// What the sequence should do after one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Paused,
    Finished,
}

/// Shared services a run needs. Cheap to clone.
#[derive(Clone)]
pub struct RunDeps {
    pub config: Arc<EngineConfig>,
    pub planner: Planner,
    pub steps: StepExecutor,
    pub hints: Arc<dyn KnowledgeHints>,
    pub store: Arc<dyn RunStore>,
}

impl RunDeps {
    /// Knowledge retrieval never fails a run; errors degrade to empty hints.
    pub async fn fetch_hints(&self, message: &str, filters: Vec<String>) -> Hints {
        let query = HintQuery {
            message: message.to_string(),
            filters,
        };
        match self.hints.hints(&query).await {
            Ok(hints) => hints,
            Err(err) => {
                tracing::warn!(error = %err, "knowledge hints unavailable");
                Hints::default()
            }
        }
    }

    pub fn step_request(
        &self,
        record: &RunRecord,
        index: usize,
        hints: &Arc<Hints>,
        role: Option<&RoleModel>,
    ) -> StepRequest {
        StepRequest {
            task_id: record.task_id.clone(),
            run_id: record.run_id.clone(),
            message: record.message.clone(),
            plan: record.plan.clone(),
            index,
            observations: self.recent_observations(record),
            hints: hints.clone(),
            last_llm_response: record.state.output.last_llm_response.clone(),
            model: role.map(|r| r.model.clone()),
            temperature: role.and_then(|r| r.temperature),
        }
    }

    pub fn recent_observations(&self, record: &RunRecord) -> Vec<Observation> {
        record
            .state
            .observations
            .recent(self.config.prompt.observation_window)
            .to_vec()
    }
}

// ============================================================================
// Run context
// ============================================================================

/// The record being driven plus the events queued for the stream.
pub struct RunContext {
    pub record: RunRecord,
    store: Arc<dyn RunStore>,
    events: VecDeque<StreamEvent>,
    stopped: bool,
}

impl RunContext {
    pub fn new(record: RunRecord, store: Arc<dyn RunStore>) -> Self {
        Self {
            record,
            store,
            events: VecDeque::new(),
            stopped: false,
        }
    }

    pub fn emit(&mut self, event: StreamEvent) {
        self.events.push_back(event);
    }

    pub fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    /// Checkpoints the record. A no-op once the run was stopped.
    pub fn persist(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.record.touch();
        self.store.upsert_run(&self.record)
    }

    pub fn emit_plan(&mut self) {
        let items = self.record.plan.items();
        self.emit(StreamEvent::Plan { items });
    }

    /// Re-applies the feedback trailer after a plan change and publishes a
    /// fresh snapshot.
    pub fn refresh_plan(&mut self) {
        if self.record.state.feedback.enabled {
            self.record.plan.ensure_feedback_tail();
        } else {
            self.record.plan.remove_feedback();
        }
        self.emit_plan();
    }

    pub fn install_plan(&mut self, plan: Plan) {
        self.record.plan = plan;
        self.refresh_plan();
    }

    pub fn first_pending(&self) -> usize {
        self.record
            .plan
            .steps
            .iter()
            .position(|s| s.status == StepStatus::Pending)
            .unwrap_or(self.record.plan.len())
    }

    pub fn set_status(&mut self, status: RunStatus) {
        if self.record.status == status {
            return;
        }
        self.record.status = status;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                task_id: Some(&self.record.task_id),
                run_id: Some(&self.record.run_id),
                status: Some(status.as_str()),
                ..ObservabilityEvent::new("run.status", COMPONENT)
            },
        );
    }

    pub fn set_step_status(
        &mut self,
        index: usize,
        status: StepStatus,
        action: Option<ActionKind>,
        detail: Option<&str>,
    ) -> Result<()> {
        let Some(step) = self.record.plan.steps.get_mut(index) else {
            return Ok(());
        };
        step.status = status;
        if let Some(detail) = detail {
            step.note = Some(crate::prompt::truncate_tail(detail, NOTE_MAX_CHARS));
        }
        let entry = StepLogEntry {
            step_index: index,
            step_id: step.id.clone(),
            title: step.title.clone(),
            status,
            action,
            detail: detail.map(str::to_string),
            at: Utc::now(),
        };
        let change = PlanItemChange::status(index, step);
        self.emit(StreamEvent::PlanDelta {
            changes: vec![change],
        });
        if self.stopped {
            return Ok(());
        }
        self.store.append_step(&self.record.run_id, &entry)
    }

    pub fn observe(&mut self, observation: Observation) {
        self.record.state.observations.push(observation);
    }

    pub fn progress(&mut self, text: impl Into<String>) {
        self.emit(StreamEvent::delta(text));
    }

    pub fn advance_cursor(&mut self) -> Result<Flow> {
        self.record.state.cursor += 1;
        self.persist()?;
        Ok(Flow::Continue)
    }

    /// Applies an action-carried patch; a rejected patch only leaves an
    /// observation behind.
    pub fn apply_patch(&mut self, cursor: usize, patch: &PlanPatch, max_steps: usize) {
        let step_id = self
            .record
            .plan
            .get(cursor)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        if self.record.plan.len() + patch.insert_steps.len() > max_steps {
            self.observe(Observation::new(
                cursor,
                step_id,
                None,
                false,
                "plan_patch rejected: step budget exhausted",
            ));
            return;
        }
        match self.record.plan.apply_patch(cursor, patch) {
            Ok(effect) => {
                tracing::info!(
                    run_id = %self.record.run_id,
                    step = cursor,
                    effect = ?effect,
                    "plan patch applied"
                );
                self.refresh_plan();
            }
            Err(err) => {
                self.observe(Observation::new(
                    cursor,
                    step_id,
                    None,
                    false,
                    format!("plan_patch rejected: {}", err),
                ));
            }
        }
    }

    pub fn record_output(&mut self, content: String) -> Result<()> {
        if !self.stopped {
            self.store.append_output(
                &self.record.run_id,
                &OutputEntry::new(OutputKind::Final, content.as_str()),
            )?;
        }
        self.record.state.output.final_output = Some(content);
        self.record.state.output.synthesized = false;
        Ok(())
    }

    pub fn finish_done(&mut self) -> Result<()> {
        self.record.state.pause = None;
        self.set_status(RunStatus::Done);
        self.persist()?;
        let output = self.record.state.output.final_output.clone();
        self.emit(StreamEvent::Done { output });
        Ok(())
    }

    /// Ends the run as failed. A run without any final output gets a
    /// synthesized failure summary instead.
    pub fn finish_failed(&mut self, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.record.error = Some(error.clone());
        self.record.state.pause = None;
        if self.record.state.output.final_output.is_none() {
            let summary = failure_summary(&self.record, &error);
            if !self.stopped {
                self.store.append_output(
                    &self.record.run_id,
                    &OutputEntry::new(OutputKind::FailureSummary, summary.as_str()),
                )?;
            }
            self.record.state.output.final_output = Some(summary);
            self.record.state.output.synthesized = true;
        }
        self.set_status(RunStatus::Failed);
        self.persist()?;
        self.emit(StreamEvent::Error { message: error });
        Ok(())
    }

    pub fn pause(
        &mut self,
        question: String,
        kind: PauseKind,
        step_index: usize,
        batch: Vec<usize>,
    ) -> Result<()> {
        self.record.state.pause = Some(PauseInfo {
            question: question.clone(),
            kind,
            step_index,
            batch,
            paused_at_ms: now_ms(),
        });
        self.set_status(RunStatus::Waiting);
        self.persist()?;
        self.emit(StreamEvent::NeedInput { question, kind });
        Ok(())
    }

    /// Records `stopped` once and refuses later writes. Runs that already
    /// ended or are waiting for input keep their status.
    pub fn mark_stopped(&mut self) -> Result<()> {
        if self.stopped
            || self.record.status.is_terminal()
            || self.record.status == RunStatus::Waiting
        {
            return Ok(());
        }
        self.set_status(RunStatus::Stopped);
        let result = self.persist();
        self.stopped = true;
        result
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

pub fn failure_summary(record: &RunRecord, error: &str) -> String {
    let mut lines = vec![format!("The run could not finish: {}", error)];

    let failed: Vec<String> = record
        .plan
        .steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.status == StepStatus::Failed)
        .map(|(i, s)| match &s.note {
            Some(note) => format!("- #{} {}: {}", i, s.title, note),
            None => format!("- #{} {}", i, s.title),
        })
        .collect();
    if !failed.is_empty() {
        lines.push("Failed steps:".to_string());
        lines.extend(failed);
    }

    let mut evidence: Vec<String> = record
        .state
        .observations
        .iter()
        .filter(|o| !o.ok)
        .rev()
        .take(SUMMARY_EVIDENCE)
        .map(|o| format!("- {}", o.render()))
        .collect();
    evidence.reverse();
    if !evidence.is_empty() {
        lines.push("Recent evidence:".to_string());
        lines.extend(evidence);
    }
    if let Some(critical) = &record.state.critical_failure {
        lines.push(format!("Stopped after repeated failure: {}", critical));
    }
    lines.join("\n")
}

// ============================================================================
// Shared steps of both modes
// ============================================================================

/// Replans everything after `keep` and installs the result. Returns false
/// when no new plan could be produced.
pub(crate) async fn replan_run(
    deps: &RunDeps,
    ctx: &mut RunContext,
    hints: &Hints,
    keep: usize,
    error: &str,
    pulse: &PulseSink,
) -> bool {
    let observations = deps.recent_observations(&ctx.record);
    let next = deps
        .planner
        .replan(
            &ReplanRequest {
                message: &ctx.record.message,
                plan: &ctx.record.plan,
                keep,
                error,
                observations: &observations,
                hints,
                run_id: &ctx.record.run_id,
            },
            &mut ctx.record.state.recovery,
            pulse,
        )
        .await;
    let Some(plan) = next else {
        return false;
    };
    ctx.install_plan(plan);
    let resume = ctx.first_pending();
    ctx.record.state.cursor = resume;
    if let Some(state) = ctx.record.state.think.as_mut() {
        think::relink_from(state, &ctx.record.plan, resume);
    }
    ctx.progress(format!(
        "Replanned (attempt {}): {}",
        ctx.record.state.recovery.replan_attempts, error
    ));
    true
}

pub(crate) async fn run_gates(
    deps: &RunDeps,
    ctx: &mut RunContext,
    hints: &Hints,
    pulse: &PulseSink,
    cursor: usize,
) -> GateOutcome {
    let observations = deps.recent_observations(&ctx.record);
    let env = GateEnv {
        config: &deps.config,
        planner: &deps.planner,
        message: &ctx.record.message,
        hints,
        run_id: &ctx.record.run_id,
        pulse,
    };
    let outcome = output_gates(
        &env,
        &mut ctx.record.plan,
        &mut ctx.record.state.recovery,
        &observations,
        cursor,
    )
    .await;
    match &outcome {
        GateOutcome::Retry { inserted } => {
            ctx.refresh_plan();
            if let Some(state) = ctx.record.state.think.as_mut() {
                think::relink_from(state, &ctx.record.plan, cursor);
            }
            ctx.progress(format!("Inserted {} step(s) for missing artifacts", inserted));
        }
        GateOutcome::Jump(resume) => {
            ctx.refresh_plan();
            if let Some(state) = ctx.record.state.think.as_mut() {
                think::relink_from(state, &ctx.record.plan, *resume);
            }
        }
        GateOutcome::Pass | GateOutcome::Fail(_) => {}
    }
    outcome
}

/// Pauses on the feedback trailer, or settles it when the loop is off.
pub(crate) fn arrive_at_feedback(
    deps: &RunDeps,
    ctx: &mut RunContext,
    index: usize,
) -> Result<Flow> {
    if !ctx.record.state.feedback.enabled {
        ctx.set_step_status(index, StepStatus::Skipped, None, None)?;
        ctx.record.state.cursor = index + 1;
        ctx.persist()?;
        return Ok(Flow::Continue);
    }
    if ctx.record.state.output.final_output.is_none() {
        ctx.finish_failed("reached confirmation without a final output")?;
        return Ok(Flow::Finished);
    }
    ctx.set_step_status(index, StepStatus::Waiting, None, None)?;
    ctx.pause(
        deps.config.feedback.question.clone(),
        PauseKind::Feedback,
        index,
        Vec::new(),
    )?;
    Ok(Flow::Paused)
}

/// True while an unanswered feedback trailer remains.
pub(crate) fn feedback_pending(ctx: &RunContext) -> bool {
    ctx.record.state.feedback.enabled
        && ctx
            .record
            .plan
            .steps
            .iter()
            .any(|s| s.is_feedback() && !s.status.is_settled())
}

/// Consumes the answer to the pending question.
pub(crate) async fn apply_answer(
    deps: &RunDeps,
    ctx: &mut RunContext,
    hints: &Hints,
    pulse: &PulseSink,
    answer: &str,
) -> Result<Flow> {
    let Some(pause) = ctx.record.state.pause.take() else {
        return Err(EngineError::InvalidOperation(
            "run is not waiting for input".to_string(),
        ));
    };
    ctx.set_status(RunStatus::Running);
    let index = pause.step_index;

    match pause.kind {
        PauseKind::UserInput => {
            let step_id = ctx
                .record
                .plan
                .get(index)
                .map(|s| s.id.clone())
                .unwrap_or_default();
            ctx.observe(Observation::new(
                index,
                step_id,
                Some(ActionKind::AskUser),
                true,
                format!("user answered: {}", answer),
            ));
            ctx.set_step_status(index, StepStatus::Done, Some(ActionKind::AskUser), Some(answer))?;
            // Other lanes of a paused batch that also asked run again.
            for other in pause.batch.iter().copied().filter(|&i| i != index) {
                let waiting = ctx
                    .record
                    .plan
                    .get(other)
                    .map(|s| s.status == StepStatus::Waiting)
                    .unwrap_or(false);
                if waiting {
                    ctx.set_step_status(other, StepStatus::Pending, None, None)?;
                }
            }
            if ctx.record.state.think.is_none() {
                ctx.record.state.cursor = index + 1;
            }
            ctx.persist()?;
            Ok(Flow::Continue)
        }
        PauseKind::Feedback => {
            ctx.record.state.feedback.rounds += 1;
            ctx.record.state.feedback.last_answer = Some(answer.to_string());
            match classify_answer(answer) {
                Satisfaction::Satisfied => {
                    ctx.set_step_status(index, StepStatus::Done, None, Some(answer))?;
                    ctx.finish_done()?;
                    Ok(Flow::Finished)
                }
                Satisfaction::Unsatisfied => {
                    tracing::info!(
                        run_id = %ctx.record.run_id,
                        round = ctx.record.state.feedback.rounds,
                        "user not satisfied, replanning"
                    );
                    let keep = ctx
                        .record
                        .plan
                        .terminal_index()
                        .unwrap_or(ctx.record.plan.len());
                    let error = format!("The user is not satisfied with the result: {}", answer);
                    if replan_run(deps, ctx, hints, keep, &error, pulse).await {
                        ctx.record.state.output.final_output = None;
                        ctx.persist()?;
                        Ok(Flow::Continue)
                    } else {
                        ctx.set_step_status(index, StepStatus::Failed, None, Some(answer))?;
                        ctx.finish_failed("could not replan after the user was not satisfied")?;
                        Ok(Flow::Finished)
                    }
                }
            }
        }
    }
}
