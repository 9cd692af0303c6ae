use std::sync::Arc;

use async_trait::async_trait;

use autorun_types::{RunMode, RunRecord, RunStatus, StreamEvent};

use super::{apply_answer, do_mode, Flow, RunContext, RunDeps};
use crate::collaborators::Hints;
use crate::error::{PlanFailure, Result};
use crate::plan::PlanRequest;
use crate::pulse::PulseSink;
use crate::stream::StepSequence;
use crate::think;

enum Phase {
    Start,
    Plan,
    Resume(String),
    Execute,
    Finished,
}

/// One pass over a run, from its current checkpoint until it finishes or
/// pauses. Each pass is a fresh sequence; nothing is held across a pause.
pub struct RunSequence {
    deps: RunDeps,
    ctx: RunContext,
    phase: Phase,
    hints: Option<Arc<Hints>>,
    pulse: PulseSink,
}

impl RunSequence {
    /// A new run: plans first.
    pub fn start(deps: RunDeps, record: RunRecord) -> Self {
        Self::with_phase(deps, record, Phase::Start)
    }

    /// Continues a waiting run with the user's answer.
    pub fn resume(deps: RunDeps, record: RunRecord, answer: String) -> Self {
        Self::with_phase(deps, record, Phase::Resume(answer))
    }

    /// Continues a run from its checkpoint without new input.
    pub fn proceed(deps: RunDeps, record: RunRecord) -> Self {
        Self::with_phase(deps, record, Phase::Execute)
    }

    fn with_phase(deps: RunDeps, record: RunRecord, phase: Phase) -> Self {
        let ctx = RunContext::new(record, deps.store.clone());
        Self {
            deps,
            ctx,
            phase,
            hints: None,
            pulse: PulseSink::detached(),
        }
    }

    pub fn record(&self) -> &RunRecord {
        &self.ctx.record
    }

    async fn hints(&mut self) -> Arc<Hints> {
        if let Some(hints) = &self.hints {
            return hints.clone();
        }
        let hints = Arc::new(
            self.deps
                .fetch_hints(&self.ctx.record.message, Vec::new())
                .await,
        );
        self.hints = Some(hints.clone());
        hints
    }

    async fn turn(&mut self) -> Result<Flow> {
        match std::mem::replace(&mut self.phase, Phase::Execute) {
            Phase::Start => {
                self.announce()?;
                self.phase = Phase::Plan;
                Ok(Flow::Continue)
            }
            Phase::Plan => self.begin().await,
            Phase::Resume(answer) => {
                let hints = self.hints().await;
                apply_answer(&self.deps, &mut self.ctx, &hints, &self.pulse, &answer).await
            }
            Phase::Execute => {
                if self.ctx.record.status != RunStatus::Running {
                    self.ctx.set_status(RunStatus::Running);
                }
                let hints = self.hints().await;
                match self.ctx.record.state.mode {
                    RunMode::Do => {
                        do_mode::advance(&self.deps, &mut self.ctx, &hints, &self.pulse).await
                    }
                    RunMode::Think => {
                        think::advance(&self.deps, &mut self.ctx, &hints, &self.pulse).await
                    }
                }
            }
            Phase::Finished => {
                self.phase = Phase::Finished;
                Ok(Flow::Finished)
            }
        }
    }

    fn announce(&mut self) -> Result<()> {
        self.ctx.emit(StreamEvent::RunCreated {
            task_id: self.ctx.record.task_id.clone(),
            run_id: self.ctx.record.run_id.clone(),
        });
        self.ctx.persist()
    }

    async fn begin(&mut self) -> Result<Flow> {
        let planned: std::result::Result<_, PlanFailure> = match self.ctx.record.state.mode {
            RunMode::Do => {
                let hints = self.hints().await;
                let request = PlanRequest::new(
                    &self.ctx.record.message,
                    &hints,
                    &self.ctx.record.run_id,
                );
                self.deps
                    .planner
                    .plan(&request, &self.pulse)
                    .await
                    .map(|draft| (draft.plan, None))
            }
            RunMode::Think => think::plan_run(&self.deps, &self.ctx.record, &self.pulse)
                .await
                .map(|(plan, state)| (plan, Some(state))),
        };

        match planned {
            Ok((plan, think_state)) => {
                if let Some(state) = think_state {
                    self.ctx.record.state.think = Some(state);
                }
                self.ctx.record.state.cursor = 0;
                self.ctx.install_plan(plan);
                self.ctx.set_status(RunStatus::Running);
                self.ctx.persist()?;
                Ok(Flow::Continue)
            }
            Err(failure) => {
                self.ctx.finish_failed(format!(
                    "{} ({}: {})",
                    failure.public_message,
                    failure.code.as_str(),
                    failure.detail
                ))?;
                Ok(Flow::Finished)
            }
        }
    }
}

#[async_trait]
impl StepSequence for RunSequence {
    async fn next_event(&mut self) -> Option<anyhow::Result<StreamEvent>> {
        loop {
            if let Some(event) = self.ctx.next_event() {
                return Some(Ok(event));
            }
            if matches!(self.phase, Phase::Finished) {
                return None;
            }
            match self.turn().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Paused) | Ok(Flow::Finished) => self.phase = Phase::Finished,
                Err(err) => {
                    self.phase = Phase::Finished;
                    tracing::error!(
                        run_id = %self.ctx.record.run_id,
                        error = %err,
                        "run aborted"
                    );
                    if let Err(store_err) = self.ctx.finish_failed(err.to_string()) {
                        return Some(Err(store_err.into()));
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.ctx.mark_stopped() {
            tracing::warn!(
                run_id = %self.ctx.record.run_id,
                error = %err,
                "failed to record stopped run"
            );
        }
    }

    fn bind_pulse(&mut self, pulse: PulseSink) {
        self.pulse = pulse;
    }
}
