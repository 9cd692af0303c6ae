use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Level;

use autorun_observability::{emit_event, ObservabilityEvent, ProcessKind};
use autorun_providers::{CallParams, CallTag, LlmError, LlmGateway, RetryPolicy};
use autorun_types::{ModelSpec, Observation, Plan, RecoveryCounters, Step, StepStatus};

use super::parse::{normalize_plan, parse_bare, PlanDraft, RawPlan};
use super::repair::repair_plan;
use crate::collaborators::Hints;
use crate::config::EngineConfig;
use crate::error::{PlanFailure, PlanFailureCode};
use crate::prompt;
use crate::pulse::PulseSink;

const COMPONENT: &str = "planner";

pub struct PlanRequest<'a> {
    pub message: &'a str,
    pub hints: &'a Hints,
    pub run_id: &'a str,
    pub model: Option<&'a ModelSpec>,
    pub temperature: Option<f32>,
    pub planner_id: Option<&'a str>,
}

impl<'a> PlanRequest<'a> {
    pub fn new(message: &'a str, hints: &'a Hints, run_id: &'a str) -> Self {
        Self {
            message,
            hints,
            run_id,
            model: None,
            temperature: None,
            planner_id: None,
        }
    }
}

pub struct ReplanRequest<'a> {
    pub message: &'a str,
    pub plan: &'a Plan,
    /// Number of leading steps that stay frozen as history.
    pub keep: usize,
    pub error: &'a str,
    pub observations: &'a [Observation],
    pub hints: &'a Hints,
    pub run_id: &'a str,
}

/// Aborts the wrapped task when dropped, so an abandoned planning call does
/// not keep a limiter slot busy.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
pub struct Planner {
    gateway: LlmGateway,
    config: Arc<EngineConfig>,
}

impl Planner {
    pub fn new(gateway: LlmGateway, config: Arc<EngineConfig>) -> Self {
        Self { gateway, config }
    }

    /// Produces a validated plan for `message`.
    ///
    /// A response that is not a bare JSON object is retried once at
    /// temperature zero with a plain-JSON instruction. A plan that cannot be
    /// normalised or repaired gets one corrective re-prompt.
    pub async fn plan(
        &self,
        request: &PlanRequest<'_>,
        pulse: &PulseSink,
    ) -> Result<PlanDraft, PlanFailure> {
        let result = self.plan_with_correction(request, pulse).await;

        let (level, status, detail) = match &result {
            Ok(draft) => (Level::INFO, "ok", format!("{} steps", draft.plan.len())),
            Err(err) => (Level::WARN, "error", err.detail.clone()),
        };
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(request.run_id),
                status: Some(status),
                error_code: result.as_ref().err().map(|e| e.code.as_str()),
                detail: Some(&detail),
                action: request.planner_id,
                ..ObservabilityEvent::new("plan.generated", COMPONENT)
            },
        );
        result
    }

    async fn plan_with_correction(
        &self,
        request: &PlanRequest<'_>,
        pulse: &PulseSink,
    ) -> Result<PlanDraft, PlanFailure> {
        let raw = self.draft(request, pulse, None).await?;
        match self.finalize(raw) {
            Ok(draft) => Ok(draft),
            Err(first) => {
                tracing::warn!(
                    run_id = request.run_id,
                    code = first.code.as_str(),
                    detail = %first.detail,
                    "plan rejected, asking for a corrected plan"
                );
                let raw = self.draft(request, pulse, Some(&first.detail)).await?;
                self.finalize(raw)
            }
        }
    }

    async fn draft(
        &self,
        request: &PlanRequest<'_>,
        pulse: &PulseSink,
        correction: Option<&str>,
    ) -> Result<RawPlan, PlanFailure> {
        let base_temperature = request
            .temperature
            .unwrap_or(self.config.planning.temperature);
        RetryPolicy::strict_once()
            .run_while(
                |attempt| async move {
                    let temperature = if attempt.is_first() {
                        base_temperature
                    } else {
                        attempt.temperature.unwrap_or(0.0)
                    };
                    let prompt = prompt::plan_prompt(
                        &self.config.prompt,
                        request.message,
                        request.hints,
                        self.config.budgets.max_steps,
                        attempt.strict,
                        correction,
                    );
                    let text = self
                        .call_with_pulse(
                            request.run_id,
                            prompt,
                            request.model.cloned(),
                            CallParams::default().json().with_temperature(Some(temperature)),
                            pulse,
                        )
                        .await?;
                    parse_bare::<RawPlan>(&text)
                        .map_err(|e| PlanFailure::new(PlanFailureCode::InvalidJson, e))
                },
                |err: &PlanFailure| err.code == PlanFailureCode::InvalidJson,
            )
            .await
            .map_err(|exhausted| exhausted.last)
    }

    fn finalize(&self, raw: RawPlan) -> Result<PlanDraft, PlanFailure> {
        let mut draft = normalize_plan(raw)?;
        let max_steps = self.config.budgets.max_steps;
        if draft.plan.len() > max_steps {
            return Err(PlanFailure::new(
                PlanFailureCode::InvariantViolation,
                format!("plan has {} steps, the limit is {}", draft.plan.len(), max_steps),
            ));
        }
        repair_plan(&mut draft.plan, 0, max_steps)?;
        Ok(draft)
    }

    /// Runs one planning call on its own task, beating `pulse` while waiting
    /// and giving up past the configured maximum wait.
    async fn call_with_pulse(
        &self,
        run_id: &str,
        prompt: String,
        model: Option<ModelSpec>,
        params: CallParams,
        pulse: &PulseSink,
    ) -> Result<String, PlanFailure> {
        let gateway = self.gateway.clone();
        let run = run_id.to_string();
        let mut task = AbortOnDrop(tokio::spawn(async move {
            gateway
                .complete(CallTag::new(COMPONENT).run(&run), &prompt, model.as_ref(), params)
                .await
        }));

        let max_wait = Duration::from_millis(self.config.planning.max_wait_ms);
        let deadline = tokio::time::sleep(max_wait);
        tokio::pin!(deadline);
        let period = Duration::from_millis(self.config.planning.heartbeat_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                joined = &mut task.0 => {
                    return match joined {
                        Ok(Ok(response)) => Ok(response.text),
                        Ok(Err(LlmError::Timeout(after))) => Err(PlanFailure::new(
                            PlanFailureCode::Timeout,
                            format!("planner call timed out after {:?}", after),
                        )),
                        Ok(Err(err)) => Err(PlanFailure::new(PlanFailureCode::LlmCallFailed, err.to_string())),
                        Err(join_err) => Err(PlanFailure::new(
                            PlanFailureCode::LlmCallFailed,
                            format!("planner task failed: {}", join_err),
                        )),
                    };
                }
                _ = ticker.tick() => pulse.beat(COMPONENT),
                _ = &mut deadline => {
                    return Err(PlanFailure::new(
                        PlanFailureCode::Timeout,
                        format!("no plan after {}ms", max_wait.as_millis()),
                    ));
                }
            }
        }
    }

    /// Plans only the remaining steps and merges them after the frozen
    /// history. Returns `None` once the replan budget or step budget is
    /// spent, or when no valid remaining plan can be produced.
    pub async fn replan(
        &self,
        request: &ReplanRequest<'_>,
        counters: &mut RecoveryCounters,
        pulse: &PulseSink,
    ) -> Option<Plan> {
        let budgets = &self.config.budgets;
        let prior = request.plan;

        let mut keep = request.keep.min(prior.len());
        if let Some(terminal) = prior.terminal_index() {
            keep = keep.min(terminal);
        }
        let history: Vec<Step> = prior.steps[..keep]
            .iter()
            .filter(|s| !s.is_feedback())
            .cloned()
            .map(|mut s| {
                if s.status == StepStatus::Failed {
                    s.status = StepStatus::Skipped;
                }
                s
            })
            .collect();

        if counters.replan_attempts >= budgets.max_replan_attempts {
            self.emit_refused(request.run_id, "replan attempts exhausted");
            return None;
        }
        if budgets.max_steps <= history.len() {
            self.emit_refused(request.run_id, "step budget exhausted");
            return None;
        }
        counters.replan_attempts += 1;
        let remaining = budgets.max_steps - history.len();

        let suffix = match self.draft_remaining(request, &history, remaining, pulse).await {
            Ok(draft) => draft,
            Err(err) => {
                self.emit_failed(request.run_id, &err);
                return None;
            }
        };

        let mut merged = Plan {
            revision: prior.revision + 1,
            steps: history,
            artifacts: if suffix.plan.artifacts.is_empty() {
                prior.artifacts.clone()
            } else {
                suffix.plan.artifacts.clone()
            },
        };
        let frozen = merged.len();
        merged.insert_steps(frozen, fit_budget(suffix.plan.steps, remaining));

        if let Err(err) = repair_plan(&mut merged, frozen, budgets.max_steps) {
            self.emit_failed(request.run_id, &err);
            return None;
        }

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(request.run_id),
                status: Some("ok"),
                detail: Some(&format!(
                    "attempt {} kept {} steps, {} total",
                    counters.replan_attempts,
                    frozen,
                    merged.len()
                )),
                ..ObservabilityEvent::new("replan.applied", COMPONENT)
            },
        );
        Some(merged)
    }

    async fn draft_remaining(
        &self,
        request: &ReplanRequest<'_>,
        history: &[Step],
        remaining: usize,
        pulse: &PulseSink,
    ) -> Result<PlanDraft, PlanFailure> {
        let raw = RetryPolicy::strict_once()
            .run_while(
                |attempt| async move {
                    let prompt = prompt::replan_prompt(
                        &self.config.prompt,
                        request.message,
                        history,
                        request.error,
                        request.observations,
                        request.hints,
                        remaining,
                        attempt.strict,
                    );
                    let temperature = attempt.temperature.unwrap_or(0.0);
                    let text = self
                        .call_with_pulse(
                            request.run_id,
                            prompt,
                            None,
                            CallParams::default().json().with_temperature(Some(temperature)),
                            pulse,
                        )
                        .await?;
                    parse_bare::<RawPlan>(&text)
                        .map_err(|e| PlanFailure::new(PlanFailureCode::InvalidJson, e))
                },
                |err: &PlanFailure| err.code == PlanFailureCode::InvalidJson,
            )
            .await
            .map_err(|exhausted| exhausted.last)?;
        normalize_plan(raw)
    }

    fn emit_refused(&self, run_id: &str, reason: &str) {
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(run_id),
                status: Some("refused"),
                detail: Some(reason),
                ..ObservabilityEvent::new("replan.refused", COMPONENT)
            },
        );
    }

    fn emit_failed(&self, run_id: &str, err: &PlanFailure) {
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(run_id),
                status: Some("error"),
                error_code: Some(err.code.as_str()),
                detail: Some(&err.detail),
                ..ObservabilityEvent::new("replan.failed", COMPONENT)
            },
        );
    }
}

/// Trims an over-long suffix to `remaining` steps, keeping its terminal step.
fn fit_budget(mut steps: Vec<Step>, remaining: usize) -> Vec<Step> {
    if steps.len() <= remaining {
        return steps;
    }
    let terminal = steps
        .iter()
        .position(Step::is_terminal)
        .map(|i| steps.remove(i));
    let room = remaining.saturating_sub(usize::from(terminal.is_some()));
    steps.truncate(room);
    steps.extend(terminal);
    steps
}
