//! Do mode: steps run one at a time in plan order.

use std::sync::Arc;

use autorun_types::{ActionKind, Observation, PauseKind, Step, StepStatus};

use super::{
    arrive_at_feedback, feedback_pending, replan_run, run_gates, Flow, RunContext, RunDeps,
};
use crate::collaborators::Hints;
use crate::error::Result;
use crate::failure::failure_signature;
use crate::gates::GateOutcome;
use crate::pulse::PulseSink;
use crate::recovery::{plan_recovery, Fallback, FailureClass, Recovery};
use crate::step_exec::StepOutcome;

/// Runs the step under the cursor, or settles whatever blocks it.
pub async fn advance(
    deps: &RunDeps,
    ctx: &mut RunContext,
    hints: &Arc<Hints>,
    pulse: &PulseSink,
) -> Result<Flow> {
    let cursor = ctx.record.state.cursor;
    let Some(step) = ctx.record.plan.get(cursor).cloned() else {
        return plan_exhausted(deps, ctx, hints, pulse).await;
    };

    match step.status {
        StepStatus::Done | StepStatus::Skipped | StepStatus::Failed => {
            return ctx.advance_cursor();
        }
        StepStatus::Running => {
            ctx.set_step_status(
                cursor,
                StepStatus::Done,
                None,
                Some("interrupted; treated as completed"),
            )?;
            return ctx.advance_cursor();
        }
        StepStatus::Pending | StepStatus::Waiting => {}
    }

    if step.is_feedback() {
        return arrive_at_feedback(deps, ctx, cursor);
    }

    if step.is_terminal() {
        match run_gates(deps, ctx, hints, pulse, cursor).await {
            GateOutcome::Pass => {}
            GateOutcome::Retry { .. } => {
                ctx.persist()?;
                return Ok(Flow::Continue);
            }
            GateOutcome::Jump(resume) => {
                ctx.record.state.cursor = resume;
                ctx.persist()?;
                return Ok(Flow::Continue);
            }
            GateOutcome::Fail(reason) => {
                ctx.finish_failed(reason)?;
                return Ok(Flow::Finished);
            }
        }
    }

    ctx.set_step_status(cursor, StepStatus::Running, None, None)?;
    ctx.persist()?;
    ctx.progress(format!("Step {}: {}", cursor + 1, step.title));

    let request = deps.step_request(&ctx.record, cursor, hints, None);
    let outcome = pulse
        .while_running("step", deps.config.step_heartbeat(), deps.steps.run_step(&request))
        .await;
    match outcome {
        StepOutcome::Completed {
            kind,
            summary,
            llm_text,
            patch,
        } => {
            ctx.observe(Observation::new(cursor, &step.id, Some(kind), true, &summary));
            if let Some(text) = llm_text {
                ctx.record.state.output.last_llm_response = Some(text);
            }
            ctx.set_step_status(cursor, StepStatus::Done, Some(kind), Some(&summary))?;
            if let Some(patch) = patch {
                ctx.apply_patch(cursor, &patch, deps.config.budgets.max_steps);
            }
            ctx.advance_cursor()
        }
        StepOutcome::NeedsInput { question } => {
            ctx.set_step_status(cursor, StepStatus::Waiting, Some(ActionKind::AskUser), None)?;
            ctx.pause(question, PauseKind::UserInput, cursor, Vec::new())?;
            Ok(Flow::Paused)
        }
        StepOutcome::Final { content } => {
            ctx.observe(Observation::new(
                cursor,
                &step.id,
                Some(ActionKind::FinalOutput),
                true,
                "final output produced",
            ));
            ctx.set_step_status(cursor, StepStatus::Done, Some(ActionKind::FinalOutput), None)?;
            ctx.record_output(content)?;
            ctx.record.state.cursor = cursor + 1;
            if feedback_pending(ctx) {
                ctx.persist()?;
                Ok(Flow::Continue)
            } else {
                ctx.finish_done()?;
                Ok(Flow::Finished)
            }
        }
        StepOutcome::Failed {
            class,
            kind,
            message,
        } => handle_failure(deps, ctx, hints, pulse, &step, class, kind, message).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_failure(
    deps: &RunDeps,
    ctx: &mut RunContext,
    hints: &Hints,
    pulse: &PulseSink,
    step: &Step,
    class: FailureClass,
    kind: Option<ActionKind>,
    message: String,
) -> Result<Flow> {
    let cursor = ctx.record.state.cursor;
    ctx.observe(Observation::new(cursor, &step.id, kind, false, &message));
    ctx.set_step_status(cursor, StepStatus::Failed, kind, Some(&message))?;

    let hits = ctx
        .record
        .state
        .failures
        .record(&failure_signature(kind, &message));
    let exhausted = ctx.record.plan.work_steps().all(|(i, _)| i <= cursor);
    let recovery = plan_recovery(class, &message, exhausted, hits, &deps.config.budgets);
    tracing::warn!(
        run_id = %ctx.record.run_id,
        step = cursor,
        class = class.as_str(),
        hits,
        recovery = ?recovery,
        "step failed: {}",
        message
    );

    match recovery {
        Recovery::CriticalStop => {
            ctx.record.state.critical_failure = Some(message.clone());
            ctx.finish_failed(format!("step `{}` keeps failing: {}", step.id, message))?;
            Ok(Flow::Finished)
        }
        Recovery::Skip => ctx.advance_cursor(),
        Recovery::Replan { or_else } => {
            if replan_run(deps, ctx, hints, cursor + 1, &message, pulse).await {
                ctx.persist()?;
                return Ok(Flow::Continue);
            }
            match or_else {
                Fallback::Skip => ctx.advance_cursor(),
                Fallback::Fail => {
                    ctx.finish_failed(format!(
                        "step `{}` failed and no replan was possible: {}",
                        step.id, message
                    ))?;
                    Ok(Flow::Finished)
                }
            }
        }
    }
}

async fn plan_exhausted(
    deps: &RunDeps,
    ctx: &mut RunContext,
    hints: &Hints,
    pulse: &PulseSink,
) -> Result<Flow> {
    if ctx.record.state.output.final_output.is_some() {
        ctx.finish_done()?;
        return Ok(Flow::Finished);
    }
    let keep = ctx.record.plan.len();
    let error = "the plan ended without producing a final output";
    if replan_run(deps, ctx, hints, keep, error, pulse).await {
        ctx.persist()?;
        return Ok(Flow::Continue);
    }
    ctx.finish_failed(error)?;
    Ok(Flow::Finished)
}
