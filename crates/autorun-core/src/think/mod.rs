//! Think mode: several planners vote on a plan, then independent steps run
//! concurrently in dependency order with per-role models. Failed steps get a
//! reflection pass that inserts fix steps in place.

mod reflection;
mod roles;
mod scheduler;
mod vote;

pub use reflection::{parse_fix_steps, ReflectRequest, Reflector};
pub use roles::{assign_role, assign_roles};
pub use scheduler::{linear_dependencies, SchedulerError, StepProgress, StepScheduler};
pub use vote::{candidate_key, tally, titles_key};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::Level;

use autorun_observability::{emit_event, ObservabilityEvent, ProcessKind};
use autorun_providers::{CallParams, CallTag};
use autorun_types::{
    ActionKind, Observation, PatchEffect, PatchStep, PauseKind, Plan, PlanPatch, RunRecord,
    StepStatus, ThinkState,
};

use crate::collaborators::Hints;
use crate::error::{PlanFailure, PlanFailureCode, Result};
use crate::failure::failure_signature;
use crate::gates::GateOutcome;
use crate::plan::{parse_lenient, PlanDraft, PlanRequest};
use crate::prompt;
use crate::pulse::PulseSink;
use crate::recovery::FailureClass;
use crate::runner::{arrive_at_feedback, run_gates, Flow, RunContext, RunDeps};
use crate::step_exec::StepOutcome;

const COMPONENT: &str = "think";

// ============================================================================
// Planning
// ============================================================================

/// Runs every configured planner concurrently, votes, then elaborates the
/// winner's dependency graph and role assignment.
pub async fn plan_run(
    deps: &RunDeps,
    record: &RunRecord,
    pulse: &PulseSink,
) -> std::result::Result<(Plan, ThinkState), PlanFailure> {
    let profiles = deps.config.think.effective_planners();
    let mut lanes = JoinSet::new();
    for (position, profile) in profiles.into_iter().enumerate() {
        let deps = deps.clone();
        let message = record.message.clone();
        let run_id = record.run_id.clone();
        let pulse = pulse.clone();
        lanes.spawn(async move {
            let hints = deps.fetch_hints(&message, profile.filters.clone()).await;
            let request = PlanRequest {
                model: profile.model.as_ref(),
                temperature: profile.temperature,
                planner_id: Some(&profile.id),
                ..PlanRequest::new(&message, &hints, &run_id)
            };
            let result = deps.planner.plan(&request, &pulse).await;
            (position, profile.id.clone(), result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = lanes.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => tracing::warn!(error = %err, "planner lane failed"),
        }
    }
    results.sort_by_key(|(position, _, _)| *position);

    let mut first_failure: Option<PlanFailure> = None;
    let mut candidates: Vec<(String, PlanDraft)> = Vec::new();
    for (_, planner_id, result) in results {
        match result {
            Ok(draft) => candidates.push((planner_id, draft)),
            Err(failure) => {
                tracing::warn!(
                    run_id = %record.run_id,
                    planner = %planner_id,
                    code = failure.code.as_str(),
                    "planner produced no plan"
                );
                first_failure.get_or_insert(failure);
            }
        }
    }

    let ballots: Vec<(String, String)> = candidates
        .iter()
        .map(|(id, draft)| (id.clone(), candidate_key(draft)))
        .collect();
    let Some((winner, votes)) = tally(&ballots) else {
        return Err(first_failure.unwrap_or_else(|| {
            PlanFailure::new(PlanFailureCode::LlmCallFailed, "no planner produced a plan")
        }));
    };
    let (winner_id, winning) = candidates.remove(winner);
    let alternatives: Vec<Plan> = candidates.into_iter().map(|(_, d)| d.plan).collect();
    let plan = winning.plan;

    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            run_id: Some(&record.run_id),
            action: Some(&winner_id),
            status: Some("ok"),
            detail: Some(&format!(
                "{} candidate(s), {} distinct",
                ballots.len(),
                votes.len()
            )),
            ..ObservabilityEvent::new("think.vote", COMPONENT)
        },
    );

    let dependencies = pulse
        .while_running(
            COMPONENT,
            deps.config.step_heartbeat(),
            elaborate_dependencies(deps, record, &plan),
        )
        .await;
    let roles = assign_roles(&plan);
    Ok((
        plan,
        ThinkState {
            winner: Some(winner_id),
            votes,
            alternatives,
            dependencies,
            roles,
        },
    ))
}

#[derive(Debug, Deserialize)]
struct DependencyReply {
    #[serde(default)]
    dependencies: Vec<DependencyEntry>,
}

#[derive(Debug, Deserialize)]
struct DependencyEntry {
    step: String,
    #[serde(default, alias = "depends_on")]
    after: Vec<String>,
}

/// Maps a `{"dependencies":[{"step":id,"after":[id..]}]}` reply onto plan
/// indices and validates the graph.
pub fn parse_dependencies(
    text: &str,
    plan: &Plan,
) -> std::result::Result<BTreeMap<usize, Vec<usize>>, String> {
    let reply: DependencyReply = parse_lenient(text)?;
    let index_of = |id: &str| {
        plan.work_steps()
            .find(|(_, s)| s.id == id)
            .map(|(i, _)| i)
            .ok_or_else(|| format!("unknown step `{}`", id))
    };
    let mut dependencies: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for entry in reply.dependencies {
        let step = index_of(entry.step.as_str())?;
        let edges = dependencies.entry(step).or_default();
        for id in &entry.after {
            edges.push(index_of(id.as_str())?);
        }
        edges.sort_unstable();
        edges.dedup();
    }
    StepScheduler::validate(plan, &dependencies).map_err(|e| e.to_string())?;
    Ok(dependencies)
}

async fn elaborate_dependencies(
    deps: &RunDeps,
    record: &RunRecord,
    plan: &Plan,
) -> BTreeMap<usize, Vec<usize>> {
    if !deps.config.think.elaborate_dependencies {
        return linear_dependencies(plan);
    }
    let prompt = prompt::dependency_prompt(&deps.config.prompt, &record.message, plan);
    let parsed = deps
        .steps
        .gateway()
        .complete(
            CallTag::new(COMPONENT).run(&record.run_id),
            &prompt,
            None,
            CallParams::default().json().with_temperature(Some(0.0)),
        )
        .await
        .map_err(|e| e.to_string())
        .and_then(|response| parse_dependencies(&response.text, plan));
    match parsed {
        Ok(dependencies) => dependencies,
        Err(reason) => {
            tracing::warn!(
                run_id = %record.run_id,
                reason = %reason,
                "dependency elaboration unusable, running steps in order"
            );
            linear_dependencies(plan)
        }
    }
}

/// Rebuilds edges and roles for every step at or after `from` after the plan
/// changed there. New steps run after the work step before them.
pub fn relink_from(state: &mut ThinkState, plan: &Plan, from: usize) {
    let mut dependencies: BTreeMap<usize, Vec<usize>> = state
        .dependencies
        .iter()
        .filter(|(step, _)| **step < from)
        .map(|(step, edges)| (*step, edges.iter().copied().filter(|d| *d < from).collect()))
        .collect();
    let mut previous = plan.work_steps().map(|(i, _)| i).filter(|i| *i < from).last();
    for (i, _) in plan.work_steps().filter(|(i, _)| *i >= from) {
        if let Some(p) = previous {
            dependencies.insert(i, vec![p]);
        }
        previous = Some(i);
    }
    state.dependencies = dependencies;

    state.roles.retain(|i, _| *i < from);
    for (i, step) in plan.work_steps().filter(|(i, _)| *i >= from) {
        state.roles.insert(i, assign_role(step));
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Runs the next batch of ready steps, or settles the run when none are left.
pub async fn advance(
    deps: &RunDeps,
    ctx: &mut RunContext,
    hints: &Arc<Hints>,
    pulse: &PulseSink,
) -> Result<Flow> {
    if ctx.record.state.think.is_none() {
        ctx.record.state.think = Some(ThinkState {
            dependencies: linear_dependencies(&ctx.record.plan),
            roles: assign_roles(&ctx.record.plan),
            ..ThinkState::default()
        });
    }

    let interrupted: Vec<usize> = ctx
        .record
        .plan
        .work_steps()
        .filter(|(_, s)| s.status == StepStatus::Running)
        .map(|(i, _)| i)
        .collect();
    for index in interrupted {
        ctx.set_step_status(
            index,
            StepStatus::Done,
            None,
            Some("interrupted; treated as completed"),
        )?;
    }

    let ready = match ctx.record.state.think.as_ref() {
        Some(state) => StepScheduler::runnable(&ctx.record.plan, state),
        None => Vec::new(),
    };
    if ready.is_empty() {
        return settle(deps, ctx);
    }

    if let [only] = *ready.as_slice() {
        if ctx.record.plan.steps[only].is_terminal() {
            ctx.record.state.cursor = only;
            match run_gates(deps, ctx, hints, pulse, only).await {
                GateOutcome::Pass => {}
                GateOutcome::Retry { .. } | GateOutcome::Jump(_) => {
                    ctx.persist()?;
                    return Ok(Flow::Continue);
                }
                GateOutcome::Fail(reason) => {
                    ctx.finish_failed(reason)?;
                    return Ok(Flow::Finished);
                }
            }
        }
    }

    run_batch(deps, ctx, hints, pulse, ready).await
}

/// No step is ready: ask for feedback, finish, or report the blockage.
fn settle(deps: &RunDeps, ctx: &mut RunContext) -> Result<Flow> {
    if StepScheduler::all_settled(&ctx.record.plan) {
        if let Some(index) = ctx
            .record
            .plan
            .steps
            .iter()
            .position(|s| s.is_feedback() && !s.status.is_settled())
        {
            return arrive_at_feedback(deps, ctx, index);
        }
        if ctx.record.state.output.final_output.is_some() {
            ctx.finish_done()?;
        } else {
            ctx.finish_failed("all steps settled without a final output")?;
        }
        return Ok(Flow::Finished);
    }

    let blocked: Vec<String> = ctx
        .record
        .plan
        .work_steps()
        .filter(|(_, s)| !s.status.is_settled())
        .map(|(_, s)| s.id.clone())
        .collect();
    let deadlocked = ctx
        .record
        .state
        .think
        .as_ref()
        .map(|state| StepScheduler::has_deadlock(&ctx.record.plan, state))
        .unwrap_or(false);
    let reason = if deadlocked {
        "steps wait on failed steps"
    } else {
        "steps can no longer run"
    };
    ctx.finish_failed(format!("{}: {}", reason, blocked.join(", ")))?;
    Ok(Flow::Finished)
}

async fn run_batch(
    deps: &RunDeps,
    ctx: &mut RunContext,
    hints: &Arc<Hints>,
    pulse: &PulseSink,
    batch: Vec<usize>,
) -> Result<Flow> {
    for &index in &batch {
        ctx.set_step_status(index, StepStatus::Running, None, None)?;
    }
    ctx.persist()?;
    let titles: Vec<String> = batch
        .iter()
        .filter_map(|i| ctx.record.plan.get(*i).map(|s| s.title.clone()))
        .collect();
    ctx.progress(format!("Running {} step(s): {}", batch.len(), titles.join("; ")));
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            run_id: Some(&ctx.record.run_id),
            detail: Some(&format!("{:?}", batch)),
            ..ObservabilityEvent::new("think.batch", COMPONENT)
        },
    );

    let mut lanes = JoinSet::new();
    for &index in &batch {
        let role = ctx
            .record
            .state
            .think
            .as_ref()
            .map(|s| s.role_of(index))
            .unwrap_or(autorun_types::ExecutorRole::Generic);
        let request = deps.step_request(&ctx.record, index, hints, deps.config.think.roles.get(&role));
        let steps = deps.steps.clone();
        let pulse = pulse.clone();
        let period = deps.config.step_heartbeat();
        lanes.spawn(async move {
            let outcome = pulse
                .while_running("step", period, steps.run_step(&request))
                .await;
            (index, outcome)
        });
    }

    let mut outcomes: Vec<(usize, StepOutcome)> = Vec::new();
    while let Some(joined) = lanes.join_next().await {
        match joined {
            Ok(result) => outcomes.push(result),
            Err(err) => tracing::warn!(error = %err, "step lane failed"),
        }
    }
    let finished: HashSet<usize> = outcomes.iter().map(|(i, _)| *i).collect();
    for &index in batch.iter().filter(|i| !finished.contains(i)) {
        outcomes.push((
            index,
            StepOutcome::Failed {
                class: FailureClass::StepExecution,
                kind: None,
                message: "step lane aborted".to_string(),
            },
        ));
    }
    outcomes.sort_by_key(|(i, _)| *i);

    // Keyed by step id: fix steps inserted below shift the asking steps.
    let mut asked: Vec<(String, String)> = Vec::new();
    let mut failures: Vec<(usize, FailureClass, Option<ActionKind>, String)> = Vec::new();
    for (index, outcome) in outcomes {
        let step_id = ctx
            .record
            .plan
            .get(index)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        match outcome {
            StepOutcome::Completed {
                kind,
                summary,
                llm_text,
                patch,
            } => {
                ctx.observe(Observation::new(index, &step_id, Some(kind), true, &summary));
                if let Some(text) = llm_text {
                    ctx.record.state.output.last_llm_response = Some(text);
                }
                ctx.set_step_status(index, StepStatus::Done, Some(kind), Some(&summary))?;
                if patch.is_some() {
                    ctx.observe(Observation::new(
                        index,
                        &step_id,
                        Some(kind),
                        false,
                        "plan_patch ignored: steps run concurrently in think mode",
                    ));
                }
            }
            StepOutcome::NeedsInput { question } => {
                ctx.set_step_status(index, StepStatus::Waiting, Some(ActionKind::AskUser), None)?;
                asked.push((step_id, question));
            }
            StepOutcome::Final { content } => {
                ctx.observe(Observation::new(
                    index,
                    &step_id,
                    Some(ActionKind::FinalOutput),
                    true,
                    "final output produced",
                ));
                ctx.set_step_status(index, StepStatus::Done, Some(ActionKind::FinalOutput), None)?;
                ctx.record_output(content)?;
            }
            StepOutcome::Failed {
                class,
                kind,
                message,
            } => {
                ctx.observe(Observation::new(index, &step_id, kind, false, &message));
                ctx.set_step_status(index, StepStatus::Failed, kind, Some(&message))?;
                failures.push((index, class, kind, message));
            }
        }
    }
    ctx.persist()?;

    if !failures.is_empty() {
        if let Some(flow) = recover(deps, ctx, pulse, failures).await? {
            return Ok(flow);
        }
    }

    let waiting: Vec<(usize, String)> = asked
        .into_iter()
        .filter_map(|(id, question)| {
            ctx.record
                .plan
                .steps
                .iter()
                .position(|s| s.id == id)
                .map(|index| (index, question))
        })
        .collect();
    if let Some((index, question)) = waiting.first().cloned() {
        let batch: Vec<usize> = waiting.iter().map(|(i, _)| *i).collect();
        ctx.pause(question, PauseKind::UserInput, index, batch)?;
        return Ok(Flow::Paused);
    }

    let progress = StepScheduler::progress(&ctx.record.plan);
    ctx.progress(format!(
        "Progress: {}/{} steps settled ({:.0}%)",
        progress.done + progress.skipped,
        progress.total,
        progress.completion_percentage() * 100.0
    ));
    Ok(Flow::Continue)
}

/// Reflects on each failed step, latest first so earlier indices stay valid.
/// Returns a flow when the run had to end.
async fn recover(
    deps: &RunDeps,
    ctx: &mut RunContext,
    pulse: &PulseSink,
    mut failures: Vec<(usize, FailureClass, Option<ActionKind>, String)>,
) -> Result<Option<Flow>> {
    let budgets = &deps.config.budgets;
    let reflector = Reflector::new(deps.steps.gateway().clone(), deps.config.clone());
    failures.sort_by(|a, b| b.0.cmp(&a.0));

    for (index, class, kind, message) in failures {
        let step_id = ctx
            .record
            .plan
            .get(index)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        let hits = ctx
            .record
            .state
            .failures
            .record(&failure_signature(kind, &message));
        tracing::warn!(
            run_id = %ctx.record.run_id,
            step = index,
            class = class.as_str(),
            hits,
            "think step failed: {}",
            message
        );
        if hits > budgets.repeat_failure_budget {
            ctx.record.state.critical_failure = Some(message.clone());
            ctx.finish_failed(format!("step `{}` keeps failing: {}", step_id, message))?;
            return Ok(Some(Flow::Finished));
        }
        if ctx.record.state.recovery.reflection_attempts >= budgets.max_reflections {
            ctx.finish_failed(format!(
                "step `{}` failed and the reflection budget is spent: {}",
                step_id, message
            ))?;
            return Ok(Some(Flow::Finished));
        }
        ctx.record.state.recovery.reflection_attempts += 1;

        let observations = deps.recent_observations(&ctx.record);
        let request = ReflectRequest {
            message: &ctx.record.message,
            plan: &ctx.record.plan,
            failed: index,
            error: &message,
            observations: &observations,
            run_id: &ctx.record.run_id,
        };
        let fix = pulse
            .while_running(
                "reflection",
                deps.config.step_heartbeat(),
                reflector.reflect(&request),
            )
            .await;
        if fix.is_empty() || !insert_fix_steps(ctx, index, fix, budgets.max_steps)? {
            ctx.finish_failed(format!(
                "step `{}` failed and reflection found no fix: {}",
                step_id, message
            ))?;
            return Ok(Some(Flow::Finished));
        }
    }
    ctx.persist()?;
    Ok(None)
}

/// Inserts fix steps right after `failed` and retires the failed step. A
/// failed terminal step keeps its place at the end; the fixes go before it
/// and it runs again.
fn insert_fix_steps(
    ctx: &mut RunContext,
    failed: usize,
    fix: Vec<PatchStep>,
    max_steps: usize,
) -> Result<bool> {
    if ctx.record.plan.len() + fix.len() > max_steps {
        return Ok(false);
    }
    let terminal = ctx
        .record
        .plan
        .get(failed)
        .map(|s| s.is_terminal())
        .unwrap_or(false);
    let cursor = if terminal {
        match failed.checked_sub(1) {
            Some(before) => before,
            None => return Ok(false),
        }
    } else {
        failed
    };
    let patch = PlanPatch {
        step_index: cursor + 1,
        insert_steps: fix,
        ..PlanPatch::default()
    };
    let count = match ctx.record.plan.apply_patch(cursor, &patch) {
        Ok(PatchEffect::Inserted { count, .. }) => count,
        Ok(PatchEffect::Replaced { .. }) => return Ok(false),
        Err(err) => {
            tracing::warn!(run_id = %ctx.record.run_id, error = %err, "fix steps rejected");
            return Ok(false);
        }
    };

    if terminal {
        let moved = failed + count;
        ctx.set_step_status(moved, StepStatus::Pending, None, Some("retry after fix steps"))?;
        if let Some(state) = ctx.record.state.think.as_mut() {
            relink_from(state, &ctx.record.plan, failed);
        }
    } else {
        ctx.set_step_status(failed, StepStatus::Skipped, None, Some("replaced by fix steps"))?;
        if let Some(state) = ctx.record.state.think.as_mut() {
            state.insert_fix_steps(failed, count);
        }
    }
    ctx.refresh_plan();
    ctx.progress(format!("Inserted {} fix step(s) after step {}", count, failed + 1));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autorun_types::Step;

    fn plan() -> Plan {
        Plan::new(
            vec![
                Step::new("a", "write_file:a.md intro", [ActionKind::WriteFile]),
                Step::new("b", "write_file:b.py code", [ActionKind::WriteFile]),
                Step::new("c", "shell_command: test b.py", [ActionKind::ShellCommand]),
                Step::new("z", "final_output", [ActionKind::FinalOutput]),
            ],
            vec![],
        )
    }

    #[test]
    fn dependency_reply_maps_ids_to_indices() {
        let deps = parse_dependencies(
            r#"{"dependencies":[{"step":"c","after":["b","b"]},{"step":"z","after":["a","c"]}]}"#,
            &plan(),
        )
        .unwrap();
        assert_eq!(deps.get(&2), Some(&vec![1]));
        assert_eq!(deps.get(&3), Some(&vec![0, 2]));
        assert!(!deps.contains_key(&0));
    }

    #[test]
    fn dependency_reply_rejects_unknown_ids_and_cycles() {
        assert!(parse_dependencies(r#"{"dependencies":[{"step":"c","after":["nope"]}]}"#, &plan())
            .is_err());
        assert!(parse_dependencies(
            r#"{"dependencies":[{"step":"a","after":["b"]},{"step":"b","after":["a"]}]}"#,
            &plan()
        )
        .is_err());
    }

    #[test]
    fn settle_reports_steps_stuck_behind_a_failed_step() {
        let llm = crate::testing::ScriptedLlm::new();
        let config = Arc::new(crate::config::EngineConfig::default());
        let gateway = crate::testing::gateway(llm);
        let store = Arc::new(crate::store::MemoryRunStore::new());
        let deps = RunDeps {
            config: config.clone(),
            planner: crate::plan::Planner::new(gateway.clone(), config.clone()),
            steps: crate::step_exec::StepExecutor::new(
                gateway,
                crate::testing::RecordingExecutor::new("."),
                Arc::new(crate::collaborators::KeepAskUser),
                config,
            ),
            hints: Arc::new(crate::collaborators::NoHints),
            store: store.clone(),
        };
        let mut record = RunRecord::new("t1", "ship it", autorun_types::RunMode::Think);
        record.plan = plan();
        record.plan.steps[0].status = StepStatus::Failed;
        record.state.think = Some(ThinkState {
            dependencies: linear_dependencies(&record.plan),
            ..ThinkState::default()
        });
        let mut ctx = RunContext::new(record, store);

        assert_eq!(settle(&deps, &mut ctx).unwrap(), Flow::Finished);
        let error = ctx.record.error.clone().unwrap();
        assert_eq!(error, "steps wait on failed steps: a, b, c, z");
        assert_eq!(ctx.record.status, autorun_types::RunStatus::Failed);
    }

    #[test]
    fn relink_chains_new_steps() {
        let mut state = ThinkState::default();
        state.dependencies.insert(2, vec![0, 1]);
        state.dependencies.insert(3, vec![2]);
        let mut changed = plan();
        changed.insert_steps(
            3,
            vec![Step::new("w", "write_file:out.txt", [ActionKind::WriteFile])],
        );
        relink_from(&mut state, &changed, 3);
        assert_eq!(state.deps_of(2), &[0, 1]);
        assert_eq!(state.deps_of(3), &[2]);
        assert_eq!(state.deps_of(4), &[3]);
        assert_eq!(state.role_of(3), autorun_types::ExecutorRole::Doc);
    }
}
