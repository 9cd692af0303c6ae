//! Preconditions checked before a step that may produce the final output.

use std::path::{Component, Path, PathBuf};

use tracing::Level;

use autorun_observability::{emit_event, ObservabilityEvent, ProcessKind};
use autorun_types::{ActionKind, Observation, Plan, RecoveryCounters, StepStatus};

use crate::collaborators::Hints;
use crate::config::EngineConfig;
use crate::plan::{artifact_write_step, Planner, ReplanRequest};
use crate::pulse::PulseSink;

const COMPONENT: &str = "gates";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    /// Write steps were inserted at the cursor; run the cursor again.
    Retry { inserted: usize },
    /// The plan was replaced; continue at this index.
    Jump(usize),
    Fail(String),
}

pub struct GateEnv<'a> {
    pub config: &'a EngineConfig,
    pub planner: &'a Planner,
    pub message: &'a str,
    pub hints: &'a Hints,
    pub run_id: &'a str,
    pub pulse: &'a PulseSink,
}

/// Resolves `artifact` lexically under `root`. `None` for absolute paths and
/// paths that climb out of the root.
pub fn workspace_path(root: &Path, artifact: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(artifact.trim()).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(relative))
}

pub fn escaping_artifacts(config: &EngineConfig, plan: &Plan) -> Vec<String> {
    plan.artifacts
        .iter()
        .filter(|a| workspace_path(&config.workspace_root, a).is_none())
        .cloned()
        .collect()
}

pub fn missing_artifacts(config: &EngineConfig, plan: &Plan) -> Vec<String> {
    plan.artifacts
        .iter()
        .filter(|a| match workspace_path(&config.workspace_root, a) {
            Some(path) => !path.exists(),
            None => true,
        })
        .cloned()
        .collect()
}

pub fn has_verification_step(config: &EngineConfig, plan: &Plan, before: usize) -> bool {
    plan.steps[..before.min(plan.len())].iter().any(|s| {
        s.status == StepStatus::Done
            && (s.allows(ActionKind::ShellCommand) || s.allows(ActionKind::ToolCall))
            && config.is_verification_title(&s.title)
    })
}

/// Evaluates the artifacts, prior-failure and validation-step gates, in that
/// order, for the terminal step at `cursor`.
pub async fn output_gates(
    env: &GateEnv<'_>,
    plan: &mut Plan,
    recovery: &mut RecoveryCounters,
    observations: &[Observation],
    cursor: usize,
) -> GateOutcome {
    let budgets = &env.config.budgets;

    let escaping = escaping_artifacts(env.config, plan);
    if !escaping.is_empty() {
        emit_gate(env.run_id, "artifacts", "fail", &escaping.join(", "));
        return GateOutcome::Fail(format!(
            "declared artifacts outside the workspace: {}",
            escaping.join(", ")
        ));
    }

    let missing = missing_artifacts(env.config, plan);
    if !missing.is_empty() {
        let fits = plan.len() + missing.len() <= budgets.max_steps;
        if recovery.artifact_autofix_attempts < budgets.max_artifact_autofix && fits {
            recovery.artifact_autofix_attempts += 1;
            let steps = missing
                .iter()
                .map(|artifact| artifact_write_step(plan, artifact))
                .collect::<Vec<_>>();
            let inserted = plan.insert_steps(cursor, steps);
            plan.bump();
            emit_gate(env.run_id, "artifacts", "autofix", &missing.join(", "));
            return GateOutcome::Retry { inserted };
        }
        emit_gate(env.run_id, "artifacts", "fail", &missing.join(", "));
        return GateOutcome::Fail(format!("declared artifacts missing: {}", missing.join(", ")));
    }

    let failed: Vec<&str> = plan.steps[..cursor.min(plan.len())]
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .map(|s| s.id.as_str())
        .collect();
    if !failed.is_empty() {
        let error = format!("earlier steps failed: {}", failed.join(", "));
        return replan_or_fail(env, plan, recovery, observations, cursor, "prior_failure", error)
            .await;
    }

    if !plan.artifacts.is_empty() && !has_verification_step(env.config, plan, cursor) {
        let error = format!(
            "artifacts {} were never verified; add a shell_command or tool_call step that checks them",
            plan.artifacts.join(", ")
        );
        return replan_or_fail(env, plan, recovery, observations, cursor, "validation_step", error)
            .await;
    }

    GateOutcome::Pass
}

async fn replan_or_fail(
    env: &GateEnv<'_>,
    plan: &mut Plan,
    recovery: &mut RecoveryCounters,
    observations: &[Observation],
    cursor: usize,
    gate: &str,
    error: String,
) -> GateOutcome {
    let replanned = env
        .planner
        .replan(
            &ReplanRequest {
                message: env.message,
                plan,
                keep: cursor,
                error: &error,
                observations,
                hints: env.hints,
                run_id: env.run_id,
            },
            recovery,
            env.pulse,
        )
        .await;
    match replanned {
        Some(next) => {
            let resume = next
                .steps
                .iter()
                .position(|s| s.status == StepStatus::Pending)
                .unwrap_or(cursor);
            *plan = next;
            emit_gate(env.run_id, gate, "replanned", &error);
            GateOutcome::Jump(resume)
        }
        None => {
            emit_gate(env.run_id, gate, "fail", &error);
            GateOutcome::Fail(error)
        }
    }
}

fn emit_gate(run_id: &str, gate: &str, status: &str, detail: &str) {
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            run_id: Some(run_id),
            action: Some(gate),
            status: Some(status),
            detail: Some(detail),
            ..ObservabilityEvent::new("gate", COMPONENT)
        },
    );
}
