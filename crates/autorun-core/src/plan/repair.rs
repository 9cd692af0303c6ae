use std::collections::HashSet;

use autorun_types::{ActionKind, Plan, Step};

use super::parse::normalize_path;
use crate::error::{PlanFailure, PlanFailureCode};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub dropped: usize,
    pub inserted: usize,
    pub reordered: usize,
    pub appended_terminal: bool,
}

impl RepairReport {
    pub fn is_noop(&self) -> bool {
        *self == RepairReport::default()
    }
}

pub fn write_target(step: &Step) -> Option<String> {
    if !step.allows(ActionKind::WriteFile) {
        return None;
    }
    step.title_target("write_file").map(|t| normalize_path(&t))
}

fn only_writes(step: &Step) -> bool {
    step.allow.len() == 1 && step.allows(ActionKind::WriteFile)
}

fn mentions(step: &Step, path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    [step.title.as_str(), step.brief.as_str()]
        .iter()
        .any(|text| text.contains(path) || (!file_name.is_empty() && text.contains(file_name)))
}

pub fn artifact_write_step(plan: &Plan, artifact: &str) -> Step {
    Step::new(
        plan.unique_id("write_artifact"),
        format!("write_file:{} create the declared artifact", artifact),
        [ActionKind::WriteFile],
    )
    .with_brief(format!("Write {}", artifact))
}

/// Repairs artifact coverage and ordering in the steps after `frozen`, then
/// checks the terminal-step invariant. Steps before `frozen` are never touched.
pub fn repair_plan(
    plan: &mut Plan,
    frozen: usize,
    max_steps: usize,
) -> Result<RepairReport, PlanFailure> {
    let frozen = frozen.min(plan.len());
    let mut report = RepairReport::default();

    if plan.terminal_index().is_none() && plan.len() < max_steps {
        let step = Step::new(
            plan.unique_id("final_output"),
            "final_output summarize the result",
            [ActionKind::FinalOutput],
        )
        .with_brief("Report the outcome to the user");
        let at = plan
            .steps
            .iter()
            .position(Step::is_feedback)
            .unwrap_or(plan.len())
            .max(frozen);
        plan.insert_steps(at, vec![step]);
        report.appended_terminal = true;
    }

    if !plan.artifacts.is_empty() {
        let declared: HashSet<&str> = plan.artifacts.iter().map(String::as_str).collect();
        let before = plan.len();
        let mut index = 0;
        plan.steps.retain(|step| {
            let keep = index < frozen
                || !only_writes(step)
                || match write_target(step) {
                    Some(target) => declared.contains(target.as_str()),
                    None => true,
                };
            index += 1;
            keep
        });
        report.dropped = before - plan.len();

        let covered: HashSet<String> = plan.steps.iter().filter_map(write_target).collect();
        let missing: Vec<String> = plan
            .artifacts
            .iter()
            .filter(|a| !covered.contains(a.as_str()))
            .cloned()
            .collect();
        let budget = max_steps.saturating_sub(plan.len());
        let mut at = plan.terminal_index().unwrap_or(plan.len()).max(frozen);
        for artifact in missing.iter().take(budget) {
            let step = artifact_write_step(plan, artifact);
            plan.insert_steps(at, vec![step]);
            at += 1;
            report.inserted += 1;
        }

        if plan.write_step_count() < plan.artifacts.len() {
            return Err(PlanFailure::new(
                PlanFailureCode::InvariantViolation,
                format!(
                    "{} artifacts declared but only {} write_file steps fit the step budget",
                    plan.artifacts.len(),
                    plan.write_step_count()
                ),
            ));
        }
    }

    report.reordered = reorder_writes_before_use(plan, frozen);

    plan.validate().map_err(|e| {
        PlanFailure::new(PlanFailureCode::InvariantViolation, e.to_string())
    })?;
    Ok(report)
}

/// Moves a write step ahead of the first earlier shell/tool step that
/// mentions the written path.
fn reorder_writes_before_use(plan: &mut Plan, frozen: usize) -> usize {
    let mut moved = 0;
    let mut j = frozen;
    // Each move shifts a step strictly earlier, so the pass terminates.
    while j < plan.len() {
        let Some(path) = write_target(&plan.steps[j]) else {
            j += 1;
            continue;
        };
        let user = (frozen..j).find(|&i| {
            let step = &plan.steps[i];
            (step.allows(ActionKind::ShellCommand) || step.allows(ActionKind::ToolCall))
                && !step.allows(ActionKind::WriteFile)
                && mentions(step, &path)
        });
        match user {
            Some(i) => {
                let step = plan.steps.remove(j);
                plan.steps.insert(i, step);
                moved += 1;
                j += 1;
            }
            None => j += 1,
        }
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use autorun_types::StepStatus;

    fn step(id: &str, title: &str, kind: ActionKind) -> Step {
        Step::new(id, title, [kind])
    }

    #[test]
    fn inserts_missing_artifact_writes_before_terminal() {
        let mut plan = Plan::new(
            vec![
                step("a", "write_file:a.txt", ActionKind::WriteFile),
                step("z", "final_output", ActionKind::FinalOutput),
            ],
            vec!["a.txt".to_string(), "b.txt".to_string()],
        );
        let report = repair_plan(&mut plan, 0, 10).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(plan.len(), 3);
        assert_eq!(write_target(&plan.steps[1]).as_deref(), Some("b.txt"));
        assert!(plan.steps[2].is_terminal());
    }

    #[test]
    fn fails_when_budget_cannot_cover_artifacts() {
        let mut plan = Plan::new(
            vec![step("z", "final_output", ActionKind::FinalOutput)],
            vec!["a.txt".to_string(), "b.txt".to_string()],
        );
        let err = repair_plan(&mut plan, 0, 2).unwrap_err();
        assert_eq!(err.code, PlanFailureCode::InvariantViolation);
    }

    #[test]
    fn drops_undeclared_write_steps() {
        let mut plan = Plan::new(
            vec![
                step("a", "write_file:a.txt", ActionKind::WriteFile),
                step("x", "write_file:scratch.txt", ActionKind::WriteFile),
                step("z", "final_output", ActionKind::FinalOutput),
            ],
            vec!["a.txt".to_string()],
        );
        let report = repair_plan(&mut plan, 0, 10).unwrap();
        assert_eq!(report.dropped, 1);
        assert!(plan.steps.iter().all(|s| s.id != "x"));
    }

    #[test]
    fn frozen_history_is_untouched() {
        let mut failed = step("x", "write_file:scratch.txt", ActionKind::WriteFile);
        failed.status = StepStatus::Skipped;
        let mut plan = Plan::new(
            vec![
                failed.clone(),
                step("a", "write_file:a.txt", ActionKind::WriteFile),
                step("z", "final_output", ActionKind::FinalOutput),
            ],
            vec!["a.txt".to_string()],
        );
        repair_plan(&mut plan, 1, 10).unwrap();
        assert_eq!(plan.steps[0], failed);
    }

    #[test]
    fn script_is_written_before_it_runs() {
        let mut plan = Plan::new(
            vec![
                step("run", "shell_command: bash build.sh", ActionKind::ShellCommand),
                step("w", "write_file:build.sh", ActionKind::WriteFile),
                step("z", "final_output", ActionKind::FinalOutput),
            ],
            vec!["build.sh".to_string()],
        );
        let report = repair_plan(&mut plan, 0, 10).unwrap();
        assert_eq!(report.reordered, 1);
        assert_eq!(plan.steps[0].id, "w");
        assert_eq!(plan.steps[1].id, "run");
    }

    #[test]
    fn appends_missing_terminal_and_rejects_misplaced_one() {
        let mut plan = Plan::new(vec![step("a", "do work", ActionKind::LlmCall)], vec![]);
        let report = repair_plan(&mut plan, 0, 10).unwrap();
        assert!(report.appended_terminal);
        assert!(plan.steps[1].is_terminal());

        let mut bad = Plan::new(
            vec![
                step("z", "final_output", ActionKind::FinalOutput),
                step("a", "do work", ActionKind::LlmCall),
            ],
            vec![],
        );
        let err = repair_plan(&mut bad, 0, 10).unwrap_err();
        assert_eq!(err.code, PlanFailureCode::InvariantViolation);
    }
}
