// Think-mode step scheduler
// Dependency-aware batching over plan indices

use std::collections::{BTreeMap, HashSet};

use autorun_types::{Plan, StepStatus, ThinkState};

// ============================================================================
// Step Scheduler
// ============================================================================

pub struct StepScheduler;

impl StepScheduler {
    /// Pending work steps whose dependencies are all settled. The terminal
    /// step is only runnable alone, once every other work step is settled.
    pub fn runnable(plan: &Plan, think: &ThinkState) -> Vec<usize> {
        let terminal = plan.terminal_index();
        let settled = |index: usize| {
            plan.get(index)
                .map(|s| s.status.is_settled())
                .unwrap_or(true)
        };

        let ready: Vec<usize> = plan
            .work_steps()
            .filter(|(i, s)| s.status == StepStatus::Pending && Some(*i) != terminal)
            .filter(|(i, _)| think.deps_of(*i).iter().all(|d| settled(*d)))
            .map(|(i, _)| i)
            .collect();
        if !ready.is_empty() {
            return ready;
        }

        match terminal {
            Some(t) if plan.steps[t].status == StepStatus::Pending => {
                let others_settled = plan
                    .work_steps()
                    .filter(|(i, _)| *i != t)
                    .all(|(_, s)| s.status.is_settled());
                if others_settled {
                    vec![t]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Every work step is done or skipped.
    pub fn all_settled(plan: &Plan) -> bool {
        plan.work_steps().all(|(_, s)| s.status.is_settled())
    }

    /// A pending step waits on a failed one and can never run.
    pub fn has_deadlock(plan: &Plan, think: &ThinkState) -> bool {
        let failed: HashSet<usize> = plan
            .work_steps()
            .filter(|(_, s)| s.status == StepStatus::Failed)
            .map(|(i, _)| i)
            .collect();
        plan.work_steps().any(|(i, s)| {
            s.status == StepStatus::Pending && think.deps_of(i).iter().any(|d| failed.contains(d))
        })
    }

    /// Detect cycles in the dependency edges
    pub fn detect_cycle(dependencies: &BTreeMap<usize, Vec<usize>>) -> Option<Vec<usize>> {
        for &step in dependencies.keys() {
            let mut visited = HashSet::new();
            let mut path = Vec::new();

            if Self::dfs_cycle(step, dependencies, &mut visited, &mut path) {
                return Some(path);
            }
        }

        None
    }

    fn dfs_cycle(
        step: usize,
        dependencies: &BTreeMap<usize, Vec<usize>>,
        visited: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> bool {
        if path.contains(&step) {
            path.push(step);
            return true;
        }

        if visited.contains(&step) {
            return false;
        }

        visited.insert(step);
        path.push(step);

        if let Some(edges) = dependencies.get(&step) {
            for &dep in edges {
                if Self::dfs_cycle(dep, dependencies, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }

    /// Validate dependency edges against the plan
    pub fn validate(
        plan: &Plan,
        dependencies: &BTreeMap<usize, Vec<usize>>,
    ) -> Result<(), SchedulerError> {
        let work: HashSet<usize> = plan.work_steps().map(|(i, _)| i).collect();

        for (&step, edges) in dependencies {
            if !work.contains(&step) {
                return Err(SchedulerError::InvalidDependency {
                    step,
                    dependency: step,
                });
            }
            for &dep in edges {
                if dep == step {
                    return Err(SchedulerError::SelfDependency { step });
                }
                if !work.contains(&dep) {
                    return Err(SchedulerError::InvalidDependency {
                        step,
                        dependency: dep,
                    });
                }
            }
        }

        if let Some(cycle) = Self::detect_cycle(dependencies) {
            return Err(SchedulerError::CycleDetected { path: cycle });
        }

        Ok(())
    }

    pub fn progress(plan: &Plan) -> StepProgress {
        let mut progress = StepProgress::default();

        for (_, step) in plan.work_steps() {
            match step.status {
                StepStatus::Pending => progress.pending += 1,
                StepStatus::Running => progress.running += 1,
                StepStatus::Waiting => progress.waiting += 1,
                StepStatus::Done => progress.done += 1,
                StepStatus::Failed => progress.failed += 1,
                StepStatus::Skipped => progress.skipped += 1,
            }
            progress.total += 1;
        }

        progress
    }
}

/// Each work step depends on the one before it.
pub fn linear_dependencies(plan: &Plan) -> BTreeMap<usize, Vec<usize>> {
    let mut dependencies = BTreeMap::new();
    let mut previous: Option<usize> = None;
    for (i, _) in plan.work_steps() {
        if let Some(p) = previous {
            dependencies.insert(i, vec![p]);
        }
        previous = Some(i);
    }
    dependencies
}

/// Scheduler validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    InvalidDependency { step: usize, dependency: usize },
    SelfDependency { step: usize },
    CycleDetected { path: Vec<usize> },
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDependency { step, dependency } => {
                write!(f, "Step {} has invalid dependency {}", step, dependency)
            }
            Self::SelfDependency { step } => write!(f, "Step {} depends on itself", step),
            Self::CycleDetected { path } => {
                let path: Vec<String> = path.iter().map(|i| i.to_string()).collect();
                write!(f, "Cycle detected in step graph: {}", path.join(" -> "))
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Step progress summary
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StepProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub waiting: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StepProgress {
    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.done + self.skipped) as f64 / self.total as f64
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
