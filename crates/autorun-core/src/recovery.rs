//! Failure classes and the shared recovery ladder for step failures.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Budgets;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// No parseable or schema-valid action after all attempts.
    ActionInvalid,
    /// The action type stayed outside the step's allow-set.
    AllowViolation,
    /// The executor (or an engine-handled action) reported an error.
    StepExecution,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::ActionInvalid => "action_invalid",
            FailureClass::AllowViolation => "allow_violation",
            FailureClass::StepExecution => "step_execution",
        }
    }
}

/// What to do when replanning is not possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Skip,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Replan { or_else: Fallback },
    Skip,
    /// Repeat-failure budget tripped: stop without replanning.
    CriticalStop,
}

static FORCE_REPLAN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)(connection (refused|reset|closed)|network|dns|timed? ?out|unreachable|requires non-empty|missing field|empty response)",
    )
    .ok()
});

/// Errors that another attempt at the same step will not fix.
pub fn forces_replan(message: &str) -> bool {
    FORCE_REPLAN
        .as_ref()
        .map(|re| re.is_match(message))
        .unwrap_or(false)
}

/// Chooses the recovery for a failed step. `plan_exhausted` is true when no
/// work step follows the failed one; `hits` is the failure signature count
/// after recording this failure.
pub fn plan_recovery(
    class: FailureClass,
    message: &str,
    plan_exhausted: bool,
    hits: u32,
    budgets: &Budgets,
) -> Recovery {
    let fallback = if plan_exhausted {
        Fallback::Fail
    } else {
        Fallback::Skip
    };
    match class {
        FailureClass::ActionInvalid => {
            if plan_exhausted || forces_replan(message) {
                Recovery::Replan { or_else: fallback }
            } else {
                Recovery::Skip
            }
        }
        // A disallowed action never fails the run on its own.
        FailureClass::AllowViolation => Recovery::Replan {
            or_else: Fallback::Skip,
        },
        FailureClass::StepExecution => {
            if hits > budgets.repeat_failure_budget {
                Recovery::CriticalStop
            } else {
                Recovery::Replan { or_else: fallback }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_action_skips_unless_forced() {
        let budgets = Budgets::default();
        assert_eq!(
            plan_recovery(FailureClass::ActionInvalid, "bad json", false, 1, &budgets),
            Recovery::Skip
        );
        assert_eq!(
            plan_recovery(
                FailureClass::ActionInvalid,
                "write_file requires non-empty `path`",
                false,
                1,
                &budgets
            ),
            Recovery::Replan {
                or_else: Fallback::Skip
            }
        );
        assert_eq!(
            plan_recovery(FailureClass::ActionInvalid, "bad json", true, 1, &budgets),
            Recovery::Replan {
                or_else: Fallback::Fail
            }
        );
    }

    #[test]
    fn repeated_execution_failure_trips_breaker() {
        let budgets = Budgets {
            repeat_failure_budget: 2,
            ..Budgets::default()
        };
        assert_eq!(
            plan_recovery(FailureClass::StepExecution, "boom", false, 2, &budgets),
            Recovery::Replan {
                or_else: Fallback::Skip
            }
        );
        assert_eq!(
            plan_recovery(FailureClass::StepExecution, "boom", false, 3, &budgets),
            Recovery::CriticalStop
        );
    }

    #[test]
    fn allow_violation_always_tries_replan() {
        assert_eq!(
            plan_recovery(FailureClass::AllowViolation, "", false, 9, &Budgets::default()),
            Recovery::Replan {
                or_else: Fallback::Skip
            }
        );
    }

    #[test]
    fn allow_violation_on_last_step_degrades_to_skip() {
        assert_eq!(
            plan_recovery(FailureClass::AllowViolation, "", true, 1, &Budgets::default()),
            Recovery::Replan {
                or_else: Fallback::Skip
            }
        );
    }
}
