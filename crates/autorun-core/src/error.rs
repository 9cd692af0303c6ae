use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason codes for a failed planning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFailureCode {
    LlmCallFailed,
    InvalidJson,
    EmptyPlan,
    InvariantViolation,
    Timeout,
}

impl PlanFailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanFailureCode::LlmCallFailed => "llm_call_failed",
            PlanFailureCode::InvalidJson => "invalid_json",
            PlanFailureCode::EmptyPlan => "empty_plan",
            PlanFailureCode::InvariantViolation => "invariant_violation",
            PlanFailureCode::Timeout => "timeout",
        }
    }

    fn public_message(self) -> &'static str {
        match self {
            PlanFailureCode::LlmCallFailed => "The planner model could not be reached.",
            PlanFailureCode::InvalidJson => "The planner did not return a usable plan.",
            PlanFailureCode::EmptyPlan => "The planner returned an empty plan.",
            PlanFailureCode::InvariantViolation => {
                "The planner returned a plan that could not be repaired."
            }
            PlanFailureCode::Timeout => "Planning took too long and was abandoned.",
        }
    }
}

/// Terminal failure of one planning attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("plan failed ({}): {detail}", .code.as_str())]
pub struct PlanFailure {
    pub code: PlanFailureCode,
    pub public_message: String,
    pub detail: String,
}

impl PlanFailure {
    pub fn new(code: PlanFailureCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            public_message: code.public_message().to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Plan(#[from] PlanFailure),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_failure_carries_public_message() {
        let failure = PlanFailure::new(PlanFailureCode::EmptyPlan, "steps: []");
        assert_eq!(failure.public_message, "The planner returned an empty plan.");
        assert_eq!(failure.to_string(), "plan failed (empty_plan): steps: []");
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["code"], "empty_plan");
    }
}
