//! Plan lifecycle: parsing planner output, repairing it, and replanning.

mod parse;
mod planner;
mod repair;

pub use parse::{
    is_bare_json_object, normalize_artifacts, normalize_path, normalize_plan, parse_bare,
    parse_lenient, PlanDraft, RawPlan, RawStep,
};
pub use planner::{PlanRequest, Planner, ReplanRequest};
pub use repair::{artifact_write_step, repair_plan, write_target, RepairReport};
