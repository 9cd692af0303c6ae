// Static executor-role assignment for think-mode steps.

use std::collections::BTreeMap;

use autorun_types::{ActionKind, ExecutorRole, Plan, Step};

const TEST_WORDS: &[&str] = &["test", "verify", "check", "validate", "assert", "lint"];
const DOC_WORDS: &[&str] = &[
    ".md", ".txt", ".rst", "readme", "doc", "report", "summary", "summarize", "article", "write up",
];
const CODE_WORDS: &[&str] = &[
    "code", "implement", "script", "function", "refactor", "compile", "build", ".py", ".rs", ".js",
    ".ts", ".go", ".sh",
];

fn mentions(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Keyword heuristic over the title and brief. Test wins over doc, doc over
/// code.
pub fn assign_role(step: &Step) -> ExecutorRole {
    let text = format!("{} {}", step.title, step.brief).to_lowercase();
    if mentions(&text, TEST_WORDS) {
        return ExecutorRole::Test;
    }
    if mentions(&text, DOC_WORDS) {
        return ExecutorRole::Doc;
    }
    if mentions(&text, CODE_WORDS) || step.allows(ActionKind::ShellCommand) {
        return ExecutorRole::Code;
    }
    ExecutorRole::Generic
}

pub fn assign_roles(plan: &Plan) -> BTreeMap<usize, ExecutorRole> {
    plan.work_steps()
        .map(|(i, step)| (i, assign_role(step)))
        .collect()
}
