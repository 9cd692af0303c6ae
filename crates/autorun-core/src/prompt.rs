//! Bounded prompt assembly.
//!
//! Prompts are built from titled sections. Each section is capped, runs of
//! blank lines are collapsed, and the whole prompt is tail-truncated to the
//! total cap.

use autorun_types::{ActionKind, Observation, Plan, Step};

use crate::collaborators::Hints;
use crate::config::PromptConfig;

const TRUNCATION_MARK: &str = "\n[...truncated]";

pub struct PromptBuilder<'a> {
    config: &'a PromptConfig,
    sections: Vec<(String, String)>,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(config: &'a PromptConfig) -> Self {
        Self {
            config,
            sections: Vec::new(),
        }
    }

    pub fn section(mut self, title: &str, body: impl AsRef<str>) -> Self {
        let body = collapse_blank_lines(body.as_ref());
        if !body.trim().is_empty() {
            let body = truncate_tail(&body, self.config.section_max_chars);
            self.sections.push((title.to_string(), body));
        }
        self
    }

    pub fn build(self) -> String {
        let mut out = String::new();
        for (title, body) in &self.sections {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str("## ");
            out.push_str(title);
            out.push('\n');
            out.push_str(body.trim_end());
        }
        truncate_tail(&out, self.config.total_max_chars)
    }
}

pub fn collapse_blank_lines(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut blank_run = 0;
    for line in input.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Keeps the head, cuts the tail, on char boundaries.
pub fn truncate_tail(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARK.chars().count());
    let mut out: String = input.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARK);
    out
}

pub fn render_observations(observations: &[Observation]) -> String {
    observations
        .iter()
        .map(Observation::render)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_allow(step: &Step) -> String {
    step.allow
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn render_plan(plan: &Plan) -> String {
    plan.steps
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "{}. [{}] {} (allow: {})",
                i,
                s.status.as_str(),
                s.title,
                render_allow(s)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn vocabulary() -> String {
    ActionKind::ALL
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

const PLAN_SHAPE: &str = r#"{"steps":[{"id":"step_1","title":"write_file:<path> ...","brief":"...","allow":["write_file"]},{"id":"step_2","title":"final_output","brief":"...","allow":["final_output"]}],"artifacts":["<path>"]}"#;

pub fn plan_prompt(
    config: &PromptConfig,
    message: &str,
    hints: &Hints,
    max_steps: usize,
    strict: bool,
    correction: Option<&str>,
) -> String {
    let mut rules = format!(
        "Return one JSON object shaped like {}\n\
         - at most {} steps; allow lists use: {}\n\
         - exactly one step allows final_output and it is the last step\n\
         - declare every file the task must produce in artifacts and give each a write_file:<path> step\n\
         - write a script before any step that executes it",
        PLAN_SHAPE,
        max_steps,
        vocabulary()
    );
    if strict {
        rules.push_str("\nReply with plain JSON only: no code fences, no prose.");
    }
    let mut builder = PromptBuilder::new(config)
        .section("Task", message)
        .section("Knowledge", &hints.text)
        .section("Plan format", rules);
    if let Some(reason) = correction {
        builder = builder.section(
            "Correction",
            format!("Your previous plan was rejected: {}. Return a corrected plan.", reason),
        );
    }
    builder.build()
}

pub fn replan_prompt(
    config: &PromptConfig,
    message: &str,
    history: &[Step],
    error: &str,
    observations: &[Observation],
    hints: &Hints,
    remaining_budget: usize,
    strict: bool,
) -> String {
    let history_text = history
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. [{}] {}", i, s.status.as_str(), s.title))
        .collect::<Vec<_>>()
        .join("\n");
    let mut rules = format!(
        "Plan only the remaining steps (at most {}), in the same JSON shape as before: {}\n\
         The last remaining step must allow final_output.",
        remaining_budget, PLAN_SHAPE
    );
    if strict {
        rules.push_str("\nReply with plain JSON only: no code fences, no prose.");
    }
    PromptBuilder::new(config)
        .section("Task", message)
        .section("Completed history (frozen)", history_text)
        .section("What went wrong", error)
        .section("Recent observations", render_observations(observations))
        .section("Knowledge", &hints.text)
        .section("Remaining steps format", rules)
        .build()
}

pub struct ActionPromptInput<'a> {
    pub message: &'a str,
    pub plan: &'a Plan,
    pub index: usize,
    pub observations: &'a [Observation],
    pub hints: &'a Hints,
    pub strict: bool,
    pub allow_reminder: Option<ActionKind>,
}

pub fn action_prompt(config: &PromptConfig, input: &ActionPromptInput<'_>) -> String {
    let step = &input.plan.steps[input.index.min(input.plan.steps.len().saturating_sub(1))];
    let mut rules = format!(
        "Return {{\"action\":{{\"type\":<type>,\"payload\":{{...}}}}}} optionally with \
         \"plan_patch\":{{\"step_index\":{},\"insert_steps\":[...]}}.\nAllowed types for this step: {}",
        input.index + 1,
        render_allow(step)
    );
    if let Some(kind) = input.allow_reminder {
        rules.push_str(&format!(
            "\nYour previous action type `{}` is not allowed here. Use only: {}.",
            kind,
            render_allow(step)
        ));
    }
    if input.strict {
        rules.push_str("\nReply with one JSON object only.");
    }
    PromptBuilder::new(config)
        .section("Task", input.message)
        .section("Plan", render_plan(input.plan))
        .section(
            "Current step",
            format!("#{} {}\n{}", input.index, step.title, step.brief),
        )
        .section("Recent observations", render_observations(input.observations))
        .section("Knowledge", &input.hints.text)
        .section("Action format", rules)
        .build()
}

pub fn final_output_prompt(config: &PromptConfig, message: &str, observations: &[Observation]) -> String {
    PromptBuilder::new(config)
        .section("Task", message)
        .section("Recent observations", render_observations(observations))
        .section(
            "Instruction",
            "Write the final answer for the user as plain text. It must not be empty.",
        )
        .build()
}

pub fn dependency_prompt(config: &PromptConfig, message: &str, plan: &Plan) -> String {
    let steps = plan
        .work_steps()
        .map(|(_, s)| format!("{}: {}", s.id, s.title))
        .collect::<Vec<_>>()
        .join("\n");
    PromptBuilder::new(config)
        .section("Task", message)
        .section("Steps", steps)
        .section(
            "Dependency format",
            "For each step list the ids of the steps it needs finished first. Steps with no \
             entry are independent. Return plain JSON only, shaped like \
             {\"dependencies\":[{\"step\":\"step_2\",\"after\":[\"step_1\"]}]}",
        )
        .build()
}

pub fn reflection_prompt(
    config: &PromptConfig,
    message: &str,
    plan: &Plan,
    failed: usize,
    error: &str,
    observations: &[Observation],
    max_fix_steps: usize,
) -> String {
    let title = plan.get(failed).map(|s| s.title.as_str()).unwrap_or("");
    PromptBuilder::new(config)
        .section("Task", message)
        .section("Plan", render_plan(plan))
        .section("Failed step", format!("#{} {}\n{}", failed, title, error))
        .section("Recent observations", render_observations(observations))
        .section(
            "Fix format",
            format!(
                "Propose at most {} steps that repair the failure, shaped like \
                 {{\"fix_steps\":[{{\"title\":\"...\",\"brief\":\"...\",\"allow\":[\"shell_command\"]}}]}}. \
                 Fix steps may not allow final_output. Return plain JSON only.",
                max_fix_steps
            ),
        )
        .build()
}
