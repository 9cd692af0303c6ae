use std::collections::{BTreeSet, HashSet};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use autorun_types::{parse_allow, ActionKind, Plan, Step, FEEDBACK_STEP_ID};

use crate::error::{PlanFailure, PlanFailureCode};

#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "name")]
    pub title: String,
    #[serde(default, alias = "description")]
    pub brief: String,
    #[serde(default)]
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPlan {
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub candidate_id: Option<String>,
}

/// A normalised plan plus the identifier its planner voted with.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDraft {
    pub plan: Plan,
    pub candidate_id: Option<String>,
}

/// True when the whole response is one JSON object: no fences, no prose.
pub fn is_bare_json_object(output: &str) -> bool {
    let trimmed = output.trim();
    trimmed.starts_with('{')
        && trimmed.ends_with('}')
        && serde_json::from_str::<serde_json::Value>(trimmed)
            .map(|v| v.is_object())
            .unwrap_or(false)
}

/// Parses a bare JSON object, rejecting fenced or prose-wrapped output.
pub fn parse_bare<T: DeserializeOwned>(output: &str) -> Result<T, String> {
    if !is_bare_json_object(output) {
        return Err("response is not a bare JSON object".to_string());
    }
    serde_json::from_str::<T>(output.trim()).map_err(|e| format!("response does not match schema: {}", e))
}

/// Parses the first JSON object found in `output`, tolerating fences and prose.
pub fn parse_lenient<T: DeserializeOwned>(output: &str) -> Result<T, String> {
    if output.trim().is_empty() {
        return Err("empty response".to_string());
    }
    let mut last_err = match serde_json::from_str::<T>(output.trim()) {
        Ok(value) => return Ok(value),
        Err(e) => e.to_string(),
    };
    for candidate in json_candidates(output) {
        match serde_json::from_str::<T>(&candidate) {
            Ok(value) => return Ok(value),
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(format!("no valid JSON object in response: {}", last_err))
}

fn json_candidates(output: &str) -> Vec<String> {
    let mut out = Vec::new();

    for marker in ["```json", "```JSON", "```"] {
        if let Some(start) = output.find(marker) {
            let after = &output[start + marker.len()..];
            if let Some(end) = after.find("```") {
                let block = after[..end].trim();
                if !block.is_empty() {
                    out.push(block.to_string());
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) {
        if start <= end {
            out.push(output[start..=end].to_string());
        }
    }

    out
}

/// Turns a raw planner response into steps and artifacts.
///
/// Steps with empty titles and any planner-supplied feedback trailer are
/// dropped. Unknown allow entries are ignored; an empty allow-set is derived
/// from a `<kind>:` title prefix, else defaults to `llm_call`.
pub fn normalize_plan(raw: RawPlan) -> Result<PlanDraft, PlanFailure> {
    let mut steps: Vec<Step> = Vec::with_capacity(raw.steps.len());
    let mut seen_ids = HashSet::<String>::new();

    for (idx, raw_step) in raw.steps.into_iter().enumerate() {
        let title = raw_step.title.trim().to_string();
        if title.is_empty() {
            continue;
        }
        let id = raw_step
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("step_{}", idx + 1));
        if id == FEEDBACK_STEP_ID {
            continue;
        }

        let mut allow = BTreeSet::new();
        for entry in &raw_step.allow {
            match parse_allow(std::slice::from_ref(entry)) {
                Ok(kinds) => allow.extend(kinds),
                Err(unknown) => {
                    tracing::warn!(step = %id, allow = %unknown, "ignoring unknown allow entry");
                }
            }
        }
        if allow.is_empty() {
            allow.insert(Step::title_kind(&title).unwrap_or(ActionKind::LlmCall));
        }

        let mut unique = id.clone();
        let mut suffix = 2usize;
        while seen_ids.contains(&unique) {
            unique = format!("{}_{}", id, suffix);
            suffix += 1;
        }
        seen_ids.insert(unique.clone());

        steps.push(Step::new(unique, title, allow).with_brief(raw_step.brief.trim()));
    }

    if steps.is_empty() {
        return Err(PlanFailure::new(
            PlanFailureCode::EmptyPlan,
            "planner produced no usable steps",
        ));
    }

    Ok(PlanDraft {
        plan: Plan::new(steps, normalize_artifacts(raw.artifacts)),
        candidate_id: raw
            .candidate_id
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
    })
}

pub fn normalize_artifacts(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|a| normalize_path(&a))
        .filter(|a| !a.is_empty())
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

pub fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}
