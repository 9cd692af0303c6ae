//! Failure reflection: ask one or more models for a few fix steps to insert
//! after a failed step.

use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::Level;

use autorun_observability::{emit_event, ObservabilityEvent, ProcessKind};
use autorun_providers::{CallParams, CallTag, LlmGateway};
use autorun_types::{parse_allow, ActionKind, ModelSpec, Observation, PatchStep, Plan, Step};

use super::vote::{tally, titles_key};
use crate::config::EngineConfig;
use crate::plan::parse_lenient;
use crate::prompt;

const COMPONENT: &str = "reflection";

#[derive(Debug, Deserialize)]
struct ReflectionReply {
    #[serde(default, alias = "steps")]
    fix_steps: Vec<PatchStep>,
}

/// Usable fix steps from one reply: titled, with known allow entries, never
/// producing the final output, at most `max`.
pub fn parse_fix_steps(text: &str, max: usize) -> Result<Vec<PatchStep>, String> {
    let reply: ReflectionReply = parse_lenient(text)?;
    Ok(reply
        .fix_steps
        .into_iter()
        .filter(|s| !s.title.trim().is_empty())
        .filter(|s| match parse_allow(&s.allow) {
            Ok(allow) => {
                !allow.contains(&ActionKind::FinalOutput)
                    && Step::title_kind(&s.title) != Some(ActionKind::FinalOutput)
            }
            Err(_) => false,
        })
        .take(max)
        .collect())
}

pub struct ReflectRequest<'a> {
    pub message: &'a str,
    pub plan: &'a Plan,
    pub failed: usize,
    pub error: &'a str,
    pub observations: &'a [Observation],
    pub run_id: &'a str,
}

#[derive(Clone)]
pub struct Reflector {
    gateway: LlmGateway,
    config: Arc<EngineConfig>,
}

impl Reflector {
    pub fn new(gateway: LlmGateway, config: Arc<EngineConfig>) -> Self {
        Self { gateway, config }
    }

    /// Returns the chosen fix steps, or an empty list when no model produced
    /// any.
    pub async fn reflect(&self, request: &ReflectRequest<'_>) -> Vec<PatchStep> {
        let think = &self.config.think;
        let max = think.max_fix_steps.max(1);
        let prompt = prompt::reflection_prompt(
            &self.config.prompt,
            request.message,
            request.plan,
            request.failed,
            request.error,
            request.observations,
            max,
        );
        let models: Vec<Option<ModelSpec>> = if think.reflection_models.is_empty() {
            vec![None]
        } else {
            think.reflection_models.iter().cloned().map(Some).collect()
        };

        let mut lanes = JoinSet::new();
        for (position, model) in models.into_iter().enumerate() {
            let gateway = self.gateway.clone();
            let prompt = prompt.clone();
            let run_id = request.run_id.to_string();
            let failed = request.failed;
            let temperature = self.config.planning.temperature;
            lanes.spawn(async move {
                let label = model
                    .as_ref()
                    .map(ModelSpec::key)
                    .unwrap_or_else(|| gateway.default_model().key());
                let result = gateway
                    .complete(
                        CallTag::new(COMPONENT).run(&run_id).step(failed),
                        &prompt,
                        model.as_ref(),
                        CallParams::default().json().with_temperature(Some(temperature)),
                    )
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|response| parse_fix_steps(&response.text, max));
                (position, label, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = lanes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => tracing::warn!(error = %err, "reflection lane failed"),
            }
        }
        results.sort_by_key(|(position, _, _)| *position);

        let mut candidates: Vec<(String, Vec<PatchStep>)> = Vec::new();
        for (_, label, result) in results {
            match result {
                Ok(steps) if !steps.is_empty() => candidates.push((label, steps)),
                Ok(_) => tracing::info!(model = %label, "reflection proposed no fix steps"),
                Err(err) => tracing::warn!(model = %label, error = %err, "reflection failed"),
            }
        }

        let chosen = if think.vote_reflection && candidates.len() > 1 {
            let ballots: Vec<(String, String)> = candidates
                .iter()
                .map(|(label, steps)| {
                    (
                        label.clone(),
                        titles_key(steps.iter().map(|s| s.title.as_str())),
                    )
                })
                .collect();
            tally(&ballots).map(|(winner, _)| winner).unwrap_or(0)
        } else {
            0
        };

        let steps = if candidates.is_empty() {
            Vec::new()
        } else {
            candidates.swap_remove(chosen).1
        };
        emit_event(
            if steps.is_empty() { Level::WARN } else { Level::INFO },
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(request.run_id),
                step: Some(request.failed),
                status: Some(if steps.is_empty() { "empty" } else { "ok" }),
                detail: Some(&format!("{} fix step(s)", steps.len())),
                ..ObservabilityEvent::new("think.reflection", COMPONENT)
            },
        );
        steps
    }
}
