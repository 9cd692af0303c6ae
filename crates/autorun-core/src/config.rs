use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;

use autorun_providers::{LimiterConfig, RetryPolicy};
use autorun_types::{ExecutorRole, ModelSpec};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    /// Upper bound on plan length, history included.
    pub max_steps: usize,
    pub max_replan_attempts: u32,
    pub max_artifact_autofix: u32,
    /// Identical failure hits tolerated before the run is stopped.
    pub repeat_failure_budget: u32,
    pub max_reflections: u32,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_steps: 30,
            max_replan_attempts: 3,
            max_artifact_autofix: 2,
            repeat_failure_budget: 3,
            max_reflections: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub retry: RetryPolicy,
    pub default_shell_timeout_secs: u64,
    /// Liveness beat interval while a step or reflection is in flight.
    pub heartbeat_ms: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_shell_timeout_secs: 120,
            heartbeat_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub observation_window: usize,
    pub section_max_chars: usize,
    pub total_max_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            observation_window: 8,
            section_max_chars: 4_000,
            total_max_chars: 16_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    pub temperature: f32,
    pub heartbeat_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            heartbeat_ms: 5_000,
            max_wait_ms: 180_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub default_model: ModelSpec,
    pub call_timeout_ms: u64,
    pub limiter: LimiterConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: ModelSpec::default(),
            call_timeout_ms: 120_000,
            limiter: LimiterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub enabled: bool,
    pub question: String,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            question: "Are you satisfied with the result? (yes/no)".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub tick_ms: u64,
    pub idle_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub coalesce_ms: u64,
    /// How long a cancelled worker gets to close its sequence.
    pub close_grace_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            idle_timeout_ms: 300_000,
            heartbeat_ms: 15_000,
            coalesce_ms: 250,
            close_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerProfile {
    pub id: String,
    #[serde(default)]
    pub model: Option<ModelSpec>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Domain/skill filters forwarded to knowledge hints.
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleModel {
    pub model: ModelSpec,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkConfig {
    pub planners: Vec<PlannerProfile>,
    pub roles: BTreeMap<ExecutorRole, RoleModel>,
    pub elaborate_dependencies: bool,
    pub reflection_models: Vec<ModelSpec>,
    pub vote_reflection: bool,
    pub max_fix_steps: usize,
}

impl Default for ThinkConfig {
    fn default() -> Self {
        Self {
            planners: Vec::new(),
            roles: BTreeMap::new(),
            elaborate_dependencies: true,
            reflection_models: Vec::new(),
            vote_reflection: true,
            max_fix_steps: 3,
        }
    }
}

impl ThinkConfig {
    /// Configured planners, or a single default planner.
    pub fn effective_planners(&self) -> Vec<PlannerProfile> {
        if self.planners.is_empty() {
            return vec![PlannerProfile {
                id: "default".to_string(),
                model: None,
                temperature: None,
                filters: Vec::new(),
            }];
        }
        self.planners.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub budgets: Budgets,
    pub action: ActionConfig,
    pub prompt: PromptConfig,
    pub planning: PlanningConfig,
    pub llm: LlmConfig,
    pub feedback: FeedbackConfig,
    pub verification_keywords: Vec<String>,
    pub stream: StreamConfig,
    pub think: ThinkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            budgets: Budgets::default(),
            action: ActionConfig::default(),
            prompt: PromptConfig::default(),
            planning: PlanningConfig::default(),
            llm: LlmConfig::default(),
            feedback: FeedbackConfig::default(),
            verification_keywords: ["verify", "check", "test", "validate", "lint"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            stream: StreamConfig::default(),
            think: ThinkConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.llm.call_timeout_ms)
    }

    pub fn step_heartbeat(&self) -> Duration {
        Duration::from_millis(self.action.heartbeat_ms.max(1))
    }

    pub fn is_verification_title(&self, title: &str) -> bool {
        let lowered = title.to_lowercase();
        self.verification_keywords
            .iter()
            .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
    }

    /// Loads defaults, then the JSON file at `path` (or the default location),
    /// then `AUTORUN_*` environment variables, then `overrides`.
    pub async fn load(path: Option<&Path>, overrides: Option<Value>) -> Result<Self> {
        let file_path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };
        let file = match &file_path {
            Some(p) => read_json_file(p).await?,
            None => empty_object(),
        };
        let layers = ConfigLayers {
            file,
            env: env_layer(|key| std::env::var(key).ok()),
            overrides: overrides.unwrap_or_else(empty_object),
        };
        layers.resolve()
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    overrides: Value,
}

impl ConfigLayers {
    fn effective_value(&self) -> Result<Value> {
        let mut merged = serde_json::to_value(EngineConfig::default())?;
        deep_merge(&mut merged, &self.file);
        deep_merge(&mut merged, &self.env);
        deep_merge(&mut merged, &self.overrides);
        Ok(merged)
    }

    fn resolve(&self) -> Result<EngineConfig> {
        let merged = self.effective_value()?;
        serde_json::from_value(merged).map_err(|e| EngineError::Config(e.to_string()))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AUTORUN_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("autorun").join("config.json"))
}

fn empty_object() -> Value {
    json!({})
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    serde_json::from_str::<Value>(&raw)
        .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
}

fn env_layer(get: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(dir) = get("AUTORUN_WORKSPACE").filter(|v| !v.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "workspace_root": dir }));
    }
    if let Some(model) = get("AUTORUN_MODEL") {
        if let Some((provider, model)) = model.trim().split_once('/') {
            deep_merge(
                &mut root,
                &json!({ "llm": { "default_model": { "provider_id": provider, "model_id": model } } }),
            );
        }
    }
    if let Some(v) = get("AUTORUN_MAX_STEPS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "budgets": { "max_steps": v } }));
    }
    if let Some(v) = get("AUTORUN_MAX_REPLANS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "budgets": { "max_replan_attempts": v } }));
    }
    if let Some(v) = get("AUTORUN_FEEDBACK_LOOP").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "feedback": { "enabled": v } }));
    }
    if let Some(v) = get("AUTORUN_LLM_TIMEOUT_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "llm": { "call_timeout_ms": v } }));
    }
    if let Some(v) = get("AUTORUN_LIMITER_GLOBAL_MAX").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "llm": { "limiter": { "global_max": v } } }));
    }
    if let Some(v) = get("AUTORUN_LIMITER_MODEL_MAX").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "llm": { "limiter": { "per_model_max": v } } }));
    }
    if let Some(v) = get("AUTORUN_STREAM_IDLE_TIMEOUT_MS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "stream": { "idle_timeout_ms": v } }));
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
