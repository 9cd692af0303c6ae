use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Level;

use autorun_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use autorun_types::ModelSpec;

use crate::{AdaptiveLimiter, CallOutcome, CallParams, LlmClient, LlmError, LlmRequest, LlmResponse};

/// Log context for one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallTag<'a> {
    pub component: &'a str,
    pub run_id: Option<&'a str>,
    pub step: Option<usize>,
}

impl<'a> CallTag<'a> {
    pub fn new(component: &'a str) -> Self {
        Self {
            component,
            ..Default::default()
        }
    }

    pub fn run(mut self, run_id: &'a str) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }
}

/// Every outbound LLM call goes through here: limiter slot, per-call
/// timeout, outcome feedback.
#[derive(Clone)]
pub struct LlmGateway {
    client: Arc<dyn LlmClient>,
    limiter: AdaptiveLimiter,
    default_model: ModelSpec,
    call_timeout: Duration,
}

impl LlmGateway {
    pub fn new(
        client: Arc<dyn LlmClient>,
        limiter: AdaptiveLimiter,
        default_model: ModelSpec,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client,
            limiter,
            default_model,
            call_timeout,
        }
    }

    pub fn default_model(&self) -> &ModelSpec {
        &self.default_model
    }

    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }

    pub async fn complete(
        &self,
        tag: CallTag<'_>,
        prompt: &str,
        model: Option<&ModelSpec>,
        params: CallParams,
    ) -> Result<LlmResponse, LlmError> {
        let mut model = model.unwrap_or(&self.default_model).clone();
        if model.provider_id.trim().is_empty() {
            model.provider_id = self.client.provider_id().to_string();
        }
        let key = model.key();
        let permit = self.limiter.acquire(&key).await;

        let redacted = redact_text(prompt);
        emit_event(
            Level::DEBUG,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: tag.run_id,
                step: tag.step,
                provider_id: Some(&model.provider_id),
                model_id: Some(&model.model_id),
                detail: Some(&redacted),
                ..ObservabilityEvent::new("llm.call.start", tag.component)
            },
        );

        let started = Instant::now();
        let request = LlmRequest {
            prompt: prompt.to_string(),
            model: model.clone(),
            params,
        };
        let result = match tokio::time::timeout(self.call_timeout, self.client.complete(request))
            .await
        {
            Err(_) => Err(LlmError::Timeout(self.call_timeout)),
            Ok(Err(err)) => Err(LlmError::from_message(format!("{:#}", err))),
            Ok(Ok(response)) => Ok(response),
        };
        drop(permit);

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(err) => err.outcome(),
        };
        self.limiter.report(&key, outcome);

        let elapsed = format!("{}ms", started.elapsed().as_millis());
        let (level, status, error_code, detail) = match &result {
            Ok(_) => (Level::INFO, "ok", None, elapsed),
            Err(err) => (
                Level::WARN,
                "error",
                Some(err.code()),
                format!("{} after {}", err, elapsed),
            ),
        };
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: tag.run_id,
                step: tag.step,
                provider_id: Some(&model.provider_id),
                model_id: Some(&model.model_id),
                status: Some(status),
                error_code,
                detail: Some(&detail),
                ..ObservabilityEvent::new("llm.call.finish", tag.component)
            },
        );

        result
    }
}
