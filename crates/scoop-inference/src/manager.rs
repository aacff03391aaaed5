use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use scoop_core::config::{InferenceConfig, ModelsConfig};
use scoop_core::{ChatMessage, LlmError, ModelResponse};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::fallback::{FallbackDecision, FallbackReason, FallbackTrigger};
use crate::router::{ModelRouter, RoutingDecision};
use crate::tokens::TokenEstimator;

/// Manager-level counters across all components.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InferenceMetrics {
    pub total_requests: u64,
    pub primary_successes: u64,
    pub fallback_uses: u64,
    pub extended_uses: u64,
    pub circuit_trips: u64,
    pub retries: u64,
    pub safety_blocks: u64,
    pub recitation_blocks: u64,
}

/// Composes the token estimator, circuit breaker, model router, and
/// fallback trigger behind a route+record API.
///
/// The engine calls `route_request` before each LLM call and exactly one
/// of `record_success` / `record_failure` after it. `record_failure`
/// answers the retry-or-fallback question in one step.
pub struct HybridManager {
    models: ModelsConfig,
    max_retries: u32,
    breaker: Arc<CircuitBreaker>,
    estimator: TokenEstimator,
    router: ModelRouter,
    trigger: FallbackTrigger,
    metrics: Mutex<InferenceMetrics>,
}

impl HybridManager {
    pub fn new(models: ModelsConfig, inference: InferenceConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "primary",
            inference.circuit_failure_threshold,
            Duration::from_secs(inference.circuit_recovery_secs),
            Duration::from_secs(inference.circuit_failure_window_secs),
        ));
        let estimator = TokenEstimator::new(inference.extended_context_threshold);
        let router = ModelRouter::new(
            models.primary.clone(),
            models.extended.clone(),
            models.fallback.clone(),
            inference.extended_context_threshold,
            Arc::clone(&breaker),
        );

        info!(
            primary = %models.primary,
            extended = %models.extended,
            fallback = %models.fallback,
            threshold = inference.extended_context_threshold,
            "hybrid manager initialised"
        );

        Self {
            models,
            max_retries: inference.max_retries,
            breaker,
            estimator,
            router,
            trigger: FallbackTrigger::new(),
            metrics: Mutex::new(InferenceMetrics::default()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn trigger(&self) -> &FallbackTrigger {
        &self.trigger
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Count tokens for message + history and ask the router for a model.
    pub fn route_request(
        &self,
        message: &str,
        history: &[ChatMessage],
        force_fallback: bool,
    ) -> RoutingDecision {
        let token_count = self.estimator.estimate(message) + self.estimator.count_history(history);
        let decision = self.router.route(token_count, force_fallback);

        {
            let mut m = self.metrics.lock().unwrap();
            m.total_requests += 1;
            if decision.model == self.models.extended {
                m.extended_uses += 1;
            } else if decision.model == self.models.fallback {
                m.fallback_uses += 1;
            }
        }

        info!(
            model = %decision.model,
            reason = decision.reason.as_str(),
            tokens = decision.token_count,
            "request routed"
        );
        decision
    }

    /// Record a successful call. Only primary-model successes feed the
    /// breaker — fallback successes say nothing about primary health.
    pub fn record_success(&self, model: Option<&str>) {
        let model = model.unwrap_or(&self.models.primary);
        if model == self.models.primary {
            self.metrics.lock().unwrap().primary_successes += 1;
            self.breaker.record_success();
        }
    }

    /// Record a failed call and decide what to do next.
    ///
    /// Returns `(true, None)` to retry the same model, `(false, Some(r))`
    /// to re-route with the forced-fallback decision `r`, or
    /// `(false, None)` to give up.
    pub fn record_failure(
        &self,
        error: Option<&LlmError>,
        response: Option<&ModelResponse>,
    ) -> (bool, Option<RoutingDecision>) {
        let decision = self.classify(error, response);

        self.breaker.record_failure(decision.reason.as_str());

        {
            let mut m = self.metrics.lock().unwrap();
            match decision.reason {
                FallbackReason::SafetyBlock => m.safety_blocks += 1,
                FallbackReason::RecitationBlock => m.recitation_blocks += 1,
                _ => {}
            }
            if self.breaker.state() == CircuitState::Open {
                m.circuit_trips += 1;
            }

            if decision.retryable && m.retries < self.max_retries as u64 {
                m.retries += 1;
                info!(retry = m.retries, max = self.max_retries, "retrying same model");
                return (true, None);
            }
        }

        if decision.should_fallback {
            let routing = self.router.route(0, true);
            self.metrics.lock().unwrap().fallback_uses += 1;
            warn!(
                model = %routing.model,
                reason = decision.reason.as_str(),
                "falling back"
            );
            return (false, Some(routing));
        }

        (false, None)
    }

    /// Deterministic stepwise escalation: primary → extended → fallback →
    /// none. The extended-context model is the most stable under
    /// safety-filter volatility, so it outranks the smaller fallback for
    /// content-block retries.
    pub fn get_fallback_model(&self, current: Option<&str>) -> Option<String> {
        let current = current.unwrap_or(&self.models.primary);

        if current.eq_ignore_ascii_case(&self.models.primary) {
            info!(from = current, to = %self.models.extended, "fallback step: extended");
            return Some(self.models.extended.clone());
        }
        if current.eq_ignore_ascii_case(&self.models.extended) {
            info!(from = current, to = %self.models.fallback, "fallback step: last resort");
            return Some(self.models.fallback.clone());
        }
        warn!(model = current, "no fallback available");
        None
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn is_healthy(&self) -> bool {
        self.breaker.state() != CircuitState::Open
    }

    pub fn metrics(&self) -> InferenceMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Component status snapshot for the health endpoint.
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "circuit_breaker": self.breaker.metrics(),
            "model_router": self.router.metrics(),
            "fallback_trigger": self.trigger.metrics(),
            "manager": self.metrics(),
        })
    }

    fn classify(
        &self,
        error: Option<&LlmError>,
        response: Option<&ModelResponse>,
    ) -> FallbackDecision {
        if let Some(e) = error {
            return self.trigger.analyze_error(e);
        }
        if let Some(r) = response {
            return self.trigger.analyze_response(r);
        }
        FallbackDecision {
            should_fallback: true,
            reason: FallbackReason::UnknownError,
            details: "no error or response provided".to_string(),
            retryable: true,
            severity: 1,
        }
    }
}
