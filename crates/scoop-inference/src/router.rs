use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;

/// Which knob a model accepts for thinking depth. The router only carries
/// this; the LLM adapter issues the right request field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingKnob {
    /// Categorical depth, e.g. "HIGH" (Gemini 3.x `thinkingLevel`).
    Level(String),
    /// Scalar token budget (Gemini 2.5 `thinkingBudget`).
    Budget(u32),
}

/// Per-model configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub thinking: Option<ThinkingKnob>,
    pub max_context: u32,
    pub max_output: u32,
}

impl ModelConfig {
    fn known(name: &str) -> Option<Self> {
        let cfg = match name {
            "gemini-3-flash-preview" | "gemini-3-flash" => Self {
                name: name.to_string(),
                thinking: Some(ThinkingKnob::Level("HIGH".to_string())),
                max_context: 200_000,
                max_output: 8192,
            },
            "gemini-2.5-pro" => Self {
                name: name.to_string(),
                thinking: Some(ThinkingKnob::Budget(16_384)),
                max_context: 1_000_000,
                max_output: 8192,
            },
            "gemini-2.5-flash" => Self {
                name: name.to_string(),
                thinking: Some(ThinkingKnob::Budget(8_192)),
                max_context: 1_000_000,
                max_output: 8192,
            },
            _ => return None,
        };
        Some(cfg)
    }

    /// Safe defaults for models not in the table.
    fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            thinking: None,
            max_context: 200_000,
            max_output: 8192,
        }
    }
}

/// Why a particular model was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    ForcedFallback,
    CircuitOpen,
    ExtendedContext,
    PrimaryHealthy,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::ForcedFallback => "forced_fallback",
            RouteReason::CircuitOpen => "circuit_open",
            RouteReason::ExtendedContext => "extended_context",
            RouteReason::PrimaryHealthy => "primary_healthy",
        }
    }
}

/// Result of a routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub model: String,
    pub reason: RouteReason,
    pub config: ModelConfig,
    pub token_count: u32,
}

#[derive(Debug, Default)]
struct RouteCounters {
    total: u64,
    primary: u64,
    fallback: u64,
    extended: u64,
}

/// Selects primary/extended/fallback model per request.
///
/// Priority, highest first: force-fallback flag, circuit OPEN, token
/// count at or above the extended threshold, then the primary model.
pub struct ModelRouter {
    primary_model: String,
    extended_model: String,
    fallback_model: String,
    extended_threshold: u32,
    breaker: Arc<CircuitBreaker>,
    counters: Mutex<RouteCounters>,
}

impl ModelRouter {
    pub fn new(
        primary_model: impl Into<String>,
        extended_model: impl Into<String>,
        fallback_model: impl Into<String>,
        extended_threshold: u32,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            primary_model: primary_model.into(),
            extended_model: extended_model.into(),
            fallback_model: fallback_model.into(),
            extended_threshold,
            breaker,
            counters: Mutex::new(RouteCounters::default()),
        }
    }

    pub fn primary_model(&self) -> &str {
        &self.primary_model
    }

    pub fn extended_model(&self) -> &str {
        &self.extended_model
    }

    pub fn fallback_model(&self) -> &str {
        &self.fallback_model
    }

    pub fn route(&self, token_count: u32, force_fallback: bool) -> RoutingDecision {
        let mut counters = self.counters.lock().unwrap();
        counters.total += 1;

        if force_fallback {
            counters.fallback += 1;
            return self.decision(&self.fallback_model, RouteReason::ForcedFallback, token_count);
        }

        if self.breaker.is_open() {
            counters.fallback += 1;
            warn!(model = %self.fallback_model, "circuit open, routing to fallback");
            return self.decision(&self.fallback_model, RouteReason::CircuitOpen, token_count);
        }

        if token_count >= self.extended_threshold {
            counters.extended += 1;
            info!(
                token_count,
                threshold = self.extended_threshold,
                model = %self.extended_model,
                "routing to extended context model"
            );
            return self.decision(&self.extended_model, RouteReason::ExtendedContext, token_count);
        }

        counters.primary += 1;
        self.decision(&self.primary_model, RouteReason::PrimaryHealthy, token_count)
    }

    /// Configuration for a model id, with prefix matching for versioned
    /// names and safe defaults for unknown models.
    pub fn model_config(&self, name: &str) -> ModelConfig {
        if let Some(cfg) = ModelConfig::known(name) {
            return cfg;
        }
        for known in ["gemini-3-flash-preview", "gemini-3-flash", "gemini-2.5-pro", "gemini-2.5-flash"] {
            if name.starts_with(known) {
                let mut cfg = ModelConfig::known(known).unwrap();
                cfg.name = name.to_string();
                return cfg;
            }
        }
        warn!(model = name, "unknown model, using safe defaults");
        ModelConfig::unknown(name)
    }

    pub fn metrics(&self) -> serde_json::Value {
        let counters = self.counters.lock().unwrap();
        serde_json::json!({
            "total_routes": counters.total,
            "primary_routes": counters.primary,
            "fallback_routes": counters.fallback,
            "extended_routes": counters.extended,
            "circuit_state": self.breaker.state().to_string(),
        })
    }

    fn decision(&self, model: &str, reason: RouteReason, token_count: u32) -> RoutingDecision {
        RoutingDecision {
            model: model.to_string(),
            reason,
            config: self.model_config(model),
            token_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn router() -> ModelRouter {
        let breaker = Arc::new(CircuitBreaker::new(
            "test",
            2,
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        ModelRouter::new(
            "gemini-3-flash-preview",
            "gemini-2.5-pro",
            "gemini-2.5-flash",
            150_000,
            breaker,
        )
    }

    #[test]
    fn force_fallback_wins_over_everything() {
        let r = router();
        let d = r.route(999_999, true);
        assert_eq!(d.model, "gemini-2.5-flash");
        assert_eq!(d.reason, RouteReason::ForcedFallback);
    }

    #[test]
    fn open_circuit_routes_to_fallback() {
        let r = router();
        r.breaker.record_failure("503");
        r.breaker.record_failure("503");
        let d = r.route(10, false);
        assert_eq!(d.model, "gemini-2.5-flash");
        assert_eq!(d.reason, RouteReason::CircuitOpen);
    }

    #[test]
    fn token_threshold_routes_to_extended() {
        let r = router();
        let d = r.route(150_000, false);
        assert_eq!(d.model, "gemini-2.5-pro");
        assert_eq!(d.reason, RouteReason::ExtendedContext);
        assert_eq!(d.token_count, 150_000);
    }

    #[test]
    fn default_is_primary() {
        let r = router();
        let d = r.route(149_999, false);
        assert_eq!(d.model, "gemini-3-flash-preview");
        assert_eq!(d.reason, RouteReason::PrimaryHealthy);
    }

    #[test]
    fn thinking_knob_per_model_family() {
        let r = router();
        let preview = r.model_config("gemini-3-flash-preview");
        assert_eq!(preview.thinking, Some(ThinkingKnob::Level("HIGH".to_string())));
        let pro = r.model_config("gemini-2.5-pro");
        assert_eq!(pro.thinking, Some(ThinkingKnob::Budget(16_384)));
        assert_eq!(pro.max_context, 1_000_000);
    }

    #[test]
    fn versioned_name_matches_by_prefix() {
        let r = router();
        let cfg = r.model_config("gemini-2.5-flash-001");
        assert_eq!(cfg.thinking, Some(ThinkingKnob::Budget(8_192)));
        assert_eq!(cfg.name, "gemini-2.5-flash-001");
    }

    #[test]
    fn unknown_model_gets_safe_defaults() {
        let r = router();
        let cfg = r.model_config("some-new-model");
        assert_eq!(cfg.thinking, None);
        assert_eq!(cfg.max_context, 200_000);
    }
}
