//! Hybrid inference routing: model selection with a circuit breaker,
//! token-budget routing, and typed fallback triggers.
//!
//! Layering (leaves first): `tokens` estimates request size, `breaker`
//! tracks provider health, `fallback` classifies failures, `router` picks
//! a model, and `manager` composes the four behind a route+record API for
//! the conversation engine.

pub mod breaker;
pub mod fallback;
pub mod manager;
pub mod router;
pub mod tokens;

pub use breaker::{CircuitBreaker, CircuitOpenError, CircuitState};
pub use fallback::{FallbackDecision, FallbackReason, FallbackTrigger};
pub use manager::{HybridManager, InferenceMetrics};
pub use router::{ModelConfig, ModelRouter, RouteReason, RoutingDecision, ThinkingKnob};
pub use tokens::TokenEstimator;
