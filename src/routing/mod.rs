//! Task routing: complexity rules, per-backend circuit breakers and the
//! hybrid router that combines them.

pub mod breaker;
pub mod breaker_registry;
pub mod router;
mod router_types;
pub mod rules;

pub use breaker::{Admission, BreakerConfig, BreakerState, CircuitState, Outcome};
pub use breaker_registry::{BreakerRegistry, BreakerView};
pub use router::{
    Decision, HybridRouter, RouteDecision, RouteError, RouterConfig, TaskPriority, TaskRequest,
};
pub use rules::{PayloadBoost, RoutingRule, RoutingRuleConfig, RuleError, RuleSet};
