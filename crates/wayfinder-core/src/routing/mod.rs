//! Model routing with fallback
//!
//! The key components are:
//!
//! - **Catalog and rules**: an immutable [`RoutingSnapshot`] of known models
//!   and the ordered candidate list for each [`TaskCategory`].
//!
//! - **Circuit breakers**: one per provider; an open breaker removes the
//!   provider's models from consideration until its recovery timeout passes.
//!
//! - **Response cache**: a bounded TTL + LRU cache keyed by request
//!   fingerprint, consulted before any provider call.
//!
//! - **Learning ledger**: success rates per (category, model), used only to
//!   order otherwise interchangeable candidates.
//!
//! ## How It Works
//!
//! 1. `route` filters the rule's candidates by capabilities, context window
//!    and cost ceiling, then orders them
//! 2. The first candidate whose provider is registered, whose breaker admits a
//!    call and whose estimated cost fits the budget is selected; the rest
//!    become the fallback chain
//! 3. `execute` walks the chain until one provider answers
//!
//! ## Example
//!
//! ```rust,ignore
//! use wayfinder_core::routing::{Router, RouteConstraints, TaskCategory};
//!
//! let decision = router.route(TaskCategory::Coding, &RouteConstraints::new())?;
//! let response = router.execute(&decision, &request, &cancel).await?;
//! ```

mod breaker;
mod cache;
mod learning;
mod router;
mod types;

pub use breaker::{
    BreakerConfig, BreakerError, BreakerPermit, BreakerRegistry, BreakerSnapshot, CircuitBreaker,
    CircuitState,
};
pub use cache::{CacheConfig, CacheMetrics, RequestFingerprint, ResponseCache};
pub use learning::{LearningLedger, OutcomeStats, OutcomeSummary};
pub use router::{Router, RouterBuilder, RouterConfig};
pub use types::{
    AttemptOutcome, AttemptRecord, Capability, ModelCatalog, ModelDescriptor, RouteConstraints,
    RoutedResponse, RoutingDecision, RoutingRules, RoutingSnapshot, TaskCategory,
    summarize_attempts,
};
