//! Router - candidate selection and fallback execution
//!
//! `route` orders the rule's candidates and picks the first one that is
//! currently eligible; `execute` walks that order, consulting the response
//! cache, the provider's circuit breaker and the cost ledger before each call.
//!
//! There is no router-wide lock: breakers, ledger, cache and learning
//! statistics each guard their own state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot};
use super::cache::{CacheMetrics, RequestFingerprint, ResponseCache};
use super::learning::LearningLedger;
use super::types::{
    AttemptOutcome, AttemptRecord, ModelDescriptor, RouteConstraints, RoutedResponse,
    RoutingDecision, RoutingSnapshot, TaskCategory, summarize_attempts,
};
use crate::config::{Config, RoutingConfig};
use crate::cost::CostLedger;
use crate::error::{Error, Result};
use crate::llm::{GenerateRequest, GenerateResponse, ProviderRegistry};

/// Router tuning
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Hard timeout on every provider call
    pub provider_timeout: Duration,
    /// Outcomes both candidates need before confidence breaks a tie
    pub min_learning_samples: u64,
    /// Confidence difference needed to break a tie
    pub learning_margin: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from_routing(&RoutingConfig::default())
    }
}

impl RouterConfig {
    pub fn from_routing(config: &RoutingConfig) -> Self {
        Self {
            provider_timeout: Duration::from_secs(config.provider_timeout_secs),
            min_learning_samples: config.min_learning_samples,
            learning_margin: config.learning_margin,
        }
    }
}

/// Builder for [`Router`]
pub struct RouterBuilder {
    snapshot: Arc<RoutingSnapshot>,
    providers: ProviderRegistry,
    ledger: Option<Arc<CostLedger>>,
    cache: Option<Arc<ResponseCache<GenerateResponse>>>,
    learning: Option<Arc<LearningLedger>>,
    breaker_config: BreakerConfig,
    config: RouterConfig,
}

impl RouterBuilder {
    /// Set the cost ledger (defaults to a $10 / 24h ledger)
    pub fn ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Enable the response cache
    pub fn cache(mut self, cache: Arc<ResponseCache<GenerateResponse>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share learning statistics with the goal engine
    pub fn learning(mut self, learning: Arc<LearningLedger>) -> Self {
        self.learning = Some(learning);
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Router {
        // One breaker per provider known to either the catalog or the registry
        let mut names: Vec<String> = self
            .snapshot
            .catalog()
            .all()
            .into_iter()
            .map(|m| m.provider.clone())
            .chain(self.providers.names())
            .collect();
        names.sort();
        names.dedup();

        Router {
            breakers: BreakerRegistry::new(names, self.breaker_config),
            snapshot: self.snapshot,
            providers: self.providers,
            ledger: self
                .ledger
                .unwrap_or_else(|| Arc::new(CostLedger::new(10.0, 0.8))),
            cache: self.cache,
            learning: self.learning.unwrap_or_default(),
            config: self.config,
        }
    }
}

/// Routes requests across providers with fallback
pub struct Router {
    snapshot: Arc<RoutingSnapshot>,
    providers: ProviderRegistry,
    breakers: BreakerRegistry,
    ledger: Arc<CostLedger>,
    cache: Option<Arc<ResponseCache<GenerateResponse>>>,
    learning: Arc<LearningLedger>,
    config: RouterConfig,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("providers", &self.providers.names())
            .field("models", &self.snapshot.catalog().len())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl Router {
    pub fn builder(snapshot: Arc<RoutingSnapshot>, providers: ProviderRegistry) -> RouterBuilder {
        RouterBuilder {
            snapshot,
            providers,
            ledger: None,
            cache: None,
            learning: None,
            breaker_config: BreakerConfig::default(),
            config: RouterConfig::default(),
        }
    }

    /// Wire a router from configuration
    pub fn from_config(
        config: &Config,
        providers: ProviderRegistry,
        learning: Arc<LearningLedger>,
    ) -> Result<Self> {
        let mut builder = Self::builder(config.snapshot()?, providers)
            .ledger(Arc::new(CostLedger::from_config(&config.cost)))
            .learning(learning)
            .breaker_config(config.breaker)
            .config(RouterConfig::from_routing(&config.routing));
        if config.cache.enabled {
            builder = builder.cache(Arc::new(ResponseCache::from_config(&config.cache)));
        }
        Ok(builder.build())
    }

    pub fn snapshot(&self) -> &Arc<RoutingSnapshot> {
        &self.snapshot
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn learning(&self) -> &Arc<LearningLedger> {
        &self.learning
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn cache_metrics(&self) -> Option<CacheMetrics> {
        self.cache.as_ref().map(|c| c.metrics())
    }

    /// Candidates for `category` after filtering, tie-breaking and free-first partitioning
    pub fn ordered_candidates(
        &self,
        category: TaskCategory,
        constraints: &RouteConstraints,
    ) -> Result<Vec<ModelDescriptor>> {
        let candidates = self
            .snapshot
            .candidates(category)
            .ok_or_else(|| Error::NoSuitableModel(category.to_string()))?;

        let mut ordered: Vec<ModelDescriptor> = candidates
            .into_iter()
            .filter(|m| constraints.admits(m))
            .collect();
        if ordered.is_empty() {
            return Err(Error::NoSuitableModel(category.to_string()));
        }

        self.tie_break(category, &mut ordered);

        if constraints.prefer_free || self.ledger.is_over_limit() {
            // Stable partition: free first, relative order kept
            let (free, paid): (Vec<_>, Vec<_>) = ordered.into_iter().partition(|m| m.is_free);
            ordered = free.into_iter().chain(paid).collect();
        }

        Ok(ordered)
    }

    /// Reorder candidates that share a capability set, within their own slots
    ///
    /// Order inside a group: lower combined cost, then (when both sides have
    /// enough history and differ by more than the margin) higher confidence,
    /// then rule order.
    fn tie_break(&self, category: TaskCategory, ordered: &mut [ModelDescriptor]) {
        let mut visited = vec![false; ordered.len()];

        for start in 0..ordered.len() {
            if visited[start] {
                continue;
            }
            let slots: Vec<usize> = (start..ordered.len())
                .filter(|&i| ordered[i].capabilities == ordered[start].capabilities)
                .collect();
            for &slot in &slots {
                visited[slot] = true;
            }
            if slots.len() < 2 {
                continue;
            }

            let mut group: Vec<ModelDescriptor> =
                slots.iter().map(|&i| ordered[i].clone()).collect();
            group.sort_by(|a, b| {
                a.combined_cost_per_million()
                    .total_cmp(&b.combined_cost_per_million())
            });

            // Insertion pass within equal-cost runs; only a clear confidence
            // lead moves a candidate ahead.
            for i in 1..group.len() {
                let mut j = i;
                while j > 0
                    && group[j].combined_cost_per_million()
                        == group[j - 1].combined_cost_per_million()
                    && self.clearly_better(category, &group[j], &group[j - 1])
                {
                    group.swap(j, j - 1);
                    j -= 1;
                }
            }

            for (slot, model) in slots.into_iter().zip(group) {
                ordered[slot] = model;
            }
        }
    }

    fn clearly_better(&self, category: TaskCategory, a: &ModelDescriptor, b: &ModelDescriptor) -> bool {
        let (Some(sa), Some(sb)) = (
            self.learning.stats(category, &a.id),
            self.learning.stats(category, &b.id),
        ) else {
            return false;
        };
        let min = self.config.min_learning_samples;
        if sa.attempts < min || sb.attempts < min {
            return false;
        }
        sa.confidence() - sb.confidence() > self.config.learning_margin
    }

    /// Why a candidate cannot be selected right now, if it cannot
    fn ineligibility(
        &self,
        model: &ModelDescriptor,
        constraints: &RouteConstraints,
    ) -> Option<AttemptOutcome> {
        if !self.providers.contains(&model.provider) {
            return Some(AttemptOutcome::ProviderUnavailable);
        }
        match self.breakers.get(&model.provider) {
            Some(breaker) if breaker.allows_request() => {}
            _ => return Some(AttemptOutcome::CircuitOpen),
        }
        if !model.is_free && !self.ledger.can_afford(constraints.estimated_cost(model)) {
            return Some(AttemptOutcome::BudgetExceeded);
        }
        None
    }

    /// Select a model and fallback chain for `category`
    ///
    /// Read-only: the same inputs with unchanged breaker, ledger and cache
    /// state give the same decision.
    pub fn route(
        &self,
        category: TaskCategory,
        constraints: &RouteConstraints,
    ) -> Result<RoutingDecision> {
        let ordered = self.ordered_candidates(category, constraints)?;

        let mut skipped = Vec::new();
        for (index, model) in ordered.iter().enumerate() {
            match self.ineligibility(model, constraints) {
                None => {
                    let fallbacks = ordered[index + 1..].to_vec();
                    info!(
                        category = %category,
                        model = %model.id,
                        fallbacks = fallbacks.len(),
                        "Routed request"
                    );
                    return Ok(RoutingDecision {
                        category,
                        selected: model.clone(),
                        fallbacks,
                    });
                }
                Some(outcome) => {
                    debug!(category = %category, model = %model.id, reason = %outcome, "Candidate not eligible");
                    skipped.push(AttemptRecord {
                        model_id: model.id.clone(),
                        provider: model.provider.clone(),
                        outcome,
                        duration_ms: 0,
                    });
                }
            }
        }

        warn!(category = %category, "No eligible candidate");
        Err(self.exhausted(category, &skipped))
    }

    /// Run `request` against the decision's candidates in order
    pub async fn execute(
        &self,
        decision: &RoutingDecision,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<RoutedResponse> {
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for model in decision.candidates() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let started = Instant::now();
            let mut log = |outcome: AttemptOutcome| {
                attempts.push(AttemptRecord {
                    model_id: model.id.clone(),
                    provider: model.provider.clone(),
                    outcome,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            };

            let Some(provider) = self.providers.get(&model.provider) else {
                debug!(model = %model.id, provider = %model.provider, "Provider unavailable, skipping");
                log(AttemptOutcome::ProviderUnavailable);
                continue;
            };

            let fingerprint = RequestFingerprint::new(&model.id, request);
            if let Some(cache) = &self.cache
                && let Some(hit) = cache.get(&fingerprint)
            {
                debug!(model = %model.id, fingerprint = %fingerprint, "Cache hit");
                log(AttemptOutcome::CacheHit);
                return Ok(RoutedResponse {
                    content: hit.content,
                    model_id: model.id.clone(),
                    provider: model.provider.clone(),
                    cached: true,
                    cost_usd: 0.0,
                    input_tokens: hit.input_tokens,
                    output_tokens: hit.output_tokens,
                    attempts,
                });
            }

            let Some(breaker) = self.breakers.get(&model.provider) else {
                log(AttemptOutcome::ProviderUnavailable);
                continue;
            };
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(model = %model.id, provider = %model.provider, "Circuit open, skipping");
                    log(AttemptOutcome::CircuitOpen);
                    continue;
                }
            };

            let estimate = if model.is_free {
                0.0
            } else {
                provider.estimate_cost(model, request)
            };
            if !model.is_free && !self.ledger.try_reserve(estimate) {
                debug!(model = %model.id, estimate_usd = estimate, "Budget reservation failed, skipping");
                drop(permit);
                log(AttemptOutcome::BudgetExceeded);
                continue;
            }

            debug!(model = %model.id, provider = %model.provider, trial = permit.is_trial(), "Calling provider");
            let call = tokio::time::timeout(
                self.config.provider_timeout,
                provider.generate(model, request),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.ledger.release(estimate);
                    drop(permit);
                    log(AttemptOutcome::Cancelled);
                    info!(model = %model.id, "Provider call cancelled");
                    return Err(Error::Cancelled);
                }
                result = call => result,
            };
            self.ledger.release(estimate);

            match result {
                Ok(Ok(response)) => {
                    permit.success();
                    let cost = self.ledger.record(model, response.usage(), None);
                    if let Some(cache) = &self.cache {
                        cache.insert(fingerprint, response.clone());
                    }
                    log(AttemptOutcome::Succeeded);
                    info!(
                        model = %model.id,
                        provider = %model.provider,
                        cost_usd = cost.total_cost_usd(),
                        tokens = response.tokens_used(),
                        "Provider call succeeded"
                    );
                    return Ok(RoutedResponse {
                        content: response.content,
                        model_id: model.id.clone(),
                        provider: model.provider.clone(),
                        cached: false,
                        cost_usd: cost.total_cost_usd(),
                        input_tokens: response.input_tokens,
                        output_tokens: response.output_tokens,
                        attempts,
                    });
                }
                Ok(Err(e)) => {
                    permit.failure();
                    warn!(model = %model.id, provider = %model.provider, error = %e, "Provider call failed");
                    log(AttemptOutcome::Failed(e.short_message()));
                }
                Err(_) => {
                    permit.failure();
                    warn!(
                        model = %model.id,
                        provider = %model.provider,
                        timeout_secs = self.config.provider_timeout.as_secs(),
                        "Provider call timed out"
                    );
                    log(AttemptOutcome::TimedOut);
                }
            }
        }

        Err(self.exhausted(decision.category, &attempts))
    }

    /// Error for a request no candidate could serve
    ///
    /// `BudgetExceeded` when the budget refused every candidate, otherwise
    /// `AllProvidersFailed` with the attempt summary.
    fn exhausted(&self, category: TaskCategory, attempts: &[AttemptRecord]) -> Error {
        let budget_only = !attempts.is_empty()
            && attempts
                .iter()
                .all(|a| a.outcome == AttemptOutcome::BudgetExceeded);
        if !budget_only {
            return Error::AllProvidersFailed {
                category: category.to_string(),
                summary: summarize_attempts(attempts),
            };
        }

        let committed = self.ledger.window_total() + self.ledger.reserved();
        let limit = self.ledger.daily_limit();
        warn!(
            category = %category,
            committed_usd = committed,
            limit_usd = limit,
            "Every candidate refused by budget"
        );
        Error::BudgetExceeded(committed, limit, (committed.max(limit) * 1.5).ceil())
    }

    /// `route` followed by `execute`
    pub async fn route_and_execute(
        &self,
        category: TaskCategory,
        constraints: &RouteConstraints,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<RoutedResponse> {
        let decision = self.route(category, constraints)?;
        self.execute(&decision, request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::goals::LearningOutcome;
    use crate::llm::{ProviderClient, ProviderError};
    use crate::routing::{Capability, CircuitState, ModelCatalog, RoutingRules};

    /// Provider whose per-model behaviour is scripted
    #[derive(Default)]
    struct ScriptedProvider {
        name: String,
        failing: Mutex<HashMap<String, bool>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }

        fn failing(self, model: &str) -> Self {
            self.failing.lock().unwrap().insert(model.to_string(), true);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(
            &self,
            model: &ModelDescriptor,
            request: &GenerateRequest,
        ) -> std::result::Result<GenerateResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().unwrap().get(&model.id).copied().unwrap_or(false) {
                return Err(ProviderError::Http {
                    status: 503,
                    body: "overloaded".into(),
                });
            }
            Ok(GenerateResponse::new(&model.id, format!("{}: {}", model.id, request.prompt))
                .with_usage(1000, 1000))
        }
    }

    fn paid(id: &str, provider: &str, price: f64) -> ModelDescriptor {
        ModelDescriptor::new(id, provider)
            .with_pricing(price, price)
            .with_capability(Capability::Chat)
    }

    fn free(id: &str, provider: &str) -> ModelDescriptor {
        ModelDescriptor::new(id, provider)
            .free()
            .with_capability(Capability::Chat)
    }

    fn snapshot(models: Vec<ModelDescriptor>, rule: &[&str]) -> Arc<RoutingSnapshot> {
        RoutingSnapshot::new(
            ModelCatalog::from_models(models),
            RoutingRules::new().with_rule(TaskCategory::Chat, rule.iter().copied()),
        )
        .unwrap()
    }

    fn ids(models: &[ModelDescriptor]) -> Vec<&str> {
        models.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_rule_is_no_suitable_model() {
        let router = Router::builder(snapshot(vec![free("f", "p")], &["f"]), ProviderRegistry::new()).build();
        let err = router
            .route(TaskCategory::Coding, &RouteConstraints::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoSuitableModel(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_break_prefers_cheaper_within_capability_group() {
        let models = vec![
            paid("expensive", "p", 10.0),
            paid("cheap", "p", 1.0),
            paid("reasoner", "p", 0.5).with_capability(Capability::Reasoning),
        ];
        let router = Router::builder(
            snapshot(models, &["expensive", "reasoner", "cheap"]),
            ProviderRegistry::new().with_provider(Arc::new(ScriptedProvider::new("p"))),
        )
        .build();

        let ordered = router
            .ordered_candidates(TaskCategory::Chat, &RouteConstraints::default())
            .unwrap();
        // "reasoner" has a different capability set and keeps its slot
        assert_eq!(ids(&ordered), vec!["cheap", "reasoner", "expensive"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_cost_keeps_rule_order_without_history() {
        let models = vec![paid("a", "p", 1.0), paid("b", "p", 1.0)];
        let router = Router::builder(
            snapshot(models, &["a", "b"]),
            ProviderRegistry::new().with_provider(Arc::new(ScriptedProvider::new("p"))),
        )
        .build();

        let decision = router
            .route(TaskCategory::Chat, &RouteConstraints::default())
            .unwrap();
        assert_eq!(decision.candidate_ids(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_learning_breaks_equal_cost_ties_only_with_clear_lead() {
        let learning = Arc::new(LearningLedger::new());
        for _ in 0..5 {
            learning.observe(TaskCategory::Chat, "a", LearningOutcome::Failed);
            learning.observe(TaskCategory::Chat, "b", LearningOutcome::Completed);
            learning.observe(TaskCategory::Chat, "c", LearningOutcome::Completed);
        }

        let models = vec![paid("a", "p", 1.0), paid("b", "p", 1.0), paid("c", "p", 0.5)];
        let router = Router::builder(
            snapshot(models, &["a", "b", "c"]),
            ProviderRegistry::new().with_provider(Arc::new(ScriptedProvider::new("p"))),
        )
        .learning(learning.clone())
        .build();

        let ordered = router
            .ordered_candidates(TaskCategory::Chat, &RouteConstraints::default())
            .unwrap();
        // cost first, then confidence between the equal-cost pair
        assert_eq!(ids(&ordered), vec!["c", "b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_learning_ignored_below_min_samples() {
        let learning = Arc::new(LearningLedger::new());
        learning.observe(TaskCategory::Chat, "a", LearningOutcome::Failed);
        learning.observe(TaskCategory::Chat, "b", LearningOutcome::Completed);

        let models = vec![paid("a", "p", 1.0), paid("b", "p", 1.0)];
        let router = Router::builder(
            snapshot(models, &["a", "b"]),
            ProviderRegistry::new().with_provider(Arc::new(ScriptedProvider::new("p"))),
        )
        .learning(learning)
        .build();

        let ordered = router
            .ordered_candidates(TaskCategory::Chat, &RouteConstraints::default())
            .unwrap();
        assert_eq!(ids(&ordered), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefer_free_partitions_stably() {
        let models = vec![
            paid("p1", "p", 1.0).with_capability(Capability::Coding),
            free("f1", "p"),
            paid("p2", "p", 2.0).with_capability(Capability::Vision),
            free("f2", "p").with_capability(Capability::Fast),
        ];
        let router = Router::builder(
            snapshot(models, &["p1", "f1", "p2", "f2"]),
            ProviderRegistry::new().with_provider(Arc::new(ScriptedProvider::new("p"))),
        )
        .build();

        let ordered = router
            .ordered_candidates(TaskCategory::Chat, &RouteConstraints::new().with_prefer_free(true))
            .unwrap();
        assert_eq!(ids(&ordered), vec!["f1", "f2", "p1", "p2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_budget_moves_free_first_and_skips_paid() {
        let ledger = Arc::new(CostLedger::new(1.0, 0.8));
        ledger.record_cost("earlier", 1.0);

        let models = vec![paid("x", "p", 1.0), free("y", "q")];
        let router = Router::builder(
            snapshot(models, &["x", "y"]),
            ProviderRegistry::new()
                .with_provider(Arc::new(ScriptedProvider::new("p")))
                .with_provider(Arc::new(ScriptedProvider::new("q"))),
        )
        .ledger(ledger)
        .build();

        let decision = router
            .route(TaskCategory::Chat, &RouteConstraints::default())
            .unwrap();
        assert_eq!(decision.model_id(), "y");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_paid_over_budget_is_budget_exceeded() {
        let ledger = Arc::new(CostLedger::new(1.0, 0.8));
        ledger.record_cost("earlier", 1.0);

        let models = vec![paid("x", "p", 1.0), paid("z", "q", 0.5).with_capability(Capability::Coding)];
        let router = Router::builder(
            snapshot(models, &["x", "z"]),
            ProviderRegistry::new()
                .with_provider(Arc::new(ScriptedProvider::new("p")))
                .with_provider(Arc::new(ScriptedProvider::new("q"))),
        )
        .ledger(ledger)
        .build();

        let err = router
            .route(TaskCategory::Chat, &RouteConstraints::default())
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded(spent, limit, _) if spent == 1.0 && limit == 1.0));
        assert!(!err.is_retryable());
        assert_eq!(
            err.suggestion().as_deref(),
            Some("wayfinder config set cost.daily_limit_usd 2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_refused_at_execute_falls_back() {
        let ledger = Arc::new(CostLedger::new(1.0, 0.8));
        let pricey = Arc::new(ScriptedProvider::new("p"));
        let cheap = Arc::new(ScriptedProvider::new("q"));
        let x = paid("x", "p", 10.0).with_capability(Capability::Coding);
        let y = paid("y", "q", 1.0);
        let router = Router::builder(
            snapshot(vec![x.clone(), y.clone()], &["x", "y"]),
            ProviderRegistry::new()
                .with_provider(pricey.clone())
                .with_provider(cheap.clone()),
        )
        .ledger(ledger.clone())
        .build();

        let request = GenerateRequest::new("hi");
        let decision = router.route(TaskCategory::Chat, &RouteConstraints::default()).unwrap();
        assert_eq!(decision.model_id(), "x");

        // Another caller takes most of the budget between route and execute
        let estimate_x = pricey.estimate_cost(&x, &request);
        let estimate_y = cheap.estimate_cost(&y, &request);
        assert!(estimate_y < estimate_x);
        let held = 1.0 - (estimate_x + estimate_y) / 2.0;
        assert!(ledger.try_reserve(held));

        let response = router
            .execute(&decision, &request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.model_id, "y");
        assert_eq!(response.attempts[0].outcome, AttemptOutcome::BudgetExceeded);
        assert_eq!(pricey.calls(), 0);
        assert_eq!(cheap.calls(), 1);
        // Only the outside reservation remains, and the skipped permit was not counted
        assert!((ledger.reserved() - held).abs() < 1e-12);
        assert_eq!(router.breaker_snapshots()[0].consecutive_failures, 0);
        ledger.release(held);
        assert!(ledger.reserved() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_is_idempotent() {
        let models = vec![paid("x", "p", 1.0), free("y", "q"), paid("z", "q", 0.5)];
        let router = Router::builder(
            snapshot(models, &["x", "y", "z"]),
            ProviderRegistry::new()
                .with_provider(Arc::new(ScriptedProvider::new("p")))
                .with_provider(Arc::new(ScriptedProvider::new("q"))),
        )
        .build();

        let constraints = RouteConstraints::default();
        let first = router.route(TaskCategory::Chat, &constraints).unwrap();
        let second = router.route(TaskCategory::Chat, &constraints).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_falls_back_and_records_failures() {
        let provider = Arc::new(ScriptedProvider::new("p").failing("x"));
        let models = vec![paid("x", "p", 1.0).with_capability(Capability::Coding), paid("y", "p", 1.0)];
        let router = Router::builder(
            snapshot(models, &["x", "y"]),
            ProviderRegistry::new().with_provider(provider.clone()),
        )
        .build();

        let response = router
            .route_and_execute(
                TaskCategory::Chat,
                &RouteConstraints::default(),
                &GenerateRequest::new("hi"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.model_id, "y");
        assert_eq!(response.attempts.len(), 2);
        assert_eq!(response.attempts[0].outcome, AttemptOutcome::Failed("provider returned HTTP 503".into()));
        assert!(response.cost_usd > 0.0);
        assert_eq!(router.ledger().reserved(), 0.0);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_provider_is_not_invoked() {
        let provider = Arc::new(ScriptedProvider::new("p").failing("x"));
        let router = Router::builder(
            snapshot(vec![paid("x", "p", 1.0)], &["x"]),
            ProviderRegistry::new().with_provider(provider.clone()),
        )
        .breaker_config(BreakerConfig {
            failure_threshold: 2,
            recovery_timeout_secs: 60,
        })
        .build();

        let decision = router.route(TaskCategory::Chat, &RouteConstraints::default()).unwrap();
        for _ in 0..2 {
            let err = router
                .execute(&decision, &GenerateRequest::new("hi"), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::AllProvidersFailed { .. }));
        }
        assert_eq!(provider.calls(), 2);
        assert_eq!(router.breaker_snapshots()[0].state, CircuitState::Open);

        let err = router
            .execute(&decision, &GenerateRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("circuit open"));
        assert_eq!(provider.calls(), 2);

        let err = router
            .route(TaskCategory::Chat, &RouteConstraints::default())
            .unwrap_err();
        assert!(matches!(err, Error::AllProvidersFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let provider = Arc::new(ScriptedProvider::new("slow").with_delay(Duration::from_secs(31)));
        let router = Router::builder(
            snapshot(vec![free("s", "slow")], &["s"]),
            ProviderRegistry::new().with_provider(provider),
        )
        .build();

        let err = router
            .route_and_execute(
                TaskCategory::Chat,
                &RouteConstraints::default(),
                &GenerateRequest::new("hi"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::AllProvidersFailed { summary, .. } => assert!(summary.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(router.breaker_snapshots()[0].consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_call_and_releases_reservation() {
        let provider = Arc::new(ScriptedProvider::new("p").with_delay(Duration::from_secs(10)));
        let router = Arc::new(
            Router::builder(
                snapshot(vec![paid("x", "p", 1.0)], &["x"]),
                ProviderRegistry::new().with_provider(provider),
            )
            .build(),
        );

        let cancel = CancellationToken::new();
        let handle = {
            let router = router.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                router
                    .route_and_execute(
                        TaskCategory::Chat,
                        &RouteConstraints::default(),
                        &GenerateRequest::new("hi"),
                        &cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(router.ledger().reserved() > 0.0);
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(router.ledger().reserved(), 0.0);
        assert_eq!(router.breaker_snapshots()[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_provider_is_skipped() {
        let models = vec![paid("x", "missing", 1.0), free("y", "q")];
        let router = Router::builder(
            snapshot(models, &["x", "y"]),
            ProviderRegistry::new().with_provider(Arc::new(ScriptedProvider::new("q"))),
        )
        .build();

        let decision = router.route(TaskCategory::Chat, &RouteConstraints::default()).unwrap();
        assert_eq!(decision.model_id(), "y");
        assert!(decision.fallbacks.is_empty());
    }
}
