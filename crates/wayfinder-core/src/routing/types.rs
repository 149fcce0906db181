//! Types for model routing
//!
//! The catalog and the rule table are loaded once and shared as an immutable
//! [`RoutingSnapshot`]; nothing in here is mutated after construction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::llm::GenerateRequest;

/// A capability tag a model advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Reasoning,
    Coding,
    Vision,
    LongContext,
    Fast,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Reasoning => write!(f, "reasoning"),
            Self::Coding => write!(f, "coding"),
            Self::Vision => write!(f, "vision"),
            Self::LongContext => write!(f, "long_context"),
            Self::Fast => write!(f, "fast"),
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "reasoning" => Ok(Self::Reasoning),
            "coding" | "code" => Ok(Self::Coding),
            "vision" => Ok(Self::Vision),
            "long_context" => Ok(Self::LongContext),
            "fast" => Ok(Self::Fast),
            _ => Err(format!("Unknown capability: {}", s)),
        }
    }
}

/// Category of work a request belongs to; selects the routing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Chat,
    Coding,
    Reasoning,
    Summarization,
    Planning,
    Validation,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 6] = [
        Self::Chat,
        Self::Coding,
        Self::Reasoning,
        Self::Summarization,
        Self::Planning,
        Self::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Coding => "coding",
            Self::Reasoning => "reasoning",
            Self::Summarization => "summarization",
            Self::Planning => "planning",
            Self::Validation => "validation",
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "coding" | "code" => Ok(Self::Coding),
            "reasoning" => Ok(Self::Reasoning),
            "summarization" | "summary" => Ok(Self::Summarization),
            "planning" => Ok(Self::Planning),
            "validation" => Ok(Self::Validation),
            _ => Err(format!("Unknown task category: {}", s)),
        }
    }
}

/// A model served by one registered provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier as the provider expects it (e.g., "openai/gpt-4o-mini")
    pub id: String,
    /// Name of the provider in the registry
    pub provider: String,
    /// Cost per million input tokens (USD)
    #[serde(default)]
    pub input_cost_per_million: f64,
    /// Cost per million output tokens (USD)
    #[serde(default)]
    pub output_cost_per_million: f64,
    /// Maximum context window size
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Advertised capabilities
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    /// Free-tier models never consult the cost ledger
    #[serde(default)]
    pub is_free: bool,
}

fn default_context_window() -> usize {
    128_000
}

impl ModelDescriptor {
    /// Create a model with no pricing and no capabilities
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            input_cost_per_million: 0.0,
            output_cost_per_million: 0.0,
            context_window: default_context_window(),
            capabilities: BTreeSet::new(),
            is_free: false,
        }
    }

    /// Set pricing
    pub fn with_pricing(mut self, input: f64, output: f64) -> Self {
        self.input_cost_per_million = input;
        self.output_cost_per_million = output;
        self
    }

    /// Set context window
    pub fn with_context_window(mut self, size: usize) -> Self {
        self.context_window = size;
        self
    }

    /// Add one capability
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Replace the capability set
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Mark as free tier
    pub fn free(mut self) -> Self {
        self.is_free = true;
        self
    }

    /// Estimate cost for a given token count
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        if self.is_free {
            return 0.0;
        }
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_million;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_million;
        input_cost + output_cost
    }

    /// Combined per-million price used for tie-breaking
    pub fn combined_cost_per_million(&self) -> f64 {
        if self.is_free {
            0.0
        } else {
            self.input_cost_per_million + self.output_cost_per_million
        }
    }

    /// Whether every required capability is present
    pub fn has_capabilities(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Catalog of known models, keyed by id
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelDescriptor>,
}

impl ModelCatalog {
    /// Create a new empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a list of models
    pub fn from_models(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let mut catalog = Self::new();
        for model in models {
            catalog.register(model);
        }
        catalog
    }

    /// Register a model
    pub fn register(&mut self, model: ModelDescriptor) {
        self.models.insert(model.id.clone(), model);
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.get(model_id)
    }

    /// Whether a model is known
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// All models, sorted by id
    pub fn all(&self) -> Vec<&ModelDescriptor> {
        let mut models: Vec<&ModelDescriptor> = self.models.values().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Static category -> ordered model list table (primary first)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingRules {
    rules: HashMap<TaskCategory, Vec<String>>,
}

impl RoutingRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ordered candidates for a category
    pub fn with_rule(
        mut self,
        category: TaskCategory,
        models: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.set(category, models);
        self
    }

    pub fn set(
        &mut self,
        category: TaskCategory,
        models: impl IntoIterator<Item = impl Into<String>>,
    ) {
        self.rules
            .insert(category, models.into_iter().map(Into::into).collect());
    }

    /// Ordered candidate ids for a category
    pub fn candidates(&self, category: TaskCategory) -> Option<&[String]> {
        self.rules.get(&category).map(Vec::as_slice)
    }

    /// Categories with a rule, in declaration order of `TaskCategory`
    pub fn categories(&self) -> Vec<TaskCategory> {
        TaskCategory::ALL
            .into_iter()
            .filter(|c| self.rules.contains_key(c))
            .collect()
    }

    /// Check that every referenced model exists in the catalog
    pub fn validate(&self, catalog: &ModelCatalog) -> Result<()> {
        for category in self.categories() {
            let models = &self.rules[&category];
            if models.is_empty() {
                return Err(Error::ConfigError(format!(
                    "routing rule for '{}' has no models",
                    category
                )));
            }
            if let Some(missing) = models.iter().find(|id| !catalog.contains(id)) {
                return Err(Error::ConfigError(format!(
                    "routing rule for '{}' references unknown model '{}'",
                    category, missing
                )));
            }
        }
        Ok(())
    }
}

/// Immutable (catalog, rules) pair shared by the router
///
/// A reload builds a new snapshot and swaps the `Arc`; an existing snapshot
/// never changes.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    catalog: ModelCatalog,
    rules: RoutingRules,
}

impl RoutingSnapshot {
    /// Validate and freeze a catalog and rule table
    pub fn new(catalog: ModelCatalog, rules: RoutingRules) -> Result<Arc<Self>> {
        rules.validate(&catalog)?;
        Ok(Arc::new(Self { catalog, rules }))
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn rules(&self) -> &RoutingRules {
        &self.rules
    }

    /// Resolve the ordered candidate descriptors for a category
    pub fn candidates(&self, category: TaskCategory) -> Option<Vec<ModelDescriptor>> {
        self.rules.candidates(category).map(|ids| {
            ids.iter()
                .filter_map(|id| self.catalog.get(id).cloned())
                .collect()
        })
    }
}

/// Per-request routing constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConstraints {
    /// Move free-tier models ahead of paid ones
    #[serde(default)]
    pub prefer_free: bool,
    /// Capabilities every candidate must have
    #[serde(default)]
    pub required_capabilities: BTreeSet<Capability>,
    /// Maximum estimated cost of one request (USD)
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Minimum context window
    #[serde(default)]
    pub min_context_window: Option<usize>,
    /// Input tokens assumed for cost estimates
    #[serde(default = "default_estimated_input_tokens")]
    pub estimated_input_tokens: usize,
    /// Output tokens assumed for cost estimates
    #[serde(default = "default_expected_output_tokens")]
    pub expected_output_tokens: usize,
}

fn default_estimated_input_tokens() -> usize {
    1000
}

fn default_expected_output_tokens() -> usize {
    crate::llm::DEFAULT_EXPECTED_OUTPUT_TOKENS
}

impl Default for RouteConstraints {
    fn default() -> Self {
        Self {
            prefer_free: false,
            required_capabilities: BTreeSet::new(),
            max_cost_usd: None,
            min_context_window: None,
            estimated_input_tokens: default_estimated_input_tokens(),
            expected_output_tokens: default_expected_output_tokens(),
        }
    }
}

impl RouteConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer free-tier models
    pub fn with_prefer_free(mut self, prefer: bool) -> Self {
        self.prefer_free = prefer;
        self
    }

    /// Require a capability
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.required_capabilities.insert(capability);
        self
    }

    /// Set maximum cost constraint
    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost_usd = Some(max_cost);
        self
    }

    /// Set minimum context window
    pub fn with_min_context_window(mut self, tokens: usize) -> Self {
        self.min_context_window = Some(tokens);
        self
    }

    /// Take token estimates from a concrete request
    pub fn for_request(mut self, request: &GenerateRequest) -> Self {
        self.estimated_input_tokens = request.estimated_input_tokens();
        self.expected_output_tokens = request.expected_output_tokens();
        self
    }

    /// Estimated cost of one request on `model`
    pub fn estimated_cost(&self, model: &ModelDescriptor) -> f64 {
        model.estimate_cost(
            self.estimated_input_tokens as u32,
            self.expected_output_tokens as u32,
        )
    }

    /// Whether `model` passes the hard filters
    pub fn admits(&self, model: &ModelDescriptor) -> bool {
        if !model.has_capabilities(&self.required_capabilities) {
            return false;
        }
        if let Some(min) = self.min_context_window
            && model.context_window < min
        {
            return false;
        }
        if let Some(max_cost) = self.max_cost_usd
            && self.estimated_cost(model) > max_cost
        {
            return false;
        }
        true
    }
}

/// Result of a routing decision
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    /// Category that was routed
    pub category: TaskCategory,
    /// Model expected to serve the request
    pub selected: ModelDescriptor,
    /// Remaining candidates in the order they will be tried
    pub fallbacks: Vec<ModelDescriptor>,
}

impl RoutingDecision {
    /// Selected model ID
    pub fn model_id(&self) -> &str {
        &self.selected.id
    }

    /// Selected model followed by the fallbacks
    pub fn candidates(&self) -> impl Iterator<Item = &ModelDescriptor> {
        std::iter::once(&self.selected).chain(self.fallbacks.iter())
    }

    /// Candidate ids in order
    pub fn candidate_ids(&self) -> Vec<String> {
        self.candidates().map(|m| m.id.clone()).collect()
    }
}

/// What happened to one candidate during `execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum AttemptOutcome {
    Succeeded,
    CacheHit,
    CircuitOpen,
    BudgetExceeded,
    ProviderUnavailable,
    TimedOut,
    Failed(String),
    Cancelled,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::CacheHit => write!(f, "cache hit"),
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::BudgetExceeded => write!(f, "budget exceeded"),
            Self::ProviderUnavailable => write!(f, "provider unavailable"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Failed(reason) => write!(f, "{}", reason),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry of the per-candidate attempt log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub model_id: String,
    pub provider: String,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

/// Response returned by `Router::execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedResponse {
    /// Generated content
    pub content: String,
    /// Model that served the request
    pub model_id: String,
    /// Provider that served the request
    pub provider: String,
    /// Whether the content came from the response cache
    pub cached: bool,
    /// Recorded cost (0 for cache hits and free models)
    pub cost_usd: f64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Per-candidate attempt log, in order
    pub attempts: Vec<AttemptRecord>,
}

/// Join an attempt log into a one-line summary
pub fn summarize_attempts(attempts: &[AttemptRecord]) -> String {
    if attempts.is_empty() {
        return "no eligible candidates".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.model_id, a.outcome))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ModelCatalog {
        ModelCatalog::from_models([
            ModelDescriptor::new("paid/large", "openrouter")
                .with_pricing(3.0, 15.0)
                .with_capabilities([Capability::Chat, Capability::Reasoning]),
            ModelDescriptor::new("free/small", "ollama")
                .free()
                .with_context_window(8_000)
                .with_capability(Capability::Chat),
        ])
    }

    #[test]
    fn test_model_estimate_cost() {
        let model = ModelDescriptor::new("test/model", "p").with_pricing(3.0, 15.0);

        let cost = model.estimate_cost(1_000_000, 500_000);
        assert!((cost - 10.5).abs() < 0.001); // 3.0 + 7.5
    }

    #[test]
    fn test_free_model_costs_nothing() {
        let model = ModelDescriptor::new("free", "p")
            .with_pricing(3.0, 15.0)
            .free();
        assert_eq!(model.estimate_cost(1_000_000, 1_000_000), 0.0);
        assert_eq!(model.combined_cost_per_million(), 0.0);
    }

    #[test]
    fn test_category_parse_and_display() {
        for category in TaskCategory::ALL {
            assert_eq!(
                category.to_string().parse::<TaskCategory>().unwrap(),
                category
            );
        }
        assert_eq!("CODE".parse::<TaskCategory>().unwrap(), TaskCategory::Coding);
        assert!("dance".parse::<TaskCategory>().is_err());
    }

    #[test]
    fn test_rules_validate_unknown_model() {
        let rules = RoutingRules::new().with_rule(TaskCategory::Chat, ["paid/large", "ghost"]);
        let err = rules.validate(&catalog()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rules_validate_empty_rule() {
        let rules = RoutingRules::new().with_rule(TaskCategory::Chat, Vec::<String>::new());
        assert!(rules.validate(&catalog()).is_err());
    }

    #[test]
    fn test_snapshot_resolves_candidates_in_rule_order() {
        let rules = RoutingRules::new().with_rule(TaskCategory::Chat, ["free/small", "paid/large"]);
        let snapshot = RoutingSnapshot::new(catalog(), rules).unwrap();

        let ids: Vec<String> = snapshot
            .candidates(TaskCategory::Chat)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["free/small", "paid/large"]);
        assert!(snapshot.candidates(TaskCategory::Coding).is_none());
    }

    #[test]
    fn test_constraints_admit() {
        let catalog = catalog();
        let large = catalog.get("paid/large").unwrap();
        let small = catalog.get("free/small").unwrap();

        let reasoning = RouteConstraints::new().with_capability(Capability::Reasoning);
        assert!(reasoning.admits(large));
        assert!(!reasoning.admits(small));

        let long = RouteConstraints::new().with_min_context_window(32_000);
        assert!(long.admits(large));
        assert!(!long.admits(small));

        let cheap = RouteConstraints::new().with_max_cost(0.0001);
        assert!(!cheap.admits(large));
        assert!(cheap.admits(small));
    }

    #[test]
    fn test_constraints_for_request() {
        let request = GenerateRequest::new("x".repeat(40)).with_max_tokens(10);
        let constraints = RouteConstraints::new().for_request(&request);
        assert_eq!(constraints.estimated_input_tokens, 10);
        assert_eq!(constraints.expected_output_tokens, 10);
    }

    #[test]
    fn test_summarize_attempts() {
        let attempts = vec![
            AttemptRecord {
                model_id: "a".into(),
                provider: "p".into(),
                outcome: AttemptOutcome::CircuitOpen,
                duration_ms: 0,
            },
            AttemptRecord {
                model_id: "b".into(),
                provider: "q".into(),
                outcome: AttemptOutcome::TimedOut,
                duration_ms: 30_000,
            },
        ];
        assert_eq!(summarize_attempts(&attempts), "a: circuit open; b: timed out");
        assert_eq!(summarize_attempts(&[]), "no eligible candidates");
    }
}
