//! Cost management and budget enforcement
//!
//! This module provides:
//! - Token usage and cost calculation from model pricing
//! - A sliding-window spend ledger with reservations for in-flight calls
//! - Daily and per-model cost summaries for reporting
//!
//! The budget window is measured with `tokio::time::Instant`; summaries are
//! keyed by UTC calendar date.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CostConfig;
use crate::routing::ModelDescriptor;

/// Token usage for a single LLM call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of input/prompt tokens
    pub input_tokens: u32,
    /// Number of output/completion tokens
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Create a new token usage record
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens (input + output)
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Cost breakdown for a single LLM call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCost {
    /// Unique identifier for this cost record
    pub id: String,
    /// Model identifier
    pub model: String,
    /// Token usage for this call
    pub tokens: TokenUsage,
    /// Cost for input tokens in USD
    pub input_cost_usd: f64,
    /// Cost for output tokens in USD
    pub output_cost_usd: f64,
    /// Timestamp of the LLM call
    pub timestamp: DateTime<Utc>,
    /// Optional context (e.g., goal ID)
    pub context: Option<String>,
}

impl LlmCost {
    /// Total cost in USD
    pub fn total_cost_usd(&self) -> f64 {
        self.input_cost_usd + self.output_cost_usd
    }
}

/// Pricing information for a model (per million tokens)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Model identifier
    pub model: String,
    /// Cost per million input tokens in USD
    pub input_price_per_million: f64,
    /// Cost per million output tokens in USD
    pub output_price_per_million: f64,
}

impl ModelPricing {
    /// Create new model pricing
    pub fn new(model: impl Into<String>, input_price: f64, output_price: f64) -> Self {
        Self {
            model: model.into(),
            input_price_per_million: input_price,
            output_price_per_million: output_price,
        }
    }

    /// Calculate cost for given token usage
    pub fn calculate_cost(&self, tokens: &TokenUsage) -> (f64, f64) {
        let input_cost = (tokens.input_tokens as f64 / 1_000_000.0) * self.input_price_per_million;
        let output_cost =
            (tokens.output_tokens as f64 / 1_000_000.0) * self.output_price_per_million;
        (input_cost, output_cost)
    }
}

impl From<&ModelDescriptor> for ModelPricing {
    fn from(model: &ModelDescriptor) -> Self {
        if model.is_free {
            Self::new(&model.id, 0.0, 0.0)
        } else {
            Self::new(
                &model.id,
                model.input_cost_per_million,
                model.output_cost_per_million,
            )
        }
    }
}

/// Daily cost summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCostSummary {
    /// The date for this summary
    pub date: NaiveDate,
    /// Total cost in USD
    pub total_cost_usd: f64,
    /// Total input tokens
    pub total_input_tokens: u64,
    /// Total output tokens
    pub total_output_tokens: u64,
    /// Number of LLM calls
    pub call_count: u32,
    /// Breakdown by model
    pub by_model: HashMap<String, ModelCostSummary>,
}

impl DailyCostSummary {
    /// Create a new empty daily summary
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            total_cost_usd: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            call_count: 0,
            by_model: HashMap::new(),
        }
    }

    /// Add a cost record to this summary
    pub fn add(&mut self, cost: &LlmCost) {
        self.total_cost_usd += cost.total_cost_usd();
        self.total_input_tokens += cost.tokens.input_tokens as u64;
        self.total_output_tokens += cost.tokens.output_tokens as u64;
        self.call_count += 1;

        self.by_model
            .entry(cost.model.clone())
            .or_insert_with(|| ModelCostSummary::new(cost.model.clone()))
            .add(cost);
    }
}

/// Cost summary for a specific model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCostSummary {
    /// Model identifier
    pub model: String,
    /// Total cost in USD
    pub total_cost_usd: f64,
    /// Total input tokens
    pub total_input_tokens: u64,
    /// Total output tokens
    pub total_output_tokens: u64,
    /// Number of calls
    pub call_count: u32,
}

impl ModelCostSummary {
    /// Create a new empty model summary
    pub fn new(model: String) -> Self {
        Self {
            model,
            total_cost_usd: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            call_count: 0,
        }
    }

    /// Add a cost record to this summary
    pub fn add(&mut self, cost: &LlmCost) {
        self.total_cost_usd += cost.total_cost_usd();
        self.total_input_tokens += cost.tokens.input_tokens as u64;
        self.total_output_tokens += cost.tokens.output_tokens as u64;
        self.call_count += 1;
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    /// (recorded at, usd), oldest first
    window: VecDeque<(Instant, f64)>,
    window_total: f64,
    /// Estimates held by in-flight calls
    reserved: f64,
    /// Whether the alert threshold warning fired in the current window
    alerted: bool,
    /// Cost records (most recent first)
    records: Vec<LlmCost>,
    daily_summaries: HashMap<NaiveDate, DailyCostSummary>,
}

/// Sliding-window spend ledger
///
/// One mutex guards the whole window; breakers and the cache never share it.
#[derive(Debug)]
pub struct CostLedger {
    state: Mutex<LedgerState>,
    /// Budget per window in USD
    daily_limit_usd: f64,
    /// Alert threshold (0.0 to 1.0)
    alert_threshold: f64,
    window: Duration,
}

impl CostLedger {
    /// Create a ledger with a 24 hour window
    pub fn new(daily_limit_usd: f64, alert_threshold: f64) -> Self {
        Self::with_window(daily_limit_usd, alert_threshold, Duration::from_secs(24 * 3600))
    }

    /// Create a ledger with a custom window length
    pub fn with_window(daily_limit_usd: f64, alert_threshold: f64, window: Duration) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            daily_limit_usd,
            alert_threshold,
            window,
        }
    }

    /// Create a ledger from config
    pub fn from_config(config: &CostConfig) -> Self {
        Self::with_window(
            config.daily_limit_usd,
            config.alert_threshold,
            Duration::from_secs(config.window_secs),
        )
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.prune(&mut state);
        state
    }

    fn prune(&self, state: &mut LedgerState) {
        let now = Instant::now();
        while let Some(&(at, usd)) = state.window.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            state.window.pop_front();
            state.window_total -= usd;
        }
        if state.window.is_empty() {
            // Clear float drift
            state.window_total = 0.0;
        }
        if state.window_total < self.daily_limit_usd * self.alert_threshold {
            state.alerted = false;
        }
    }

    /// Hold `estimated_cost` against the budget for an in-flight call
    ///
    /// Fails when recorded spend in the window plus outstanding reservations
    /// plus the estimate would exceed the limit.
    pub fn try_reserve(&self, estimated_cost: f64) -> bool {
        if estimated_cost <= 0.0 {
            return true;
        }

        let mut state = self.lock();
        let committed = state.window_total + state.reserved;
        if committed + estimated_cost > self.daily_limit_usd {
            debug!(
                committed_usd = committed,
                estimate_usd = estimated_cost,
                limit_usd = self.daily_limit_usd,
                "Budget reservation refused"
            );
            return false;
        }

        state.reserved += estimated_cost;
        true
    }

    /// Return a reservation taken with `try_reserve`
    pub fn release(&self, estimated_cost: f64) {
        if estimated_cost <= 0.0 {
            return;
        }
        let mut state = self.lock();
        state.reserved = (state.reserved - estimated_cost).max(0.0);
    }

    /// Whether `estimated_cost` would currently fit, without reserving it
    pub fn can_afford(&self, estimated_cost: f64) -> bool {
        if estimated_cost <= 0.0 {
            return true;
        }
        let state = self.lock();
        state.window_total + state.reserved + estimated_cost <= self.daily_limit_usd
    }

    /// Record actual usage of `model`
    pub fn record(&self, model: &ModelDescriptor, tokens: TokenUsage, context: Option<String>) -> LlmCost {
        let (input_cost, output_cost) = ModelPricing::from(model).calculate_cost(&tokens);
        self.push(LlmCost {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.id.clone(),
            tokens,
            input_cost_usd: input_cost,
            output_cost_usd: output_cost,
            timestamp: Utc::now(),
            context,
        })
    }

    /// Record a cost reported directly in USD
    pub fn record_cost(&self, model_id: &str, usd: f64) -> LlmCost {
        self.push(LlmCost {
            id: uuid::Uuid::new_v4().to_string(),
            model: model_id.to_string(),
            tokens: TokenUsage::new(0, 0),
            input_cost_usd: usd.max(0.0),
            output_cost_usd: 0.0,
            timestamp: Utc::now(),
            context: None,
        })
    }

    fn push(&self, cost: LlmCost) -> LlmCost {
        let usd = cost.total_cost_usd();
        let mut state = self.lock();

        if usd > 0.0 {
            state.window.push_back((Instant::now(), usd));
            state.window_total += usd;
        }

        state.records.insert(0, cost.clone());
        let date = cost.timestamp.date_naive();
        state
            .daily_summaries
            .entry(date)
            .or_insert_with(|| DailyCostSummary::new(date))
            .add(&cost);

        if !state.alerted && state.window_total >= self.daily_limit_usd * self.alert_threshold {
            state.alerted = true;
            warn!(
                spent_usd = state.window_total,
                limit_usd = self.daily_limit_usd,
                "Spend has crossed the budget alert threshold"
            );
        }

        cost
    }

    /// Recorded spend inside the current window
    pub fn window_total(&self) -> f64 {
        self.lock().window_total
    }

    /// Outstanding reservations
    pub fn reserved(&self) -> f64 {
        self.lock().reserved
    }

    /// Check if we're approaching the limit
    pub fn is_approaching_limit(&self) -> bool {
        self.window_total() >= self.daily_limit_usd * self.alert_threshold
    }

    /// Check if we've reached the limit
    pub fn is_over_limit(&self) -> bool {
        self.window_total() >= self.daily_limit_usd
    }

    /// Budget left after recorded spend and reservations
    pub fn remaining_budget(&self) -> f64 {
        let state = self.lock();
        (self.daily_limit_usd - state.window_total - state.reserved).max(0.0)
    }

    /// Get the daily limit
    pub fn daily_limit(&self) -> f64 {
        self.daily_limit_usd
    }

    /// Get today's summary
    pub fn today_summary(&self) -> Option<DailyCostSummary> {
        self.summary_for_date(Utc::now().date_naive())
    }

    /// Get summary for a specific date
    pub fn summary_for_date(&self, date: NaiveDate) -> Option<DailyCostSummary> {
        self.lock().daily_summaries.get(&date).cloned()
    }

    /// Get all cost records (most recent first)
    pub fn records(&self) -> Vec<LlmCost> {
        self.lock().records.clone()
    }
}
