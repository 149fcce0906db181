//! Configuration management with file persistence
//!
//! The file is TOML at `$WAYFINDER_CONFIG_DIR/config.toml` (or the platform
//! config directory). It is read once; routing uses the immutable snapshot
//! built from it. API keys are never stored here: each provider names the
//! environment variable that holds its key.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::llm::ProviderKind;
use crate::routing::{
    BreakerConfig, CacheConfig, Capability, ModelCatalog, ModelDescriptor, RoutingRules,
    RoutingSnapshot, TaskCategory,
};

/// Wayfinder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub cost: CostConfig,
    pub routing: RoutingConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub providers: Vec<ProviderConfig>,
    pub models: Vec<ModelDescriptor>,
}

/// Request defaults applied to generated tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Budget per window in USD
    pub daily_limit_usd: f64,
    /// Fraction of the budget that triggers a warning
    pub alert_threshold: f64,
    /// Sliding window length in seconds
    pub window_secs: u64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: 10.0,
            alert_threshold: 0.8,
            window_secs: 24 * 3600,
        }
    }
}

/// One category's ordered model list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub category: TaskCategory,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Hard timeout on every provider call
    pub provider_timeout_secs: u64,
    /// Default for `RouteConstraints::prefer_free`
    pub prefer_free: bool,
    /// Outcomes needed on both sides before confidence breaks a tie
    pub min_learning_samples: u64,
    /// Confidence difference needed to break a tie
    pub learning_margin: f64,
    pub rules: Vec<RuleConfig>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            provider_timeout_secs: 30,
            prefer_free: false,
            min_learning_samples: 5,
            learning_margin: 0.1,
            rules: default_rules(),
        }
    }
}

/// Which planner decomposes goals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerKind {
    /// Split the description into steps locally
    #[default]
    Step,
    /// Ask a planning model, falling back to `Step`
    Model,
}

impl FromStr for PlannerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "step" => Ok(Self::Step),
            "model" => Ok(Self::Model),
            _ => Err(format!("Unknown planner: {}", s)),
        }
    }
}

impl std::fmt::Display for PlannerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step => write!(f, "step"),
            Self::Model => write!(f, "model"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Goals processed concurrently
    pub workers: usize,
    /// Parallel tasks in flight within one goal
    pub max_concurrent_tasks: usize,
    /// Retries per generate task after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retries for a failed persistence write
    pub persist_retries: u32,
    /// Finished goals kept in memory after they are persisted
    pub retain_finished: usize,
    pub planner: PlannerKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_concurrent_tasks: 3,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            persist_retries: 3,
            retain_finished: 256,
            planner: PlannerKind::Step,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file; defaults to `wayfinder.db` in the config directory
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved database path
    pub fn resolved_path(&self) -> anyhow::Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Config::config_dir()?.join("wayfinder.db")),
        }
    }
}

/// One `[[providers]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry name referenced by models
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// HTTP client timeout
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    120
}

impl ProviderConfig {
    /// Whether the provider's key is present (always true for keyless providers)
    pub fn key_available(&self) -> bool {
        match &self.api_key_env {
            Some(var) => env::var(var).map(|v| !v.trim().is_empty()).unwrap_or(false),
            None => true,
        }
    }

    /// Key with all but the last four characters hidden
    pub fn redacted_api_key(&self) -> Option<String> {
        let key = env::var(self.api_key_env.as_ref()?).ok()?;
        if key.len() <= 4 {
            Some("***".to_string())
        } else {
            Some(format!("***{}", &key[key.len() - 4..]))
        }
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "openrouter".to_string(),
            kind: ProviderKind::OpenAiCompatible,
            base_url: None,
            api_key_env: Some("OPENROUTER_API_KEY".to_string()),
            timeout_secs: default_provider_timeout(),
        },
        ProviderConfig {
            name: "ollama".to_string(),
            kind: ProviderKind::OpenAiCompatible,
            base_url: Some("http://localhost:11434/v1".to_string()),
            api_key_env: None,
            timeout_secs: default_provider_timeout(),
        },
    ]
}

fn default_models() -> Vec<ModelDescriptor> {
    use Capability::*;

    vec![
        ModelDescriptor::new("anthropic/claude-sonnet-4", "openrouter")
            .with_pricing(3.0, 15.0)
            .with_context_window(200_000)
            .with_capabilities([Chat, Reasoning, Coding, LongContext]),
        ModelDescriptor::new("anthropic/claude-3-5-haiku-latest", "openrouter")
            .with_pricing(0.80, 4.0)
            .with_context_window(200_000)
            .with_capabilities([Chat, Coding, Fast, LongContext]),
        ModelDescriptor::new("openai/gpt-4o", "openrouter")
            .with_pricing(2.50, 10.0)
            .with_capabilities([Chat, Reasoning, Coding, Vision]),
        ModelDescriptor::new("openai/gpt-4o-mini", "openrouter")
            .with_pricing(0.15, 0.60)
            .with_capabilities([Chat, Coding, Fast]),
        ModelDescriptor::new("meta-llama/llama-3.3-70b-instruct:free", "openrouter")
            .free()
            .with_capabilities([Chat, Coding]),
        ModelDescriptor::new("llama3.2", "ollama")
            .free()
            .with_context_window(8_192)
            .with_capabilities([Chat, Fast]),
    ]
}

fn default_rules() -> Vec<RuleConfig> {
    let rule = |category, models: &[&str]| RuleConfig {
        category,
        models: models.iter().map(|m| m.to_string()).collect(),
    };

    vec![
        rule(
            TaskCategory::Chat,
            &[
                "openai/gpt-4o-mini",
                "anthropic/claude-3-5-haiku-latest",
                "meta-llama/llama-3.3-70b-instruct:free",
                "llama3.2",
            ],
        ),
        rule(
            TaskCategory::Coding,
            &[
                "anthropic/claude-sonnet-4",
                "openai/gpt-4o",
                "anthropic/claude-3-5-haiku-latest",
                "meta-llama/llama-3.3-70b-instruct:free",
            ],
        ),
        rule(
            TaskCategory::Reasoning,
            &[
                "anthropic/claude-sonnet-4",
                "openai/gpt-4o",
                "meta-llama/llama-3.3-70b-instruct:free",
            ],
        ),
        rule(
            TaskCategory::Summarization,
            &[
                "anthropic/claude-3-5-haiku-latest",
                "openai/gpt-4o-mini",
                "llama3.2",
            ],
        ),
        rule(
            TaskCategory::Planning,
            &["anthropic/claude-sonnet-4", "openai/gpt-4o"],
        ),
        rule(
            TaskCategory::Validation,
            &[
                "openai/gpt-4o-mini",
                "anthropic/claude-3-5-haiku-latest",
                "llama3.2",
            ],
        ),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            cost: CostConfig::default(),
            routing: RoutingConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
            providers: default_providers(),
            models: default_models(),
        }
    }
}

/// Keys accepted by `get` / `set`, in listing order
const KEYS: &[&str] = &[
    "llm.temperature",
    "llm.max_tokens",
    "cost.daily_limit_usd",
    "cost.alert_threshold",
    "cost.window_secs",
    "routing.provider_timeout_secs",
    "routing.prefer_free",
    "routing.min_learning_samples",
    "routing.learning_margin",
    "breaker.failure_threshold",
    "breaker.recovery_timeout_secs",
    "cache.enabled",
    "cache.capacity",
    "cache.ttl_secs",
    "engine.workers",
    "engine.max_concurrent_tasks",
    "engine.max_retries",
    "engine.base_delay_ms",
    "engine.max_delay_ms",
    "engine.persist_retries",
    "engine.retain_finished",
    "engine.planner",
    "storage.database_path",
];

fn parse_value<T: FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid value for {}: {}", key, value))
}

impl Config {
    /// Offline configuration: one echo provider serving every category
    pub fn offline() -> Self {
        let echo = ModelDescriptor::new("echo/default", "echo")
            .free()
            .with_capabilities([
                Capability::Chat,
                Capability::Reasoning,
                Capability::Coding,
                Capability::Fast,
            ]);

        Self {
            providers: vec![ProviderConfig {
                name: "echo".to_string(),
                kind: ProviderKind::Echo,
                base_url: None,
                api_key_env: None,
                timeout_secs: 5,
            }],
            models: vec![echo],
            routing: RoutingConfig {
                rules: TaskCategory::ALL
                    .into_iter()
                    .map(|category| RuleConfig {
                        category,
                        models: vec!["echo/default".to_string()],
                    })
                    .collect(),
                ..RoutingConfig::default()
            },
            ..Self::default()
        }
    }

    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("WAYFINDER_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("wayfinder")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.cost.alert_threshold) {
            return Err(anyhow!("cost.alert_threshold must be between 0.0 and 1.0"));
        }
        if self.cost.daily_limit_usd < 0.0 {
            return Err(anyhow!("cost.daily_limit_usd must be non-negative"));
        }
        if self.engine.workers == 0 || self.engine.max_concurrent_tasks == 0 {
            return Err(anyhow!(
                "engine.workers and engine.max_concurrent_tasks must be at least 1"
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(anyhow!("breaker.failure_threshold must be at least 1"));
        }

        let mut names = std::collections::HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(anyhow!("duplicate provider name '{}'", provider.name));
            }
        }
        for model in &self.models {
            if !names.contains(model.provider.as_str()) {
                return Err(anyhow!(
                    "model '{}' references unknown provider '{}'",
                    model.id,
                    model.provider
                ));
            }
        }

        self.snapshot().map_err(|e| anyhow!("{}", e))?;
        Ok(())
    }

    /// Build the immutable routing snapshot
    pub fn snapshot(&self) -> Result<Arc<RoutingSnapshot>> {
        let catalog = ModelCatalog::from_models(self.models.iter().cloned());
        let mut rules = RoutingRules::new();
        for rule in &self.routing.rules {
            if rules.candidates(rule.category).is_some() {
                return Err(Error::ConfigError(format!(
                    "duplicate routing rule for '{}'",
                    rule.category
                )));
            }
            rules.set(rule.category, rule.models.iter().cloned());
        }
        RoutingSnapshot::new(catalog, rules)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "llm.temperature" => self.llm.temperature.to_string(),
            "llm.max_tokens" => self.llm.max_tokens.to_string(),

            "cost.daily_limit_usd" => self.cost.daily_limit_usd.to_string(),
            "cost.alert_threshold" => self.cost.alert_threshold.to_string(),
            "cost.window_secs" => self.cost.window_secs.to_string(),

            "routing.provider_timeout_secs" => self.routing.provider_timeout_secs.to_string(),
            "routing.prefer_free" => self.routing.prefer_free.to_string(),
            "routing.min_learning_samples" => self.routing.min_learning_samples.to_string(),
            "routing.learning_margin" => self.routing.learning_margin.to_string(),

            "breaker.failure_threshold" => self.breaker.failure_threshold.to_string(),
            "breaker.recovery_timeout_secs" => self.breaker.recovery_timeout_secs.to_string(),

            "cache.enabled" => self.cache.enabled.to_string(),
            "cache.capacity" => self.cache.capacity.to_string(),
            "cache.ttl_secs" => self.cache.ttl_secs.to_string(),

            "engine.workers" => self.engine.workers.to_string(),
            "engine.max_concurrent_tasks" => self.engine.max_concurrent_tasks.to_string(),
            "engine.max_retries" => self.engine.max_retries.to_string(),
            "engine.base_delay_ms" => self.engine.base_delay_ms.to_string(),
            "engine.max_delay_ms" => self.engine.max_delay_ms.to_string(),
            "engine.persist_retries" => self.engine.persist_retries.to_string(),
            "engine.retain_finished" => self.engine.retain_finished.to_string(),
            "engine.planner" => self.engine.planner.to_string(),

            "storage.database_path" => self.storage.resolved_path()?.display().to_string(),

            _ if key.ends_with("api_key") => {
                return Err(anyhow!(
                    "API keys are not part of the configuration. Each provider reads its key from the variable named by `api_key_env`."
                ));
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `wayfinder config list` to see available keys.",
                    key
                ));
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "llm.temperature" => {
                let temp: f32 = parse_value(key, value)?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                self.llm.temperature = temp;
            }
            "llm.max_tokens" => self.llm.max_tokens = parse_value(key, value)?,

            "cost.daily_limit_usd" => {
                let limit: f64 = parse_value(key, value)?;
                if limit < 0.0 {
                    return Err(anyhow!("Daily limit must be non-negative"));
                }
                self.cost.daily_limit_usd = limit;
            }
            "cost.alert_threshold" => {
                let threshold: f64 = parse_value(key, value)?;
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(anyhow!("Alert threshold must be between 0.0 and 1.0"));
                }
                self.cost.alert_threshold = threshold;
            }
            "cost.window_secs" => self.cost.window_secs = parse_value(key, value)?,

            "routing.provider_timeout_secs" => {
                self.routing.provider_timeout_secs = parse_value(key, value)?
            }
            "routing.prefer_free" => self.routing.prefer_free = parse_value(key, value)?,
            "routing.min_learning_samples" => {
                self.routing.min_learning_samples = parse_value(key, value)?
            }
            "routing.learning_margin" => {
                let margin: f64 = parse_value(key, value)?;
                if !(0.0..=1.0).contains(&margin) {
                    return Err(anyhow!("Learning margin must be between 0.0 and 1.0"));
                }
                self.routing.learning_margin = margin;
            }

            "breaker.failure_threshold" => {
                let threshold: u32 = parse_value(key, value)?;
                if threshold == 0 {
                    return Err(anyhow!("Failure threshold must be at least 1"));
                }
                self.breaker.failure_threshold = threshold;
            }
            "breaker.recovery_timeout_secs" => {
                self.breaker.recovery_timeout_secs = parse_value(key, value)?
            }

            "cache.enabled" => self.cache.enabled = parse_value(key, value)?,
            "cache.capacity" => self.cache.capacity = parse_value(key, value)?,
            "cache.ttl_secs" => self.cache.ttl_secs = parse_value(key, value)?,

            "engine.workers" | "engine.max_concurrent_tasks" => {
                let n: usize = parse_value(key, value)?;
                if n == 0 {
                    return Err(anyhow!("{} must be at least 1", key));
                }
                if key == "engine.workers" {
                    self.engine.workers = n;
                } else {
                    self.engine.max_concurrent_tasks = n;
                }
            }
            "engine.max_retries" => self.engine.max_retries = parse_value(key, value)?,
            "engine.base_delay_ms" => self.engine.base_delay_ms = parse_value(key, value)?,
            "engine.max_delay_ms" => self.engine.max_delay_ms = parse_value(key, value)?,
            "engine.persist_retries" => self.engine.persist_retries = parse_value(key, value)?,
            "engine.retain_finished" => self.engine.retain_finished = parse_value(key, value)?,
            "engine.planner" => {
                self.engine.planner = value.parse().map_err(|e: String| anyhow!(e))?
            }

            "storage.database_path" => {
                self.storage.database_path = Some(PathBuf::from(value.trim()));
            }

            _ if key.ends_with("api_key") => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the environment variable named by the provider's `api_key_env` instead."
                ));
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `wayfinder config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.cost.daily_limit_usd, 10.0);
        assert_eq!(config.cost.alert_threshold, 0.8);
        assert_eq!(config.routing.provider_timeout_secs, 30);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.recovery_timeout_secs, 60);
        assert_eq!(config.cache.capacity, 512);
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.max_concurrent_tasks, 3);
        assert_eq!(config.engine.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_snapshot_covers_every_category() {
        let snapshot = Config::default().snapshot().unwrap();
        for category in TaskCategory::ALL {
            assert!(
                snapshot.candidates(category).is_some(),
                "missing rule for {}",
                category
            );
        }
    }

    #[test]
    fn test_offline_config_is_valid() {
        let config = Config::offline();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, ProviderKind::Echo);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set("cost.daily_limit_usd", "25").unwrap();
        config.set("engine.planner", "model").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cost]\ndaily_limit_usd = 2.5\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.cost.daily_limit_usd, 2.5);
        assert_eq!(config.cost.alert_threshold, 0.8);
        assert_eq!(config.models.len(), Config::default().models.len());
    }

    #[test]
    fn test_rule_referencing_unknown_model_is_rejected() {
        let mut config = Config::default();
        config.routing.rules.push(RuleConfig {
            category: TaskCategory::Chat,
            models: vec!["ghost".into()],
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.routing.rules = vec![RuleConfig {
            category: TaskCategory::Chat,
            models: vec!["ghost".into()],
        }];
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn test_model_with_unknown_provider_is_rejected() {
        let mut config = Config::default();
        config.models.push(ModelDescriptor::new("x/y", "nowhere"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_get_set_values() {
        let mut config = Config::default();

        config.set("breaker.failure_threshold", "7").unwrap();
        assert_eq!(config.get("breaker.failure_threshold").unwrap(), "7");

        config.set("routing.prefer_free", "true").unwrap();
        assert!(config.routing.prefer_free);

        assert!(config.set("llm.temperature", "3.5").is_err());
        assert!(config.set("cost.alert_threshold", "1.5").is_err());
        assert!(config.set("engine.workers", "0").is_err());
        assert!(config.set("cache.capacity", "many").is_err());
        assert!(config.set("unknown.key", "1").is_err());
    }

    #[test]
    fn test_api_keys_rejected() {
        let mut config = Config::default();
        assert!(config.set("providers.openrouter.api_key", "sk-1").is_err());
        assert!(config.get("api_key").is_err());
    }

    #[test]
    fn test_list_contains_all_keys() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/tmp/wayfinder-test.db"));

        let list = config.list().unwrap();
        assert_eq!(list.len(), KEYS.len());
        assert!(list.iter().any(|(k, v)| k == "storage.database_path" && v == "/tmp/wayfinder-test.db"));
    }

    #[test]
    fn test_keyless_provider_is_available() {
        let provider = &default_providers()[1];
        assert!(provider.api_key_env.is_none());
        assert!(provider.key_available());
        assert!(provider.redacted_api_key().is_none());
    }
}
