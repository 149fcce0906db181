//! Wayfinder CLI - routed LLM goals from the terminal

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use wayfinder_core::config::Config;
use wayfinder_core::goals::{AcceptanceCheck, Goal, GoalEngine, GoalRequest, GoalState};
use wayfinder_core::llm::ProviderRegistry;
use wayfinder_core::routing::{LearningLedger, TaskCategory};
use wayfinder_core::storage::{Database, DatabaseConfig, GoalStore, InMemoryGoalStore, SqliteGoalStore};

#[derive(Parser)]
#[command(name = "wayfinder")]
#[command(author, version, about = "Resilient LLM routing and goal execution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use the offline echo provider and keep goals in memory unless --db is given
    #[arg(long, global = true)]
    offline: bool,

    /// SQLite database path (overrides storage.database_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run a goal to completion
    Run {
        /// What the goal should achieve
        description: String,
        /// Higher runs first when queued
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Final output must contain this text (repeatable)
        #[arg(long)]
        contains: Vec<String>,
        /// Final output must have at least this many characters
        #[arg(long)]
        min_length: Option<usize>,
        /// Ask a model to confirm the output answers this question
        #[arg(long)]
        confirm: Option<String>,
        /// Retries per task (overrides engine.max_retries)
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Inspect stored goals
    Goals {
        #[command(subcommand)]
        action: GoalAction,
    },

    /// Show success rates learned from finished goals
    Learning,

    /// Model catalog and routing rules
    Models {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Provider configuration
    Providers {
        #[command(subcommand)]
        action: ProviderAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum GoalAction {
    /// List recent goals
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a goal and its tasks
    Show { id: String },
}

#[derive(Subcommand)]
enum ModelAction {
    /// List models, optionally the candidates for one category
    List {
        #[arg(short, long)]
        category: Option<TaskCategory>,
    },
}

#[derive(Subcommand)]
enum ProviderAction {
    /// Show which providers are usable
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "wayfinder=debug,wayfinder_core=debug"
    } else {
        "wayfinder=info,wayfinder_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // API keys may live in a local .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match &cli.command {
        Commands::Run {
            description,
            priority,
            contains,
            min_length,
            confirm,
            max_retries,
        } => {
            let mut request = GoalRequest::new(description.as_str()).with_priority(*priority);
            for text in contains {
                request = request.with_acceptance(AcceptanceCheck::Contains { text: text.clone() });
            }
            if let Some(chars) = min_length {
                request = request.with_acceptance(AcceptanceCheck::MinLength { chars: *chars });
            }
            if let Some(question) = confirm {
                request = request.with_acceptance(AcceptanceCheck::ModelConfirmation {
                    question: question.clone(),
                });
            }
            if let Some(max) = max_retries {
                request = request.with_max_retries(*max);
            }
            cmd_run(&cli, request).await
        }
        Commands::Goals { action } => cmd_goals(&cli, action).await,
        Commands::Learning => cmd_learning(&cli).await,
        Commands::Models { action } => cmd_models(&cli, action),
        Commands::Providers { action } => cmd_providers(&cli, action),
        Commands::Config { action } => cmd_config(action, cli.quiet),
        Commands::Doctor => cmd_doctor(&cli).await,
    };

    if let Err(e) = &result
        && let Some(core) = e.downcast_ref::<wayfinder_core::Error>()
        && let Some(hint) = core.suggestion()
    {
        eprintln!("Hint: {}", hint);
    }
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    if cli.offline {
        Ok(Config::offline())
    } else {
        Config::load()
    }
}

/// Open the goal store; `None` database means an ephemeral in-memory store
async fn open_store(cli: &Cli, config: &Config) -> anyhow::Result<(Arc<dyn GoalStore>, Option<Database>)> {
    let path = match (&cli.db, cli.offline) {
        (Some(path), _) => path.clone(),
        (None, true) => {
            debug!("Offline run, goals kept in memory");
            return Ok((Arc::new(InMemoryGoalStore::new()), None));
        }
        (None, false) => config.storage.resolved_path()?,
    };

    let db = Database::new(DatabaseConfig::with_path(path)).await?;
    let store: Arc<dyn GoalStore> = Arc::new(SqliteGoalStore::new(db.pool().clone()));
    Ok((store, Some(db)))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_run(cli: &Cli, request: GoalRequest) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let providers = ProviderRegistry::from_configs(&config.providers)?;
    if providers.is_empty() {
        warn!("No providers available; set an API key or use --offline");
    }
    let (store, db) = open_store(cli, &config).await?;
    let engine = GoalEngine::from_config(&config, providers, store).await?;

    let goal_id = engine.submit_request(request).await?;
    if !cli.quiet && cli.format == OutputFormat::Text {
        println!("Goal {} submitted", goal_id);
    }

    let goal = tokio::select! {
        goal = engine.run_goal(&goal_id) => goal?,
        _ = tokio::signal::ctrl_c() => {
            engine.cancel(&goal_id).await?;
            engine.get_status(&goal_id).await?
        }
    };
    let tasks = engine.tasks(&goal_id).await?;
    let ledger = engine.router().ledger();
    let spent = ledger.window_total();

    if cli.format == OutputFormat::Json {
        print_json(&serde_json::json!({
            "goal": goal,
            "tasks": tasks,
            "cost_usd": spent,
            "calls": ledger.records(),
        }))?;
    } else if !cli.quiet {
        println!("Goal {}: {}", goal.id, goal.state);
        if let Some(model) = &goal.model_id {
            println!("  Model: {}", model);
        }
        println!(
            "  Tasks: {}/{} succeeded",
            tasks
                .iter()
                .filter(|t| t.state == wayfinder_core::goals::TaskState::Succeeded)
                .count(),
            tasks.len()
        );
        println!("  Cost: ${:.4}", spent);
        if let Some(today) = ledger.today_summary() {
            let mut models: Vec<_> = today.by_model.values().collect();
            models.sort_by(|a, b| a.model.cmp(&b.model));
            for model in models {
                println!(
                    "    {}: {} call(s), {} in / {} out tokens, ${:.4}",
                    model.model,
                    model.call_count,
                    model.total_input_tokens,
                    model.total_output_tokens,
                    model.total_cost_usd
                );
            }
        }
        if let Some(output) = &goal.output {
            println!("\n{}", output);
        }
    } else if let Some(output) = &goal.output {
        println!("{}", output);
    }

    if let Some(db) = db {
        db.close().await;
    }

    match goal.state {
        GoalState::Completed => Ok(()),
        state => Err(anyhow::anyhow!(
            "Goal {}: {}",
            state,
            goal.failure_reason.as_deref().unwrap_or("no reason recorded")
        )),
    }
}

fn print_goal_line(goal: &Goal) {
    let short = goal.id.get(..8).unwrap_or(&goal.id);
    let mut description: String = goal.description.chars().take(60).collect();
    if goal.description.chars().count() > 60 {
        description.push_str("...");
    }
    println!(
        "  {} [{}] p{} {}",
        short, goal.state, goal.priority, description
    );
}

async fn cmd_goals(cli: &Cli, action: &GoalAction) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let (store, _db) = open_store(cli, &config).await?;

    match action {
        GoalAction::List { limit } => {
            let goals = store.list_goals(Some(*limit)).await?;
            if cli.format == OutputFormat::Json {
                return print_json(&goals);
            }
            if goals.is_empty() {
                if !cli.quiet {
                    println!("No goals found.");
                    println!("\nRun one with: wayfinder run \"<description>\"");
                }
            } else {
                if !cli.quiet {
                    println!("Goals:");
                }
                for goal in &goals {
                    print_goal_line(goal);
                }
            }
        }
        GoalAction::Show { id } => {
            let goal = store
                .load_goal(id)
                .await?
                .ok_or_else(|| wayfinder_core::Error::GoalNotFound(id.clone()))?;
            let tasks = store.load_tasks(id).await?;
            if cli.format == OutputFormat::Json {
                return print_json(&serde_json::json!({ "goal": goal, "tasks": tasks }));
            }

            println!("Goal: {}", goal.description);
            println!("  ID: {}", goal.id);
            println!("  State: {}", goal.state);
            println!("  Priority: {}", goal.priority);
            if let Some(category) = goal.category {
                println!("  Category: {}", category);
            }
            if let Some(model) = &goal.model_id {
                println!("  Model: {}", model);
            }
            if let Some(reason) = &goal.failure_reason {
                println!("  Reason: {}", reason);
            }
            println!("  Created: {}", goal.created_at.format("%Y-%m-%d %H:%M:%S"));
            println!("  Updated: {}", goal.updated_at.format("%Y-%m-%d %H:%M:%S"));

            if !tasks.is_empty() {
                println!("\nTasks:");
                for task in &tasks {
                    println!(
                        "  {}. {} [{}] retries={}{}",
                        task.position + 1,
                        task.action,
                        task.state,
                        task.retry_count,
                        task.model_id
                            .as_deref()
                            .map(|m| format!(" model={}", m))
                            .unwrap_or_default()
                    );
                    if let Some(error) = &task.error {
                        println!("     error: {}", error);
                    }
                }
            }
            if let Some(output) = &goal.output {
                println!("\nOutput:\n{}", output);
            }
        }
    }
    Ok(())
}

async fn cmd_learning(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let (store, _db) = open_store(cli, &config).await?;
    let records = store.load_learning().await?;
    let summaries = LearningLedger::from_records(&records).all();

    if cli.format == OutputFormat::Json {
        return print_json(&summaries);
    }
    if summaries.is_empty() {
        if !cli.quiet {
            println!("No outcomes recorded yet.");
        }
        return Ok(());
    }

    println!("{:<14} {:<40} {:>8} {:>9} {:>10}", "CATEGORY", "MODEL", "ATTEMPTS", "SUCCESSES", "CONFIDENCE");
    for summary in summaries {
        println!(
            "{:<14} {:<40} {:>8} {:>9} {:>10.2}",
            summary.category.as_str(),
            summary.model_id,
            summary.stats.attempts,
            summary.stats.successes,
            summary.stats.confidence()
        );
    }
    Ok(())
}

fn cmd_models(cli: &Cli, action: &ModelAction) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let snapshot = config.snapshot()?;

    match action {
        ModelAction::List { category: None } => {
            let models = snapshot.catalog().all();
            if cli.format == OutputFormat::Json {
                return print_json(&models);
            }
            println!("{:<40} {:<12} {:>10} {:>10} {:>9}  CAPABILITIES", "MODEL", "PROVIDER", "IN $/M", "OUT $/M", "CONTEXT");
            for model in models {
                let capabilities: Vec<String> = model.capabilities.iter().map(|c| c.to_string()).collect();
                println!(
                    "{:<40} {:<12} {:>10} {:>10} {:>9}  {}",
                    model.id,
                    model.provider,
                    if model.is_free { "free".to_string() } else { format!("{:.2}", model.input_cost_per_million) },
                    if model.is_free { "free".to_string() } else { format!("{:.2}", model.output_cost_per_million) },
                    model.context_window,
                    capabilities.join(",")
                );
            }

            if !cli.quiet {
                println!("\nRouting rules:");
                for category in snapshot.rules().categories() {
                    let ids = snapshot.rules().candidates(category).unwrap_or_default();
                    println!("  {:<14} {}", category.as_str(), ids.join(" -> "));
                }
            }
        }
        ModelAction::List {
            category: Some(category),
        } => {
            let candidates = snapshot.candidates(*category).ok_or_else(|| {
                wayfinder_core::Error::NoSuitableModel(category.to_string())
            })?;
            if cli.format == OutputFormat::Json {
                return print_json(&candidates);
            }
            for (rank, model) in candidates.iter().enumerate() {
                println!("  {}. {} ({})", rank + 1, model.id, model.provider);
            }
        }
    }
    Ok(())
}

fn cmd_providers(cli: &Cli, action: &ProviderAction) -> anyhow::Result<()> {
    let config = load_config(cli)?;

    match action {
        ProviderAction::Status => {
            if cli.format == OutputFormat::Json {
                let rows: Vec<_> = config
                    .providers
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "name": p.name,
                            "kind": p.kind,
                            "base_url": p.base_url,
                            "enabled": p.key_available(),
                            "models": config.models.iter().filter(|m| m.provider == p.name).count(),
                        })
                    })
                    .collect();
                return print_json(&rows);
            }

            for provider in &config.providers {
                let models = config.models.iter().filter(|m| m.provider == provider.name).count();
                let key = match &provider.api_key_env {
                    None => "no key required".to_string(),
                    Some(var) => match provider.redacted_api_key() {
                        Some(redacted) => format!("{} ({})", var, redacted),
                        None => format!("{} not set", var),
                    },
                };
                let marker = if provider.key_available() { "[OK]" } else { "[!!]" };
                println!(
                    "{} {} ({}) - {} models, {}",
                    marker, provider.name, provider.kind, models, key
                );
            }
        }
    }
    Ok(())
}

fn cmd_config(action: &ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(key, value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(cli: &Cli) -> anyhow::Result<()> {
    let quiet = cli.quiet;
    if !quiet {
        println!("Wayfinder Health Check");
        println!("======================");
        println!();
    }

    let mut all_ok = true;

    let config = match load_config(cli) {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid");
            }
            config
        }
        Err(e) => {
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
            return Err(anyhow::anyhow!("Health check failed"));
        }
    };

    match config.snapshot() {
        Ok(snapshot) => {
            if !quiet {
                println!(
                    "[OK] Routing: {} models, {} categories",
                    snapshot.catalog().len(),
                    snapshot.rules().categories().len()
                );
            }
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Routing: {}", e);
            }
        }
    }

    let usable = config.providers.iter().filter(|p| p.key_available()).count();
    if usable == 0 {
        all_ok = false;
        if !quiet {
            println!("[!!] Providers: none usable");
            println!("     Set the API key environment variable of at least one provider");
        }
    } else if !quiet {
        println!("[OK] Providers: {}/{} usable", usable, config.providers.len());
    }

    match open_store(cli, &config).await {
        Ok((_, Some(db))) => {
            db.health_check().await?;
            let status = db.migration_status().await?;
            if !quiet {
                println!(
                    "[OK] Database: {} (schema v{})",
                    db.path().display(),
                    status.current_version
                );
            }
            db.close().await;
        }
        Ok((_, None)) => {
            if !quiet {
                println!("[OK] Database: in memory");
            }
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Database: Error - {}", e);
            }
        }
    }

    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }

    if all_ok {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Health check failed"))
    }
}

#[cfg(test)]
mod main_tests;
