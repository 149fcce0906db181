//! CLI tests

use clap::Parser;

use crate::{Cli, Commands, ConfigAction, GoalAction, ModelAction, OutputFormat};
use wayfinder_core::routing::TaskCategory;

#[test]
fn test_run_parses_acceptance_flags() {
    let cli = Cli::try_parse_from([
        "wayfinder",
        "--offline",
        "run",
        "Say hello",
        "--priority",
        "5",
        "--contains",
        "hello",
        "--contains",
        "Say",
        "--min-length",
        "3",
        "--max-retries",
        "1",
    ])
    .unwrap();

    assert!(cli.offline);
    match cli.command {
        Commands::Run {
            description,
            priority,
            contains,
            min_length,
            confirm,
            max_retries,
        } => {
            assert_eq!(description, "Say hello");
            assert_eq!(priority, 5);
            assert_eq!(contains, vec!["hello", "Say"]);
            assert_eq!(min_length, Some(3));
            assert_eq!(confirm, None);
            assert_eq!(max_retries, Some(1));
        }
        _ => panic!("expected run"),
    }
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["wayfinder", "goals", "list", "--format", "json", "-v"]).unwrap();
    assert!(cli.format == OutputFormat::Json);
    assert!(cli.verbose);
    assert!(matches!(cli.command, Commands::Goals { action: GoalAction::List { limit: 20 } }));
}

#[test]
fn test_models_category_parses() {
    let cli = Cli::try_parse_from(["wayfinder", "models", "list", "--category", "coding"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Models {
            action: ModelAction::List {
                category: Some(TaskCategory::Coding)
            }
        }
    ));

    assert!(Cli::try_parse_from(["wayfinder", "models", "list", "--category", "poetry"]).is_err());
}

#[test]
fn test_config_set_requires_value() {
    assert!(Cli::try_parse_from(["wayfinder", "config", "set", "cache.enabled"]).is_err());

    let cli = Cli::try_parse_from(["wayfinder", "config", "set", "cache.enabled", "false"]).unwrap();
    match cli.command {
        Commands::Config {
            action: ConfigAction::Set { key, value },
        } => {
            assert_eq!(key, "cache.enabled");
            assert_eq!(value, "false");
        }
        _ => panic!("expected config set"),
    }
}

#[test]
fn test_run_requires_description() {
    assert!(Cli::try_parse_from(["wayfinder", "run"]).is_err());
}
