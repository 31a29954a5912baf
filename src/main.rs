use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{RateLimitConfig, RateLimitRule};

/// Operator tooling for Tollgate rate limits.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML); TOLLGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a rules file and list the rules for each method
    Check {
        /// Rules file (YAML)
        rules: PathBuf,
    },
    /// Print the resolved configuration and connect to the counter store
    Describe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "Tollgate");

    match cli.command {
        Command::Check { rules } => check(&rules),
        Command::Describe => describe(cli.config.as_deref()).await,
    }
}

fn check(path: &std::path::Path) -> anyhow::Result<()> {
    let rules = RateLimitConfig::from_file(path)
        .with_context(|| format!("invalid rules file {}", path.display()))?;

    for method in rules.methods.keys() {
        println!("{}", method);
        for rule in rules.rules_for::<()>(method)? {
            println!("  {}", summarize(&rule));
        }
    }

    info!(methods = rules.methods.len(), "Rules file is valid");
    Ok(())
}

fn summarize(rule: &RateLimitRule<()>) -> String {
    let mut line = format!("{} calls per {}s", rule.max_calls(), rule.time_period());
    if let Some(group) = rule.group_name() {
        line.push_str(&format!(", group {}", group));
    }
    if !rule.keys().is_empty() {
        let keys: Vec<String> = rule.keys().iter().map(ToString::to_string).collect();
        line.push_str(&format!(", keyed by {}", keys.join(" + ")));
    }
    line
}

async fn describe(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = TollgateConfig::load(config_path).context("failed to load configuration")?;
    print!("{}", serde_yaml::to_string(&config)?);

    let rules = config.load_rules().context("failed to load rules")?;
    info!(methods = rules.methods.len(), "Rules loaded");

    config
        .build_limiter()
        .await
        .context("failed to open counter store")?;
    info!(backend = ?config.store.backend, "Counter store reachable");
    Ok(())
}
