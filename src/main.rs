use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wafwatch::cache::VectorCache;
use wafwatch::config::WafwatchConfig;
use wafwatch::detect::rules::RuleBasedDetector;

#[derive(Parser)]
#[command(
    name = "wafwatch",
    about = "Streaming anomaly detection and alerting for web application firewall logs",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $WAFWATCH_CONFIG, then /etc/wafwatch/wafwatch.toml)
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection pipeline over JSON-lines records
    Serve {
        /// Read records from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Inspect rule files
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Manage the persistent vector cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate and print the effective configuration as TOML
    Show,
}

#[derive(Subcommand)]
enum RulesAction {
    /// Validate a rule file and list the rules it activates
    Check {
        /// Rule file (JSON)
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry count and capacity
    Stats,

    /// Remove every cached vector
    Clear,
}

fn load_config(path: Option<&PathBuf>) -> Result<WafwatchConfig> {
    match path {
        Some(p) => WafwatchConfig::load(p),
        None => Ok(WafwatchConfig::load_or_default()),
    }
}

fn init_tracing(config: &WafwatchConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config_path.as_ref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { input } => {
            tracing::info!(input = ?input, "Starting wafwatch");
            wafwatch::serve(config, input).await?;
        }
        Commands::Rules { action } => match action {
            RulesAction::Check { path } => {
                if !path.exists() {
                    bail!("rules file not found: {}", path.display());
                }
                let mut detector = RuleBasedDetector::new();
                let count = detector
                    .load_rules(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                println!("{} rules loaded from {}", count, path.display());
                for rule in detector.rules() {
                    println!("  {:<30} {}", rule.name(), rule.severity());
                }
            }
        },
        Commands::Cache { action } => {
            let cache = VectorCache::open(&config.cache);
            match action {
                CacheAction::Stats => {
                    let stats = cache.stats();
                    println!("entries:  {}", stats.entries);
                    println!("capacity: {}", cache.capacity());
                    match &config.cache.path {
                        Some(p) => println!("path:     {}", p.display()),
                        None => println!("path:     (in memory)"),
                    }
                }
                CacheAction::Clear => {
                    let removed = cache.len();
                    cache.clear();
                    println!("removed {} cached vectors", removed);
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                config.validate().context("invalid configuration")?;
                let rendered =
                    toml::to_string_pretty(&config).context("failed to render config")?;
                println!("{}", rendered);
            }
        },
    }

    Ok(())
}
