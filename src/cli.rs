//! CLI interface for hitl-agent

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::bus::{MessageBus, Topic};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{self, Config};
use crate::hitl::HitlProtocol;
use crate::preference::{LearnError, PreferenceEngine};
use crate::runtime::Runtime;
use crate::store::Store;

#[derive(Parser)]
#[command(name = "hitl-agent")]
#[command(about = "Human-in-the-loop question broker with preference learning", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "HITL_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bus consumers and schedulers until interrupted
    Run {
        /// Reload the configuration file when it changes
        #[arg(short, long)]
        watch: bool,
    },
    /// Show question and message log counts
    Status,
    /// Show what has been learned about a user
    Insights {
        /// User to report on (defaults to the policy's default user)
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Hold back questions for a user while they focus
    Focus {
        #[arg(short, long)]
        user: Option<String>,
        /// Minutes of focus from now
        #[arg(short, long, default_value = "60")]
        minutes: i64,
        /// End an active focus period instead
        #[arg(long)]
        clear: bool,
    },
    /// Re-check database integrity and lift a write block
    Repair,
    /// Manage the configuration file
    Config {
        /// Write the default configuration if none exists
        #[arg(long)]
        init: bool,
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => config::config_path(),
    }
}

fn load_config(path: &std::path::Path) -> Result<Config> {
    if path.exists() {
        Config::load_from(path)
    } else {
        Ok(Config::default())
    }
}

/// Components for one-shot commands that do not start the loops
async fn open_components(config: Config) -> Result<(Arc<Store>, Arc<MessageBus>, Arc<HitlProtocol>)> {
    let clock: SharedClock = Arc::new(SystemClock);
    let path = config.store.resolve_path()?;
    let store = Arc::new(
        Store::open(&path, &config.store)
            .await
            .with_context(|| format!("Failed to open store at {}", path.display()))?,
    );
    let shared = config.into_shared();
    let bus = Arc::new(MessageBus::new(store.clone(), shared.clone(), clock.clone()));
    let engine = Arc::new(PreferenceEngine::new(store.clone(), shared.clone(), clock.clone()));
    let protocol = Arc::new(HitlProtocol::new(store.clone(), bus.clone(), engine, shared, clock));
    Ok((store, bus, protocol))
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config)?;

    match cli.command {
        Commands::Run { watch } => {
            let config = load_config(&config_path)?;
            let mut runtime = Runtime::bootstrap(config, Arc::new(SystemClock)).await?;
            if watch {
                runtime = runtime.with_config_watcher(&config_path)?;
            }
            let recovery = runtime.recovery();
            println!(
                "Recovered message log: {} pending, {} leased, {} stale leases released",
                recovery.stats.pending, recovery.stats.leased, recovery.released
            );

            runtime.start().await?;
            println!("hitl-agent running. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            runtime.shutdown().await?;
        }
        Commands::Status => {
            let config = load_config(&config_path)?;
            let (store, bus, protocol) = open_components(config).await?;

            println!("Store: {}", store.path().display());
            if store.is_write_blocked() {
                println!("  WRITES BLOCKED: integrity check failed, run `hitl-agent repair`");
            }
            println!();
            println!("Questions:");
            for (status, count) in protocol.status_counts().await? {
                println!("  {:<12} {}", status.as_str(), count);
            }
            println!();
            println!("Message log:");
            println!("  {:<20} {:>8} {:>8} {:>8}", "topic", "pending", "leased", "acked");
            for topic in Topic::ALL {
                let stats = bus.stats(Some(topic)).await?;
                println!(
                    "  {:<20} {:>8} {:>8} {:>8}",
                    topic.as_str(),
                    stats.pending,
                    stats.leased,
                    stats.acked
                );
            }
        }
        Commands::Insights { user } => {
            let config = load_config(&config_path)?;
            let user = user.unwrap_or_else(|| config.policy.default_user_id.clone());
            let clock: SharedClock = Arc::new(SystemClock);
            let path = config.store.resolve_path()?;
            let store = Arc::new(Store::open(&path, &config.store).await?);
            let engine = PreferenceEngine::new(store, config.into_shared(), clock);

            match engine.insights(&user).await {
                Ok(insights) => {
                    println!("Insights for {}", insights.user_id);
                    println!("  Observations:          {}", insights.observations);
                    println!(
                        "  Best time of day:      {}",
                        insights.best_time_bucket.as_deref().unwrap_or("-")
                    );
                    println!("  Best day:              {}", insights.best_day.as_deref().unwrap_or("-"));
                    println!("  Confidence threshold:  {:.3}", insights.confidence_threshold);
                    println!("  Evidence threshold:    {}", insights.evidence_threshold);
                    println!("  Answered 'later':      {:.0}%", insights.later_rate * 100.0);
                }
                Err(LearnError::InsufficientData {
                    observations,
                    required,
                    ..
                }) => {
                    println!(
                        "Not enough answers from {} yet ({} of {} needed).",
                        user, observations, required
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Focus { user, minutes, clear } => {
            let config = load_config(&config_path)?;
            let user = user.unwrap_or_else(|| config.policy.default_user_id.clone());
            let (_, _, protocol) = open_components(config).await?;

            if clear {
                if protocol.clear_focus(&user).await? {
                    println!("Focus cleared for {}", user);
                } else {
                    println!("{} was not in focus", user);
                }
            } else {
                if minutes <= 0 {
                    anyhow::bail!("--minutes must be positive");
                }
                let until = chrono::Utc::now() + chrono::Duration::minutes(minutes);
                protocol.mark_focus(&user, until).await?;
                println!("Questions for {} held until {}", user, until.to_rfc3339());
            }
        }
        Commands::Repair => {
            let config = load_config(&config_path)?;
            let path = config.store.resolve_path()?;
            let store = Store::open(&path, &config.store).await?;
            store.repair().await?;
            println!("Store at {} is healthy.", path.display());
        }
        Commands::Config { init, show } => {
            if init {
                if config_path.exists() {
                    println!("Configuration already exists at {}", config_path.display());
                } else {
                    Config::default().save_to(&config_path)?;
                    println!("Wrote default configuration to {}", config_path.display());
                }
            }
            if show {
                let config = load_config(&config_path)?;
                println!("# {}", config_path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
            if !init && !show {
                println!("Configuration file: {}", config_path.display());
                println!();
                println!("Options:");
                println!("  --init   Write the default configuration");
                println!("  --show   Print the effective configuration");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_focus_defaults() {
        let cli = Cli::try_parse_from(["hitl-agent", "focus", "--user", "alice"]).unwrap();
        match cli.command {
            Commands::Focus { user, minutes, clear } => {
                assert_eq!(user.as_deref(), Some("alice"));
                assert_eq!(minutes, 60);
                assert!(!clear);
            }
            _ => panic!("expected focus"),
        }
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.runtime.consumer_group, "hitl");
    }
}
