use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::error::GatekeeperError;
use gatekeeper::ratelimit::{RateLimiter, RateLimiterBackend};

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Rate limiting decisions from the command line")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `gatekeeper=debug`
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run decisions for one subject and print each outcome as a JSON line
    Decide {
        /// Context (policy) name
        context: String,

        /// Subject being limited
        subject: String,

        /// Number of decisions to run
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Run all decisions at once instead of one after another
        #[arg(long)]
        concurrent: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Gatekeeper");

    let config = GatekeeperConfig::load(cli.config.as_deref())?;
    info!(
        policies = config.policies.len(),
        failure_policy = ?config.limiter.failure_policy,
        "Configuration loaded"
    );

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Decide {
            context,
            subject,
            count,
            concurrent,
        } => {
            let limiter = build_limiter(&config).await?;
            let outcomes = if concurrent {
                join_all((0..count).map(|_| limiter.decide(&context, &subject))).await
            } else {
                let mut outcomes = Vec::with_capacity(count);
                for _ in 0..count {
                    outcomes.push(limiter.decide(&context, &subject).await);
                }
                outcomes
            };

            for (index, outcome) in outcomes.into_iter().enumerate() {
                let line = match outcome {
                    Ok(decision) => {
                        json!({ "request": index, "accepted": true, "decision": decision })
                    }
                    Err(GatekeeperError::LimitExceeded { state, .. }) => {
                        json!({ "request": index, "accepted": false, "state": state })
                    }
                    Err(error) => {
                        json!({ "request": index, "accepted": false, "error": error.to_string() })
                    }
                };
                println!("{}", line);
            }
        }
    }

    Ok(())
}

fn init_tracing(filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build the limiter the configuration asks for.
async fn build_limiter(config: &GatekeeperConfig) -> anyhow::Result<Arc<dyn RateLimiterBackend>> {
    #[cfg(feature = "redis")]
    if let Some(shared) = &config.shared_store {
        use gatekeeper::ratelimit::{DistributedRateLimiter, RedisAtomicStore};

        let store = Arc::new(RedisAtomicStore::connect(shared).await?);
        info!(key_prefix = %shared.key_prefix, "Using distributed rate limiter");
        return Ok(Arc::new(DistributedRateLimiter::from_config(config, store)?));
    }

    #[cfg(not(feature = "redis"))]
    if let Some(shared) = &config.shared_store {
        tracing::warn!(
            url = %shared.url,
            "Shared store configured but built without the redis feature, ignoring it"
        );
    }

    let limiter = Arc::new(RateLimiter::from_config(config)?);
    if config.limiter.sweep_interval_ms > 0 {
        limiter.spawn_sweeper(Duration::from_millis(config.limiter.sweep_interval_ms));
    }
    info!("Using in-process rate limiter");
    Ok(limiter)
}
