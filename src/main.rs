use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use ratewarden::config::WardenConfig;
use ratewarden::error::WardenError;
use ratewarden::ratelimit::{
    format_interval, MemoryStore, PolicyConfig, RateLimit, RateLimitConfig, RateLimiter,
    RouteConfig, SystemClock,
};
use ratewarden::telemetry;

/// Exit status of a request rejected by its rate limit.
const EXIT_REJECTED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Per-route rate limiting")]
struct Cli {
    /// Settings file (defaults to ./ratewarden.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rules file, overrides rate_limiting.rules_path
    #[arg(short, long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the rules file, then list its routes
    Validate,

    /// Consume tokens for a client on a route
    Consume {
        /// Route key
        #[arg(long)]
        route: String,
        /// Client key
        #[arg(long)]
        key: String,
        /// Tokens to consume
        #[arg(long, default_value_t = 1)]
        tokens: u32,
        /// JSON file keeping limiter state between runs
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Show whether a client could call a route right now
    Peek {
        #[arg(long)]
        route: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Clear a client's state on a route, or every client's without --key
    Reset {
        #[arg(long)]
        route: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Send a steady stream of requests and print every decision
    Simulate {
        #[arg(long)]
        route: String,
        #[arg(long)]
        key: String,
        /// Number of requests to send
        #[arg(long, default_value_t = 10)]
        requests: u32,
        /// Delay between requests in milliseconds
        #[arg(long, default_value_t = 1000)]
        every_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = WardenConfig::load(cli.config.as_deref()).context("loading settings")?;
    telemetry::init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratewarden");

    let rules_path = cli
        .rules
        .clone()
        .unwrap_or_else(|| config.rate_limiting.rules_path.clone());
    let rules = RateLimitConfig::from_file(&rules_path)
        .with_context(|| format!("loading rules from {}", rules_path.display()))?;
    info!(path = %rules_path.display(), routes = rules.routes.len(), "Rules loaded");

    let store = Arc::new(MemoryStore::with_capacity(config.rate_limiting.max_states));
    let limiter = Arc::new(RateLimiter::with_store(rules, store.clone(), Arc::new(SystemClock)));

    match cli.command {
        Command::Validate => {
            for (name, route) in limiter.config().routes() {
                println!("{}", describe_route(name, route));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Consume {
            route,
            key,
            tokens,
            state,
        } => {
            load_state(&store, state.as_deref())?;
            let limit = limiter.consume(&route, &key, tokens)?;
            save_state(&store, state.as_deref())?;
            print_decision(&limit)
        }
        Command::Peek { route, key, state } => {
            load_state(&store, state.as_deref())?;
            let limit = limiter.peek(&route, &key)?;
            print_decision(&limit)
        }
        Command::Reset { route, key, state } => {
            load_state(&store, state.as_deref())?;
            match key {
                Some(key) => {
                    let existed = limiter.reset(&route, &key)?;
                    let report = serde_json::json!({
                        "route": route,
                        "key": key,
                        "reset": existed,
                    });
                    println!("{}", report);
                }
                None => {
                    let removed = limiter.reset_route(&route)?;
                    println!("{}", serde_json::json!({ "route": route, "reset": removed }));
                }
            }
            save_state(&store, state.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Simulate {
            route,
            key,
            requests,
            every_ms,
        } => {
            let purge = limiter.spawn_purge_task(Duration::from_secs(
                config.rate_limiting.purge_interval_secs,
            ));

            let every = Duration::from_millis(every_ms);
            let result = tokio::select! {
                result = simulate(&limiter, &route, &key, requests, every) => result,
                _ = shutdown_signal() => Ok(()),
            };

            purge.abort();
            result?;
            info!("Simulation finished");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Send `requests` single-token requests, one every `every`.
async fn simulate(
    limiter: &RateLimiter,
    route: &str,
    key: &str,
    requests: u32,
    every: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    let mut accepted = 0u32;

    for attempt in 1..=requests {
        ticker.tick().await;
        match limiter.ensure_accepted(route, key) {
            Ok(limit) => {
                accepted += 1;
                println!("{}", serde_json::to_string(&limit)?);
            }
            Err(WardenError::LimitExceeded { retry_after, .. }) => {
                warn!(attempt = attempt, retry_after = %retry_after, "Request rejected");
                let report = serde_json::json!({
                    "attempt": attempt,
                    "accepted": false,
                    "retry_after": retry_after,
                });
                println!("{}", report);
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(requests = requests, accepted = accepted, "Simulation complete");
    Ok(())
}

fn print_decision(limit: &RateLimit) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(limit)?);
    if limit.accepted {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_REJECTED))
    }
}

fn load_state(store: &MemoryStore, path: Option<&Path>) -> anyhow::Result<()> {
    if let Some(path) = path {
        store
            .load_snapshot(path)
            .with_context(|| format!("loading state from {}", path.display()))?;
    }
    Ok(())
}

fn save_state(store: &MemoryStore, path: Option<&Path>) -> anyhow::Result<()> {
    if let Some(path) = path {
        store
            .save_snapshot(path)
            .with_context(|| format!("saving state to {}", path.display()))?;
    }
    Ok(())
}

fn describe_route(name: &str, route: &RouteConfig) -> String {
    let status = if route.enabled { "enabled" } else { "disabled" };
    let detail = match &route.policy {
        PolicyConfig::FixedWindow(p) | PolicyConfig::SlidingWindow(p) => {
            format!("{} per {}", p.limit, format_interval(p.interval))
        }
        PolicyConfig::TokenBucket(p) => format!(
            "bucket of {}, refill {} per {}",
            p.limit,
            p.rate.amount,
            format_interval(p.rate.interval)
        ),
        PolicyConfig::TimeBackoff(p) => {
            let steps: Vec<String> = p
                .limits
                .iter()
                .map(|step| format!("after {} wait {}", step.limit, format_interval(step.interval)))
                .collect();
            let reset = route.reset.map(format_interval).unwrap_or_default();
            format!("{}; reset after {}", steps.join(", "), reset)
        }
    };

    format!("{} [{}, {}] {}", name, route.policy.kind(), status, detail)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
