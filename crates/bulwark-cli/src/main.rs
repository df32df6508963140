use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use bulwark_client::HttpJsonCollector;
use bulwark_core::traits::{Collector, Params, WindowStore};
use bulwark_core::{
    CollectorSettings, InMemoryWindowStore, ProtectedExecutor, RateLimiter, TracingEventSink,
};
use bulwark_redis::{RedisConfig, RedisWindowStore};

#[derive(Parser)]
#[command(name = "bulwark", version, about = "Rate-limited, circuit-broken data collection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect data for a target from a JSON API with full protection
    Collect {
        /// Collector endpoint, queried as `GET <url>?q=<target>`
        #[arg(short, long)]
        url: String,

        /// Target to collect (company name, identifier, ...)
        #[arg(short, long)]
        target: String,

        /// Collector name (defaults to the URL host)
        #[arg(short, long)]
        name: Option<String>,

        /// Extra query parameter, repeatable
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// JSON pointer to the item array in responses
        #[arg(long)]
        items_pointer: Option<String>,

        /// Path to a JSON collector settings file
        #[arg(short, long, env = "BULWARK_CONFIG")]
        config: Option<PathBuf>,

        /// Share the rate-limit window through Redis (requires REDIS_URL)
        #[arg(long, default_value_t = false)]
        redis: bool,

        /// Run the same collection this many times
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Inspect or reset a shared rate-limit window (requires REDIS_URL)
    Limit {
        #[command(subcommand)]
        action: LimitAction,
    },

    /// Probe a collector endpoint without protections
    Health {
        #[arg(short, long)]
        url: String,
    },
}

#[derive(Subcommand)]
enum LimitAction {
    /// Show current usage of a window
    Status {
        /// Rate-limit key, `<collector>:<target>`
        #[arg(short, long)]
        key: String,

        /// Path to a JSON collector settings file
        #[arg(short, long, env = "BULWARK_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Clear a window
    Reset {
        #[arg(short, long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bulwark=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Collect {
            url,
            target,
            name,
            params,
            items_pointer,
            config,
            redis,
            repeat,
            timeout,
        } => {
            let settings = load_settings(config.as_deref())?;
            let name = match name {
                Some(name) => name,
                None => derive_collector_name(&url)?,
            };
            let mut collector =
                HttpJsonCollector::with_timeout(name, &url, Duration::from_secs(timeout))
                    .map_err(|e| anyhow::anyhow!(e))?;
            if let Some(pointer) = items_pointer {
                collector = collector.with_items_pointer(pointer);
            }
            let params: Params = params.into_iter().collect();

            if redis {
                let store = connect_redis().await?;
                cmd_collect(collector, store, &settings, &target, &params, repeat).await?;
            } else {
                let store = InMemoryWindowStore::new();
                cmd_collect(collector, store, &settings, &target, &params, repeat).await?;
            }
        }
        Commands::Limit { action } => {
            let store = connect_redis().await?;
            match action {
                LimitAction::Status { key, config } => {
                    let settings = load_settings(config.as_deref())?;
                    let limiter = RateLimiter::new(store, settings.rate_limit);
                    let status = limiter
                        .get_status(&key)
                        .await
                        .map_err(|e| anyhow::anyhow!(e))?;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                LimitAction::Reset { key } => {
                    let limiter = RateLimiter::new(store, Default::default());
                    if !limiter.reset(&key).await {
                        anyhow::bail!("Failed to reset rate limit for '{key}'");
                    }
                    println!("Rate limit for '{key}' reset");
                }
            }
        }
        Commands::Health { url } => {
            let name = derive_collector_name(&url)?;
            let collector = HttpJsonCollector::new(name, &url).map_err(|e| anyhow::anyhow!(e))?;
            if !collector.validate_config() {
                anyhow::bail!("Invalid collector URL: {url}");
            }
            let report = collector.health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn load_settings(path: Option<&std::path::Path>) -> Result<CollectorSettings> {
    match path {
        Some(path) => CollectorSettings::from_file(path).map_err(|e| anyhow::anyhow!(e)),
        None => Ok(CollectorSettings::default()),
    }
}

async fn connect_redis() -> Result<RedisWindowStore> {
    let config = RedisConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    RedisWindowStore::connect(&config)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to connect to the rate-limit store")
}

/// Parse `key=value` pairs passed with `--param`.
fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' in '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Use the URL host as collector name, e.g. "https://api.insee.fr/v3" -> "api.insee.fr".
fn derive_collector_name(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("Invalid URL: {url}"))?;
    parsed
        .host_str()
        .map(str::to_string)
        .with_context(|| format!("URL has no host: {url}"))
}

async fn cmd_collect<S: WindowStore>(
    collector: HttpJsonCollector,
    store: S,
    settings: &CollectorSettings,
    target: &str,
    params: &Params,
    repeat: u32,
) -> Result<()> {
    let executor = ProtectedExecutor::from_settings(collector, store, settings, TracingEventSink)
        .map_err(|e| anyhow::anyhow!(e))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling collection");
            on_signal.cancel();
        }
    });

    for run in 1..=repeat.max(1) {
        if cancel.is_cancelled() {
            break;
        }
        let result = executor.collect_with_cancel(target, params, &cancel).await;
        tracing::info!(
            run,
            items = result.data.len(),
            quality_score = result.quality_score,
            retries = result.retry_count,
            cache_hit = result.cache_hit,
            "Collection finished"
        );
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    let status = executor.status();
    tracing::info!(
        circuit_state = %status.circuit_breaker.state,
        success_rate = status.stats.success_rate(),
        "Collector status"
    );
    eprintln!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
