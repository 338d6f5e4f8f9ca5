//! Drives a batch of requests through the loopback transport and prints a
//! JSON summary of how they resolved.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use replywire_core::Lifecycle;
use replywire_requestor::{
    CorrelationConfig, CorrelationError, CorrelationManager, CorrelationStrategy, LoopbackConfig,
    LoopbackTransport, OutboundMessage, Requestor,
};

#[derive(Parser, Debug)]
#[command(name = "loopback-demo")]
#[command(about = "Request/reply correlation over an in-process echo transport")]
struct Args {
    /// Number of requests to send.
    #[arg(long, default_value_t = 20, env = "REPLYWIRE_REQUESTS")]
    requests: u32,

    /// Correlation key strategy; overrides the config file.
    #[arg(long, value_enum, env = "REPLYWIRE_STRATEGY")]
    strategy: Option<CorrelationStrategy>,

    /// Reply timeout in milliseconds; overrides the config file.
    #[arg(long, env = "REPLYWIRE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Purge interval in milliseconds; overrides the config file.
    #[arg(long, env = "REPLYWIRE_PURGE_INTERVAL_MS")]
    purge_interval_ms: Option<u64>,

    /// Delay before the loopback echoes a request, in milliseconds.
    #[arg(long, default_value_t = 25)]
    reply_delay_ms: u64,

    /// Drop the reply to every n-th request (0 = never).
    #[arg(long, default_value_t = 5)]
    drop_every: u64,

    /// JSON file holding a `CorrelationConfig`.
    #[arg(long, env = "REPLYWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    requests: u32,
    replies: u32,
    timeouts: u32,
    failures: u32,
    still_pending: usize,
    elapsed_ms: u128,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_config(args: &Args) -> Result<CorrelationConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config '{}'", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config '{}'", path.display()))?
        }
        None => CorrelationConfig::default(),
    };

    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.default_request_timeout_ms = timeout_ms;
    }
    if let Some(purge_interval_ms) = args.purge_interval_ms {
        config.purge_interval_ms = purge_interval_ms;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;
    info!(?config, "starting loopback demo");

    let (transport, replies) = LoopbackTransport::new(LoopbackConfig {
        reply_delay_ms: args.reply_delay_ms,
        drop_every: args.drop_every,
        correlation_header: config.correlation_header.clone(),
    });
    let manager = Arc::new(CorrelationManager::new(config));
    manager.start().await?;

    let requestor = Arc::new(Requestor::new(manager.clone(), Arc::new(transport)));
    let listener = requestor.spawn_reply_listener(replies);

    let started = tokio::time::Instant::now();
    let mut tasks = JoinSet::new();
    for i in 0..args.requests {
        let requestor = requestor.clone();
        tasks.spawn(async move {
            let message = OutboundMessage::new("queue:echo", format!("order-{i}"));
            requestor.request(message).await?.wait().await
        });
    }

    let mut summary = Summary {
        requests: args.requests,
        ..Summary::default()
    };
    while let Some(joined) = tasks.join_next().await {
        match joined.context("request task panicked")? {
            Ok(_) => summary.replies += 1,
            Err(CorrelationError::Timeout { correlation_id, .. }) => {
                warn!(%correlation_id, "request timed out");
                summary.timeouts += 1;
            }
            Err(err) => {
                warn!(error = %err, "request failed");
                summary.failures += 1;
            }
        }
    }
    summary.still_pending = manager.pending_count();
    summary.elapsed_ms = started.elapsed().as_millis();

    manager.shutdown().await?;
    listener.abort();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.replies + summary.timeouts + summary.failures != summary.requests {
        anyhow::bail!("some requests never resolved");
    }
    Ok(())
}
