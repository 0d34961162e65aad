//! # Wirepool CLI
//!
//! Diagnostic front end for the `wirepool` connection pool.
//!
//! ## Features
//!
//! - Probe a WebSocket endpoint with concurrent clients sharing one pool
//! - Print pool metrics in Prometheus text or JSON form
//! - Show the effective configuration after file and environment layering
//!
//! ## Usage
//!
//! ```bash
//! # Eight clients, fifty messages each, against a local echo server
//! wirepool probe --url ws://127.0.0.1:9001/echo --clients 8 --messages 50
//!
//! # Same probe with a config file and machine-readable output
//! wirepool probe --url ws://127.0.0.1:9001/echo --config pool.toml --json
//!
//! # Effective configuration, including WIREPOOL_* overrides
//! wirepool config --config pool.toml
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use wirepool::{
    ConnectionPool, JsonExporter, MetricsExporter, PoolConfig, PoolMetrics, PoolStatus,
    PrometheusExporter, Priority,
};

/// Main CLI application structure
#[derive(Parser, Debug)]
#[command(
    name = "wirepool",
    version,
    about = "Probe WebSocket endpoints through a wirepool connection pool and inspect its configuration."
)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run concurrent acquire/send/release loops against an endpoint
    Probe(ProbeArgs),
    /// Print the effective pool configuration as JSON
    Config(ConfigArgs),
}

/// Arguments for `probe`
#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// WebSocket endpoint (ws:// or wss://)
    #[arg(long)]
    pub url: String,
    /// Concurrent clients
    #[arg(long, default_value_t = 4)]
    pub clients: usize,
    /// Messages sent by each client
    #[arg(long, default_value_t = 10)]
    pub messages: usize,
    /// Priority of every acquire (low, normal, high)
    #[arg(long, default_value = "normal")]
    pub priority: Priority,
    /// Pool configuration file (TOML, JSON or YAML)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Emit a JSON report instead of text
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `config`
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Pool configuration file (TOML, JSON or YAML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Outcome of one probe run
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    /// Endpoint probed
    pub url: String,
    /// Concurrent clients
    pub clients: usize,
    /// Messages delivered to the socket
    pub delivered: usize,
    /// Acquires or sends that failed
    pub failures: usize,
    /// Wall-clock duration of the run
    pub elapsed_ms: u64,
    /// Pool metrics after the run, before shutdown
    pub metrics: PoolMetrics,
    /// Pool status after the run, before shutdown
    pub status: PoolStatus,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ClientTally {
    delivered: usize,
    failures: usize,
}

/// Run the CLI application
pub fn run_cli() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let outcome = Runtime::new()
        .context("failed to start the tokio runtime")
        .and_then(|rt| rt.block_on(execute(cli.command)));
    if let Err(e) = outcome {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A second initialisation (tests, embedding) keeps the first subscriber
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Dispatch a parsed subcommand
pub async fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Probe(args) => cmd_probe(args).await,
        Commands::Config(args) => cmd_config(&args),
    }
}

/// Load the pool configuration from an optional file plus the environment
pub fn load_config(path: Option<&PathBuf>) -> Result<PoolConfig> {
    PoolConfig::load(path.map(PathBuf::as_path)).context("invalid pool configuration")
}

pub fn cmd_config(args: &ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub async fn cmd_probe(args: ProbeArgs) -> Result<()> {
    if args.clients == 0 {
        return Err(anyhow!("--clients must be at least 1"));
    }
    let config = load_config(args.config.as_ref())?;
    let pool = ConnectionPool::with_websocket(config).context("failed to start the pool")?;

    info!(
        url = %args.url,
        clients = args.clients,
        messages = args.messages,
        priority = %args.priority,
        "Starting probe"
    );
    let (messages, priority) = (args.messages, args.priority);
    let started = Instant::now();
    let tallies = futures::future::join_all((0..args.clients).map(|client| {
        let pool = pool.clone();
        let url = args.url.clone();
        async move { run_client(&pool, &url, client, messages, priority).await }
    }))
    .await;

    let report = ProbeReport {
        url: args.url.clone(),
        clients: args.clients,
        delivered: tallies.iter().map(|t| t.delivered).sum(),
        failures: tallies.iter().map(|t| t.failures).sum(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        metrics: pool.metrics(),
        status: pool.status(),
    };
    pool.destroy().await;

    output(&report, args.json)
}

async fn run_client(
    pool: &ConnectionPool,
    url: &str,
    client: usize,
    messages: usize,
    priority: Priority,
) -> ClientTally {
    let mut tally = ClientTally::default();
    for seq in 0..messages {
        let handle = match pool.acquire(url, priority).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(client, seq, error = %e, timeout = e.is_timeout(), "Acquire failed");
                tally.failures += 1;
                if !e.is_retryable() {
                    break;
                }
                continue;
            }
        };

        let body = json!({ "client": client, "seq": seq }).to_string();
        match pool.send(handle.connection_id(), body).await {
            Ok(receipt) => {
                debug!(
                    client,
                    seq,
                    connection_id = %receipt.connection_id,
                    latency_ms = receipt.latency.as_secs_f64() * 1000.0,
                    "Message sent"
                );
                tally.delivered += 1;
            }
            Err(e) => {
                warn!(client, seq, error = %e, timeout = e.is_timeout(), "Send failed");
                tally.failures += 1;
                if !e.is_retryable() {
                    pool.release(handle.connection_id(), handle.subscriber_id());
                    break;
                }
                // Give a reconnect a chance before the next attempt
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        pool.release(handle.connection_id(), handle.subscriber_id());
    }
    tally
}

/// Print a probe report as JSON or as Prometheus text plus a host table
pub fn output(report: &ProbeReport, json: bool) -> Result<()> {
    if json {
        let metrics = JsonExporter
            .export(&report.metrics)
            .map_err(|e| anyhow!("failed to export metrics: {e}"))?;
        let value = json!({
            "url": report.url,
            "clients": report.clients,
            "delivered": report.delivered,
            "failures": report.failures,
            "elapsed_ms": report.elapsed_ms,
            "metrics": serde_json::from_str::<serde_json::Value>(&metrics)?,
            "status": {
                "hosts": report.status.hosts,
                "total_connections": report.status.total_connections,
                "queue_depth": report.status.queue_depth,
            },
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "probed {} with {} clients: {} delivered, {} failed in {} ms",
        report.url, report.clients, report.delivered, report.failures, report.elapsed_ms
    );
    println!();
    for (host, count) in &report.status.hosts {
        println!("{host:<40} {count} connection(s)");
    }
    println!();
    let text = PrometheusExporter
        .export(&report.metrics)
        .map_err(|e| anyhow!("failed to export metrics: {e}"))?;
    print!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_stops_on_permanent_error() {
        let pool = ConnectionPool::with_websocket(PoolConfig::default()).unwrap();
        pool.destroy().await;

        let tally = run_client(&pool, "ws://127.0.0.1:9/echo", 0, 5, Priority::Normal).await;
        assert_eq!(
            tally,
            ClientTally {
                delivered: 0,
                failures: 1
            }
        );
    }

    #[tokio::test]
    async fn test_client_stops_on_invalid_url() {
        let pool = ConnectionPool::with_websocket(PoolConfig::default()).unwrap();

        let tally = run_client(&pool, "not a url", 0, 3, Priority::Normal).await;
        assert_eq!(tally.failures, 1);
        pool.destroy().await;
    }
}
