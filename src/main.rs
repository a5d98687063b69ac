//! dbgate - MySQL/MariaDB gateway
//!
//! Entry point: loads `gateway.toml`, applies command-line overrides, starts
//! the heartbeat and the worker pool, and runs until Ctrl+C.

use anyhow::Context as _;
use clap::Parser;
use dbgate::clock::Heartbeat;
use dbgate::config::GatewayConfig;
use dbgate::session::{passthrough_factory, PassthroughSettings};
use dbgate::worker::{PoolHandle, WorkerPool};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often pool counters are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "dbgate", version, about = "MySQL/MariaDB protocol gateway")]
struct Cli {
    /// Path to gateway.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client-facing listen address (overrides server.listen)
    #[arg(short, long)]
    listen: Option<String>,

    /// Backend server address (overrides server.backend)
    #[arg(short, long)]
    backend: Option<String>,

    /// Number of worker threads (overrides core.workers)
    #[arg(short, long)]
    workers: Option<usize>,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => GatewayConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(backend) = &self.backend {
            config.server.backend = backend.clone();
        }
        if let Some(workers) = self.workers {
            config.core.workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},dbgate=debug", config.logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_banner(config: &GatewayConfig) {
    println!(
        r#"
dbgate v{} - MySQL/MariaDB Gateway
──────────────────────────────────────────────────────────────
Listening on {}
Routing to   {}
Workers      {}

Use Ctrl+C to shutdown gracefully.
"#,
        dbgate::VERSION,
        config.server.listen,
        config.server.backend,
        config.core.workers
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    init_logging(&config);
    print_banner(&config);

    // The heartbeat drives every timeout in the workers
    let _heartbeat = Heartbeat::start();

    let settings = PassthroughSettings::from_config(&config)?;
    let mut pool = WorkerPool::start(config.core.clone(), passthrough_factory(settings))?;
    let addr = pool.listen(config.listen_addr()?)?;
    info!(address = %addr, backend = %config.server.backend, "Gateway ready");

    let reporter = tokio::spawn(report_stats(pool.handle()));

    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received, stopping gateway...");

    reporter.abort();
    tokio::task::spawn_blocking(move || pool.shutdown()).await?;

    info!("Gateway shutdown complete");
    Ok(())
}

/// Logs merged worker counters periodically.
async fn report_stats(pool: PoolHandle) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let handle = pool.clone();
        match tokio::task::spawn_blocking(move || handle.stats()).await {
            Ok(Ok(stats)) => info!(%stats, "Worker statistics"),
            Ok(Err(e)) => warn!(error = %e, "Could not collect statistics"),
            Err(e) => warn!(error = %e, "Statistics task failed"),
        }
    }
}
