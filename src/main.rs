// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use gend::config::DaemonConfig;
use gend::credits::CreditLedger;
use gend::poller::{PollerSettings, TaskPoller};
use gend::provider::http::{HttpProvider, HttpProviderConfig};
use gend::retry::RetryConfig;
use gend::storage::Storage;
use gend::stream::StreamBroadcaster;
use gend::ws;
use gend::ws::manager::ConnectionManager;
use gend::AppContext;

#[derive(Debug, Parser)]
#[command(name = "gend", version, about = "Generation task daemon")]
struct Args {
    /// Directory for the database, logs, and config.toml.
    #[arg(long, env = "GEND_DATA_DIR", default_value = ".gend")]
    data_dir: PathBuf,

    /// Port to listen on. Overrides config.toml.
    #[arg(long, env = "GEND_PORT")]
    port: Option<u16>,

    /// Address to bind. Overrides config.toml.
    #[arg(long)]
    bind_address: Option<String>,

    /// Log filter, e.g. `info` or `gend=debug`.
    #[arg(long, env = "GEND_LOG")]
    log_level: Option<String>,

    /// Also write logs to {data_dir}/logs/.
    #[arg(long)]
    log_to_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::load(
        args.data_dir,
        args.port,
        args.bind_address,
        args.log_level,
    )?;

    let _log_guard = setup_logging(&config, args.log_to_file)?;

    std::panic::set_hook(Box::new(|info| {
        error!(panic = %info, "panic");
    }));

    run(config).await
}

/// Install the tracing subscriber. The returned guard must live for the
/// whole process so buffered file output is flushed on exit.
fn setup_logging(
    config: &DaemonConfig,
    log_to_file: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.log_level)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to build log filter")?;

    let stderr_layer = if config.log_format == "json" {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = if log_to_file {
        let log_dir = config.data_dir().join("logs");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(log_dir, "gend.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn run(config: DaemonConfig) -> Result<()> {
    info!(
        data_dir = %config.data_dir().display(),
        port = config.port,
        "starting gend"
    );

    let storage = Arc::new(Storage::new(config.data_dir()).await?);
    let recovered = storage.recover_orphaned_chat_tasks().await?;
    if recovered > 0 {
        warn!(recovered, "failed chat tasks orphaned by a previous run");
    }

    let ledger = Arc::new(CreditLedger::new(storage.pool().clone()));
    let connections = Arc::new(ConnectionManager::new((&config.websocket).into()));

    if config.provider.api_key.is_none() {
        warn!("no provider API key configured; provider calls will be rejected upstream");
    }
    let provider = Arc::new(HttpProvider::new(HttpProviderConfig {
        base_url: config.provider.base_url.clone(),
        api_key: config.provider.api_key.clone().unwrap_or_default(),
        request_timeout: config.provider.request_timeout(),
        retry: RetryConfig::default(),
    })?);

    let broadcaster = Arc::new(StreamBroadcaster::new(
        Arc::clone(&storage),
        Arc::clone(&ledger),
        Arc::clone(&connections),
        config.pricing.clone(),
        (&config.stream).into(),
    ));

    let poller = Arc::new(TaskPoller::new(
        Arc::clone(&storage),
        Arc::clone(&ledger),
        Arc::clone(&connections),
        provider.clone(),
        PollerSettings::from_config(&config.poller, &config.provider),
    ));
    let poller_handle = tokio::spawn(Arc::clone(&poller).run());

    let sweep_interval = config.websocket.sweep_interval();
    let sweep_connections = Arc::clone(&connections);
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let stats = sweep_connections.sweep();
            if stats.dropped_connections > 0 || stats.dropped_buffers > 0 {
                info!(
                    dropped_connections = stats.dropped_connections,
                    dropped_buffers = stats.dropped_buffers,
                    "sweep pass"
                );
            }
        }
    });

    let ctx = Arc::new(AppContext {
        config: Arc::new(config),
        storage,
        ledger,
        provider,
        connections,
        broadcaster,
    });

    let result = ws::run(ctx).await;

    poller_handle.abort();
    sweep_handle.abort();
    info!("gend stopped");
    result
}
