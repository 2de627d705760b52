//! Prometheus exporter for NVIDIA GPUs.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use nvidia_gpu_exporter::config::LogFormat;
use nvidia_gpu_exporter::{
    ExporterConfig, GpuCollector, HttpServer, NvmlSource, TelemetrySource, mock,
};

/// Prometheus exporter for NVIDIA GPUs.
#[derive(Parser, Debug)]
#[command(name = "nvidia-gpu-exporter")]
#[command(about = "Export NVIDIA GPU telemetry as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Path under which to expose metrics (overrides config).
    #[arg(long)]
    path: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides config).
    #[arg(long)]
    log_level: Option<String>,

    /// Serve two simulated GPUs instead of reading NVML.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };

    if let Some(listen) = args.listen {
        config.web.listen = listen;
    }
    if let Some(path) = args.path {
        config.web.path = path;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    // Initialize logging
    let log_level = config.logging.level.parse().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("nvidia_gpu_exporter={}", log_level).parse()?);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    info!("Starting NVIDIA GPU Exporter");

    let source: Box<dyn TelemetrySource> = if args.demo {
        warn!("Demo mode: serving simulated GPUs");
        Box::new(mock::demo_source())
    } else {
        match NvmlSource::init() {
            Ok(source) => Box::new(source),
            Err(e) => {
                error!(
                    error = %e,
                    "Couldn't initialize NVML. Make sure NVML is in the shared library search path."
                );
                return Err(e.into());
            }
        }
    };

    match source.driver_version() {
        Ok(version) => info!(version = %version, "System driver"),
        Err(e) => error!(error = %e, "Unable to get system driver version"),
    }

    let collector = Arc::new(
        GpuCollector::new(source).with_lock_timeout(config.collector.lock_timeout()),
    );

    let listen_addr = config.web.listen_addr()?;
    let basic_auth = config.web.basic_auth()?;
    if basic_auth.is_some() {
        info!(users = config.web.basic_auth_users.len(), "Basic authentication enabled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = HttpServer::new(
        collector.clone(),
        listen_addr,
        config.web.path.clone(),
        config.collector.namespace.clone(),
    )
    .with_tls(config.web.tls.clone())
    .with_basic_auth(basic_auth);
    let mut http_task = tokio::spawn(async move { http_server.run(shutdown_rx).await });

    // Wait for shutdown signal, or for the server to fail
    tokio::select! {
        result = &mut http_task => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(_) => std::future::pending::<()>().await,
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown_tx.send(true)?;

    match tokio::time::timeout(Duration::from_secs(5), http_task).await {
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
        Err(_) => warn!("HTTP server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    let stats = collector.stats();
    info!(
        cycles = stats.cycles,
        device_count_failures = stats.device_count_failures,
        devices_skipped = stats.devices_skipped,
        field_errors = stats.field_errors,
        "Final statistics"
    );

    match Arc::try_unwrap(collector) {
        Ok(collector) => {
            if let Err(e) = collector.into_source().shutdown() {
                error!(error = %e, "Unable to shutdown NVML");
            }
        }
        Err(_) => warn!("Collector still in use, leaving NVML shutdown to process exit"),
    }

    info!("Exporter stopped");
    Ok(())
}
