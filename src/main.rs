//! pulse-guard daemon.
//!
//! ```text
//!     config.toml ──▶ loader ──▶ GuardServices ──┬──▶ guardrail sweeps (ticker)
//!         ▲                                      ├──▶ admin API (axum)
//!         └── watcher (hot reload) ──────────────┘    metrics exporter
//! ```
//!
//! Runs the guardrail sweep loop and the admin API until SIGINT/SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use pulse_guard::admin::{setup_admin_router, AdminState};
use pulse_guard::config::loader::{load_config, parse_config};
use pulse_guard::config::watcher::ConfigWatcher;
use pulse_guard::lifecycle::signals::shutdown_signal;
use pulse_guard::observability::{init_logging, init_metrics};
use pulse_guard::{GuardServices, PulseGuardConfig, Shutdown};

#[derive(Parser)]
#[command(name = "pulse-guard")]
#[command(about = "Resilience and guardrail daemon for upstream API traffic", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_exists = args.config.exists();
    let config = if config_exists {
        load_config(&args.config)?
    } else {
        parse_config("", |var| std::env::var(var).ok())?
    };

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "pulse-guard starting");
    if !config_exists {
        tracing::warn!(path = ?args.config, "Config file not found, using defaults");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let sweep_interval = Duration::from_secs(config.guardrail.sweep_interval_secs);
    let admin = config.admin.clone();

    let services = Arc::new(GuardServices::build(config)?);
    services.guardrail.restore_from_journal();

    let shutdown = Shutdown::new();
    let sweeps = services.guardrail.spawn_sweeps(sweep_interval, &shutdown);

    // The watcher handle must outlive the reload task.
    let _watcher = if config_exists {
        let (watcher, updates) = ConfigWatcher::new(&args.config);
        match watcher.run() {
            Ok(handle) => {
                tokio::spawn(apply_reloads(services.clone(), updates, shutdown.clone()));
                Some(handle)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start config watcher, hot reload disabled");
                None
            }
        }
    } else {
        None
    };

    let admin_task = if admin.enabled {
        let listener = TcpListener::bind(&admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let router = setup_admin_router(AdminState::new(services.clone(), &admin.api_key));
        let mut stop = shutdown.subscribe();
        Some(tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping");
    shutdown.trigger();

    sweeps.join().await;
    if let Some(task) = admin_task {
        let _ = task.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn apply_reloads(
    services: Arc<GuardServices>,
    mut updates: tokio::sync::mpsc::UnboundedReceiver<PulseGuardConfig>,
    shutdown: Shutdown,
) {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(config) => {
                    services.apply_reload(&config);
                    tracing::info!("Configuration reloaded");
                }
                None => break,
            },
            _ = stop.recv() => break,
        }
    }
}
