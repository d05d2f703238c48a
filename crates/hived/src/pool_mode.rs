//! Pool mode — one task manager for one pool kind.
//!
//! In this mode, the daemon:
//! 1. Validates the task specification and loads hive.toml
//! 2. Launches the initial workers
//! 3. Runs the scaling control loop (unless disabled) and the resource reporter
//! 4. On SIGINT/SIGTERM, drains every worker and exits

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use hive_broker::{AmqpConnector, redact_url};
use hive_core::PoolKind;
use hive_probe::{ResourceReporter, SystemProbe};
use hive_scheduler::{ProcessLauncher, TaskManager};

use crate::{PoolArgs, load_config, validate_spec_file};

/// Run a pool manager for `kind` until SIGINT/SIGTERM.
pub async fn run_pool(kind: PoolKind, args: PoolArgs) -> anyhow::Result<()> {
    validate_spec_file(&args.spec_path)?;
    let settings = load_config(args.config.as_deref())?.settings()?;
    let pool = settings.pool(kind).clone();
    info!(
        pool = %kind,
        broker = %redact_url(&settings.broker_url),
        min = pool.thresholds.min,
        max = pool.thresholds.max,
        queue_threshold = pool.thresholds.queue_threshold,
        "Hive pool manager starting"
    );

    // ── Task manager ───────────────────────────────────────────
    let connector = Arc::new(AmqpConnector::new(
        settings.broker_url.clone(),
        settings.connect_timeout,
    ));
    let launcher = ProcessLauncher::current_exe(settings.broker_url.clone())?
        .with_config_path(args.config.clone())
        .with_spec_path(Some(args.spec_path.clone()));
    let mut manager = TaskManager::new(
        kind,
        &settings,
        connector,
        Box::new(SystemProbe::new()?),
        Box::new(launcher),
    );
    if let Some(secs) = args.check_interval {
        manager = manager.with_interval(Duration::from_secs(secs));
    }

    let initial = args.initial.unwrap_or(pool.initial);
    let started = manager.launch(initial).await;
    if started < initial as usize {
        warn!(pool = %kind, requested = initial, started, "not every initial worker started");
    }

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────
    let reporter_handle = match settings.reporter {
        Some(interval) => {
            let reporter = ResourceReporter::new(Box::new(SystemProbe::new()?), interval);
            Some(tokio::spawn(reporter.run(shutdown_rx.clone())))
        }
        None => None,
    };

    let dynamic = !args.no_dynamic_scaling;
    let mut control_shutdown = shutdown_rx.clone();
    let control_handle = tokio::spawn(async move {
        if dynamic {
            manager.run_control_loop(control_shutdown).await;
        } else {
            info!(pool = %kind, "dynamic scaling disabled");
            let _ = control_shutdown.changed().await;
        }
        manager
    });

    hive_worker::os_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let mut manager = control_handle.await?;
    manager.shutdown_all(pool.join_timeout).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    info!(pool = %kind, "Hive pool manager stopped");
    Ok(())
}
