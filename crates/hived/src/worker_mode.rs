//! Worker mode — a single worker process started by a pool manager.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use hive_broker::AmqpConnector;
use hive_core::parse_duration;
use hive_probe::{ResourceProbe, SystemProbe};
use hive_worker::{CommandHandler, DeviceArg, WorkerError, WorkerRuntime, os_signal};

use crate::{WorkerArgs, load_config};

/// Run one worker until its queue closes or it is told to stop.
pub async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let kind = args.kind;
    let drain_timeout = parse_duration(&args.drain_timeout)
        .with_context(|| format!("invalid --drain-timeout {:?}", args.drain_timeout))?;

    let device = match (&args.device, kind.needs_device()) {
        (Some(raw), _) => Some(raw.parse::<DeviceArg>()?),
        (None, true) => return Err(WorkerError::MissingDevice.into()),
        (None, false) => None,
    };

    let cores = SystemProbe::new()?.available_cores();
    let settings = load_config(args.config.as_deref())?.settings()?;
    let handler = CommandHandler::from_settings(&settings.handler, kind)
        .context("no [handler] command configured")?
        .with_device(device)
        .with_spec_path(args.spec_path.clone());

    info!(
        pool = %kind,
        pid = std::process::id(),
        device = device.map(|d| d.to_string()),
        cores,
        drain_timeout_secs = drain_timeout.as_secs(),
        "worker starting"
    );

    let connector = Arc::new(AmqpConnector::new(args.broker_url, settings.connect_timeout));
    let runtime = WorkerRuntime::new(kind, connector, drain_timeout);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        os_signal().await;
        info!("termination requested");
        let _ = shutdown_tx.send(true);
    });

    let state = runtime.run(Box::new(handler), shutdown_rx).await?;
    info!(pool = %kind, %state, "worker exited");
    Ok(())
}
