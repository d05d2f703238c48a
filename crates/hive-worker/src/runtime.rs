//! Worker runtime — drives one worker through its lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use hive_broker::{BrokerConnector, BrokerSession, QueueSpec};
use hive_core::PoolKind;

use crate::error::{WorkerError, WorkerResult};
use crate::handler::{TaskHandler, WorkerQueues};
use crate::state::WorkerState;

/// Everything the shutdown routine needs, in one place.
pub struct ShutdownState {
    pub state: WorkerState,
    pub drain_timeout: Duration,
    session: Option<Arc<dyn BrokerSession>>,
    task: Option<JoinHandle<WorkerResult<()>>>,
    stop: watch::Sender<bool>,
}

impl ShutdownState {
    fn new(drain_timeout: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            state: WorkerState::Init,
            drain_timeout,
            session: None,
            task: None,
            stop,
        }
    }
}

/// Drain the in-flight task, then close channel and connection.
///
/// Requires `Draining`; ends in `Terminated`.
pub async fn drain(shutdown: &mut ShutdownState) -> WorkerResult<()> {
    let _ = shutdown.stop.send(true);

    if let Some(mut task) = shutdown.task.take() {
        match tokio::time::timeout(shutdown.drain_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => info!("in-flight work finished"),
            Ok(Ok(Err(e))) => warn!(error = %e, "handler ended with error while draining"),
            Ok(Err(e)) => warn!(error = %e, "handler task panicked while draining"),
            Err(_) => {
                task.abort();
                let _ = task.await;
                warn!(
                    timeout_secs = shutdown.drain_timeout.as_secs(),
                    error = %WorkerError::Cancelled,
                    "drain timeout reached"
                );
            }
        }
    }

    close_session(shutdown).await;
    shutdown.state.transition(WorkerState::Terminated)
}

async fn close_session(shutdown: &mut ShutdownState) {
    if let Some(session) = shutdown.session.take()
        && let Err(e) = session.close().await
    {
        warn!(error = %e, "closing broker session failed");
    }
}

/// One worker process.
pub struct WorkerRuntime {
    kind: PoolKind,
    connector: Arc<dyn BrokerConnector>,
    shutdown: ShutdownState,
}

impl WorkerRuntime {
    pub fn new(kind: PoolKind, connector: Arc<dyn BrokerConnector>, drain_timeout: Duration) -> Self {
        Self {
            kind,
            connector,
            shutdown: ShutdownState::new(drain_timeout),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shutdown.state
    }

    async fn connect(&mut self) -> WorkerResult<Arc<dyn BrokerSession>> {
        self.shutdown.state.transition(WorkerState::Connecting)?;
        let session = self.connector.connect().await?;
        self.shutdown.session = Some(session.clone());
        session
            .declare_queue(&QueueSpec::standard(self.kind.input_queue()))
            .await?;
        session
            .declare_queue(&QueueSpec::standard(self.kind.output_queue()))
            .await?;
        self.shutdown.state.transition(WorkerState::Active)?;
        info!(
            pool = %self.kind,
            pid = std::process::id(),
            input = self.kind.input_queue(),
            output = self.kind.output_queue(),
            "worker active"
        );
        Ok(session)
    }

    async fn fail(&mut self, err: WorkerError) -> WorkerError {
        error!(pool = %self.kind, state = %self.shutdown.state, error = %err, "worker failed");
        if let Err(e) = self.shutdown.state.transition(WorkerState::Failed) {
            warn!(error = %e, "could not record failure");
        }
        if let Some(task) = self.shutdown.task.take() {
            task.abort();
        }
        close_session(&mut self.shutdown).await;
        err
    }

    /// Run until `shutdown` fires (drain and exit cleanly) or the broker
    /// fails. Returns the final state.
    pub async fn run(
        mut self,
        mut handler: Box<dyn TaskHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> WorkerResult<WorkerState> {
        let session = match self.connect().await {
            Ok(s) => s,
            Err(e) => return Err(self.fail(e).await),
        };

        if !*shutdown.borrow() {
            let queues = WorkerQueues {
                session,
                input: self.kind.input_queue(),
                output: self.kind.output_queue(),
                stop: self.shutdown.stop.subscribe(),
            };
            let mut task =
                tokio::spawn(async move { handler.consume_and_process(queues).await });

            tokio::select! {
                result = &mut task => {
                    let err = match result {
                        Ok(Ok(())) => WorkerError::ConsumerClosed,
                        Ok(Err(e)) => e,
                        Err(e) => WorkerError::Handler(e.to_string()),
                    };
                    return Err(self.fail(err).await);
                }
                _ = shutdown.changed() => {}
            }
            self.shutdown.task = Some(task);
        }

        info!(
            pool = %self.kind,
            drain_timeout_secs = self.shutdown.drain_timeout.as_secs(),
            "shutdown requested, draining"
        );
        self.shutdown.state.transition(WorkerState::Draining)?;
        drain(&mut self.shutdown).await?;
        info!(pool = %self.kind, "worker terminated");
        Ok(self.shutdown.state)
    }
}
