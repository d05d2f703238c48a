//! Task handlers: what a worker does with each message.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use hive_broker::BrokerSession;
use hive_core::{HandlerSettings, PoolKind};

use crate::device::DeviceArg;
use crate::error::{WorkerError, WorkerResult};

/// Broker endpoints a handler works against.
pub struct WorkerQueues {
    pub session: Arc<dyn BrokerSession>,
    pub input: &'static str,
    pub output: &'static str,
    /// Flips to `true` when the worker starts draining. Handlers finish
    /// the message in hand and return.
    pub stop: watch::Receiver<bool>,
}

impl WorkerQueues {
    /// Next message, or `None` once draining has begun.
    ///
    /// Never interrupts a message already taken; only the wait for a new
    /// one races the stop signal.
    pub async fn next(&mut self) -> WorkerResult<Option<hive_broker::Delivery>> {
        if *self.stop.borrow() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = self.stop.changed() => Ok(None),
            delivery = self.session.next_delivery(self.input) => {
                match delivery? {
                    Some(d) => Ok(Some(d)),
                    None => Err(WorkerError::ConsumerClosed),
                }
            }
        }
    }
}

/// Consumes the input queue and publishes results until told to stop.
#[async_trait]
pub trait TaskHandler: Send {
    async fn consume_and_process(&mut self, queues: WorkerQueues) -> WorkerResult<()>;
}

/// Runs an external command per message: the body goes to stdin, and
/// non-empty stdout is published to the output queue.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    kind: PoolKind,
    device: Option<DeviceArg>,
    spec_path: Option<PathBuf>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>, kind: PoolKind) -> Self {
        Self {
            program: program.into(),
            args,
            kind,
            device: None,
            spec_path: None,
        }
    }

    /// Build from `[handler]` settings. `None` if no command is configured.
    pub fn from_settings(settings: &HandlerSettings, kind: PoolKind) -> Option<Self> {
        settings
            .command
            .as_ref()
            .map(|cmd| Self::new(cmd.clone(), settings.args.clone(), kind))
    }

    pub fn with_device(mut self, device: Option<DeviceArg>) -> Self {
        self.device = device;
        self
    }

    pub fn with_spec_path(mut self, path: Option<PathBuf>) -> Self {
        self.spec_path = path;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("HIVE_POOL", self.kind.label())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(device) = self.device {
            cmd.env("HIVE_DEVICE", device.to_string());
        }
        if let Some(path) = &self.spec_path {
            cmd.env("HIVE_SPEC_PATH", path);
        }
        cmd
    }

    /// Run the command on one message body.
    pub async fn process(&self, body: &[u8]) -> WorkerResult<Vec<u8>> {
        let mut child = self.command().spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(WorkerError::Handler(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn consume_and_process(&mut self, mut queues: WorkerQueues) -> WorkerResult<()> {
        info!(
            pool = %self.kind,
            input = queues.input,
            output = queues.output,
            command = %self.program,
            "consuming"
        );
        while let Some(delivery) = queues.next().await? {
            match self.process(&delivery.body).await {
                Ok(result) if !result.is_empty() => {
                    queues.session.publish(queues.output, &result).await?;
                    debug!(tag = delivery.tag, bytes = result.len(), "result published");
                }
                Ok(_) => debug!(tag = delivery.tag, "no result produced"),
                Err(e) => warn!(tag = delivery.tag, error = %e, "message processing failed"),
            }
            queues.session.ack(delivery.tag).await?;
        }
        debug!("handler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_broker::{BrokerConnector, MemoryBroker};
    use std::time::Duration;

    fn queues(session: Arc<dyn BrokerSession>, stop: watch::Receiver<bool>) -> WorkerQueues {
        WorkerQueues {
            session,
            input: "evaluator_queue",
            output: "database_queue",
            stop,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_output_is_published_and_acked() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        broker.push("evaluator_queue", b"hello".to_vec());

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handler = CommandHandler::new("cat", Vec::new(), PoolKind::Evaluator);
        let task = tokio::spawn(async move {
            handler.consume_and_process(queues(session, stop_rx)).await
        });

        for _ in 0..200 {
            if !broker.messages("database_queue").is_empty() && broker.unacked("evaluator_queue") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(broker.messages("database_queue"), vec![b"hello".to_vec()]);
        assert_eq!(broker.unacked("evaluator_queue"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_acked_without_result() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        broker.push("evaluator_queue", b"x".to_vec());

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handler = CommandHandler::new("false", Vec::new(), PoolKind::Evaluator);
        let task = tokio::spawn(async move {
            handler.consume_and_process(queues(session, stop_rx)).await
        });

        for _ in 0..200 {
            if broker.messages("evaluator_queue").is_empty() && broker.unacked("evaluator_queue") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(broker.messages("database_queue").is_empty());
    }

    #[tokio::test]
    async fn stop_before_start_consumes_nothing() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        broker.push("evaluator_queue", b"keep".to_vec());

        let (_stop_tx, stop_rx) = watch::channel(true);
        let mut handler = CommandHandler::new("cat", Vec::new(), PoolKind::Evaluator);
        handler
            .consume_and_process(queues(session, stop_rx))
            .await
            .unwrap();
        assert_eq!(broker.messages("evaluator_queue"), vec![b"keep".to_vec()]);
    }

    #[test]
    fn from_settings_requires_command() {
        let none = HandlerSettings {
            command: None,
            args: Vec::new(),
        };
        assert!(CommandHandler::from_settings(&none, PoolKind::Sampler).is_none());
        let some = HandlerSettings {
            command: Some("python3".into()),
            args: vec!["sample.py".into()],
        };
        assert!(CommandHandler::from_settings(&some, PoolKind::Sampler).is_some());
    }
}
