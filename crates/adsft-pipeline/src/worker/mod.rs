//! Generic consume-process-produce worker
//!
//! A [`Worker`] owns one broker channel and one input queue. For every task
//! it asks its [`StageHandler`] for the outputs first, publishes all of
//! them, and only then acknowledges the task, so a crash at any point leads
//! to redelivery rather than loss.
//!
//! Handler failures are split by [`PipelineError::is_recoverable`]:
//!
//! - recoverable: an [`ErrorRecord`] goes to the error queue and the task is
//!   acknowledged
//! - fatal: the task stays unacknowledged, the channel is closed (so the
//!   broker requeues it) and [`Worker::run`] returns the error

mod retry;

pub use retry::RetryConfig;

use adsft_common::types::ErrorRecord;
use adsft_common::{PipelineError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Channel, Connector, Delivery};
use crate::topology::{ERROR_ROUTING_KEY, EXCHANGE};

/// One message a handler wants published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl Emission {
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
        }
    }

    /// Serialize `value` as the message body
    pub fn json<T: Serialize + ?Sized>(routing_key: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(routing_key, serde_json::to_vec(value)?))
    }
}

/// A single record of a batch that could not be processed
#[derive(Debug)]
pub struct RecordFailure {
    pub error: PipelineError,
    /// The record as it arrived
    pub payload: serde_json::Value,
}

/// Everything a handler produced for one task
#[derive(Debug, Default)]
pub struct StageOutput {
    pub emissions: Vec<Emission>,
    /// Per-record failures, each published to the error queue
    pub failures: Vec<RecordFailure>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, emission: Emission) {
        self.emissions.push(emission);
    }

    pub fn fail(&mut self, error: PipelineError, payload: serde_json::Value) {
        self.failures.push(RecordFailure { error, payload });
    }
}

/// Stage-specific processing of one task body.
///
/// Handlers never touch the broker: they return what should be published and
/// the worker publishes it before acknowledging.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name used in logs and error records
    fn name(&self) -> &str;

    async fn process(&self, body: &[u8]) -> Result<StageOutput>;

    /// Called once the task that produced `output` is acknowledged, after
    /// every emission was published. Failures have been drained by then.
    fn committed(&self, _output: &StageOutput) {}
}

/// Lifecycle of a worker, observable through [`Worker::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connected,
    Consuming,
    Processing,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Disconnected => "disconnected",
            WorkerState::Connected => "connected",
            WorkerState::Consuming => "consuming",
            WorkerState::Processing => "processing",
            WorkerState::Stopped => "stopped",
        }
    }
}

/// Worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stage name, recorded in error records
    pub stage: String,
    /// Queue the worker consumes
    pub queue: String,
    /// Exchange outputs and error records are published to
    pub exchange: String,
    pub retry: RetryConfig,
    /// Wait between polls of an empty queue
    pub poll_interval: Duration,
    /// Stop once the queue is empty instead of waiting for more work
    pub exit_when_idle: bool,
}

impl WorkerConfig {
    pub fn new(stage: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            queue: queue.into(),
            exchange: EXCHANGE.to_string(),
            retry: RetryConfig::default(),
            poll_interval: Duration::from_millis(100),
            exit_when_idle: false,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_exit_when_idle(mut self, exit_when_idle: bool) -> Self {
        self.exit_when_idle = exit_when_idle;
        self
    }
}

/// Counters for one [`Worker::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Tasks acknowledged
    pub processed: u64,
    /// Output messages published
    pub published: u64,
    /// Error records published
    pub errored: u64,
    /// Tasks that arrived flagged as redelivered
    pub redelivered: u64,
    pub reconnects: u64,
}

impl WorkerReport {
    /// Fold another worker's counters into this one
    pub fn merge(&mut self, other: &WorkerReport) {
        self.processed += other.processed;
        self.published += other.published;
        self.errored += other.errored;
        self.redelivered += other.redelivered;
        self.reconnects += other.reconnects;
    }
}

/// Consumes one queue with one stage handler
pub struct Worker<C: Connector, H: StageHandler> {
    worker_id: Uuid,
    hostname: String,
    config: WorkerConfig,
    connector: C,
    handler: Arc<H>,
    state: watch::Sender<WorkerState>,
}

impl<C: Connector, H: StageHandler> Worker<C, H> {
    pub fn new(config: WorkerConfig, connector: C, handler: Arc<H>) -> Self {
        let (state, _) = watch::channel(WorkerState::Disconnected);
        Self {
            worker_id: Uuid::new_v4(),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            config,
            connector,
            handler,
            state,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// `hostname/worker-id`, as recorded in error records
    pub fn label(&self) -> String {
        format!("{}/{}", self.hostname, self.worker_id)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                worker_id = %self.worker_id,
                from = previous.as_str(),
                to = state.as_str(),
                "Worker state changed"
            );
        }
    }

    /// Consume until shutdown, an idle queue (with `exit_when_idle`) or a
    /// fatal error.
    ///
    /// A lost connection is re-established and consumption resumes; failing
    /// to connect within the retry budget is fatal. The channel is closed on
    /// every exit path.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerReport> {
        info!(
            worker_id = %self.worker_id,
            stage = %self.config.stage,
            queue = %self.config.queue,
            handler = self.handler.name(),
            broker = %self.connector.describe(),
            "Starting worker"
        );

        let mut report = WorkerReport::default();
        let mut connected_before = false;

        let outcome = loop {
            let channel = match self.connect(&shutdown).await {
                Ok(Some(channel)) => channel,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if connected_before {
                report.reconnects += 1;
            }
            connected_before = true;

            let consumed = self.consume(&channel, &shutdown, &mut report).await;
            self.release(&channel).await;

            match consumed {
                Err(PipelineError::Connection(reason)) => {
                    warn!(
                        worker_id = %self.worker_id,
                        reason = %reason,
                        "Lost broker connection, reconnecting"
                    );
                    self.set_state(WorkerState::Disconnected);
                }
                other => break other,
            }
        };

        self.set_state(WorkerState::Stopped);

        match outcome {
            Ok(()) => {
                info!(
                    worker_id = %self.worker_id,
                    stage = %self.config.stage,
                    processed = report.processed,
                    published = report.published,
                    errored = report.errored,
                    "Worker stopped"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    stage = %self.config.stage,
                    error = %e,
                    "Worker stopped on fatal error"
                );
                Err(e)
            }
        }
    }

    /// Open a channel, backing off between failed attempts.
    ///
    /// Returns `None` when shutdown is requested while waiting.
    async fn connect(&self, shutdown: &CancellationToken) -> Result<Option<C::Channel>> {
        let max_attempts = self.config.retry.max_attempts;

        for attempt in 0..max_attempts {
            match self.connector.connect().await {
                Ok(channel) => {
                    self.set_state(WorkerState::Connected);
                    debug!(worker_id = %self.worker_id, attempt = attempt + 1, "Connected to broker");
                    return Ok(Some(channel));
                }
                Err(e) => {
                    warn!(
                        worker_id = %self.worker_id,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    if attempt + 1 < max_attempts {
                        let backoff = self.config.retry.backoff_duration(attempt);
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(None),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        }

        Err(PipelineError::Connection(format!(
            "could not connect to {} after {} attempts",
            self.connector.describe(),
            max_attempts
        )))
    }

    async fn consume(
        &self,
        channel: &C::Channel,
        shutdown: &CancellationToken,
        report: &mut WorkerReport,
    ) -> Result<()> {
        self.set_state(WorkerState::Consuming);

        loop {
            if shutdown.is_cancelled() {
                info!(worker_id = %self.worker_id, "Shutdown requested, draining stopped");
                return Ok(());
            }

            let Some(delivery) = channel.get(&self.config.queue).await? else {
                if self.config.exit_when_idle {
                    debug!(worker_id = %self.worker_id, queue = %self.config.queue, "Queue drained");
                    return Ok(());
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            self.set_state(WorkerState::Processing);
            self.handle(channel, delivery, report).await?;
            self.set_state(WorkerState::Consuming);
        }
    }

    /// Process one delivery through to its acknowledgement
    async fn handle(
        &self,
        channel: &C::Channel,
        delivery: Delivery,
        report: &mut WorkerReport,
    ) -> Result<()> {
        if delivery.redelivered {
            report.redelivered += 1;
            debug!(delivery_tag = delivery.delivery_tag, "Processing redelivered task");
        }

        let committed = match self.handler.process(&delivery.body).await {
            Ok(mut output) => {
                for emission in &output.emissions {
                    channel
                        .publish(&self.config.exchange, &emission.routing_key, &emission.body)
                        .await?;
                    report.published += 1;
                }
                for failure in std::mem::take(&mut output.failures) {
                    warn!(
                        stage = %self.config.stage,
                        error = %failure.error,
                        "Record failed, routing to error queue"
                    );
                    self.publish_error(channel, &failure.error, failure.payload)
                        .await?;
                    report.errored += 1;
                }
                Some(output)
            }
            Err(e) if e.is_recoverable() => {
                warn!(
                    stage = %self.config.stage,
                    kind = e.kind(),
                    error = %e,
                    "Task failed, routing to error queue"
                );
                self.publish_error(channel, &e, ErrorRecord::payload_from_bytes(&delivery.body))
                    .await?;
                report.errored += 1;
                None
            }
            Err(e) => return Err(e),
        };

        channel.ack(delivery.delivery_tag).await?;
        report.processed += 1;

        if let Some(output) = committed {
            self.handler.committed(&output);
        }
        Ok(())
    }

    async fn publish_error(
        &self,
        channel: &C::Channel,
        error: &PipelineError,
        payload: serde_json::Value,
    ) -> Result<()> {
        let record = ErrorRecord::new(&self.config.stage, error, payload, self.label());
        let body = serde_json::to_vec(&record)?;
        channel
            .publish(&self.config.exchange, ERROR_ROUTING_KEY, &body)
            .await?;
        Ok(())
    }

    async fn release(&self, channel: &C::Channel) {
        if let Err(e) = channel.close().await {
            warn!(worker_id = %self.worker_id, error = %e, "Failed to close broker channel");
        }
    }
}
