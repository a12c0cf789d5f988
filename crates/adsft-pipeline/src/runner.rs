//! Single-process pipeline runs
//!
//! [`PipelineRunner`] declares the topology, publishes a link list to the
//! ingress exchange and drains each stage in dependency order with
//! `workers_per_stage` workers per queue.

use adsft_common::{PipelineError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Channel, Connector};
use crate::classifier::Classifier;
use crate::config::PipelineConfig;
use crate::extract::{ExtractorFamily, ExtractorRegistry};
use crate::input::LinkList;
use crate::stages::{CheckStage, ExtractStage};
use crate::topology::{
    TaskMaster, CHECK_QUEUE, CHECK_ROUTING_KEY, ERROR_QUEUE, PDF_QUEUE, RESULT_QUEUE,
    STANDARD_QUEUE,
};
use crate::worker::{StageHandler, Worker, WorkerReport};

/// Outcome of [`PipelineRunner::run_to_completion`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Records in the link list
    pub records: usize,
    /// Ingress messages published
    pub published: usize,
    /// Tasks routed by the check stage, per routing key
    pub routed: BTreeMap<String, usize>,
    pub check: WorkerReport,
    pub extract: WorkerReport,
    /// Messages waiting on the result queue
    pub results: usize,
    /// Messages waiting on the error queue
    pub errors: usize,
}

/// Runs every stage of the pipeline against one broker
pub struct PipelineRunner<C: Connector + Clone> {
    connector: C,
    config: PipelineConfig,
    registry: ExtractorRegistry,
    task_master: TaskMaster,
}

impl<C: Connector + Clone> PipelineRunner<C> {
    pub fn new(connector: C, config: PipelineConfig) -> Self {
        let task_master = TaskMaster::with_default_routes(&config.exchange);
        Self {
            connector,
            config,
            registry: ExtractorRegistry::with_defaults(),
            task_master,
        }
    }

    /// Use a custom extractor registry
    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn task_master(&self) -> &TaskMaster {
        &self.task_master
    }

    /// Open a short-lived control channel, retrying like a worker would
    async fn open_channel(&self) -> Result<C::Channel> {
        let retry = self.config.retry();
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            match self.connector.connect().await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Control connection failed");
                    last_error = Some(e);
                    if attempt + 1 < retry.max_attempts {
                        tokio::time::sleep(retry.backoff_duration(attempt)).await;
                    }
                }
            }
        }

        Err(PipelineError::Connection(format!(
            "could not connect to {} after {} attempts: {}",
            self.connector.describe(),
            retry.max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Declare exchanges, queues and bindings
    pub async fn initialize(&self) -> Result<()> {
        let channel = self.open_channel().await?;
        let result = self.task_master.initialize(&channel).await;
        channel.close().await?;
        result
    }

    /// Publish the link list to the ingress exchange in batches.
    ///
    /// Returns the number of messages published.
    pub async fn publish(&self, links: &LinkList) -> Result<usize> {
        let channel = self.open_channel().await?;
        let mut published = 0;

        let result = async {
            for body in links.make_payloads(self.config.publish_batch_size)? {
                channel
                    .publish(&self.config.exchange, CHECK_ROUTING_KEY, &body)
                    .await?;
                published += 1;
            }
            Ok::<_, PipelineError>(())
        }
        .await;

        channel.close().await?;
        result?;

        info!(records = links.len(), messages = published, "Published link list");
        Ok(published)
    }

    /// Drain `queue` with `workers_per_stage` workers running `handler`
    pub async fn drain_stage<H: StageHandler>(
        &self,
        handler: Arc<H>,
        queue: &str,
        shutdown: &CancellationToken,
    ) -> Result<WorkerReport> {
        let workers: Vec<Worker<C, H>> = (0..self.config.workers_per_stage)
            .map(|_| {
                let config = self
                    .config
                    .worker_config(handler.name(), queue)
                    .with_exit_when_idle(true);
                Worker::new(config, self.connector.clone(), handler.clone())
            })
            .collect();

        let results =
            futures::future::join_all(workers.iter().map(|w| w.run(shutdown.child_token()))).await;

        let mut report = WorkerReport::default();
        for result in results {
            report.merge(&result?);
        }
        Ok(report)
    }

    /// Run the whole pipeline over a link list and wait until every stage
    /// queue is drained
    pub async fn run_to_completion(
        &self,
        links: &LinkList,
        shutdown: CancellationToken,
    ) -> Result<RunSummary> {
        self.initialize().await?;
        let published = self.publish(links).await?;

        let store = self.config.store();
        let normalizer = self.config.normalizer();

        let check_stage = Arc::new(CheckStage::new(Classifier::new(
            store.clone(),
            normalizer.clone(),
        )));
        let check = self
            .drain_stage(check_stage.clone(), CHECK_QUEUE, &shutdown)
            .await?;

        let mut extract = WorkerReport::default();
        for (family, queue) in [
            (ExtractorFamily::Standard, STANDARD_QUEUE),
            (ExtractorFamily::Pdf, PDF_QUEUE),
        ] {
            let stage = ExtractStage::from_registry(
                &self.registry,
                family,
                store.clone(),
                normalizer.clone(),
            )?;
            let report = self.drain_stage(Arc::new(stage), queue, &shutdown).await?;
            extract.merge(&report);
        }

        let channel = self.open_channel().await?;
        let results = channel.message_count(RESULT_QUEUE).await?;
        let errors = channel.message_count(ERROR_QUEUE).await?;
        channel.close().await?;

        let routed = check_stage
            .take_results()
            .into_iter()
            .map(|(routing_key, tasks)| (routing_key, tasks.len()))
            .collect();

        let summary = RunSummary {
            records: links.len(),
            published,
            routed,
            check,
            extract,
            results,
            errors,
        };

        info!(
            records = summary.records,
            results = summary.results,
            errors = summary.errors,
            "Pipeline run complete"
        );
        Ok(summary)
    }
}
