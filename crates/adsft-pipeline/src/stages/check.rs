//! Check stage: decide which records need extraction and route them

use adsft_common::types::{InputRecord, SourceFormat, TaskPayload};
use adsft_common::{PipelineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::parse_batch;
use crate::classifier::Classifier;
use crate::extract::ExtractorFamily;
use crate::worker::{Emission, RecordFailure, StageHandler, StageOutput};

/// Result of checking one batch of records
#[derive(Debug, Default)]
pub struct CheckOutcome {
    /// Tasks per routing key, in input order
    pub routes: BTreeMap<String, Vec<TaskPayload>>,
    /// Bibcodes whose extraction is up to date
    pub up_to_date: Vec<String>,
    /// Records that could not be checked
    pub failures: Vec<RecordFailure>,
}

impl CheckOutcome {
    pub fn routed(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }
}

/// Classifies each record and routes it to its extractor family's queue.
///
/// Records that are up to date produce nothing. Tasks are recorded per
/// route once the worker commits them (published and acknowledged), so a
/// redelivered task is counted once. Inspect them with
/// [`CheckStage::results`] and drain them with [`CheckStage::take_results`];
/// long-running consumers that never drain should use
/// [`CheckStage::without_results`].
#[derive(Debug)]
pub struct CheckStage {
    classifier: Classifier,
    retain_results: bool,
    results: Mutex<BTreeMap<String, Vec<TaskPayload>>>,
}

impl CheckStage {
    pub const NAME: &'static str = "check";

    pub fn new(classifier: Classifier) -> Self {
        Self {
            classifier,
            retain_results: true,
            results: Mutex::new(BTreeMap::new()),
        }
    }

    /// Do not keep committed tasks
    pub fn without_results(mut self) -> Self {
        self.retain_results = false;
        self
    }

    /// Check a batch of raw records.
    ///
    /// Malformed records and unsupported formats are collected as failures;
    /// a classification error aborts the whole batch.
    pub fn check_batch(&self, records: Vec<Value>) -> Result<CheckOutcome> {
        check_records(&self.classifier, records)
    }

    /// Tasks committed since the last [`CheckStage::take_results`], per
    /// routing key, in arrival order
    pub fn results(&self) -> BTreeMap<String, Vec<TaskPayload>> {
        self.lock_results().clone()
    }

    /// Committed tasks for one routing key
    pub fn route_results(&self, routing_key: &str) -> Vec<TaskPayload> {
        self.lock_results()
            .get(routing_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Return and clear every committed task
    pub fn take_results(&self) -> BTreeMap<String, Vec<TaskPayload>> {
        std::mem::take(&mut *self.lock_results())
    }

    fn lock_results(&self) -> MutexGuard<'_, BTreeMap<String, Vec<TaskPayload>>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_records(classifier: &Classifier, records: Vec<Value>) -> Result<CheckOutcome> {
    let mut outcome = CheckOutcome::default();

    for raw in records {
        let record = match parse_record(&raw) {
            Ok(record) => record,
            Err(e) => {
                outcome.failures.push(RecordFailure {
                    error: e,
                    payload: raw,
                });
                continue;
            }
        };

        let Some(update) = classifier.check(&record)? else {
            outcome.up_to_date.push(record.bibcode);
            continue;
        };

        let format = match SourceFormat::from_path(&record.full_text_path) {
            Ok(format) => format,
            Err(e) => {
                outcome.failures.push(RecordFailure {
                    error: e,
                    payload: raw,
                });
                continue;
            }
        };

        let routing_key = ExtractorFamily::for_format(format).routing_key();
        debug!(
            bibcode = %record.bibcode,
            update = %update,
            routing_key,
            "Routing record for extraction"
        );

        outcome
            .routes
            .entry(routing_key.to_string())
            .or_default()
            .push(TaskPayload::new(&record, update));
    }

    Ok(outcome)
}

fn parse_record(raw: &Value) -> Result<InputRecord> {
    let record: InputRecord = serde_json::from_value(raw.clone())
        .map_err(|e| PipelineError::MalformedPayload(format!("invalid input record: {}", e)))?;
    record.validate()?;
    Ok(record)
}

#[async_trait]
impl StageHandler for CheckStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn process(&self, body: &[u8]) -> Result<StageOutput> {
        let records = parse_batch(body)?;
        let total = records.len();

        // Classification stats sources and reads metadata from disk
        let classifier = self.classifier.clone();
        let outcome = tokio::task::spawn_blocking(move || check_records(&classifier, records))
            .await
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))??;

        info!(
            records = total,
            routed = outcome.routed(),
            up_to_date = outcome.up_to_date.len(),
            failed = outcome.failures.len(),
            "Checked batch"
        );

        let mut output = StageOutput::new();
        for (routing_key, tasks) in &outcome.routes {
            output.emit(Emission::json(routing_key.as_str(), tasks)?);
        }
        output.failures = outcome.failures;
        Ok(output)
    }

    fn committed(&self, output: &StageOutput) {
        if !self.retain_results {
            return;
        }

        let mut results = self.lock_results();
        for emission in &output.emissions {
            match serde_json::from_slice::<Vec<TaskPayload>>(&emission.body) {
                Ok(tasks) => results
                    .entry(emission.routing_key.clone())
                    .or_default()
                    .extend(tasks),
                Err(e) => warn!(
                    routing_key = %emission.routing_key,
                    error = %e,
                    "Could not record routed tasks"
                ),
            }
        }
    }
}
