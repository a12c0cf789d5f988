//! Extract stage: run an extractor, persist the result, publish downstream

use adsft_common::types::{ExtractedPayload, ExtractionMetadata, SourceFormat, TaskPayload};
use adsft_common::{PipelineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::parse_batch;
use crate::classifier::PathNormalizer;
use crate::extract::{ExtractedField, Extractor, ExtractorFamily, ExtractorRegistry};
use crate::store::MetadataStore;
use crate::topology::RESULT_ROUTING_KEY;
use crate::worker::{Emission, RecordFailure, StageHandler, StageOutput};

/// Extraction for one [`ExtractorFamily`]
pub struct ExtractStage {
    family: ExtractorFamily,
    name: String,
    extractor: Arc<dyn Extractor>,
    store: MetadataStore,
    normalizer: PathNormalizer,
}

impl ExtractStage {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        store: MetadataStore,
        normalizer: PathNormalizer,
    ) -> Self {
        let family = extractor.family();
        Self {
            family,
            name: format!("extract.{}", family),
            extractor,
            store,
            normalizer,
        }
    }

    /// Stage for `family` using the extractor registered for it
    pub fn from_registry(
        registry: &ExtractorRegistry,
        family: ExtractorFamily,
        store: MetadataStore,
        normalizer: PathNormalizer,
    ) -> Result<Self> {
        let extractor = registry.get(family).ok_or_else(|| {
            PipelineError::Config(format!("no extractor registered for the {} family", family))
        })?;
        Ok(Self::new(extractor, store, normalizer))
    }

    pub fn family(&self) -> ExtractorFamily {
        self.family
    }

    /// Extract one task and record the extraction.
    ///
    /// The returned payload carries the task's fields unchanged; the stored
    /// metadata replaces whatever was recorded for the bibcode before.
    pub async fn extract_task(&self, task: &TaskPayload) -> Result<ExtractedPayload> {
        task.validate()?;
        let format = SourceFormat::from_path(&task.ft_source)?;
        if ExtractorFamily::for_format(format) != self.family {
            return Err(PipelineError::UnsupportedFormat(format!(
                "{} is not handled by the {} extractor",
                task.ft_source, self.family
            )));
        }

        let source = self.normalizer.resolve(&task.ft_source);
        let fields = self
            .extractor
            .extract(&source, format, &task.provider)
            .await?;

        let metadata = ExtractionMetadata {
            bibcode: task.bibcode.clone(),
            ft_source: task.ft_source.clone(),
            provider: task.provider.clone(),
            extracted_at: Utc::now(),
            format,
        };
        let store = self.store.clone();
        let (meta_path, fields) = tokio::task::spawn_blocking(move || {
            store.save_fields(&metadata.bibcode, &fields)?;
            let meta_path = store.save(&metadata.bibcode, &metadata)?;
            Ok::<_, PipelineError>((meta_path, fields))
        })
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::other(e)))??;

        let full_text = fields
            .get(&ExtractedField::FullText)
            .cloned()
            .unwrap_or_default();

        info!(
            bibcode = %task.bibcode,
            format = %format,
            update = %task.update,
            chars = full_text.len(),
            "Extracted full text"
        );

        Ok(ExtractedPayload::new(
            task,
            full_text,
            meta_path.display().to_string(),
        ))
    }
}

impl std::fmt::Debug for ExtractStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractStage")
            .field("family", &self.family)
            .field("store", &self.store)
            .finish()
    }
}

fn parse_task(raw: &Value) -> Result<TaskPayload> {
    let task: TaskPayload = serde_json::from_value(raw.clone())
        .map_err(|e| PipelineError::MalformedPayload(format!("invalid task payload: {}", e)))?;
    task.validate()?;
    Ok(task)
}

#[async_trait]
impl StageHandler for ExtractStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, body: &[u8]) -> Result<StageOutput> {
        let records = parse_batch(body)?;
        let mut extracted = Vec::with_capacity(records.len());
        let mut failures = Vec::new();

        for raw in records {
            let result = match parse_task(&raw) {
                Ok(task) => self.extract_task(&task).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(payload) => extracted.push(payload),
                Err(e) if e.is_recoverable() => {
                    warn!(stage = %self.name, error = %e, "Extraction failed");
                    failures.push(RecordFailure {
                        error: e,
                        payload: raw,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let mut output = StageOutput::new();
        if !extracted.is_empty() {
            output.emit(Emission::json(RESULT_ROUTING_KEY, &extracted)?);
        }
        output.failures = failures;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsft_common::types::{InputRecord, UpdateClassification};

    fn task(ft_source: &str) -> TaskPayload {
        TaskPayload::new(
            &InputRecord::new("test", ft_source, "MNRAS"),
            UpdateClassification::NotExtractedBefore,
        )
    }

    fn standard_stage(dir: &std::path::Path) -> ExtractStage {
        ExtractStage::from_registry(
            &ExtractorRegistry::with_defaults(),
            ExtractorFamily::Standard,
            MetadataStore::new(dir.join("live")),
            PathNormalizer::new(dir),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_extract_task_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.txt"), "Some  full\ntext").unwrap();
        let stage = standard_stage(dir.path());

        let payload = stage.extract_task(&task("test.txt")).await.unwrap();

        assert_eq!(payload.full_text, "Some full text");
        assert_eq!(payload.task, task("test.txt"));
        assert_eq!(
            payload.meta_path,
            dir.path().join("live/te/st/meta.json").display().to_string()
        );

        let stored = MetadataStore::new(dir.path().join("live")).load("test").unwrap();
        assert_eq!(stored.ft_source, "test.txt");
        assert_eq!(stored.format, SourceFormat::Text);
    }

    #[tokio::test]
    async fn test_wrong_family_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let stage = standard_stage(dir.path());

        let err = stage.extract_task(&task("test.pdf")).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn test_failed_records_do_not_block_batch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "text").unwrap();
        let stage = standard_stage(dir.path());

        let body = serde_json::to_vec(&vec![task("missing.txt"), task("ok.txt")]).unwrap();
        let output = stage.process(&body).await.unwrap();

        assert_eq!(output.emissions.len(), 1);
        assert_eq!(output.emissions[0].routing_key, "result");
        let results: Vec<ExtractedPayload> =
            serde_json::from_slice(&output.emissions[0].body).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task.ft_source, "ok.txt");

        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].payload["ft_source"], "missing.txt");
    }

    #[tokio::test]
    async fn test_blank_bibcode_goes_to_error_queue() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "text").unwrap();
        let stage = standard_stage(dir.path());

        let body = br#"[
            {"bibcode":"","ft_source":"ok.txt","provider":"MNRAS","UPDATE":"NOT_EXTRACTED_BEFORE"},
            {"bibcode":"  ","ft_source":"ok.txt","provider":"MNRAS","UPDATE":"STALE_CONTENT"},
            {"bibcode":"test","ft_source":" ","provider":"MNRAS","UPDATE":"STALE_CONTENT"}
        ]"#;
        let output = stage.process(body).await.unwrap();

        assert!(output.emissions.is_empty());
        assert_eq!(output.failures.len(), 3);
        assert!(output
            .failures
            .iter()
            .all(|f| matches!(f.error, PipelineError::MalformedPayload(_))));
        assert!(!dir.path().join("live/meta.json").exists());
        assert!(!dir.path().join("live/full_text.txt").exists());
    }

    #[test]
    fn test_missing_extractor_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExtractStage::from_registry(
            &ExtractorRegistry::new(),
            ExtractorFamily::Pdf,
            MetadataStore::new(dir.path()),
            PathNormalizer::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
