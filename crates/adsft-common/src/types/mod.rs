//! Common types used across the full-text pipeline
//!
//! These are the typed forms of everything that crosses a process or queue
//! boundary. Field order in the serialized structs is part of the wire
//! contract: consumers compare payloads byte-for-byte, so fields must not be
//! reordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PipelineError, Result};

/// One line of an input link list.
///
/// On the wire the source path is called `ft_source`, matching the rest of
/// the pipeline payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub bibcode: String,
    #[serde(rename = "ft_source")]
    pub full_text_path: String,
    pub provider: String,
}

impl InputRecord {
    pub fn new(
        bibcode: impl Into<String>,
        full_text_path: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            bibcode: bibcode.into(),
            full_text_path: full_text_path.into(),
            provider: provider.into(),
        }
    }

    /// Reject records that deserialized but carry no usable key
    pub fn validate(&self) -> Result<()> {
        if self.bibcode.trim().is_empty() {
            return Err(PipelineError::MalformedPayload(
                "record has an empty bibcode".to_string(),
            ));
        }
        if self.full_text_path.trim().is_empty() {
            return Err(PipelineError::MalformedPayload(format!(
                "record {} has an empty ft_source",
                self.bibcode
            )));
        }
        Ok(())
    }
}

/// Why a record needs its full text (re)extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateClassification {
    /// No extraction metadata exists for the bibcode
    NotExtractedBefore,
    /// Metadata exists but has no `ft_source`
    MissingFullText,
    /// Metadata points at a different source document
    DifferingFullText,
    /// Same source document, modified after the last extraction
    StaleContent,
}

impl UpdateClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateClassification::NotExtractedBefore => "NOT_EXTRACTED_BEFORE",
            UpdateClassification::MissingFullText => "MISSING_FULL_TEXT",
            UpdateClassification::DifferingFullText => "DIFFERING_FULL_TEXT",
            UpdateClassification::StaleContent => "STALE_CONTENT",
        }
    }
}

impl std::fmt::Display for UpdateClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source document format, inferred from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Xml,
    Html,
    Text,
    Ocr,
    Pdf,
}

impl SourceFormat {
    /// Infer the format from a path's extension (case-insensitive)
    pub fn from_path(path: &str) -> Result<Self> {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| PipelineError::UnsupportedFormat(path.to_string()))?;

        match extension.as_str() {
            "xml" => Ok(SourceFormat::Xml),
            "html" | "htm" => Ok(SourceFormat::Html),
            "txt" => Ok(SourceFormat::Text),
            "ocr" => Ok(SourceFormat::Ocr),
            "pdf" => Ok(SourceFormat::Pdf),
            _ => Err(PipelineError::UnsupportedFormat(path.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Xml => "xml",
            SourceFormat::Html => "html",
            SourceFormat::Text => "txt",
            SourceFormat::Ocr => "ocr",
            SourceFormat::Pdf => "pdf",
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of the last successful extraction for a bibcode.
///
/// `ft_source` and `provider` default to empty so that records written by
/// older tooling still load; an empty `ft_source` classifies as
/// `MISSING_FULL_TEXT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub bibcode: String,
    #[serde(default)]
    pub ft_source: String,
    #[serde(default)]
    pub provider: String,
    pub extracted_at: DateTime<Utc>,
    pub format: SourceFormat,
}

/// Check-stage output, the unit routed to the extractors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub bibcode: String,
    pub ft_source: String,
    pub provider: String,
    #[serde(rename = "UPDATE")]
    pub update: UpdateClassification,
}

impl TaskPayload {
    pub fn new(record: &InputRecord, update: UpdateClassification) -> Self {
        Self {
            bibcode: record.bibcode.clone(),
            ft_source: record.full_text_path.clone(),
            provider: record.provider.clone(),
            update,
        }
    }

    /// Reject tasks whose key fields are blank
    pub fn validate(&self) -> Result<()> {
        if self.bibcode.trim().is_empty() {
            return Err(PipelineError::MalformedPayload(
                "task has an empty bibcode".to_string(),
            ));
        }
        if self.ft_source.trim().is_empty() {
            return Err(PipelineError::MalformedPayload(format!(
                "task {} has an empty ft_source",
                self.bibcode
            )));
        }
        Ok(())
    }
}

/// Extract-stage output.
///
/// Carries the routing fields of the task it was built from unchanged, in
/// their original order, followed by the extracted fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPayload {
    #[serde(flatten)]
    pub task: TaskPayload,
    pub full_text: String,
    pub meta_path: String,
}

impl ExtractedPayload {
    pub fn new(
        task: &TaskPayload,
        full_text: impl Into<String>,
        meta_path: impl Into<String>,
    ) -> Self {
        Self {
            task: task.clone(),
            full_text: full_text.into(),
            meta_path: meta_path.into(),
        }
    }
}

/// Diagnostic record published to the error queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stage that failed to process the task
    pub stage: String,
    /// Error kind, see [`PipelineError::kind`]
    pub kind: String,
    pub error: String,
    /// Original payload; the raw body as a string when it was not JSON
    pub payload: serde_json::Value,
    /// Worker that observed the failure (`hostname/worker-id`)
    pub worker: String,
    pub failed_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        stage: impl Into<String>,
        error: &PipelineError,
        payload: serde_json::Value,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            kind: error.kind().to_string(),
            error: error.to_string(),
            payload,
            worker: worker.into(),
            failed_at: Utc::now(),
        }
    }

    /// Preserve a raw message body as the record payload
    pub fn payload_from_bytes(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
    }
}
