//! Error types for the full-text pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the full-text pipeline
///
/// Variants are split into two groups by [`PipelineError::is_recoverable`]:
/// per-task failures that are routed to the error queue, and failures that
/// stop the worker that hit them.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Extraction failed for '{path}': {reason}")]
    Extraction { path: String, reason: String },

    #[error("Unsupported source format: '{0}'")]
    UnsupportedFormat(String),

    #[error("Unsupported provider template: '{0}'")]
    UnsupportedProvider(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Classification error for {bibcode}: {reason}")]
    Classification { bibcode: String, reason: String },

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Build an extraction error for a source path
    pub fn extraction(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PipelineError::Extraction {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure is local to one task.
    ///
    /// Recoverable errors are published to the error queue and the task is
    /// acknowledged. Everything else stops the worker and leaves the task
    /// unacknowledged so the broker redelivers it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedPayload(_)
                | PipelineError::Extraction { .. }
                | PipelineError::UnsupportedFormat(_)
                | PipelineError::UnsupportedProvider(_)
        )
    }

    /// Stable name of the error kind, used in error-queue records
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedPayload(_) => "MalformedPayloadError",
            PipelineError::Extraction { .. } => "ExtractionError",
            PipelineError::UnsupportedFormat(_) => "ExtractionError",
            PipelineError::UnsupportedProvider(_) => "ExtractionError",
            PipelineError::Connection(_) => "ConnectionError",
            PipelineError::Classification { .. } => "ClassificationError",
            PipelineError::Topology(_) => "TopologyError",
            PipelineError::Broker(_) => "BrokerError",
            PipelineError::Io(_) => "IoError",
            PipelineError::Serialization(_) => "SerializationError",
            PipelineError::Config(_) => "ConfigError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(PipelineError::MalformedPayload("missing bibcode".into()).is_recoverable());
        assert!(PipelineError::extraction("a.xml", "bad markup").is_recoverable());
        assert!(PipelineError::UnsupportedFormat("a.doc".into()).is_recoverable());
        assert!(PipelineError::UnsupportedProvider("".into()).is_recoverable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(!PipelineError::Connection("refused".into()).is_recoverable());
        assert!(!PipelineError::Topology("no exchange".into()).is_recoverable());
        assert!(!PipelineError::Classification {
            bibcode: "test".into(),
            reason: "corrupt meta.json".into(),
        }
        .is_recoverable());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            PipelineError::MalformedPayload(String::new()).kind(),
            "MalformedPayloadError"
        );
        assert_eq!(
            PipelineError::UnsupportedFormat(String::new()).kind(),
            "ExtractionError"
        );
    }
}
