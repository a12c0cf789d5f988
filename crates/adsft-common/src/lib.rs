//! ADS Full-text Common Library
//!
//! Shared types, logging and error handling for the full-text extraction
//! pipeline.
//!
//! # Overview
//!
//! - **Error Handling**: [`PipelineError`] and the crate-wide [`Result`] alias
//! - **Logging**: `tracing` subscriber setup shared by every pipeline process
//! - **Types**: the typed wire and storage records (input records, task
//!   payloads, extraction metadata, error-queue records)
//!
//! # Example
//!
//! ```no_run
//! use adsft_common::types::{InputRecord, TaskPayload, UpdateClassification};
//!
//! let record = InputRecord::new("2015MNRAS.446.4239E", "/data/test.pdf", "MNRAS");
//! let task = TaskPayload::new(&record, UpdateClassification::NotExtractedBefore);
//! let body = serde_json::to_vec(&task)?;
//! # Ok::<(), serde_json::Error>(())
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{PipelineError, Result};
