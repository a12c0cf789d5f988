//! Staleness classification
//!
//! Decides whether a record's full text must be (re)extracted by comparing
//! the incoming source against the stored [`ExtractionMetadata`]. The
//! decision itself ([`classify`]) is pure; every filesystem read happens
//! first, in [`Classifier::check`], and is captured in a [`SourceSnapshot`].

use adsft_common::types::{ExtractionMetadata, InputRecord, UpdateClassification};
use adsft_common::{PipelineError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::store::MetadataStore;

/// Canonical form used when comparing source paths.
///
/// Trims surrounding whitespace, drops `.` components and empty segments,
/// then strips the fulltext root when the path lies under it. Comparison is
/// case-sensitive and never touches the filesystem.
#[derive(Debug, Clone, Default)]
pub struct PathNormalizer {
    root: PathBuf,
    root_components: Vec<String>,
    root_absolute: bool,
}

impl PathNormalizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let (root_absolute, root_components) = split_components(&root.to_string_lossy());
        Self {
            root,
            root_components,
            root_absolute,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn normalize(&self, path: &str) -> String {
        let (absolute, components) = split_components(path);

        let under_root = !self.root_components.is_empty()
            && absolute == self.root_absolute
            && components.len() > self.root_components.len()
            && components.starts_with(&self.root_components);

        if under_root {
            return components[self.root_components.len()..].join("/");
        }

        let joined = components.join("/");
        if absolute {
            format!("/{}", joined)
        } else {
            joined
        }
    }

    /// Filesystem location of a source path; relative paths live under the root
    pub fn resolve(&self, path: &str) -> PathBuf {
        let trimmed = Path::new(path.trim());
        if trimmed.is_absolute() {
            trimmed.to_path_buf()
        } else {
            self.root.join(trimmed)
        }
    }
}

fn split_components(path: &str) -> (bool, Vec<String>) {
    let path = path.trim();
    let components = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
        .collect();
    (path.starts_with('/'), components)
}

/// What is known about the incoming source before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    /// Normalized source path
    pub path: String,
    /// Last modification time, `None` when the file cannot be read
    pub modified: Option<DateTime<Utc>>,
}

impl SourceSnapshot {
    pub fn new(path: impl Into<String>, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            path: path.into(),
            modified,
        }
    }

    /// Normalize `path` and read its modification time
    pub fn capture(normalizer: &PathNormalizer, path: &str) -> Self {
        let modified = std::fs::metadata(normalizer.resolve(path))
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Self::new(normalizer.normalize(path), modified)
    }
}

/// Classify a source against its stored metadata.
///
/// Rules are evaluated in order and the first match wins:
///
/// 1. no stored metadata: `NOT_EXTRACTED_BEFORE`
/// 2. stored `ft_source` is empty: `MISSING_FULL_TEXT`
/// 3. normalized paths differ: `DIFFERING_FULL_TEXT`
/// 4. source modified strictly after `extracted_at`: `STALE_CONTENT`
///
/// Anything else is up to date and yields `None`. An unknown modification
/// time never counts as stale.
pub fn classify(
    stored: Option<&ExtractionMetadata>,
    source: &SourceSnapshot,
    normalizer: &PathNormalizer,
) -> Option<UpdateClassification> {
    let Some(stored) = stored else {
        return Some(UpdateClassification::NotExtractedBefore);
    };

    if stored.ft_source.trim().is_empty() {
        return Some(UpdateClassification::MissingFullText);
    }

    if normalizer.normalize(&stored.ft_source) != source.path {
        return Some(UpdateClassification::DifferingFullText);
    }

    match source.modified {
        Some(modified) if modified > stored.extracted_at => Some(UpdateClassification::StaleContent),
        _ => None,
    }
}

/// Classifier bound to a metadata store and normalization rule
#[derive(Debug, Clone)]
pub struct Classifier {
    store: MetadataStore,
    normalizer: PathNormalizer,
}

impl Classifier {
    pub fn new(store: MetadataStore, normalizer: PathNormalizer) -> Self {
        Self { store, normalizer }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn normalizer(&self) -> &PathNormalizer {
        &self.normalizer
    }

    /// Load stored metadata and source state for a record, then classify it.
    ///
    /// Unreadable stored metadata is a [`PipelineError::Classification`]: it
    /// means the store is broken, not that the record is bad. Reads the
    /// filesystem synchronously; async callers run it on the blocking pool.
    pub fn check(&self, record: &InputRecord) -> Result<Option<UpdateClassification>> {
        let stored = self
            .store
            .find(&record.bibcode)
            .map_err(|e| PipelineError::Classification {
                bibcode: record.bibcode.clone(),
                reason: format!("unreadable extraction metadata: {}", e),
            })?;

        let source = SourceSnapshot::capture(&self.normalizer, &record.full_text_path);
        let classification = classify(stored.as_ref(), &source, &self.normalizer);

        if classification.is_none() && source.modified.is_none() {
            warn!(
                bibcode = %record.bibcode,
                ft_source = %record.full_text_path,
                "Source file modification time unavailable, treating as up to date"
            );
        }

        debug!(
            bibcode = %record.bibcode,
            classification = classification.map(|c| c.as_str()).unwrap_or("NONE"),
            "Classified record"
        );

        Ok(classification)
    }
}
