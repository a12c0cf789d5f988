//! Persisted extraction metadata
//!
//! Each bibcode owns one leaf directory of a pairtree rooted at the extract
//! path. The bibcode is cleaned of path-hostile characters and split into
//! two-character segments, so `2015MNRAS.446.4239E` lives under
//! `20/15/MN/RA/S,/44/6,/42/39/E/`. The leaf holds `meta.json` plus one
//! `<field>.txt` per extracted field.

use adsft_common::types::ExtractionMetadata;
use adsft_common::{PipelineError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::extract::FieldMap;

pub const META_FILE: &str = "meta.json";

/// Pairtree directory for a bibcode, relative to the store root
pub fn pairtree_path(bibcode: &str) -> PathBuf {
    let cleaned: Vec<char> = bibcode
        .trim()
        .chars()
        .map(|c| match c {
            '/' => '=',
            ':' => '+',
            '.' => ',',
            other => other,
        })
        .collect();

    cleaned
        .chunks(2)
        .map(|segment| segment.iter().collect::<String>())
        .collect()
}

/// Filesystem-backed store of [`ExtractionMetadata`], keyed by bibcode
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Leaf directory holding everything stored for a bibcode
    pub fn record_dir(&self, bibcode: &str) -> PathBuf {
        self.root.join(pairtree_path(bibcode))
    }

    pub fn meta_path(&self, bibcode: &str) -> PathBuf {
        self.record_dir(bibcode).join(META_FILE)
    }

    pub fn exists(&self, bibcode: &str) -> bool {
        self.meta_path(bibcode).is_file()
    }

    /// Load the metadata for a bibcode; a missing record is an IO error
    pub fn load(&self, bibcode: &str) -> Result<ExtractionMetadata> {
        let path = self.meta_path(bibcode);
        let content = std::fs::read(&path)?;
        let metadata = serde_json::from_slice(&content)?;
        Ok(metadata)
    }

    /// Load the metadata for a bibcode, `None` when it was never extracted
    pub fn find(&self, bibcode: &str) -> Result<Option<ExtractionMetadata>> {
        match self.load(bibcode) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(PipelineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the metadata for a bibcode, replacing any previous record.
    ///
    /// Returns the path of the written `meta.json`.
    pub fn save(&self, bibcode: &str, metadata: &ExtractionMetadata) -> Result<PathBuf> {
        let path = self.writable_dir(bibcode)?.join(META_FILE);
        let content = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&path, &content)?;

        debug!(bibcode = %bibcode, path = %path.display(), "Saved extraction metadata");
        Ok(path)
    }

    /// Write each extracted field to `<field>.txt` beside the metadata
    pub fn save_fields(&self, bibcode: &str, fields: &FieldMap) -> Result<Vec<PathBuf>> {
        let dir = self.writable_dir(bibcode)?;
        let mut written = Vec::with_capacity(fields.len());

        for (field, content) in fields {
            let path = dir.join(format!("{}.txt", field.as_str()));
            write_atomic(&path, content.as_bytes())?;
            written.push(path);
        }

        Ok(written)
    }

    /// Record directory for a write; a blank bibcode would resolve to the root
    fn writable_dir(&self, bibcode: &str) -> Result<PathBuf> {
        let relative = pairtree_path(bibcode);
        if relative.as_os_str().is_empty() {
            return Err(PipelineError::MalformedPayload(
                "cannot store a record with an empty bibcode".to_string(),
            ));
        }
        Ok(self.root.join(relative))
    }
}

/// Write to a unique temporary sibling, then rename over the target so
/// readers never see a partial file
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        ))
    })?;
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
