//! Link-list input
//!
//! A link list has one record per line:
//!
//! ```text
//! # bibcode            source path                     provider
//! 2015MNRAS.446.4239E  /proj/ads/fulltext/test.pdf      MNRAS
//! ```
//!
//! Fields are separated by whitespace. Blank lines and lines starting with
//! `#` are ignored.

use adsft_common::types::InputRecord;
use adsft_common::{PipelineError, Result};
use std::path::Path;
use tracing::debug;

/// Parsed link list, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkList {
    records: Vec<InputRecord>,
}

impl LinkList {
    pub fn new(records: Vec<InputRecord>) -> Self {
        Self { records }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let list = Self::parse(&content)?;
        debug!(path = %path.display(), records = list.len(), "Read link list");
        Ok(list)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut records = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(PipelineError::MalformedPayload(format!(
                    "line {}: expected 'bibcode path provider', got '{}'",
                    index + 1,
                    line
                )));
            }

            // Providers may contain spaces; everything after the path belongs to it
            records.push(InputRecord::new(fields[0], fields[1], fields[2..].join(" ")));
        }

        Ok(Self { records })
    }

    pub fn records(&self) -> &[InputRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The whole list as one JSON array body
    pub fn make_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.records)?)
    }

    /// The list as JSON array bodies of at most `batch_size` records
    pub fn make_payloads(&self, batch_size: usize) -> Result<Vec<Vec<u8>>> {
        self.records
            .chunks(batch_size.max(1))
            .map(|chunk| serde_json::to_vec(chunk).map_err(PipelineError::from))
            .collect()
    }
}
