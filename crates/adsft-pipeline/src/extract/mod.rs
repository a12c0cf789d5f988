//! Format-specific full-text extractors
//!
//! Every supported [`SourceFormat`] belongs to exactly one
//! [`ExtractorFamily`], and each family has one [`Extractor`]
//! implementation registered in an [`ExtractorRegistry`]. The family also
//! decides the routing key the check stage publishes to, so supporting a new
//! format means extending the family mapping and registering an extractor.

mod markup;
mod pdf;
mod text;

pub use markup::{extract_html, extract_xml};
pub use pdf::PdfExtractor;
pub use text::extract_text;

use adsft_common::types::SourceFormat;
use adsft_common::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::topology::{PDF_ROUTING_KEY, STANDARD_ROUTING_KEY};

/// A field an extractor can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtractedField {
    Title,
    Abstract,
    FullText,
    Acknowledgements,
}

impl ExtractedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractedField::Title => "title",
            ExtractedField::Abstract => "abstract",
            ExtractedField::FullText => "full_text",
            ExtractedField::Acknowledgements => "acknowledgements",
        }
    }
}

impl std::fmt::Display for ExtractedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extracted text keyed by field
pub type FieldMap = BTreeMap<ExtractedField, String>;

/// Group of formats handled by one extractor and one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractorFamily {
    /// Markup and plain text sources
    Standard,
    /// PDF sources
    Pdf,
}

impl ExtractorFamily {
    pub const ALL: [ExtractorFamily; 2] = [ExtractorFamily::Standard, ExtractorFamily::Pdf];

    pub fn for_format(format: SourceFormat) -> Self {
        match format {
            SourceFormat::Xml | SourceFormat::Html | SourceFormat::Text | SourceFormat::Ocr => {
                ExtractorFamily::Standard
            }
            SourceFormat::Pdf => ExtractorFamily::Pdf,
        }
    }

    /// Routing key of the queue feeding this family's extract stage
    pub fn routing_key(&self) -> &'static str {
        match self {
            ExtractorFamily::Standard => STANDARD_ROUTING_KEY,
            ExtractorFamily::Pdf => PDF_ROUTING_KEY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorFamily::Standard => "standard",
            ExtractorFamily::Pdf => "pdf",
        }
    }
}

impl std::fmt::Display for ExtractorFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field template for a format.
///
/// Every field of the template is present in the extractor output, empty
/// when the document has no such section.
pub fn template(format: SourceFormat) -> &'static [ExtractedField] {
    match format {
        SourceFormat::Xml => &[
            ExtractedField::Title,
            ExtractedField::Abstract,
            ExtractedField::FullText,
            ExtractedField::Acknowledgements,
        ],
        SourceFormat::Html => &[ExtractedField::Title, ExtractedField::FullText],
        SourceFormat::Text | SourceFormat::Ocr | SourceFormat::Pdf => &[ExtractedField::FullText],
    }
}

/// Turns a source document into a [`FieldMap`]
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Family this extractor serves
    fn family(&self) -> ExtractorFamily;

    /// Extract the template fields of `format` from the document at `path`.
    ///
    /// Unreadable or unparseable documents are [`PipelineError::Extraction`]
    /// errors; a blank provider is [`PipelineError::UnsupportedProvider`].
    async fn extract(&self, path: &Path, format: SourceFormat, provider: &str) -> Result<FieldMap>;
}

/// Extractor for XML, HTML, text and OCR sources
#[derive(Debug, Clone, Default)]
pub struct StandardExtractor;

#[async_trait]
impl Extractor for StandardExtractor {
    fn family(&self) -> ExtractorFamily {
        ExtractorFamily::Standard
    }

    async fn extract(&self, path: &Path, format: SourceFormat, provider: &str) -> Result<FieldMap> {
        check_provider(provider)?;

        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::extraction(path.display().to_string(), e))?;
        let content = String::from_utf8_lossy(&raw);

        let fields = match format {
            SourceFormat::Xml => extract_xml(&content, provider)
                .map_err(|reason| PipelineError::extraction(path.display().to_string(), reason))?,
            SourceFormat::Html => extract_html(&content),
            SourceFormat::Text | SourceFormat::Ocr => extract_text(&content),
            SourceFormat::Pdf => {
                return Err(PipelineError::UnsupportedFormat(path.display().to_string()))
            }
        };

        Ok(complete(fields, template(format)))
    }
}

/// Extractors keyed by family
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<ExtractorFamily, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in extractor for every family
    pub fn with_defaults() -> Self {
        Self::new()
            .register(Arc::new(StandardExtractor))
            .register(Arc::new(PdfExtractor))
    }

    /// Register an extractor, replacing any previous one for its family
    pub fn register(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.insert(extractor.family(), extractor);
        self
    }

    pub fn get(&self, family: ExtractorFamily) -> Option<Arc<dyn Extractor>> {
        self.extractors.get(&family).cloned()
    }

    pub fn families(&self) -> Vec<ExtractorFamily> {
        ExtractorFamily::ALL
            .into_iter()
            .filter(|f| self.extractors.contains_key(f))
            .collect()
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("families", &self.families())
            .finish()
    }
}

/// Collapse whitespace runs (including non-breaking spaces) and trim
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn check_provider(provider: &str) -> Result<()> {
    if provider.trim().is_empty() {
        return Err(PipelineError::UnsupportedProvider(provider.to_string()));
    }
    Ok(())
}

/// Clean every value and add empty entries for template fields not found
pub(crate) fn complete(mut fields: FieldMap, template: &[ExtractedField]) -> FieldMap {
    fields.retain(|field, _| template.contains(field));
    for value in fields.values_mut() {
        *value = clean_text(value);
    }
    for field in template {
        fields.entry(*field).or_default();
    }
    fields
}
