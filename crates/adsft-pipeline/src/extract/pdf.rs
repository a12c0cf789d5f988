//! PDF text extraction via `lopdf`

use adsft_common::types::SourceFormat;
use adsft_common::{PipelineError, Result};
use async_trait::async_trait;
use lopdf::Document;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{check_provider, complete, template, ExtractedField, Extractor, ExtractorFamily, FieldMap};

/// Extractor for PDF sources; the full text is the text of every page
#[derive(Debug, Clone, Default)]
pub struct PdfExtractor;

#[async_trait]
impl Extractor for PdfExtractor {
    fn family(&self) -> ExtractorFamily {
        ExtractorFamily::Pdf
    }

    async fn extract(&self, path: &Path, format: SourceFormat, provider: &str) -> Result<FieldMap> {
        check_provider(provider)?;
        if format != SourceFormat::Pdf {
            return Err(PipelineError::UnsupportedFormat(path.display().to_string()));
        }

        let owned: PathBuf = path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || read_pdf_text(&owned))
            .await
            .map_err(|e| PipelineError::extraction(path.display().to_string(), e))??;

        let mut fields = FieldMap::new();
        fields.insert(ExtractedField::FullText, text);
        Ok(complete(fields, template(format)))
    }
}

fn read_pdf_text(path: &Path) -> Result<String> {
    let document = Document::load(path).map_err(|e| {
        PipelineError::extraction(path.display().to_string(), format!("lopdf failed to open: {e}"))
    })?;

    let pages: Vec<u32> = document.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Ok(String::new());
    }
    debug!(path = %path.display(), pages = pages.len(), "Extracting PDF text");

    document.extract_text(&pages).map_err(|e| {
        PipelineError::extraction(
            path.display().to_string(),
            format!("lopdf failed to extract text: {e}"),
        )
    })
}
