//! Plain text and OCR output

use super::{ExtractedField, FieldMap};

/// The whole document is the full text
pub fn extract_text(content: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(ExtractedField::FullText, content.to_string());
    fields
}
