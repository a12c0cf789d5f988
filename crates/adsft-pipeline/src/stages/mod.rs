//! Stage handlers run by the workers
//!
//! - [`CheckStage`]: classifies records and routes them to an extractor queue
//! - [`ExtractStage`]: extracts full text for one extractor family

mod check;
mod extract;

pub use check::{CheckOutcome, CheckStage};
pub use extract::ExtractStage;

use adsft_common::{PipelineError, Result};
use serde_json::Value;

/// Split a message body into its records.
///
/// Upstream publishes either a JSON array of records or a single record.
pub(crate) fn parse_batch(body: &[u8]) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| PipelineError::MalformedPayload(format!("body is not JSON: {}", e)))?;

    match value {
        Value::Array(records) => Ok(records),
        record @ Value::Object(_) => Ok(vec![record]),
        other => Err(PipelineError::MalformedPayload(format!(
            "expected a record or a list of records, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
