//! Request envelope decoding.

use serde_json::{Map, Value};

use crate::error::{BatchError, BatchOutcome};
use crate::model::BatchRequest;

/// Decode a raw request body into a [`BatchRequest`].
///
/// Rows keep their original array order. Any JSON syntax error, or a
/// top-level shape that does not match the envelope (for example `calls`
/// holding something other than arrays), is a [`BatchError::Decode`].
/// The envelope must be a JSON object: a top-level array is rejected even
/// when its elements line up with the envelope fields.
///
/// On success the caller metadata is logged; see
/// [`BatchRequest::log_metadata`].
pub fn decode(body: &[u8]) -> BatchOutcome<BatchRequest> {
    let envelope: Map<String, Value> =
        serde_json::from_slice(body).map_err(|e| BatchError::decode(e.to_string()))?;
    let request: BatchRequest = serde_json::from_value(Value::Object(envelope))
        .map_err(|e| BatchError::decode(e.to_string()))?;
    request.log_metadata();
    Ok(request)
}
