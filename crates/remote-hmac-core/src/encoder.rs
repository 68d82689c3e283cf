//! Response envelope encoding.

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, BatchOutcome};
use crate::model::BatchResult;

/// Wire form of a [`BatchResult`].
///
/// Exactly one of the two fields is present on the wire. An empty batch
/// still carries the field and encodes as `{"replies":[]}`, never as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    /// Digests in row order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<String>>,
    /// Batch-level failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&BatchResult> for BatchResponse {
    fn from(result: &BatchResult) -> Self {
        match result {
            BatchResult::Replies(replies) => Self {
                replies: Some(replies.clone()),
                error_message: None,
            },
            BatchResult::Error(message) => Self {
                replies: None,
                error_message: Some(message.clone()),
            },
        }
    }
}

/// Serialize a [`BatchResult`] into a JSON response body.
pub fn encode(result: &BatchResult) -> BatchOutcome<Vec<u8>> {
    serde_json::to_vec(&BatchResponse::from(result)).map_err(|e| BatchError::encode(e.to_string()))
}
