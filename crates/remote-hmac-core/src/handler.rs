//! Request pipeline: decode, digest, encode.

use tracing::warn;

use crate::decoder::decode;
use crate::encoder::encode;
use crate::engine::{BatchEngine, EngineConfig};
use crate::error::{BatchError, BatchOutcome};
use crate::model::BatchResult;

/// Everything the transport layer needs to answer one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledBatch {
    /// Request identifier from the envelope, empty if it could not be decoded.
    pub request_id: String,
    /// Number of rows in the decoded batch.
    pub rows: usize,
    /// Category of the batch fault, if the batch failed.
    pub fault: Option<&'static str>,
    /// Encoded response body. `Err` only for [`BatchError::Encode`].
    pub body: BatchOutcome<Vec<u8>>,
}

impl HandledBatch {
    /// Whether the batch produced replies.
    pub fn succeeded(&self) -> bool {
        self.fault.is_none() && self.body.is_ok()
    }
}

/// Runs whole request bodies through the [`BatchEngine`].
#[derive(Debug, Clone)]
pub struct BatchHandler {
    engine: BatchEngine,
}

impl BatchHandler {
    /// Create a handler around `engine`.
    pub fn new(engine: BatchEngine) -> Self {
        Self { engine }
    }

    /// Create an HMAC-SHA256 handler.
    pub fn hmac_sha256(config: EngineConfig) -> Self {
        Self::new(BatchEngine::hmac_sha256(config))
    }

    /// The underlying engine.
    pub fn engine(&self) -> &BatchEngine {
        &self.engine
    }

    /// Handle one raw request body.
    ///
    /// Decode failures and row faults become an `errorMessage` body; no
    /// error escapes except a failure to encode the response itself.
    pub async fn handle(&self, body: &[u8]) -> HandledBatch {
        let (request_id, rows, outcome) = match decode(body) {
            Ok(request) => {
                let rows = request.len();
                let outcome = self.engine.run(request.calls).await;
                (request.request_id, rows, outcome)
            }
            Err(err) => (String::new(), 0, Err(err)),
        };

        let fault = outcome.as_ref().err().map(BatchError::category);
        if let Err(ref err) = outcome {
            warn!(
                request_id = %request_id,
                category = err.category(),
                row = ?err.row(),
                error = %err,
                "batch rejected"
            );
        }

        let result = BatchResult::from(outcome);
        HandledBatch {
            request_id,
            rows,
            fault,
            body: encode(&result),
        }
    }
}
