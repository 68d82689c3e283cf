//! Error types for batch processing.
//!
//! Every fault the batch pipeline can hit is a [`BatchError`]. All variants
//! except [`BatchError::Encode`] are *batch faults*: they are reported to the
//! caller inside the response body as a single `errorMessage`, and no partial
//! replies are ever returned next to them.
//!
//! | Variant | Category | Surfaced as |
//! |---|---|---|
//! | `Decode` | `decode` | `errorMessage` |
//! | `Arity` | `arity` | `errorMessage` |
//! | `Type` | `type` | `errorMessage` |
//! | `Digest` | `digest` | `errorMessage` |
//! | `Encode` | `encode` | HTTP 500 |

use std::fmt;

use thiserror::Error;

/// Result type alias using [`BatchError`].
pub type BatchOutcome<T> = Result<T, BatchError>;

/// Number of positional arguments every call row must carry.
pub const EXPECTED_ARITY: usize = 2;

/// Which positional argument of a call row failed type validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argument {
    /// First positional argument, the message to authenticate.
    Plaintext,
    /// Second positional argument, the MAC key.
    Key,
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plaintext => f.write_str("plaintext"),
            Self::Key => f.write_str("key"),
        }
    }
}

/// Errors produced while decoding, processing or encoding a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// The request envelope is not valid JSON or has the wrong shape.
    #[error("External Function error: can't read POST body {message}")]
    Decode {
        /// Parser detail.
        message: String,
    },

    /// A call row does not carry exactly two arguments.
    #[error("Invalid number of input fields provided. expected {expected}, got {actual} (row {row})")]
    Arity {
        /// Zero-based row index.
        row: usize,
        /// Required argument count.
        expected: usize,
        /// Argument count found on the wire.
        actual: usize,
    },

    /// An argument is not a JSON string.
    #[error("Invalid {argument} type. expected string (row {row})")]
    Type {
        /// Zero-based row index.
        row: usize,
        /// The offending argument.
        argument: Argument,
    },

    /// The MAC primitive failed. Not expected for string inputs.
    #[error("Error computing hmac for {}: {message}", digest_target(.row))]
    Digest {
        /// Row index, when the failing task could be identified.
        row: Option<usize>,
        /// Failure detail.
        message: String,
    },

    /// The response body could not be serialized.
    #[error("can't convert response to JSON {message}")]
    Encode {
        /// Serializer detail.
        message: String,
    },
}

fn digest_target(row: &Option<usize>) -> String {
    match row {
        Some(row) => format!("row {row}"),
        None => "batch".to_string(),
    }
}

impl BatchError {
    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an arity error for `row` carrying `actual` arguments.
    pub fn arity(row: usize, actual: usize) -> Self {
        Self::Arity {
            row,
            expected: EXPECTED_ARITY,
            actual,
        }
    }

    /// Create a type error for `argument` of `row`.
    pub fn invalid_type(row: usize, argument: Argument) -> Self {
        Self::Type { row, argument }
    }

    /// Create a digest error attributed to `row`.
    pub fn digest(row: usize, message: impl Into<String>) -> Self {
        Self::Digest {
            row: Some(row),
            message: message.into(),
        }
    }

    /// Create a digest error that cannot be attributed to a row.
    pub fn digest_unattributed(message: impl Into<String>) -> Self {
        Self::Digest {
            row: None,
            message: message.into(),
        }
    }

    /// Create an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Row the error is attributed to, if any.
    pub fn row(&self) -> Option<usize> {
        match self {
            Self::Arity { row, .. } | Self::Type { row, .. } => Some(*row),
            Self::Digest { row, .. } => *row,
            Self::Decode { .. } | Self::Encode { .. } => None,
        }
    }

    /// Get the error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::Arity { .. } => "arity",
            Self::Type { .. } => "type",
            Self::Digest { .. } => "digest",
            Self::Encode { .. } => "encode",
        }
    }
}

/// Failure reported by a [`MacFunction`](crate::MacFunction).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DigestError(pub String);

impl DigestError {
    /// Create a digest error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
