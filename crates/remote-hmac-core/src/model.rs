//! Batch data model.
//!
//! A [`BatchRequest`] is built once per inbound request and never mutated.
//! Its rows stay as raw [`Call`] values until the engine validates them into
//! [`CallArgs`], so arity and type faults are reported as batch errors rather
//! than as envelope decode failures.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Argument, BatchError, BatchOutcome, EXPECTED_ARITY};

/// Inbound remote-function request envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Identifier assigned by the calling query engine.
    #[serde(default, deserialize_with = "null_as_default")]
    pub request_id: String,
    /// Full resource name of the calling routine. Logged, never validated.
    #[serde(default, deserialize_with = "null_as_default")]
    pub caller: String,
    /// Identity of the session that ran the query. Logged, never validated.
    #[serde(default, deserialize_with = "null_as_default")]
    pub session_user: String,
    /// Opaque context attached to the routine definition.
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_defined_context: HashMap<String, String>,
    /// Rows to process, in the order replies must be returned.
    #[serde(default, deserialize_with = "null_as_default")]
    pub calls: Vec<Call>,
}

impl BatchRequest {
    /// Create a request carrying only `calls`.
    pub fn new(calls: Vec<Call>) -> Self {
        Self {
            calls,
            ..Self::default()
        }
    }

    /// Set the request identifier.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Set the caller.
    #[must_use]
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    /// Set the session user.
    #[must_use]
    pub fn with_session_user(mut self, session_user: impl Into<String>) -> Self {
        self.session_user = session_user.into();
        self
    }

    /// Add a user-defined context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_defined_context.insert(key.into(), value.into());
        self
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Log the caller metadata for observability.
    ///
    /// Only emits a tracing event, so it cannot fail the request.
    pub fn log_metadata(&self) {
        tracing::info!(
            request_id = %self.request_id,
            caller = %self.caller,
            session_user = %self.session_user,
            user_defined_context = ?self.user_defined_context,
            rows = self.calls.len(),
            "batch request received"
        );
    }
}

/// One raw row of the `calls` array, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Call(pub Vec<Value>);

impl Call {
    /// Build a row from two string arguments.
    pub fn pair(plaintext: impl Into<String>, key: impl Into<String>) -> Self {
        Self(vec![
            Value::String(plaintext.into()),
            Value::String(key.into()),
        ])
    }

    /// Number of positional arguments on the row.
    pub fn arity(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<Value>> for Call {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// A validated row: both arguments present and string-typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallArgs {
    /// Message to authenticate.
    pub plaintext: String,
    /// MAC key.
    pub key: String,
}

impl CallArgs {
    /// Create validated arguments directly.
    pub fn new(plaintext: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            plaintext: plaintext.into(),
            key: key.into(),
        }
    }

    /// Validate row `row` of a batch.
    ///
    /// Arity is checked first, then the plaintext type, then the key type.
    pub fn from_row(row: usize, call: Call) -> BatchOutcome<Self> {
        if call.arity() != EXPECTED_ARITY {
            return Err(BatchError::arity(row, call.arity()));
        }

        let mut values = call.0.into_iter();
        let plaintext = take_string(row, values.next(), Argument::Plaintext)?;
        let key = take_string(row, values.next(), Argument::Key)?;

        Ok(Self { plaintext, key })
    }
}

fn take_string(row: usize, value: Option<Value>, argument: Argument) -> BatchOutcome<String> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(BatchError::invalid_type(row, argument)),
    }
}

/// Outcome of one batch, ready for encoding.
///
/// Replies and an error message are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchResult {
    /// One Base64 digest per row, in row order.
    Replies(Vec<String>),
    /// The single batch-level error message.
    Error(String),
}

impl BatchResult {
    /// Whether the batch failed.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The replies, if the batch succeeded.
    pub fn replies(&self) -> Option<&[String]> {
        match self {
            Self::Replies(replies) => Some(replies),
            Self::Error(_) => None,
        }
    }

    /// The error message, if the batch failed.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Replies(_) => None,
            Self::Error(message) => Some(message),
        }
    }
}

impl From<BatchOutcome<Vec<String>>> for BatchResult {
    fn from(outcome: BatchOutcome<Vec<String>>) -> Self {
        match outcome {
            Ok(replies) => Self::Replies(replies),
            Err(err) => Self::Error(err.to_string()),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
