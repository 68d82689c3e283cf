//! # Remote HMAC Core
//!
//! Batch HMAC-SHA256 processing for remote user-defined-function callbacks.
//!
//! A query engine calls the function once per row but ships many rows in one
//! request. This crate decodes that request, computes one digest per row and
//! encodes the ordered replies:
//!
//! ```text
//! body ──► decoder ──► BatchRequest ──► engine ──► BatchResult ──► encoder ──► body
//!                                         │
//!                                    MacFunction (HMAC-SHA256)
//! ```
//!
//! - [`BatchHandler`] - the whole pipeline for one request body
//! - [`BatchEngine`] - ordered, all-or-nothing fan-out/fan-in over rows
//! - [`MacFunction`] / [`HmacSha256`] - the digest primitive seam
//! - [`BatchError`] - the error taxonomy
//!
//! # Example
//!
//! ```rust
//! use remote_hmac_core::{BatchEngine, Call, EngineConfig};
//!
//! # tokio_test::block_on(async {
//! let engine = BatchEngine::hmac_sha256(EngineConfig::default());
//! let replies = engine.run(vec![Call::pair("hello", "secret")]).await.unwrap();
//! assert_eq!(replies, ["iKqz7ejTrflNJquQ07r9SiCDBww7zOnAFO4EpEOEfAs="]);
//! # });
//! ```

#![doc(html_root_url = "https://docs.rs/remote-hmac-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod decoder;
pub mod encoder;
pub mod engine;
mod error;
mod handler;
pub mod mac;
mod model;

pub use decoder::decode;
pub use encoder::{encode, BatchResponse};
pub use engine::{BatchEngine, EngineConfig, ExecutionMode};
pub use error::{Argument, BatchError, BatchOutcome, DigestError, EXPECTED_ARITY};
pub use handler::{BatchHandler, HandledBatch};
pub use mac::{encode_digest, HmacSha256, MacFunction, DIGEST_LEN};
pub use model::{BatchRequest, BatchResult, Call, CallArgs};
