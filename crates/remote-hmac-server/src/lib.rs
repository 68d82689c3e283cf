//! # Remote HMAC Server
//!
//! HTTP front end for batch HMAC-SHA256 remote-function calls.
//!
//! A query engine posts a batch of `[plaintext, key]` rows to the function
//! path and receives the Base64 digests back in row order, or a single
//! `errorMessage` if any row fails.
//!
//! ```text
//!  caller ── POST {calls} ──► HmacServer ──► BatchHandler ──► {replies} / {errorMessage}
//!                                 │
//!                                 ├─ /_hmac/health   liveness
//!                                 ├─ /_hmac/ready    readiness
//!                                 ├─ /_hmac/metrics  Prometheus text
//!                                 └─ /_hmac/version
//! ```
//!
//! # Example Usage
//!
//! ```bash
//! $ remote-hmac --config /etc/remote-hmac/config.toml
//!
//! $ REMOTE_HMAC_LISTEN_PORT=9000 REMOTE_HMAC_ENGINE_MODE=sequential remote-hmac
//! ```

#![doc(html_root_url = "https://docs.rs/remote-hmac-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod server;
pub mod shutdown;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{ErrorResponse, ServerError, ServerResult};
pub use health::{HealthChecker, HealthStatus, ReadinessStatus};
pub use server::{BoundServer, HmacServer};
pub use shutdown::ShutdownSignal;

/// Server version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
