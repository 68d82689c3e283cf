//! Liveness and readiness reporting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Health status of the server.
///
/// Liveness only reports that the process answers; draining and startup are
/// reported through [`ReadinessStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Serving normally.
    Healthy,
}

/// Readiness status of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    /// Accepting traffic.
    Ready,
    /// Starting up or draining.
    NotReady,
}

impl ReadinessStatus {
    /// Check if the server is ready.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall health status.
    pub status: HealthStatus,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
    /// Process start time.
    pub started_at: DateTime<Utc>,
    /// Server version.
    pub version: String,
}

/// Readiness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Overall readiness status.
    pub status: ReadinessStatus,
    /// Batches answered since start.
    pub batches_served: u64,
    /// Completion time of the most recent batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_batch_at: Option<DateTime<Utc>>,
}

/// Tracks process health and traffic readiness.
#[derive(Debug)]
pub struct HealthChecker {
    start_time: Instant,
    started_at: DateTime<Utc>,
    ready: AtomicBool,
    batches_served: AtomicU64,
    last_batch_at: RwLock<Option<DateTime<Utc>>>,
}

impl HealthChecker {
    /// Create a new health checker. It starts out not ready.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_at: Utc::now(),
            ready: AtomicBool::new(false),
            batches_served: AtomicU64::new(0),
            last_batch_at: RwLock::new(None),
        }
    }

    /// Mark the server as ready or not.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if the server is ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Get the uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Note that a batch was answered.
    pub fn record_batch(&self) {
        self.batches_served.fetch_add(1, Ordering::Relaxed);
        *self.last_batch_at.write() = Some(Utc::now());
    }

    /// Perform a liveness check.
    pub fn liveness(&self) -> HealthResponse {
        HealthResponse {
            status: HealthStatus::Healthy,
            uptime_seconds: self.uptime().as_secs(),
            started_at: self.started_at,
            version: crate::VERSION.to_string(),
        }
    }

    /// Perform a readiness check.
    pub fn readiness(&self) -> ReadinessResponse {
        let status = if self.is_ready() {
            ReadinessStatus::Ready
        } else {
            ReadinessStatus::NotReady
        };

        ReadinessResponse {
            status,
            batches_served: self.batches_served.load(Ordering::Relaxed),
            last_batch_at: *self.last_batch_at.read(),
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
