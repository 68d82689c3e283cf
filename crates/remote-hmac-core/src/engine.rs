//! Batch digest engine.
//!
//! The engine turns the ordered rows of a batch into an ordered list of
//! Base64 digests, or into exactly one [`BatchError`]. Output is
//! all-or-nothing: a single bad row discards every digest of the batch.
//!
//! # Parallel execution
//!
//! ```text
//!   rows ──► validate(row 0) ──► permit ──► spawn ──┐
//!            validate(row 1) ──► permit ──► spawn ──┤   JoinSet
//!            ...                                    │   (fan-in)
//!            validate(row k) ✗ ──► fail + cancel    │
//!                                                   ▼
//!   slots: [ OnceLock | OnceLock | ... ]   error: OnceLock<BatchError>
//! ```
//!
//! - Rows are validated in input order inside the dispatch loop. A row that
//!   fails validation never gets a task, and dispatch stops there.
//! - Each task owns one index of a pre-sized slot vector, so ordering does
//!   not depend on completion order.
//! - The batch error is a single-assignment cell: the first fault recorded
//!   wins and later ones are dropped.
//! - A [`CancellationToken`] is cancelled on the first fault. Tasks that have
//!   not started their digest yet skip it; running ones finish and their
//!   output is discarded.
//! - Dispatch is bounded by a semaphore of `max_concurrency` permits.
//!
//! Among validation faults, the lowest failing row is the one reported. When
//! several digest tasks fail concurrently, or a digest task fails while
//! dispatch is still validating, which fault is reported is not
//! deterministic.

use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{BatchError, BatchOutcome};
use crate::mac::{encode_digest, HmacSha256, MacFunction};
use crate::model::{Call, CallArgs};

/// How rows of a batch are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One row after another on the calling task.
    Sequential,
    /// One task per row with bounded parallelism.
    #[default]
    Parallel,
}

/// Engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduling strategy.
    pub mode: ExecutionMode,
    /// Maximum rows digested at once in parallel mode. `0` means the host's
    /// available parallelism.
    pub max_concurrency: usize,
}

impl EngineConfig {
    /// Sequential configuration.
    pub fn sequential() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            max_concurrency: 0,
        }
    }

    /// Parallel configuration with at most `max_concurrency` rows in flight.
    pub fn parallel(max_concurrency: usize) -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            max_concurrency,
        }
    }

    /// Concurrency limit after resolving `0` to the host parallelism.
    pub fn effective_concurrency(&self) -> usize {
        let limit = if self.max_concurrency == 0 {
            std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
        } else {
            self.max_concurrency
        };
        limit.min(Semaphore::MAX_PERMITS)
    }
}

/// Computes the digests of a batch with all-or-nothing semantics.
#[derive(Clone)]
pub struct BatchEngine {
    mac: Arc<dyn MacFunction>,
    config: EngineConfig,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("mac", &self.mac.name())
            .field("config", &self.config)
            .finish()
    }
}

impl BatchEngine {
    /// Create an engine around an arbitrary MAC function.
    pub fn new(mac: Arc<dyn MacFunction>, config: EngineConfig) -> Self {
        Self { mac, config }
    }

    /// Create an HMAC-SHA256 engine.
    pub fn hmac_sha256(config: EngineConfig) -> Self {
        Self::new(Arc::new(HmacSha256), config)
    }

    /// The engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Digest every row of `calls`.
    ///
    /// On success the returned vector has one entry per row, in row order.
    /// An empty batch yields an empty vector.
    pub async fn run(&self, calls: Vec<Call>) -> BatchOutcome<Vec<String>> {
        debug!(rows = calls.len(), mode = ?self.config.mode, "running batch");

        match self.config.mode {
            ExecutionMode::Sequential => self.run_sequential(calls),
            ExecutionMode::Parallel if calls.len() <= 1 => self.run_sequential(calls),
            ExecutionMode::Parallel => self.run_parallel(calls).await,
        }
    }

    /// Digest every row on the calling thread, stopping at the first fault.
    pub fn run_sequential(&self, calls: Vec<Call>) -> BatchOutcome<Vec<String>> {
        calls
            .into_iter()
            .enumerate()
            .map(|(row, call)| {
                let args = CallArgs::from_row(row, call)?;
                digest_row(self.mac.as_ref(), row, &args)
            })
            .collect()
    }

    async fn run_parallel(&self, calls: Vec<Call>) -> BatchOutcome<Vec<String>> {
        let state = Arc::new(BatchState::new(calls.len()));
        let permits = Arc::new(Semaphore::new(self.config.effective_concurrency()));
        let mut tasks = JoinSet::new();

        for (row, call) in calls.into_iter().enumerate() {
            let args = match CallArgs::from_row(row, call) {
                Ok(args) => args,
                Err(err) => {
                    state.fail(err);
                    break;
                }
            };

            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    state.fail(BatchError::digest(row, format!("scheduler closed: {e}")));
                    break;
                }
            };

            // A running task may have failed while we waited for the permit.
            if state.cancel.is_cancelled() {
                break;
            }

            let state = Arc::clone(&state);
            let mac = Arc::clone(&self.mac);
            tasks.spawn(async move {
                let _permit = permit;
                if state.cancel.is_cancelled() {
                    return;
                }
                match digest_row(mac.as_ref(), row, &args) {
                    Ok(digest) => state.fill(row, digest),
                    Err(err) => state.fail(err),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                state.fail(BatchError::digest_unattributed(format!("digest task failed: {e}")));
            }
        }

        let state = Arc::try_unwrap(state).map_err(|_| {
            BatchError::digest_unattributed("result slots still shared after fan-in")
        })?;
        state.into_outcome()
    }
}

/// Shared per-batch state for parallel execution.
struct BatchState {
    /// One slot per row, written only by that row's task.
    slots: Vec<OnceLock<String>>,
    /// First fault recorded for the batch.
    error: OnceLock<BatchError>,
    cancel: CancellationToken,
}

impl BatchState {
    fn new(rows: usize) -> Self {
        Self {
            slots: (0..rows).map(|_| OnceLock::new()).collect(),
            error: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn fill(&self, row: usize, digest: String) {
        if let Some(slot) = self.slots.get(row) {
            let _ = slot.set(digest);
        }
    }

    fn fail(&self, err: BatchError) {
        if let Err(dropped) = self.error.set(err) {
            debug!(error = %dropped, "additional batch fault ignored");
        }
        self.cancel.cancel();
    }

    fn into_outcome(self) -> BatchOutcome<Vec<String>> {
        if let Some(err) = self.error.into_inner() {
            return Err(err);
        }

        self.slots
            .into_iter()
            .enumerate()
            .map(|(row, slot)| {
                slot.into_inner()
                    .ok_or_else(|| BatchError::digest(row, "no digest recorded"))
            })
            .collect()
    }
}

fn digest_row(mac: &dyn MacFunction, row: usize, args: &CallArgs) -> BatchOutcome<String> {
    let digest = mac
        .mac(args.key.as_bytes(), args.plaintext.as_bytes())
        .map_err(|e| BatchError::digest(row, e.to_string()))?;
    Ok(encode_digest(&digest))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::error::{Argument, DigestError};
    use crate::mac::DIGEST_LEN;

    fn expected(key: &str, message: &str) -> String {
        encode_digest(&HmacSha256.mac(key.as_bytes(), message.as_bytes()).unwrap())
    }

    fn pairs(n: usize) -> Vec<Call> {
        (0..n)
            .map(|i| Call::pair(format!("message-{i}"), format!("key-{}", i % 7)))
            .collect()
    }

    fn engines() -> Vec<BatchEngine> {
        vec![
            BatchEngine::hmac_sha256(EngineConfig::sequential()),
            BatchEngine::hmac_sha256(EngineConfig::parallel(0)),
            BatchEngine::hmac_sha256(EngineConfig::parallel(1)),
            BatchEngine::hmac_sha256(EngineConfig::parallel(3)),
        ]
    }

    /// Fails for one specific message and counts every invocation.
    struct FailingMac {
        poison: &'static str,
        calls: AtomicUsize,
    }

    impl FailingMac {
        fn new(poison: &'static str) -> Self {
            Self {
                poison,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl MacFunction for FailingMac {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn mac(&self, key: &[u8], message: &[u8]) -> Result<[u8; DIGEST_LEN], DigestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message == self.poison.as_bytes() {
                return Err(DigestError::new("injected failure"));
            }
            HmacSha256.mac(key, message)
        }
    }

    struct PanickingMac;

    impl MacFunction for PanickingMac {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn mac(&self, _key: &[u8], message: &[u8]) -> Result<[u8; DIGEST_LEN], DigestError> {
            assert!(message != b"explode", "mac exploded");
            Ok([0u8; DIGEST_LEN])
        }
    }

    #[tokio::test]
    async fn test_known_vector() {
        for engine in engines() {
            let replies = engine.run(vec![Call::pair("hello", "secret")]).await.unwrap();
            assert_eq!(replies, vec!["iKqz7ejTrflNJquQ07r9SiCDBww7zOnAFO4EpEOEfAs=".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_replies_follow_input_order() {
        for engine in engines() {
            let replies = engine.run(pairs(64)).await.unwrap();
            assert_eq!(replies.len(), 64);
            for (i, reply) in replies.iter().enumerate() {
                assert_eq!(reply, &expected(&format!("key-{}", i % 7), &format!("message-{i}")));
            }
        }
    }

    #[tokio::test]
    async fn test_swapping_rows_swaps_replies() {
        let engine = BatchEngine::hmac_sha256(EngineConfig::default());

        let forward = engine
            .run(vec![Call::pair("a", "k1"), Call::pair("b", "k2")])
            .await
            .unwrap();
        let swapped = engine
            .run(vec![Call::pair("b", "k2"), Call::pair("a", "k1")])
            .await
            .unwrap();

        assert_eq!(forward[0], "tIo9CBLVBVtnexkgG/6VWtHSO/eOekXkl6p0AOML9tI=");
        assert_eq!(forward[1], "3oaL0ioIoTuMDvotVl7nMpfQwPZMXnIsNnQjqok9Lg0=");
        assert_eq!(forward[0], swapped[1]);
        assert_eq!(forward[1], swapped[0]);
    }

    #[tokio::test]
    async fn test_repeated_runs_are_identical() {
        let engine = BatchEngine::hmac_sha256(EngineConfig::parallel(4));
        let first = engine.run(pairs(32)).await.unwrap();
        let second = engine.run(pairs(32)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        for engine in engines() {
            let replies = engine.run(Vec::new()).await.unwrap();
            assert!(replies.is_empty());
        }
    }

    #[tokio::test]
    async fn test_non_string_plaintext_fails_batch() {
        for engine in engines() {
            let calls = vec![Call::pair("a", "k"), Call(vec![json!(1), json!("k")])];
            let err = engine.run(calls).await.unwrap_err();
            assert_eq!(err, BatchError::invalid_type(1, Argument::Plaintext));
        }
    }

    #[tokio::test]
    async fn test_non_string_key_fails_batch() {
        for engine in engines() {
            let mut calls = pairs(10);
            calls[9] = Call(vec![json!("a"), json!({"k": "v"})]);
            let err = engine.run(calls).await.unwrap_err();
            assert_eq!(err, BatchError::invalid_type(9, Argument::Key));
        }
    }

    #[tokio::test]
    async fn test_wrong_arity_anywhere_fails_batch() {
        for engine in engines() {
            for bad_row in [0, 5, 19] {
                let mut calls = pairs(20);
                calls[bad_row] = Call(vec![json!("a"), json!("b"), json!("c")]);
                let err = engine.run(calls).await.unwrap_err();
                assert_eq!(err, BatchError::arity(bad_row, 3));
            }
        }
    }

    #[tokio::test]
    async fn test_lowest_invalid_row_is_reported() {
        for engine in engines() {
            let mut calls = pairs(10);
            calls[2] = Call(vec![json!("only")]);
            calls[6] = Call(vec![json!(true), json!("k")]);
            let err = engine.run(calls).await.unwrap_err();
            assert_eq!(err.row(), Some(2));
            assert_eq!(err.category(), "arity");
        }
    }

    #[tokio::test]
    async fn test_digest_failure_discards_all_replies() {
        for config in [
            EngineConfig::sequential(),
            EngineConfig::parallel(1),
            EngineConfig::parallel(8),
        ] {
            let mac = Arc::new(FailingMac::new("message-4"));
            let engine = BatchEngine::new(mac, config);
            let err = engine.run(pairs(16)).await.unwrap_err();
            assert_eq!(err, BatchError::digest(4, "injected failure"));
        }
    }

    #[tokio::test]
    async fn test_digest_failure_cancels_remaining_rows() {
        let mac = Arc::new(FailingMac::new("message-0"));
        let engine = BatchEngine::new(mac.clone(), EngineConfig::parallel(1));

        let err = engine.run(pairs(100)).await.unwrap_err();

        assert_eq!(err.row(), Some(0));
        assert_eq!(mac.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_stops_dispatch() {
        let mac = Arc::new(FailingMac::new("never"));
        let engine = BatchEngine::new(mac.clone(), EngineConfig::parallel(2));

        let mut calls = pairs(50);
        calls[10] = Call(vec![json!(null), json!("k")]);
        let err = engine.run(calls).await.unwrap_err();

        assert_eq!(err.row(), Some(10));
        assert!(mac.calls.load(Ordering::SeqCst) <= 10);
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_digest_error() {
        let engine = BatchEngine::new(Arc::new(PanickingMac), EngineConfig::parallel(4));
        let calls = vec![Call::pair("fine", "k"), Call::pair("explode", "k")];

        let err = engine.run(calls).await.unwrap_err();
        assert_eq!(err.category(), "digest");
    }

    #[tokio::test]
    async fn test_large_batch_with_bounded_concurrency() {
        let engine = BatchEngine::hmac_sha256(EngineConfig::parallel(4));
        let calls = pairs(1000);
        let sequential = engine.run_sequential(calls.clone()).unwrap();
        let parallel = engine.run(calls).await.unwrap();
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_effective_concurrency() {
        assert_eq!(EngineConfig::parallel(3).effective_concurrency(), 3);
        assert!(EngineConfig::parallel(0).effective_concurrency() >= 1);
    }

    #[test]
    fn test_engine_config_serde() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"mode": "sequential", "max_concurrency": 2}"#).unwrap();
        assert_eq!(config.mode, ExecutionMode::Sequential);
        assert_eq!(config.max_concurrency, 2);

        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.mode, ExecutionMode::Parallel);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_parallel_matches_direct_hmac(
            rows in proptest::collection::vec((".{0,24}", ".{0,16}"), 0..40),
            limit in 1usize..6,
        ) {
            let calls: Vec<Call> = rows
                .iter()
                .map(|(plaintext, key)| Call::pair(plaintext.as_str(), key.as_str()))
                .collect();
            let engine = BatchEngine::hmac_sha256(EngineConfig::parallel(limit));

            let parallel = tokio_test::block_on(engine.run(calls.clone())).unwrap();
            let sequential = engine.run_sequential(calls).unwrap();

            prop_assert_eq!(&parallel, &sequential);
            for ((plaintext, key), reply) in rows.iter().zip(&parallel) {
                prop_assert_eq!(reply, &expected(key, plaintext));
            }
        }
    }
}
