//! Error types for the docpipe pipeline.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the process cannot (or should not)
//!   continue at all — bad configuration, a client that never connected, a
//!   model that failed to load. Workers exit non-zero on these and the pool
//!   manager restarts them.
//!
//! * [`UnitError`] — **Non-fatal**: one `(task, page, format)` unit failed.
//!   The worker records it on the unit's ledger row, publishes a `failed`
//!   update, and keeps draining the queue. A unit error never propagates
//!   beyond the unit boundary.
//!
//! Infra clients carry their own error enums ([`BusError`], [`LedgerError`],
//! [`StoreError`], [`ModelError`]) which convert into one of the two above at
//! the call site that knows which failure mode applies.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors: the worker or pool-manager process must stop.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration was missing or invalid at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The queue/notification bus could not be reached.
    #[error("bus connection failed: {0}")]
    BusConnect(#[source] BusError),

    /// The metadata ledger could not be reached.
    #[error("ledger connection failed: {0}")]
    LedgerConnect(#[source] LedgerError),

    /// The object store client could not be initialised.
    #[error("object store init failed: {0}")]
    StoreInit(#[source] StoreError),

    /// The vision model failed to load. Workers exit on this; the pool
    /// manager restarts them (crash loops surface in its logs).
    #[error("model load failed: {0}")]
    ModelInit(#[source] ModelError),

    /// A data table (master KVPs, token dictionary) could not be loaded.
    #[error("failed to load data table '{path}': {detail}")]
    DataTable { path: PathBuf, detail: String },

    /// The pool manager could not spawn a worker child process.
    #[error("failed to spawn worker {worker_id}: {source}")]
    SpawnFailed {
        worker_id: u32,
        #[source]
        source: std::io::Error,
    },

    /// A task submission was rejected before any row was written.
    #[error("invalid task submission: {0}")]
    InvalidSubmission(String),

    /// Dispatch failed part-way; ledger rows exist, resubmission is safe.
    #[error("dispatch failed for task {task_id}: {detail}")]
    DispatchFailed { task_id: String, detail: String },

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A non-fatal error scoped to a single `(task, page, format)` unit.
///
/// Stored as `error_message` on the unit's ledger row. The display string is
/// what operators and clients see, so each variant names the failing step.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The page image referenced by the queue message could not be fetched.
    #[error("page image download failed for '{key}': {source}")]
    ImageDownload {
        key: String,
        #[source]
        source: StoreError,
    },

    /// The downloaded page image could not be decoded for dimension probing.
    #[error("page image probe failed: {detail}")]
    ImageProbe { detail: String },

    /// The model call failed or timed out.
    #[error("generation failed: {0}")]
    Model(#[from] ModelError),

    /// An artifact could not be written to the object store.
    #[error("artifact upload failed for '{key}': {source}")]
    ArtifactUpload {
        key: String,
        #[source]
        source: StoreError,
    },

    /// A ledger write failed after client-side retries.
    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    /// The queue message itself was unusable (missing image key, unknown
    /// format). Non-retriable: the dispatcher should not have enqueued it.
    #[error("invalid work unit: {detail}")]
    InvalidInput { detail: String },

    /// Unexpected internal failure (e.g. a panicked processing task).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from the queue & notification bus client.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("TLS material unreadable at '{path}': {detail}")]
    Tls { path: PathBuf, detail: String },
}

/// Errors from the metadata ledger client.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("ledger row corrupt: {0}")]
    Corrupt(String),
}

/// Errors from the object store gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store error: {0}")]
    Backend(#[from] object_store::Error),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the vision model adapter.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The one-shot model load/warm-up did not complete.
    #[error("model warm-up failed: {detail}")]
    Warmup { detail: String },

    /// The adapter request could not be built or sent.
    #[error("model request failed: {detail}")]
    Request { detail: String },

    /// The generation exceeded the per-call timeout.
    #[error("generation timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The backend answered but the response was unusable.
    #[error("model backend error: {detail}")]
    Backend { detail: String },
}
