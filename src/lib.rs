//! # docpipe
//!
//! The page-processing core of a document-intelligence platform: PDFs and
//! images uploaded by end users are fanned out into per-(page, format) work
//! units, processed by a supervised pool of vision-language-model workers,
//! and surfaced back as positioned HTML, plain text, key-value JSON, and
//! anonymized variants — with durable progress in a relational ledger and
//! real-time updates over pub/sub.
//!
//! ## Pipeline Overview
//!
//! ```text
//! submission
//!  │
//!  ├─ 1. Dispatch  ledger rows per (page, format), then FIFO enqueue
//!  ├─ 2. Pool      N supervised worker processes, one model each
//!  ├─ 3. Worker    blocking-pop → download page image → format handler
//!  ├─ 4. Handler   html / json / kvp / anon (VLM call + parsing)
//!  ├─ 5. Artifacts object store puts (results/, restricted/ for anon)
//!  └─ 6. Ledger    unit upserts, derived txt rows, task aggregate, pub/sub
//! ```
//!
//! ## Guarantees
//!
//! * Queue delivery is at-least-once; workers are idempotent against
//!   re-delivery and short-circuit units that already completed.
//! * A unit failure never crashes a worker; it is recorded on the unit's
//!   ledger row and the task aggregate is recomputed from the units.
//! * The model loads exactly once per worker process; the pool manager
//!   serialises loads across workers and restarts crashed ones.
//! * Pub/sub updates are best-effort hints; the ledger is the source of
//!   truth.
//!
//! ## Backends
//!
//! Infra seams are narrow traits with production and in-memory
//! implementations: [`bus::RedisBus`] / [`bus::MemoryBus`],
//! [`ledger::PgLedger`] / [`ledger::MemoryLedger`], and an
//! [`store::ArtifactStore`] over any `object_store` backend. Together with
//! [`model::SimulatedVision`] the whole pipeline runs in-process for tests
//! and local development.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod prompts;
pub mod store;
pub mod types;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{Config, ModelBackend, RuntimeEnv};
pub use dispatch::{Dispatcher, TaskSubmission};
pub use error::{BusError, LedgerError, ModelError, PipelineError, StoreError, UnitError};
pub use model::{load_vision_model, DecodeParams, SimulatedVision, VisionModel};
pub use pool::PoolManager;
pub use store::ArtifactStore;
pub use types::{
    AnonStrategy, ArtifactKind, FormatKind, FormatOptions, PageUnit, QueueMessage,
    SelectedField, TaskRecord, TaskStatus, TaskUpdate, UnitFormat, UnitStatus,
};
pub use worker::Worker;
