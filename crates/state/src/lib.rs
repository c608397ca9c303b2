//! Denormalized multi-index storage layer for the plaza platform.
//!
//! The write path fans a single logical mutation out across many physical
//! tables (primary records, per-partition timelines, junction indexes,
//! follower edges, commutative counters) over a backend that offers no
//! cross-partition transactions. The layer is built around three rules:
//!
//! - The primary row must succeed before anything else is attempted; it is
//!   retried with bounded exponential backoff and is the only write the
//!   caller waits on.
//! - Secondary index writes are best-effort and concurrent; a failed
//!   secondary is queued as a repair task instead of failing the mutation.
//! - Counters receive net deltas only: handlers diff the stored state
//!   before emitting, so resubmitting a mutation never double-counts.
//!
//! The [`repair::Reconciler`] closes the loop, replaying queued repairs and
//! recounting counters from the authoritative edge rows.

#![deny(unsafe_code)]

pub mod counters;
pub mod edges;
pub mod engine;
pub mod fanout;
pub mod keys;
pub mod queries;
pub mod records;
pub mod repair;
pub mod retry;
pub mod tables;
pub mod testing;

pub use counters::{CounterError, CounterLedger, CounterRow};
pub use edges::{EdgeAttrs, EdgeError, EdgeKind, EdgeRow, EdgeStore};
pub use engine::{BackendError, MemoryBackend, StorageBackend};
pub use fanout::{FanoutWriter, FollowTarget, Mutation, MutationError, Receipt};
pub use queries::{Queries, QueryError};
pub use records::{Record, RecordError, RecordStore};
pub use repair::{
    DrainReport, PhysicalWrite, Reconciler, RepairError, RepairLog, RepairTask, WriteError,
};
pub use retry::{RetryFailure, RetryableError, with_retry, with_retry_cancellable};
pub use tables::TableId;
pub use testing::{FlakyBackend, InterleavingBackend};
