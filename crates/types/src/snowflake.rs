//! Snowflake-style globally unique ID generation.
//!
//! Generates 64-bit IDs that are globally unique, roughly time-ordered, and
//! monotonically increasing within a single process. Used for post IDs and
//! for the event IDs callers attach to counter-bearing mutations.
//!
//! # ID Structure
//!
//! ```text
//! | 42 bits: timestamp (ms since epoch) | 12 bits: worker | 10 bits: sequence |
//! ```
//!
//! - **Timestamp**: milliseconds since 2024-01-01 00:00:00 UTC (~139 years range)
//! - **Worker**: per-process identifier from entropy mixed with PID (4096 values)
//! - **Sequence**: counter within each millisecond (1024 IDs/ms guaranteed unique per worker)
//!
//! The worker component is generated once per process by XOR-ing OS entropy
//! with the process ID, so separate writer processes starting in the same
//! millisecond still produce distinct IDs.
//!
//! # Thread Safety
//!
//! Uses a global `parking_lot::Mutex` to ensure uniqueness across threads.
//! The lock is held only for the duration of the increment operation.

use std::{
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use snafu::Snafu;

use crate::types::{EventId, PostId};

/// Custom epoch: 2024-01-01 00:00:00 UTC (milliseconds since Unix epoch).
const EPOCH_MS: u64 = 1_704_067_200_000;

/// Number of bits used for the random worker ID.
const WORKER_BITS: u32 = 12;

/// Number of bits used for the sequence portion.
const SEQUENCE_BITS: u32 = 10;

/// Mask for extracting the worker ID (12 bits).
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;

/// Mask for extracting the sequence portion (10 bits).
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// State for sequence-based ID generation.
struct SnowflakeState {
    /// Last timestamp used for ID generation.
    last_timestamp: u64,
    /// Sequence counter within the current millisecond.
    sequence: u64,
}

/// Global state for thread-safe ID generation.
static SNOWFLAKE_STATE: Mutex<SnowflakeState> =
    Mutex::new(SnowflakeState { last_timestamp: 0, sequence: 0 });

/// Per-process worker ID, initialized once from OS entropy mixed with PID.
static WORKER_ID: OnceLock<u64> = OnceLock::new();

/// Returns the per-process worker ID, generating it on first call.
///
/// Mixes the process ID into the random value so that concurrent processes
/// on the same machine always produce distinct worker IDs, even if the RNG
/// returns identical initial values.
fn worker_id() -> u64 {
    *WORKER_ID.get_or_init(|| {
        use rand::Rng;
        let pid = u64::from(std::process::id());
        (rand::rng().random::<u64>() ^ pid) & WORKER_MASK
    })
}

/// Errors from Snowflake ID generation.
#[derive(Debug, Snafu)]
pub enum SnowflakeError {
    /// System clock is before the Unix epoch.
    #[snafu(display("system clock is before Unix epoch"))]
    SystemClock,
}

/// Generates a new Snowflake ID.
///
/// Combines a timestamp (milliseconds since 2024-01-01) with a random worker
/// ID and a sequence counter to produce a globally unique, time-ordered
/// identifier. The top bit stays zero for the epoch's lifetime, so the value
/// is also a valid non-negative `i64`.
///
/// # Errors
///
/// Returns [`SnowflakeError::SystemClock`] if the system clock is before the
/// Unix epoch.
pub fn generate() -> Result<u64, SnowflakeError> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| SnowflakeError::SystemClock)?
        .as_millis() as u64;

    let timestamp = now_ms.saturating_sub(EPOCH_MS);
    let wid = worker_id();

    let mut state = SNOWFLAKE_STATE.lock();

    let sequence = if timestamp > state.last_timestamp {
        // New millisecond — reset sequence
        state.last_timestamp = timestamp;
        state.sequence = 0;
        0
    } else {
        // Same millisecond, or clock went backwards — keep the last
        // timestamp for monotonicity and advance the sequence
        state.sequence += 1;
        if state.sequence > SEQUENCE_MASK {
            // Sequence overflow — wait for next millisecond
            // Extremely rare (>1024 IDs in 1ms) but handled safely
            drop(state);
            std::thread::sleep(std::time::Duration::from_millis(1));
            return generate();
        }
        state.sequence
    };

    Ok((state.last_timestamp << (WORKER_BITS + SEQUENCE_BITS)) | (wid << SEQUENCE_BITS) | sequence)
}

/// Generates a new [`EventId`] from a Snowflake ID.
///
/// # Errors
///
/// Returns [`SnowflakeError::SystemClock`] if the system clock is before the
/// Unix epoch.
pub fn generate_event_id() -> Result<EventId, SnowflakeError> {
    generate().map(|id| EventId::new(id as i64))
}

/// Generates a new [`PostId`] from a Snowflake ID.
///
/// # Errors
///
/// Returns [`SnowflakeError::SystemClock`] if the system clock is before the
/// Unix epoch.
pub fn generate_post_id() -> Result<PostId, SnowflakeError> {
    generate().map(|id| PostId::new(id as i64))
}

/// Extracts the timestamp portion from a Snowflake ID.
///
/// Returns milliseconds since the custom epoch (2024-01-01 00:00:00 UTC).
#[must_use]
pub fn extract_timestamp(id: u64) -> u64 {
    id >> (WORKER_BITS + SEQUENCE_BITS)
}

/// Extracts the worker ID portion from a Snowflake ID.
#[must_use]
pub fn extract_worker(id: u64) -> u64 {
    (id >> SEQUENCE_BITS) & WORKER_MASK
}

/// Extracts the sequence portion from a Snowflake ID.
#[must_use]
pub fn extract_sequence(id: u64) -> u64 {
    id & SEQUENCE_MASK
}
