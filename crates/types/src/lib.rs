//! Entity catalog and shared types for the plaza storage layer.
//!
//! This crate provides the foundational pieces used throughout the storage
//! layer:
//! - Typed identifiers and entity records (posts, discussions, topics,
//!   channels, projects, users) with their counter rows
//! - Shape validation applied before any write is attempted
//! - Postcard codec helpers with snafu error handling
//! - Configuration (retry, fan-out, reconciler, validation limits)
//! - Snowflake-style post/event ID generation

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod snowflake;
pub mod types;
pub mod validation;

// Re-export commonly used items at crate root
pub use codec::{CodecError, decode, encode};
pub use config::{
    ConfigError, FanoutConfig, ReconcilerConfig, RetryPolicy, StoreConfig, ValidationConfig,
};
pub use types::*;
pub use validation::ValidationError;
