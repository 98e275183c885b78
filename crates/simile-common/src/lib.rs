//! Simile common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all simile components.

pub mod config;
pub mod error;
pub mod key;
pub mod txn;

pub use config::{EngineConfig, PAGE_SIZE, STRING_LEN, TEXT_CHAR_LEN};
pub use error::{Result, SimileError};
pub use key::PageKey;
pub use txn::TransactionId;
