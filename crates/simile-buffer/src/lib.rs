//! Buffer pool management for the simile engine.
//!
//! This crate provides the page cache that every file access is routed
//! through, together with the transaction machinery built on top of it:
//! - Fixed-capacity page cache with two eviction policies
//! - Page-level strict two-phase shared/exclusive locking with reservations
//! - Wait-for-graph deadlock detection
//! - FORCE / NO-STEAL commit and abort

mod page;
mod pool;

pub use page::{LockMode, Page, PageFile};
pub use pool::BufferPool;
