//! The seam between the buffer pool and the storage layer.
//!
//! The pool caches pages and talks to files without knowing their concrete
//! types; storage-layer callers downcast the returned page back to the type
//! their file produced.

use simile_common::{PageKey, Result};
use std::any::Any;
use std::sync::Arc;

/// Lock modes for page access under two-phase locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared (read) access; any number of transactions may hold it.
    Shared,
    /// Exclusive (write) access; at most one transaction holds or reserves it.
    Exclusive,
}

/// A page cached by the buffer pool.
///
/// Pages are shared, interior-mutable objects: the pool hands out clones of
/// the same `Arc` to every transaction that locks the page, and the locking
/// protocol serializes mutation.
pub trait Page: Send + Sync {
    /// The cache key for this page.
    fn key(&self) -> PageKey;

    /// Whether the page has unflushed modifications.
    fn is_dirty(&self) -> bool;

    /// Sets or clears the dirty flag.
    fn set_dirty(&self, dirty: bool);

    /// Number of free row slots; the fullness eviction policy prefers
    /// evicting pages with the fewest.
    fn open_slots(&self) -> usize;

    /// Writes the page back to its file.
    fn flush(&self) -> Result<()>;

    /// Upcast for downcasting to the concrete page type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A file whose pages can be cached by the buffer pool.
pub trait PageFile: Send + Sync {
    /// Path of the backing file; used to build page keys.
    fn file_name(&self) -> &str;

    /// Reads the given page from disk.
    ///
    /// Called by the pool on a cache miss; the pool's global mutex is not
    /// held across this call.
    fn read_page(&self, page_no: usize) -> Result<Arc<dyn Page>>;

    /// The cache key for a page of this file.
    fn page_key(&self, page_no: usize) -> PageKey {
        PageKey::new(self.file_name(), page_no)
    }
}
