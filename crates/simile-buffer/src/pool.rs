//! Buffer pool: bounded page cache, page-level 2PL, deadlock detection.
//!
//! The pool is the primary way transactions are enforced. Every page access
//! goes through [`BufferPool::get_page`] under a transaction id and a lock
//! mode; the pool blocks the caller until the lock can be granted, running
//! wait-for-graph deadlock detection while it waits. Commit follows a
//! FORCE / NO-STEAL discipline: committed pages are flushed before locks
//! release, and dirty pages are never evicted, so abort needs no undo log.

use crate::page::{LockMode, Page, PageFile};
use parking_lot::Mutex;
use simile_common::{EngineConfig, PageKey, Result, SimileError, TransactionId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// A lock a transaction holds, has reserved, or is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Lock {
    key: PageKey,
    mode: LockMode,
}

#[derive(Default)]
struct PoolState {
    /// Cached pages, bounded by the pool capacity.
    pages: HashMap<PageKey, Arc<dyn Page>>,
    /// Number of transactions holding a shared lock per page.
    shared_count: HashMap<PageKey, usize>,
    /// Transaction holding or reserving the exclusive lock per page.
    exclusive: HashMap<PageKey, TransactionId>,
    /// Locks each transaction holds or has reserved.
    held_by: HashMap<TransactionId, HashSet<Lock>>,
    /// The single lock each blocked transaction is waiting for.
    waiting_for: HashMap<TransactionId, Lock>,
    /// FIFO insertion order, used by the queue eviction policy.
    evict_queue: VecDeque<PageKey>,
    /// When set, dirty pages may be evicted (index build only).
    steal: bool,
}

impl PoolState {
    fn holds(&self, tid: TransactionId, key: &PageKey, mode: LockMode) -> bool {
        self.held_by
            .get(&tid)
            .map(|locks| {
                locks.contains(&Lock {
                    key: key.clone(),
                    mode,
                })
            })
            .unwrap_or(false)
    }

    /// Depth-first search of the wait-for graph starting from `start`.
    ///
    /// There is an edge t → u when t is waiting for a page whose exclusive
    /// lock u holds or reserves, or when t wants exclusive access and u
    /// holds a shared lock on that page. `start` is deadlocked iff some path
    /// leads back to it. Cycles that do not include `start` are left for
    /// their own participants to discover.
    fn in_cycle(&self, start: TransactionId) -> bool {
        let mut visited = HashSet::new();
        visited.insert(start);
        self.cycle_from(start, start, &mut visited)
    }

    fn cycle_from(
        &self,
        start: TransactionId,
        current: TransactionId,
        visited: &mut HashSet<TransactionId>,
    ) -> bool {
        let Some(waiting) = self.waiting_for.get(&current) else {
            return false;
        };

        if let Some(&holder) = self.exclusive.get(&waiting.key) {
            if holder != current {
                if holder == start {
                    return true;
                }
                if visited.insert(holder) && self.cycle_from(start, holder, visited) {
                    return true;
                }
            }
        }

        if waiting.mode == LockMode::Exclusive {
            let shared = Lock {
                key: waiting.key.clone(),
                mode: LockMode::Shared,
            };
            for (&other, locks) in &self.held_by {
                if other == current || !locks.contains(&shared) {
                    continue;
                }
                if other == start {
                    return true;
                }
                if visited.insert(other) && self.cycle_from(start, other, visited) {
                    return true;
                }
            }
        }
        false
    }

    /// Releases all locks held by `tid` and drops it from every table.
    fn clean_up_transaction(&mut self, tid: TransactionId) {
        if let Some(locks) = self.held_by.remove(&tid) {
            for lock in locks {
                match lock.mode {
                    LockMode::Shared => {
                        if let Some(count) = self.shared_count.get_mut(&lock.key) {
                            *count = count.saturating_sub(1);
                        }
                    }
                    LockMode::Exclusive => {
                        self.exclusive.remove(&lock.key);
                    }
                }
            }
        }
        self.waiting_for.remove(&tid);
    }

    fn remove_from_queue(&mut self, key: &PageKey) {
        self.evict_queue.retain(|k| k != key);
    }

    /// Fullness policy: evict the clean page with the fewest open slots,
    /// breaking out early on a completely full page.
    fn evict_fullest(&mut self) -> Result<()> {
        let mut victim: Option<(PageKey, Arc<dyn Page>)> = None;
        let mut min_open = usize::MAX;

        for (key, page) in &self.pages {
            if page.is_dirty() && !self.steal {
                continue;
            }
            let open = page.open_slots();
            if open <= min_open {
                min_open = open;
                victim = Some((key.clone(), page.clone()));
            }
            if open == 0 {
                break;
            }
        }

        let Some((key, page)) = victim else {
            return Err(SimileError::BufferPoolFull(
                "cannot evict page; all pages are dirty".to_string(),
            ));
        };
        debug!(page = %key, open_slots = min_open, "evicting page");
        page.flush()?;
        self.pages.remove(&key);
        self.remove_from_queue(&key);
        Ok(())
    }

    /// Queue policy: evict the first clean page in FIFO order.
    fn evict_queued(&mut self) -> Result<()> {
        let mut victim = None;
        for key in &self.evict_queue {
            if let Some(page) = self.pages.get(key) {
                if !page.is_dirty() || self.steal {
                    victim = Some((key.clone(), page.clone()));
                    break;
                }
            }
        }

        let Some((key, page)) = victim else {
            return Err(SimileError::BufferPoolFull(
                "cannot evict page; all pages are dirty".to_string(),
            ));
        };
        debug!(page = %key, "evicting page (queue policy)");
        page.flush()?;
        self.pages.remove(&key);
        self.remove_from_queue(&key);
        Ok(())
    }
}

/// Page cache and lock manager, shared by every file in the engine.
pub struct BufferPool {
    capacity: usize,
    config: Arc<EngineConfig>,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Creates a pool caching at most `capacity` pages.
    pub fn new(capacity: usize, config: Arc<EngineConfig>) -> Self {
        Self {
            capacity,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// The maximum number of cached pages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enables or disables eviction of dirty pages.
    ///
    /// Only the offline index builder sets this; with steal enabled the
    /// NO-STEAL guarantee is suspended.
    pub fn set_steal(&self, steal: bool) {
        self.state.lock().steal = steal;
    }

    /// Registers a transaction. Present for symmetry with commit/abort;
    /// transactions are otherwise created implicitly on first access.
    pub fn begin_transaction(&self, _tid: TransactionId) {}

    /// Retrieves a page on behalf of a transaction, blocking until the
    /// requested lock can be granted.
    ///
    /// On a cache miss the page is read through `file`; when the cache is at
    /// capacity a clean page is evicted first. Returns
    /// [`SimileError::Deadlock`] when the caller is part of a wait-for
    /// cycle; if the pool is configured to abort on deadlock, the caller's
    /// transaction has already been aborted when the error returns.
    pub fn get_page(
        &self,
        file: &dyn PageFile,
        page_no: usize,
        tid: TransactionId,
        mode: LockMode,
    ) -> Result<Arc<dyn Page>> {
        let key = file.page_key(page_no);
        let desired = Lock {
            key: key.clone(),
            mode,
        };

        let mut state = self.state.lock();
        state.held_by.entry(tid).or_default();
        state.waiting_for.insert(tid, desired.clone());

        // Block while another transaction holds or reserves the exclusive lock.
        let mut attempts: u32 = 0;
        loop {
            match state.exclusive.get(&key) {
                Some(&holder) if holder != tid => {
                    // If we want shared access and already hold it, the
                    // exclusive holder is a reserver waiting on us; blocking
                    // here would deadlock the protocol against itself.
                    if mode == LockMode::Shared && state.holds(tid, &key, LockMode::Shared) {
                        break;
                    }
                    attempts += 1;
                    if attempts % self.config.cycle_check_interval == 0 && state.in_cycle(tid) {
                        return self.deadlock(state, tid);
                    }
                    drop(state);
                    std::thread::sleep(self.config.block_time);
                    state = self.state.lock();
                }
                _ => break,
            }
        }

        match mode {
            LockMode::Shared => {
                if !state.holds(tid, &key, LockMode::Shared) {
                    *state.shared_count.entry(key.clone()).or_insert(0) += 1;
                    state
                        .held_by
                        .entry(tid)
                        .or_default()
                        .insert(desired.clone());
                }
            }
            LockMode::Exclusive => {
                if self.config.allow_reservations {
                    // Reserve: blocks new shared acquirers, but mutation
                    // rights arrive only once current readers drain.
                    state.exclusive.insert(key.clone(), tid);
                    state
                        .held_by
                        .entry(tid)
                        .or_default()
                        .insert(desired.clone());
                }
                attempts = 0;
                loop {
                    let readers = state.shared_count.get(&key).copied().unwrap_or(0);
                    if readers == 0 {
                        break;
                    }
                    if readers == 1 && state.holds(tid, &key, LockMode::Shared) {
                        break;
                    }
                    attempts += 1;
                    if attempts % self.config.cycle_check_interval == 0 && state.in_cycle(tid) {
                        return self.deadlock(state, tid);
                    }
                    drop(state);
                    std::thread::sleep(self.config.block_time);
                    state = self.state.lock();
                }
                if !self.config.allow_reservations {
                    state.exclusive.insert(key.clone(), tid);
                    state.held_by.entry(tid).or_default().insert(desired);
                }
            }
        }
        state.waiting_for.remove(&tid);

        if let Some(page) = state.pages.get(&key) {
            return Ok(page.clone());
        }

        // The global mutex is not held across file I/O, so a racing reader
        // may have cached the page by the time we return; re-check.
        drop(state);
        let page = file.read_page(page_no)?;
        let mut state = self.state.lock();
        if let Some(existing) = state.pages.get(&key) {
            return Ok(existing.clone());
        }

        if state.pages.len() >= self.capacity {
            if self.config.use_evict_queue {
                state.evict_queued()?;
            } else {
                state.evict_fullest()?;
            }
        }
        state.pages.insert(key.clone(), page.clone());
        state.evict_queue.push_back(key);
        Ok(page)
    }

    fn deadlock(
        &self,
        state: parking_lot::MutexGuard<'_, PoolState>,
        tid: TransactionId,
    ) -> Result<Arc<dyn Page>> {
        warn!(%tid, "deadlock detected");
        if self.config.abort_on_deadlock {
            drop(state);
            self.abort(tid);
            std::thread::sleep(self.config.block_time);
        }
        Err(SimileError::Deadlock)
    }

    /// Commits a transaction: flushes every page it holds exclusively
    /// (FORCE), then releases its locks.
    ///
    /// Panics if a flush fails; with no write-ahead log there is no
    /// recovery path for a commit-time I/O error.
    pub fn commit(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        let exclusive_keys: Vec<PageKey> = state
            .held_by
            .get(&tid)
            .map(|locks| {
                locks
                    .iter()
                    .filter(|l| l.mode == LockMode::Exclusive)
                    .map(|l| l.key.clone())
                    .collect()
            })
            .unwrap_or_default();

        for key in exclusive_keys {
            // A clean page may have been evicted out from under the
            // exclusive lock, so absence from the cache is fine.
            if let Some(page) = state.pages.get(&key) {
                if let Err(e) = page.flush() {
                    panic!("unable to flush page {key} while committing {tid}: {e}");
                }
            }
        }
        state.clean_up_transaction(tid);
    }

    /// Aborts a transaction: drops every page it holds exclusively from the
    /// cache (NO-STEAL guarantees none of them reached disk), then releases
    /// its locks.
    pub fn abort(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        let exclusive_keys: Vec<PageKey> = state
            .held_by
            .get(&tid)
            .map(|locks| {
                locks
                    .iter()
                    .filter(|l| l.mode == LockMode::Exclusive)
                    .map(|l| l.key.clone())
                    .collect()
            })
            .unwrap_or_default();

        for key in exclusive_keys {
            state.pages.remove(&key);
            state.remove_from_queue(&key);
        }
        state.clean_up_transaction(tid);
    }

    /// Flushes every cached page. Test and shutdown helper; not
    /// transaction-safe.
    pub fn flush_all_pages(&self) -> Result<()> {
        let state = self.state.lock();
        for page in state.pages.values() {
            page.flush()?;
        }
        Ok(())
    }

    /// Empties the page cache without flushing. Used after a clustered
    /// index build invalidates cached pages by renaming files.
    pub fn clear_all_pages(&self) {
        let mut state = self.state.lock();
        state.pages.clear();
        state.evict_queue.clear();
    }

    /// Whether the given page is currently cached.
    pub fn has_page_cached(&self, file: &dyn PageFile, page_no: usize) -> bool {
        self.state.lock().pages.contains_key(&file.page_key(page_no))
    }

    /// Number of pages currently cached.
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    // Introspection used by invariant tests.

    /// Number of transactions holding a shared lock on the page.
    pub fn shared_lock_count(&self, key: &PageKey) -> usize {
        self.state.lock().shared_count.get(key).copied().unwrap_or(0)
    }

    /// The transaction holding or reserving the exclusive lock, if any.
    pub fn exclusive_holder(&self, key: &PageKey) -> Option<TransactionId> {
        self.state.lock().exclusive.get(key).copied()
    }

    /// Number of locks the transaction currently holds or has reserved.
    pub fn locks_held(&self, tid: TransactionId) -> usize {
        self.state
            .lock()
            .held_by
            .get(&tid)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Whether the transaction is recorded as waiting for a lock.
    pub fn is_waiting(&self, tid: TransactionId) -> bool {
        self.state.lock().waiting_for.contains_key(&tid)
    }
}
