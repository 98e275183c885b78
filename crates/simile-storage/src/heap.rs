//! Heap file: an unordered collection of rows stored as a sequence of
//! slotted pages, with all page access routed through the buffer pool.

use crate::embed::Embedder;
use crate::page::HeapPage;
use crate::source::{Operator, RowSource};
use crate::tuple::{RecordId, Tuple, TupleDesc};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use simile_buffer::{BufferPool, LockMode, Page, PageFile};
use simile_common::{EngineConfig, Result, SimileError, TransactionId, PAGE_SIZE};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::debug;

/// A secondary structure maintained alongside a heap file.
///
/// The heap forwards every insert and delete to its attached indexes; a
/// clustered index goes further and takes over insertion entirely, because
/// its data file IS the table's backing file.
pub trait SecondaryIndex: Send + Sync {
    /// The indexed column name.
    fn indexed_column(&self) -> &str;

    /// Whether the index owns the table's physical layout.
    fn is_clustered(&self) -> bool;

    /// Adds a row to the index. For clustered indexes this also stores the
    /// row and assigns its record identity.
    fn insert_tuple(&self, t: &mut Tuple, tid: TransactionId) -> Result<()>;

    /// Removes a row from the index.
    fn delete_tuple(&self, t: &Tuple, tid: TransactionId) -> Result<()>;
}

/// An unordered collection of rows backed by one file.
pub struct HeapFile {
    file_name: String,
    desc: TupleDesc,
    pool: Arc<BufferPool>,
    config: Arc<EngineConfig>,
    embedder: Arc<dyn Embedder>,
    /// Memoizes which pages are known full; a page defaults to not-full
    /// until first observed.
    page_full: Mutex<HashMap<usize, bool>>,
    /// Indexes by column name; at most one index per column.
    indexes: RwLock<HashMap<String, Arc<dyn SecondaryIndex>>>,
}

impl HeapFile {
    /// Opens (creating if absent) a heap file.
    pub fn new(
        file_name: impl Into<String>,
        desc: TupleDesc,
        pool: Arc<BufferPool>,
        config: Arc<EngineConfig>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        let file_name = file_name.into();
        // Validate the descriptor fits a page before any row arrives.
        desc.slots_per_page(config.embedding_dim)?;
        if !std::path::Path::new(&file_name).exists() {
            std::fs::File::create(&file_name)?;
        }
        Ok(Arc::new(Self {
            file_name,
            desc,
            pool,
            config,
            embedder,
            page_full: Mutex::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
        }))
    }

    /// The path of the backing file.
    pub fn name(&self) -> &str {
        &self.file_name
    }

    /// The row descriptor of this file.
    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    /// The buffer pool this file's pages go through.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The engine configuration.
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// The embedding client used for embedded-text fields.
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    fn dim(&self) -> usize {
        self.config.embedding_dim
    }

    /// Attaches an index for a column, replacing any previous one.
    pub fn attach_index(&self, index: Arc<dyn SecondaryIndex>) {
        self.indexes
            .write()
            .insert(index.indexed_column().to_string(), index);
    }

    /// The index attached for `column`, if any.
    pub fn index_for(&self, column: &str) -> Option<Arc<dyn SecondaryIndex>> {
        self.indexes.read().get(column).cloned()
    }

    fn clustered_index(&self) -> Result<Option<Arc<dyn SecondaryIndex>>> {
        let indexes = self.indexes.read();
        let mut found: Option<Arc<dyn SecondaryIndex>> = None;
        for index in indexes.values() {
            if index.is_clustered() {
                if found.is_some() {
                    return Err(SimileError::IncompatibleTypes(
                        "multiple clustered indexes on one table".to_string(),
                    ));
                }
                found = Some(index.clone());
            }
        }
        Ok(found)
    }

    /// Size of the backing file in bytes.
    pub fn file_byte_size(&self) -> usize {
        std::fs::metadata(&self.file_name)
            .map(|m| m.len() as usize)
            .unwrap_or(0)
    }

    /// Number of pages: ceil(file size / PAGE_SIZE).
    pub fn num_pages(&self) -> usize {
        let size = self.file_byte_size();
        if size == 0 {
            0
        } else {
            1 + (size - 1) / PAGE_SIZE
        }
    }

    /// Row-count estimate assuming every page is full. No I/O.
    pub fn approximate_num_tuples(&self) -> usize {
        self.desc
            .slots_per_page(self.dim())
            .map(|slots| slots * self.num_pages())
            .unwrap_or(0)
    }

    /// Exact row count; reads every page under a shared lock.
    pub fn num_tuples(&self, tid: TransactionId) -> Result<usize> {
        let mut count = 0;
        for page_no in 0..self.num_pages() {
            let hp = self.get_heap_page(page_no, tid, LockMode::Shared)?;
            count += hp.total_slots() - hp.open_slots();
        }
        Ok(count)
    }

    fn is_page_marked_full(&self, page_no: usize) -> bool {
        self.page_full.lock().get(&page_no).copied().unwrap_or(false)
    }

    fn mark_page_full(&self, page_no: usize, full: bool) {
        self.page_full.lock().insert(page_no, full);
    }

    /// Fetches a page through the buffer pool and downcasts it.
    pub fn get_heap_page(
        &self,
        page_no: usize,
        tid: TransactionId,
        mode: LockMode,
    ) -> Result<Arc<HeapPage>> {
        let page = self.pool.get_page(self, page_no, tid, mode)?;
        page.into_any()
            .downcast::<HeapPage>()
            .map_err(|_| SimileError::IllegalOperation("cached page is not a heap page".to_string()))
    }

    /// Finds a page with an open slot for insertion, taking it in exclusive
    /// mode.
    ///
    /// Pages are probed from the highest number downward, skipping pages
    /// memoized as full; pages already resident in the pool are tried
    /// first, so a transaction prefers pages it may already hold under the
    /// same lock. If every page is full, the file is extended by one page —
    /// the exclusive lock on the new page number serializes racing
    /// extenders, so losing the race means retrying from the top.
    fn page_for_insert(&self, tid: TransactionId) -> Result<Arc<HeapPage>> {
        loop {
            for cached_only in [true, false] {
                for page_no in (0..=self.num_pages()).rev() {
                    if self.is_page_marked_full(page_no) {
                        continue;
                    }
                    if cached_only && !self.pool.has_page_cached(self, page_no) {
                        continue;
                    }
                    match self.get_heap_page(page_no, tid, LockMode::Exclusive) {
                        Ok(hp) if hp.open_slots() > 0 => return Ok(hp),
                        Ok(_) => {}
                        Err(SimileError::Deadlock) => return Err(SimileError::Deadlock),
                        Err(_) => {}
                    }
                }
            }

            let new_page_no = self.num_pages();
            match self.get_heap_page(new_page_no, tid, LockMode::Exclusive) {
                Ok(hp) => {
                    // Another transaction created this page first.
                    if hp.open_slots() > 0 {
                        return Ok(hp);
                    }
                    // Already full; retry from the top.
                }
                Err(SimileError::IllegalOperation(_)) => {
                    // The page does not exist yet and we hold the exclusive
                    // lock on its number: create it.
                    let page = HeapPage::new(self.desc.clone(), self.dim(), new_page_no, &self.file_name)?;
                    page.flush()?;
                    debug!(file = %self.file_name, page_no = new_page_no, "extended heap file");
                    return self.get_heap_page(new_page_no, tid, LockMode::Exclusive);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn insert_into(&self, hp: &Arc<HeapPage>, t: &mut Tuple, tid: TransactionId) -> Result<()> {
        let rid = hp.insert_tuple(t)?;
        t.rid = Some(rid);
        self.mark_page_full(hp.page_no(), hp.open_slots() == 0);

        let indexes: Vec<_> = self.indexes.read().values().cloned().collect();
        for index in indexes {
            if index.is_clustered() {
                continue;
            }
            index.insert_tuple(t, tid)?;
        }
        Ok(())
    }

    /// Adds a row to the file.
    ///
    /// Embeddings are generated for every embedded-text field first,
    /// mutating the row in place. If a clustered index is attached, the
    /// insert is delegated to it wholesale (its data file is this file).
    pub fn insert_tuple(&self, t: &mut Tuple, tid: TransactionId) -> Result<()> {
        for value in &mut t.values {
            if let Value::EmbeddedText { text, embedding } = value {
                *embedding = self.embedder.embed(text)?;
            }
        }

        if let Some(clustered) = self.clustered_index()? {
            return clustered.insert_tuple(t, tid);
        }

        let hp = self.page_for_insert(tid)?;
        self.insert_into(&hp, t, tid)
    }

    /// Adds a row to a specific page, failing with `PageFull` if it has no
    /// open slot. Embeddings must already be present.
    pub fn insert_tuple_into_page(
        &self,
        t: &mut Tuple,
        page_no: usize,
        tid: TransactionId,
    ) -> Result<()> {
        let hp = self.get_heap_page(page_no, tid, LockMode::Exclusive)?;
        if hp.open_slots() == 0 {
            return Err(SimileError::PageFull);
        }
        self.insert_into(&hp, t, tid)
    }

    /// Extends the file by one empty page and returns its number, holding
    /// the exclusive lock on it.
    pub fn allocate_new_page(&self, tid: TransactionId) -> Result<usize> {
        Ok(self.make_new_page(tid)?.1)
    }

    fn make_new_page(&self, tid: TransactionId) -> Result<(Arc<HeapPage>, usize)> {
        loop {
            let new_page_no = self.num_pages();
            match self.get_heap_page(new_page_no, tid, LockMode::Exclusive) {
                // Another transaction created this page already; a later
                // number is needed.
                Ok(_) => continue,
                Err(SimileError::IllegalOperation(_)) => {
                    let page =
                        HeapPage::new(self.desc.clone(), self.dim(), new_page_no, &self.file_name)?;
                    page.flush()?;
                    let hp = self.get_heap_page(new_page_no, tid, LockMode::Exclusive)?;
                    return Ok((hp, new_page_no));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Adds a row to a freshly allocated page and returns the page number.
    pub fn insert_tuple_into_new_page(&self, t: &mut Tuple, tid: TransactionId) -> Result<usize> {
        let (hp, page_no) = self.make_new_page(tid)?;
        if hp.open_slots() == 0 {
            return Err(SimileError::PageFull);
        }
        self.insert_into(&hp, t, tid)?;
        Ok(page_no)
    }

    /// Returns the row with the given identity.
    pub fn find_tuple(&self, rid: &RecordId, tid: TransactionId) -> Result<Tuple> {
        let RecordId::Heap { file, page_no, .. } = rid;
        if file != &self.file_name {
            return Err(SimileError::TupleNotFound(
                "record does not belong to this file".to_string(),
            ));
        }
        let hp = self.get_heap_page(*page_no, tid, LockMode::Shared)?;
        hp.find_tuple(rid)
    }

    /// Removes a row located by its record identity, forwarding the delete
    /// to every attached index.
    pub fn delete_tuple(&self, t: &Tuple, tid: TransactionId) -> Result<()> {
        let rid = t.rid.as_ref().ok_or_else(|| {
            SimileError::TupleNotFound("tuple carries no record identity".to_string())
        })?;
        let RecordId::Heap { file, page_no, .. } = rid;
        if file != &self.file_name {
            return Err(SimileError::TupleNotFound(
                "record does not belong to this file".to_string(),
            ));
        }
        let hp = self.get_heap_page(*page_no, tid, LockMode::Exclusive)?;
        hp.delete_tuple(rid)?;
        self.mark_page_full(*page_no, false);

        let indexes: Vec<_> = self.indexes.read().values().cloned().collect();
        for index in indexes {
            index.delete_tuple(t, tid)?;
        }
        Ok(())
    }
}

impl PageFile for HeapFile {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn read_page(&self, page_no: usize) -> Result<Arc<dyn Page>> {
        if page_no >= self.num_pages() {
            return Err(SimileError::IllegalOperation(format!(
                "cannot read nonexistent page {page_no} of {}",
                self.file_name
            )));
        }
        let mut file = OpenOptions::new().read(true).open(&self.file_name)?;
        file.seek(SeekFrom::Start((page_no * PAGE_SIZE) as u64))?;
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let page = HeapPage::from_bytes(&buf, &self.desc, self.dim(), page_no, &self.file_name)?;
        self.mark_page_full(page_no, page.open_slots() == 0);
        Ok(Arc::new(page))
    }
}

impl Operator for HeapFile {
    fn descriptor(&self) -> TupleDesc {
        self.desc.clone()
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        Ok(Box::new(HeapScan {
            file: self,
            tid,
            page_no: 0,
            pending: std::collections::VecDeque::new(),
        }))
    }
}

/// Sequential scan over all pages of a heap file in shared mode.
struct HeapScan {
    file: Arc<HeapFile>,
    tid: TransactionId,
    page_no: usize,
    pending: std::collections::VecDeque<Tuple>,
}

impl RowSource for HeapScan {
    fn next(&mut self) -> Result<Option<Tuple>> {
        loop {
            if let Some(t) = self.pending.pop_front() {
                return Ok(Some(t));
            }
            if self.page_no >= self.file.num_pages() {
                return Ok(None);
            }
            let hp = self
                .file
                .get_heap_page(self.page_no, self.tid, LockMode::Shared)?;
            self.page_no += 1;
            self.pending = hp.tuples().into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::source::collect_rows;
    use crate::tuple::FieldDesc;
    use crate::value::DataType;
    use tempfile::TempDir;

    fn desc() -> TupleDesc {
        TupleDesc::new(vec![
            FieldDesc::new("name", DataType::Text),
            FieldDesc::new("age", DataType::Int),
        ])
    }

    fn row(name: &str, age: i64) -> Tuple {
        Tuple::new(desc(), vec![Value::Text(name.into()), Value::Int(age)])
    }

    fn test_file(dir: &TempDir, pool_pages: usize) -> Arc<HeapFile> {
        let config = Arc::new(EngineConfig::for_tests());
        let pool = Arc::new(BufferPool::new(pool_pages, config.clone()));
        let path = dir.path().join("t.dat");
        HeapFile::new(
            path.to_string_lossy().into_owned(),
            desc(),
            pool,
            config.clone(),
            Arc::new(HashEmbedder::new(config.embedding_dim)),
        )
        .unwrap()
    }

    #[test]
    fn test_new_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);
        assert_eq!(hf.num_pages(), 0);
        assert_eq!(hf.file_byte_size(), 0);
    }

    #[test]
    fn test_insert_sets_rid_and_creates_page() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);
        let tid = TransactionId::new();

        let mut t = row("alice", 30);
        hf.insert_tuple(&mut t, tid).unwrap();
        hf.pool().commit(tid);

        assert_eq!(hf.num_pages(), 1);
        assert!(matches!(
            t.rid,
            Some(RecordId::Heap { page_no: 0, slot_no: 0, .. })
        ));
    }

    #[test]
    fn test_insert_and_scan() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);
        let tid = TransactionId::new();

        for i in 0..10 {
            let mut t = row("p", i);
            hf.insert_tuple(&mut t, tid).unwrap();
        }
        hf.pool().commit(tid);

        let tid2 = TransactionId::new();
        let rows = collect_rows(hf.clone().iterator(tid2).unwrap()).unwrap();
        assert_eq!(rows.len(), 10);
        for (i, t) in rows.iter().enumerate() {
            assert_eq!(t.values[1], Value::Int(i as i64));
            assert!(t.rid.is_some());
        }
        hf.pool().commit(tid2);
    }

    #[test]
    fn test_rows_survive_commit_and_reload() {
        let dir = TempDir::new().unwrap();
        let path;
        {
            let hf = test_file(&dir, 10);
            path = hf.name().to_string();
            let tid = TransactionId::new();
            for i in 0..5 {
                let mut t = row("p", i);
                hf.insert_tuple(&mut t, tid).unwrap();
            }
            hf.pool().commit(tid);
        }

        // Fresh pool and file handle over the same bytes.
        let config = Arc::new(EngineConfig::for_tests());
        let pool = Arc::new(BufferPool::new(10, config.clone()));
        let hf = HeapFile::new(
            path,
            desc(),
            pool,
            config.clone(),
            Arc::new(HashEmbedder::new(config.embedding_dim)),
        )
        .unwrap();
        let tid = TransactionId::new();
        let rows = collect_rows(hf.clone().iterator(tid).unwrap()).unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn test_delete_tuple() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);
        let tid = TransactionId::new();

        let mut t = row("gone", 1);
        hf.insert_tuple(&mut t, tid).unwrap();
        let mut stay = row("stay", 2);
        hf.insert_tuple(&mut stay, tid).unwrap();

        hf.delete_tuple(&t, tid).unwrap();
        hf.pool().commit(tid);

        let tid2 = TransactionId::new();
        let rows = collect_rows(hf.clone().iterator(tid2).unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[0], Value::Text("stay".to_string()));
    }

    #[test]
    fn test_delete_without_rid_fails() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);
        let t = row("no rid", 1);
        assert!(matches!(
            hf.delete_tuple(&t, TransactionId::new()),
            Err(SimileError::TupleNotFound(_))
        ));
    }

    #[test]
    fn test_insert_spans_pages() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);
        let tid = TransactionId::new();

        let per_page = desc().slots_per_page(4).unwrap();
        for i in 0..(per_page + 1) {
            let mut t = row("x", i as i64);
            hf.insert_tuple(&mut t, tid).unwrap();
        }
        hf.pool().commit(tid);

        assert_eq!(hf.num_pages(), 2);
        assert_eq!(hf.num_tuples(TransactionId::new()).unwrap(), per_page + 1);
    }

    #[test]
    fn test_abort_discards_insert() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);

        let tid = TransactionId::new();
        let mut t1 = row("committed", 1);
        hf.insert_tuple(&mut t1, tid).unwrap();
        hf.pool().commit(tid);

        let tid2 = TransactionId::new();
        let mut t2 = row("aborted", 2);
        hf.insert_tuple(&mut t2, tid2).unwrap();
        hf.pool().abort(tid2);

        let tid3 = TransactionId::new();
        let rows = collect_rows(hf.clone().iterator(tid3).unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[0], Value::Text("committed".to_string()));
    }

    #[test]
    fn test_embeddings_generated_on_insert() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(EngineConfig::for_tests());
        let pool = Arc::new(BufferPool::new(10, config.clone()));
        let tweet_desc = TupleDesc::new(vec![FieldDesc::new("content", DataType::EmbeddedText)]);
        let hf = HeapFile::new(
            dir.path().join("tweets.dat").to_string_lossy().into_owned(),
            tweet_desc.clone(),
            pool,
            config.clone(),
            Arc::new(HashEmbedder::new(4)),
        )
        .unwrap();

        let tid = TransactionId::new();
        let mut t = Tuple::new(
            tweet_desc,
            vec![Value::EmbeddedText {
                text: "hello world".into(),
                embedding: vec![],
            }],
        );
        hf.insert_tuple(&mut t, tid).unwrap();
        hf.pool().commit(tid);

        let rows = collect_rows(hf.clone().iterator(TransactionId::new()).unwrap()).unwrap();
        let embedding = rows[0].values[0].embedding().unwrap();
        assert_eq!(embedding.len(), 4);
        assert_eq!(
            embedding,
            HashEmbedder::new(4).embed("hello world").unwrap().as_slice()
        );
    }

    #[test]
    fn test_approximate_num_tuples() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);
        assert_eq!(hf.approximate_num_tuples(), 0);

        let tid = TransactionId::new();
        let mut t = row("a", 1);
        hf.insert_tuple(&mut t, tid).unwrap();
        hf.pool().commit(tid);

        assert_eq!(
            hf.approximate_num_tuples(),
            desc().slots_per_page(4).unwrap()
        );
    }

    #[test]
    fn test_insert_reuses_deleted_space() {
        let dir = TempDir::new().unwrap();
        let hf = test_file(&dir, 10);
        let tid = TransactionId::new();

        let mut t = row("a", 1);
        hf.insert_tuple(&mut t, tid).unwrap();
        hf.delete_tuple(&t, tid).unwrap();
        let mut t2 = row("b", 2);
        hf.insert_tuple(&mut t2, tid).unwrap();
        hf.pool().commit(tid);

        assert_eq!(hf.num_pages(), 1);
    }
}
