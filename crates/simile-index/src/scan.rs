//! NN scan: probe-driven retrieval of similarity-ranked rows.

use crate::index_file::{CentroidPages, IndexKind, NnIndexFile};
use simile_buffer::LockMode;
use simile_common::{Result, SimileError, TransactionId};
use simile_exec::Expr;
use simile_storage::{HeapFile, Operator, RecordId, RowSource, Tuple, TupleDesc, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Scan operator for `ORDER BY ailike(col, query) LIMIT k` plans.
///
/// Yields the rows of the probed centroids' data pages: a probabilistic
/// superset of the true top-k. The exact ordering and cutoff are the job
/// of the ORDER BY and LIMIT operators planned above this scan.
pub struct NnScan {
    heap: Arc<HeapFile>,
    index: Arc<NnIndexFile>,
    query: Vec<f64>,
    limit: usize,
    ascending: bool,
}

impl NnScan {
    /// Creates a scan of `heap` through `index`.
    ///
    /// `limit` must be a constant integer expression (the plan's LIMIT);
    /// `query` must carry an embedding. `ascending` = most similar first.
    pub fn new(
        heap: Arc<HeapFile>,
        index: Arc<NnIndexFile>,
        limit: &Expr,
        query: &Value,
        ascending: bool,
    ) -> Result<NnScan> {
        let query = query
            .embedding()
            .ok_or_else(|| {
                SimileError::IncompatibleTypes(
                    "similarity query value carries no embedding".to_string(),
                )
            })?
            .to_vec();
        let limit = limit.eval_const()?.as_int()?.max(0) as usize;
        Ok(NnScan {
            heap,
            index,
            query,
            limit,
            ascending,
        })
    }

    /// Probe budget: `k / avg_cluster_size + default_probe`, assuming
    /// uniformly sized clusters.
    pub fn num_probes(&self, tid: TransactionId) -> Result<usize> {
        let n_centroids = self.index.n_centroids(tid)?.max(1);
        let n_tuples = self.heap.approximate_num_tuples();
        let avg_cluster_size = (n_tuples / n_centroids).max(1);
        Ok(self.limit / avg_cluster_size + self.heap.config().default_probe)
    }
}

impl Operator for NnScan {
    fn descriptor(&self) -> TupleDesc {
        self.heap.descriptor()
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        let probes = self.num_probes(tid)?;
        debug!(probes, limit = self.limit, "starting nn scan");
        let pages = self
            .index
            .centroid_page_iter(&self.query, self.ascending, tid, probes as isize)?;
        Ok(Box::new(NnScanSource {
            scan: self,
            tid,
            pages,
            pending: VecDeque::new(),
        }))
    }
}

struct NnScanSource {
    scan: Arc<NnScan>,
    tid: TransactionId,
    pages: CentroidPages,
    pending: VecDeque<Tuple>,
}

impl RowSource for NnScanSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        loop {
            while let Some(entry) = self.pending.pop_front() {
                if self.scan.index.kind() == IndexKind::Clustered {
                    return Ok(Some(entry));
                }
                // Unclustered: resolve the (page, slot) reference back
                // through the table file. Entries for rows that vanished
                // under index open question semantics are skipped.
                let rid = RecordId::Heap {
                    file: self.scan.heap.name().to_string(),
                    page_no: entry.values[1].as_int()? as usize,
                    slot_no: entry.values[2].as_int()? as usize,
                };
                match self.scan.heap.find_tuple(&rid, self.tid) {
                    Ok(row) => return Ok(Some(row)),
                    Err(SimileError::TupleNotFound(_)) | Err(SimileError::IllegalOperation(_)) => {
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            match self.pages.next()? {
                Some((_, page_no)) => {
                    let page = self.scan.index.data_file().get_heap_page(
                        page_no,
                        self.tid,
                        LockMode::Shared,
                    )?;
                    self.pending = page.tuples().into();
                }
                None => return Ok(None),
            }
        }
    }
}
