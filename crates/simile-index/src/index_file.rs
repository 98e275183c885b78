//! The NN index file: three coupled heap files implementing an IVF-style
//! index over one embedded column of one table.

use simile_buffer::LockMode;
use simile_common::{Result, SimileError, TransactionId};
use simile_exec::{EquiJoin, Expr, LimitOp, OrderBy, Project};
use simile_storage::{
    DataType, FieldDesc, HeapFile, Operator, RecordId, RowSource, SecondaryIndex, Tuple, TupleDesc,
    Value,
};
use std::sync::Arc;
use tracing::debug;

/// Index layout variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// The data file IS the table's backing file; rows are physically
    /// grouped by centroid.
    Clustered,
    /// The data file holds `(vector, page, slot)` references into the
    /// table.
    Secondary,
}

impl IndexKind {
    /// The prefix used in index file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Clustered => "clustered",
            IndexKind::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptor of the unclustered data file: one entry per table row.
pub fn data_desc() -> TupleDesc {
    TupleDesc::new(vec![
        FieldDesc::new("vector", DataType::Vector),
        FieldDesc::new("table_page_no", DataType::Int),
        FieldDesc::new("slot_no", DataType::Int),
    ])
}

/// Descriptor of the centroid file: one row per centroid.
pub fn centroid_desc() -> TupleDesc {
    TupleDesc::new(vec![
        FieldDesc::new("vector", DataType::Vector),
        FieldDesc::new("centroid_id", DataType::Int),
    ])
}

/// Descriptor of the mapping file: data pages per centroid, many-to-one.
pub fn mapping_desc() -> TupleDesc {
    TupleDesc::new(vec![
        FieldDesc::new("centroid_id", DataType::Int),
        FieldDesc::new("index_page_no", DataType::Int),
    ])
}

/// Nearest-neighbor index over one embedded column of one table.
pub struct NnIndexFile {
    table_file_name: String,
    indexed_col: String,
    kind: IndexKind,
    data: Arc<HeapFile>,
    centroids: Arc<HeapFile>,
    mapping: Arc<HeapFile>,
}

impl NnIndexFile {
    pub fn new(
        table_file_name: impl Into<String>,
        indexed_col: impl Into<String>,
        kind: IndexKind,
        data: Arc<HeapFile>,
        centroids: Arc<HeapFile>,
        mapping: Arc<HeapFile>,
    ) -> Arc<NnIndexFile> {
        Arc::new(NnIndexFile {
            table_file_name: table_file_name.into(),
            indexed_col: indexed_col.into(),
            kind,
            data,
            centroids,
            mapping,
        })
    }

    /// The index layout variant.
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// The heap file holding the index entries (the table file itself for
    /// a clustered index).
    pub fn data_file(&self) -> &Arc<HeapFile> {
        &self.data
    }

    /// The heap file holding one `(vector, centroid_id)` row per centroid.
    pub fn centroid_file(&self) -> &Arc<HeapFile> {
        &self.centroids
    }

    /// The heap file mapping centroid ids to data pages.
    pub fn mapping_file(&self) -> &Arc<HeapFile> {
        &self.mapping
    }

    /// Number of centroids in the index.
    pub fn n_centroids(&self, tid: TransactionId) -> Result<usize> {
        self.centroids.num_tuples(tid)
    }

    /// Opens an iterator of `(centroid_id, data_page_no)` pairs ordered by
    /// centroid-to-query distance (`ascending` = nearest first), visiting
    /// at most `probes` centroids when `probes > 0` (all otherwise).
    ///
    /// Planned as a small operator tree over the centroid and mapping
    /// files: project the similarity score, order by it, limit to the
    /// probe budget, join with the mapping file.
    pub fn centroid_page_iter(
        &self,
        query: &[f64],
        ascending: bool,
        tid: TransactionId,
        probes: isize,
    ) -> Result<CentroidPages> {
        let centroid_id = Expr::field("centroid_id", DataType::Int);
        let score = Expr::ailike(
            FieldDesc::new("vector", DataType::Vector),
            Value::Vector(query.to_vec()),
        );
        let project = Arc::new(Project::new(
            vec![centroid_id.clone(), score],
            vec!["centroid_id".to_string(), "dist".to_string()],
            false,
            self.centroids.clone(),
        )?);
        let order = Arc::new(OrderBy::new(
            vec![Expr::field("dist", DataType::Int)],
            vec![ascending],
            project,
        )?);
        let ranked: Arc<dyn Operator> = if probes > 0 {
            Arc::new(LimitOp::new(
                Expr::Const(Value::Int(probes as i64)),
                order,
            ))
        } else {
            order
        };
        // One centroid per join block keeps the distance ordering across
        // the joined output.
        let join = Arc::new(EquiJoin::new(
            ranked,
            centroid_id.clone(),
            self.mapping.clone(),
            centroid_id,
            1,
        )?);
        Ok(CentroidPages {
            source: join.iterator(tid)?,
        })
    }

    fn indexed_embedding(&self, t: &Tuple) -> Result<Vec<f64>> {
        let i = t
            .desc
            .fields
            .iter()
            .position(|f| f.name == self.indexed_col)
            .ok_or_else(|| {
                SimileError::IncompatibleTypes(format!(
                    "tuple does not contain indexed column '{}'",
                    self.indexed_col
                ))
            })?;
        t.values[i].embedding().map(|e| e.to_vec()).ok_or_else(|| {
            SimileError::IncompatibleTypes(format!(
                "indexed column '{}' carries no embedding",
                self.indexed_col
            ))
        })
    }

    fn entry_for(&self, t: &Tuple, emb: &[f64]) -> Result<Tuple> {
        let Some(RecordId::Heap {
            file,
            page_no,
            slot_no,
        }) = &t.rid
        else {
            return Err(SimileError::TupleNotFound(
                "tuple carries no record identity".to_string(),
            ));
        };
        if file != &self.table_file_name {
            return Err(SimileError::IncompatibleTypes(
                "index does not match the tuple's table".to_string(),
            ));
        }
        Ok(Tuple::new(
            data_desc(),
            vec![
                Value::Vector(emb.to_vec()),
                Value::Int(*page_no as i64),
                Value::Int(*slot_no as i64),
            ],
        ))
    }
}

impl SecondaryIndex for NnIndexFile {
    fn indexed_column(&self) -> &str {
        &self.indexed_col
    }

    fn is_clustered(&self) -> bool {
        self.kind == IndexKind::Clustered
    }

    /// Routes the row to a data page of its nearest centroid, spilling to
    /// a fresh page (recorded in the mapping file) when they are full.
    fn insert_tuple(&self, t: &mut Tuple, tid: TransactionId) -> Result<()> {
        let emb = self.indexed_embedding(t)?;
        let mut pages = self.centroid_page_iter(&emb, true, tid, 1)?;
        let mut last_centroid: Option<i64> = None;

        while let Some((centroid_id, page_no)) = pages.next()? {
            last_centroid = Some(centroid_id);
            let result = match self.kind {
                IndexKind::Clustered => self.data.insert_tuple_into_page(t, page_no, tid),
                IndexKind::Secondary => {
                    let mut entry = self.entry_for(t, &emb)?;
                    self.data.insert_tuple_into_page(&mut entry, page_no, tid)
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(SimileError::PageFull) => continue,
                Err(e) => return Err(e),
            }
        }

        // Every page of the nearest centroid is full; overflow to a new
        // page and record it in the mapping file.
        let centroid_id = last_centroid.ok_or(SimileError::UnknownCluster(-1))?;
        let new_page_no = match self.kind {
            IndexKind::Clustered => self.data.insert_tuple_into_new_page(t, tid)?,
            IndexKind::Secondary => {
                let mut entry = self.entry_for(t, &emb)?;
                self.data.insert_tuple_into_new_page(&mut entry, tid)?
            }
        };
        debug!(
            centroid_id,
            page_no = new_page_no,
            "allocated overflow page for centroid"
        );
        let mut mapping_row = Tuple::new(
            mapping_desc(),
            vec![Value::Int(centroid_id), Value::Int(new_page_no as i64)],
        );
        self.mapping.insert_tuple(&mut mapping_row, tid)
    }

    /// Removes the index entry for a deleted table row.
    ///
    /// Clustered indexes have nothing to do: the row lived in the table
    /// file and was already removed from it. Unclustered indexes probe
    /// every centroid's pages for the entry whose reference matches the
    /// deleted row's identity; a missing entry is tolerated.
    fn delete_tuple(&self, t: &Tuple, tid: TransactionId) -> Result<()> {
        if self.kind == IndexKind::Clustered {
            return Ok(());
        }
        let Some(RecordId::Heap {
            file,
            page_no,
            slot_no,
        }) = &t.rid
        else {
            return Ok(());
        };
        if file != &self.table_file_name {
            return Err(SimileError::IncompatibleTypes(
                "index does not match the tuple's table".to_string(),
            ));
        }
        let emb = self.indexed_embedding(t)?;

        let mut pages = self.centroid_page_iter(&emb, true, tid, -1)?;
        while let Some((_, data_page_no)) = pages.next()? {
            let page = self
                .data
                .get_heap_page(data_page_no, tid, LockMode::Exclusive)?;
            for entry in page.tuples() {
                let ref_page = entry.values[1].as_int()? as usize;
                let ref_slot = entry.values[2].as_int()? as usize;
                if ref_page == *page_no && ref_slot == *slot_no {
                    self.data.delete_tuple(&entry, tid)?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Iterator over `(centroid_id, data_page_no)` pairs.
pub struct CentroidPages {
    source: Box<dyn RowSource>,
}

impl CentroidPages {
    /// The next pair, or `None` when the probe budget is exhausted.
    ///
    /// The joined row is `(centroid_id, dist, centroid_id, index_page_no)`;
    /// the pair is read positionally to sidestep the duplicated name.
    pub fn next(&mut self) -> Result<Option<(i64, usize)>> {
        match self.source.next()? {
            Some(row) => {
                let centroid_id = row.values[0].as_int()?;
                let page_no = row.values[3].as_int()? as usize;
                Ok(Some((centroid_id, page_no)))
            }
            None => Ok(None),
        }
    }
}
