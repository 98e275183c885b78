//! Offline NN-index construction.

use crate::clustering::{embedding_getter, kmeans};
use crate::index_file::{centroid_desc, data_desc, mapping_desc, IndexKind, NnIndexFile};
use simile_common::{Result, TransactionId};
use simile_storage::{HeapFile, Operator, SecondaryIndex, Tuple, TupleDesc, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// The on-disk name of one part of an index:
/// `<kind>__<table>__<column>__<part>.dat`.
pub(crate) fn index_file_name(kind: IndexKind, table: &str, column: &str, part: &str) -> String {
    format!("{kind}__{table}__{column}__{part}.dat")
}

/// Builds an NN index over `column` of `table` with `n_clusters` centroids
/// and attaches it to the table.
///
/// The build runs as one transaction with the buffer pool's `steal`
/// override enabled, since the working set exceeds any reasonable pool.
/// For a clustered index the freshly built data file is renamed onto the
/// table's path (the previous table file is kept aside with a `.pre_index`
/// suffix) and the page cache is wiped, because cached pages still
/// reference the replaced file.
pub fn construct_nn_index(
    table: &Arc<HeapFile>,
    column: &str,
    n_clusters: usize,
    kind: IndexKind,
    root: &Path,
    table_name: &str,
) -> Result<Arc<NnIndexFile>> {
    let pool = table.pool().clone();
    pool.set_steal(true);
    let result = build(table, column, n_clusters, kind, root, table_name);
    pool.set_steal(false);
    result
}

fn build(
    table: &Arc<HeapFile>,
    column: &str,
    n_clusters: usize,
    kind: IndexKind,
    root: &Path,
    table_name: &str,
) -> Result<Arc<NnIndexFile>> {
    let config = table.config().clone();
    let pool = table.pool().clone();
    let embedder = table.embedder().clone();

    let tid = TransactionId::new();
    let clustering = kmeans(
        table.clone(),
        n_clusters,
        config.embedding_dim,
        config.max_kmeans_iterations,
        config.kmeans_delta_threshold,
        false,
        tid,
        embedding_getter(column),
    )?;
    info!(
        table = table_name,
        column,
        centroids = clustering.n_centroids(),
        "k-means pass complete"
    );

    let part_path = |part: &str| root.join(index_file_name(kind, table_name, column, part));
    let data_path = part_path("data");
    let centroid_path = part_path("centroids");
    let mapping_path = part_path("mapping");
    for path in [&data_path, &centroid_path, &mapping_path] {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }

    let entry_desc: TupleDesc = match kind {
        IndexKind::Clustered => table.desc().clone(),
        IndexKind::Secondary => data_desc(),
    };
    let new_heap = |path: &Path, desc: TupleDesc| {
        HeapFile::new(
            path.to_string_lossy().into_owned(),
            desc,
            pool.clone(),
            config.clone(),
            embedder.clone(),
        )
    };
    let data = new_heap(&data_path, entry_desc)?;
    let centroids = new_heap(&centroid_path, centroid_desc())?;
    let mapping = new_heap(&mapping_path, mapping_desc())?;

    // One centroid row and one initial (empty) data page per centroid.
    for (centroid_id, emb) in clustering.centroids() {
        let mut centroid_row = Tuple::new(
            centroid_desc(),
            vec![Value::Vector(emb.to_vec()), Value::Int(centroid_id)],
        );
        centroids.insert_tuple(&mut centroid_row, tid)?;

        let page_no = data.allocate_new_page(tid)?;
        let mut mapping_row = Tuple::new(
            mapping_desc(),
            vec![Value::Int(centroid_id), Value::Int(page_no as i64)],
        );
        mapping.insert_tuple(&mut mapping_row, tid)?;
    }

    let index = NnIndexFile::new(
        table.name(),
        column,
        kind,
        data.clone(),
        centroids.clone(),
        mapping.clone(),
    );

    // Stream every table row through the index insert path, which routes
    // it to the page of its nearest centroid.
    let mut rows = table.clone().iterator(tid)?;
    let mut inserted = 0usize;
    while let Some(mut t) = rows.next()? {
        index.insert_tuple(&mut t, tid)?;
        inserted += 1;
    }

    pool.commit(tid);
    pool.flush_all_pages()?;
    info!(table = table_name, column, rows = inserted, "index build complete");

    let index = if kind == IndexKind::Clustered {
        // Swap the grouped data file in as the table's backing file. Cached
        // pages still name the old file, so the pool is wiped.
        let table_path = table.name().to_string();
        std::fs::rename(&table_path, format!("{table_path}.pre_index"))?;
        std::fs::rename(&data_path, &table_path)?;
        pool.clear_all_pages();

        let data = HeapFile::new(
            table_path.clone(),
            table.desc().clone(),
            pool.clone(),
            config.clone(),
            embedder.clone(),
        )?;
        NnIndexFile::new(table_path, column, kind, data, centroids, mapping)
    } else {
        index
    };

    table.attach_index(index.clone());
    Ok(index)
}
