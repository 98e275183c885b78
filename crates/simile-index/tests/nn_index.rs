//! NN index construction, maintenance, and scan behavior over real files.

use simile_buffer::BufferPool;
use simile_common::{EngineConfig, TransactionId};
use simile_exec::{Expr, LimitOp, OrderBy};
use simile_index::{construct_nn_index, IndexKind, NnScan};
use simile_storage::{
    collect_rows, DataType, FieldDesc, HashEmbedder, HeapFile, Operator, Tuple, TupleDesc, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn table_desc() -> TupleDesc {
    TupleDesc::new(vec![
        FieldDesc::new("id", DataType::Int),
        FieldDesc::new("v", DataType::Vector),
    ])
}

struct Fixture {
    dir: TempDir,
    pool: Arc<BufferPool>,
    config: Arc<EngineConfig>,
}

impl Fixture {
    fn new(mut config: EngineConfig) -> Fixture {
        config.embedding_dim = 4;
        let config = Arc::new(config);
        Fixture {
            dir: TempDir::new().unwrap(),
            pool: Arc::new(BufferPool::new(200, config.clone())),
            config,
        }
    }

    fn table(&self, name: &str, vectors: &[Vec<f64>]) -> Arc<HeapFile> {
        let path = self.dir.path().join(format!("{name}.dat"));
        let hf = HeapFile::new(
            path.to_string_lossy().into_owned(),
            table_desc(),
            self.pool.clone(),
            self.config.clone(),
            Arc::new(HashEmbedder::new(4)),
        )
        .unwrap();
        let tid = TransactionId::new();
        for (i, v) in vectors.iter().enumerate() {
            let mut t = Tuple::new(
                table_desc(),
                vec![Value::Int(i as i64), Value::Vector(v.clone())],
            );
            hf.insert_tuple(&mut t, tid).unwrap();
        }
        self.pool.commit(tid);
        hf
    }
}

fn axis(i: usize) -> Vec<f64> {
    let mut v = vec![0.0; 4];
    v[i] = 1.0;
    v
}

/// Vectors spread across the four axes with small deterministic jitter.
fn spread_vectors(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            let mut v = vec![0.0; 4];
            v[i % 4] = 1.0;
            v[(i + 1) % 4] = (i % 7) as f64 * 0.01;
            v
        })
        .collect()
}

#[test]
fn build_secondary_index_counts() {
    // Property: after build(table, column, C) the centroid file has C rows
    // and the data file has |table| rows.
    let fx = Fixture::new(EngineConfig::for_tests());
    let table = fx.table("tweets", &spread_vectors(40));
    let index =
        construct_nn_index(&table, "v", 4, IndexKind::Secondary, fx.dir.path(), "tweets").unwrap();

    let tid = TransactionId::new();
    assert_eq!(index.n_centroids(tid).unwrap(), 4);
    assert_eq!(index.data_file().num_tuples(tid).unwrap(), 40);
    fx.pool.commit(tid);
}

#[test]
fn build_assigns_rows_to_nearest_centroid() {
    // Property: immediately after build, every data-file row lives on a
    // page mapped to the centroid nearest its vector.
    let fx = Fixture::new(EngineConfig::for_tests());
    let table = fx.table("near", &spread_vectors(32));
    let index =
        construct_nn_index(&table, "v", 4, IndexKind::Secondary, fx.dir.path(), "near").unwrap();

    let tid = TransactionId::new();

    // Load centroids.
    let centroid_rows =
        collect_rows(index.centroid_file().clone().iterator(tid).unwrap()).unwrap();
    let centroids: Vec<(i64, Vec<f64>)> = centroid_rows
        .iter()
        .map(|t| {
            (
                t.values[1].as_int().unwrap(),
                t.values[0].embedding().unwrap().to_vec(),
            )
        })
        .collect();
    let nearest = |v: &[f64]| -> i64 {
        centroids
            .iter()
            .min_by(|(_, a), (_, b)| {
                let da = -simile_storage::dot(v, a);
                let db = -simile_storage::dot(v, b);
                da.partial_cmp(&db).unwrap()
            })
            .map(|(id, _)| *id)
            .unwrap()
    };

    // Load the page -> centroid mapping.
    let mapping_rows =
        collect_rows(index.mapping_file().clone().iterator(tid).unwrap()).unwrap();
    let mut page_to_centroid: HashMap<usize, i64> = HashMap::new();
    for t in &mapping_rows {
        page_to_centroid.insert(
            t.values[1].as_int().unwrap() as usize,
            t.values[0].as_int().unwrap(),
        );
    }

    // Every data row's nearest centroid must match its page's centroid.
    let data_rows = collect_rows(index.data_file().clone().iterator(tid).unwrap()).unwrap();
    assert_eq!(data_rows.len(), 32);
    for t in &data_rows {
        let v = t.values[0].embedding().unwrap();
        let Some(simile_storage::RecordId::Heap { page_no, .. }) = &t.rid else {
            panic!("data row without identity");
        };
        let mapped = page_to_centroid[page_no];
        assert_eq!(nearest(v), mapped);
    }
    fx.pool.commit(tid);
}

#[test]
fn nn_scan_top1_finds_nearest_row() {
    // Four centroids at the unit axes, one member each; the row nearest
    // (0.9, 0.1, 0, 0) is the one at (1, 0, 0, 0).
    let mut config = EngineConfig::for_tests();
    config.default_probe = 1;
    let fx = Fixture::new(config);

    let vectors: Vec<Vec<f64>> = (0..4).map(axis).collect();
    let table = fx.table("axes", &vectors);
    let index =
        construct_nn_index(&table, "v", 4, IndexKind::Secondary, fx.dir.path(), "axes").unwrap();

    let scan = Arc::new(
        NnScan::new(
            table.clone(),
            index,
            &Expr::Const(Value::Int(1)),
            &Value::Vector(vec![0.9, 0.1, 0.0, 0.0]),
            true,
        )
        .unwrap(),
    );
    let order = Arc::new(
        OrderBy::new(
            vec![Expr::ailike(
                FieldDesc::new("v", DataType::Vector),
                Value::Vector(vec![0.9, 0.1, 0.0, 0.0]),
            )],
            vec![true],
            scan,
        )
        .unwrap(),
    );
    let top1 = Arc::new(LimitOp::new(Expr::Const(Value::Int(1)), order));

    let tid = TransactionId::new();
    let rows = collect_rows(top1.iterator(tid).unwrap()).unwrap();
    fx.pool.commit(tid);

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values[1], Value::Vector(axis(0)));
}

#[test]
fn nn_scan_yields_superset_with_more_probes() {
    let fx = Fixture::new(EngineConfig::for_tests());
    let table = fx.table("many", &spread_vectors(24));
    let index =
        construct_nn_index(&table, "v", 4, IndexKind::Secondary, fx.dir.path(), "many").unwrap();

    // default_probe = 3 with 4 centroids and a tiny table reaches most of
    // the index; the scan must resolve entries back to full table rows.
    let scan = Arc::new(
        NnScan::new(
            table.clone(),
            index,
            &Expr::Const(Value::Int(5)),
            &Value::Vector(axis(1)),
            true,
        )
        .unwrap(),
    );
    let tid = TransactionId::new();
    let rows = collect_rows(scan.iterator(tid).unwrap()).unwrap();
    fx.pool.commit(tid);

    assert!(!rows.is_empty());
    for t in &rows {
        assert_eq!(t.desc, table_desc());
        assert!(t.rid.is_some(), "scan rows resolve to stored table rows");
    }
}

#[test]
fn clustered_build_swaps_table_file() {
    // Property: the clustered data file and the table file are the same
    // bytes after build.
    let fx = Fixture::new(EngineConfig::for_tests());
    let table = fx.table("grouped", &spread_vectors(30));
    let index =
        construct_nn_index(&table, "v", 4, IndexKind::Clustered, fx.dir.path(), "grouped")
            .unwrap();

    assert_eq!(index.data_file().name(), table.name());

    let tid = TransactionId::new();
    assert_eq!(index.n_centroids(tid).unwrap(), 4);
    assert_eq!(table.num_tuples(tid).unwrap(), 30);
    fx.pool.commit(tid);
}

#[test]
fn clustered_insert_preserves_count() {
    // Build clustered with C=4 over 100 rows, insert 10 more, and expect
    // all 110 back from a table scan.
    let fx = Fixture::new(EngineConfig::for_tests());
    let table = fx.table("big", &spread_vectors(100));
    construct_nn_index(&table, "v", 4, IndexKind::Clustered, fx.dir.path(), "big").unwrap();

    let tid = TransactionId::new();
    for (i, v) in spread_vectors(10).into_iter().enumerate() {
        let mut t = Tuple::new(
            table_desc(),
            vec![Value::Int((100 + i) as i64), Value::Vector(v)],
        );
        table.insert_tuple(&mut t, tid).unwrap();
    }
    fx.pool.commit(tid);

    let tid = TransactionId::new();
    let rows = collect_rows(table.clone().iterator(tid).unwrap()).unwrap();
    fx.pool.commit(tid);
    assert_eq!(rows.len(), 110);

    // Every row is retrievable through its identity.
    let tid = TransactionId::new();
    for t in &rows {
        let found = table.find_tuple(t.rid.as_ref().unwrap(), tid).unwrap();
        assert!(found.equals(t));
    }
    fx.pool.commit(tid);
}

#[test]
fn secondary_index_follows_deletes() {
    let fx = Fixture::new(EngineConfig::for_tests());
    let table = fx.table("deletable", &spread_vectors(12));
    let index =
        construct_nn_index(&table, "v", 3, IndexKind::Secondary, fx.dir.path(), "deletable")
            .unwrap();

    // Delete four rows through the table; the index entries must follow.
    let tid = TransactionId::new();
    let rows = collect_rows(table.clone().iterator(tid).unwrap()).unwrap();
    for t in rows.iter().take(4) {
        table.delete_tuple(t, tid).unwrap();
    }
    fx.pool.commit(tid);

    let tid = TransactionId::new();
    assert_eq!(table.num_tuples(tid).unwrap(), 8);
    assert_eq!(index.data_file().num_tuples(tid).unwrap(), 8);
    fx.pool.commit(tid);
}

#[test]
fn secondary_insert_maintains_index() {
    let fx = Fixture::new(EngineConfig::for_tests());
    let table = fx.table("maintained", &spread_vectors(20));
    let index =
        construct_nn_index(&table, "v", 4, IndexKind::Secondary, fx.dir.path(), "maintained")
            .unwrap();

    let tid = TransactionId::new();
    let mut t = Tuple::new(
        table_desc(),
        vec![Value::Int(999), Value::Vector(axis(2))],
    );
    table.insert_tuple(&mut t, tid).unwrap();
    fx.pool.commit(tid);

    let tid = TransactionId::new();
    assert_eq!(index.data_file().num_tuples(tid).unwrap(), 21);
    assert_eq!(table.num_tuples(tid).unwrap(), 21);
    fx.pool.commit(tid);
}
