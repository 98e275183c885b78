//! Catalog: table schemas, their backing files, and index discovery.
//!
//! The catalog file is plain text, one table per line:
//!
//! ```text
//! tweets (id int, content embtext)
//! ```
//!
//! with types `int|integer|string|varchar|text|embtext|embvec`. Tables are
//! backed by `<root>/<table>.dat`; index files follow the
//! `<kind>__<table>__<column>__<part>.dat` naming scheme and are attached
//! to their table when it is opened.

use simile_buffer::BufferPool;
use simile_common::{EngineConfig, Result, SimileError};
use simile_index::{centroid_desc, data_desc, mapping_desc, IndexKind, NnIndexFile};
use simile_storage::{load_from_csv, DataType, Embedder, FieldDesc, HeapFile, TupleDesc};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A registered table: its name and row descriptor.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub desc: TupleDesc,
}

/// Registry of tables rooted in one data directory.
pub struct Catalog {
    tables: Vec<Table>,
    by_name: HashMap<String, usize>,
    root: PathBuf,
    pool: Arc<BufferPool>,
    config: Arc<EngineConfig>,
    embedder: Arc<dyn Embedder>,
}

impl Catalog {
    /// Creates an empty catalog rooted at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        pool: Arc<BufferPool>,
        config: Arc<EngineConfig>,
        embedder: Arc<dyn Embedder>,
    ) -> Catalog {
        Catalog {
            tables: Vec::new(),
            by_name: HashMap::new(),
            root: root.into(),
            pool,
            config,
            embedder,
        }
    }

    /// Loads a catalog from `<root>/<catalog_file>`.
    pub fn from_file(
        catalog_file: &str,
        root: impl Into<PathBuf>,
        pool: Arc<BufferPool>,
        config: Arc<EngineConfig>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Catalog> {
        let mut catalog = Catalog::new(root, pool, config, embedder);
        let path = catalog.root.join(catalog_file);
        let file = std::fs::File::open(&path)?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let (name, desc) = parse_catalog_line(&line)?;
            catalog.add_table(&name, desc)?;
        }
        Ok(catalog)
    }

    /// Registers a table. Duplicate names are an error.
    pub fn add_table(&mut self, name: &str, desc: TupleDesc) -> Result<()> {
        let name = name.to_lowercase();
        if self.by_name.contains_key(&name) {
            return Err(SimileError::DuplicateTable(name));
        }
        self.by_name.insert(name.clone(), self.tables.len());
        self.tables.push(Table { name, desc });
        Ok(())
    }

    /// Unregisters a table and removes its backing file.
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let name = name.to_lowercase();
        let Some(i) = self.by_name.remove(&name) else {
            return Err(SimileError::NoSuchTable(name));
        };
        self.tables.remove(i);
        for index in self.by_name.values_mut() {
            if *index > i {
                *index -= 1;
            }
        }
        let path = self.table_file(&name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Number of registered tables.
    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /// The registered tables in registration order.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// The backing file path for a table name.
    pub fn table_file(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.dat"))
    }

    /// Opens a table's heap file with every on-disk index attached.
    pub fn get_table(&self, name: &str) -> Result<Arc<HeapFile>> {
        let name = name.to_lowercase();
        let table = self
            .by_name
            .get(&name)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| SimileError::NoSuchTable(name.clone()))?;

        let table_path = self.table_file(&name);
        let heap = HeapFile::new(
            table_path.to_string_lossy().into_owned(),
            table.desc.clone(),
            self.pool.clone(),
            self.config.clone(),
            self.embedder.clone(),
        )?;

        for (column, kind, parts) in self.discover_index_files(&name)? {
            match self.open_index(&heap, &column, kind, &parts) {
                Ok(index) => heap.attach_index(index),
                Err(e) => {
                    warn!(table = %name, column = %column, error = %e, "skipping unreadable index");
                }
            }
        }
        Ok(heap)
    }

    /// Finds complete index file triples for a table by scanning the root
    /// directory for the naming scheme.
    fn discover_index_files(
        &self,
        table: &str,
    ) -> Result<Vec<(String, IndexKind, HashMap<String, PathBuf>)>> {
        let mut by_column: HashMap<String, (IndexKind, HashMap<String, PathBuf>)> = HashMap::new();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = file_name.strip_suffix(".dat") else {
                continue;
            };
            let segments: Vec<&str> = stem.split("__").collect();
            let &[kind, file_table, column, part] = segments.as_slice() else {
                continue;
            };
            let kind = match kind {
                "clustered" => IndexKind::Clustered,
                "secondary" => IndexKind::Secondary,
                _ => continue,
            };
            if file_table != table {
                continue;
            }
            by_column
                .entry(column.to_string())
                .or_insert_with(|| (kind, HashMap::new()))
                .1
                .insert(part.to_string(), entry.path());
        }

        let mut complete = Vec::new();
        for (column, (kind, parts)) in by_column {
            let has_data = kind == IndexKind::Clustered || parts.contains_key("data");
            if has_data && parts.contains_key("centroids") && parts.contains_key("mapping") {
                complete.push((column, kind, parts));
            }
        }
        Ok(complete)
    }

    fn open_index(
        &self,
        heap: &Arc<HeapFile>,
        column: &str,
        kind: IndexKind,
        parts: &HashMap<String, PathBuf>,
    ) -> Result<Arc<NnIndexFile>> {
        let open = |path: &Path, desc: TupleDesc| {
            HeapFile::new(
                path.to_string_lossy().into_owned(),
                desc,
                self.pool.clone(),
                self.config.clone(),
                self.embedder.clone(),
            )
        };

        // A clustered index's data file is the table's own backing file,
        // held through its own handle so the index and the table do not
        // keep each other alive.
        let data = match kind {
            IndexKind::Clustered => open(Path::new(heap.name()), heap.desc().clone())?,
            IndexKind::Secondary => {
                let path = parts.get("data").ok_or_else(|| {
                    SimileError::MalformedData("index data file missing".to_string())
                })?;
                open(path, data_desc())?
            }
        };
        let centroids = open(
            parts.get("centroids").ok_or_else(|| {
                SimileError::MalformedData("index centroid file missing".to_string())
            })?,
            centroid_desc(),
        )?;
        let mapping = open(
            parts.get("mapping").ok_or_else(|| {
                SimileError::MalformedData("index mapping file missing".to_string())
            })?,
            mapping_desc(),
        )?;

        Ok(NnIndexFile::new(
            heap.name(),
            column,
            kind,
            data,
            centroids,
            mapping,
        ))
    }

    /// Bulk-imports `<root>/<table>.<suffix>` into every registered table.
    pub fn import_csvs(&self, suffix: &str, sep: char, skip_last_field: bool) -> Result<()> {
        for table in &self.tables {
            let csv_path = self.root.join(format!("{}.{suffix}", table.name));
            let heap = self.get_table(&table.name)?;
            let file = std::fs::File::open(&csv_path)?;
            let loaded = load_from_csv(
                &heap,
                std::io::BufReader::new(file),
                false,
                sep,
                skip_last_field,
            )?;
            debug!(table = %table.name, rows = loaded, "imported csv");
        }
        Ok(())
    }

    /// Re-serializes the schema in the catalog file format.
    pub fn catalog_string(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let fields: Vec<String> = table
                .desc
                .fields
                .iter()
                .map(|f| format!("{} {}", f.name, f.dtype.name()))
                .collect();
            out.push_str(&format!("{} ({})\n", table.name, fields.join(", ")));
        }
        out
    }

    /// Writes the schema back to `<root>/<catalog_file>`.
    pub fn save_to_file(&self, catalog_file: &str) -> Result<()> {
        std::fs::write(self.root.join(catalog_file), self.catalog_string())?;
        Ok(())
    }
}

/// Parses one catalog line: `name (col type, col type, …)`.
fn parse_catalog_line(line: &str) -> Result<(String, TupleDesc)> {
    let line = line.to_lowercase();
    let Some((name, rest)) = line.split_once('(') else {
        return Err(SimileError::Parse(format!(
            "expected one paren in catalog entry: {line}"
        )));
    };
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(SimileError::Parse("catalog entry has no table name".to_string()));
    }
    let body = rest.trim_end().trim_end_matches(')');

    let mut fields = Vec::new();
    for spec in body.split(',') {
        let spec = spec.trim();
        let mut parts = spec.split_whitespace();
        let (Some(col), Some(ty), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(SimileError::Parse(format!(
                "malformed catalog column '{spec}' in line: {line}"
            )));
        };
        let dtype = DataType::parse(ty)
            .ok_or_else(|| SimileError::Parse(format!("unknown type '{ty}' in line: {line}")))?;
        fields.push(FieldDesc::new(col, dtype));
    }
    Ok((name, TupleDesc::new(fields)))
}
