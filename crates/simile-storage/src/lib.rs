//! Storage engine for simile.
//!
//! This crate provides:
//! - Fixed-width value and row codecs
//! - Slotted heap pages
//! - Heap files with buffer-pool-routed page access and index forwarding
//! - CSV bulk loading
//! - The embedding-service client
//! - The pull-based row source traits implemented by every operator

mod csv;
mod embed;
mod heap;
mod page;
mod source;
mod tuple;
mod value;

pub use csv::load_from_csv;
pub use embed::{Embedder, HashEmbedder, HttpEmbedder};
pub use heap::{HeapFile, SecondaryIndex};
pub use page::HeapPage;
pub use source::{collect_rows, Operator, RowSource};
pub use tuple::{join_tuples, FieldDesc, RecordId, Tuple, TupleDesc};
pub use value::{compare_values, dot, hash_value, squared_magnitude, DataType, Value};
