//! Nearest-neighbor indexing for the simile engine.
//!
//! An NN index is three heap files bound to one table column: centroids
//! from an offline k-means pass, index entries grouped by centroid, and a
//! centroid-to-page mapping. Similarity-ranked scans probe the closest
//! centroids instead of scanning the base table.

mod build;
mod clustering;
mod index_file;
mod scan;

pub use build::construct_nn_index;
pub use clustering::{kmeans, Clustering, ClusterMember};
pub use index_file::{
    centroid_desc, data_desc, mapping_desc, CentroidPages, IndexKind, NnIndexFile,
};
pub use scan::NnScan;
