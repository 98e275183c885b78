//! Offline k-means clustering of column embeddings.

use simile_common::{Result, SimileError, TransactionId};
use simile_storage::{dot, Operator, RecordId, Tuple};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A row assigned to a cluster. The embedding is retained only when the
/// clustering was asked to store members in memory.
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub rid: Option<RecordId>,
    pub embedding: Option<Vec<f64>>,
}

struct Cluster {
    centroid: Vec<f64>,
    /// Streamed mean of the embeddings assigned this iteration.
    running_mean: Vec<f64>,
    assigned: usize,
    sum_dist: f64,
    members: Vec<ClusterMember>,
}

/// Result of a k-means pass: centroid vectors keyed by id, optionally with
/// the member record identities of the final iteration.
pub struct Clustering {
    dim: usize,
    max_clusters: usize,
    store_members: bool,
    clusters: BTreeMap<i64, Cluster>,
}

/// Distance between two embeddings: negative dot product, so minimizing
/// distance maximizes similarity.
fn distance(a: &[f64], b: &[f64]) -> f64 {
    -dot(a, b)
}

impl Clustering {
    fn new(max_clusters: usize, dim: usize, store_members: bool) -> Clustering {
        Clustering {
            dim,
            max_clusters,
            store_members,
            clusters: BTreeMap::new(),
        }
    }

    /// Number of centroids currently in the clustering.
    pub fn n_centroids(&self) -> usize {
        self.clusters.len()
    }

    /// Centroid vectors keyed by id.
    pub fn centroids(&self) -> impl Iterator<Item = (i64, &[f64])> {
        self.clusters
            .iter()
            .map(|(&id, c)| (id, c.centroid.as_slice()))
    }

    /// Members of a cluster from the final iteration.
    pub fn members(&self, id: i64) -> Result<&[ClusterMember]> {
        self.clusters
            .get(&id)
            .map(|c| c.members.as_slice())
            .ok_or(SimileError::UnknownCluster(id))
    }

    /// Sum of assignment distances over all clusters.
    pub fn total_dist(&self) -> f64 {
        self.clusters.values().map(|c| c.sum_dist).sum()
    }

    /// The id and distance of the centroid closest to `emb`.
    pub fn find_closest_centroid(&self, emb: &[f64]) -> Result<(i64, f64)> {
        let mut best: Option<(i64, f64)> = None;
        for (&id, cluster) in &self.clusters {
            let d = distance(emb, &cluster.centroid);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((id, d));
            }
        }
        best.ok_or(SimileError::UnknownCluster(-1))
    }

    fn clear_assignments(&mut self) {
        for cluster in self.clusters.values_mut() {
            cluster.running_mean = vec![0.0; self.dim];
            cluster.assigned = 0;
            cluster.sum_dist = 0.0;
            cluster.members.clear();
        }
    }

    /// Assigns one row. During the seeding pass, while fewer than the
    /// target number of clusters exist, the row seeds a new centroid with
    /// itself as first member; otherwise it joins the closest centroid,
    /// streaming into its running mean.
    fn add_record(&mut self, rid: Option<RecordId>, emb: &[f64], seeding: bool) -> Result<()> {
        if emb.len() != self.dim {
            return Err(SimileError::MalformedData(format!(
                "embedding has dimension {}, clustering expects {}",
                emb.len(),
                self.dim
            )));
        }

        let (id, dist) = if seeding && self.clusters.len() < self.max_clusters {
            let id = self.clusters.len() as i64;
            self.clusters.insert(
                id,
                Cluster {
                    centroid: emb.to_vec(),
                    running_mean: vec![0.0; self.dim],
                    assigned: 0,
                    sum_dist: 0.0,
                    members: Vec::new(),
                },
            );
            (id, 0.0)
        } else {
            self.find_closest_centroid(emb)?
        };

        let store_members = self.store_members;
        let cluster = self
            .clusters
            .get_mut(&id)
            .ok_or(SimileError::UnknownCluster(id))?;
        cluster.assigned += 1;
        let n = cluster.assigned as f64;
        for (mean, &x) in cluster.running_mean.iter_mut().zip(emb) {
            *mean += (x - *mean) / n;
        }
        cluster.sum_dist += dist;
        cluster.members.push(ClusterMember {
            rid,
            embedding: store_members.then(|| emb.to_vec()),
        });
        Ok(())
    }

    /// Replaces every centroid that received members with its streamed
    /// mean.
    fn update_centroids(&mut self) {
        for cluster in self.clusters.values_mut() {
            if cluster.assigned > 0 {
                cluster.centroid = cluster.running_mean.clone();
            }
        }
    }
}

/// Runs Lloyd's algorithm over the rows of `source`.
///
/// Every pass re-opens the source under `tid`; the caller owns the
/// transaction and releases its locks by committing or aborting it.
/// `getter` extracts the embedding from a row. The `delta_threshold`
/// parameter is accepted for interface compatibility but unused:
/// termination is the iteration budget alone.
pub fn kmeans<F>(
    source: Arc<dyn Operator>,
    n_clusters: usize,
    dim: usize,
    max_iterations: usize,
    _delta_threshold: f64,
    store_members: bool,
    tid: TransactionId,
    getter: F,
) -> Result<Clustering>
where
    F: Fn(&Tuple) -> Result<Vec<f64>>,
{
    let mut clustering = Clustering::new(n_clusters, dim, store_members);

    for iteration in 0..max_iterations {
        let mut rows = source.clone().iterator(tid)?;

        clustering.clear_assignments();
        let mut seen = 0usize;
        while let Some(t) = rows.next()? {
            let emb = getter(&t)?;
            clustering.add_record(t.rid.clone(), &emb, iteration == 0)?;
            seen += 1;
        }
        clustering.update_centroids();
        debug!(
            iteration,
            rows = seen,
            centroids = clustering.n_centroids(),
            total_dist = clustering.total_dist(),
            "k-means iteration complete"
        );
    }

    Ok(clustering)
}

/// A getter extracting the embedding of the named column.
pub fn embedding_getter(column: &str) -> impl Fn(&Tuple) -> Result<Vec<f64>> + '_ {
    move |t: &Tuple| {
        let i = t
            .desc
            .fields
            .iter()
            .position(|f| f.name == column)
            .ok_or_else(|| {
                SimileError::IncompatibleTypes(format!("row has no column '{column}'"))
            })?;
        t.values[i]
            .embedding()
            .map(|e| e.to_vec())
            .ok_or_else(|| {
                SimileError::IncompatibleTypes(format!("column '{column}' carries no embedding"))
            })
    }
}
