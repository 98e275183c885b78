//! Client for the external text-embedding service.

use serde::{Deserialize, Serialize};
use simile_common::{Result, SimileError};
use std::hash::{Hash, Hasher};

/// Turns a short text into a fixed-dimension embedding vector.
///
/// The heap-file insert path calls this for every embedded-text field.
/// Implementations must be stateless with respect to the caller.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f64>>;

    /// The dimension of vectors this embedder produces.
    fn dim(&self) -> usize;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f64>,
}

/// Client for the HTTP embedding service: POST `/embed` with
/// `{"text": …}`, response `{"embedding": […]}`.
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    base_url: String,
    dim: usize,
}

impl HttpEmbedder {
    /// Creates a client for a service at `base_url` (e.g.
    /// `http://localhost:7010`) producing `dim`-dimensional vectors.
    pub fn new(base_url: impl Into<String>, dim: usize) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into(),
            dim,
        }
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let url = format!("{}/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest { text })
            .send()
            .map_err(|e| SimileError::FailedEmbedding(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SimileError::FailedEmbedding(format!(
                "embedding service returned {}",
                response.status()
            )));
        }
        let parsed: EmbedResponse = response
            .json()
            .map_err(|e| SimileError::FailedEmbedding(e.to_string()))?;
        if parsed.embedding.len() != self.dim {
            return Err(SimileError::FailedEmbedding(format!(
                "service returned dimension {}, expected {}",
                parsed.embedding.len(),
                self.dim
            )));
        }
        Ok(parsed.embedding)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Deterministic in-process embedder for tests: hashes the text into a
/// pseudo-random unit vector. Equal texts always embed identically.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let mut v = Vec::with_capacity(self.dim);
        let mut state = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut state);
        for i in 0..self.dim {
            i.hash(&mut state);
            let bits = state.finish();
            // Map to [-1, 1).
            v.push((bits as f64 / u64::MAX as f64) * 2.0 - 1.0);
        }
        let norm = crate::value::squared_magnitude(&v).sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embedder_deterministic() {
        let e = HashEmbedder::new(4);
        assert_eq!(e.embed("hello").unwrap(), e.embed("hello").unwrap());
        assert_ne!(e.embed("hello").unwrap(), e.embed("world").unwrap());
    }

    #[test]
    fn test_hash_embedder_dimension() {
        let e = HashEmbedder::new(7);
        assert_eq!(e.embed("x").unwrap().len(), 7);
        assert_eq!(e.dim(), 7);
    }

    #[test]
    fn test_hash_embedder_unit_norm() {
        let e = HashEmbedder::new(4);
        let v = e.embed("normalize me").unwrap();
        let norm = crate::value::squared_magnitude(&v).sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }
}
