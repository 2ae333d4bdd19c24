//! The dual index: a flat cosine vector store and an in-memory BM25 index.
//!
//! The vector store is append-only between rebuilds — the flat index does
//! not support removal, which is why updates tombstone chunks instead of
//! deleting vectors. Serialisation is guarded by a SHA-256 sidecar checked
//! against the manifest on load.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::rag::sha256_hex_bytes;

/// Flat cosine vector index over chunk keys.
pub struct VectorStore {
    dimensions: usize,
    // Coarse locking; the C index is not concurrency-safe for mixed
    // add/search.
    index: Mutex<Index>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("dimensions", &self.dimensions)
            .field("size", &self.len())
            .finish()
    }
}

fn index_options(dimensions: usize) -> IndexOptions {
    IndexOptions {
        dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity: 16,
        expansion_add: 128,
        expansion_search: 64,
        multi: false,
    }
}

impl VectorStore {
    /// Create an empty store.
    pub fn new(dimensions: usize) -> anyhow::Result<Self> {
        let index = Index::new(&index_options(dimensions))
            .map_err(|e| anyhow::anyhow!("failed to create vector index: {e}"))?;
        index
            .reserve(1024)
            .map_err(|e| anyhow::anyhow!("failed to reserve vector index: {e}"))?;
        Ok(Self {
            dimensions,
            index: Mutex::new(index),
        })
    }

    /// Load a store from disk.
    pub fn load(path: &Path, dimensions: usize) -> anyhow::Result<Self> {
        let index = Index::new(&index_options(dimensions))
            .map_err(|e| anyhow::anyhow!("failed to create vector index: {e}"))?;
        index
            .load(&path.to_string_lossy())
            .map_err(|e| anyhow::anyhow!("failed to load vector index: {e}"))?;
        Ok(Self {
            dimensions,
            index: Mutex::new(index),
        })
    }

    /// Persist the store and write its SHA-256 sidecar. Returns the
    /// checksum for the manifest.
    pub fn save(&self, path: &Path) -> anyhow::Result<String> {
        {
            let index = self.index.lock();
            index
                .save(&path.to_string_lossy())
                .map_err(|e| anyhow::anyhow!("failed to save vector index: {e}"))?;
        }
        let checksum = Self::checksum_of(path)?;
        std::fs::write(sidecar_path(path), &checksum)?;
        Ok(checksum)
    }

    /// SHA-256 of the serialised store.
    pub fn checksum_of(path: &Path) -> anyhow::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(sha256_hex_bytes(&bytes))
    }

    /// Read the sidecar checksum, if present.
    pub fn sidecar_checksum(path: &Path) -> Option<String> {
        std::fs::read_to_string(sidecar_path(path))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Append one vector under `key`.
    pub fn add(&self, key: u64, vector: &[f32]) -> anyhow::Result<()> {
        anyhow::ensure!(
            vector.len() == self.dimensions,
            "vector has {} dimensions, index expects {}",
            vector.len(),
            self.dimensions
        );
        let index = self.index.lock();
        if index.size() + 1 > index.capacity() {
            index
                .reserve((index.capacity() * 2).max(1024))
                .map_err(|e| anyhow::anyhow!("failed to grow vector index: {e}"))?;
        }
        index
            .add(key, vector)
            .map_err(|e| anyhow::anyhow!("failed to add vector: {e}"))?;
        Ok(())
    }

    /// Nearest neighbours as `(key, similarity)` pairs, most similar first.
    pub fn search(&self, query: &[f32], count: usize) -> anyhow::Result<Vec<(u64, f32)>> {
        let index = self.index.lock();
        let matches = index
            .search(query, count)
            .map_err(|e| anyhow::anyhow!("vector search failed: {e}"))?;
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(key, distance)| (*key, 1.0 - *distance))
            .collect())
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.index.lock().size()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding dimensionality.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Sidecar path: `<store>.sha256` next to the store file.
pub fn sidecar_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "vector_store".to_string());
    name.push_str(".sha256");
    path.with_file_name(name)
}

/// BM25 parameters.
const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

/// In-memory BM25 index over chunk texts.
///
/// Rebuilt whenever the chunk table changes; cheap relative to embedding.
#[derive(Debug, Default)]
pub struct Bm25Index {
    doc_ids: Vec<String>,
    term_frequencies: Vec<HashMap<String, usize>>,
    doc_lengths: Vec<usize>,
    document_frequency: HashMap<String, usize>,
    average_length: f64,
}

impl Bm25Index {
    /// Build from `(chunk_id, text)` pairs.
    pub fn build<'a, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut index = Self::default();
        for (id, text) in documents {
            let terms = tokenize(text);
            let mut frequencies: HashMap<String, usize> = HashMap::new();
            for term in &terms {
                *frequencies.entry(term.clone()).or_default() += 1;
            }
            for term in frequencies.keys() {
                *index.document_frequency.entry(term.clone()).or_default() += 1;
            }
            index.doc_lengths.push(terms.len());
            index.term_frequencies.push(frequencies);
            index.doc_ids.push(id.to_string());
        }
        let total: usize = index.doc_lengths.iter().sum();
        index.average_length = if index.doc_ids.is_empty() {
            0.0
        } else {
            total as f64 / index.doc_ids.len() as f64
        };
        index
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    /// Top-`k` documents for `query` as `(chunk_id, score)`, best first.
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f64)> {
        if self.doc_ids.is_empty() {
            return Vec::new();
        }
        let terms = tokenize(query);
        let doc_count = self.doc_ids.len() as f64;

        let mut scores: Vec<(usize, f64)> = Vec::new();
        for (doc, frequencies) in self.term_frequencies.iter().enumerate() {
            let mut score = 0.0;
            let length_norm = 1.0 - BM25_B
                + BM25_B * self.doc_lengths[doc] as f64 / self.average_length.max(1.0);
            for term in &terms {
                let Some(&tf) = frequencies.get(term) else {
                    continue;
                };
                let df = *self.document_frequency.get(term).unwrap_or(&0) as f64;
                let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
                let tf = tf as f64;
                score += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * length_norm);
            }
            if score > 0.0 {
                scores.push((doc, score));
            }
        }

        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores
            .into_iter()
            .take(k)
            .map(|(doc, score)| (self.doc_ids[doc].clone(), score))
            .collect()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector_store.usearch");

        let store = VectorStore::new(4).unwrap();
        store.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        store.add(2, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        let checksum = store.save(&path).unwrap();

        assert_eq!(VectorStore::sidecar_checksum(&path), Some(checksum.clone()));
        assert_eq!(VectorStore::checksum_of(&path).unwrap(), checksum);

        let loaded = VectorStore::load(&path, 4).unwrap();
        assert_eq!(loaded.len(), 2);
        let hits = loaded.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn vector_store_rejects_wrong_dimension() {
        let store = VectorStore::new(4).unwrap();
        assert!(store.add(1, &[1.0, 0.0]).is_err());
    }

    #[test]
    fn bm25_ranks_matching_documents_higher() {
        let index = Bm25Index::build([
            ("a", "terraform state locking with consul backends"),
            ("b", "kubernetes pod scheduling and affinity rules"),
            ("c", "terraform providers and modules overview"),
        ]);
        let hits = index.search("terraform state", 3);
        assert_eq!(hits[0].0, "a");
        assert!(hits.iter().all(|(id, _)| id != "b"));
    }

    #[test]
    fn bm25_empty_query_matches_nothing() {
        let index = Bm25Index::build([("a", "some words here")]);
        assert!(index.search("", 5).is_empty());
    }

    #[test]
    fn bm25_rare_terms_outweigh_common_ones() {
        let index = Bm25Index::build([
            ("a", "install install install common word"),
            ("b", "vault seal migration procedure"),
            ("c", "install common word again"),
        ]);
        let hits = index.search("vault seal", 3);
        assert_eq!(hits[0].0, "b");
    }

    #[test]
    fn sidecar_path_appends_extension() {
        let path = Path::new("/tmp/cache/vector_store.usearch");
        assert_eq!(
            sidecar_path(path),
            Path::new("/tmp/cache/vector_store.usearch.sha256")
        );
    }
}
