//! Embedding and reranking model wrappers.
//!
//! Small traits front the local models so the index can be driven by
//! deterministic stand-ins under test. Production implementations run
//! fastembed models; both are CPU-bound and called from blocking sections.

use parking_lot::Mutex;

use fastembed::{
    EmbeddingModel, InitOptions, RerankInitOptions, RerankerModel, TextEmbedding, TextRerank,
};

/// Text embedding provider.
pub trait Embedder: Send + Sync {
    /// Model name, recorded in the index manifest.
    fn model_name(&self) -> &str;
    /// Embedding dimensionality.
    fn dimensions(&self) -> usize;
    /// Embed a batch of texts into normalised vectors.
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Cross-encoder reranking provider.
pub trait Reranker: Send + Sync {
    /// Model name.
    fn model_name(&self) -> &str;
    /// Score `documents` against `query`; scores returned in document
    /// order, higher is better. Raw model scores — normalisation happens
    /// at the search layer.
    fn rerank(&self, query: &str, documents: &[String]) -> anyhow::Result<Vec<f32>>;
}

/// fastembed-backed embedding provider.
pub struct FastembedEmbedder {
    name: String,
    dimensions: usize,
    model: Mutex<TextEmbedding>,
}

impl FastembedEmbedder {
    /// Load the named model, downloading it on first use. Unknown names
    /// fall back to the default model with a warning.
    pub fn new(name: &str) -> anyhow::Result<Self> {
        let model_kind = embedding_model_from_name(name);
        let model = TextEmbedding::try_new(
            InitOptions::new(model_kind).with_show_download_progress(false),
        )?;
        // Probe for dimensionality instead of keeping a model table.
        let probe = model.embed(vec!["probe"], None)?;
        let dimensions = probe.first().map(Vec::len).unwrap_or(0);
        anyhow::ensure!(dimensions > 0, "embedding model produced empty vectors");

        Ok(Self {
            name: name.to_string(),
            dimensions,
            model: Mutex::new(model),
        })
    }
}

impl Embedder for FastembedEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.lock();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        Ok(model.embed(refs, None)?)
    }
}

/// fastembed-backed cross-encoder.
pub struct FastembedReranker {
    name: String,
    model: Mutex<TextRerank>,
}

impl FastembedReranker {
    /// Load the named reranker model.
    pub fn new(name: &str) -> anyhow::Result<Self> {
        let model_kind = reranker_model_from_name(name);
        let model = TextRerank::try_new(
            RerankInitOptions::new(model_kind).with_show_download_progress(false),
        )?;
        Ok(Self {
            name: name.to_string(),
            model: Mutex::new(model),
        })
    }
}

impl Reranker for FastembedReranker {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn rerank(&self, query: &str, documents: &[String]) -> anyhow::Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.lock();
        let refs: Vec<&str> = documents.iter().map(String::as_str).collect();
        let results = model.rerank(query, refs, false, None)?;

        // Results arrive sorted by score; project back into document order.
        let mut scores = vec![0.0f32; documents.len()];
        for item in results {
            if let Some(slot) = scores.get_mut(item.index) {
                *slot = item.score;
            }
        }
        Ok(scores)
    }
}

fn embedding_model_from_name(name: &str) -> EmbeddingModel {
    let normalized = name.to_ascii_lowercase();
    if normalized.contains("minilm-l12") {
        EmbeddingModel::AllMiniLML12V2
    } else if normalized.contains("minilm") {
        EmbeddingModel::AllMiniLML6V2
    } else if normalized.contains("bge-small") {
        EmbeddingModel::BGESmallENV15
    } else if normalized.contains("bge-base") {
        EmbeddingModel::BGEBaseENV15
    } else if normalized.contains("bge-large") {
        EmbeddingModel::BGELargeENV15
    } else if normalized.contains("nomic") {
        EmbeddingModel::NomicEmbedTextV15
    } else {
        tracing::warn!(model = name, "Unknown embedding model name, using all-MiniLM-L6-v2");
        EmbeddingModel::AllMiniLML6V2
    }
}

fn reranker_model_from_name(name: &str) -> RerankerModel {
    let normalized = name.to_ascii_lowercase();
    if normalized.contains("jina") {
        RerankerModel::JINARerankerV1TurboEn
    } else if normalized.contains("bge-reranker-v2") {
        RerankerModel::BGERerankerV2M3
    } else if normalized.contains("bge-reranker") || normalized.contains("ms-marco") {
        RerankerModel::BGERerankerBase
    } else {
        tracing::warn!(model = name, "Unknown reranker model name, using bge-reranker-base");
        RerankerModel::BGERerankerBase
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Deterministic embedding stand-in: hashed bag-of-words projected into
    /// a small fixed-dimension space, L2-normalised.
    pub struct HashingEmbedder {
        pub dimensions: usize,
    }

    impl Default for HashingEmbedder {
        fn default() -> Self {
            Self { dimensions: 32 }
        }
    }

    impl Embedder for HashingEmbedder {
        fn model_name(&self) -> &str {
            "hashing-test-embedder"
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut vector = vec![0.0f32; self.dimensions];
                    for word in text.to_ascii_lowercase().split_whitespace() {
                        let mut hash = 5381usize;
                        for byte in word.bytes() {
                            hash = hash.wrapping_mul(33).wrapping_add(byte as usize);
                        }
                        vector[hash % self.dimensions] += 1.0;
                    }
                    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                    if norm > 0.0 {
                        for value in &mut vector {
                            *value /= norm;
                        }
                    }
                    vector
                })
                .collect())
        }
    }

    /// Reranker stand-in scoring by query-term overlap.
    pub struct OverlapReranker;

    impl Reranker for OverlapReranker {
        fn model_name(&self) -> &str {
            "overlap-test-reranker"
        }

        fn rerank(&self, query: &str, documents: &[String]) -> anyhow::Result<Vec<f32>> {
            let terms: Vec<String> = query
                .to_ascii_lowercase()
                .split_whitespace()
                .map(str::to_string)
                .collect();
            Ok(documents
                .iter()
                .map(|doc| {
                    let lower = doc.to_ascii_lowercase();
                    terms.iter().filter(|t| lower.contains(*t)).count() as f32
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::HashingEmbedder;
    use super::*;

    #[test]
    fn hashing_embedder_is_deterministic_and_normalised() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed(&["terraform state".to_string()]).unwrap();
        let b = embedder.embed(&["terraform state".to_string()]).unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn model_name_mapping_accepts_known_aliases() {
        assert!(matches!(
            embedding_model_from_name("all-MiniLM-L6-v2"),
            EmbeddingModel::AllMiniLML6V2
        ));
        assert!(matches!(
            embedding_model_from_name("BAAI/bge-small-en-v1.5"),
            EmbeddingModel::BGESmallENV15
        ));
        assert!(matches!(
            reranker_model_from_name("cross-encoder/ms-marco-MiniLM-L-12-v2"),
            RerankerModel::BGERerankerBase
        ));
    }
}
