//! Hybrid result fusion and rerank normalisation.
//!
//! The two retrievers produce ranked candidate lists which are fused with
//! weighted Reciprocal Rank Fusion: `score(d) = Σ_i w_i / (k + rank_i(d))`
//! with `k = 60`. The weights scale rank contributions, not raw scores.
//! Cross-encoder scores are min-max normalised to [0, 1] afterwards.

use serde::Serialize;

/// The RRF smoothing constant.
pub const RRF_K: f64 = 60.0;

/// One retriever's ranked candidates (best first) with its fusion weight.
#[derive(Debug, Clone)]
pub struct RankedList {
    /// Fusion weight for this retriever.
    pub weight: f64,
    /// Candidate ids in rank order.
    pub ids: Vec<String>,
}

/// Fuse ranked lists into `(id, fused_score)` pairs, best first. Ties break
/// on id so the ordering is deterministic.
pub fn reciprocal_rank_fuse(lists: &[RankedList]) -> Vec<(String, f64)> {
    let mut scores: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
    for list in lists {
        for (rank, id) in list.ids.iter().enumerate() {
            *scores.entry(id.clone()).or_default() += list.weight / (RRF_K + rank as f64 + 1.0);
        }
    }
    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

/// Min-max normalise scores into [0, 1]. Identical scores all map to 1.0.
pub fn min_max_normalize(scores: &mut [f32]) {
    let Some(&first) = scores.first() else {
        return;
    };
    let (mut min, mut max) = (first, first);
    for &score in scores.iter() {
        min = min.min(score);
        max = max.max(score);
    }
    let range = max - min;
    for score in scores.iter_mut() {
        *score = if range > 0.0 { (*score - min) / range } else { 1.0 };
    }
}

/// One search result returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Child chunk id.
    pub chunk_id: String,
    /// Child chunk text.
    pub text: String,
    /// Source page URL.
    pub url: String,
    /// Heading path joined with " > ".
    pub heading_path: String,
    /// Final score in [0, 1] after reranking (or the fused score scaled
    /// into [0, 1] when reranking is disabled).
    pub score: f64,
    /// Parent chunk text, when the child has a parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_text: Option<String>,
}
