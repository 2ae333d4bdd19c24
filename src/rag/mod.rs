//! The documentation retrieval core.
//!
//! Pipeline: crawl → fetch (page cache) → extract main content → semantic
//! chunk (parents + children) → embed → dual index (lexical + vector) →
//! hybrid search with reranking. A background updater applies tombstoned
//! incremental updates and rebuilds when deletion pressure grows; an
//! optional contextualiser enriches chunks with situating prefixes.

pub mod chunker;
pub mod contextual;
pub mod crawler;
pub mod embed;
pub mod extract;
pub mod fetcher;
pub mod index;
pub mod search;
pub mod store;
pub mod tokenizer;
pub mod updater;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Index format version; changing the chunker bumps this and forces a
/// rebuild on load.
pub const INDEX_VERSION: &str = "2.0.0-chunker-v2";

/// Metadata carried by every searchable chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Source page URL.
    pub url: String,
    /// Heading path from h1 down to the chunk's section.
    pub heading_path: Vec<String>,
    /// Coarse content classification: "text", "code", or "mixed".
    pub doc_type: String,
    /// Identifiers mentioned in code blocks, for lexical matching.
    #[serde(default)]
    pub code_identifiers: Vec<String>,
    /// Parent materialised directly as a searchable chunk (it had no
    /// children).
    #[serde(default)]
    pub is_parent_as_child: bool,
    /// Invisible to retrievers; physically removed on rebuild.
    #[serde(default)]
    pub tombstoned: bool,
    /// `lastmod` from the sitemap, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastmod: Option<String>,
}

/// A searchable (child-granularity) chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable id: SHA-256 over (url, heading path, block index), truncated
    /// to 32 hex chars.
    pub chunk_id: String,
    /// Owning parent, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Chunk text (possibly carrying a contextual prefix).
    pub text: String,
    /// Original text before contextual enrichment, if enriched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
    /// Token count of `text`.
    pub token_count: usize,
    /// Chunk metadata.
    pub metadata: ChunkMetadata,
}

/// A context-granularity parent chunk, returned alongside its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentChunk {
    /// Stable parent id.
    pub parent_id: String,
    /// Full section text.
    pub text: String,
    /// Source page URL.
    pub url: String,
    /// Heading path of the section.
    pub heading_path: Vec<String>,
    /// `lastmod` from the sitemap, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastmod: Option<String>,
}

/// Cached page record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// Page URL.
    pub url: String,
    /// SHA-256 of the extracted content.
    pub content_hash: String,
    /// `ETag` response header, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// `Last-Modified` response header, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// `lastmod` from the sitemap, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastmod: Option<String>,
    /// When this record was cached (RFC 3339).
    pub cached_at: String,
    /// Path of the cache file holding this record.
    pub html_cache_path: String,
    /// Extracted main-content HTML.
    pub html: String,
}

/// Manifest guarding the persisted index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Index format version tag.
    pub version: String,
    /// Embedding model the vectors were produced with.
    pub embedding_model: String,
    /// SHA-256 of the serialised vector store.
    pub vector_store_checksum: String,
    /// Build timestamp (RFC 3339).
    pub created_at: String,
    /// Number of searchable chunks at build time.
    pub chunk_count: usize,
}

/// Per-URL failure tracking for the crawl skip list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlFailure {
    /// Consecutive failures.
    pub failure_count: u32,
    /// First recorded error.
    pub first_error: String,
    /// Most recent error.
    pub last_error: String,
    /// Timestamp of the last attempt (RFC 3339).
    pub last_attempt: String,
}

/// Persisted crawl state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlState {
    /// All URLs discovered in the last completed discovery pass.
    #[serde(default)]
    pub discovered_urls: Vec<String>,
    /// URL → lastmod (if known) for everything currently indexed.
    #[serde(default)]
    pub indexed_urls: HashMap<String, Option<String>>,
    /// URLs that keep failing, with details.
    #[serde(default)]
    pub failed_urls: HashMap<String, UrlFailure>,
    /// Whether discovery ran to completion.
    #[serde(default)]
    pub crawl_complete: bool,
    /// The `max_pages` limit the state was built under (0 = unlimited).
    #[serde(default)]
    pub max_pages_limit: usize,
}

/// The quadruple computed by comparing the current sitemap against the
/// indexed set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SitemapDiff {
    /// URLs not yet indexed, with lastmod.
    pub new: Vec<(String, Option<String>)>,
    /// Indexed URLs whose lastmod changed (or is unknown), with lastmod.
    pub updated: Vec<(String, Option<String>)>,
    /// Indexed URLs no longer present in the sitemap.
    pub removed: Vec<String>,
    /// Indexed URLs with an unchanged lastmod.
    pub unchanged: Vec<String>,
}

/// Signals shared between foreground requests and background index tasks.
///
/// `pause` is advisory: background work checks it between batches and
/// yields while any foreground request holds a guard. `cancel` is terminal.
/// `wake` forces an immediate update cycle.
#[derive(Debug, Default)]
pub struct BackgroundSignals {
    pause_depth: AtomicUsize,
    cancelled: AtomicBool,
    wake: tokio::sync::Notify,
}

impl BackgroundSignals {
    /// Create a fresh signal set.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether background work should yield right now.
    pub fn paused(&self) -> bool {
        self.pause_depth.load(Ordering::Acquire) > 0
    }

    /// Whether background work should terminate.
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Request termination of all background tasks.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Force an immediate update cycle.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Wait until woken or until `timeout` elapses.
    pub async fn wait_for_wake(&self, timeout: std::time::Duration) {
        let _ = tokio::time::timeout(timeout, self.wake.notified()).await;
    }

    /// Take a pause guard for the duration of a foreground request. The
    /// request does not block on acknowledgement.
    pub fn pause_guard(self: &Arc<Self>) -> PauseGuard {
        self.pause_depth.fetch_add(1, Ordering::AcqRel);
        PauseGuard {
            signals: Arc::clone(self),
        }
    }

    /// Yield until the pause flag clears or cancellation fires, polling at
    /// a short interval. Used by background tasks between batches.
    pub async fn yield_while_paused(&self) {
        while self.paused() && !self.cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

/// RAII pause marker held by a foreground request.
#[derive(Debug)]
pub struct PauseGuard {
    signals: Arc<BackgroundSignals>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.signals.pause_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// SHA-256 hex digest of a string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex_encode(&hasher.finalize())
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex_bytes(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Stable chunk id: SHA-256 over (url, heading path, block index),
/// truncated to 32 hex chars. Identical extracted content at the same URL
/// re-chunks to byte-identical ids.
pub fn chunk_id(url: &str, heading_path: &[String], block_index: usize) -> String {
    let key = format!("{url}\u{1}{}\u{1}{block_index}", heading_path.join("\u{2}"));
    sha256_hex(&key)[..32].to_string()
}

/// Vector-store key for a chunk id (first 16 hex chars as u64).
pub fn vector_key(chunk_id: &str) -> u64 {
    u64::from_str_radix(&chunk_id[..16.min(chunk_id.len())], 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_stable_and_distinct() {
        let path = vec!["Install".to_string(), "Linux".to_string()];
        let a = chunk_id("https://docs.example.com/install", &path, 0);
        let b = chunk_id("https://docs.example.com/install", &path, 0);
        let c = chunk_id("https://docs.example.com/install", &path, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn heading_separator_prevents_collisions() {
        let a = chunk_id("u", &["ab".to_string(), "c".to_string()], 0);
        let b = chunk_id("u", &["a".to_string(), "bc".to_string()], 0);
        assert_ne!(a, b);
    }

    #[test]
    fn pause_guard_tracks_depth() {
        let signals = BackgroundSignals::new();
        assert!(!signals.paused());
        {
            let _g1 = signals.pause_guard();
            let _g2 = signals.pause_guard();
            assert!(signals.paused());
        }
        assert!(!signals.paused());
    }

    #[test]
    fn cancel_is_terminal() {
        let signals = BackgroundSignals::new();
        assert!(!signals.cancelled());
        signals.cancel();
        assert!(signals.cancelled());
    }
}
