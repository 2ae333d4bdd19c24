//! The document search index.
//!
//! Owns the chunk table, parent table, page cache, vector store, lexical
//! index, and manifest. Writers (build, incremental update, rebuild,
//! contextualiser swap-in) take the write lock; searches take the read
//! lock. The lock is never held across network or embedding work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::RagSettings;
use crate::logging::OpTimer;
use crate::rag::chunker::semantic_chunk_html;
use crate::rag::crawler::{Crawler, DiscoveredUrl, SitemapCache};
use crate::rag::embed::{Embedder, Reranker};
use crate::rag::fetcher::{FetchedPage, PageFetcher};
use crate::rag::search::{
    min_max_normalize, reciprocal_rank_fuse, RankedList, SearchHit,
};
use crate::rag::store::{Bm25Index, VectorStore};
use crate::rag::{
    vector_key, BackgroundSignals, Chunk, CrawlState, IndexManifest, ParentChunk, SitemapDiff,
    INDEX_VERSION,
};

/// Manifest/checksum mismatch at load time. Fail-closed: the index refuses
/// to serve queries, while the rest of the gateway keeps running.
#[derive(Debug, thiserror::Error)]
#[error("index corruption detected: {0}")]
pub struct IndexCorruption(pub String);

#[derive(Debug, Clone)]
struct IndexPaths {
    manifest: PathBuf,
    chunks: PathBuf,
    parents: PathBuf,
    crawl_state: PathBuf,
    sitemap_cache: PathBuf,
    vector_store: PathBuf,
    pages_dir: PathBuf,
}

impl IndexPaths {
    fn new(cache_dir: &PathBuf) -> Self {
        Self {
            manifest: cache_dir.join("manifest.json"),
            chunks: cache_dir.join("chunks.json"),
            parents: cache_dir.join("parents.json"),
            crawl_state: cache_dir.join("crawl_state.json"),
            sitemap_cache: cache_dir.join("sitemap_cache.json"),
            vector_store: cache_dir.join("vector_store").join("index.usearch"),
            pages_dir: cache_dir.join("pages"),
        }
    }
}

#[derive(Default)]
struct IndexState {
    chunks: Vec<Chunk>,
    by_id: HashMap<String, usize>,
    key_to_id: HashMap<u64, String>,
    parents: HashMap<String, ParentChunk>,
    child_to_parent: HashMap<String, String>,
    vectors: Option<VectorStore>,
    bm25: Bm25Index,
}

impl IndexState {
    /// Rebuild the id and child→parent maps from chunk metadata. The
    /// child→parent map is never persisted.
    fn rebuild_maps(&mut self) {
        self.by_id.clear();
        self.key_to_id.clear();
        self.child_to_parent.clear();
        for (pos, chunk) in self.chunks.iter().enumerate() {
            self.by_id.insert(chunk.chunk_id.clone(), pos);
            self.key_to_id
                .insert(vector_key(&chunk.chunk_id), chunk.chunk_id.clone());
            if let Some(parent_id) = &chunk.parent_id {
                self.child_to_parent
                    .insert(chunk.chunk_id.clone(), parent_id.clone());
            }
        }
    }

    /// Rebuild the lexical index over live (non-tombstoned) chunks.
    fn rebuild_bm25(&mut self) {
        self.bm25 = Bm25Index::build(
            self.chunks
                .iter()
                .filter(|c| !c.metadata.tombstoned)
                .map(|c| (c.chunk_id.as_str(), c.text.as_str())),
        );
    }

    fn has_live_url(&self, url: &str) -> bool {
        self.chunks
            .iter()
            .any(|c| c.metadata.url == url && !c.metadata.tombstoned)
    }

    fn tombstone_url(&mut self, url: &str) -> usize {
        let mut count = 0;
        for chunk in &mut self.chunks {
            if chunk.metadata.url == url && !chunk.metadata.tombstoned {
                chunk.metadata.tombstoned = true;
                count += 1;
            }
        }
        count
    }

    fn tombstone_ratio(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        let dead = self.chunks.iter().filter(|c| c.metadata.tombstoned).count();
        dead as f64 / self.chunks.len() as f64
    }

    fn live_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| !c.metadata.tombstoned)
            .count()
    }
}

/// The document search index.
pub struct DocIndex {
    settings: RagSettings,
    paths: IndexPaths,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    signals: Arc<BackgroundSignals>,
    crawler: Mutex<Crawler>,
    fetcher: PageFetcher,
    crawl_state: Mutex<CrawlState>,
    inner: RwLock<IndexState>,
}

impl DocIndex {
    /// Create an index rooted at the configured cache directory.
    pub fn new(
        settings: RagSettings,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        signals: Arc<BackgroundSignals>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&settings.cache_dir)?;
        let paths = IndexPaths::new(&settings.cache_dir);
        if let Some(parent) = paths.vector_store.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let crawler = Crawler::new(&settings)?;
        let fetcher = PageFetcher::new(&settings, paths.pages_dir.clone())?;
        let crawl_state = load_json(&paths.crawl_state).unwrap_or_default();

        Ok(Self {
            settings,
            paths,
            embedder,
            reranker,
            signals,
            crawler: Mutex::new(crawler),
            fetcher,
            crawl_state: Mutex::new(crawl_state),
            inner: RwLock::new(IndexState::default()),
        })
    }

    /// Settings this index runs under.
    pub fn settings(&self) -> &RagSettings {
        &self.settings
    }

    /// Shared background signals (pause / cancel / wake).
    pub fn signals(&self) -> &Arc<BackgroundSignals> {
        &self.signals
    }

    /// Whether the index currently has searchable content.
    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.live_count() > 0
    }

    /// Current tombstone ratio.
    pub async fn tombstone_ratio(&self) -> f64 {
        self.inner.read().await.tombstone_ratio()
    }

    /// Load the persisted index, or build it from a crawl when loading is
    /// not possible. Corruption fails closed with [`IndexCorruption`].
    pub async fn ensure_ready(&self, force_rebuild: bool, force_refresh: bool) -> anyhow::Result<()> {
        self.crawler.lock().await.init().await;

        if !force_rebuild {
            match self.load().await {
                Ok(true) => {
                    let expanded = {
                        let state = self.crawl_state.lock().await;
                        self.settings.max_pages == 0 && state.max_pages_limit != 0
                            || (self.settings.max_pages > state.max_pages_limit
                                && state.max_pages_limit != 0)
                    };
                    if expanded {
                        tracing::info!("max_pages grew past the indexed limit, indexing more pages");
                        self.build(false, force_refresh).await?;
                    } else if force_refresh {
                        self.build(false, true).await?;
                    }
                    return Ok(());
                }
                Ok(false) => {
                    tracing::info!("No usable cached index, building from crawl");
                }
                Err(e) if e.is::<IndexCorruption>() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load cached index, rebuilding");
                }
            }
        }

        self.build(force_rebuild, force_refresh).await
    }

    /// Load from cache. Returns `Ok(false)` when there is nothing usable,
    /// `Err(IndexCorruption)` on checksum mismatch.
    async fn load(&self) -> anyhow::Result<bool> {
        let Some(manifest) = load_json::<IndexManifest>(&self.paths.manifest) else {
            return Ok(false);
        };

        if manifest.version != INDEX_VERSION {
            tracing::info!(
                old = %manifest.version,
                new = %INDEX_VERSION,
                "Index version changed, rebuild required"
            );
            // Old chunks were cut by a different chunker; the crawl state
            // must not mask their URLs from the rebuild.
            let mut state = self.crawl_state.lock().await;
            state.indexed_urls.clear();
            save_json(&self.paths.crawl_state, &*state)?;
            return Ok(false);
        }

        let chunks: Vec<Chunk> = load_json(&self.paths.chunks).unwrap_or_default();
        if chunks.is_empty() {
            return Ok(false);
        }
        let parents: HashMap<String, ParentChunk> =
            load_json(&self.paths.parents).unwrap_or_default();

        // Embedding model changed: re-embed the saved chunk table without
        // re-crawling.
        if manifest.embedding_model != self.embedder.model_name() {
            tracing::info!(
                index_model = %manifest.embedding_model,
                config_model = %self.embedder.model_name(),
                "Embedding model changed, rebuilding embeddings from saved chunks"
            );
            {
                let mut inner = self.inner.write().await;
                inner.chunks = chunks;
                inner.parents = parents;
                inner.rebuild_maps();
            }
            self.rebuild_embeddings().await?;
            return Ok(true);
        }

        // Fail closed when the vector store does not match its manifest.
        if !self.paths.vector_store.exists() {
            return Ok(false);
        }
        let actual = VectorStore::checksum_of(&self.paths.vector_store)?;
        if actual != manifest.vector_store_checksum {
            return Err(IndexCorruption(format!(
                "vector store checksum mismatch (manifest {}…, actual {}…); \
                 delete the cache directory to rebuild",
                &manifest.vector_store_checksum[..16.min(manifest.vector_store_checksum.len())],
                &actual[..16]
            ))
            .into());
        }
        if let Some(sidecar) = VectorStore::sidecar_checksum(&self.paths.vector_store) {
            if sidecar != actual {
                return Err(IndexCorruption(
                    "vector store sidecar checksum disagrees with the store".to_string(),
                )
                .into());
            }
        }

        let timer = OpTimer::new("rag", "load_index");
        let vectors = VectorStore::load(&self.paths.vector_store, self.embedder.dimensions())?;

        let mut inner = self.inner.write().await;
        inner.chunks = chunks;
        inner.parents = parents;
        inner.vectors = Some(vectors);
        inner.rebuild_maps();
        inner.rebuild_bm25();
        let live = inner.live_count();
        drop(inner);
        timer.finish();

        tracing::info!(chunks = live, "Index loaded from cache");
        Ok(true)
    }

    /// Full build: discover, fetch, chunk, embed, persist. With
    /// `force_rebuild` all prior state is discarded; `force_refresh`
    /// bypasses the page cache.
    pub async fn build(&self, force_rebuild: bool, force_refresh: bool) -> anyhow::Result<()> {
        let timer = OpTimer::new("rag", "build");

        if force_rebuild {
            let mut state = self.crawl_state.lock().await;
            *state = CrawlState::default();
            let mut inner = self.inner.write().await;
            *inner = IndexState::default();
        }

        // Resume path: a crash between saving the chunk tables and the
        // manifest leaves chunks.json without a trustworthy vector store.
        // Reload the tables and re-embed them before crawling for more.
        if !force_rebuild {
            let empty = self.inner.read().await.chunks.is_empty();
            if empty {
                let chunks: Vec<Chunk> = load_json(&self.paths.chunks).unwrap_or_default();
                if !chunks.is_empty() {
                    tracing::info!(
                        count = chunks.len(),
                        "Resuming from saved chunk tables, re-embedding"
                    );
                    let parents: HashMap<String, ParentChunk> =
                        load_json(&self.paths.parents).unwrap_or_default();
                    {
                        let mut inner = self.inner.write().await;
                        inner.chunks = chunks;
                        inner.parents = parents;
                        inner.rebuild_maps();
                    }
                    self.rebuild_embeddings().await?;
                }
            }
        }

        tracing::info!("Phase 1/4: discovering URLs");
        let discovered = self.discover().await;
        if discovered.is_empty() {
            anyhow::bail!("no URLs discovered; check BASE_URL and crawl settings");
        }
        {
            let mut state = self.crawl_state.lock().await;
            state.discovered_urls = discovered.iter().map(|u| u.url.clone()).collect();
            state.crawl_complete = true;
            state.max_pages_limit = self.settings.max_pages;
            save_json(&self.paths.crawl_state, &*state)?;
        }

        // Only fetch what is not already indexed, unless refreshing.
        let to_fetch: Vec<DiscoveredUrl> = {
            let state = self.crawl_state.lock().await;
            if force_refresh {
                discovered.clone()
            } else {
                discovered
                    .iter()
                    .filter(|u| !state.indexed_urls.contains_key(&u.url))
                    .cloned()
                    .collect()
            }
        };
        if to_fetch.is_empty() {
            tracing::info!("All discovered URLs already indexed");
            timer.finish();
            return Ok(());
        }

        tracing::info!(count = to_fetch.len(), "Phase 2/4: fetching pages");
        let pages = {
            let crawler = self.crawler.lock().await;
            let mut state = self.crawl_state.lock().await;
            let pages = self
                .fetcher
                .fetch_pages(&crawler, &to_fetch, &mut state, force_refresh)
                .await;
            save_json(&self.paths.crawl_state, &*state)?;
            pages
        };
        if pages.is_empty() {
            anyhow::bail!("no pages fetched");
        }

        tracing::info!(count = pages.len(), "Phase 3/4: chunking pages");
        let pages = dedup_by_content(pages);
        // Pages whose chunks are already live need no re-chunking;
        // re-chunking would duplicate ids.
        let fresh: Vec<&FetchedPage> = {
            let inner = self.inner.read().await;
            pages
                .iter()
                .filter(|p| !inner.has_live_url(&p.url))
                .collect()
        };
        let mut new_chunks = Vec::new();
        let mut new_parents = Vec::new();
        for page in &fresh {
            let chunked =
                semantic_chunk_html(&page.html, &page.url, page.lastmod.as_deref(), &self.settings);
            new_parents.extend(chunked.parents);
            new_chunks.extend(chunked.children);
        }
        tracing::info!(
            children = new_chunks.len(),
            parents = new_parents.len(),
            "Phase 4/4: embedding and indexing"
        );

        self.ingest(new_parents, new_chunks, &pages).await?;
        timer.finish();
        Ok(())
    }

    /// Discover URLs through the crawler, persisting the sub-sitemap cache.
    pub async fn discover(&self) -> Vec<DiscoveredUrl> {
        let mut sitemap_cache: SitemapCache = load_json(&self.paths.sitemap_cache).unwrap_or_default();
        let crawler = self.crawler.lock().await;
        let urls = crawler.discover(&mut sitemap_cache).await;
        if let Err(e) = save_json(&self.paths.sitemap_cache, &sitemap_cache) {
            tracing::warn!(error = %e, "Failed to save sitemap cache");
        }
        urls
    }

    /// Compare a discovery result against the indexed set.
    pub async fn compute_diff(&self, discovered: &[DiscoveredUrl]) -> SitemapDiff {
        let state = self.crawl_state.lock().await;
        let mut diff = SitemapDiff::default();
        let discovered_set: HashMap<&str, &Option<String>> = discovered
            .iter()
            .map(|u| (u.url.as_str(), &u.lastmod))
            .collect();

        for url in discovered {
            match state.indexed_urls.get(&url.url) {
                None => diff.new.push((url.url.clone(), url.lastmod.clone())),
                Some(indexed_lastmod) => {
                    // Unknown lastmods compare as "unknown": treat as
                    // updated and let the content hash decide at fetch time.
                    let unchanged = url.lastmod.is_some() && *indexed_lastmod == url.lastmod;
                    if unchanged {
                        diff.unchanged.push(url.url.clone());
                    } else {
                        diff.updated.push((url.url.clone(), url.lastmod.clone()));
                    }
                }
            }
        }
        for url in state.indexed_urls.keys() {
            if !discovered_set.contains_key(url.as_str()) {
                diff.removed.push(url.clone());
            }
        }
        diff
    }

    /// Tombstone every live chunk of `url`. Vectors stay in the store (the
    /// flat index does not support removal); search filters them out.
    pub async fn tombstone_urls(&self, urls: &[String]) -> usize {
        let mut inner = self.inner.write().await;
        let mut total = 0;
        for url in urls {
            total += inner.tombstone_url(url);
        }
        if total > 0 {
            inner.rebuild_bm25();
        }
        drop(inner);

        let mut state = self.crawl_state.lock().await;
        for url in urls {
            state.indexed_urls.remove(url);
        }
        if let Err(e) = save_json(&self.paths.crawl_state, &*state) {
            tracing::warn!(error = %e, "Failed to save crawl state");
        }
        drop(state);

        if total > 0 {
            if let Err(e) = self.persist_tables().await {
                tracing::warn!(error = %e, "Failed to persist chunk tables after tombstoning");
            }
        }
        total
    }

    /// Fetch, chunk, embed, and index a batch of URLs whose old chunks (if
    /// any) are already tombstoned — the updater path for new URLs and
    /// URLs with a changed sitemap lastmod. Returns the number of pages
    /// indexed.
    pub async fn index_batch(&self, urls: &[DiscoveredUrl]) -> anyhow::Result<usize> {
        let pages = {
            let crawler = self.crawler.lock().await;
            let mut state = self.crawl_state.lock().await;
            let pages = self
                .fetcher
                .fetch_pages(&crawler, urls, &mut state, false)
                .await;
            save_json(&self.paths.crawl_state, &*state)?;
            pages
        };
        if pages.is_empty() {
            return Ok(0);
        }

        let pages = dedup_by_content(pages);
        let fresh: Vec<FetchedPage> = {
            let inner = self.inner.read().await;
            pages
                .into_iter()
                .filter(|page| !inner.has_live_url(&page.url))
                .collect()
        };

        let mut new_chunks = Vec::new();
        let mut new_parents = Vec::new();
        for page in &fresh {
            let chunked =
                semantic_chunk_html(&page.html, &page.url, page.lastmod.as_deref(), &self.settings);
            new_parents.extend(chunked.parents);
            new_chunks.extend(chunked.children);
        }
        let count = fresh.len();
        self.ingest(new_parents, new_chunks, &fresh).await?;
        Ok(count)
    }

    /// The fallback for URLs whose lastmod is unknown and cannot be
    /// compared: refetch (bypassing the page cache) and compare content
    /// hashes against the previously cached extraction. Only pages whose
    /// content actually changed are tombstoned and re-indexed; the rest
    /// keep their live chunks untouched. Returns `(changed, unchanged)`
    /// page counts.
    pub async fn refresh_batch(&self, urls: &[DiscoveredUrl]) -> anyhow::Result<(usize, usize)> {
        // Old hashes must be read before the fetch overwrites the records.
        let mut old_hashes = HashMap::new();
        for url in urls {
            if let Some(hash) = self.fetcher.cached_content_hash(&url.url) {
                old_hashes.insert(url.url.clone(), hash);
            }
        }

        let pages = {
            let crawler = self.crawler.lock().await;
            let mut state = self.crawl_state.lock().await;
            let pages = self
                .fetcher
                .fetch_pages(&crawler, urls, &mut state, true)
                .await;
            save_json(&self.paths.crawl_state, &*state)?;
            pages
        };
        self.apply_refresh(pages, &old_hashes).await
    }

    /// Splice refreshed pages in: unchanged hashes keep their live chunks,
    /// changed ones are tombstoned and re-chunked.
    async fn apply_refresh(
        &self,
        pages: Vec<FetchedPage>,
        old_hashes: &HashMap<String, String>,
    ) -> anyhow::Result<(usize, usize)> {
        if pages.is_empty() {
            return Ok((0, 0));
        }
        let pages = dedup_by_content(pages);
        let (changed, unchanged): (Vec<FetchedPage>, Vec<FetchedPage>) = pages
            .into_iter()
            .partition(|page| old_hashes.get(&page.url) != Some(&page.content_hash));

        if !unchanged.is_empty() {
            tracing::info!(
                count = unchanged.len(),
                "Content hashes unchanged, keeping live chunks"
            );
        }
        if changed.is_empty() {
            return Ok((0, unchanged.len()));
        }

        let stale: Vec<String> = changed.iter().map(|p| p.url.clone()).collect();
        self.tombstone_urls(&stale).await;

        let mut new_chunks = Vec::new();
        let mut new_parents = Vec::new();
        for page in &changed {
            let chunked =
                semantic_chunk_html(&page.html, &page.url, page.lastmod.as_deref(), &self.settings);
            new_parents.extend(chunked.parents);
            new_chunks.extend(chunked.children);
        }
        let count = changed.len();
        self.ingest(new_parents, new_chunks, &changed).await?;
        Ok((count, unchanged.len()))
    }

    /// Embed new chunks and splice them into the live index, then persist.
    async fn ingest(
        &self,
        new_parents: Vec<ParentChunk>,
        new_chunks: Vec<Chunk>,
        pages: &[FetchedPage],
    ) -> anyhow::Result<()> {
        // Embed outside any lock.
        let texts: Vec<String> = new_chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_blocking(texts).await?;

        let mut inner = self.inner.write().await;
        if inner.vectors.is_none() {
            inner.vectors = Some(VectorStore::new(self.embedder.dimensions())?);
        }

        for parent in new_parents {
            inner.parents.insert(parent.parent_id.clone(), parent);
        }
        for (chunk, vector) in new_chunks.into_iter().zip(vectors) {
            let key = vector_key(&chunk.chunk_id);
            match inner.by_id.get(&chunk.chunk_id).copied() {
                Some(pos) => {
                    // Same id means same (url, heading path, index): the
                    // vector is already present, refresh the table row.
                    inner.chunks[pos] = chunk;
                }
                None => {
                    if let Some(store) = inner.vectors.as_ref() {
                        store.add(key, &vector)?;
                    }
                    inner.chunks.push(chunk);
                }
            }
        }
        inner.rebuild_maps();
        inner.rebuild_bm25();
        let live = inner.live_count();
        drop(inner);

        {
            let mut state = self.crawl_state.lock().await;
            for page in pages {
                state
                    .indexed_urls
                    .insert(page.url.clone(), page.lastmod.clone());
            }
            save_json(&self.paths.crawl_state, &*state)?;
        }

        self.persist_all().await?;
        tracing::info!(live_chunks = live, "Index updated");
        Ok(())
    }

    /// Re-embed every chunk from the saved chunk table without re-crawling
    /// (embedding model changed).
    pub async fn rebuild_embeddings(&self) -> anyhow::Result<()> {
        let timer = OpTimer::new("rag", "rebuild_embeddings");
        let chunks: Vec<Chunk> = {
            let inner = self.inner.read().await;
            inner.chunks.clone()
        };
        anyhow::ensure!(!chunks.is_empty(), "no saved chunks to re-embed");

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_blocking(texts).await?;

        let store = VectorStore::new(self.embedder.dimensions())?;
        for (chunk, vector) in chunks.iter().zip(&vectors) {
            store.add(vector_key(&chunk.chunk_id), vector)?;
        }

        let mut inner = self.inner.write().await;
        inner.vectors = Some(store);
        inner.rebuild_maps();
        inner.rebuild_bm25();
        drop(inner);

        self.persist_all().await?;
        timer.finish();
        Ok(())
    }

    /// Full rebuild dropping tombstoned chunks: the only point where
    /// vectors are physically removed.
    pub async fn rebuild(&self) -> anyhow::Result<()> {
        let timer = OpTimer::new("rag", "rebuild");
        let live: Vec<Chunk> = {
            let inner = self.inner.read().await;
            inner
                .chunks
                .iter()
                .filter(|c| !c.metadata.tombstoned)
                .cloned()
                .collect()
        };

        let texts: Vec<String> = live.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_blocking(texts).await?;
        let store = VectorStore::new(self.embedder.dimensions())?;
        for (chunk, vector) in live.iter().zip(&vectors) {
            store.add(vector_key(&chunk.chunk_id), vector)?;
        }

        let mut inner = self.inner.write().await;
        let live_urls: std::collections::HashSet<&str> =
            live.iter().map(|c| c.metadata.url.as_str()).collect();
        inner
            .parents
            .retain(|_, parent| live_urls.contains(parent.url.as_str()));
        inner.chunks = live;
        inner.vectors = Some(store);
        inner.rebuild_maps();
        inner.rebuild_bm25();
        let count = inner.chunks.len();
        drop(inner);

        self.persist_all().await?;
        timer.finish();
        tracing::info!(chunks = count, "Full rebuild complete");
        Ok(())
    }

    /// Hybrid search: lexical + semantic candidates, tombstones filtered
    /// before fusion, RRF fusion, cross-encoder rerank, min-max normalise,
    /// parent text attached.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> anyhow::Result<Vec<SearchHit>> {
        let top_k = top_k.unwrap_or(self.settings.search_top_k);
        let pool = self.settings.candidate_pool();

        let query_vec = self
            .embed_blocking(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("query embedding failed"))?;

        struct Candidate {
            chunk_id: String,
            text: String,
            url: String,
            heading_path: String,
            parent_text: Option<String>,
        }

        let (fused, candidates) = {
            let inner = self.inner.read().await;
            anyhow::ensure!(
                inner.vectors.is_some() && inner.live_count() > 0,
                "index is not loaded"
            );

            let lexical: Vec<String> = inner
                .bm25
                .search(query, pool)
                .into_iter()
                .map(|(id, _)| id)
                .filter(|id| is_live(&inner, id))
                .collect();

            // Over-fetch; tombstoned vectors stay in the store and must be
            // filtered before fusion.
            let semantic: Vec<String> = inner
                .vectors
                .as_ref()
                .map(|store| store.search(&query_vec, pool * 2 + 8))
                .transpose()?
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(key, _)| inner.key_to_id.get(&key).cloned())
                .filter(|id| is_live(&inner, id))
                .take(pool)
                .collect();

            let fused = reciprocal_rank_fuse(&[
                RankedList {
                    weight: self.settings.hybrid_lexical_weight,
                    ids: lexical,
                },
                RankedList {
                    weight: self.settings.hybrid_semantic_weight,
                    ids: semantic,
                },
            ]);

            let mut candidates = Vec::new();
            for (id, _) in fused.iter().take(pool) {
                let Some(&pos) = inner.by_id.get(id) else {
                    continue;
                };
                let chunk = &inner.chunks[pos];
                let parent_text = inner
                    .child_to_parent
                    .get(id)
                    .and_then(|pid| inner.parents.get(pid))
                    .map(|p| p.text.clone());
                candidates.push(Candidate {
                    chunk_id: chunk.chunk_id.clone(),
                    text: chunk.text.clone(),
                    url: chunk.metadata.url.clone(),
                    heading_path: chunk.metadata.heading_path.join(" > "),
                    parent_text,
                });
            }
            (fused, candidates)
        };

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Rerank outside the lock.
        let mut scores: Vec<f32> = if self.settings.rerank_enabled {
            if let Some(reranker) = &self.reranker {
                let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
                let reranker = Arc::clone(reranker);
                let query_owned = query.to_string();
                tokio::task::spawn_blocking(move || reranker.rerank(&query_owned, &texts))
                    .await??
            } else {
                fused.iter().take(candidates.len()).map(|(_, s)| *s as f32).collect()
            }
        } else {
            fused.iter().take(candidates.len()).map(|(_, s)| *s as f32).collect()
        };
        min_max_normalize(&mut scores);

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .zip(scores)
            .map(|(c, score)| SearchHit {
                chunk_id: c.chunk_id,
                text: c.text,
                url: c.url,
                heading_path: c.heading_path,
                score: score as f64,
                parent_text: c.parent_text,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Snapshot of live chunks (contextualiser input).
    pub async fn live_chunks(&self) -> Vec<Chunk> {
        let inner = self.inner.read().await;
        inner
            .chunks
            .iter()
            .filter(|c| !c.metadata.tombstoned)
            .cloned()
            .collect()
    }

    /// Apply contextual prefixes to chunks by id, then re-embed everything
    /// and swap the new store in under the write lock.
    pub async fn apply_contextual_prefixes(
        &self,
        prefixed: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            for chunk in &mut inner.chunks {
                if let Some(prefix) = prefixed.get(&chunk.chunk_id) {
                    if chunk.original_text.is_none() {
                        chunk.original_text = Some(chunk.text.clone());
                    }
                    let original = chunk.original_text.clone().unwrap_or_default();
                    chunk.text = format!("{prefix}\n\n{original}");
                }
            }
        }
        self.rebuild_embeddings().await
    }

    async fn embed_blocking(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embedder = Arc::clone(&self.embedder);
        tokio::task::spawn_blocking(move || embedder.embed(&texts)).await?
    }

    /// Persist chunk and parent tables.
    async fn persist_tables(&self) -> anyhow::Result<()> {
        let inner = self.inner.read().await;
        save_json(&self.paths.chunks, &inner.chunks)?;
        save_json(&self.paths.parents, &inner.parents)?;
        Ok(())
    }

    /// Persist tables, vector store, and the manifest (atomically).
    async fn persist_all(&self) -> anyhow::Result<()> {
        let inner = self.inner.read().await;
        save_json(&self.paths.chunks, &inner.chunks)?;
        save_json(&self.paths.parents, &inner.parents)?;

        let checksum = match inner.vectors.as_ref() {
            Some(store) => store.save(&self.paths.vector_store)?,
            None => String::new(),
        };
        let manifest = IndexManifest {
            version: INDEX_VERSION.to_string(),
            embedding_model: self.embedder.model_name().to_string(),
            vector_store_checksum: checksum,
            created_at: chrono::Utc::now().to_rfc3339(),
            chunk_count: inner.chunks.len(),
        };
        save_json_atomic(&self.paths.manifest, &manifest)?;
        Ok(())
    }
}

fn is_live(state: &IndexState, chunk_id: &str) -> bool {
    state
        .by_id
        .get(chunk_id)
        .map(|&pos| !state.chunks[pos].metadata.tombstoned)
        .unwrap_or(false)
}

fn dedup_by_content(pages: Vec<FetchedPage>) -> Vec<FetchedPage> {
    let mut seen = std::collections::HashSet::new();
    let before = pages.len();
    let out: Vec<FetchedPage> = pages
        .into_iter()
        .filter(|p| seen.insert(p.content_hash.clone()))
        .collect();
    let skipped = before - out.len();
    if skipped > 0 {
        tracing::info!(count = skipped, "Deduplicated pages with identical content");
    }
    out
}

fn load_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Option<T> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to parse cached JSON");
            None
        }
    }
}

fn save_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_string(value)?)?;
    Ok(())
}

/// Write via a temp file and rename so readers never observe a torn
/// manifest.
fn save_json_atomic<T: serde::Serialize>(path: &PathBuf, value: &T) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::rag::{chunk_id, ChunkMetadata};

    /// Seed an index with one parent-as-child chunk per `(url, text)` pair.
    pub async fn seed_minimal(index: &DocIndex, entries: &[(&str, &str)]) {
        let mut parents = Vec::new();
        let mut chunks = Vec::new();
        for (i, (url, text)) in entries.iter().enumerate() {
            let heading = vec!["Docs".to_string()];
            let id = chunk_id(url, &heading, i);
            parents.push(ParentChunk {
                parent_id: id.clone(),
                text: format!("parent of: {text}"),
                url: url.to_string(),
                heading_path: heading.clone(),
                lastmod: None,
            });
            chunks.push(Chunk {
                chunk_id: id.clone(),
                parent_id: Some(id),
                text: text.to_string(),
                original_text: None,
                token_count: text.split_whitespace().count(),
                metadata: ChunkMetadata {
                    url: url.to_string(),
                    heading_path: heading,
                    doc_type: "text".to_string(),
                    code_identifiers: Vec::new(),
                    is_parent_as_child: true,
                    tombstoned: false,
                    lastmod: None,
                },
            });
        }
        let pages: Vec<crate::rag::fetcher::FetchedPage> = entries
            .iter()
            .map(|(url, text)| crate::rag::fetcher::FetchedPage {
                url: url.to_string(),
                html: text.to_string(),
                lastmod: None,
                content_hash: crate::rag::sha256_hex(text),
                from_cache: false,
            })
            .collect();
        index.ingest(parents, chunks, &pages).await.unwrap();
    }
}
