//! Parallel page fetching with a TTL-bounded page cache.
//!
//! Each URL first consults the cache (valid unless its sitemap `lastmod`
//! changed, its TTL expired, or the caller forced a refresh). Fresh fetches
//! run through a bounded worker pool, reject non-HTML content, confine
//! redirects to the crawl's base authority, and feed a three-strike skip
//! list persisted in the crawl state. A response-status histogram is
//! reported when the round completes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use url::Url;

use crate::config::RagSettings;
use crate::rag::crawler::{Crawler, DiscoveredUrl, CRAWLER_USER_AGENT};
use crate::rag::extract::extract_main_content;
use crate::rag::{sha256_hex, CrawlState, PageRecord, UrlFailure};

/// One successfully fetched (or cache-served) page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Page URL.
    pub url: String,
    /// Extracted main-content HTML.
    pub html: String,
    /// Sitemap `lastmod`, if known.
    pub lastmod: Option<String>,
    /// SHA-256 of the extracted content.
    pub content_hash: String,
    /// Served from the page cache without touching the network.
    pub from_cache: bool,
}

enum FetchOutcome {
    Page(Box<FetchedPage>, Option<u16>),
    Skipped,
    Failed { url: String, error: String, status: Option<u16> },
}

/// Page fetcher over one crawl's base authority.
pub struct PageFetcher {
    settings: RagSettings,
    client: reqwest::Client,
    pages_dir: PathBuf,
}

impl PageFetcher {
    /// Create a fetcher caching pages under `pages_dir`.
    ///
    /// gzip and deflate are accepted; brotli is deliberately not enabled
    /// (decode failures observed on some documentation CDNs).
    pub fn new(settings: &RagSettings, pages_dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&pages_dir)?;
        let client = reqwest::Client::builder()
            .user_agent(CRAWLER_USER_AGENT)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            settings: settings.clone(),
            client,
            pages_dir,
        })
    }

    /// Fetch a batch of URLs through the worker pool, updating the failure
    /// skip list in `state`. Returns the pages that produced content.
    pub async fn fetch_pages(
        &self,
        crawler: &Crawler,
        urls: &[DiscoveredUrl],
        state: &mut CrawlState,
        force_refresh: bool,
    ) -> Vec<FetchedPage> {
        // Three-strike skip list.
        let (eligible, skipped): (Vec<_>, Vec<_>) = urls.iter().partition(|u| {
            state
                .failed_urls
                .get(&u.url)
                .map(|f| f.failure_count < self.settings.max_url_retries)
                .unwrap_or(true)
        });
        if !skipped.is_empty() {
            tracing::info!(
                count = skipped.len(),
                limit = self.settings.max_url_retries,
                "Skipping URLs that exceeded the failure limit"
            );
        }

        let outcomes: Vec<FetchOutcome> = stream::iter(eligible.iter().map(|url_info| {
            let url_info = (*url_info).clone();
            async move { self.fetch_one(crawler, &url_info, force_refresh).await }
        }))
        .buffer_unordered(self.settings.max_workers.max(1))
        .collect()
        .await;

        let mut pages = Vec::new();
        let mut histogram: HashMap<String, usize> = HashMap::new();
        let mut cache_hits = 0usize;
        let mut failures = 0usize;

        for outcome in outcomes {
            match outcome {
                FetchOutcome::Page(page, status) => {
                    if page.from_cache {
                        cache_hits += 1;
                        *histogram.entry("cache".to_string()).or_default() += 1;
                    } else if let Some(code) = status {
                        *histogram.entry(code.to_string()).or_default() += 1;
                    }
                    state.failed_urls.remove(&page.url);
                    pages.push(*page);
                }
                FetchOutcome::Skipped => {
                    *histogram.entry("skipped".to_string()).or_default() += 1;
                }
                FetchOutcome::Failed { url, error, status } => {
                    failures += 1;
                    let key = status
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "error".to_string());
                    *histogram.entry(key).or_default() += 1;
                    track_failure(state, &url, &error, self.settings.max_url_retries);
                }
            }
        }

        let mut summary: Vec<(String, usize)> = histogram.into_iter().collect();
        summary.sort();
        tracing::info!(
            fetched = pages.len(),
            cache_hits = cache_hits,
            failed = failures,
            histogram = ?summary,
            "Fetch round complete"
        );

        pages
    }

    async fn fetch_one(
        &self,
        crawler: &Crawler,
        url_info: &DiscoveredUrl,
        force_refresh: bool,
    ) -> FetchOutcome {
        let url = &url_info.url;

        if let Some(cached) = self.load_cached(url, url_info.lastmod.as_deref(), force_refresh) {
            return FetchOutcome::Page(
                Box::new(FetchedPage {
                    url: cached.url,
                    html: cached.html,
                    lastmod: cached.lastmod,
                    content_hash: cached.content_hash,
                    from_cache: true,
                }),
                None,
            );
        }

        if !crawler.robots_allow(url) {
            tracing::warn!(url = %url, "robots.txt disallows");
            return FetchOutcome::Skipped;
        }

        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                return FetchOutcome::Failed {
                    url: url.clone(),
                    error: e.to_string(),
                    status: None,
                }
            }
        };
        let status = response.status().as_u16();

        // Redirect confinement: the final URL must share the crawl's base
        // authority, or the page is discarded.
        if !same_authority(response.url(), crawler.base_url()) {
            tracing::warn!(url = %url, final_url = %response.url(),
                "Redirect escaped the base authority, discarding");
            return FetchOutcome::Failed {
                url: url.clone(),
                error: format!("redirected outside base authority to {}", response.url()),
                status: Some(status),
            };
        }

        if !response.status().is_success() {
            return FetchOutcome::Failed {
                url: url.clone(),
                error: format!("HTTP {status}"),
                status: Some(status),
            };
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/html") {
            tracing::warn!(url = %url, content_type = %content_type, "Skipping non-HTML content");
            return FetchOutcome::Skipped;
        }

        let etag = header_string(&response, reqwest::header::ETAG);
        let last_modified = header_string(&response, reqwest::header::LAST_MODIFIED);

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                return FetchOutcome::Failed {
                    url: url.clone(),
                    error: e.to_string(),
                    status: Some(status),
                }
            }
        };

        let html = extract_main_content(&body, url);
        let content_hash = sha256_hex(&html);
        let record = PageRecord {
            url: url.clone(),
            content_hash: content_hash.clone(),
            etag,
            last_modified,
            lastmod: url_info.lastmod.clone(),
            cached_at: Utc::now().to_rfc3339(),
            html_cache_path: self.cache_path(url).to_string_lossy().to_string(),
            html: html.clone(),
        };
        self.save_cached(&record);

        FetchOutcome::Page(
            Box::new(FetchedPage {
                url: url.clone(),
                html,
                lastmod: url_info.lastmod.clone(),
                content_hash,
                from_cache: false,
            }),
            Some(status),
        )
    }

    /// Cache file path for a URL.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.pages_dir.join(format!("{}.json", &sha256_hex(url)[..32]))
    }

    /// Content hash recorded for a URL's cached page, if any. Read before
    /// a forced refetch so the old and new extractions can be compared.
    pub fn cached_content_hash(&self, url: &str) -> Option<String> {
        let text = std::fs::read_to_string(self.cache_path(url)).ok()?;
        let record: PageRecord = serde_json::from_str(&text).ok()?;
        Some(record.content_hash)
    }

    /// Load a cached page if still valid. Pages with a sitemap `lastmod`
    /// invalidate when it changes; pages without one expire after the TTL.
    fn load_cached(
        &self,
        url: &str,
        lastmod: Option<&str>,
        force_refresh: bool,
    ) -> Option<PageRecord> {
        if force_refresh {
            tracing::debug!(url = %url, "Force refresh requested, skipping cache");
            return None;
        }
        let path = self.cache_path(url);
        let text = std::fs::read_to_string(&path).ok()?;
        let record: PageRecord = serde_json::from_str(&text).ok()?;

        if let Some(lastmod) = lastmod {
            if record.lastmod.as_deref() != Some(lastmod) {
                tracing::debug!(url = %url, "Cache invalidated (lastmod changed)");
                return None;
            }
        } else if self.settings.page_cache_ttl_hours > 0 {
            let cached_at = DateTime::parse_from_rfc3339(&record.cached_at).ok()?;
            let age = Utc::now().signed_duration_since(cached_at.with_timezone(&Utc));
            let ttl = chrono::Duration::hours(self.settings.page_cache_ttl_hours as i64);
            if age >= ttl {
                tracing::debug!(url = %url, "Cache expired");
                return None;
            }
        }

        tracing::debug!(url = %url, "Loaded from page cache");
        Some(record)
    }

    fn save_cached(&self, record: &PageRecord) {
        let path = Path::new(&record.html_cache_path);
        match serde_json::to_string(record) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(url = %record.url, error = %e, "Failed to cache page");
                }
            }
            Err(e) => tracing::warn!(url = %record.url, error = %e, "Failed to serialise page"),
        }
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Whether `final_url` shares scheme, host, and port with the base URL.
fn same_authority(final_url: &Url, base_url: &str) -> bool {
    let Ok(base) = Url::parse(base_url) else {
        return false;
    };
    final_url.scheme() == base.scheme()
        && final_url.host_str() == base.host_str()
        && final_url.port_or_known_default() == base.port_or_known_default()
}

fn track_failure(state: &mut CrawlState, url: &str, error: &str, limit: u32) {
    let entry = state
        .failed_urls
        .entry(url.to_string())
        .or_insert_with(|| UrlFailure {
            failure_count: 0,
            first_error: error.to_string(),
            last_error: error.to_string(),
            last_attempt: Utc::now().to_rfc3339(),
        });
    entry.failure_count += 1;
    entry.last_error = error.to_string();
    entry.last_attempt = Utc::now().to_rfc3339();

    if entry.failure_count >= limit {
        tracing::warn!(url = %url, failures = entry.failure_count, limit = limit,
            "URL will be skipped on future crawls");
    } else {
        tracing::debug!(url = %url, failures = entry.failure_count, limit = limit,
            "URL failure recorded");
    }
}
