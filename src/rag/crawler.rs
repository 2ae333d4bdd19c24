//! URL discovery for documentation sites.
//!
//! Three modes, tried in order: sitemap (discovered through robots.txt or
//! well-known locations, with recursive sitemap-index parsing and a
//! lastmod-keyed sub-sitemap cache), recursive same-domain BFS, and manual
//! URL lists (additive by default, or exclusive).
//!
//! Robots.txt is honoured; if it fails to load, crawling proceeds
//! (fail-open).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RagSettings;

/// User agent announced while crawling.
pub const CRAWLER_USER_AGENT: &str = "docgate-crawler/0.4 (respectful documentation indexer)";

/// A discovered URL with its sitemap `lastmod`, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredUrl {
    /// Normalised URL.
    pub url: String,
    /// `lastmod` from the sitemap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastmod: Option<String>,
}

/// Cached sub-sitemap: its own `lastmod` plus the URLs it listed last time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubSitemapEntry {
    /// `lastmod` of the sub-sitemap itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastmod: Option<String>,
    /// URLs listed by this sub-sitemap.
    #[serde(default)]
    pub urls: Vec<DiscoveredUrl>,
}

/// Sub-sitemap URL → cached entry. Persisted as `sitemap_cache.json`.
pub type SitemapCache = HashMap<String, SubSitemapEntry>;

/// Minimal robots.txt rules for one matched agent group.
#[derive(Debug, Clone, Default)]
struct RobotRules {
    disallow: Vec<String>,
    allow: Vec<String>,
}

impl RobotRules {
    /// Longest-prefix match between allow and disallow rules.
    fn can_fetch(&self, path: &str) -> bool {
        let longest = |rules: &[String]| {
            rules
                .iter()
                .filter(|r| !r.is_empty() && path.starts_with(r.as_str()))
                .map(|r| r.len())
                .max()
        };
        match (longest(&self.allow), longest(&self.disallow)) {
            (Some(a), Some(d)) => a >= d,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }
}

/// URL discovery over one documentation site.
pub struct Crawler {
    settings: RagSettings,
    client: reqwest::Client,
    base_url: String,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    robots: Option<RobotRules>,
    sitemap_hints: Vec<String>,
}

impl Crawler {
    /// Build a crawler; robots.txt is loaded lazily by [`Crawler::init`].
    pub fn new(settings: &RagSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(CRAWLER_USER_AGENT)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        let include = settings
            .url_include_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<_, _>>()?;
        let exclude = settings
            .url_exclude_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            settings: settings.clone(),
            client,
            include,
            exclude,
            robots: None,
            sitemap_hints: Vec::new(),
        })
    }

    /// Load robots.txt, trying the base URL and then the root domain when
    /// the base is on a subdomain. Failures are logged and crawling
    /// proceeds unrestricted.
    pub async fn init(&mut self) {
        let mut candidates = vec![format!("{}/robots.txt", origin_of(&self.base_url))];
        if let Some(root) = root_domain_origin(&self.base_url) {
            let root_robots = format!("{root}/robots.txt");
            if !candidates.contains(&root_robots) {
                candidates.push(root_robots);
            }
        }

        for robots_url in candidates {
            match self.fetch_text(&robots_url).await {
                Ok(body) => {
                    let (rules, sitemaps) = parse_robots(&body, "docgate");
                    tracing::info!(
                        url = %robots_url,
                        sitemaps = sitemaps.len(),
                        "Loaded robots.txt"
                    );
                    self.robots = Some(rules);
                    self.sitemap_hints = sitemaps;
                    return;
                }
                Err(e) => {
                    tracing::debug!(url = %robots_url, error = %e, "No robots.txt here");
                }
            }
        }
        tracing::info!("No robots.txt found, proceeding without restrictions");
    }

    /// Whether robots.txt permits fetching `url`.
    pub fn robots_allow(&self, url: &str) -> bool {
        match &self.robots {
            Some(rules) => {
                let path = Url::parse(url)
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|_| "/".to_string());
                rules.can_fetch(&path)
            }
            None => true,
        }
    }

    /// The crawl's base URL (normalised, no trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Discover URLs: manual list first, then sitemap, then recursive BFS
    /// as fallback. Deduplicates by normalised URL (first occurrence wins)
    /// and applies the `max_pages` cap after a global lastmod-descending
    /// sort so the cap keeps the freshest content.
    pub async fn discover(&self, sitemap_cache: &mut SitemapCache) -> Vec<DiscoveredUrl> {
        let mut urls: Vec<DiscoveredUrl> = Vec::new();

        if !self.settings.manual_urls.is_empty() {
            tracing::info!(count = self.settings.manual_urls.len(), "Adding manual URLs");
            urls.extend(self.settings.manual_urls.iter().map(|u| DiscoveredUrl {
                url: normalize_url(u),
                lastmod: None,
            }));
        }

        if self.settings.manual_urls_only {
            tracing::info!("Manual URLs only mode, skipping automated crawling");
            return dedup_urls(urls);
        }

        let sitemap_urls = self.discover_via_sitemap(sitemap_cache).await;
        if !sitemap_urls.is_empty() {
            tracing::info!(count = sitemap_urls.len(), "Found URLs from sitemap");
            urls.extend(sitemap_urls);
        } else {
            tracing::info!("No sitemap found, falling back to recursive crawl");
            let crawled = self.recursive_crawl().await;
            tracing::info!(count = crawled.len(), "Recursive crawl finished");
            urls.extend(crawled);
        }

        let mut unique = dedup_urls(urls);

        // Freshest first, then cap.
        unique.sort_by(|a, b| b.lastmod.cmp(&a.lastmod));
        if self.settings.max_pages > 0 && unique.len() > self.settings.max_pages {
            tracing::info!(
                limit = self.settings.max_pages,
                found = unique.len(),
                "Capping discovered URLs"
            );
            unique.truncate(self.settings.max_pages);
        }

        tracing::info!(total = unique.len(), "URL discovery complete");
        unique
    }

    /// Try sitemap locations: robots.txt hints first, then well-known
    /// paths.
    async fn discover_via_sitemap(&self, cache: &mut SitemapCache) -> Vec<DiscoveredUrl> {
        let mut candidates = self.sitemap_hints.clone();
        candidates.extend([
            format!("{}/sitemap.xml", self.base_url),
            format!("{}/sitemap_index.xml", self.base_url),
            format!("{}/server-sitemap.xml", self.base_url),
        ]);

        for sitemap_url in candidates {
            match self.fetch_bytes(&sitemap_url).await {
                Ok(body) => {
                    let urls = self.walk_sitemap(&sitemap_url, &body, cache, 0).await;
                    if !urls.is_empty() {
                        tracing::info!(url = %sitemap_url, "Parsed sitemap");
                        return urls;
                    }
                    tracing::info!(url = %sitemap_url, "Sitemap fetched but 0 URLs after filtering");
                }
                Err(e) => {
                    tracing::debug!(url = %sitemap_url, error = %e, "Sitemap fetch failed");
                }
            }
        }
        Vec::new()
    }

    /// Parse one sitemap document; recurse into sub-sitemaps, refetching
    /// only those whose `lastmod` changed since the cached pass.
    async fn walk_sitemap(
        &self,
        source_url: &str,
        body: &[u8],
        cache: &mut SitemapCache,
        depth: usize,
    ) -> Vec<DiscoveredUrl> {
        // Defensive bound against self-referencing sitemap indexes.
        if depth > 4 {
            tracing::warn!(url = %source_url, "Sitemap nesting too deep, stopping");
            return Vec::new();
        }

        let parsed = match parse_sitemap_xml(body) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(url = %source_url, error = %e, "Failed to parse sitemap XML");
                return Vec::new();
            }
        };

        if !parsed.sub_sitemaps.is_empty() {
            tracing::info!(
                url = %source_url,
                count = parsed.sub_sitemaps.len(),
                "Sitemap index found, processing sub-sitemaps (newest first)"
            );
            let mut subs = parsed.sub_sitemaps;
            subs.sort_by(|a, b| b.lastmod.cmp(&a.lastmod));

            let mut urls = Vec::new();
            for sub in subs {
                let cached = cache.get(&sub.url);
                let fresh = cached.is_some_and(|entry| {
                    entry.lastmod.is_some() && entry.lastmod == sub.lastmod
                });
                if fresh {
                    if let Some(entry) = cached {
                        urls.extend(entry.urls.clone());
                    }
                    continue;
                }

                tokio::time::sleep(Duration::from_millis(self.settings.rate_limit_delay_ms)).await;
                match self.fetch_bytes(&sub.url).await {
                    Ok(sub_body) => {
                        let sub_urls =
                            Box::pin(self.walk_sitemap(&sub.url, &sub_body, cache, depth + 1))
                                .await;
                        cache.insert(
                            sub.url.clone(),
                            SubSitemapEntry {
                                lastmod: sub.lastmod.clone(),
                                urls: sub_urls.clone(),
                            },
                        );
                        urls.extend(sub_urls);
                    }
                    Err(e) => {
                        tracing::warn!(url = %sub.url, error = %e, "Failed to fetch sub-sitemap");
                    }
                }
            }
            return urls;
        }

        parsed
            .urls
            .into_iter()
            .map(|entry| DiscoveredUrl {
                url: normalize_url(&entry.url),
                lastmod: entry.lastmod,
            })
            .filter(|u| self.should_crawl(&u.url))
            .collect()
    }

    /// Breadth-first link following from the base URL, bounded by depth and
    /// the same-domain constraint.
    async fn recursive_crawl(&self) -> Vec<DiscoveredUrl> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queued: HashSet<String> = HashSet::new();
        let mut to_visit: VecDeque<(String, usize)> = VecDeque::new();
        let mut urls = Vec::new();

        queued.insert(self.base_url.clone());
        to_visit.push_back((self.base_url.clone(), 0));

        tracing::info!(
            base = %self.base_url,
            max_depth = self.settings.max_crawl_depth,
            "Starting recursive crawl"
        );

        while let Some((current, depth)) = to_visit.pop_front() {
            if self.settings.max_pages > 0 && urls.len() >= self.settings.max_pages {
                break;
            }
            if visited.contains(&current)
                || depth > self.settings.max_crawl_depth
                || !self.should_crawl(&current)
            {
                continue;
            }
            visited.insert(current.clone());
            urls.push(DiscoveredUrl {
                url: current.clone(),
                lastmod: None,
            });

            tokio::time::sleep(Duration::from_millis(self.settings.rate_limit_delay_ms)).await;

            let response = match self.client.get(&current).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(url = %current, error = %e, "Failed to crawl");
                    continue;
                }
            };
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !content_type.contains("text/html") {
                tracing::debug!(url = %current, content_type = %content_type,
                    "Skipping non-HTML content during recursive crawl");
                continue;
            }
            let body = match response.text().await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(url = %current, error = %e, "Failed to read page");
                    continue;
                }
            };

            for href in extract_links(&body, &current, &self.base_url) {
                if !visited.contains(&href) && !queued.contains(&href) {
                    queued.insert(href.clone());
                    to_visit.push_back((href, depth + 1));
                }
            }
        }

        urls
    }

    /// Apply exclude patterns first, then include patterns (if any, a URL
    /// must match at least one).
    pub fn should_crawl(&self, url: &str) -> bool {
        for pattern in &self.exclude {
            if pattern.is_match(url) {
                tracing::debug!(url = %url, "Excluded by pattern");
                return false;
            }
        }
        if !self.include.is_empty() {
            return self.include.iter().any(|p| p.is_match(url));
        }
        true
    }

    async fn fetch_text(&self, url: &str) -> anyhow::Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    async fn fetch_bytes(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Drop query params, fragments, and trailing slashes.
pub fn normalize_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query.trim_end_matches('/').to_string()
}

/// Scheme + authority of a URL, falling back to the input on parse failure.
fn origin_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default()
        ),
        Err(_) => url.to_string(),
    }
}

/// Origin of the registrable root domain, when the base sits on a
/// subdomain (`developer.example.com` → `https://example.com`).
fn root_domain_origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() > 2 {
        let root = parts[parts.len() - 2..].join(".");
        Some(format!("{}://{}", parsed.scheme(), root))
    } else {
        None
    }
}

/// Parse robots.txt into rules for our agent (falling back to `*`) plus
/// sitemap hints.
fn parse_robots(body: &str, agent_token: &str) -> (RobotRules, Vec<String>) {
    let mut sitemaps = Vec::new();
    let mut star = RobotRules::default();
    let mut ours = RobotRules::default();
    let mut current: Vec<String> = Vec::new();
    let mut last_was_agent = false;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();

        match field.as_str() {
            "sitemap" => sitemaps.push(value.to_string()),
            "user-agent" => {
                // Consecutive agent lines share a group; an agent line
                // after rules starts a new group.
                if !last_was_agent {
                    current.clear();
                }
                current.push(value.to_ascii_lowercase());
                last_was_agent = true;
            }
            "disallow" | "allow" => {
                last_was_agent = false;
                let targets_star = current.iter().any(|a| a == "*");
                let targets_us = current
                    .iter()
                    .any(|a| a.contains(&agent_token.to_ascii_lowercase()));
                let rule = value.to_string();
                if field == "disallow" {
                    if targets_star {
                        star.disallow.push(rule.clone());
                    }
                    if targets_us {
                        ours.disallow.push(rule);
                    }
                } else {
                    if targets_star {
                        star.allow.push(rule.clone());
                    }
                    if targets_us {
                        ours.allow.push(rule);
                    }
                }
            }
            _ => {
                last_was_agent = false;
            }
        }
    }

    let rules = if !ours.disallow.is_empty() || !ours.allow.is_empty() {
        ours
    } else {
        star
    };
    (rules, sitemaps)
}

/// Dedup by URL, first occurrence winning (manual URLs are added first and
/// therefore prevail on overlap).
fn dedup_urls(urls: Vec<DiscoveredUrl>) -> Vec<DiscoveredUrl> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|u| seen.insert(u.url.clone()))
        .collect()
}

#[derive(Debug, Default)]
struct ParsedSitemap {
    sub_sitemaps: Vec<DiscoveredUrl>,
    urls: Vec<DiscoveredUrl>,
}

/// Event-based sitemap parse handling both `<sitemapindex>` and `<urlset>`
/// documents, with or without the namespace prefix.
fn parse_sitemap_xml(body: &[u8]) -> anyhow::Result<ParsedSitemap> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut out = ParsedSitemap::default();
    let mut in_sitemap = false;
    let mut in_url = false;
    let mut current_tag: Option<String> = None;
    let mut loc: Option<String> = None;
    let mut lastmod: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "sitemap" => {
                        in_sitemap = true;
                        loc = None;
                        lastmod = None;
                    }
                    "url" => {
                        in_url = true;
                        loc = None;
                        lastmod = None;
                    }
                    "loc" | "lastmod" => current_tag = Some(name),
                    _ => current_tag = None,
                }
            }
            Event::Text(t) => {
                if in_sitemap || in_url {
                    let text = t.unescape()?.trim().to_string();
                    match current_tag.as_deref() {
                        Some("loc") => loc = Some(text),
                        Some("lastmod") => lastmod = Some(text),
                        _ => {}
                    }
                }
            }
            Event::End(e) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "sitemap" => {
                        if let Some(url) = loc.take() {
                            out.sub_sitemaps.push(DiscoveredUrl {
                                url,
                                lastmod: lastmod.take(),
                            });
                        }
                        in_sitemap = false;
                    }
                    "url" => {
                        if let Some(url) = loc.take() {
                            out.urls.push(DiscoveredUrl {
                                url,
                                lastmod: lastmod.take(),
                            });
                        }
                        in_url = false;
                    }
                    "loc" | "lastmod" => current_tag = None,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

fn local_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    name.rsplit(':').next().unwrap_or(&name).to_ascii_lowercase()
}

/// Extract same-domain links from a page, absolutised and normalised.
fn extract_links(html: &str, page_url: &str, base_url: &str) -> Vec<String> {
    static LINKS: once_cell::sync::Lazy<Selector> =
        once_cell::sync::Lazy::new(|| Selector::parse("a[href]").expect("static selector"));

    let document = Html::parse_document(html);
    let mut links = Vec::new();

    for element in document.select(&LINKS) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with('#')
            || href.starts_with("javascript:")
        {
            continue;
        }

        let absolute = if href.starts_with('/') {
            format!("{base_url}{href}")
        } else if href.starts_with("http") {
            if !href.starts_with(base_url) {
                continue;
            }
            href.to_string()
        } else {
            match Url::parse(page_url).and_then(|base| base.join(href)) {
                Ok(joined) => joined.to_string(),
                Err(_) => continue,
            }
        };

        if !absolute.starts_with(base_url) {
            continue;
        }
        links.push(normalize_url(&absolute));
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_query_fragment_slash() {
        assert_eq!(
            normalize_url("https://docs.example.com/page/?v=2#anchor"),
            "https://docs.example.com/page"
        );
        assert_eq!(
            normalize_url("https://docs.example.com/page"),
            "https://docs.example.com/page"
        );
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let urls = vec![
            DiscoveredUrl {
                url: "https://a".into(),
                lastmod: None,
            },
            DiscoveredUrl {
                url: "https://a".into(),
                lastmod: Some("2026-01-01".into()),
            },
            DiscoveredUrl {
                url: "https://b".into(),
                lastmod: None,
            },
        ];
        let out = dedup_urls(urls);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].lastmod, None);
    }

    #[test]
    fn parses_urlset_with_namespace() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://docs.example.com/a</loc><lastmod>2026-03-01</lastmod></url>
              <url><loc>https://docs.example.com/b</loc></url>
            </urlset>"#;
        let parsed = parse_sitemap_xml(xml).unwrap();
        assert_eq!(parsed.urls.len(), 2);
        assert_eq!(parsed.urls[0].lastmod.as_deref(), Some("2026-03-01"));
        assert!(parsed.sub_sitemaps.is_empty());
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = br#"<sitemapindex>
              <sitemap><loc>https://docs.example.com/sitemap-1.xml</loc>
                <lastmod>2026-02-01</lastmod></sitemap>
              <sitemap><loc>https://docs.example.com/sitemap-2.xml</loc></sitemap>
            </sitemapindex>"#;
        let parsed = parse_sitemap_xml(xml).unwrap();
        assert_eq!(parsed.sub_sitemaps.len(), 2);
        assert_eq!(
            parsed.sub_sitemaps[0].lastmod.as_deref(),
            Some("2026-02-01")
        );
    }

    #[test]
    fn robots_rules_longest_match() {
        let body = "User-agent: *\nDisallow: /private/\nAllow: /private/docs/\nSitemap: https://docs.example.com/sitemap.xml\n";
        let (rules, sitemaps) = parse_robots(body, "docgate");
        assert!(rules.can_fetch("/public/page"));
        assert!(!rules.can_fetch("/private/secret"));
        assert!(rules.can_fetch("/private/docs/guide"));
        assert_eq!(sitemaps.len(), 1);
    }

    #[test]
    fn link_extraction_confines_to_base() {
        let html = r#"<html><body>
            <a href="/guide">Guide</a>
            <a href="https://docs.example.com/api/">API</a>
            <a href="https://other.example.net/away">External</a>
            <a href="mailto:x@example.com">Mail</a>
            <a href="#section">Anchor</a>
        </body></html>"#;
        let links = extract_links(html, "https://docs.example.com/start", "https://docs.example.com");
        assert_eq!(
            links,
            vec![
                "https://docs.example.com/guide".to_string(),
                "https://docs.example.com/api".to_string(),
            ]
        );
    }

    #[test]
    fn root_domain_fallback_only_for_subdomains() {
        assert_eq!(
            root_domain_origin("https://developer.example.com/docs"),
            Some("https://example.com".to_string())
        );
        assert_eq!(root_domain_origin("https://example.com/docs"), None);
    }

    #[test]
    fn include_exclude_filtering() {
        let mut settings = RagSettings {
            base_url: "https://docs.example.com".into(),
            ..Default::default()
        };
        settings.url_exclude_patterns = vec!["/changelog".into()];
        settings.url_include_patterns = vec!["/docs/".into()];
        let crawler = Crawler::new(&settings).unwrap();
        assert!(crawler.should_crawl("https://docs.example.com/docs/install"));
        assert!(!crawler.should_crawl("https://docs.example.com/blog/post"));
        assert!(!crawler.should_crawl("https://docs.example.com/docs/changelog"));
    }
}
