//! Configuration management.
//!
//! Configuration is loaded once at startup from defaults, an optional `.env`
//! file, and `DOCGATE_*` environment variables, then frozen. Nothing in the
//! request path mutates it; per-request model overrides are threaded through
//! call options instead (see [`crate::llm`]).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::ToolChoice;

/// Which wire dialect the configured backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Native local-inference protocol (`/api/chat`, NDJSON streaming).
    Native,
    /// OpenAI-compatible protocol (`/v1/chat/completions`, SSE streaming).
    #[default]
    OpenaiCompatible,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::OpenaiCompatible => write!(f, "openai-compatible"),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to. Defaults to loopback; binding elsewhere logs a
    /// security warning at startup.
    pub bind_host: String,
    /// Port to listen on.
    pub bind_port: u16,
    /// Probe the backend before accepting traffic.
    pub health_check_on_startup: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8000,
            health_check_on_startup: true,
        }
    }
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Wire dialect.
    pub backend_type: BackendKind,
    /// Base URL of the backend (e.g. `http://localhost:1234/v1` for an
    /// OpenAI-compatible server, `http://localhost:11434` for native).
    pub endpoint: String,
    /// Default model identifier sent to the backend.
    pub model: String,
    /// Model identifier advertised on `/v1/models`.
    pub served_model_name: String,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds. Applies to the whole streaming body.
    pub read_timeout_secs: u64,
    /// Retry attempts for connection-class failures.
    pub retry_attempts: u32,
    /// Initial retry delay in seconds; doubles on each attempt.
    pub retry_initial_delay_secs: f64,
    /// Timeout for health probe requests, in seconds.
    pub health_check_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            backend_type: BackendKind::OpenaiCompatible,
            endpoint: "http://localhost:1234/v1".to_string(),
            model: "openai/gpt-oss-20b".to_string(),
            served_model_name: "docgate/default".to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 300,
            retry_attempts: 3,
            retry_initial_delay_secs: 1.0,
            health_check_timeout_secs: 5,
        }
    }
}

impl BackendSettings {
    /// Connection timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Initial backoff delay as a [`Duration`].
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_initial_delay_secs)
    }
}

/// Tool-loop settings for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopSettings {
    /// Maximum tool-calling iterations per request.
    pub max_iterations: usize,
    /// Wall-clock budget for the loop, in seconds. 0 disables the budget.
    pub tool_loop_timeout_secs: u64,
    /// Tool choice sent on the first iteration.
    pub first_iteration_tool_choice: ToolChoice,
    /// Maximum characters of a single tool result before truncation.
    pub max_tool_result_chars: usize,
    /// Default sampling temperature when the request omits one.
    pub default_temperature: f32,
    /// Path to the system prompt file.
    pub system_prompt_path: PathBuf,
    /// Fallback system prompt when the file is absent or unreadable.
    pub default_system_prompt: String,
}

impl Default for ToolLoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            tool_loop_timeout_secs: 120,
            first_iteration_tool_choice: ToolChoice::Auto,
            max_tool_result_chars: 20_000,
            default_temperature: 0.0,
            system_prompt_path: PathBuf::from("system_prompt.md"),
            default_system_prompt: "You are a helpful AI assistant.".to_string(),
        }
    }
}

/// Settings for the documentation search index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSettings {
    /// Master switch. When false no index is built and the search tool is
    /// not registered.
    pub enabled: bool,
    /// Starting URL for crawling (e.g. `https://docs.example.com`).
    pub base_url: String,
    /// Directory holding the index, page cache, and manifest.
    pub cache_dir: PathBuf,
    /// Explicit URLs to index.
    pub manual_urls: Vec<String>,
    /// If true, only index `manual_urls` (no crawling); otherwise manual
    /// URLs are merged with discovered ones.
    pub manual_urls_only: bool,

    // Crawling
    /// Maximum depth for the recursive crawler.
    pub max_crawl_depth: usize,
    /// Maximum total pages to index (0 = unlimited).
    pub max_pages: usize,
    /// Delay between discovery requests, in milliseconds.
    pub rate_limit_delay_ms: u64,
    /// Parallel fetch workers.
    pub max_workers: usize,
    /// Per-request timeout for crawling, in seconds.
    pub request_timeout_secs: u64,
    /// Skip URLs after this many consecutive failures.
    pub max_url_retries: u32,
    /// Only crawl URLs matching at least one of these regexes (empty = all).
    pub url_include_patterns: Vec<String>,
    /// Skip URLs matching any of these regexes.
    pub url_exclude_patterns: Vec<String>,
    /// TTL for cached pages without a sitemap lastmod, in hours (0 = never
    /// expire).
    pub page_cache_ttl_hours: u64,

    // Chunking
    /// Minimum tokens for child chunks.
    pub child_chunk_min_tokens: usize,
    /// Target/maximum tokens for child chunks.
    pub child_chunk_size: usize,
    /// Minimum tokens for parent chunks.
    pub parent_chunk_min_tokens: usize,
    /// Target/maximum tokens for parent chunks.
    pub parent_chunk_size: usize,
    /// Hard cap; content exceeding this is split regardless of block type.
    pub absolute_max_chunk_tokens: usize,

    // Search. Hybrid fusion uses Reciprocal Rank Fusion: the weights scale
    // rank contributions (w / (60 + rank)), not raw scores.
    /// RRF weight for the lexical retriever.
    pub hybrid_lexical_weight: f64,
    /// RRF weight for the semantic retriever.
    pub hybrid_semantic_weight: f64,
    /// Results returned to the caller.
    pub search_top_k: usize,
    /// Each retriever fetches `search_top_k * this` candidates before fusion.
    pub retriever_candidate_multiplier: usize,
    /// Enable cross-encoder reranking.
    pub rerank_enabled: bool,
    /// Max characters of parent context included in tool results (0 = no
    /// limit).
    pub parent_context_max_chars: usize,

    // Models
    /// Embedding model name.
    pub embedding_model: String,
    /// Cross-encoder model for reranking.
    pub rerank_model: String,

    // Background refresh
    /// Hours between incremental update cycles.
    pub update_interval_hours: f64,
    /// URLs processed per updater batch.
    pub update_batch_size: usize,
    /// Tombstone ratio that forces a full rebuild.
    pub rebuild_threshold: f64,
    /// Enable background contextual enrichment of chunks.
    pub contextual_retrieval_enabled: bool,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            cache_dir: PathBuf::from("./rag_cache"),
            manual_urls: Vec::new(),
            manual_urls_only: false,
            max_crawl_depth: 3,
            max_pages: 0,
            rate_limit_delay_ms: 100,
            max_workers: 5,
            request_timeout_secs: 10,
            max_url_retries: 3,
            url_include_patterns: Vec::new(),
            url_exclude_patterns: Vec::new(),
            page_cache_ttl_hours: 168,
            child_chunk_min_tokens: 150,
            child_chunk_size: 350,
            parent_chunk_min_tokens: 300,
            parent_chunk_size: 900,
            absolute_max_chunk_tokens: 1200,
            hybrid_lexical_weight: 0.3,
            hybrid_semantic_weight: 0.7,
            search_top_k: 5,
            retriever_candidate_multiplier: 3,
            rerank_enabled: true,
            parent_context_max_chars: 500,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            rerank_model: "BAAI/bge-reranker-base".to_string(),
            update_interval_hours: 1.0,
            update_batch_size: 50,
            rebuild_threshold: 0.3,
            contextual_retrieval_enabled: false,
        }
    }
}

/// Minimum updater interval. Shorter configured intervals are clamped.
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

impl RagSettings {
    /// Updater wake interval, clamped to the 5-minute floor.
    pub fn update_interval(&self) -> Duration {
        let raw = Duration::from_secs_f64(self.update_interval_hours * 3600.0);
        raw.max(MIN_UPDATE_INTERVAL)
    }

    /// Candidate pool size fetched from each retriever before fusion.
    pub fn candidate_pool(&self) -> usize {
        self.search_top_k * self.retriever_candidate_multiplier.max(1)
    }
}

/// Main application configuration, frozen after load.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerSettings,
    /// Backend connection settings.
    #[serde(default)]
    pub backend: BackendSettings,
    /// Tool-loop settings.
    #[serde(default)]
    pub tools: ToolLoopSettings,
    /// Documentation index settings.
    #[serde(default)]
    pub rag: RagSettings,
}

/// Flat view of the recognised environment keys (prefix `DOCGATE_`).
///
/// Keys deliberately match the documented option names, so
/// `DOCGATE_BACKEND_MODEL` sets `backend_model` here.
#[derive(Debug, Default, Deserialize)]
struct EnvOverlay {
    backend_type: Option<BackendKind>,
    backend_endpoint: Option<String>,
    backend_model: Option<String>,
    served_model_name: Option<String>,
    backend_connect_timeout: Option<u64>,
    backend_read_timeout: Option<u64>,
    backend_retry_attempts: Option<u32>,
    backend_retry_initial_delay: Option<f64>,
    health_check_timeout: Option<u64>,

    bind_host: Option<String>,
    bind_port: Option<u16>,
    health_check_on_startup: Option<bool>,

    max_tool_iterations: Option<usize>,
    tool_loop_timeout: Option<u64>,
    first_iteration_tool_choice: Option<ToolChoice>,
    max_tool_result_chars: Option<usize>,
    default_temperature: Option<f32>,
    system_prompt_path: Option<PathBuf>,

    rag_enabled: Option<bool>,
    base_url: Option<String>,
    cache_dir: Option<PathBuf>,
    manual_urls: Option<Vec<String>>,
    manual_urls_only: Option<bool>,
    max_crawl_depth: Option<usize>,
    max_pages: Option<usize>,
    rate_limit_delay_ms: Option<u64>,
    max_workers: Option<usize>,
    request_timeout: Option<u64>,
    max_url_retries: Option<u32>,
    url_include_patterns: Option<Vec<String>>,
    url_exclude_patterns: Option<Vec<String>>,
    page_cache_ttl_hours: Option<u64>,
    child_chunk_min_tokens: Option<usize>,
    child_chunk_size: Option<usize>,
    parent_chunk_min_tokens: Option<usize>,
    parent_chunk_size: Option<usize>,
    absolute_max_chunk_tokens: Option<usize>,
    hybrid_lexical_weight: Option<f64>,
    hybrid_semantic_weight: Option<f64>,
    search_top_k: Option<usize>,
    retriever_candidate_multiplier: Option<usize>,
    rerank_enabled: Option<bool>,
    parent_context_max_chars: Option<usize>,
    embedding_model: Option<String>,
    rerank_model: Option<String>,
    update_interval_hours: Option<f64>,
    update_batch_size: Option<usize>,
    rebuild_threshold: Option<f64>,
    contextual_retrieval_enabled: Option<bool>,
}

macro_rules! apply {
    ($target:expr, $src:expr) => {
        if let Some(v) = $src {
            $target = v;
        }
    };
}

impl AppConfig {
    /// Load configuration from defaults, `.env`, and `DOCGATE_*` environment
    /// variables, then validate.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::load_unchecked()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration without validation. Useful in tests.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let overlay: EnvOverlay = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("DOCGATE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("manual_urls")
                    .with_list_parse_key("url_include_patterns")
                    .with_list_parse_key("url_exclude_patterns"),
            )
            .build()?
            .try_deserialize()
            .unwrap_or_default();

        let mut cfg = AppConfig::default();

        apply!(cfg.backend.backend_type, overlay.backend_type);
        apply!(cfg.backend.endpoint, overlay.backend_endpoint);
        apply!(cfg.backend.model, overlay.backend_model);
        apply!(cfg.backend.served_model_name, overlay.served_model_name);
        apply!(
            cfg.backend.connect_timeout_secs,
            overlay.backend_connect_timeout
        );
        apply!(cfg.backend.read_timeout_secs, overlay.backend_read_timeout);
        apply!(cfg.backend.retry_attempts, overlay.backend_retry_attempts);
        apply!(
            cfg.backend.retry_initial_delay_secs,
            overlay.backend_retry_initial_delay
        );
        apply!(
            cfg.backend.health_check_timeout_secs,
            overlay.health_check_timeout
        );

        apply!(cfg.server.bind_host, overlay.bind_host);
        apply!(cfg.server.bind_port, overlay.bind_port);
        apply!(
            cfg.server.health_check_on_startup,
            overlay.health_check_on_startup
        );

        apply!(cfg.tools.max_iterations, overlay.max_tool_iterations);
        apply!(cfg.tools.tool_loop_timeout_secs, overlay.tool_loop_timeout);
        apply!(
            cfg.tools.first_iteration_tool_choice,
            overlay.first_iteration_tool_choice
        );
        apply!(cfg.tools.max_tool_result_chars, overlay.max_tool_result_chars);
        apply!(cfg.tools.default_temperature, overlay.default_temperature);
        apply!(cfg.tools.system_prompt_path, overlay.system_prompt_path);

        apply!(cfg.rag.enabled, overlay.rag_enabled);
        apply!(cfg.rag.base_url, overlay.base_url);
        apply!(cfg.rag.cache_dir, overlay.cache_dir);
        apply!(cfg.rag.manual_urls, overlay.manual_urls);
        apply!(cfg.rag.manual_urls_only, overlay.manual_urls_only);
        apply!(cfg.rag.max_crawl_depth, overlay.max_crawl_depth);
        apply!(cfg.rag.max_pages, overlay.max_pages);
        apply!(cfg.rag.rate_limit_delay_ms, overlay.rate_limit_delay_ms);
        apply!(cfg.rag.max_workers, overlay.max_workers);
        apply!(cfg.rag.request_timeout_secs, overlay.request_timeout);
        apply!(cfg.rag.max_url_retries, overlay.max_url_retries);
        apply!(cfg.rag.url_include_patterns, overlay.url_include_patterns);
        apply!(cfg.rag.url_exclude_patterns, overlay.url_exclude_patterns);
        apply!(cfg.rag.page_cache_ttl_hours, overlay.page_cache_ttl_hours);
        apply!(cfg.rag.child_chunk_min_tokens, overlay.child_chunk_min_tokens);
        apply!(cfg.rag.child_chunk_size, overlay.child_chunk_size);
        apply!(
            cfg.rag.parent_chunk_min_tokens,
            overlay.parent_chunk_min_tokens
        );
        apply!(cfg.rag.parent_chunk_size, overlay.parent_chunk_size);
        apply!(
            cfg.rag.absolute_max_chunk_tokens,
            overlay.absolute_max_chunk_tokens
        );
        apply!(cfg.rag.hybrid_lexical_weight, overlay.hybrid_lexical_weight);
        apply!(
            cfg.rag.hybrid_semantic_weight,
            overlay.hybrid_semantic_weight
        );
        apply!(cfg.rag.search_top_k, overlay.search_top_k);
        apply!(
            cfg.rag.retriever_candidate_multiplier,
            overlay.retriever_candidate_multiplier
        );
        apply!(cfg.rag.rerank_enabled, overlay.rerank_enabled);
        apply!(
            cfg.rag.parent_context_max_chars,
            overlay.parent_context_max_chars
        );
        apply!(cfg.rag.embedding_model, overlay.embedding_model);
        apply!(cfg.rag.rerank_model, overlay.rerank_model);
        apply!(cfg.rag.update_interval_hours, overlay.update_interval_hours);
        apply!(cfg.rag.update_batch_size, overlay.update_batch_size);
        apply!(cfg.rag.rebuild_threshold, overlay.rebuild_threshold);
        apply!(
            cfg.rag.contextual_retrieval_enabled,
            overlay.contextual_retrieval_enabled
        );

        Ok(cfg)
    }

    /// Validate the configuration, producing actionable messages.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tools.default_temperature < 0.0 {
            anyhow::bail!(
                "DEFAULT_TEMPERATURE must be >= 0 (got {})",
                self.tools.default_temperature
            );
        }

        if self.tools.max_iterations == 0 {
            anyhow::bail!("MAX_TOOL_ITERATIONS must be at least 1");
        }

        let weight_sum = self.rag.hybrid_lexical_weight + self.rag.hybrid_semantic_weight;
        if (weight_sum - 1.0).abs() > 0.01 {
            anyhow::bail!(
                "hybrid search weights must sum to 1.0, got {} (lexical={}, semantic={})",
                weight_sum,
                self.rag.hybrid_lexical_weight,
                self.rag.hybrid_semantic_weight
            );
        }

        if self.rag.enabled && self.rag.base_url.is_empty() && self.rag.manual_urls.is_empty() {
            anyhow::bail!(
                "RAG is enabled but neither BASE_URL nor MANUAL_URLS is set; \
                 set DOCGATE_BASE_URL or disable RAG"
            );
        }

        if self.rag.rebuild_threshold <= 0.0 || self.rag.rebuild_threshold > 1.0 {
            anyhow::bail!(
                "REBUILD_THRESHOLD must be in (0, 1], got {}",
                self.rag.rebuild_threshold
            );
        }

        for pattern in self
            .rag
            .url_include_patterns
            .iter()
            .chain(&self.rag.url_exclude_patterns)
        {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid URL pattern {pattern:?}: {e}"))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_negative_temperature() {
        let mut cfg = AppConfig::default();
        cfg.tools.default_temperature = -0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unbalanced_weights() {
        let mut cfg = AppConfig::default();
        cfg.rag.hybrid_lexical_weight = 0.5;
        cfg.rag.hybrid_semantic_weight = 0.7;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rag_requires_a_source() {
        let mut cfg = AppConfig::default();
        cfg.rag.enabled = true;
        assert!(cfg.validate().is_err());
        cfg.rag.base_url = "https://docs.example.com".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn update_interval_is_clamped() {
        let mut cfg = AppConfig::default();
        cfg.rag.update_interval_hours = 0.001;
        assert_eq!(cfg.rag.update_interval(), MIN_UPDATE_INTERVAL);
    }
}
