//! Application wiring and middleware.

use std::sync::Arc;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::api;
use crate::config::AppConfig;
use crate::llm::providers::create_backend;
use crate::llm::RequestHook;
use crate::logging::OpTimer;
use crate::prompt::SystemPromptCache;
use crate::rag::contextual::run_contextualizer;
use crate::rag::embed::{FastembedEmbedder, FastembedReranker};
use crate::rag::index::{DocIndex, IndexCorruption};
use crate::rag::updater::run_updater;
use crate::rag::BackgroundSignals;
use crate::llm::orchestrator::Orchestrator;
use crate::tools::docs_search::DocsSearchTool;
use crate::tools::ToolRegistry;
use crate::{log_init_step, log_init_warning, log_success, AppState};

/// Gateway version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create the application with all routes, middleware, and background
/// tasks. Returns the router plus the shared state (the caller cancels
/// `state.signals` on shutdown). `rebuild_index` discards the cached index
/// and re-crawls; `refresh_pages` bypasses the page cache.
pub async fn create_app(
    config: AppConfig,
    rebuild_index: bool,
    refresh_pages: bool,
) -> anyhow::Result<(Router, AppState)> {
    let overall_timer = OpTimer::new("server", "create_app");
    tracing::info!(
        version = VERSION,
        backend = %config.backend.backend_type,
        model = %config.backend.model,
        "Starting docgate"
    );

    // [1/6] Backend driver.
    let step_timer = OpTimer::new("server", "backend");
    let hook: Option<RequestHook> = Some(Arc::new(|backend, payload| {
        tracing::trace!(backend = backend, model = %payload["model"], "Outgoing backend request");
    }));
    let backend = create_backend(config.backend.clone(), hook)?;
    log_init_step!(
        1,
        6,
        "Backend",
        format!("{} at {}", config.backend.backend_type, config.backend.endpoint)
    );
    step_timer.finish();

    // [2/6] Startup health check (warn-only; the server starts regardless).
    if config.server.health_check_on_startup {
        let step_timer = OpTimer::new("server", "health_check");
        match backend.health().await {
            Ok(report) => log_init_step!(2, 6, "Health", report.message),
            Err(e) => {
                log_init_warning!("Backend health check failed: {}. Requests may fail.", e);
                log_init_step!(2, 6, "Health", "backend unavailable");
            }
        }
        step_timer.finish();
    } else {
        log_init_step!(2, 6, "Health", "skipped");
    }

    // [3/6] Tool registry with built-ins.
    let step_timer = OpTimer::new("server", "tools");
    let tools = Arc::new(ToolRegistry::with_builtins(
        config.tools.max_tool_result_chars,
    ));
    log_init_step!(3, 6, "Tools", format!("{} built-in tools", tools.len()));
    step_timer.finish();

    // [4/6] Documentation index. Corruption fails closed: the gateway keeps
    // serving chat, only the search tool is withheld.
    let signals = BackgroundSignals::new();
    let step_timer = OpTimer::new("server", "rag");
    let index = if config.rag.enabled {
        match init_index(&config, Arc::clone(&signals), rebuild_index, refresh_pages).await {
            Ok(index) => {
                tools.register(Arc::new(DocsSearchTool::new(Arc::clone(&index))));
                log_init_step!(4, 6, "Docs index", "ready, search_docs registered");
                Some(index)
            }
            Err(e) if e.is::<IndexCorruption>() => {
                log_init_warning!(
                    "Docs index corrupt, refusing to serve RAG queries: {}",
                    e
                );
                log_init_step!(4, 6, "Docs index", "corrupt (disabled)");
                None
            }
            Err(e) => {
                log_init_warning!("Docs index unavailable: {}", e);
                log_init_step!(4, 6, "Docs index", "unavailable (disabled)");
                None
            }
        }
    } else {
        log_init_step!(4, 6, "Docs index", "disabled");
        None
    };
    step_timer.finish();

    // [5/6] Orchestrator.
    let step_timer = OpTimer::new("server", "orchestrator");
    let prompt = Arc::new(SystemPromptCache::new(
        config.tools.system_prompt_path.clone(),
        config.tools.default_system_prompt.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&backend),
        Arc::clone(&tools),
        config.tools.clone(),
        prompt,
        index.as_ref().map(|_| Arc::clone(&signals)),
    ));
    log_init_step!(5, 6, "Orchestrator", "tool loop ready");
    step_timer.finish();

    // Background tasks: one long-lived updater, one contextualiser.
    if let Some(index) = &index {
        tokio::spawn(run_updater(Arc::clone(index)));
        if config.rag.contextual_retrieval_enabled {
            tokio::spawn(run_contextualizer(Arc::clone(index), Arc::clone(&backend)));
        }
    }

    let state = AppState {
        config: Arc::new(config),
        orchestrator,
        index,
        signals,
    };

    // [6/6] Router with middleware.
    let step_timer = OpTimer::new("server", "router");
    let app = api::create_router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());
    log_init_step!(6, 6, "Router", "routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    log_success!("docgate ready");
    Ok((app, state))
}

/// Build the embedding/rerank models and bring the index up. Model loading
/// is CPU/IO-heavy and runs on the blocking pool.
async fn init_index(
    config: &AppConfig,
    signals: Arc<BackgroundSignals>,
    rebuild_index: bool,
    refresh_pages: bool,
) -> anyhow::Result<Arc<DocIndex>> {
    let embedding_model = config.rag.embedding_model.clone();
    let embedder = tokio::task::spawn_blocking(move || FastembedEmbedder::new(&embedding_model))
        .await??;

    let reranker = if config.rag.rerank_enabled {
        let rerank_model = config.rag.rerank_model.clone();
        let reranker =
            tokio::task::spawn_blocking(move || FastembedReranker::new(&rerank_model)).await??;
        Some(Arc::new(reranker) as Arc<dyn crate::rag::embed::Reranker>)
    } else {
        None
    };

    let index = Arc::new(DocIndex::new(
        config.rag.clone(),
        Arc::new(embedder),
        reranker,
        signals,
    )?);
    index.ensure_ready(rebuild_index, refresh_pages).await?;
    Ok(index)
}

/// Warn when the server binds beyond loopback; the API is unauthenticated.
pub fn warn_if_public_bind(host: &str) {
    let loopback = host == "127.0.0.1" || host == "localhost" || host == "::1";
    if !loopback {
        tracing::warn!(
            host = host,
            "Binding to a non-loopback interface exposes the API to your \
             network without authentication. Use 127.0.0.1 unless you need \
             network access."
        );
    }
}
