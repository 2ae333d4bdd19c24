//! docgate — OpenAI-compatible tool-calling gateway for local LLM backends.
//!
//! The gateway sits in front of one local inference backend (native or
//! OpenAI-compatible dialect) and exposes a uniform chat-completions
//! surface with automatic multi-turn tool calling. An optional local
//! documentation index (crawl → extract → semantic chunk → hybrid search →
//! rerank) is served to the model through the `search_docs` tool and kept
//! fresh by a background updater.
//!
//! # Architecture
//!
//! - [`config`]: frozen configuration loaded once from the environment
//! - [`llm`]: backend dialect drivers and the tool-loop orchestrator
//! - [`events`]: normalised streaming frames and the tool-call reducer
//! - [`tools`]: tool registry, built-ins, and the documentation search tool
//! - [`rag`]: the retrieval core and its background tasks
//! - [`api`]: the HTTP request surface
//! - [`server`]: application wiring and middleware
//!
//! # Example
//!
//! ```rust,ignore
//! use docgate::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let (app, state) = create_app(config, false, false).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await?;
//!     axum::serve(listener, app).await?;
//!     state.signals.cancel();
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod events;
pub mod llm;
pub mod logging;
pub mod prompt;
pub mod rag;
pub mod server;
pub mod tools;

use std::sync::Arc;

use config::AppConfig;
use llm::orchestrator::Orchestrator;
use rag::index::DocIndex;
use rag::BackgroundSignals;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Frozen application configuration.
    pub config: Arc<AppConfig>,
    /// The tool-loop orchestrator.
    pub orchestrator: Arc<Orchestrator>,
    /// The documentation index, when enabled and loadable.
    pub index: Option<Arc<DocIndex>>,
    /// Signals shared with background index tasks.
    pub signals: Arc<BackgroundSignals>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("orchestrator", &self.orchestrator)
            .field("index", &self.index.is_some())
            .finish()
    }
}
