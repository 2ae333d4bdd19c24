//! Background contextual enrichment.
//!
//! Walks every live chunk and asks the configured backend for a short
//! prefix situating the chunk within its document, then re-embeds the
//! prefixed chunks. Progress persists every 50 chunks so an interrupted
//! pass resumes where it stopped; the index stays searchable throughout,
//! and requests see whichever version is current when they search.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::{CallOptions, ChatBackend, Message, ToolChoice};
use crate::rag::index::DocIndex;

/// Persist progress after this many newly contextualised chunks.
const SAVE_EVERY: usize = 50;

/// Cap on generated prefix length.
const MAX_PREFIX_CHARS: usize = 300;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContextProgress {
    /// chunk_id → generated prefix.
    prefixes: HashMap<String, String>,
    /// Set once the prefixes have been applied and re-embedded.
    #[serde(default)]
    applied: bool,
}

/// Run the contextualiser until done or cancelled. Spawn with
/// `tokio::spawn`.
pub async fn run_contextualizer(index: Arc<DocIndex>, backend: Arc<dyn ChatBackend>) {
    if let Err(e) = contextualize(&index, backend.as_ref()).await {
        tracing::warn!(error = %e, "Contextual enrichment failed");
    }
}

async fn contextualize(index: &Arc<DocIndex>, backend: &dyn ChatBackend) -> anyhow::Result<()> {
    let signals = Arc::clone(index.signals());
    let progress_path = progress_path(index);
    let mut progress = load_progress(&progress_path);
    if progress.applied {
        tracing::info!("Contextual enrichment already applied, nothing to do");
        return Ok(());
    }

    let chunks = index.live_chunks().await;
    if chunks.is_empty() {
        tracing::info!("No chunks to contextualise");
        return Ok(());
    }

    tracing::info!(
        total = chunks.len(),
        done = progress.prefixes.len(),
        "Contextual enrichment started"
    );

    let mut since_save = 0usize;
    for chunk in &chunks {
        if signals.cancelled() {
            save_progress(&progress_path, &progress);
            tracing::info!("Contextual enrichment cancelled, progress saved");
            return Ok(());
        }
        signals.yield_while_paused().await;
        if progress.prefixes.contains_key(&chunk.chunk_id) {
            continue;
        }

        let source_text = chunk.original_text.as_deref().unwrap_or(&chunk.text);
        let prompt = format!(
            "You will situate a documentation excerpt within its page.\n\
             Page URL: {}\nSection: {}\n\nExcerpt:\n{}\n\n\
             Reply with a single short sentence that states what this excerpt \
             covers and where it sits in the page. Reply with the sentence only.",
            chunk.metadata.url,
            chunk.metadata.heading_path.join(" > "),
            source_text,
        );
        let messages = [Message::user(prompt)];
        let opts = CallOptions {
            temperature: 0.0,
            tool_choice: ToolChoice::None,
            model_override: None,
        };

        match backend.chat(&messages, &[], &opts).await {
            Ok(turn) => {
                let prefix: String = turn.content.trim().chars().take(MAX_PREFIX_CHARS).collect();
                if !prefix.is_empty() {
                    progress.prefixes.insert(chunk.chunk_id.clone(), prefix);
                }
            }
            Err(e) => {
                tracing::warn!(chunk = %chunk.chunk_id, error = %e,
                    "Context generation failed for chunk, skipping");
                continue;
            }
        }

        since_save += 1;
        if since_save >= SAVE_EVERY {
            save_progress(&progress_path, &progress);
            since_save = 0;
            tracing::info!(
                done = progress.prefixes.len(),
                total = chunks.len(),
                "Contextual enrichment progress saved"
            );
        }
    }

    save_progress(&progress_path, &progress);
    index
        .apply_contextual_prefixes(progress.prefixes.clone())
        .await?;
    progress.applied = true;
    save_progress(&progress_path, &progress);

    tracing::info!(chunks = progress.prefixes.len(), "Contextual enrichment complete");
    Ok(())
}

fn progress_path(index: &DocIndex) -> PathBuf {
    index.settings().cache_dir.join("context_progress.json")
}

fn load_progress(path: &PathBuf) -> ContextProgress {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

fn save_progress(path: &PathBuf, progress: &ContextProgress) {
    match serde_json::to_string(progress) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                tracing::warn!(error = %e, "Failed to save contextualisation progress");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to serialise contextualisation progress"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RagSettings;
    use crate::llm::{AssistantTurn, BackendError, DeltaStream, HealthReport};
    use crate::rag::embed::testing::{HashingEmbedder, OverlapReranker};
    use crate::rag::BackgroundSignals;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PrefixBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatBackend for PrefixBackend {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: &[serde_json::Value],
            opts: &CallOptions,
        ) -> Result<AssistantTurn, BackendError> {
            assert_eq!(opts.tool_choice, ToolChoice::None);
            assert!(messages[0].content.contains("Excerpt:"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AssistantTurn {
                content: "This excerpt describes installation steps.".to_string(),
                tool_calls: Vec::new(),
            })
        }

        async fn chat_stream(
            &self,
            _messages: &[Message],
            _tools: &[serde_json::Value],
            _opts: &CallOptions,
        ) -> Result<DeltaStream, BackendError> {
            unimplemented!("contextualiser never streams")
        }

        async fn health(&self) -> Result<HealthReport, BackendError> {
            Ok(HealthReport {
                message: "ok".into(),
                models: vec!["m".into()],
            })
        }

        fn default_model(&self) -> &str {
            "m"
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn contextualiser_prefixes_chunks_and_persists_progress() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RagSettings {
            enabled: true,
            base_url: "https://docs.example.com".into(),
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let index = Arc::new(
            DocIndex::new(
                settings,
                Arc::new(HashingEmbedder::default()),
                Some(Arc::new(OverlapReranker)),
                BackgroundSignals::new(),
            )
            .unwrap(),
        );
        crate::rag::index::testing::seed_minimal(
            &index,
            &[
                ("https://docs.example.com/a", "install the binary first"),
                ("https://docs.example.com/b", "configure the service next"),
            ],
        )
        .await;

        let backend = Arc::new(PrefixBackend {
            calls: AtomicUsize::new(0),
        });
        contextualize(&index, backend.as_ref()).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        let progress = load_progress(&dir.path().join("context_progress.json"));
        assert!(progress.applied);
        assert_eq!(progress.prefixes.len(), 2);

        // A second pass is a no-op.
        contextualize(&index, backend.as_ref()).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        let chunks = index.live_chunks().await;
        assert!(chunks
            .iter()
            .all(|c| c.text.starts_with("This excerpt describes")));
    }
}
