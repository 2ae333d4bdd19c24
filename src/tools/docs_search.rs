//! Documentation search tool backed by the local index.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::rag::index::DocIndex;
use crate::tools::{Tool, ToolDescriptor};

/// `search_docs`: hybrid search over the crawled documentation.
pub struct DocsSearchTool {
    index: Arc<DocIndex>,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

impl DocsSearchTool {
    /// Create the tool over a shared index.
    pub fn new(index: Arc<DocIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for DocsSearchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "search_docs",
            "Search the indexed documentation. Returns the most relevant sections \
             with their source URLs and surrounding context.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to search for"
                    },
                    "top_k": {
                        "type": "integer",
                        "description": "Number of results to return (optional)"
                    }
                },
                "required": ["query"]
            }),
        )
    }

    async fn execute(&self, arguments: &str) -> anyhow::Result<String> {
        let args: SearchArgs = serde_json::from_str(arguments)?;
        if args.query.trim().is_empty() {
            anyhow::bail!("query must not be empty");
        }

        let hits = self.index.search(&args.query, args.top_k).await?;
        if hits.is_empty() {
            return Ok("No matching documentation found.".to_string());
        }

        let parent_cap = self.index.settings().parent_context_max_chars;
        let mut out = String::new();
        for (i, hit) in hits.iter().enumerate() {
            if i > 0 {
                out.push_str("\n\n");
            }
            out.push_str(&format!(
                "[{}] {} (score {:.2})\nSource: {}\n\n{}",
                i + 1,
                if hit.heading_path.is_empty() {
                    "(untitled section)"
                } else {
                    &hit.heading_path
                },
                hit.score,
                hit.url,
                hit.text,
            ));
            if let Some(parent) = &hit.parent_text {
                if parent != &hit.text {
                    let context = cap_chars(parent, parent_cap);
                    out.push_str(&format!("\n\nContext: {context}"));
                }
            }
        }
        Ok(out)
    }
}

fn cap_chars(text: &str, cap: usize) -> String {
    if cap == 0 || text.chars().count() <= cap {
        return text.to_string();
    }
    let kept: String = text.chars().take(cap).collect();
    format!("{kept}…")
}
