//! Normalised streaming frames.
//!
//! Both backend dialects are reduced to the same delta frames: content
//! deltas, tool-call deltas keyed by call index, and a terminal frame.
//! [`ToolCallAccumulator`] folds fragmented tool-call deltas back into
//! complete calls ordered by index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::llm::{ToolCall, ToolCallFunction};

/// One normalised frame from a streaming backend response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaFrame {
    /// Partial assistant content.
    Content {
        /// The content delta.
        text: String,
    },

    /// Partial tool call. Fields may arrive over several frames.
    ToolCallDelta {
        /// Call index within this response.
        index: usize,
        /// Call id (usually only on the first fragment).
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Tool name fragment.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Arguments JSON fragment.
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },

    /// Terminal frame.
    Done {
        /// Finish reason reported by the backend, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

impl DeltaFrame {
    /// Create a content frame.
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    /// Create a terminal frame.
    pub fn done() -> Self {
        Self::Done {
            finish_reason: None,
        }
    }

    /// Create a terminal frame with a finish reason.
    pub fn done_with_reason(reason: impl Into<String>) -> Self {
        Self::Done {
            finish_reason: Some(reason.into()),
        }
    }
}

/// Accumulator for one streamed tool call.
#[derive(Debug, Default, Clone)]
pub struct ToolCallAccumulator {
    /// Tool call id.
    pub id: Option<String>,
    /// Tool name.
    pub name: Option<String>,
    /// Arguments accumulated so far.
    pub arguments: String,
}

impl ToolCallAccumulator {
    /// Apply a delta fragment.
    pub fn apply_delta(
        &mut self,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    ) {
        if let Some(id) = id {
            self.id = Some(id);
        }
        if let Some(name) = name {
            self.name = Some(name);
        }
        if let Some(args) = arguments {
            self.arguments.push_str(&args);
        }
    }

    /// Finalise into a complete call, if both id and name arrived.
    pub fn into_tool_call(self) -> Option<ToolCall> {
        match (self.id, self.name) {
            (Some(id), Some(name)) => Some(ToolCall {
                id,
                call_type: "function".to_string(),
                function: ToolCallFunction {
                    name,
                    arguments: self.arguments,
                },
            }),
            _ => None,
        }
    }
}

/// Reducer over a full response's frames: content concatenates into a
/// buffer, tool-call deltas accumulate per index, and finalised calls come
/// out ordered by index.
#[derive(Debug, Default)]
pub struct StreamReducer {
    /// Accumulated assistant content.
    pub content: String,
    accumulators: BTreeMap<usize, ToolCallAccumulator>,
    finish_reason: Option<String>,
}

impl StreamReducer {
    /// Create an empty reducer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame.
    pub fn apply(&mut self, frame: DeltaFrame) {
        match frame {
            DeltaFrame::Content { text } => self.content.push_str(&text),
            DeltaFrame::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                self.accumulators
                    .entry(index)
                    .or_default()
                    .apply_delta(id, name, arguments);
            }
            DeltaFrame::Done { finish_reason } => {
                if finish_reason.is_some() {
                    self.finish_reason = finish_reason;
                }
            }
        }
    }

    /// Whether any tool-call fragment was observed.
    pub fn has_tool_calls(&self) -> bool {
        !self.accumulators.is_empty()
    }

    /// Finish reason reported by the backend, if any.
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Finalise into `(content, tool_calls)`, calls ordered by index.
    pub fn finish(self) -> (String, Vec<ToolCall>) {
        let calls = self
            .accumulators
            .into_values()
            .filter_map(ToolCallAccumulator::into_tool_call)
            .collect();
        (self.content, calls)
    }
}
