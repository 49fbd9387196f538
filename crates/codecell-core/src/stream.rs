//! Accumulation of streamed output.

use crate::protocol::{ExecutionId, Priority};

/// One piece of partial output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    /// Execution the chunk belongs to.
    pub execution_id: ExecutionId,
    /// HTML fragment.
    pub text: String,
    /// Append or replace.
    pub priority: Priority,
}

/// Accumulated display buffer for one execution.
///
/// Normal chunks are concatenated in arrival order. High-priority chunks
/// (progress bars) are coalesced: the latest replaces the previous one, and
/// it is always rendered ahead of the normal text.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    progress: Option<String>,
    normal: String,
}

impl OutputBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a chunk.
    pub fn push(&mut self, text: &str, priority: Priority) {
        match priority {
            Priority::High => self.progress = Some(text.to_string()),
            Priority::Normal => self.normal.push_str(text),
        }
    }

    /// Apply a [`StreamChunk`].
    pub fn push_chunk(&mut self, chunk: &StreamChunk) {
        self.push(&chunk.text, chunk.priority);
    }

    /// Current display: latest progress update, then the accumulated text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.progress.as_ref().map_or(0, String::len) + self.normal.len(),
        );
        if let Some(progress) = &self.progress {
            out.push_str(progress);
        }
        out.push_str(&self.normal);
        out
    }

    /// Whether nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.progress.is_none() && self.normal.is_empty()
    }
}
