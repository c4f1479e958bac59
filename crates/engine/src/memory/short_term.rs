//! Short-Term Memory — the append-only ordered dialog the executor renders
//! into a flat transcript on every loop iteration.
//!
//! Rendering format is ported exactly from the source's `ShortMemory`: each
//! turn renders as its own paragraph; a turn whose role is the empty string
//! renders with no prefix at all (used for injected history/system-time
//! turns that shouldn't look like a dialog line).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of the conversation transcript. `role` is one of
/// `system, user, assistant, tool-result, history, system-time`, or empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ShortMemory {
    turns: Vec<Turn>,
}

impl ShortMemory {
    pub fn new() -> Self {
        Self { turns: Vec::new() }
    }

    pub fn add(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.turns.push(Turn {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    /// Render the full transcript as one flat string, one paragraph per
    /// turn. Roles with an empty name render without a prefix.
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|t| {
                if t.role.is_empty() {
                    format!("{}\n\n", t.content)
                } else {
                    format!("{}: {}\n\n", t.role, t.content)
                }
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Shallow copy of the current turns.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    /// Present but unused by the executor loop itself — available for
    /// callers that need to reset a conversation's in-flight memory.
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
