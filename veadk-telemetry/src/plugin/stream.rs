//! Streaming response accumulation.
//!
//! A model call yields any number of partial chunks and then one final chunk.
//! Adjacent text parts merge into one; function calls and binary parts are
//! kept as separate parts. Some providers replay the whole answer in the final
//! chunk, so a final chunk carrying content of its own replaces everything
//! accumulated before it.

use veadk_core::{Content, Part};

#[derive(Debug, Clone, Default)]
pub struct StreamAccumulator {
    role: Option<String>,
    parts: Vec<Part>,
    thoughts: String,
    chunks: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one chunk in and returns the reasoning text it carried, in order.
    pub fn add_chunk(&mut self, content: Option<&Content>, partial: bool) -> Vec<String> {
        let Some(content) = content.filter(|c| !c.is_empty()) else {
            return Vec::new();
        };
        self.chunks += 1;

        if !partial {
            self.parts.clear();
            if content.parts.iter().any(|part| part.thinking().is_some_and(|t| !t.is_empty())) {
                self.thoughts.clear();
            }
        }
        if !content.role.is_empty() {
            self.role = Some(content.role.clone());
        }

        let mut thoughts = Vec::new();
        for part in content.parts.iter().filter(|part| !part.is_empty()) {
            match part {
                Part::Thinking { thinking } => {
                    self.thoughts.push_str(thinking);
                    thoughts.push(thinking.clone());
                }
                Part::Text { text } => match self.parts.last_mut() {
                    Some(Part::Text { text: previous }) => previous.push_str(text),
                    _ => self.parts.push(part.clone()),
                },
                other => self.parts.push(other.clone()),
            }
        }
        thoughts
    }

    /// The response accumulated so far, reasoning first.
    pub fn content(&self) -> Content {
        let mut content = Content::new(self.role.clone().unwrap_or_else(|| "model".to_string()));
        if !self.thoughts.is_empty() {
            content.parts.push(Part::thinking_part(self.thoughts.clone()));
        }
        content.parts.extend(self.parts.iter().cloned());
        content
    }

    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::text).collect()
    }

    pub fn thoughts(&self) -> &str {
        &self.thoughts
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty() && self.thoughts.is_empty()
    }

    /// Number of chunks that carried content.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }
}
