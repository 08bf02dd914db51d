use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponseData {
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    /// Reasoning emitted by thinking-capable models, kept apart from the answer text.
    Thinking {
        thinking: String,
    },
    InlineData {
        mime_type: String,
        data: Vec<u8>,
    },
    /// File data referenced by URI (URL or cloud storage path).
    FileData {
        mime_type: String,
        file_uri: String,
    },
    FunctionCall {
        name: String,
        args: serde_json::Value,
        /// Tool call ID issued by OpenAI-style providers.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FunctionResponse {
        function_response: FunctionResponseData,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl Content {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into(), parts: Vec::new() }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::Text { text: text.into() });
        self
    }

    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// True when no part carries anything worth reporting.
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(Part::is_empty)
    }

    /// Concatenated plain text of all text parts, thinking excluded.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::text).collect()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|part| matches!(part, Part::FunctionCall { .. }))
    }
}

impl Part {
    /// Returns the text content if this is a Text part, None otherwise
    pub fn text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn thinking(&self) -> Option<&str> {
        match self {
            Part::Thinking { thinking } => Some(thinking.as_str()),
            _ => None,
        }
    }

    /// Only plain text may be merged with a neighbouring part.
    pub fn is_mergeable_text(&self) -> bool {
        matches!(self, Part::Text { .. })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Part::Text { text } => text.is_empty(),
            Part::Thinking { thinking } => thinking.is_empty(),
            Part::InlineData { data, .. } => data.is_empty(),
            Part::FileData { file_uri, .. } => file_uri.is_empty(),
            Part::FunctionCall { .. } | Part::FunctionResponse { .. } => false,
        }
    }

    pub fn text_part(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn thinking_part(thinking: impl Into<String>) -> Self {
        Part::Thinking { thinking: thinking.into() }
    }

    pub fn function_call(
        name: impl Into<String>,
        args: serde_json::Value,
        id: Option<String>,
    ) -> Self {
        Part::FunctionCall { name: name.into(), args, id }
    }
}
