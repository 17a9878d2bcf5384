//! Request and response shapes for the Anthropic Messages endpoint, plus the model
//! tiers each pipeline stage can be pointed at.

use serde::{Deserialize, Serialize};

/// Model tier a pipeline stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    /// Anthropic API model identifier for this tier.
    pub fn api_model(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "claude-haiku-4-5-20251001",
            ModelTier::Sonnet => "claude-sonnet-4-5-20250929",
            ModelTier::Opus => "claude-opus-4-6",
        }
    }
}

/// Body of a `POST /v1/messages` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub messages: Vec<Message>,
}

impl MessagesRequest {
    /// Single-turn request carrying one user prompt.
    pub fn user_prompt(tier: ModelTier, max_tokens: u32, prompt: impl Into<String>) -> Self {
        Self {
            model: tier.api_model().to_string(),
            max_tokens,
            system: None,
            temperature: None,
            messages: vec![Message {
                role: "user".into(),
                content: prompt.into(),
            }],
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "user" or "assistant".
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    /// `None` while generation is still in progress.
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatenated text of every `text` block, or `None` when there is none.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(""))
        }
    }
}

/// A content block. `content_type` is serialized as `"type"` to match the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
