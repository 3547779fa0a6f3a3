//! Payloads exchanged with the chat service.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod client;

pub use client::{BackendError, ChatBackend, HttpChatBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConversationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ConversationId)
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    pub credential: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Acknowledgement that generation has begun. Carries no content.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    #[serde(default)]
    pub accepted: Option<bool>,
    #[serde(default)]
    pub message_id: Option<i64>,
}

#[derive(Serialize, Clone, Debug)]
pub struct ValidateKeyRequest {
    pub credential: String,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ValidateKeyResponse {
    pub valid: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub organization: Option<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default = "default_supports_streaming")]
    pub supports_streaming: bool,
}

fn default_supports_streaming() -> bool {
    true
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub default_model: Option<String>,
}
