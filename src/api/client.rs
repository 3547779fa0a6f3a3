use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use super::{
    ConversationId, ModelsResponse, SendAck, SendMessageRequest, ValidateKeyRequest,
    ValidateKeyResponse,
};
use crate::utils::url::construct_api_url;

/// Failures talking to the chat service's request/response endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The request never produced an HTTP response.
    Transport(String),
    /// The service answered with a non-success status.
    Status { status: u16, message: String },
    /// The response body did not match the expected payload.
    Decode(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(message) => write!(f, "request failed: {message}"),
            BackendError::Status { status, message } => {
                write!(f, "chat service returned {status}: {message}")
            }
            BackendError::Decode(message) => write!(f, "unexpected response: {message}"),
        }
    }
}

impl Error for BackendError {}

/// The chat service endpoints the session layer consumes.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// `POST /chat/message`; resolves once generation has been acknowledged.
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendAck, BackendError>;

    /// `POST /chat/validate-key`.
    async fn validate_key(&self, credential: &str) -> Result<ValidateKeyResponse, BackendError>;

    /// `GET /chat/models`.
    async fn list_models(&self) -> Result<ModelsResponse, BackendError>;

    /// URL of the event stream carrying `conversation_id`'s response.
    fn stream_url(&self, conversation_id: ConversationId) -> String;
}

#[derive(Clone)]
pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpChatBackend {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            auth_token,
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: summarize_error_body(&body),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendAck, BackendError> {
        let url = construct_api_url(&self.base_url, "chat/message");
        debug!(conversation = %request.conversation_id, model = %request.model, "posting chat message");
        let response = self
            .authorize(self.client.post(url))
            .json(request)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Self::decode::<SendAck>(response).await;
        }
        // Some deployments acknowledge with an empty body.
        let body = response
            .text()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        if body.trim().is_empty() {
            return Ok(SendAck::default());
        }
        serde_json::from_str(&body).map_err(|err| BackendError::Decode(err.to_string()))
    }

    async fn validate_key(&self, credential: &str) -> Result<ValidateKeyResponse, BackendError> {
        let url = construct_api_url(&self.base_url, "chat/validate-key");
        let response = self
            .authorize(self.client.post(url))
            .json(&ValidateKeyRequest {
                credential: credential.to_string(),
            })
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        Self::decode(response).await
    }

    async fn list_models(&self) -> Result<ModelsResponse, BackendError> {
        let url = construct_api_url(&self.base_url, "chat/models");
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        Self::decode(response).await
    }

    fn stream_url(&self, conversation_id: ConversationId) -> String {
        format!(
            "{}?conversationId={}",
            construct_api_url(&self.base_url, "chat/stream"),
            conversation_id
        )
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        })
        .or_else(|| {
            value
                .get("detail")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Reduce an error body (JSON or plain text) to a single user-facing line.
pub(crate) fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value) {
            if !summary.is_empty() {
                return summary;
            }
        }
    }
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}
