//! Test doubles for the network seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use crate::api::{
    BackendError, ChatBackend, ConversationId, ModelInfo, ModelsResponse, SendAck,
    SendMessageRequest, ValidateKeyResponse,
};
use crate::core::stream::{ConnectError, FrameStream, StreamConnector, StreamFrame};
use crate::core::vault::{DeviceFingerprint, MemoryStorage, VaultService};

pub fn test_fingerprint() -> DeviceFingerprint {
    DeviceFingerprint::new("en-US", "linux-x86_64", "testhost", "/home/test")
}

pub fn memory_vault(user_id: &str) -> VaultService<MemoryStorage> {
    VaultService::new(MemoryStorage::new(), user_id, test_fingerprint())
}

/// One scripted answer to `StreamConnector::open`.
pub enum ScriptedConnection {
    Fail(ConnectError),
    /// Yields the frames, then the connection closes.
    Frames(Vec<Result<StreamFrame, ConnectError>>),
    /// Yields the frames, then stays open until dropped.
    Hanging(Vec<Result<StreamFrame, ConnectError>>),
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector replaying a script; once exhausted every open fails.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<ScriptedConnection>>,
    urls: Mutex<Vec<String>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<ScriptedConnection>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            urls: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn open_count(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Connections handed out and not yet dropped.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn guarded(
        &self,
        frames: Vec<Result<StreamFrame, ConnectError>>,
        hang: bool,
    ) -> FrameStream {
        let inner = if hang {
            stream::iter(frames).chain(stream::pending()).boxed()
        } else {
            stream::iter(frames).boxed()
        };
        let guard = LiveGuard::new(&self.live);
        stream::unfold((inner, guard), |(mut inner, guard)| async move {
            let item = inner.next().await?;
            Some((item, (inner, guard)))
        })
        .boxed()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn open(&self, url: &str) -> Result<FrameStream, ConnectError> {
        self.urls.lock().unwrap().push(url.to_string());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ScriptedConnection::Frames(frames)) => Ok(self.guarded(frames, false)),
            Some(ScriptedConnection::Hanging(frames)) => Ok(self.guarded(frames, true)),
            Some(ScriptedConnection::Fail(err)) => Err(err),
            None => Err(ConnectError::Transport("connection refused".into())),
        }
    }
}

/// Backend recording every request it receives.
pub struct RecordingBackend {
    pub sent: Mutex<Vec<SendMessageRequest>>,
    pub validated: Mutex<Vec<String>>,
    send_result: Mutex<Result<SendAck, BackendError>>,
    validate_result: Mutex<Result<ValidateKeyResponse, BackendError>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            validated: Mutex::new(Vec::new()),
            send_result: Mutex::new(Ok(SendAck {
                accepted: Some(true),
                message_id: None,
            })),
            validate_result: Mutex::new(Ok(ValidateKeyResponse {
                valid: true,
                models: Some(vec!["gpt-4o".into()]),
                ..ValidateKeyResponse::default()
            })),
        })
    }

    pub fn fail_sends_with(&self, error: BackendError) {
        *self.send_result.lock().unwrap() = Err(error);
    }

    pub fn accept_sends(&self) {
        *self.send_result.lock().unwrap() = Ok(SendAck::default());
    }

    pub fn answer_validation(&self, response: ValidateKeyResponse) {
        *self.validate_result.lock().unwrap() = Ok(response);
    }

    pub fn sent_requests(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for RecordingBackend {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendAck, BackendError> {
        self.sent.lock().unwrap().push(request.clone());
        self.send_result.lock().unwrap().clone()
    }

    async fn validate_key(&self, credential: &str) -> Result<ValidateKeyResponse, BackendError> {
        self.validated.lock().unwrap().push(credential.to_string());
        self.validate_result.lock().unwrap().clone()
    }

    async fn list_models(&self) -> Result<ModelsResponse, BackendError> {
        Ok(ModelsResponse {
            models: vec![ModelInfo {
                id: "gpt-4o".into(),
                name: Some("GPT-4o".into()),
                description: None,
                context_length: Some(128_000),
                supports_streaming: true,
            }],
            default_model: Some("gpt-4o".into()),
        })
    }

    fn stream_url(&self, conversation_id: ConversationId) -> String {
        format!("http://test/chat/stream?conversationId={conversation_id}")
    }
}
