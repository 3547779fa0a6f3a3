//! Conversation transcript and its streaming state machine.
//!
//! The machine is the only writer of a [`Conversation`]'s message list. User
//! messages are appended optimistically; assistant content arrives as deltas
//! and is frozen once the response is finalized, stopped or errored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::ConversationId;

const TITLE_MAX_CHARS: usize = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub streaming: bool,
    pub stopped: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            streaming: false,
            stopped: false,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn streaming_assistant() -> Self {
        Self {
            streaming: true,
            ..Self::new(Role::Assistant, String::new())
        }
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: Option<String>,
    pub model: String,
    /// Instructions sent ahead of the transcript on every request.
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: ConversationId, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: None,
            model: model.into(),
            system_prompt: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Snapshot handed to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub messages: Vec<Message>,
    pub streaming_message_content: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
}

/// Derive a display title from the first user message.
pub fn title_from_message(content: &str) -> String {
    let trimmed = content.trim();
    let mut chars = trimmed.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head.trim_end())
    } else {
        head
    }
}

#[derive(Debug, Clone)]
pub struct ConversationStateMachine {
    conversation: Conversation,
    streaming_index: Option<usize>,
    is_loading: bool,
    error: Option<String>,
}

impl ConversationStateMachine {
    pub fn new(id: ConversationId, model: impl Into<String>) -> Self {
        Self::from_conversation(Conversation::new(id, model))
    }

    /// Resume an existing transcript. Messages left streaming by an earlier
    /// session are treated as stopped.
    pub fn from_conversation(mut conversation: Conversation) -> Self {
        for message in conversation
            .messages
            .iter_mut()
            .filter(|message| message.streaming)
        {
            message.streaming = false;
            message.stopped = true;
        }
        Self {
            conversation,
            streaming_index: None,
            is_loading: false,
            error: None,
        }
    }

    pub fn id(&self) -> ConversationId {
        self.conversation.id
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn into_conversation(self) -> Conversation {
        self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    pub fn model(&self) -> &str {
        &self.conversation.model
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.conversation.system_prompt.as_deref()
    }

    pub fn title(&self) -> Option<&str> {
        self.conversation.title.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn streaming_message(&self) -> Option<&Message> {
        self.streaming_index
            .and_then(|index| self.conversation.messages.get(index))
    }

    pub fn view(&self) -> ConversationView {
        ConversationView {
            messages: self.conversation.messages.clone(),
            streaming_message_content: self
                .streaming_message()
                .map(|message| message.content.clone()),
            is_loading: self.is_loading,
            error: self.error.clone(),
        }
    }

    /// Append a user message and mark the conversation as waiting for a reply.
    pub fn append_user_message(&mut self, content: impl Into<String>) -> &Message {
        let content = content.into();
        if self.conversation.title.is_none() {
            self.conversation.title = Some(title_from_message(&content));
        }
        self.is_loading = true;
        self.error = None;
        self.push(Message::new(Role::User, content))
    }

    /// Start the assistant reply. Idempotent while a reply is streaming.
    pub fn begin_assistant_message(&mut self) -> &Message {
        if let Some(index) = self.streaming_index {
            return &self.conversation.messages[index];
        }
        self.streaming_index = Some(self.conversation.messages.len());
        self.push(Message::streaming_assistant())
    }

    pub fn extend_assistant_message(&mut self, delta: &str) {
        if self.streaming_index.is_none() {
            debug!(conversation = %self.id(), "delta without a streaming message; starting one");
            self.begin_assistant_message();
        }
        if let Some(message) = self.streaming_message_mut() {
            message.content.push_str(delta);
        }
        self.touch();
    }

    /// Freeze the streaming reply. Returns whether a reply was streaming.
    pub fn finalize_assistant_message(&mut self) -> bool {
        self.is_loading = false;
        self.settle(|_| {})
    }

    pub fn mark_assistant_message_stopped(&mut self) -> bool {
        self.is_loading = false;
        self.settle(|message| message.stopped = true)
    }

    /// Record a terminal failure on the reply, keeping any received content.
    ///
    /// When the failure arrives before the first frame, an empty assistant
    /// message carries the error so the transcript shows where it happened.
    pub fn mark_assistant_message_errored(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.streaming_index.is_none() {
            self.begin_assistant_message();
        }
        let recorded = reason.clone();
        self.settle(move |message| message.error = Some(recorded));
        self.is_loading = false;
        self.error = Some(reason);
    }

    /// A request failed before any reply began; the transcript is untouched.
    pub fn fail_request(&mut self, reason: impl Into<String>) {
        self.is_loading = false;
        self.error = Some(reason.into());
    }

    /// Surface an error without changing loading state or messages.
    pub fn record_error(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Switch the model used for future sends. Returns whether it changed.
    pub fn change_model(&mut self, model: impl Into<String>) -> bool {
        let model = model.into();
        if self.conversation.model == model {
            return false;
        }
        self.conversation.model = model;
        self.touch();
        true
    }

    /// Replace the system prompt; blank text clears it. Returns whether it changed.
    pub fn set_system_prompt(&mut self, prompt: Option<&str>) -> bool {
        let prompt = prompt
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .map(str::to_string);
        if self.conversation.system_prompt == prompt {
            return false;
        }
        self.conversation.system_prompt = prompt;
        self.touch();
        true
    }

    fn settle(&mut self, update: impl FnOnce(&mut Message)) -> bool {
        let Some(index) = self.streaming_index.take() else {
            return false;
        };
        if let Some(message) = self.conversation.messages.get_mut(index) {
            message.streaming = false;
            update(message);
        }
        self.touch();
        true
    }

    fn streaming_message_mut(&mut self) -> Option<&mut Message> {
        self.streaming_index
            .and_then(|index| self.conversation.messages.get_mut(index))
    }

    fn push(&mut self, message: Message) -> &Message {
        self.conversation.messages.push(message);
        self.touch();
        let index = self.conversation.messages.len() - 1;
        &self.conversation.messages[index]
    }

    fn touch(&mut self) {
        self.conversation.updated_at = Utc::now();
    }
}
