//! Session orchestration.
//!
//! [`SessionOrchestrator`] ties the vault, the chat backend and one
//! [`StreamingClient`] per open conversation together. Stream events from all
//! conversations share one channel; the orchestrator applies them to the
//! matching [`ConversationStateMachine`] after checking that the event's
//! generation is still the conversation's current one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::conversation::{Conversation, ConversationStateMachine, ConversationView};
use super::error::SessionError;
use super::stream::{
    ReconnectPolicy, StreamConnector, StreamEvent, StreamState, StreamingClient, TaggedEvent,
};
use super::vault::{VaultError, VaultService, VaultStorage};
use crate::api::{ChatBackend, ConversationId, ModelsResponse, SendMessageRequest, ValidateKeyResponse};

pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4000;

#[derive(Clone, Debug, PartialEq)]
pub struct SessionSettings {
    pub model: String,
    /// Given to conversations opened without a transcript.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_message_length: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Something the UI should re-render for.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    Delta {
        conversation_id: ConversationId,
        content: String,
    },
    Reconnecting {
        conversation_id: ConversationId,
        attempt: u32,
        delay: Duration,
    },
    Completed {
        conversation_id: ConversationId,
    },
    Failed {
        conversation_id: ConversationId,
        error: SessionError,
    },
}

struct ConversationSlot {
    machine: ConversationStateMachine,
    client: StreamingClient,
}

impl ConversationSlot {
    fn can_send(&self) -> bool {
        self.client.state().is_settled() && !self.machine.is_loading()
    }
}

pub struct SessionOrchestrator<S: VaultStorage> {
    vault: VaultService<S>,
    backend: Arc<dyn ChatBackend>,
    connector: Arc<dyn StreamConnector>,
    settings: SessionSettings,
    conversations: HashMap<ConversationId, ConversationSlot>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    events_rx: mpsc::UnboundedReceiver<TaggedEvent>,
}

impl<S: VaultStorage> SessionOrchestrator<S> {
    pub fn new(
        vault: VaultService<S>,
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn StreamConnector>,
        settings: SessionSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            vault,
            backend,
            connector,
            settings,
            conversations: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn vault(&self) -> &VaultService<S> {
        &self.vault
    }

    /// Open (or return) the conversation with `id`, using `model` or the
    /// configured default for a new one.
    pub fn open_conversation(
        &mut self,
        id: ConversationId,
        model: Option<&str>,
    ) -> &ConversationStateMachine {
        let model = model.unwrap_or(self.settings.model.as_str()).to_string();
        let mut machine = ConversationStateMachine::new(id, model);
        machine.set_system_prompt(self.settings.system_prompt.as_deref());
        self.attach(machine)
    }

    /// Resume a transcript loaded from elsewhere.
    pub fn restore_conversation(&mut self, conversation: Conversation) -> &ConversationStateMachine {
        self.attach(ConversationStateMachine::from_conversation(conversation))
    }

    fn attach(&mut self, machine: ConversationStateMachine) -> &ConversationStateMachine {
        let id = machine.id();
        let connector = Arc::clone(&self.connector);
        let policy = self.settings.reconnect;
        let events_tx = self.events_tx.clone();
        let slot = self.conversations.entry(id).or_insert_with(|| {
            debug!(conversation = %id, "opening conversation");
            ConversationSlot {
                machine,
                client: StreamingClient::new(id, connector, policy, events_tx),
            }
        });
        &slot.machine
    }

    /// Disconnect and forget a conversation, returning its transcript.
    pub fn close_conversation(&mut self, id: ConversationId) -> Option<Conversation> {
        if self.conversations.get(&id)?.client.state().is_settled() {
            self.pump_pending();
        }
        let mut slot = self.conversations.remove(&id)?;
        if slot.client.disconnect() {
            slot.machine.mark_assistant_message_stopped();
        }
        Some(slot.machine.into_conversation())
    }

    pub fn conversation(&self, id: ConversationId) -> Option<&ConversationStateMachine> {
        self.conversations.get(&id).map(|slot| &slot.machine)
    }

    pub fn view(&self, id: ConversationId) -> Option<ConversationView> {
        self.conversation(id).map(ConversationStateMachine::view)
    }

    pub fn stream_state(&self, id: ConversationId) -> Option<StreamState> {
        self.conversations.get(&id).map(|slot| slot.client.state())
    }

    /// Whether a new message may be sent to `id` right now.
    pub fn can_send(&self, id: ConversationId) -> bool {
        self.conversations
            .get(&id)
            .is_some_and(ConversationSlot::can_send)
    }

    pub fn has_active_stream(&self) -> bool {
        self.conversations
            .values()
            .any(|slot| !slot.client.state().is_settled())
    }

    pub async fn send_message(
        &mut self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<(), SessionError> {
        let Some(credential) = self.vault.retrieve() else {
            return Err(self.reject(conversation_id, SessionError::Credential));
        };
        let Some(slot) = self.conversations.get(&conversation_id) else {
            return Err(SessionError::UnknownConversation(conversation_id));
        };
        if !slot.can_send() {
            return Err(self.reject(conversation_id, SessionError::Busy { conversation_id }));
        }
        let content = match validate_message(content, self.settings.max_message_length) {
            Ok(content) => content,
            Err(err) => return Err(self.reject(conversation_id, err)),
        };

        let Some(slot) = self.conversations.get_mut(&conversation_id) else {
            return Err(SessionError::UnknownConversation(conversation_id));
        };
        slot.machine.append_user_message(content.clone());
        let request = SendMessageRequest {
            conversation_id,
            content,
            credential,
            model: slot.machine.model().to_string(),
            system_prompt: slot.machine.system_prompt().map(str::to_string),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        match self.backend.send_message(&request).await {
            Ok(ack) => {
                debug!(conversation = %conversation_id, message_id = ?ack.message_id, "send acknowledged");
            }
            Err(err) => {
                warn!(conversation = %conversation_id, error = %err, "send failed before acknowledgement");
                let error = SessionError::Connection(err.to_string());
                slot.machine.fail_request(error.user_message());
                return Err(error);
            }
        }

        let url = self.backend.stream_url(conversation_id);
        slot.client.connect(&url);
        Ok(())
    }

    /// Stop the response streaming into `id`, keeping what arrived so far.
    ///
    /// Returns whether a stream was in flight.
    pub fn stop_generation(&mut self, id: ConversationId) -> Result<bool, SessionError> {
        let settled = self
            .conversations
            .get(&id)
            .ok_or(SessionError::UnknownConversation(id))?
            .client
            .state()
            .is_settled();
        if settled {
            // The stream already ended; its queued terminal event wins over a stop.
            self.pump_pending();
        }
        let slot = self
            .conversations
            .get_mut(&id)
            .ok_or(SessionError::UnknownConversation(id))?;
        let was_active = slot.client.disconnect();
        slot.machine.mark_assistant_message_stopped();
        if was_active {
            info!(conversation = %id, "generation stopped");
        }
        Ok(was_active)
    }

    pub fn change_model(&mut self, id: ConversationId, model: &str) -> Result<bool, SessionError> {
        let slot = self
            .conversations
            .get_mut(&id)
            .ok_or(SessionError::UnknownConversation(id))?;
        Ok(slot.machine.change_model(model))
    }

    /// Set the instructions sent with every later message to `id`.
    pub fn set_system_prompt(
        &mut self,
        id: ConversationId,
        prompt: Option<&str>,
    ) -> Result<bool, SessionError> {
        let slot = self
            .conversations
            .get_mut(&id)
            .ok_or(SessionError::UnknownConversation(id))?;
        Ok(slot.machine.set_system_prompt(prompt))
    }

    pub fn set_credential(&self, secret: &str) -> Result<(), VaultError> {
        self.vault.store(secret.trim())
    }

    pub fn has_credential(&self) -> bool {
        self.vault.has_credential()
    }

    pub fn check_credential(&self) -> Result<bool, VaultError> {
        self.vault.check()
    }

    pub fn clear_credential(&self) -> Result<(), VaultError> {
        self.vault.clear()
    }

    /// Ask the service whether `credential` works. The answer is advisory:
    /// `set_credential` stores regardless.
    pub async fn validate_credential(
        &self,
        credential: &str,
    ) -> Result<ValidateKeyResponse, SessionError> {
        self.backend
            .validate_key(credential.trim())
            .await
            .map_err(|err| SessionError::Connection(err.to_string()))
    }

    pub async fn list_models(&self) -> Result<ModelsResponse, SessionError> {
        self.backend
            .list_models()
            .await
            .map_err(|err| SessionError::Connection(err.to_string()))
    }

    /// Wait for the next stream event that changes a conversation.
    ///
    /// Returns `None` once no stream is active and nothing is queued.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            // A stream settles and queues its terminal event under one lock,
            // so the state has to be read before the queue.
            let tagged = if self.has_active_stream() {
                self.events_rx.recv().await?
            } else {
                self.events_rx.try_recv().ok()?
            };
            if let Some(update) = self.apply_event(tagged) {
                return Some(update);
            }
        }
    }

    /// Apply every event already queued without waiting.
    pub fn pump_pending(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Ok(tagged) = self.events_rx.try_recv() {
            updates.extend(self.apply_event(tagged));
        }
        updates
    }

    fn apply_event(&mut self, tagged: TaggedEvent) -> Option<SessionUpdate> {
        let conversation_id = tagged.conversation_id;
        let Some(slot) = self.conversations.get_mut(&conversation_id) else {
            debug!(conversation = %conversation_id, "dropping event for closed conversation");
            return None;
        };
        if !slot.client.is_current(tagged.generation) {
            debug!(
                conversation = %conversation_id,
                generation = tagged.generation,
                "dropping stale stream event"
            );
            return None;
        }

        match tagged.event {
            StreamEvent::Opened => None,
            StreamEvent::Delta(content) => {
                if slot.machine.streaming_message().is_none() {
                    slot.machine.begin_assistant_message();
                }
                slot.machine.extend_assistant_message(&content);
                Some(SessionUpdate::Delta {
                    conversation_id,
                    content,
                })
            }
            StreamEvent::Reconnecting { attempt, delay, .. } => {
                Some(SessionUpdate::Reconnecting {
                    conversation_id,
                    attempt,
                    delay,
                })
            }
            StreamEvent::Completed => {
                slot.machine.finalize_assistant_message();
                Some(SessionUpdate::Completed { conversation_id })
            }
            StreamEvent::Failed(failure) => {
                let error = SessionError::TerminalStream(failure.to_string());
                slot.machine.mark_assistant_message_errored(error.user_message());
                Some(SessionUpdate::Failed {
                    conversation_id,
                    error,
                })
            }
        }
    }

    fn reject(&mut self, id: ConversationId, error: SessionError) -> SessionError {
        if let Some(slot) = self.conversations.get_mut(&id) {
            slot.machine.record_error(error.user_message());
        }
        error
    }
}

impl<S: VaultStorage> Drop for SessionOrchestrator<S> {
    fn drop(&mut self) {
        for slot in self.conversations.values_mut() {
            slot.client.disconnect();
        }
    }
}

fn validate_message(content: &str, max_length: usize) -> Result<String, SessionError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(SessionError::InvalidMessage(
            "Message cannot be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > max_length {
        return Err(SessionError::InvalidMessage(format!(
            "Message exceeds {max_length} characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::BackendError;
    use crate::core::conversation::Role;
    use crate::core::stream::{ConnectError, StreamFrame};
    use crate::core::vault::MemoryStorage;
    use crate::utils::test_utils::{
        memory_vault, RecordingBackend, ScriptedConnection, ScriptedConnector,
    };

    const CONVERSATION: ConversationId = ConversationId(7);

    fn delta(text: &str) -> Result<StreamFrame, ConnectError> {
        Ok(StreamFrame::Delta(text.to_string()))
    }

    fn orchestrator(
        backend: &Arc<RecordingBackend>,
        connector: &Arc<ScriptedConnector>,
    ) -> SessionOrchestrator<MemoryStorage> {
        let backend: Arc<dyn ChatBackend> = backend.clone();
        let connector: Arc<dyn StreamConnector> = connector.clone();
        let mut orchestrator = SessionOrchestrator::new(
            memory_vault("alice"),
            backend,
            connector,
            SessionSettings::default(),
        );
        orchestrator.open_conversation(CONVERSATION, None);
        orchestrator
    }

    async fn wait_until_closed(orchestrator: &SessionOrchestrator<MemoryStorage>) {
        while orchestrator.stream_state(CONVERSATION) != Some(StreamState::Closed) {
            tokio::task::yield_now().await;
        }
    }

    async fn drain(orchestrator: &mut SessionOrchestrator<MemoryStorage>) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = orchestrator.next_update().await {
            updates.push(update);
        }
        updates
    }

    #[tokio::test(start_paused = true)]
    async fn send_streams_reply_into_conversation() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::new(vec![ScriptedConnection::Frames(vec![
            delta("Hel"),
            delta("lo"),
            delta(" world"),
            Ok(StreamFrame::Complete),
        ])]);
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator
            .send_message(CONVERSATION, "  Say hello  ")
            .await
            .unwrap();
        assert!(orchestrator.view(CONVERSATION).unwrap().is_loading);

        let updates = drain(&mut orchestrator).await;
        assert_eq!(
            updates.last(),
            Some(&SessionUpdate::Completed {
                conversation_id: CONVERSATION
            })
        );

        let view = orchestrator.view(CONVERSATION).unwrap();
        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.messages[0].content, "Say hello");
        assert_eq!(view.messages[1].role, Role::Assistant);
        assert_eq!(view.messages[1].content, "Hello world");
        assert!(!view.messages[1].streaming);
        assert!(!view.is_loading);
        assert_eq!(view.streaming_message_content, None);

        let sent = backend.sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].credential, "sk-test-123");
        assert_eq!(sent[0].model, "gpt-4o");
        assert_eq!(
            connector.opened_urls(),
            vec!["http://test/chat/stream?conversationId=7".to_string()]
        );
        assert!(orchestrator.can_send(CONVERSATION));
    }

    #[tokio::test]
    async fn missing_credential_is_rejected_before_anything_else() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::always_failing();
        let mut orchestrator = orchestrator(&backend, &connector);

        let err = orchestrator
            .send_message(CONVERSATION, "Hi")
            .await
            .unwrap_err();

        assert_eq!(err, SessionError::Credential);
        let view = orchestrator.view(CONVERSATION).unwrap();
        assert!(view.messages.is_empty());
        assert_eq!(view.error, Some(SessionError::Credential.user_message()));
        assert!(backend.sent_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_streaming_is_busy_and_does_not_mutate() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::new(vec![ScriptedConnection::Hanging(vec![delta(
            "Thinking",
        )])]);
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator.send_message(CONVERSATION, "First").await.unwrap();
        orchestrator.next_update().await;
        let before = orchestrator.view(CONVERSATION).unwrap().messages;

        let err = orchestrator
            .send_message(CONVERSATION, "Second")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SessionError::Busy {
                conversation_id: CONVERSATION
            }
        );
        let view = orchestrator.view(CONVERSATION).unwrap();
        assert_eq!(view.messages, before);
        assert!(view.is_loading);
        assert_eq!(backend.sent_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_partial_reply_and_ignores_late_frames() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::new(vec![ScriptedConnection::Hanging(vec![
            delta("Hello"),
            delta(" late"),
        ])]);
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        let first = orchestrator.next_update().await;
        assert_eq!(
            first,
            Some(SessionUpdate::Delta {
                conversation_id: CONVERSATION,
                content: "Hello".into()
            })
        );

        assert!(orchestrator.stop_generation(CONVERSATION).unwrap());
        assert!(orchestrator.pump_pending().is_empty());
        tokio::task::yield_now().await;
        assert!(orchestrator.pump_pending().is_empty());

        let view = orchestrator.view(CONVERSATION).unwrap();
        let reply = view.messages.last().unwrap();
        assert_eq!(reply.content, "Hello");
        assert!(!reply.streaming);
        assert!(reply.stopped);
        assert!(!view.is_loading);
        assert_eq!(orchestrator.stream_state(CONVERSATION), Some(StreamState::Closed));
        assert_eq!(connector.live_connections(), 0);
        assert!(orchestrator.can_send(CONVERSATION));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_frames_from_a_superseded_connection_are_dropped() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::new(vec![ScriptedConnection::Hanging(vec![
            delta("stale one"),
            delta("stale two"),
        ])]);
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        // Let the connection queue its frames without applying them.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let before = orchestrator.view(CONVERSATION).unwrap();

        orchestrator.stop_generation(CONVERSATION).unwrap();
        let applied = orchestrator.pump_pending();

        assert!(applied.is_empty());
        let after = orchestrator.view(CONVERSATION).unwrap();
        assert_eq!(after.messages.len(), before.messages.len());
        assert!(after
            .messages
            .iter()
            .all(|message| !message.content.contains("stale")));
    }

    #[tokio::test]
    async fn failed_send_keeps_user_message_and_reports_connection_error() {
        let backend = RecordingBackend::new();
        backend.fail_sends_with(BackendError::Transport("connection refused".into()));
        let connector = ScriptedConnector::always_failing();
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        let err = orchestrator
            .send_message(CONVERSATION, "Hi")
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Connection(_)));
        let view = orchestrator.view(CONVERSATION).unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].content, "Hi");
        assert!(!view.is_loading);
        assert!(view.error.is_some());
        assert_eq!(connector.open_count(), 0);
        assert!(orchestrator.can_send(CONVERSATION));

        backend.accept_sends();
        assert!(orchestrator.send_message(CONVERSATION, "Hi").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_frame_marks_reply_errored() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::new(vec![ScriptedConnection::Frames(vec![
            delta("Par"),
            Ok(StreamFrame::Error("model overloaded".into())),
        ])]);
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        let updates = drain(&mut orchestrator).await;

        let expected = SessionError::TerminalStream("model overloaded".into());
        assert_eq!(
            updates.last(),
            Some(&SessionUpdate::Failed {
                conversation_id: CONVERSATION,
                error: expected.clone(),
            })
        );
        let view = orchestrator.view(CONVERSATION).unwrap();
        let reply = view.messages.last().unwrap();
        assert_eq!(reply.content, "Par");
        assert_eq!(reply.error, Some(expected.user_message()));
        assert_eq!(view.error, Some(expected.user_message()));
        assert!(!view.is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_surface_a_terminal_error() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::always_failing();
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        let updates = drain(&mut orchestrator).await;

        let reconnects = updates
            .iter()
            .filter(|update| matches!(update, SessionUpdate::Reconnecting { .. }))
            .count();
        assert_eq!(reconnects, 5);
        assert!(matches!(
            updates.last(),
            Some(SessionUpdate::Failed {
                error: SessionError::TerminalStream(_),
                ..
            })
        ));
        assert_eq!(connector.open_count(), 6);
        let view = orchestrator.view(CONVERSATION).unwrap();
        assert!(view.messages.last().unwrap().is_errored());
        assert!(orchestrator.can_send(CONVERSATION));
    }

    #[tokio::test]
    async fn invalid_messages_are_rejected_without_mutation() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::always_failing();
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        let empty = orchestrator.send_message(CONVERSATION, "   ").await;
        assert!(matches!(empty, Err(SessionError::InvalidMessage(_))));

        let long = "x".repeat(DEFAULT_MAX_MESSAGE_LENGTH + 1);
        let too_long = orchestrator.send_message(CONVERSATION, &long).await;
        assert!(matches!(too_long, Err(SessionError::InvalidMessage(_))));

        assert!(orchestrator.view(CONVERSATION).unwrap().messages.is_empty());
        assert!(backend.sent_requests().is_empty());
    }

    #[tokio::test]
    async fn unknown_conversations_are_reported() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::always_failing();
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        let missing = ConversationId(99);
        assert_eq!(
            orchestrator.send_message(missing, "Hi").await,
            Err(SessionError::UnknownConversation(missing))
        );
        assert_eq!(
            orchestrator.stop_generation(missing),
            Err(SessionError::UnknownConversation(missing))
        );
    }

    #[tokio::test]
    async fn credential_lifecycle_goes_through_the_vault() {
        let backend = RecordingBackend::new();
        backend.answer_validation(ValidateKeyResponse {
            valid: false,
            error: Some("Invalid API key".into()),
            ..ValidateKeyResponse::default()
        });
        let connector = ScriptedConnector::always_failing();
        let orchestrator = orchestrator(&backend, &connector);

        assert!(!orchestrator.has_credential());
        let verdict = orchestrator.validate_credential(" sk-bad ").await.unwrap();
        assert!(!verdict.valid);
        assert_eq!(backend.validated.lock().unwrap().as_slice(), ["sk-bad"]);

        orchestrator.set_credential("sk-bad").unwrap();
        assert!(orchestrator.has_credential());
        assert!(orchestrator
            .vault()
            .storage()
            .raw("api-key:alice")
            .is_some_and(|stored| !stored.contains("sk-bad")));

        orchestrator.clear_credential().unwrap();
        assert!(!orchestrator.has_credential());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_conversation_releases_its_stream() {
        let backend = RecordingBackend::new();
        let connector =
            ScriptedConnector::new(vec![ScriptedConnection::Hanging(vec![delta("Hel")])]);
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        orchestrator.next_update().await;
        assert_eq!(connector.live_connections(), 1);

        let conversation = orchestrator.close_conversation(CONVERSATION).unwrap();
        tokio::task::yield_now().await;

        assert!(conversation.messages.last().unwrap().stopped);
        assert_eq!(connector.live_connections(), 0);
        assert!(orchestrator.view(CONVERSATION).is_none());
        assert!(orchestrator.pump_pending().is_empty());
    }

    #[tokio::test]
    async fn change_model_applies_to_the_next_send() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::always_failing();
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        assert!(orchestrator.change_model(CONVERSATION, "gpt-4o-mini").unwrap());
        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        orchestrator.stop_generation(CONVERSATION).unwrap();

        assert_eq!(backend.sent_requests()[0].model, "gpt-4o-mini");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn draining_never_ends_before_the_terminal_event_is_applied() {
        for run in 0..300 {
            let backend = RecordingBackend::new();
            let connector = ScriptedConnector::new(vec![ScriptedConnection::Frames(vec![
                delta("Hello"),
                Ok(StreamFrame::Complete),
            ])]);
            let mut orchestrator = orchestrator(&backend, &connector);
            // Idle conversations make each activity check slower.
            for idle in 0..1000 {
                orchestrator.open_conversation(ConversationId(1000 + idle), None);
            }
            orchestrator.set_credential("sk-test-123").unwrap();

            orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
            let updates = drain(&mut orchestrator).await;

            assert!(
                updates.contains(&SessionUpdate::Delta {
                    conversation_id: CONVERSATION,
                    content: "Hello".into(),
                }),
                "run {run}: delta missing from {updates:?}"
            );
            assert_eq!(
                updates.last(),
                Some(&SessionUpdate::Completed {
                    conversation_id: CONVERSATION
                }),
                "run {run}"
            );
            let view = orchestrator.view(CONVERSATION).unwrap();
            assert!(!view.is_loading, "run {run}");
            assert_eq!(view.messages.last().unwrap().content, "Hello");
            assert!(orchestrator.can_send(CONVERSATION), "run {run}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_after_the_stream_ended_keeps_the_finished_reply() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::new(vec![ScriptedConnection::Frames(vec![
            delta("Hello"),
            Ok(StreamFrame::Complete),
        ])]);
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        wait_until_closed(&orchestrator).await;

        assert!(!orchestrator.stop_generation(CONVERSATION).unwrap());

        let view = orchestrator.view(CONVERSATION).unwrap();
        let reply = view.messages.last().unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Hello");
        assert!(!reply.streaming);
        assert!(!reply.stopped);
        assert!(!view.is_loading);
        assert!(orchestrator.can_send(CONVERSATION));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_after_the_stream_ended_keeps_the_finished_reply() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::new(vec![ScriptedConnection::Frames(vec![
            delta("Hello"),
            Ok(StreamFrame::Complete),
        ])]);
        let mut orchestrator = orchestrator(&backend, &connector);
        orchestrator.set_credential("sk-test-123").unwrap();

        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        wait_until_closed(&orchestrator).await;

        let conversation = orchestrator.close_conversation(CONVERSATION).unwrap();
        let reply = conversation.messages.last().unwrap();
        assert_eq!(reply.content, "Hello");
        assert!(!reply.streaming);
        assert!(!reply.stopped);
    }

    #[tokio::test]
    async fn system_prompt_is_sent_with_each_message() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::always_failing();
        let settings = SessionSettings {
            system_prompt: Some("You are a pirate.".into()),
            ..SessionSettings::default()
        };
        let backend_seam: Arc<dyn ChatBackend> = backend.clone();
        let connector_seam: Arc<dyn StreamConnector> = connector.clone();
        let mut orchestrator =
            SessionOrchestrator::new(memory_vault("alice"), backend_seam, connector_seam, settings);
        orchestrator.open_conversation(CONVERSATION, None);
        orchestrator.set_credential("sk-test-123").unwrap();
        assert_eq!(
            orchestrator.conversation(CONVERSATION).unwrap().system_prompt(),
            Some("You are a pirate.")
        );

        orchestrator.send_message(CONVERSATION, "Hi").await.unwrap();
        orchestrator.stop_generation(CONVERSATION).unwrap();
        assert!(orchestrator
            .set_system_prompt(CONVERSATION, Some("Answer in haiku."))
            .unwrap());
        orchestrator.send_message(CONVERSATION, "Again").await.unwrap();
        orchestrator.stop_generation(CONVERSATION).unwrap();
        orchestrator.set_system_prompt(CONVERSATION, None).unwrap();
        orchestrator.send_message(CONVERSATION, "Plain").await.unwrap();

        let sent = backend.sent_requests();
        assert_eq!(sent[0].system_prompt.as_deref(), Some("You are a pirate."));
        assert_eq!(sent[1].system_prompt.as_deref(), Some("Answer in haiku."));
        assert_eq!(sent[2].system_prompt, None);
        assert_eq!(
            orchestrator.set_system_prompt(ConversationId(99), Some("x")),
            Err(SessionError::UnknownConversation(ConversationId(99)))
        );
    }

    #[tokio::test]
    async fn models_come_from_the_backend() {
        let backend = RecordingBackend::new();
        let connector = ScriptedConnector::always_failing();
        let orchestrator = orchestrator(&backend, &connector);

        let models = orchestrator.list_models().await.unwrap();
        assert_eq!(models.models[0].id, "gpt-4o");
    }
}
