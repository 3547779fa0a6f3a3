use std::error::Error;
use std::fmt;

use crate::api::ConversationId;

/// Failures surfaced by the session layer. Each one resolves to a
/// conversation-scoped error string; none of them is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No usable credential is stored.
    Credential,
    /// A response is still streaming for this conversation.
    Busy { conversation_id: ConversationId },
    /// The chat service could not be reached or rejected the request.
    Connection(String),
    /// The stream failed for good: an error frame or exhausted reconnects.
    TerminalStream(String),
    InvalidMessage(String),
    UnknownConversation(ConversationId),
}

impl SessionError {
    /// Text shown next to the conversation.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Credential => {
                "No API key is configured. Add one before sending messages.".to_string()
            }
            SessionError::Busy { .. } => {
                "A response is still being generated. Stop it or wait for it to finish."
                    .to_string()
            }
            SessionError::Connection(message) => {
                format!("Could not reach the chat service: {message}")
            }
            SessionError::TerminalStream(message) => format!("Generation failed: {message}"),
            SessionError::InvalidMessage(reason) => reason.clone(),
            SessionError::UnknownConversation(id) => format!("Conversation {id} is not open."),
        }
    }

    /// Whether sending again can succeed without the user changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Busy { .. }
                | SessionError::Connection(_)
                | SessionError::TerminalStream(_)
        )
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Credential => write!(f, "no credential available"),
            SessionError::Busy { conversation_id } => {
                write!(f, "conversation {conversation_id} already has an active stream")
            }
            SessionError::Connection(message) => write!(f, "connection error: {message}"),
            SessionError::TerminalStream(message) => write!(f, "stream failed: {message}"),
            SessionError::InvalidMessage(reason) => write!(f, "invalid message: {reason}"),
            SessionError::UnknownConversation(id) => write!(f, "unknown conversation {id}"),
        }
    }
}

impl Error for SessionError {}
