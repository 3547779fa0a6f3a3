//! Reconnecting event-stream client.
//!
//! A [`StreamingClient`] owns at most one logical connection. Every
//! `connect()` and `disconnect()` bumps the generation id; the background
//! task serving a connection captured its generation at spawn time and stops
//! emitting as soon as the id moves on, including after a backoff sleep.
//! Events reach the consumer through an unbounded channel as
//! [`TaggedEvent`]s, so the consumer still has to drop events whose
//! generation is no longer current: those may already sit in the channel.
//!
//! A reconnect opens a brand-new stream. The service has no resume or
//! sequence-id protocol, so content generated while the connection was down
//! is not replayed and content sent twice by the server is not deduplicated.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connector::{ConnectError, StreamConnector};
use super::sse::StreamFrame;
use crate::api::ConversationId;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before reconnect attempt `attempt` (0-indexed): `2^attempt * base`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.checked_pow(attempt).unwrap_or(u32::MAX))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl StreamState {
    /// Idle and Closed sessions hold no connection and accept a new send.
    pub fn is_settled(self) -> bool {
        matches!(self, StreamState::Idle | StreamState::Closed)
    }
}

/// Why a session ended without completing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFailure {
    /// The server sent an `error` frame.
    Server(String),
    /// Every reconnect attempt failed.
    Exhausted { attempts: u32, last_error: ConnectError },
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamFailure::Server(message) => write!(f, "{message}"),
            StreamFailure::Exhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "connection lost after {attempts} reconnect attempts ({last_error})"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Opened,
    Delta(String),
    Completed,
    /// A connection error was absorbed; the next attempt starts after `delay`.
    Reconnecting {
        attempt: u32,
        delay: Duration,
        error: ConnectError,
    },
    Failed(StreamFailure),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed | StreamEvent::Failed(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedEvent {
    pub conversation_id: ConversationId,
    pub generation: u64,
    pub event: StreamEvent,
}

#[derive(Debug)]
struct SessionShared {
    state: StreamState,
    reconnect_attempt: u32,
    generation: u64,
}

fn lock(shared: &Mutex<SessionShared>) -> MutexGuard<'_, SessionShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StreamingClient {
    conversation_id: ConversationId,
    connector: Arc<dyn StreamConnector>,
    policy: ReconnectPolicy,
    shared: Arc<Mutex<SessionShared>>,
    cancel_token: Option<CancellationToken>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl StreamingClient {
    pub fn new(
        conversation_id: ConversationId,
        connector: Arc<dyn StreamConnector>,
        policy: ReconnectPolicy,
        events_tx: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            conversation_id,
            connector,
            policy,
            shared: Arc::new(Mutex::new(SessionShared {
                state: StreamState::Idle,
                reconnect_attempt: 0,
                generation: 0,
            })),
            cancel_token: None,
            events_tx,
        }
    }

    /// Build a client together with the receiving end of its event channel.
    pub fn channel(
        conversation_id: ConversationId,
        connector: Arc<dyn StreamConnector>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(conversation_id, connector, policy, tx), rx)
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn state(&self) -> StreamState {
        lock(&self.shared).state
    }

    pub fn generation(&self) -> u64 {
        lock(&self.shared).generation
    }

    pub fn reconnect_attempt(&self) -> u32 {
        lock(&self.shared).reconnect_attempt
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Open a stream to `url`, replacing any session still in flight.
    ///
    /// Returns the generation id tagging every event of the new session.
    pub fn connect(&mut self, url: &str) -> u64 {
        if !self.state().is_settled() {
            self.disconnect();
        }
        self.release();

        let generation = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.reconnect_attempt = 0;
            shared.state = StreamState::Connecting;
            shared.generation
        };

        let token = CancellationToken::new();
        self.cancel_token = Some(token.clone());
        info!(conversation = %self.conversation_id, generation, url, "connecting event stream");

        let task = SessionTask {
            conversation_id: self.conversation_id,
            generation,
            url: url.to_string(),
            connector: Arc::clone(&self.connector),
            policy: self.policy,
            shared: Arc::clone(&self.shared),
            events_tx: self.events_tx.clone(),
        };
        tokio::spawn(task.run(token));
        generation
    }

    /// Close the session: cancel any pending backoff, reset the attempt
    /// counter and release the connection.
    ///
    /// Returns whether a session was in flight.
    pub fn disconnect(&mut self) -> bool {
        self.release();
        let mut shared = lock(&self.shared);
        let was_active = !shared.state.is_settled();
        shared.generation += 1;
        shared.reconnect_attempt = 0;
        shared.state = StreamState::Closed;
        if was_active {
            debug!(
                conversation = %self.conversation_id,
                generation = shared.generation,
                "event stream disconnected"
            );
        }
        was_active
    }

    fn release(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct SessionTask {
    conversation_id: ConversationId,
    generation: u64,
    url: String,
    connector: Arc<dyn StreamConnector>,
    policy: ReconnectPolicy,
    shared: Arc<Mutex<SessionShared>>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl SessionTask {
    async fn run(self, cancel_token: CancellationToken) {
        tokio::select! {
            _ = cancel_token.cancelled() => {}
            _ = self.drive() => {}
        }
    }

    async fn drive(&self) {
        loop {
            let error = match self.connector.open(&self.url).await {
                Ok(mut frames) => {
                    if !self.update(|shared| shared.state = StreamState::Open, Some(StreamEvent::Opened)) {
                        return;
                    }
                    loop {
                        match frames.next().await {
                            Some(Ok(StreamFrame::Delta(content))) => {
                                let delivered = self.update(
                                    |shared| shared.reconnect_attempt = 0,
                                    Some(StreamEvent::Delta(content)),
                                );
                                if !delivered {
                                    return;
                                }
                            }
                            Some(Ok(StreamFrame::Complete)) => {
                                self.finish(StreamEvent::Completed);
                                return;
                            }
                            Some(Ok(StreamFrame::Error(message))) => {
                                warn!(conversation = %self.conversation_id, generation = self.generation, %message, "stream reported an error");
                                self.finish(StreamEvent::Failed(StreamFailure::Server(message)));
                                return;
                            }
                            Some(Err(err)) => break err,
                            None => break ConnectError::Interrupted,
                        }
                    }
                }
                Err(err) => err,
            };

            let Some(delay) = self.schedule_reconnect(error) else {
                return;
            };
            tokio::time::sleep(delay).await;

            // A disconnect or newer connect during the sleep invalidates this timer.
            if !self.update(|shared| shared.state = StreamState::Connecting, None) {
                return;
            }
        }
    }

    /// Apply `mutate` and emit `event` only while this task's generation is
    /// still current. Returns false once the session has been superseded.
    fn update(
        &self,
        mutate: impl FnOnce(&mut SessionShared),
        event: Option<StreamEvent>,
    ) -> bool {
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation {
            return false;
        }
        mutate(&mut *shared);
        if let Some(event) = event {
            self.emit(event);
        }
        true
    }

    fn finish(&self, event: StreamEvent) {
        self.update(
            |shared| {
                shared.state = StreamState::Closed;
                shared.reconnect_attempt = 0;
            },
            Some(event),
        );
    }

    fn schedule_reconnect(&self, error: ConnectError) -> Option<Duration> {
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation {
            return None;
        }

        if shared.reconnect_attempt < self.policy.max_attempts {
            let delay = self.policy.backoff(shared.reconnect_attempt);
            shared.reconnect_attempt += 1;
            shared.state = StreamState::Reconnecting;
            warn!(
                conversation = %self.conversation_id,
                generation = self.generation,
                attempt = shared.reconnect_attempt,
                delay_ms = delay.as_millis() as u64,
                %error,
                "event stream dropped; scheduling reconnect"
            );
            self.emit(StreamEvent::Reconnecting {
                attempt: shared.reconnect_attempt,
                delay,
                error,
            });
            Some(delay)
        } else {
            shared.state = StreamState::Closed;
            shared.reconnect_attempt = 0;
            warn!(
                conversation = %self.conversation_id,
                generation = self.generation,
                %error,
                "reconnect attempts exhausted"
            );
            self.emit(StreamEvent::Failed(StreamFailure::Exhausted {
                attempts: self.policy.max_attempts,
                last_error: error,
            }));
            None
        }
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events_tx.send(TaggedEvent {
            conversation_id: self.conversation_id,
            generation: self.generation,
            event,
        });
    }
}
