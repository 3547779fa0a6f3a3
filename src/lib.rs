//! Uru is the streaming chat session layer of a conversational client: an
//! encrypted local store for the provider API key, a reconnecting
//! event-stream client, and a conversation state machine that reconciles
//! optimistic local edits with server-streamed deltas.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core::vault`] derives a per-user, per-device key and keeps the API key
//!   encrypted in an injected storage backend.
//! - [`core::stream`] decodes the chat service's event stream and owns the
//!   connect/reconnect/disconnect lifecycle of one connection per conversation.
//! - [`core::conversation`] holds a conversation's messages and applies
//!   user messages and assistant deltas.
//! - [`core::session`] composes the above behind `send_message` and
//!   `stop_generation`.
//! - [`api`] defines the payloads and HTTP client for the chat service.
//!
//! The `uru` binary routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
