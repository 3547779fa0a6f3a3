//! Response streaming: event-stream decoding, the connection seam and the
//! reconnecting client built on top of it.

pub mod client;
pub mod connector;
pub mod sse;

pub use client::{
    ReconnectPolicy, StreamEvent, StreamFailure, StreamState, StreamingClient, TaggedEvent,
};
pub use connector::{ConnectError, FrameStream, HttpStreamConnector, StreamConnector};
pub use sse::{SseDecoder, SseEvent, StreamFrame};
