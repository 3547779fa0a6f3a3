use std::collections::VecDeque;
use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tracing::debug;

use super::sse::{SseDecoder, StreamFrame};
use crate::api::client::summarize_error_body;

/// A transient failure opening or reading an event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectError {
    /// The connection could not be established or broke mid-stream.
    Transport(String),
    /// The server answered the stream request with a non-success status.
    Status { status: u16, message: String },
    /// The stream closed before a terminal frame arrived.
    Interrupted,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Transport(message) => write!(f, "connection failed: {message}"),
            ConnectError::Status { status, message } => {
                write!(f, "stream request returned {status}: {message}")
            }
            ConnectError::Interrupted => write!(f, "stream closed before completion"),
        }
    }
}

impl Error for ConnectError {}

/// Frames produced by one open connection. Dropping it releases the
/// connection.
pub type FrameStream = BoxStream<'static, Result<StreamFrame, ConnectError>>;

/// Opens event-stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<FrameStream, ConnectError>;
}

/// `GET <url>` with `Accept: text/event-stream` over reqwest.
#[derive(Clone)]
pub struct HttpStreamConnector {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpStreamConnector {
    pub fn new(client: reqwest::Client, auth_token: Option<String>) -> Self {
        Self { client, auth_token }
    }
}

struct BodyState {
    body: BoxStream<'static, Result<Vec<u8>, String>>,
    decoder: SseDecoder,
    pending: VecDeque<StreamFrame>,
    finished: bool,
}

impl BodyState {
    fn queue(&mut self, events: impl IntoIterator<Item = super::sse::SseEvent>) {
        self.pending
            .extend(events.into_iter().filter_map(|event| StreamFrame::from_event(&event)));
    }
}

#[async_trait]
impl StreamConnector for HttpStreamConnector {
    async fn open(&self, url: &str) -> Result<FrameStream, ConnectError> {
        let mut request = self
            .client
            .get(url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ConnectError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(ConnectError::Status {
                status,
                message: summarize_error_body(&body),
            });
        }
        debug!(url, "event stream opened");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(|err| err.to_string()))
            .boxed();
        let state = BodyState {
            body,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        let frames = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(frame) = state.pending.pop_front() {
                    return Some((Ok(frame), state));
                }
                if state.finished {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(chunk)) => {
                        let events = state.decoder.push(&chunk);
                        state.queue(events);
                    }
                    Some(Err(message)) => {
                        state.finished = true;
                        return Some((Err(ConnectError::Transport(message)), state));
                    }
                    None => {
                        let trailing = state.decoder.finish();
                        state.queue(trailing);
                        state.finished = true;
                    }
                }
            }
        });

        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = vec![0_u8; 4096];
            let _ = socket.read(&mut request).await;
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/chat/stream?conversationId=1")
    }

    fn no_proxy_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().expect("client")
    }

    #[tokio::test]
    async fn http_connector_decodes_event_stream_body() {
        let body = "event: message\ndata: Connection established\n\n\
                    event: message\ndata: {\"content\":\"Hel\"}\n\n\
                    event: message\ndata: {\"content\":\"lo\"}\n\n\
                    event: complete\ndata: Stream completed\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let url = serve_once(response).await;

        let connector = HttpStreamConnector::new(no_proxy_client(), None);
        let frames: Vec<_> = connector
            .open(&url)
            .await
            .expect("open")
            .collect()
            .await;

        assert_eq!(
            frames,
            vec![
                Ok(StreamFrame::Delta("Hel".into())),
                Ok(StreamFrame::Delta("lo".into())),
                Ok(StreamFrame::Complete),
            ]
        );
    }

    #[tokio::test]
    async fn http_connector_reports_status_errors() {
        let body = r#"{"detail":"Conversation not found"}"#;
        let response = format!(
            "HTTP/1.1 404 Not Found\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let url = serve_once(response).await;

        let connector = HttpStreamConnector::new(no_proxy_client(), None);
        let err = match connector.open(&url).await {
            Ok(_) => panic!("expected status error"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            ConnectError::Status {
                status: 404,
                message: "Conversation not found".into()
            }
        );
    }

    #[tokio::test]
    async fn http_connector_fails_fast_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let connector = HttpStreamConnector::new(no_proxy_client(), None);
        let result = connector.open(&format!("http://{addr}/chat/stream")).await;
        assert!(matches!(result, Err(ConnectError::Transport(_))));
    }
}
