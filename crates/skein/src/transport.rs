//! Transport seams: one-shot HTTP requests and streaming channels.
//!
//! The engine never talks to the network directly; it goes through the
//! [`Transport`] and [`ChannelOpener`] traits. Default implementations are
//! provided (`reqwest` for requests, `tokio-tungstenite` for channels), and
//! the fakes in [`crate::testing`] implement the same traits in memory.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::{CloseFrame, coding::CloseCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use skein_api::SyncError;

/// Request verb, normalized to uppercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Parse a verb case-insensitively; anything else is a local failure.
    pub fn parse(method: &str) -> Result<Self, SyncError> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(SyncError::InvalidMethod {
                method: method.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the verb carries a serialized body.
    pub fn has_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully prepared one-shot request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_session(mut self, session: &str) -> Self {
        self.headers
            .push(("x-session".to_string(), session.to_string()));
        self
    }
}

/// Outcome of a one-shot request.
///
/// Connection-level failures are folded into `ok = false` with status `0`,
/// so callers handle exactly one shape.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub ok: bool,
    pub status: u16,
    pub json: Option<Value>,
}

impl TransportResponse {
    /// The error code carried by an error payload, if any.
    pub fn error_code(&self) -> Option<i64> {
        self.json.as_ref()?.get("code")?.as_i64()
    }
}

/// One-shot request/response transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> TransportResponse;
}

/// Event observed on an open channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Error(String),
    Closed { code: u16 },
}

/// Handle for closing an open channel.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    async fn close(&mut self, code: u16);
}

/// An opened channel: a close handle plus its event feed.
pub struct ChannelConnection {
    pub handle: Box<dyn ChannelHandle>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Factory for live channels.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, url: &str) -> Result<ChannelConnection, SyncError>;
}

/// Default HTTP transport backed by `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(request_timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> TransportResponse {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Patch => self.client.patch(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let ok = response.status().is_success();
                let json = response.json::<Value>().await.ok();
                TransportResponse { ok, status, json }
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "request transport failure");
                let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                TransportResponse {
                    ok: false,
                    status,
                    json: None,
                }
            }
        }
    }
}

/// Default channel opener backed by `tokio-tungstenite`.
///
/// The socket is owned by a background task; the handle forwards close
/// requests into it, and all socket activity is surfaced as [`ChannelEvent`]s.
pub struct WsChannelOpener;

#[async_trait]
impl ChannelOpener for WsChannelOpener {
    async fn open(&self, url: &str) -> Result<ChannelConnection, SyncError> {
        let url = ws_url(url);
        let (events_tx, events) = mpsc::channel(256);
        let (close_tx, mut close_rx) = mpsc::channel::<u16>(1);

        tokio::spawn(async move {
            let (ws, _) = match connect_async(&url).await {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = events_tx.send(ChannelEvent::Error(e.to_string())).await;
                    let _ = events_tx.send(ChannelEvent::Closed { code: 1006 }).await;
                    return;
                }
            };
            debug!(url = %url, "channel connected");
            let _ = events_tx.send(ChannelEvent::Open).await;
            let (mut sink, mut source) = ws.split();

            loop {
                tokio::select! {
                    message = source.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            let _ = events_tx.send(ChannelEvent::Message(text.to_string())).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                            let _ = events_tx.send(ChannelEvent::Closed { code }).await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = events_tx.send(ChannelEvent::Error(e.to_string())).await;
                            let _ = events_tx.send(ChannelEvent::Closed { code: 1006 }).await;
                            break;
                        }
                        None => {
                            let _ = events_tx.send(ChannelEvent::Closed { code: 1006 }).await;
                            break;
                        }
                    },
                    code = close_rx.recv() => {
                        let code = code.unwrap_or(skein_api::CLIENT_CLOSE_CODE);
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "client close".into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        let _ = events_tx.send(ChannelEvent::Closed { code }).await;
                        break;
                    }
                }
            }
        });

        Ok(ChannelConnection {
            handle: Box::new(WsHandle { close_tx }),
            events,
        })
    }
}

struct WsHandle {
    close_tx: mpsc::Sender<u16>,
}

#[async_trait]
impl ChannelHandle for WsHandle {
    async fn close(&mut self, code: u16) {
        let _ = self.close_tx.send(code).await;
    }
}

/// Rewrite an http(s) base into the matching ws(s) scheme.
fn ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!(Method::parse("get").unwrap(), Method::Get);
        assert_eq!(Method::parse("PaTcH").unwrap(), Method::Patch);
        assert!(matches!(
            Method::parse("FETCH"),
            Err(SyncError::InvalidMethod { .. })
        ));
        assert!(Method::Put.has_body());
        assert!(!Method::Delete.has_body());
    }

    #[test]
    fn ws_url_rewrites_scheme() {
        assert_eq!(ws_url("http://host/stream/1"), "ws://host/stream/1");
        assert_eq!(ws_url("https://host/stream/1"), "wss://host/stream/1");
        assert_eq!(ws_url("ws://host/stream/1"), "ws://host/stream/1");
    }

    #[test]
    fn error_code_reads_payload() {
        let response = TransportResponse {
            ok: false,
            status: 401,
            json: Some(serde_json::json!({ "code": 9900025 })),
        };
        assert_eq!(response.error_code(), Some(9_900_025));
    }
}
