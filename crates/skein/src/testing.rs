//! In-memory fakes for the transport seams.
//!
//! `FakeTransport` answers requests from scripted queues and records every
//! request it sees; `FakeChannelOpener` hands out channels whose event feed
//! the test drives directly. Both are ordinary implementations of the
//! transport traits, usable for offline operation as much as for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::transport::{
    ChannelConnection, ChannelEvent, ChannelHandle, ChannelOpener, Method, Transport,
    TransportRequest, TransportResponse,
};
use skein_api::SyncError;

/// Scripted request/response transport.
pub struct FakeTransport {
    responses: Mutex<HashMap<(Method, String), VecDeque<TransportResponse>>>,
    requests: Mutex<Vec<TransportRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
        }
    }

    /// Queue a successful JSON response for `method` + url path.
    pub fn respond_json(&self, method: Method, path: &str, json: Value) {
        self.push(
            method,
            path,
            TransportResponse {
                ok: true,
                status: 200,
                json: Some(json),
            },
        );
    }

    /// Queue an error response.
    pub fn respond_error(&self, method: Method, path: &str, status: u16, json: Value) {
        self.push(
            method,
            path,
            TransportResponse {
                ok: false,
                status,
                json: Some(json),
            },
        );
    }

    /// Delay every response; combine with a paused-clock test runtime.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn push(&self, method: Method, path: &str, response: TransportResponse) {
        self.responses
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    fn pop(&self, method: Method, url: &str) -> Option<TransportResponse> {
        let mut responses = self.responses.lock().unwrap();
        let key = responses
            .keys()
            .find(|(m, path)| {
                *m == method && {
                    // Scripted paths match ignoring base url and query string.
                    let request_path = url.split('?').next().unwrap_or(url);
                    request_path.ends_with(path.as_str())
                }
            })
            .cloned()?;
        let queue = responses.get_mut(&key)?;
        let response = queue.pop_front();
        if queue.is_empty() {
            responses.remove(&key);
        }
        response
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: TransportRequest) -> TransportResponse {
        let latency = *self.latency.lock().unwrap();
        let method = request.method;
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let response = self.pop(method, &url);
        response.unwrap_or(TransportResponse {
            ok: false,
            status: 404,
            json: None,
        })
    }
}

struct OpenerState {
    senders: Vec<mpsc::Sender<ChannelEvent>>,
    urls: Vec<String>,
    auto_open: bool,
}

/// Channel opener whose connections are driven by the test.
///
/// Each `open` yields a channel; with `auto_open` (the default) the channel
/// immediately reports `Open`. The matching sender is kept so the test can
/// inject messages, errors and closes.
pub struct FakeChannelOpener {
    state: Mutex<OpenerState>,
}

impl FakeChannelOpener {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OpenerState {
                senders: Vec::new(),
                urls: Vec::new(),
                auto_open: true,
            }),
        }
    }

    /// Opened channels never report `Open` on their own.
    pub fn without_auto_open() -> Self {
        let opener = Self::new();
        opener.state.lock().unwrap().auto_open = false;
        opener
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().senders.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.lock().unwrap().urls.clone()
    }

    /// Event sender of the `index`-th opened channel.
    pub fn sender(&self, index: usize) -> mpsc::Sender<ChannelEvent> {
        self.state.lock().unwrap().senders[index].clone()
    }
}

impl Default for FakeChannelOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelOpener for FakeChannelOpener {
    async fn open(&self, url: &str) -> Result<ChannelConnection, SyncError> {
        let (tx, events) = mpsc::channel(64);
        let auto_open = {
            let mut state = self.state.lock().unwrap();
            state.urls.push(url.to_string());
            state.senders.push(tx.clone());
            state.auto_open
        };
        if auto_open {
            let _ = tx.try_send(ChannelEvent::Open);
        }
        Ok(ChannelConnection {
            handle: Box::new(FakeHandle { tx }),
            events,
        })
    }
}

/// Closing a fake channel surfaces the close on its own event feed, the way
/// a live socket acknowledges a client close.
struct FakeHandle {
    tx: mpsc::Sender<ChannelEvent>,
}

#[async_trait]
impl ChannelHandle for FakeHandle {
    async fn close(&mut self, code: u16) {
        let _ = self.tx.send(ChannelEvent::Closed { code }).await;
    }
}
