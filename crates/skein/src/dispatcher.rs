//! Request dispatcher: maps verb + URL onto cache mutations.
//!
//! One URL may have at most one outstanding request; the guard is checked
//! and marked under a single lock acquisition, so no interleaving can slip
//! between the check and the mark. Successful responses are folded into the
//! entity store (or the session record); error payloads carrying the
//! invalid-session code force re-authentication as a side effect.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::config::Config;
use crate::events::{EventSender, SyncEvent};
use crate::route::{self, Route};
use crate::session::SessionState;
use crate::store::{value_to_id, EntityStore, MergePolicy, MergeScope};
use crate::transport::{Method, Transport, TransportRequest, TransportResponse};
use skein_api::{INVALID_SESSION_CODE, SyncError};

/// Phase of a tracked request. Only `Pending` blocks a new submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Pending,
    Done,
}

/// Per-request options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Extra headers; a caller-supplied `x-session` suppresses the default.
    pub headers: Vec<(String, String)>,
    /// Extra query parameters appended to the request URL.
    pub query: Vec<(String, String)>,
    /// Reset behavior for GET merges; other verbs always merge
    /// non-destructively.
    pub reset: Option<bool>,
}

pub struct Dispatcher {
    config: Config,
    transport: Arc<dyn Transport>,
    store: Arc<RwLock<EntityStore>>,
    session: Arc<RwLock<SessionState>>,
    pending: Mutex<HashMap<String, RequestPhase>>,
    events: EventSender,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<RwLock<EntityStore>>,
        session: Arc<RwLock<SessionState>>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            session,
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Issue a request and fold its response into the cache.
    #[tracing::instrument(skip(self, body, options), fields(url = %url))]
    pub async fn submit(
        &self,
        method: &str,
        url: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<TransportResponse, SyncError> {
        let method = Method::parse(method)?;

        {
            let mut pending = self.pending.lock().await;
            if matches!(pending.get(url), Some(RequestPhase::Pending)) {
                warn!("a request to this url is already pending");
                return Err(SyncError::DuplicateRequest {
                    url: url.to_string(),
                });
            }
            pending.insert(url.to_string(), RequestPhase::Pending);
        }

        let request = self.build_request(method, url, body, &options).await;
        let response = self.transport.send(request).await;
        self.pending
            .lock()
            .await
            .insert(url.to_string(), RequestPhase::Done);

        if response.ok {
            self.apply_success(method, url, response.json.as_ref(), &options)
                .await?;
            self.events.emit(SyncEvent::RequestSucceeded {
                method,
                url: url.to_string(),
                status: response.status,
            });
            Ok(response)
        } else {
            let code = response.error_code();
            if code == Some(INVALID_SESSION_CODE) {
                self.session.write().await.invalidate();
                self.events.emit(SyncEvent::SessionInvalidated);
            }
            self.events.emit(SyncEvent::RequestFailed {
                method,
                url: url.to_string(),
                status: response.status,
                code,
            });
            Err(SyncError::Remote {
                status: response.status,
                code,
                message: response
                    .json
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "request failed".to_string()),
            })
        }
    }

    /// Whether a request to `url` is currently in flight.
    pub async fn is_pending(&self, url: &str) -> bool {
        matches!(
            self.pending.lock().await.get(url),
            Some(RequestPhase::Pending)
        )
    }

    async fn build_request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> TransportRequest {
        let mut headers = options.headers.clone();
        let has_session_header = headers
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case("x-session"));
        if !has_session_header {
            if let Some(id) = self.session.read().await.id() {
                headers.push(("x-session".to_string(), id));
            }
        }

        let mut full_url = format!("{}{}", self.config.base_url, url);
        if !options.query.is_empty() {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (key, value) in &options.query {
                serializer.append_pair(key, value);
            }
            full_url.push(if full_url.contains('?') { '&' } else { '?' });
            full_url.push_str(&serializer.finish());
        }

        TransportRequest {
            method,
            url: full_url,
            headers,
            body: if method.has_body() { body } else { None },
        }
    }

    async fn apply_success(
        &self,
        method: Method,
        url: &str,
        json: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<(), SyncError> {
        let Some(route) = route::classify(url) else {
            warn!("response url carries no route; nothing applied");
            return Ok(());
        };

        match route {
            Route::Session => {
                let mut session = self.session.write().await;
                if method == Method::Delete {
                    session.clear();
                    self.events.emit(SyncEvent::SessionCleared);
                } else if let Some(json) = json {
                    session.establish(json.clone());
                    self.events.emit(SyncEvent::SessionEstablished);
                }
            }
            Route::Entity(info) => {
                let scope = info
                    .parent
                    .map(|p| MergeScope::Parent { ty: p.ty, id: p.id })
                    .unwrap_or(MergeScope::Global);

                match method {
                    Method::Get | Method::Post | Method::Put | Method::Patch => {
                        let Some(json) = json else {
                            debug!("empty response body; nothing to merge");
                            return Ok(());
                        };
                        let reset = method == Method::Get && options.reset.unwrap_or(false);
                        let policy = MergePolicy { scope, reset };
                        self.store
                            .write()
                            .await
                            .apply(&info.service, json, &policy)?;
                        self.events.emit(SyncEvent::EntitiesChanged {
                            service: info.service,
                        });
                    }
                    Method::Delete => {
                        // Ids come back as strings or numbers; both resolve
                        // the same way merges key them.
                        let deleted: Vec<String> = json
                            .and_then(|j| j.get("deleted"))
                            .and_then(Value::as_array)
                            .map(|ids| ids.iter().filter_map(value_to_id).collect())
                            .unwrap_or_default();
                        self.store
                            .write()
                            .await
                            .apply_remove(&info.service, Some(&deleted), &scope);
                        self.events.emit(SyncEvent::EntitiesChanged {
                            service: info.service,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
