//! Live stream manager.
//!
//! One state machine per named stream: negotiate an existing or new
//! subscription resource, open a channel against it, fold incoming change
//! events into the entity store, and recover from unexpected closes with a
//! fixed-delay reconnect escalating to `Lost` after a timeout. Timer handles
//! are owned per name by the manager; a successful reopen or an explicit
//! close clears them.

use serde_json::from_value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::config::Config;
use crate::events::{EventSender, SyncEvent};
use crate::route;
use crate::session::SessionState;
use crate::store::{EntityStore, MergePolicy, MergeScope};
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelOpener, Method, Transport, TransportRequest,
    TransportResponse,
};
use skein_api::{
    CLIENT_CLOSE_CODE, Cardinality, ChangeEvent, ChangeKind, ConnectStep, StreamDoc, StreamStatus,
    SyncError,
};

/// Per-name stream state. Timers and the reader task are owned here so a
/// close or replacement can cancel everything outstanding.
struct StreamState {
    status: StreamStatus,
    step: Option<ConnectStep>,
    doc: StreamDoc,
    session_id: String,
    handle: Option<Box<dyn ChannelHandle>>,
    reader: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    lost_timer: Option<JoinHandle<()>>,
}

impl StreamState {
    fn new(doc: StreamDoc, session_id: String) -> Self {
        Self {
            status: StreamStatus::Connecting,
            step: Some(ConnectStep::GetStream),
            doc,
            session_id,
            handle: None,
            reader: None,
            retry_timer: None,
            lost_timer: None,
        }
    }

    fn cancel(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.lost_timer.take() {
            timer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

struct StreamInner {
    config: Config,
    transport: Arc<dyn Transport>,
    opener: Arc<dyn ChannelOpener>,
    store: Arc<RwLock<EntityStore>>,
    session: Arc<RwLock<SessionState>>,
    streams: Mutex<HashMap<String, StreamState>>,
    events: EventSender,
}

pub struct StreamManager {
    inner: Arc<StreamInner>,
}

impl StreamManager {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        opener: Arc<dyn ChannelOpener>,
        store: Arc<RwLock<EntityStore>>,
        session: Arc<RwLock<SessionState>>,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                config,
                transport,
                opener,
                store,
                session,
                streams: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Negotiate the stream resource and open its channel.
    ///
    /// An existing server-side stream with the same name is merged with the
    /// desired subscription (and updated remotely when the merge changed
    /// anything); otherwise a new stream resource is created. Failures leave
    /// the stream in `Error`; there is no automatic retry before a channel
    /// has been opened.
    #[tracing::instrument(skip(self, desired, session), fields(name = desired.name.as_deref().unwrap_or("")))]
    pub async fn initialize_stream(
        &self,
        mut desired: StreamDoc,
        session: Option<String>,
    ) -> Result<(), SyncError> {
        let Some(name) = desired.name.clone() else {
            warn!("a stream requires a name");
            return Err(SyncError::MissingStreamName);
        };
        let session_id = match session {
            Some(id) => id,
            None => match self.inner.session.read().await.id() {
                Some(id) => id,
                None => {
                    warn!("no session specified");
                    return Err(SyncError::MissingSession);
                }
            },
        };

        self.replace_state(&name, &desired, &session_id).await;
        self.step(&name, StreamStatus::Connecting, ConnectStep::GetStream)
            .await;

        let inner = &self.inner;
        let lookup = TransportRequest {
            method: Method::Get,
            url: format!(
                "{}/stream?expand=0&this_name={}",
                inner.config.base_url, name
            ),
            headers: vec![("x-session".to_string(), session_id.clone())],
            body: None,
        };
        let response = inner.transport.send(lookup).await;
        if !response.ok {
            return self.fail(&name, remote_error(&response)).await;
        }
        let found: Vec<StreamDoc> = match response.json.map(from_value).transpose() {
            Ok(list) => list.unwrap_or_default(),
            Err(e) => return self.fail(&name, SyncError::malformed(e.to_string())).await,
        };

        if let Some(existing) = found.into_iter().next() {
            if desired.full.is_none() {
                desired.full = Some(true);
            }
            let mut doc = existing;
            let changed = merge_stream_docs(&mut doc, &desired);
            if changed {
                self.step(&name, StreamStatus::Connecting, ConnectStep::UpdateStream)
                    .await;
                let Some(id) = doc.id().map(str::to_string) else {
                    return self
                        .fail(&name, SyncError::malformed("existing stream has no id"))
                        .await;
                };
                let update = TransportRequest {
                    method: Method::Patch,
                    url: format!("{}/stream/{}", inner.config.base_url, id),
                    headers: vec![("x-session".to_string(), session_id.clone())],
                    body: Some(serde_json::to_value(&doc).unwrap_or_default()),
                };
                let response = inner.transport.send(update).await;
                if !response.ok {
                    return self.fail(&name, remote_error(&response)).await;
                }
            }
            start_stream(Arc::clone(inner), name, doc, session_id, false).await;
        } else {
            self.step(&name, StreamStatus::Connecting, ConnectStep::CreateStream)
                .await;
            let create = TransportRequest {
                method: Method::Post,
                url: format!("{}/stream", inner.config.base_url),
                headers: vec![("x-session".to_string(), session_id.clone())],
                body: Some(serde_json::to_value(&desired).unwrap_or_default()),
            };
            let response = inner.transport.send(create).await;
            if !response.ok {
                return self.fail(&name, remote_error(&response)).await;
            }
            let created: StreamDoc = match response.json.map(from_value).transpose() {
                Ok(Some(doc)) => doc,
                Ok(None) => desired,
                Err(e) => return self.fail(&name, SyncError::malformed(e.to_string())).await,
            };
            start_stream(Arc::clone(inner), name, created, session_id, false).await;
        }
        Ok(())
    }

    /// Open a channel for an already-known subscription document, skipping
    /// the negotiation steps. Documents without a server id are addressed by
    /// their subscription encoded as query parameters.
    pub async fn open_stream(
        &self,
        doc: StreamDoc,
        session: Option<String>,
    ) -> Result<(), SyncError> {
        let Some(name) = doc.name.clone() else {
            warn!("a stream requires a name");
            return Err(SyncError::MissingStreamName);
        };
        let session_id = match session {
            Some(id) => id,
            None => match self.inner.session.read().await.id() {
                Some(id) => id,
                None => {
                    warn!("no session specified");
                    return Err(SyncError::MissingSession);
                }
            },
        };
        self.replace_state(&name, &doc, &session_id).await;
        start_stream(Arc::clone(&self.inner), name, doc, session_id, false).await;
        Ok(())
    }

    /// Close a stream for good: cancel timers, close the channel with the
    /// reserved client code and drop all state for the name.
    pub async fn close_stream(&self, name: &str) {
        let state = self.inner.streams.lock().await.remove(name);
        let Some(mut state) = state else {
            return;
        };
        state.cancel();
        if let Some(mut handle) = state.handle.take() {
            handle.close(CLIENT_CLOSE_CODE).await;
        }
        info!(stream = %name, "stream closed by client");
        self.inner.events.emit(SyncEvent::StreamChanged {
            name: name.to_string(),
            status: StreamStatus::Closed,
            step: None,
        });
    }

    pub async fn status(&self, name: &str) -> Option<(StreamStatus, Option<ConnectStep>)> {
        self.inner
            .streams
            .lock()
            .await
            .get(name)
            .map(|state| (state.status, state.step))
    }

    /// The last subscription document negotiated for a stream.
    pub async fn subscription(&self, name: &str) -> Option<StreamDoc> {
        self.inner
            .streams
            .lock()
            .await
            .get(name)
            .map(|state| state.doc.clone())
    }

    async fn replace_state(&self, name: &str, doc: &StreamDoc, session_id: &str) {
        let mut streams = self.inner.streams.lock().await;
        if let Some(mut old) = streams.remove(name) {
            old.cancel();
        }
        streams.insert(
            name.to_string(),
            StreamState::new(doc.clone(), session_id.to_string()),
        );
    }

    async fn step(&self, name: &str, status: StreamStatus, step: ConnectStep) {
        if let Some(state) = self.inner.streams.lock().await.get_mut(name) {
            state.status = status;
            state.step = Some(step);
        }
        self.inner.events.emit(SyncEvent::StreamChanged {
            name: name.to_string(),
            status,
            step: Some(step),
        });
    }

    async fn fail(&self, name: &str, error: SyncError) -> Result<(), SyncError> {
        warn!(stream = %name, error = %error, "stream initialization failed");
        if let Some(state) = self.inner.streams.lock().await.get_mut(name) {
            state.status = StreamStatus::Error;
            state.step = None;
        }
        self.inner.events.emit(SyncEvent::StreamChanged {
            name: name.to_string(),
            status: StreamStatus::Error,
            step: None,
        });
        Err(error)
    }
}

impl StreamInner {
    async fn apply_batch(&self, text: &str) -> Result<(), SyncError> {
        let batch: Vec<ChangeEvent> =
            serde_json::from_str(text).map_err(|e| SyncError::malformed(e.to_string()))?;
        for event in batch {
            self.apply_change(event).await?;
        }
        Ok(())
    }

    async fn apply_change(&self, mut event: ChangeEvent) -> Result<(), SyncError> {
        let ty = event.meta_object.ty.clone();
        let id = event.meta_object.id.clone();
        match event.event {
            ChangeKind::Delete => {
                let ids = vec![id];
                let scope = parent_scope(&event.path);
                self.store.write().await.apply_remove(&ty, Some(&ids), &scope);
            }
            ChangeKind::Create | ChangeKind::Update => {
                let mut body = event
                    .take_body()
                    .ok_or_else(|| SyncError::malformed(format!("{ty} event carries no body")))?;
                let mut store = self.store.write().await;
                hydrate_children(&store, &ty, &id, &mut body);
                // A create for a record we already cache is a plain update;
                // everything else scopes to the parent resolved from the path.
                let scope = if event.event == ChangeKind::Update || store.contains(&ty, &id) {
                    MergeScope::Global
                } else {
                    parent_scope(&event.path)
                };
                store.apply(&ty, &body, &MergePolicy { scope, reset: false })?;
            }
        }
        self.events.emit(SyncEvent::EntitiesChanged { service: ty });
        Ok(())
    }
}

/// Open the channel and wire up its reader.
///
/// Boxed because the reconnect timer calls back into this function.
fn start_stream(
    inner: Arc<StreamInner>,
    name: String,
    doc: StreamDoc,
    session_id: String,
    reconnecting: bool,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let url = channel_url(&inner.config.base_url, &doc, &session_id);
        let status = if reconnecting {
            StreamStatus::Reconnecting
        } else {
            StreamStatus::Connecting
        };
        {
            let mut streams = inner.streams.lock().await;
            let state = streams
                .entry(name.clone())
                .or_insert_with(|| StreamState::new(doc.clone(), session_id.clone()));
            state.status = status;
            state.step = Some(ConnectStep::OpeningSocket);
            state.doc = doc.clone();
        }
        inner.events.emit(SyncEvent::StreamChanged {
            name: name.clone(),
            status,
            step: Some(ConnectStep::OpeningSocket),
        });
        debug!(stream = %name, url = %url, "opening channel");

        let connection = match inner.opener.open(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                // The opener failing outright is handled like an unexpected
                // close: retry after the usual delay.
                warn!(stream = %name, error = %e, "channel open failed");
                schedule_reconnect(&inner, &name, reconnecting).await;
                return;
            }
        };

        let reader = tokio::spawn(reader_loop(
            Arc::clone(&inner),
            name.clone(),
            connection.events,
            reconnecting,
        ));
        let mut streams = inner.streams.lock().await;
        match streams.get_mut(&name) {
            Some(state) => {
                state.handle = Some(connection.handle);
                if let Some(old) = state.reader.replace(reader) {
                    old.abort();
                }
            }
            None => {
                // Closed while we were opening.
                reader.abort();
                let mut handle = connection.handle;
                handle.close(CLIENT_CLOSE_CODE).await;
            }
        }
    })
}

async fn reader_loop(
    inner: Arc<StreamInner>,
    name: String,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut reconnecting: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => {
                if let Some(state) = inner.streams.lock().await.get_mut(&name) {
                    if let Some(timer) = state.retry_timer.take() {
                        timer.abort();
                    }
                    if let Some(timer) = state.lost_timer.take() {
                        timer.abort();
                    }
                    state.status = StreamStatus::Open;
                    state.step = None;
                }
                reconnecting = false;
                info!(stream = %name, "stream open");
                inner.events.emit(SyncEvent::StreamChanged {
                    name: name.clone(),
                    status: StreamStatus::Open,
                    step: None,
                });
            }
            ChannelEvent::Message(text) => {
                if let Err(e) = inner.apply_batch(&text).await {
                    warn!(stream = %name, error = %e, "dropping malformed batch");
                }
            }
            ChannelEvent::Error(message) => {
                warn!(stream = %name, error = %message, "channel error");
            }
            ChannelEvent::Closed { code } => {
                info!(stream = %name, code, "channel closed");
                if code == CLIENT_CLOSE_CODE {
                    let known = {
                        let mut streams = inner.streams.lock().await;
                        match streams.get_mut(&name) {
                            Some(state) => {
                                state.status = StreamStatus::Closed;
                                state.step = None;
                                state.handle = None;
                                true
                            }
                            None => false,
                        }
                    };
                    if known {
                        inner.events.emit(SyncEvent::StreamChanged {
                            name: name.clone(),
                            status: StreamStatus::Closed,
                            step: None,
                        });
                    }
                } else {
                    schedule_reconnect(&inner, &name, reconnecting).await;
                }
                return;
            }
        }
    }
    // Feed dropped without a close frame; recover the same way.
    schedule_reconnect(&inner, &name, reconnecting).await;
}

/// Arm the retry timer, plus the lost timer on the first disconnect since
/// the stream was last open.
async fn schedule_reconnect(inner: &Arc<StreamInner>, name: &str, reconnecting: bool) {
    let mut streams = inner.streams.lock().await;
    let Some(state) = streams.get_mut(name) else {
        return;
    };
    let doc = state.doc.clone();
    let session_id = state.session_id.clone();

    if let Some(timer) = state.retry_timer.take() {
        timer.abort();
    }
    state.retry_timer = Some({
        let inner = Arc::clone(inner);
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.retry_delay).await;
            start_stream(Arc::clone(&inner), name, doc, session_id, true).await;
        })
    });

    if !reconnecting {
        if let Some(timer) = state.lost_timer.take() {
            timer.abort();
        }
        state.lost_timer = Some({
            let inner = Arc::clone(inner);
            let name = name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(inner.config.lost_timeout).await;
                mark_lost(&inner, &name).await;
            })
        });
    }

    state.status = StreamStatus::Reconnecting;
    state.step = Some(ConnectStep::Waiting);
    drop(streams);
    inner.events.emit(SyncEvent::StreamChanged {
        name: name.to_string(),
        status: StreamStatus::Reconnecting,
        step: Some(ConnectStep::Waiting),
    });
}

async fn mark_lost(inner: &Arc<StreamInner>, name: &str) {
    {
        let mut streams = inner.streams.lock().await;
        let Some(state) = streams.get_mut(name) else {
            return;
        };
        if let Some(timer) = state.retry_timer.take() {
            timer.abort();
        }
        // This task is the lost timer; dropping the handle detaches it.
        state.lost_timer = None;
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        state.handle = None;
        state.status = StreamStatus::Lost;
        state.step = None;
    }
    warn!(stream = %name, "stream lost");
    inner.events.emit(SyncEvent::StreamChanged {
        name: name.to_string(),
        status: StreamStatus::Lost,
        step: None,
    });
}

/// Merge a desired subscription into an existing document: set union on the
/// subscription and ignore lists (existing order kept, new entries appended)
/// and last-write-wins on `full`. Returns whether anything changed.
fn merge_stream_docs(existing: &mut StreamDoc, desired: &StreamDoc) -> bool {
    let mut changed = false;
    for entry in &desired.subscription {
        if !existing.subscription.contains(entry) {
            existing.subscription.push(entry.clone());
            changed = true;
        }
    }
    for entry in &desired.ignore {
        if !existing.ignore.contains(entry) {
            existing.ignore.push(entry.clone());
            changed = true;
        }
    }
    if desired.full.is_some() && existing.full != desired.full {
        existing.full = desired.full;
        changed = true;
    }
    changed
}

/// Channel URL: by stream id when known, else the subscription document as
/// query parameters (first open only).
fn channel_url(base: &str, doc: &StreamDoc, session: &str) -> String {
    match doc.id() {
        Some(id) => format!("{base}/stream/{id}?x-session={session}"),
        None => {
            let mut query = form_urlencoded::Serializer::new(String::new());
            if let Some(name) = &doc.name {
                query.append_pair("name", name);
            }
            for entry in &doc.subscription {
                query.append_pair("subscription", entry);
            }
            for entry in &doc.ignore {
                query.append_pair("ignore", entry);
            }
            if let Some(full) = doc.full {
                query.append_pair("full", if full { "true" } else { "false" });
            }
            format!("{base}/stream/?x-session={session}&{}", query.finish())
        }
    }
}

/// Child fields are never trusted from the wire: refill them from the cache,
/// defaulting to an empty list ("many") or absence ("one").
fn hydrate_children(store: &EntityStore, ty: &str, id: &str, body: &mut serde_json::Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let Some(descriptor) = store.registry().descriptor(ty) else {
        return;
    };
    for relation in descriptor.dependencies.clone() {
        match store.child_field(ty, id, &relation.key) {
            Some(cached) => {
                obj.insert(relation.key.clone(), cached);
            }
            None => match relation.cardinality {
                Cardinality::Many => {
                    obj.insert(relation.key.clone(), serde_json::Value::Array(Vec::new()));
                }
                Cardinality::One => {
                    obj.remove(&relation.key);
                }
            },
        }
    }
}

fn parent_scope(path: &str) -> MergeScope {
    route::url_info(path, 1)
        .and_then(|info| info.parent)
        .map(|parent| MergeScope::Parent {
            ty: parent.ty,
            id: parent.id,
        })
        .unwrap_or(MergeScope::Global)
}

fn remote_error(response: &TransportResponse) -> SyncError {
    SyncError::Remote {
        status: response.status,
        code: response.error_code(),
        message: response
            .json
            .as_ref()
            .map(|j| j.to_string())
            .unwrap_or_else(|| "stream request failed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChannelOpener, FakeTransport};
    use serde_json::json;
    use skein_api::SchemaRegistry;
    use std::time::Duration;

    struct Harness {
        manager: StreamManager,
        transport: Arc<FakeTransport>,
        opener: Arc<FakeChannelOpener>,
        store: Arc<RwLock<EntityStore>>,
    }

    fn harness(opener: FakeChannelOpener) -> Harness {
        let transport = Arc::new(FakeTransport::new());
        let opener = Arc::new(opener);
        let store = Arc::new(RwLock::new(EntityStore::new(Arc::new(
            SchemaRegistry::device_tree(),
        ))));
        let session = Arc::new(RwLock::new(SessionState::default()));
        let manager = StreamManager::new(
            Config::new("http://api.test"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&opener) as Arc<dyn ChannelOpener>,
            Arc::clone(&store),
            session,
            EventSender::default(),
        );
        Harness {
            manager,
            transport,
            opener,
            store,
        }
    }

    fn existing_stream() -> serde_json::Value {
        json!([{
            "meta": { "id": "st1" },
            "name": "updates",
            "subscription": ["a", "b"],
            "ignore": [],
            "full": true
        }])
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn merge_unions_lists_and_overrides_full() {
        let mut existing: StreamDoc = serde_json::from_value(existing_stream()[0].clone()).unwrap();
        let desired = StreamDoc {
            name: Some("updates".to_string()),
            subscription: vec!["b".to_string(), "c".to_string()],
            ignore: vec!["x".to_string()],
            full: Some(false),
            ..StreamDoc::default()
        };

        assert!(merge_stream_docs(&mut existing, &desired));
        assert_eq!(existing.subscription, vec!["a", "b", "c"]);
        assert_eq!(existing.ignore, vec!["x"]);
        assert_eq!(existing.full, Some(false));

        // Identical documents trigger no update.
        let unchanged = existing.clone();
        assert!(!merge_stream_docs(&mut existing, &unchanged));
    }

    #[test]
    fn channel_url_prefers_the_stream_id() {
        let doc: StreamDoc = serde_json::from_value(existing_stream()[0].clone()).unwrap();
        assert_eq!(
            channel_url("http://api.test", &doc, "s1"),
            "http://api.test/stream/st1?x-session=s1"
        );

        let fresh = StreamDoc {
            name: Some("updates".to_string()),
            subscription: vec!["a".to_string()],
            full: Some(true),
            ..StreamDoc::default()
        };
        assert_eq!(
            channel_url("http://api.test", &fresh, "s1"),
            "http://api.test/stream/?x-session=s1&name=updates&subscription=a&full=true"
        );
    }

    #[tokio::test]
    async fn initialize_requires_a_session_and_a_name() {
        let h = harness(FakeChannelOpener::new());

        let err = h
            .manager
            .initialize_stream(StreamDoc::default(), Some("s1".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingStreamName));

        let err = h
            .manager
            .initialize_stream(StreamDoc::named("updates"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingSession));
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_merges_and_updates_an_existing_stream() {
        let h = harness(FakeChannelOpener::new());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());
        h.transport
            .respond_json(Method::Patch, "/stream/st1", json!({}));

        let desired = StreamDoc {
            name: Some("updates".to_string()),
            subscription: vec!["b".to_string(), "c".to_string()],
            ignore: vec!["x".to_string()],
            full: Some(true),
            ..StreamDoc::default()
        };
        h.manager
            .initialize_stream(desired, Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].url.contains("this_name=updates"));
        let patched = requests[1].body.as_ref().unwrap();
        assert_eq!(patched["subscription"], json!(["a", "b", "c"]));
        assert_eq!(patched["full"], json!(true));

        assert_eq!(h.opener.urls()[0], "http://api.test/stream/st1?x-session=s1");
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Open, None))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_skips_the_update_when_nothing_changed() {
        let h = harness(FakeChannelOpener::new());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());

        let desired = StreamDoc {
            name: Some("updates".to_string()),
            subscription: vec!["a".to_string()],
            full: Some(true),
            ..StreamDoc::default()
        };
        h.manager
            .initialize_stream(desired, Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.transport.requests().len(), 1);
        assert_eq!(h.opener.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_creates_a_missing_stream() {
        let h = harness(FakeChannelOpener::new());
        h.transport.respond_json(Method::Get, "/stream", json!([]));
        h.transport.respond_json(
            Method::Post,
            "/stream",
            json!({ "meta": { "id": "st9" }, "name": "updates", "subscription": ["a"] }),
        );

        let desired = StreamDoc {
            name: Some("updates".to_string()),
            subscription: vec!["a".to_string()],
            ..StreamDoc::default()
        };
        h.manager
            .initialize_stream(desired, Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        let requests = h.transport.requests();
        assert_eq!(requests[1].method, Method::Post);
        assert_eq!(h.opener.urls()[0], "http://api.test/stream/st9?x-session=s1");
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_failure_leaves_the_stream_in_error() {
        let h = harness(FakeChannelOpener::new());
        h.transport
            .respond_error(Method::Get, "/stream", 500, json!({ "message": "boom" }));

        let err = h
            .manager
            .initialize_stream(StreamDoc::named("updates"), Some("s1".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Remote { status: 500, .. }));
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Error, None))
        );
        assert_eq!(h.opener.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_stream_without_an_id_encodes_the_subscription() {
        let h = harness(FakeChannelOpener::new());
        let doc = StreamDoc {
            name: Some("updates".to_string()),
            subscription: vec!["a".to_string(), "b".to_string()],
            full: Some(true),
            ..StreamDoc::default()
        };
        h.manager
            .open_stream(doc, Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            h.opener.urls()[0],
            "http://api.test/stream/?x-session=s1&name=updates&subscription=a&subscription=b&full=true"
        );
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_the_retry_delay_and_escalates_to_lost() {
        let h = harness(FakeChannelOpener::without_auto_open());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());
        h.manager
            .initialize_stream(StreamDoc::named("updates"), Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.opener.open_count(), 1);

        h.opener.sender(0).send(ChannelEvent::Open).await.unwrap();
        settle().await;
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Open, None))
        );

        // Unexpected close: waiting for the retry.
        h.opener
            .sender(0)
            .send(ChannelEvent::Closed { code: 1006 })
            .await
            .unwrap();
        settle().await;
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Reconnecting, Some(ConnectStep::Waiting)))
        );
        assert_eq!(h.opener.open_count(), 1);

        // Retry fires once after the delay.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.opener.open_count(), 2);

        // The reopened channel never opens; the lost timeout trips.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Lost, None))
        );

        // All timers are cleared: nothing else reconnects.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.opener.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_clears_the_lost_timer() {
        let h = harness(FakeChannelOpener::without_auto_open());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());
        h.manager
            .initialize_stream(StreamDoc::named("updates"), Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;
        h.opener.sender(0).send(ChannelEvent::Open).await.unwrap();
        settle().await;

        h.opener
            .sender(0)
            .send(ChannelEvent::Closed { code: 1006 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.opener.open_count(), 2);

        // Reconnect succeeds; the lost timer must not fire later.
        h.opener.sender(1).send(ChannelEvent::Open).await.unwrap();
        settle().await;
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Open, None))
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Open, None))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_never_reconnects() {
        let h = harness(FakeChannelOpener::new());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());
        h.manager
            .initialize_stream(StreamDoc::named("updates"), Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        h.opener
            .sender(0)
            .send(ChannelEvent::Closed {
                code: CLIENT_CLOSE_CODE,
            })
            .await
            .unwrap();
        settle().await;
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Closed, None))
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.opener.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stream_drops_all_state() {
        let h = harness(FakeChannelOpener::new());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());
        h.manager
            .initialize_stream(StreamDoc::named("updates"), Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        h.manager.close_stream("updates").await;
        assert_eq!(h.manager.status("updates").await, None);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.opener.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events_hydrate_children_from_the_cache() {
        let h = harness(FakeChannelOpener::new());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());
        h.manager
            .initialize_stream(StreamDoc::named("updates"), Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        {
            let mut store = h.store.write().await;
            store
                .merge_one(
                    "device",
                    &json!({ "meta": { "id": "d1" }, "value": [{ "meta": { "id": "v1" } }] }),
                )
                .unwrap();
        }

        // Update for a cached device: the wire body has no child list, the
        // cached one survives.
        let batch = json!([{
            "event": "update",
            "meta_object": { "type": "device", "id": "d1" },
            "path": "/2.0/network/n1/device/d1",
            "device": { "meta": { "id": "d1" }, "label": "renamed" }
        }]);
        h.opener
            .sender(0)
            .send(ChannelEvent::Message(batch.to_string()))
            .await
            .unwrap();
        settle().await;
        {
            let store = h.store.read().await;
            let device = store.get("device", "d1").unwrap();
            assert_eq!(device["label"], "renamed");
            assert_eq!(device["value"], json!(["v1"]));
        }

        // Create for an unknown device: declared children default to empty.
        let batch = json!([{
            "event": "create",
            "meta_object": { "type": "device", "id": "d2" },
            "path": "/2.0/network/n1/device/d2",
            "device": { "meta": { "id": "d2" }, "label": "fresh" }
        }]);
        h.opener
            .sender(0)
            .send(ChannelEvent::Message(batch.to_string()))
            .await
            .unwrap();
        settle().await;
        {
            let store = h.store.read().await;
            let device = store.get("device", "d2").unwrap();
            assert_eq!(device["value"], json!([]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_events_link_into_the_parent() {
        let h = harness(FakeChannelOpener::new());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());
        h.manager
            .initialize_stream(StreamDoc::named("updates"), Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        {
            let mut store = h.store.write().await;
            store
                .merge_one("network", &json!({ "meta": { "id": "n1" }, "device": [] }))
                .unwrap();
        }

        let batch = json!([{
            "event": "create",
            "meta_object": { "type": "device", "id": "d1" },
            "path": "/2.0/network/n1/device/d1",
            "device": { "meta": { "id": "d1" } }
        }]);
        h.opener
            .sender(0)
            .send(ChannelEvent::Message(batch.to_string()))
            .await
            .unwrap();
        settle().await;

        {
            let store = h.store.read().await;
            assert!(store.contains("device", "d1"));
            assert_eq!(store.get("network", "n1").unwrap()["device"], json!(["d1"]));
        }

        // Delete folds back out, scoped to the same parent.
        let batch = json!([{
            "event": "delete",
            "meta_object": { "type": "device", "id": "d1" },
            "path": "/2.0/network/n1/device/d1"
        }]);
        h.opener
            .sender(0)
            .send(ChannelEvent::Message(batch.to_string()))
            .await
            .unwrap();
        settle().await;
        {
            let store = h.store.read().await;
            assert!(!store.contains("device", "d1"));
            assert_eq!(store.get("network", "n1").unwrap()["device"], json!([]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_batches_do_not_kill_the_channel() {
        let h = harness(FakeChannelOpener::new());
        h.transport
            .respond_json(Method::Get, "/stream", existing_stream());
        h.manager
            .initialize_stream(StreamDoc::named("updates"), Some("s1".to_string()))
            .await
            .unwrap();
        settle().await;

        h.opener
            .sender(0)
            .send(ChannelEvent::Message("not json".to_string()))
            .await
            .unwrap();
        settle().await;
        assert_eq!(
            h.manager.status("updates").await,
            Some((StreamStatus::Open, None))
        );

        let batch = json!([{
            "event": "update",
            "meta_object": { "type": "network", "id": "n1" },
            "path": "/2.0/network/n1",
            "network": { "meta": { "id": "n1" }, "label": "still alive" }
        }]);
        h.opener
            .sender(0)
            .send(ChannelEvent::Message(batch.to_string()))
            .await
            .unwrap();
        settle().await;
        assert!(h.store.read().await.contains("network", "n1"));
    }
}
