//! The engine facade: one object wiring the store, session, dispatcher and
//! stream manager onto shared transports.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, RequestOptions};
use crate::events::{EventSender, SyncEvent};
use crate::session::SessionState;
use crate::store::EntityStore;
use crate::stream::StreamManager;
use crate::transport::{ChannelOpener, HttpTransport, Transport, TransportResponse, WsChannelOpener};
use skein_api::{ConnectStep, SchemaRegistry, StreamDoc, StreamStatus, SyncError};

/// Entity synchronization engine.
///
/// Owns the normalized cache and the session record; requests and live
/// stream events both fold into the same store. All state transitions are
/// observable through [`SyncEngine::subscribe`].
pub struct SyncEngine {
    store: Arc<RwLock<EntityStore>>,
    session: Arc<RwLock<SessionState>>,
    dispatcher: Dispatcher,
    streams: StreamManager,
    events: EventSender,
}

impl SyncEngine {
    /// Build an engine on explicit transports. Tests plug the in-memory
    /// fakes in here.
    pub fn new(
        config: Config,
        registry: SchemaRegistry,
        transport: Arc<dyn Transport>,
        opener: Arc<dyn ChannelOpener>,
    ) -> Self {
        let registry = Arc::new(registry);
        let store = Arc::new(RwLock::new(EntityStore::new(registry)));
        let session = Arc::new(RwLock::new(SessionState::default()));
        let events = EventSender::default();

        let dispatcher = Dispatcher::new(
            config.clone(),
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&session),
            events.clone(),
        );
        let streams = StreamManager::new(
            config,
            transport,
            opener,
            Arc::clone(&store),
            Arc::clone(&session),
            events.clone(),
        );

        Self {
            store,
            session,
            dispatcher,
            streams,
            events,
        }
    }

    /// Build an engine on the default live transports: `reqwest` for
    /// requests and a websocket channel for streams.
    pub fn with_http(config: Config, registry: SchemaRegistry) -> Self {
        let transport = Arc::new(HttpTransport::new(config.request_timeout));
        Self::new(config, registry, transport, Arc::new(WsChannelOpener))
    }

    /// Issue a request against the remote service and fold the response
    /// into the cache.
    pub async fn request(
        &self,
        method: &str,
        url: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<TransportResponse, SyncError> {
        self.dispatcher.submit(method, url, body, options).await
    }

    /// Whether a request to `url` is currently in flight.
    pub async fn is_pending(&self, url: &str) -> bool {
        self.dispatcher.is_pending(url).await
    }

    /// Negotiate and open a named stream. See
    /// [`StreamManager::initialize_stream`].
    pub async fn initialize_stream(
        &self,
        desired: StreamDoc,
        session: Option<String>,
    ) -> Result<(), SyncError> {
        self.streams.initialize_stream(desired, session).await
    }

    /// Open a channel for a known subscription document without negotiation.
    pub async fn open_stream(
        &self,
        doc: StreamDoc,
        session: Option<String>,
    ) -> Result<(), SyncError> {
        self.streams.open_stream(doc, session).await
    }

    /// Close a stream with the reserved client code and drop its state.
    pub async fn close_stream(&self, name: &str) {
        self.streams.close_stream(name).await;
    }

    pub async fn stream_status(&self, name: &str) -> Option<(StreamStatus, Option<ConnectStep>)> {
        self.streams.status(name).await
    }

    /// Subscribe to engine status events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Shared handle on the entity cache.
    pub fn store(&self) -> Arc<RwLock<EntityStore>> {
        Arc::clone(&self.store)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.read().await.id()
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_valid()
    }
}
