//! Entity synchronization engine.
//!
//! Keeps a normalized in-memory cache of hierarchical entities in sync with
//! a remote service. One-shot requests go through the [`Dispatcher`] and
//! fold their responses into the [`EntityStore`]; live change events arrive
//! over streaming channels run by the [`StreamManager`]. The
//! [`SyncEngine`] facade wires both onto shared transports.
//!
//! The schema (which record types exist and which child collections each
//! type owns) comes from a [`skein_api::SchemaRegistry`]; the store uses it
//! to flatten nested documents and to cascade removals.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod route;
pub mod session;
pub mod store;
pub mod stream;
pub mod testing;
pub mod transport;

pub use config::Config;
pub use dispatcher::{Dispatcher, RequestOptions};
pub use engine::SyncEngine;
pub use events::{EventSender, SyncEvent};
pub use route::{ParentRef, Route, UrlInfo};
pub use session::SessionState;
pub use store::{ChildLink, EntityStore, MergePolicy, MergeScope};
pub use stream::StreamManager;
pub use transport::{
    ChannelConnection, ChannelEvent, ChannelHandle, ChannelOpener, HttpTransport, Method,
    Transport, TransportRequest, TransportResponse, WsChannelOpener,
};

pub use skein_api::{SyncError, SchemaRegistry, StreamDoc, StreamStatus};
