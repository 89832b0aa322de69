//! Wire types for the live stream: subscription documents, change-event
//! envelopes and the per-stream status machine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of change carried by a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Identity of the entity a change event refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaObject {
    #[serde(rename = "type")]
    pub ty: String,
    pub id: String,
}

/// One change event as delivered on the channel.
///
/// The entity body arrives under a field named after the type itself
/// (`{"event": "update", "meta_object": {"type": "device", ...}, "device": {...}}`),
/// captured here through the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event: ChangeKind,
    pub meta_object: MetaObject,
    #[serde(default)]
    pub path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChangeEvent {
    /// The entity body, looked up under the event's own type name.
    pub fn body(&self) -> Option<&Value> {
        self.extra.get(&self.meta_object.ty)
    }

    /// Remove and return the entity body.
    pub fn take_body(&mut self) -> Option<Value> {
        let ty = self.meta_object.ty.clone();
        self.extra.remove(&ty)
    }
}

/// Server-side identity of a stream resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub id: String,
}

/// A stream subscription document, as stored server-side and exchanged over
/// the stream resource endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<StreamMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub subscription: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<bool>,
}

impl StreamDoc {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Server-assigned id, when the stream resource already exists.
    pub fn id(&self) -> Option<&str> {
        self.meta.as_ref().map(|m| m.id.as_str())
    }
}

/// Status of one named stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Connecting,
    Open,
    Reconnecting,
    Closed,
    Error,
    Lost,
}

/// Sub-phase while a stream is connecting or reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectStep {
    GetStream,
    CreateStream,
    UpdateStream,
    OpeningSocket,
    Waiting,
}
