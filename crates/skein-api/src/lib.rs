use serde::{Deserialize, Serialize};

pub mod schema;
pub mod streaming;

pub use schema::{Cardinality, Descriptor, Relation, SchemaRegistry};
pub use streaming::{
    ChangeEvent, ChangeKind, ConnectStep, MetaObject, StreamDoc, StreamMeta, StreamStatus,
};

/// Error code the remote service uses to signal an invalid session.
pub const INVALID_SESSION_CODE: i64 = 9_900_025;

/// Channel close code reserved for client-initiated closes; never reconnected.
pub const CLIENT_CLOSE_CODE: u16 = 4001;

/// Structured error type shared by the cache engine.
///
/// Local precondition failures, duplicate-request rejections, transport and
/// remote errors all surface through this enum; callers observe the same
/// failures as status events on the engine's broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum SyncError {
    #[error("no session available")]
    MissingSession,

    #[error("a stream requires a name")]
    MissingStreamName,

    #[error("invalid request method: {method}")]
    InvalidMethod { method: String },

    #[error("a request to {url} is already pending")]
    DuplicateRequest { url: String },

    #[error("url carries no route: {url}")]
    InvalidUrl { url: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("remote error (status {status}, code {code:?}): {message}")]
    Remote {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("document nesting exceeds the depth limit")]
    DepthLimit,

    #[error("channel error: {message}")]
    Channel { message: String },

    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },
}

impl SyncError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }

    /// True when the error carries the remote "session invalid" code.
    pub fn is_invalid_session(&self) -> bool {
        matches!(
            self,
            Self::Remote {
                code: Some(INVALID_SESSION_CODE),
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
