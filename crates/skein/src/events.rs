//! Engine status events.
//!
//! Every state change, successful or failed, is emitted on one broadcast
//! channel, so callers observe failures as ordinary status transitions
//! rather than thrown faults. Emission is fire-and-forget: a send with no
//! receivers is not an error.

use tokio::sync::broadcast;

use crate::transport::Method;
use skein_api::{ConnectStep, StreamStatus};

/// One observable engine transition.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    RequestSucceeded {
        method: Method,
        url: String,
        status: u16,
    },
    RequestFailed {
        method: Method,
        url: String,
        status: u16,
        code: Option<i64>,
    },
    SessionEstablished,
    SessionCleared,
    SessionInvalidated,
    StreamChanged {
        name: String,
        status: StreamStatus,
        step: Option<ConnectStep>,
    },
    EntitiesChanged {
        service: String,
    },
}

/// Cloneable emitter around the broadcast sender.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; ignores the absence of receivers.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(256)
    }
}
