//! Session record tracking.

use serde_json::Value;

/// The current session record and its validity.
///
/// The record is the JSON document the session endpoint returned; its id
/// (`meta.id`, falling back to `id`) is attached to outgoing requests and
/// channel URLs. Invalidation keeps the record around but marks it unusable
/// so callers know re-authentication is required.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    record: Option<Value>,
    valid: bool,
}

impl SessionState {
    pub fn establish(&mut self, record: Value) {
        self.record = Some(record);
        self.valid = true;
    }

    pub fn clear(&mut self) {
        self.record = None;
        self.valid = false;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The session id, when a valid session is established.
    pub fn id(&self) -> Option<String> {
        if !self.valid {
            return None;
        }
        let record = self.record.as_ref()?;
        record
            .get("meta")
            .and_then(|m| m.get("id"))
            .or_else(|| record.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}
