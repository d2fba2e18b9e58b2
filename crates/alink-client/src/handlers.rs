//! Per-event push handler registration.
//!
//! Implementers register a handler only for the push kinds they care about;
//! a kind without a registration is simply ignored after the session has
//! applied its own lifecycle side effects.

use alink_core::DeviceKey;
use alink_proto::{NtpResponse, PushKind, RequestId};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// An unsolicited message delivered to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// Push kind
    pub kind: PushKind,
    /// Device the topic addresses
    pub device: DeviceKey,
    /// Topic the message arrived on
    pub topic: String,
    /// Request id to echo in a reply, if the platform sent one
    pub id: Option<RequestId>,
    /// Envelope method (empty for bare payloads)
    pub method: String,
    /// Envelope params, or the whole payload for bare messages
    pub params: Value,
    /// Local receive time, milliseconds since the epoch
    pub received_ms: u64,
}

impl PushEvent {
    /// Service identifier of a `ServiceCall` push.
    #[must_use]
    pub fn service_identifier(&self) -> Option<&str> {
        if self.kind != PushKind::ServiceCall {
            return None;
        }
        self.topic.rsplit('/').next()
    }

    /// Decoded body of an `NtpResponse` push.
    #[must_use]
    pub fn ntp(&self) -> Option<NtpResponse> {
        if self.kind != PushKind::NtpResponse {
            return None;
        }
        serde_json::from_value(self.params.clone()).ok()
    }

    /// Server clock estimate for an `NtpResponse` push.
    #[must_use]
    pub fn server_time_ms(&self) -> Option<u64> {
        self.ntp().map(|ntp| ntp.server_time_ms(self.received_ms))
    }
}

/// Callback invoked for a push kind.
pub type PushHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// Mapping from push kind to handler.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<PushKind, PushHandler>>,
}

impl HandlerTable {
    /// Register a handler, returning the one it replaces.
    pub fn register(&self, kind: PushKind, handler: PushHandler) -> Option<PushHandler> {
        self.handlers.write().insert(kind, handler)
    }

    /// Remove the handler for `kind`.
    pub fn remove(&self, kind: PushKind) -> Option<PushHandler> {
        self.handlers.write().remove(&kind)
    }

    /// Run the handler for the event's kind. Returns whether one ran.
    ///
    /// The table lock is released before the handler runs.
    pub fn invoke(&self, event: &PushEvent) -> bool {
        let handler = self.handlers.read().get(&event.kind).cloned();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<PushKind> = self.handlers.read().keys().copied().collect();
        f.debug_struct("HandlerTable").field("kinds", &kinds).finish()
    }
}
