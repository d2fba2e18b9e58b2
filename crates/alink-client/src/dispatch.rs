//! Inbound message routing.
//!
//! Every message the transport delivers goes through [`Session::dispatch`].
//! Replies resolve their pending call; pushes first apply their registry
//! side effects and then run the registered handler. Nothing here blocks or
//! panics: acknowledgements and re-logins run on spawned tasks, and bad
//! input is logged and returned as an error the delivery loop can ignore.

use crate::error::{ClientResult, Error};
use crate::handlers::PushEvent;
use crate::session::Session;
use crate::transport::Qos;
use alink_core::sign::now_ms;
use alink_core::{DeviceIdentity, DeviceKey, LifecycleState};
use alink_proto::messages::SESSION_ERROR_CODE;
use alink_proto::{
    PushKind, PushRequest, Reply, RequestId, TopicLayout, TopicParts, TopoChange,
    TopoChangeStatus,
};
use serde_json::{json, Value};
use std::future::Future;

/// Where an inbound message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// A reply to a correlated request
    Reply {
        /// Request id carried by the reply
        id: RequestId,
        /// Whether a waiter was still registered
        matched: bool,
    },
    /// An unsolicited push
    Push {
        /// Push kind
        kind: PushKind,
        /// Whether a user handler ran
        handled: bool,
    },
}

impl Session {
    /// Route one inbound message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTopic` for a topic outside the scheme, `Unroutable`
    /// when no pattern matches, and `Decode` for a malformed payload. The
    /// message is dropped in every error case.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> ClientResult<Routed> {
        let parts = self.layout().parse(topic).map_err(|err| {
            tracing::warn!(topic, "Dropping message on malformed topic");
            Error::from(err)
        })?;

        if parts.reply {
            return self.dispatch_reply(topic, payload);
        }

        let Some(kind) = PushKind::classify(parts.prefix, &parts.operation) else {
            tracing::warn!(topic, "Dropping message with no route");
            return Err(Error::Unroutable(topic.to_string()));
        };
        self.dispatch_push(kind, topic, parts, payload)
    }

    /// Acknowledge a push on its `_reply` topic.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the push carried no id, or the
    /// transport error.
    pub async fn reply_push(&self, event: &PushEvent, code: i64, data: Value) -> ClientResult<()> {
        let id = event.id.ok_or_else(|| {
            Error::InvalidParameter(format!("push on '{}' carries no id", event.topic))
        })?;
        let reply = Reply {
            id,
            code,
            data,
            message: None,
        };
        self.publish(
            &TopicLayout::reply_topic_of(&event.topic),
            Qos::AtMostOnce,
            reply.to_json()?,
        )
        .await
    }

    fn dispatch_reply(&self, topic: &str, payload: &[u8]) -> ClientResult<Routed> {
        let reply = Reply::from_json(payload).map_err(|err| {
            tracing::warn!(topic, error = %err, "Dropping undecodable reply");
            Error::from(err)
        })?;
        let id = reply.id;
        let matched = self.pending().resolve(reply);
        Ok(Routed::Reply { id, matched })
    }

    fn dispatch_push(
        &self,
        kind: PushKind,
        topic: &str,
        parts: TopicParts,
        payload: &[u8],
    ) -> ClientResult<Routed> {
        let event = decode_push(kind, topic, parts.device, payload).map_err(|err| {
            tracing::warn!(topic, error = %err, "Dropping undecodable push");
            err
        })?;
        tracing::debug!(topic, kind = ?kind, id = ?event.id, "Push received");

        self.apply_side_effects(&event);
        if kind.expects_ack() {
            self.spawn_ack(&event);
        }

        let handled = self.inner.handlers.invoke(&event);
        Ok(Routed::Push { kind, handled })
    }

    fn apply_side_effects(&self, event: &PushEvent) {
        let registry = self.registry();
        let device = &event.device;

        match event.kind {
            PushKind::Disable | PushKind::Enable => {
                let available = event.kind == PushKind::Enable;
                if let Err(err) = registry.set_available(device, available) {
                    tracing::warn!(device = %device, error = %err, "Availability push for unknown device");
                }
            }
            PushKind::Delete => {
                if registry.is_root(device) {
                    tracing::error!(device = %device, "Platform deleted the gateway device");
                } else if let Err(err) = registry.delete(device) {
                    tracing::warn!(device = %device, error = %err, "Delete push for unknown device");
                }
            }
            PushKind::TopoAddNotify => {
                for key in device_list(&event.params) {
                    self.ensure_sub_device(&key, LifecycleState::Authorized);
                }
            }
            PushKind::TopoChange => self.apply_topo_change(&event.params),
            PushKind::SessionError => self.apply_session_error(event),
            PushKind::PropertySet
            | PushKind::ServiceCall
            | PushKind::ConfigPush
            | PushKind::NtpResponse => {}
        }
    }

    fn apply_topo_change(&self, params: &Value) {
        let change: TopoChange = match serde_json::from_value(params.clone()) {
            Ok(change) => change,
            Err(err) => {
                tracing::warn!(error = %err, "Malformed topology change");
                return;
            }
        };
        let Some(status) = change.status() else {
            tracing::warn!(status = change.status, "Unknown topology change status");
            return;
        };

        let registry = self.registry();
        for key in &change.sub_list {
            let result = match status {
                TopoChangeStatus::Added => {
                    self.ensure_sub_device(key, LifecycleState::Attached);
                    Ok(())
                }
                TopoChangeStatus::Deleted => registry.delete(key).map(|_| ()),
                TopoChangeStatus::Enabled => registry.set_available(key, true),
                TopoChangeStatus::Disabled => registry.set_available(key, false),
            };
            if let Err(err) = result {
                tracing::warn!(device = %key, status = ?status, error = %err, "Topology change not applied");
            }
        }
    }

    fn apply_session_error(&self, event: &PushEvent) {
        let code = event.params.get("code").and_then(Value::as_i64);
        if code != Some(SESSION_ERROR_CODE) {
            tracing::warn!(code = ?code, device = %event.device, "Session error notification");
            return;
        }

        let target = if self.registry().is_root(&event.device) {
            event
                .params
                .get("data")
                .and_then(|data| serde_json::from_value::<DeviceKey>(data.clone()).ok())
        } else {
            Some(event.device.clone())
        };
        let Some(device) = target.filter(|key| !self.registry().is_root(key)) else {
            tracing::warn!("Session error without a sub-device");
            return;
        };

        tracing::info!(device = %device, "Sub-device session lost, logging in again");
        let session = self.clone();
        spawn_detached("re-login", async move {
            session.remediate(&device).await;
        });
    }

    fn ensure_sub_device(&self, key: &DeviceKey, state: LifecycleState) {
        let identity = DeviceIdentity::unregistered(&key.product_key, &key.device_name);
        if let Err(err) = self.registry().ensure(identity, state) {
            tracing::warn!(device = %key, error = %err, "Cannot track pushed sub-device");
        }
    }

    fn spawn_ack(&self, event: &PushEvent) {
        if event.id.is_none() {
            tracing::debug!(topic = %event.topic, "Push without id, not acknowledged");
            return;
        }
        let session = self.clone();
        let event = event.clone();
        spawn_detached("ack", async move {
            if let Err(err) = session.reply_push(&event, 200, json!({})).await {
                tracing::warn!(topic = %event.topic, error = %err, "Push acknowledgement failed");
            }
        });
    }
}

fn decode_push(
    kind: PushKind,
    topic: &str,
    device: DeviceKey,
    payload: &[u8],
) -> ClientResult<PushEvent> {
    let received_ms = now_ms();
    let (id, method, params) = match kind {
        // Bare bodies without the request envelope.
        PushKind::NtpResponse | PushKind::SessionError => {
            let body: Value =
                serde_json::from_slice(payload).map_err(|e| Error::Decode(e.to_string()))?;
            (None, String::new(), body)
        }
        _ => {
            let request = PushRequest::from_json(payload)?;
            (request.id, request.method, request.params)
        }
    };

    Ok(PushEvent {
        kind,
        device,
        topic: topic.to_string(),
        id,
        method,
        params,
        received_ms,
    })
}

/// Sub-devices listed in a push, either as a bare array or under `subList`.
fn device_list(params: &Value) -> Vec<DeviceKey> {
    let list = params.get("subList").unwrap_or(params);
    serde_json::from_value(list.clone()).unwrap_or_default()
}

fn spawn_detached<F>(task: &'static str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::warn!(task, "No runtime for background task, skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_list_accepts_both_shapes() {
        let bare = json!([{"productKey": "PK2", "deviceName": "a"}]);
        let wrapped = json!({"subList": [{"productKey": "PK2", "deviceName": "b"}]});

        assert_eq!(device_list(&bare), vec![DeviceKey::new("PK2", "a")]);
        assert_eq!(device_list(&wrapped), vec![DeviceKey::new("PK2", "b")]);
        assert!(device_list(&json!({"status": 0})).is_empty());
    }

    #[test]
    fn bare_pushes_keep_whole_body() {
        let event = decode_push(
            PushKind::SessionError,
            "/ext/error/PK1/DN1",
            DeviceKey::new("PK1", "DN1"),
            br#"{"code":520,"data":{"productKey":"PK2","deviceName":"a"}}"#,
        )
        .unwrap();
        assert_eq!(event.id, None);
        assert_eq!(event.params["code"], 520);

        let event = decode_push(
            PushKind::Disable,
            "/sys/PK1/DN1/thing/disable",
            DeviceKey::new("PK1", "DN1"),
            br#"{"id":"5","version":"1.0","method":"thing.disable","params":{}}"#,
        )
        .unwrap();
        assert_eq!(event.id, Some(RequestId(5)));
        assert_eq!(event.method, "thing.disable");
    }

    #[test]
    fn malformed_push_is_a_decode_error() {
        let err = decode_push(
            PushKind::PropertySet,
            "/sys/PK1/DN1/thing/service/property/set",
            DeviceKey::new("PK1", "DN1"),
            b"not json",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
