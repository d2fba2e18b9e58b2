//! In-memory transport that records traffic and answers requests by feeding
//! replies back through `Session::dispatch`.

#![allow(dead_code)]

use alink_client::{Features, Qos, Session, SessionConfig, Transport, TransportError};
use alink_core::{DeviceIdentity, DeviceKey};
use alink_proto::TopicLayout;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Answer produced by a responder.
pub struct StubReply {
    pub code: i64,
    pub data: Value,
    pub delay: Duration,
}

impl StubReply {
    pub fn ok(data: Value) -> Self {
        Self::code(200).with_data(data)
    }

    pub fn code(code: i64) -> Self {
        Self {
            code,
            data: json!({}),
            delay: Duration::ZERO,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Arc<dyn Fn(&Value) -> Option<StubReply> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub qos: Qos,
    pub body: Value,
}

#[derive(Default)]
pub struct StubTransport {
    layout: TopicLayout,
    session: OnceLock<Session>,
    responders: Mutex<HashMap<String, Responder>>,
    published: Mutex<Vec<Published>>,
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    fail_publish: AtomicBool,
}

impl StubTransport {
    /// Answer requests carrying `method`. Returning `None` leaves the request unanswered.
    pub fn on<F>(&self, method: &str, responder: F)
    where
        F: Fn(&Value) -> Option<StubReply> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .insert(method.to_string(), Arc::new(responder));
    }

    /// Answer `method` with success and an empty body.
    pub fn accept(&self, method: &str) {
        self.on(method, |_| Some(StubReply::ok(json!({}))));
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.published
            .lock()
            .iter()
            .filter(|p| p.body.get("method").and_then(Value::as_str) == Some(method))
            .count()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn publish(&self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("broker unreachable".to_string()));
        }

        let body: Value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
        self.published.lock().push(Published {
            topic: topic.to_string(),
            qos,
            body: body.clone(),
        });

        let Some(method) = body.get("method").and_then(Value::as_str) else {
            return Ok(());
        };
        let responder = self.responders.lock().get(method).cloned();
        let Some(reply) = responder.and_then(|respond| respond(&body["params"])) else {
            return Ok(());
        };

        let session = self.session.get().cloned().expect("session attached");
        let reply_topic = TopicLayout::reply_topic_of(topic);
        let payload = serde_json::to_vec(&json!({
            "id": body["id"],
            "code": reply.code,
            "data": reply.data,
        }))
        .unwrap();
        tokio::spawn(async move {
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            let _ = session.dispatch(&reply_topic, &payload);
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: Qos) -> Result<(), TransportError> {
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.unsubscribed.lock().extend(topics.iter().cloned());
        Ok(())
    }

    fn layout(&self) -> TopicLayout {
        self.layout.clone()
    }
}

pub fn root() -> DeviceKey {
    DeviceKey::new("PK1", "DN1")
}

pub fn setup_with(layout: TopicLayout, features: Features) -> (Arc<StubTransport>, Session) {
    let stub = Arc::new(StubTransport {
        layout,
        ..StubTransport::default()
    });
    let config = SessionConfig {
        request_timeout: TIMEOUT,
        features,
        ..SessionConfig::default()
    };
    let session = Session::new(
        stub.clone(),
        DeviceIdentity::new("PK1", "DN1", "root-secret"),
        config,
    );
    assert!(stub.session.set(session.clone()).is_ok());
    (stub, session)
}

pub fn setup() -> (Arc<StubTransport>, Session) {
    setup_with(TopicLayout::mqtt(), Features::default())
}

/// Responders for the full gateway protocol. Registration issues
/// `secret-{deviceName}` for every requested device.
pub fn accept_gateway_protocol(stub: &StubTransport) {
    stub.on("thing.sub.register", |params| {
        let devices = params.as_array()?;
        let data: Vec<Value> = devices
            .iter()
            .map(|device| {
                json!({
                    "productKey": device["productKey"],
                    "deviceName": device["deviceName"],
                    "deviceSecret": format!("secret-{}", device["deviceName"].as_str().unwrap_or_default()),
                })
            })
            .collect();
        Some(StubReply::ok(Value::Array(data)))
    });
    for method in [
        "thing.topo.add",
        "thing.topo.delete",
        "combine.login",
        "combine.batch.login",
        "combine.logout",
        "thing.event.property.post",
    ] {
        stub.accept(method);
    }
}

/// Let spawned reply, ack and re-login tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
