//! MQTT binding of the [`Transport`] contract over `rumqttc`.

use crate::session::Session;
use crate::transport::{Qos, Transport, TransportError};
use alink_core::MqttCredentials;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use url::Url;

const DEFAULT_PORT: u16 = 1883;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Transport publishing through a `rumqttc` client.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Create the client for `broker` with device credentials.
    ///
    /// The returned [`EventLoop`] must be polled, typically with [`drive`].
    ///
    /// # Errors
    ///
    /// Returns error if the broker address is invalid.
    pub fn new(
        broker: &str,
        credentials: &MqttCredentials,
        keep_alive: Duration,
    ) -> Result<(Self, EventLoop), TransportError> {
        let (host, port) = parse_mqtt_url(broker)?;

        let mut options = MqttOptions::new(&credentials.client_id, host, port);
        options.set_keep_alive(keep_alive);
        options.set_credentials(&credentials.username, &credentials.password);

        let (client, eventloop) = AsyncClient::new(options, 100);
        Ok((Self { client }, eventloop))
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport").finish_non_exhaustive()
    }
}

fn mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, mqtt_qos(qos), false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        tracing::debug!(topic, "Subscribing");
        self.client
            .subscribe(topic, mqtt_qos(qos))
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        for topic in topics {
            self.client
                .unsubscribe(topic)
                .await
                .map_err(|e| TransportError::Unsubscribe(e.to_string()))?;
        }
        Ok(())
    }
}

/// Poll the event loop forever, feeding every inbound publish to `session`.
///
/// Connection errors are logged and retried after a fixed delay.
pub async fn drive(mut eventloop: EventLoop, session: Session) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    "Inbound publish"
                );
                // Failures are logged by dispatch and never stop delivery.
                let _ = session.dispatch(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(code = ?ack.code, "Connected to broker");
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                tracing::debug!(pkid = ack.pkid, "Subscription acknowledged");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "MQTT event loop error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Split `tcp://host:port`, `mqtt://host:port` or `host[:port]`.
///
/// # Errors
///
/// Returns `InvalidBrokerUrl` for an unsupported scheme or a missing host.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    let invalid = |reason: String| TransportError::InvalidBrokerUrl(format!("{input}: {reason}"));

    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "tcp" | "mqtt") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        return Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)));
    }

    match input.split_once(':') {
        None if !input.is_empty() => Ok((input.to_string(), DEFAULT_PORT)),
        None => Err(invalid("missing host".to_string())),
        Some(("", _)) => Err(invalid("missing host".to_string())),
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| invalid(format!("invalid port '{port}'")))?;
            Ok((host.to_string(), port))
        }
    }
}
