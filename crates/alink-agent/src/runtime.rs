//! Agent runtime orchestration.

use crate::config::AgentConfig;
use alink_client::{drive, Gateway, MqttTransport, Session, SessionConfig};
use alink_core::sign::now_ms;
use alink_core::{DeviceKey, MqttCredentials};
use alink_proto::{PushKind, TopicLayout};
use anyhow::{Context, Result};
use std::sync::Arc;

/// `securemode` for plain TCP connections.
const SECURE_MODE_TCP: u8 = 3;

/// The gateway agent.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Connect, bring sub-devices online and serve until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be set up or the gateway's own
    /// subscriptions fail. Sub-device failures are logged, not fatal.
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        tracing::info!(broker = %config.broker, gateway = %config.root.key(), "Starting agent runtime");

        let credentials = MqttCredentials::for_device(
            &config.root,
            config.sign_method,
            now_ms(),
            SECURE_MODE_TCP,
        );
        let (transport, eventloop) =
            MqttTransport::new(&config.broker, &credentials, config.keep_alive)
                .context("Failed to create MQTT transport")?;

        let session = Session::new(
            Arc::new(transport),
            config.root.clone(),
            SessionConfig {
                request_timeout: config.request_timeout,
                sign_method: config.sign_method,
                layout: config.topic_root.clone().map(TopicLayout::with_root),
                ..SessionConfig::default()
            },
        );
        register_handlers(&session);

        let driver = tokio::spawn(drive(eventloop, session.clone()));
        let sweeper = session.spawn_sweeper();

        let root = config.root.key();
        session
            .subscribe_device(&root)
            .await
            .context("Failed to subscribe gateway topics")?;

        let gateway = Gateway::new(session.clone()).context("Gateway feature unavailable")?;
        let sub_devices = track_sub_devices(&gateway, &config);
        if !sub_devices.is_empty() {
            match gateway
                .sub_devices_connect(&sub_devices, config.clean_session, config.request_timeout)
                .await
            {
                Ok(()) => tracing::info!(count = sub_devices.len(), "Sub-devices online"),
                Err(err) => {
                    tracing::error!(step = ?err.step(), error = %err, "Sub-device connect failed");
                }
            }
        }

        if let Err(err) = session.request_ntp().await {
            tracing::warn!(error = %err, "NTP probe failed");
        }

        tracing::info!("Agent running, press Ctrl+C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        tracing::info!("Shutting down");

        for device in &sub_devices {
            if let Err(err) = gateway
                .sub_device_disconnect(device, config.request_timeout)
                .await
            {
                tracing::warn!(device = %device, error = %err, "Sub-device disconnect failed");
            }
        }

        sweeper.abort();
        driver.abort();
        Ok(())
    }
}

fn track_sub_devices(gateway: &Gateway, config: &AgentConfig) -> Vec<DeviceKey> {
    let mut keys = Vec::with_capacity(config.sub_devices.len());
    for identity in &config.sub_devices {
        let key = identity.key();
        match gateway.add_sub_device(identity.clone()) {
            Ok(()) => keys.push(key),
            Err(err) => tracing::warn!(device = %key, error = %err, "Skipping sub-device"),
        }
    }
    keys
}

fn register_handlers(session: &Session) {
    session.on(PushKind::PropertySet, |event| {
        tracing::info!(device = %event.device, params = %event.params, "Property set");
    });
    session.on(PushKind::ServiceCall, |event| {
        tracing::info!(
            device = %event.device,
            service = event.service_identifier().unwrap_or_default(),
            params = %event.params,
            "Service call"
        );
    });
    session.on(PushKind::ConfigPush, |event| {
        tracing::info!(device = %event.device, params = %event.params, "Configuration pushed");
    });
    session.on(PushKind::TopoChange, |event| {
        tracing::info!(params = %event.params, "Topology changed");
    });
    session.on(PushKind::NtpResponse, |event| {
        if let Some(server_ms) = event.server_time_ms() {
            let skew = i128::from(server_ms) - i128::from(event.received_ms);
            tracing::info!(server_ms, skew_ms = %skew, "Clock synchronised");
        }
    });
}
