//! Agent configuration.

use alink_core::{DeviceIdentity, SignMethod};
use anyhow::{bail, Context, Result};
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// MQTT broker URL
    pub broker: String,

    /// Gateway (root device) identity
    pub root: DeviceIdentity,

    /// Extra leading topic segment for bridged transports
    pub topic_root: Option<String>,

    /// Timeout for each correlated request
    pub request_timeout: Duration,

    /// MQTT keep-alive
    pub keep_alive: Duration,

    /// Signing algorithm for connect, topology and login
    pub sign_method: SignMethod,

    /// `cleanSession` flag sent with combine-login
    pub clean_session: bool,

    /// Sub-devices to bring online at startup
    pub sub_devices: Vec<DeviceIdentity>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://localhost:1883".to_string(),
            root: DeviceIdentity::unregistered("", ""),
            topic_root: None,
            request_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            sign_method: SignMethod::default(),
            clean_session: false,
            sub_devices: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ALINK_BROKER`: MQTT broker URL
    /// - `ALINK_PRODUCT_KEY`: Gateway product key (required)
    /// - `ALINK_DEVICE_NAME`: Gateway device name (required)
    /// - `ALINK_DEVICE_SECRET`: Gateway device secret (required)
    /// - `ALINK_TOPIC_ROOT`: Extra leading topic segment
    /// - `ALINK_REQUEST_TIMEOUT_MS`: Request timeout in milliseconds
    /// - `ALINK_SIGN_METHOD`: `hmacsha1`, `hmacsha256` or `hmacmd5`
    /// - `ALINK_CLEAN_SESSION`: `true` to discard sub-device sessions on login
    /// - `ALINK_SUB_DEVICES`: JSON list of `{productKey, deviceName, deviceSecret?}`
    ///
    /// # Errors
    ///
    /// Returns error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup.
    ///
    /// # Errors
    ///
    /// See [`AgentConfig::from_env`].
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(broker) = var("ALINK_BROKER") {
            config.broker = broker;
        }

        let product_key = var("ALINK_PRODUCT_KEY").context("ALINK_PRODUCT_KEY is required")?;
        let device_name = var("ALINK_DEVICE_NAME").context("ALINK_DEVICE_NAME is required")?;
        let device_secret =
            var("ALINK_DEVICE_SECRET").context("ALINK_DEVICE_SECRET is required")?;
        config.root = DeviceIdentity::new(product_key, device_name, device_secret);
        if !config.root.key().is_valid() {
            bail!("Invalid gateway identity '{}'", config.root.key());
        }

        config.topic_root = var("ALINK_TOPIC_ROOT").filter(|root| !root.is_empty());

        if let Some(ms) = var("ALINK_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms.parse().context("Invalid ALINK_REQUEST_TIMEOUT_MS")?;
            config.request_timeout = Duration::from_millis(ms);
        }

        if let Some(method) = var("ALINK_SIGN_METHOD") {
            config.sign_method = method.parse().context("Invalid ALINK_SIGN_METHOD")?;
        }

        if let Some(clean) = var("ALINK_CLEAN_SESSION") {
            config.clean_session = clean.parse().context("Invalid ALINK_CLEAN_SESSION")?;
        }

        // Parse sub-devices from JSON env var
        if let Some(json) = var("ALINK_SUB_DEVICES") {
            let value = serde_json::from_str(&json).context("Invalid ALINK_SUB_DEVICES JSON")?;
            config.sub_devices =
                alink_client::parse_sub_devices(value).context("Invalid ALINK_SUB_DEVICES")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const GATEWAY: [(&str, &str); 3] = [
        ("ALINK_PRODUCT_KEY", "PK1"),
        ("ALINK_DEVICE_NAME", "DN1"),
        ("ALINK_DEVICE_SECRET", "secret"),
    ];

    #[test]
    fn defaults_with_gateway_identity() {
        let config = AgentConfig::from_vars(lookup(&GATEWAY)).unwrap();
        assert_eq!(config.broker, "tcp://localhost:1883");
        assert_eq!(config.root, DeviceIdentity::new("PK1", "DN1", "secret"));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.topic_root.is_none());
        assert!(config.sub_devices.is_empty());
    }

    #[test]
    fn overrides_are_applied() {
        let mut vars = GATEWAY.to_vec();
        vars.extend([
            ("ALINK_BROKER", "mqtt://iot.example.com:1884"),
            ("ALINK_TOPIC_ROOT", "topic"),
            ("ALINK_REQUEST_TIMEOUT_MS", "2500"),
            ("ALINK_SIGN_METHOD", "hmacsha1"),
            ("ALINK_CLEAN_SESSION", "true"),
            (
                "ALINK_SUB_DEVICES",
                r#"[{"productKey":"PK2","deviceName":"a"},{"productKey":"PK2","deviceName":"b","deviceSecret":"s"}]"#,
            ),
        ]);
        let config = AgentConfig::from_vars(lookup(&vars)).unwrap();

        assert_eq!(config.broker, "mqtt://iot.example.com:1884");
        assert_eq!(config.topic_root.as_deref(), Some("topic"));
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.sign_method, SignMethod::HmacSha1);
        assert!(config.clean_session);
        assert_eq!(config.sub_devices.len(), 2);
        assert!(config.sub_devices[1].has_secret());
    }

    #[test]
    fn missing_or_invalid_values_fail() {
        assert!(AgentConfig::from_vars(lookup(&GATEWAY[..2])).is_err());

        let mut vars = GATEWAY.to_vec();
        vars.push(("ALINK_SIGN_METHOD", "sha512"));
        assert!(AgentConfig::from_vars(lookup(&vars)).is_err());

        let mut vars = GATEWAY.to_vec();
        vars.push(("ALINK_SUB_DEVICES", "{not json"));
        assert!(AgentConfig::from_vars(lookup(&vars)).is_err());

        let vars = [
            ("ALINK_PRODUCT_KEY", "PK/1"),
            ("ALINK_DEVICE_NAME", "DN1"),
            ("ALINK_DEVICE_SECRET", "secret"),
        ];
        assert!(AgentConfig::from_vars(lookup(&vars)).is_err());
    }
}
