//! HMAC credential signing.
//!
//! The platform authenticates topology-add, combine-login and the MQTT
//! connect itself with an HMAC over a canonical string of the form
//! `clientId{cid}deviceName{dn}productKey{pk}timestamp{ms}`, keyed with the
//! device secret. Digests are lowercase hex.

use crate::identity::DeviceIdentity;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignMethod {
    /// HMAC-SHA1
    #[serde(rename = "hmacsha1")]
    HmacSha1,
    /// HMAC-SHA256
    #[default]
    #[serde(rename = "hmacsha256")]
    HmacSha256,
    /// HMAC-MD5
    #[serde(rename = "hmacmd5")]
    HmacMd5,
}

impl SignMethod {
    /// Wire name of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha1 => "hmacsha1",
            Self::HmacSha256 => "hmacsha256",
            Self::HmacMd5 => "hmacmd5",
        }
    }
}

impl fmt::Display for SignMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignMethod {
    type Err = SignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hmacsha1" => Ok(Self::HmacSha1),
            "hmacsha256" => Ok(Self::HmacSha256),
            "hmacmd5" => Ok(Self::HmacMd5),
            _ => Err(SignError::UnknownMethod(s.to_string())),
        }
    }
}

/// Compute the hex digest of `content` keyed with `secret`.
#[must_use]
pub fn sign(method: SignMethod, secret: &str, content: &str) -> String {
    let secret = secret.as_bytes();
    let content = content.as_bytes();
    match method {
        SignMethod::HmacSha1 => mac_hex::<Hmac<Sha1>>(secret, content),
        SignMethod::HmacSha256 => mac_hex::<Hmac<Sha256>>(secret, content),
        SignMethod::HmacMd5 => mac_hex::<Hmac<Md5>>(secret, content),
    }
}

/// Canonical string signed for topology-add, combine-login and MQTT connect.
#[must_use]
pub fn canonical_content(
    client_id: &str,
    product_key: &str,
    device_name: &str,
    timestamp_ms: u64,
) -> String {
    format!("clientId{client_id}deviceName{device_name}productKey{product_key}timestamp{timestamp_ms}")
}

/// Milliseconds since the UNIX epoch.
#[must_use]
pub fn now_ms() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// MQTT CONNECT credentials for a directly connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttCredentials {
    /// Client identifier including the `securemode`/`signmethod` extension
    pub client_id: String,
    /// `{deviceName}&{productKey}`
    pub username: String,
    /// Hex signature over the canonical content
    pub password: String,
}

impl MqttCredentials {
    /// Derive credentials for `identity` at `timestamp_ms`.
    ///
    /// `secure_mode` 2 is TLS, 3 is plain TCP.
    #[must_use]
    pub fn for_device(
        identity: &DeviceIdentity,
        method: SignMethod,
        timestamp_ms: u64,
        secure_mode: u8,
    ) -> Self {
        let client_id = format!("{}.{}", identity.product_key, identity.device_name);
        let content = canonical_content(
            &client_id,
            &identity.product_key,
            &identity.device_name,
            timestamp_ms,
        );
        Self {
            client_id: format!(
                "{client_id}|securemode={secure_mode},signmethod={method},timestamp={timestamp_ms}|"
            ),
            username: format!("{}&{}", identity.device_name, identity.product_key),
            password: sign(method, &identity.device_secret, &content),
        }
    }
}

fn mac_hex<M: Mac + KeyInit>(secret: &[u8], content: &[u8]) -> String {
    let mut mac = <M as KeyInit>::new_from_slice(secret).expect("HMAC accepts keys of any size");
    mac.update(content);
    hex::encode(mac.finalize().into_bytes())
}

/// Errors for signing configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    /// Unrecognised sign method name
    #[error("unknown sign method '{0}'")]
    UnknownMethod(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 2202 / RFC 4231 test case 2: key "Jefe".
    const DATA: &str = "what do ya want for nothing?";

    #[test]
    fn hmac_known_vectors() {
        assert_eq!(
            sign(SignMethod::HmacMd5, "Jefe", DATA),
            "750c783e6ab0b503eaa86e310a5db738"
        );
        assert_eq!(
            sign(SignMethod::HmacSha1, "Jefe", DATA),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
        assert_eq!(
            sign(SignMethod::HmacSha256, "Jefe", DATA),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn canonical_content_is_sorted_by_field_name() {
        assert_eq!(
            canonical_content("pk.dn", "pk", "dn", 1_524_448_722_000),
            "clientIdpk.dndeviceNamednproductKeypktimestamp1524448722000"
        );
    }

    #[test]
    fn sign_method_parsing() {
        assert_eq!("hmacsha1".parse(), Ok(SignMethod::HmacSha1));
        assert_eq!("HmacSha256".parse(), Ok(SignMethod::HmacSha256));
        assert_eq!(
            "sha512".parse::<SignMethod>(),
            Err(SignError::UnknownMethod("sha512".to_string()))
        );
    }

    #[test]
    fn mqtt_credentials_layout() {
        let identity = DeviceIdentity::new("a1B2", "gw-01", "secret");
        let creds = MqttCredentials::for_device(&identity, SignMethod::HmacSha256, 42, 3);

        assert_eq!(
            creds.client_id,
            "a1B2.gw-01|securemode=3,signmethod=hmacsha256,timestamp=42|"
        );
        assert_eq!(creds.username, "gw-01&a1B2");
        assert_eq!(
            creds.password,
            sign(
                SignMethod::HmacSha256,
                "secret",
                "clientIda1B2.gw-01deviceNamegw-01productKeya1B2timestamp42"
            )
        );
        assert_eq!(creds.password.len(), 64);
    }
}
