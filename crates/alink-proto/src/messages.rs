//! JSON envelopes exchanged with the platform.

use alink_core::{canonical_content, sign, DeviceIdentity, DeviceKey, SignMethod};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Envelope version sent with every request.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Reply code the platform uses for success.
pub const SUCCESS_CODE: i64 = 200;

/// Reply code meaning the sub-device's session is gone.
pub const SESSION_ERROR_CODE: i64 = 520;

/// Correlation identifier, encoded on the wire as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_lenient_u64(deserializer).map(Self)
    }
}

/// Accept either a JSON number or a decimal string.
fn deserialize_lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    struct LenientU64;

    impl Visitor<'_> for LenientU64 {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an unsigned integer or a decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("negative value {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid number '{v}'")))
        }
    }

    deserializer.deserialize_any(LenientU64)
}

/// An outbound request.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a, P> {
    /// Correlation identifier
    pub id: RequestId,
    /// Envelope version
    pub version: &'static str,
    /// Operation method name
    pub method: &'a str,
    /// Operation parameters
    pub params: P,
}

impl<'a, P: Serialize> Request<'a, P> {
    /// Create a new request.
    #[must_use]
    pub fn new(id: RequestId, method: &'a str, params: P) -> Self {
        Self {
            id,
            version: PROTOCOL_VERSION,
            method,
            params,
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }
}

/// A reply to a correlated request, also used to acknowledge pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Identifier of the request being answered
    pub id: RequestId,
    /// Result code
    pub code: i64,
    /// Operation result
    #[serde(default)]
    pub data: Value,
    /// Error description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    /// A successful reply.
    #[must_use]
    pub fn ok(id: RequestId, data: Value) -> Self {
        Self {
            id,
            code: SUCCESS_CODE,
            data,
            message: None,
        }
    }

    /// `0` and `200` both mark success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == 0 || self.code == SUCCESS_CODE
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// A platform-initiated request on a push topic.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PushRequest {
    /// Identifier to echo in the acknowledgement, if any
    #[serde(default)]
    pub id: Option<RequestId>,
    /// Envelope version
    #[serde(default)]
    pub version: String,
    /// Method name
    #[serde(default)]
    pub method: String,
    /// Parameters
    #[serde(default)]
    pub params: Value,
}

impl PushRequest {
    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Signed sub-device entry used by topology-add and combine-login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedDevice {
    /// Sub-device product key
    pub product_key: String,
    /// Sub-device name
    pub device_name: String,
    /// Client identifier the signature was computed for
    pub client_id: String,
    /// Signing time in milliseconds, as a string
    pub timestamp: String,
    /// Hash algorithm
    pub sign_method: SignMethod,
    /// Hex digest
    pub sign: String,
    /// `"true"` / `"false"`, login only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_session: Option<String>,
}

impl SignedDevice {
    /// Sign `identity` at `timestamp_ms`.
    #[must_use]
    pub fn new(identity: &DeviceIdentity, method: SignMethod, timestamp_ms: u64) -> Self {
        let client_id = format!("{}.{}", identity.product_key, identity.device_name);
        let content = canonical_content(
            &client_id,
            &identity.product_key,
            &identity.device_name,
            timestamp_ms,
        );
        Self {
            product_key: identity.product_key.clone(),
            device_name: identity.device_name.clone(),
            sign: sign(method, &identity.device_secret, &content),
            client_id,
            timestamp: timestamp_ms.to_string(),
            sign_method: method,
            clean_session: None,
        }
    }

    /// Attach the login `cleanSession` flag.
    #[must_use]
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = Some(clean_session.to_string());
        self
    }

    /// Registry key of the signed device.
    #[must_use]
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.product_key, &self.device_name)
    }
}

/// Status carried by a `thing/topo/change` push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopoChangeStatus {
    /// Topology added (0)
    Added,
    /// Topology deleted (1)
    Deleted,
    /// Sub-devices enabled (2)
    Enabled,
    /// Sub-devices disabled (8)
    Disabled,
}

impl TopoChangeStatus {
    /// Decode the numeric status.
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Added),
            1 => Some(Self::Deleted),
            2 => Some(Self::Enabled),
            8 => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Parameters of a `thing/topo/change` push.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopoChange {
    /// Numeric status
    pub status: i64,
    /// Affected sub-devices
    #[serde(default)]
    pub sub_list: Vec<DeviceKey>,
}

impl TopoChange {
    /// Decoded status, if known.
    #[must_use]
    pub fn status(&self) -> Option<TopoChangeStatus> {
        TopoChangeStatus::from_code(self.status)
    }
}

/// Parameters of an NTP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NtpRequest {
    /// Device clock at send time, milliseconds
    #[serde(serialize_with = "serialize_as_string")]
    pub device_send_time: u64,
}

/// Body of an NTP response push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtpResponse {
    /// Echo of the probe's device send time
    #[serde(deserialize_with = "deserialize_lenient_u64")]
    pub device_send_time: u64,
    /// Server clock when the probe arrived
    #[serde(deserialize_with = "deserialize_lenient_u64")]
    pub server_recv_time: u64,
    /// Server clock when the response left
    #[serde(deserialize_with = "deserialize_lenient_u64")]
    pub server_send_time: u64,
}

impl NtpResponse {
    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Current server time estimated at `device_recv_ms`.
    #[must_use]
    pub fn server_time_ms(&self, device_recv_ms: u64) -> u64 {
        let sum = u128::from(self.server_recv_time)
            + u128::from(self.server_send_time)
            + u128::from(device_recv_ms);
        let estimate = sum.saturating_sub(u128::from(self.device_send_time)) / 2;
        u64::try_from(estimate).unwrap_or(u64::MAX)
    }
}

fn serialize_as_string<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_encodes_id_as_string() {
        let request = Request::new(RequestId(42), "thing.event.property.post", json!({"temp": 21}));
        let value: Value = serde_json::from_slice(&request.to_json().unwrap()).unwrap();

        assert_eq!(value["id"], "42");
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert_eq!(value["method"], "thing.event.property.post");
        assert_eq!(value["params"]["temp"], 21);
    }

    #[test]
    fn reply_accepts_string_or_numeric_id() {
        let reply = Reply::from_json(br#"{"id":"7","code":200,"data":{}}"#).unwrap();
        assert_eq!(reply.id, RequestId(7));
        assert!(reply.is_success());

        let reply = Reply::from_json(br#"{"id":8,"code":0}"#).unwrap();
        assert_eq!(reply.id, RequestId(8));
        assert_eq!(reply.data, Value::Null);
        assert!(reply.is_success());

        let reply =
            Reply::from_json(br#"{"id":"9","code":460,"message":"request parameter error"}"#)
                .unwrap();
        assert!(!reply.is_success());
        assert_eq!(reply.message.as_deref(), Some("request parameter error"));

        assert!(Reply::from_json(br#"{"id":"x","code":200}"#).is_err());
        assert!(Reply::from_json(br#"{"id":-1,"code":200}"#).is_err());
    }

    #[test]
    fn signed_device_for_login() {
        let identity = DeviceIdentity::new("PK2", "sub-1", "s3cret");
        let signed = SignedDevice::new(&identity, SignMethod::HmacSha256, 1000).with_clean_session(true);
        let value = serde_json::to_value(&signed).unwrap();

        assert_eq!(value["productKey"], "PK2");
        assert_eq!(value["clientId"], "PK2.sub-1");
        assert_eq!(value["timestamp"], "1000");
        assert_eq!(value["signMethod"], "hmacsha256");
        assert_eq!(value["cleanSession"], "true");
        assert_eq!(
            signed.sign,
            sign(
                SignMethod::HmacSha256,
                "s3cret",
                "clientIdPK2.sub-1deviceNamesub-1productKeyPK2timestamp1000"
            )
        );

        let topo = SignedDevice::new(&identity, SignMethod::HmacSha1, 1000);
        assert!(serde_json::to_value(&topo).unwrap().get("cleanSession").is_none());
    }

    #[test]
    fn topo_change_decoding() {
        let change: TopoChange = serde_json::from_value(json!({
            "status": 8,
            "subList": [{"productKey": "PK2", "deviceName": "a"}]
        }))
        .unwrap();
        assert_eq!(change.status(), Some(TopoChangeStatus::Disabled));
        assert_eq!(change.sub_list, vec![DeviceKey::new("PK2", "a")]);
        assert_eq!(TopoChangeStatus::from_code(3), None);
    }

    #[test]
    fn ntp_server_time() {
        let response = NtpResponse::from_json(
            br#"{"deviceSendTime":"1000","serverRecvTime":"1600","serverSendTime":1610}"#,
        )
        .unwrap();
        // Round trip of 220ms with 10ms server processing: server clock is 1715 at device 1220.
        assert_eq!(response.server_time_ms(1220), 1715);

        let probe = serde_json::to_value(NtpRequest { device_send_time: 1000 }).unwrap();
        assert_eq!(probe["deviceSendTime"], "1000");
    }
}
