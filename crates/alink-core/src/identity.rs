//! Device identity triad and registry key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one logical device by `(productKey, deviceName)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKey {
    /// Product the device belongs to
    pub product_key: String,
    /// Device name, unique within the product
    pub device_name: String,
}

impl DeviceKey {
    /// Create a new key.
    #[must_use]
    pub fn new(product_key: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            product_key: product_key.into(),
            device_name: device_name.into(),
        }
    }

    /// Both halves are non-empty and contain no topic separator.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        valid_segment(&self.product_key) && valid_segment(&self.device_name)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.product_key, self.device_name)
    }
}

fn valid_segment(value: &str) -> bool {
    !value.is_empty() && !value.contains(['/', '+', '#'])
}

/// The `productKey` / `deviceName` / `deviceSecret` triad.
///
/// `device_secret` stays empty until dynamic registration returns one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Product the device belongs to
    pub product_key: String,
    /// Device name, unique within the product
    pub device_name: String,
    /// Shared secret used for signing (may be empty)
    #[serde(default)]
    pub device_secret: String,
}

impl DeviceIdentity {
    /// Create an identity with a known secret.
    #[must_use]
    pub fn new(
        product_key: impl Into<String>,
        device_name: impl Into<String>,
        device_secret: impl Into<String>,
    ) -> Self {
        Self {
            product_key: product_key.into(),
            device_name: device_name.into(),
            device_secret: device_secret.into(),
        }
    }

    /// Create an identity that still has to be registered dynamically.
    #[must_use]
    pub fn unregistered(product_key: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self::new(product_key, device_name, String::new())
    }

    /// Registry key for this identity.
    #[must_use]
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.product_key, &self.device_name)
    }

    /// Whether a secret is present.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        !self.device_secret.is_empty()
    }
}
