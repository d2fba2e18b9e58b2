//! Sub-device lifecycle state machine.
//!
//! Forward order for a sub-device:
//! `Unauthorized → Authorized → Registered → Attached → Logined → Online`.
//! The root device starts and stays at `Online`. Backward moves happen on
//! logout (`Online → Attached`) and topology delete (`Attached → Registered`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a device record.
///
/// Variants are declared in forward order so `Ord` reflects protocol progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Record just created locally
    Unauthorized,
    /// Platform confirmed the gateway may manage this device
    Authorized,
    /// Dynamic registration returned a device secret
    Registered,
    /// Topology-add succeeded
    Attached,
    /// Combine-login succeeded
    Logined,
    /// All device topics are subscribed
    Online,
}

impl LifecycleState {
    /// The state reached after the next successful protocol step.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Unauthorized => Some(Self::Authorized),
            Self::Authorized => Some(Self::Registered),
            Self::Registered => Some(Self::Attached),
            Self::Attached => Some(Self::Logined),
            Self::Logined => Some(Self::Online),
            Self::Online => None,
        }
    }

    /// Short lowercase name, as used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Authorized => "authorized",
            Self::Registered => "registered",
            Self::Attached => "attached",
            Self::Logined => "logined",
            Self::Online => "online",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
