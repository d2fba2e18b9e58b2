//! # Alink Core
//!
//! Device-side state shared by every part of the Alink client.
//!
//! This crate provides:
//! - Device identity (`productKey`, `deviceName`, `deviceSecret`) and registry keys
//! - The sub-device lifecycle state machine
//! - A thread-safe device registry with one reserved root device
//! - HMAC credential signing for topology, login, and MQTT connect

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod identity;
pub mod registry;
pub mod sign;
pub mod state;

pub use identity::{DeviceIdentity, DeviceKey};
pub use registry::{DeviceRecord, DeviceRegistry, RegistryError};
pub use sign::{canonical_content, sign, MqttCredentials, SignError, SignMethod};
pub use state::LifecycleState;
