//! Gateway topology manager.
//!
//! Drives sub-devices through register → topology-add → combine-login →
//! subscribe, and back out again. Each step is one round trip and only runs
//! when the registry shows the device has not reached it yet, so a failed
//! connect resumes where it stopped.

use crate::error::{ClientResult, Error, Step};
use crate::session::{distinct, Session};
use alink_core::sign::now_ms;
use alink_core::{DeviceIdentity, DeviceKey, DeviceRecord, LifecycleState};
use alink_proto::{ops, SignedDevice};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// One entry of a `thing.sub.register` reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisteredDevice {
    product_key: String,
    device_name: String,
    #[serde(default)]
    device_secret: String,
}

impl RegisteredDevice {
    fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.product_key, &self.device_name)
    }
}

/// Sub-device lifecycle driver on top of a [`Session`].
#[derive(Debug, Clone)]
pub struct Gateway {
    session: Session,
}

impl Gateway {
    /// Wrap a session.
    ///
    /// # Errors
    ///
    /// Returns `NotSupportedFeature` if the session has the gateway feature
    /// disabled.
    pub fn new(session: Session) -> ClientResult<Self> {
        session.require_gateway()?;
        Ok(Self { session })
    }

    /// Underlying session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Track a new sub-device in state `Unauthorized`.
    ///
    /// # Errors
    ///
    /// Returns error for a malformed, duplicate or root key.
    pub fn add_sub_device(&self, identity: DeviceIdentity) -> ClientResult<()> {
        self.session.registry().add(identity)?;
        Ok(())
    }

    /// Bring one sub-device online, resuming from its current state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an untracked device, or an [`Error::Step`]
    /// naming the step that failed. The device keeps the last state reached.
    pub async fn sub_device_connect(
        &self,
        device: &DeviceKey,
        clean_session: bool,
        timeout: Duration,
    ) -> ClientResult<()> {
        let record = self.record(device)?;

        if record.state < LifecycleState::Registered || !record.identity.has_secret() {
            self.register(std::slice::from_ref(device), timeout)
                .await
                .map_err(Error::at(Step::Register))?;
        }

        if self.record(device)?.state < LifecycleState::Attached {
            self.topology_add(std::slice::from_ref(device), timeout)
                .await
                .map_err(Error::at(Step::TopologyAdd))?;
        }

        if self.record(device)?.state < LifecycleState::Logined {
            self.session
                .combine_login(device, clean_session, timeout)
                .await
                .map_err(Error::at(Step::Login))?;
        }

        if self.record(device)?.state < LifecycleState::Online {
            self.session
                .subscribe_device(device)
                .await
                .map_err(Error::at(Step::Subscribe))?;
            self.session
                .raise_state(device, LifecycleState::Online)
                .map_err(Error::at(Step::Subscribe))?;
        }

        tracing::info!(device = %device, "Sub-device online");
        Ok(())
    }

    /// Bring several sub-devices online with one request per step.
    ///
    /// Each step covers every device that still needs it, and the registry
    /// only advances once the whole step has succeeded.
    ///
    /// # Errors
    ///
    /// As [`Gateway::sub_device_connect`].
    pub async fn sub_devices_connect(
        &self,
        devices: &[DeviceKey],
        clean_session: bool,
        timeout: Duration,
    ) -> ClientResult<()> {
        let devices = &distinct(devices);
        let unregistered = self.behind(devices, LifecycleState::Registered, true)?;
        if !unregistered.is_empty() {
            self.register(&unregistered, timeout)
                .await
                .map_err(Error::at(Step::Register))?;
        }

        let detached = self.behind(devices, LifecycleState::Attached, false)?;
        if !detached.is_empty() {
            self.topology_add(&detached, timeout)
                .await
                .map_err(Error::at(Step::TopologyAdd))?;
        }

        let logged_out = self.behind(devices, LifecycleState::Logined, false)?;
        if !logged_out.is_empty() {
            self.session
                .combine_batch_login(&logged_out, clean_session, timeout)
                .await
                .map_err(Error::at(Step::Login))?;
        }

        let offline = self.behind(devices, LifecycleState::Online, false)?;
        for device in &offline {
            self.session
                .subscribe_device(device)
                .await
                .map_err(Error::at(Step::Subscribe))?;
        }
        self.session
            .registry()
            .set_states(&offline, LifecycleState::Online)
            .map_err(|err| Error::at(Step::Subscribe)(err.into()))?;

        tracing::info!(count = devices.len(), "Sub-devices online");
        Ok(())
    }

    /// Unsubscribe a sub-device and log it out. The device ends `Attached`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or an [`Error::Step`].
    pub async fn sub_device_disconnect(&self, device: &DeviceKey, timeout: Duration) -> ClientResult<()> {
        let record = self.record(device)?;

        if record.state >= LifecycleState::Online {
            self.session
                .unsubscribe_device(device)
                .await
                .map_err(Error::at(Step::Unsubscribe))?;
            self.session
                .lower_state(device, LifecycleState::Logined)
                .map_err(Error::at(Step::Unsubscribe))?;
        }
        if record.state >= LifecycleState::Logined {
            self.session
                .combine_logout(device, timeout)
                .await
                .map_err(Error::at(Step::Logout))?;
        }
        Ok(())
    }

    /// Disconnect if needed, then delete the topology relation. The device
    /// ends `Registered`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or an [`Error::Step`].
    pub async fn sub_device_detach(&self, device: &DeviceKey, timeout: Duration) -> ClientResult<()> {
        self.sub_device_disconnect(device, timeout).await?;

        if self.record(device)?.state >= LifecycleState::Attached {
            let params = json!([device]);
            self.session
                .call(&ops::TOPO_DELETE, &self.root(), params, timeout)
                .await
                .map_err(Error::at(Step::TopologyDelete))?;
            self.session
                .lower_state(device, LifecycleState::Registered)
                .map_err(Error::at(Step::TopologyDelete))?;
            tracing::info!(device = %device, "Sub-device detached");
        }
        Ok(())
    }

    /// Detach a sub-device and forget it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or an [`Error::Step`]; the record is kept on error.
    pub async fn sub_device_remove(&self, device: &DeviceKey, timeout: Duration) -> ClientResult<()> {
        self.sub_device_detach(device, timeout).await?;
        self.session.registry().delete(device)?;
        Ok(())
    }

    /// Sub-devices the platform lists under this gateway.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or `Decode` for an unexpected reply body.
    pub async fn topology_get(&self, timeout: Duration) -> ClientResult<Vec<DeviceKey>> {
        let data = self
            .session
            .call(&ops::TOPO_GET, &self.root(), json!({}), timeout)
            .await?;
        serde_json::from_value(data).map_err(|e| Error::Decode(e.to_string()))
    }

    async fn register(&self, devices: &[DeviceKey], timeout: Duration) -> ClientResult<()> {
        let data = self
            .session
            .call(&ops::SUB_REGISTER, &self.root(), devices, timeout)
            .await?;
        let registered: Vec<RegisteredDevice> =
            serde_json::from_value(data).map_err(|e| Error::Decode(e.to_string()))?;

        // Every device needs its secret before any record changes.
        let mut secrets = Vec::with_capacity(devices.len());
        for device in devices {
            let secret = registered
                .iter()
                .find(|entry| entry.key() == *device)
                .map(|entry| entry.device_secret.as_str())
                .filter(|secret| !secret.is_empty())
                .ok_or_else(|| Error::Decode(format!("no device secret returned for {device}")))?;
            secrets.push((device, secret));
        }
        for (device, secret) in secrets {
            self.session.registry().complete_registration(device, secret)?;
        }
        Ok(())
    }

    async fn topology_add(&self, devices: &[DeviceKey], timeout: Duration) -> ClientResult<()> {
        let method = self.session.config().sign_method;
        let timestamp = now_ms();
        let signed = devices
            .iter()
            .map(|device| {
                let record = self.record(device)?;
                Ok(SignedDevice::new(&record.identity, method, timestamp))
            })
            .collect::<ClientResult<Vec<_>>>()?;

        self.session
            .call(&ops::TOPO_ADD, &self.root(), &signed, timeout)
            .await?;

        let behind = self.behind(devices, LifecycleState::Attached, false)?;
        self.session
            .registry()
            .set_states(&behind, LifecycleState::Attached)?;
        tracing::info!(count = devices.len(), "Topology added");
        Ok(())
    }

    fn record(&self, device: &DeviceKey) -> ClientResult<DeviceRecord> {
        if self.session.registry().is_root(device) {
            return Err(Error::InvalidParameter(format!(
                "{device} is the gateway, not a sub-device"
            )));
        }
        self.session
            .registry()
            .get(device)
            .ok_or_else(|| Error::NotFound(device.clone()))
    }

    /// Devices below `state`, or lacking a secret when `need_secret` is set.
    fn behind(
        &self,
        devices: &[DeviceKey],
        state: LifecycleState,
        need_secret: bool,
    ) -> ClientResult<Vec<DeviceKey>> {
        let mut keys = Vec::new();
        for device in devices {
            let record = self.record(device)?;
            if record.state < state || (need_secret && !record.identity.has_secret()) {
                keys.push(device.clone());
            }
        }
        Ok(keys)
    }

    fn root(&self) -> DeviceKey {
        self.session.registry().root_key().clone()
    }
}

/// Parse a list of sub-devices from `[{productKey, deviceName, deviceSecret?}]`.
///
/// # Errors
///
/// Returns `InvalidParameter` if the JSON does not match.
pub fn parse_sub_devices(value: Value) -> ClientResult<Vec<DeviceIdentity>> {
    serde_json::from_value(value).map_err(|e| Error::InvalidParameter(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_reply_entries() {
        let entries: Vec<RegisteredDevice> = serde_json::from_value(json!([
            {"iotId": "x", "productKey": "PK2", "deviceName": "a", "deviceSecret": "s"},
            {"productKey": "PK2", "deviceName": "b"}
        ]))
        .unwrap();
        assert_eq!(entries[0].key(), DeviceKey::new("PK2", "a"));
        assert_eq!(entries[0].device_secret, "s");
        assert!(entries[1].device_secret.is_empty());
    }

    #[test]
    fn sub_device_list_parsing() {
        let devices = parse_sub_devices(json!([
            {"productKey": "PK2", "deviceName": "a", "deviceSecret": "s"},
            {"productKey": "PK2", "deviceName": "b"}
        ]))
        .unwrap();
        assert!(devices[0].has_secret());
        assert!(!devices[1].has_secret());
        assert!(parse_sub_devices(json!({"productKey": "PK2"})).is_err());
    }
}
