//! Session client: correlated calls over one physical connection.

use crate::correlation::{CorrelationTable, DEFAULT_GRACE};
use crate::error::{ClientResult, Error};
use crate::handlers::{HandlerTable, PushEvent};
use crate::ids::RequestIds;
use crate::transport::{Qos, Transport};
use alink_core::sign::now_ms;
use alink_core::{DeviceIdentity, DeviceKey, DeviceRecord, DeviceRegistry, LifecycleState, SignMethod};
use alink_proto::messages::SESSION_ERROR_CODE;
use alink_proto::{ops, NtpRequest, Operation, PushKind, Request, RequestId, SignedDevice, TopicLayout};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Optional capabilities of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// Sub-device topology and combine-login
    pub gateway: bool,
    /// NTP clock synchronisation
    pub ntp: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            gateway: true,
            ntp: true,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout used by internal calls and remediation
    pub request_timeout: Duration,
    /// Extra time a pending entry survives past its call's timeout
    pub grace: Duration,
    /// How often abandoned pending entries are swept
    pub sweep_interval: Duration,
    /// Signing algorithm for topology and login
    pub sign_method: SignMethod,
    /// Override of the transport's topic layout
    pub layout: Option<TopicLayout>,
    /// Enabled capabilities
    pub features: Features,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            grace: DEFAULT_GRACE,
            sweep_interval: Duration::from_secs(1),
            sign_method: SignMethod::default(),
            layout: None,
            features: Features::default(),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: DeviceRegistry,
    pub(crate) layout: TopicLayout,
    pub(crate) ids: RequestIds,
    pub(crate) pending: CorrelationTable,
    pub(crate) handlers: HandlerTable,
    logins: DashMap<DeviceKey, ()>,
    pub(crate) config: SessionConfig,
}

/// Client façade for one physical connection. Cloning shares the session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<Inner>,
}

impl Session {
    /// Create a session for the root device reachable over `transport`.
    ///
    /// # Panics
    ///
    /// Panics if the root identity is malformed (see [`DeviceRegistry::new`]).
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, root: DeviceIdentity, config: SessionConfig) -> Self {
        let layout = config.layout.clone().unwrap_or_else(|| transport.layout());
        let registry = DeviceRegistry::new(root);

        tracing::info!(
            root = %registry.root_key(),
            offset = layout.offset(),
            gateway = config.features.gateway,
            "Session created"
        );

        Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                layout,
                ids: RequestIds::new(),
                pending: CorrelationTable::new(config.grace),
                handlers: HandlerTable::default(),
                logins: DashMap::new(),
                config,
            }),
        }
    }

    /// Device registry shared with the gateway.
    #[must_use]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Active topic layout.
    #[must_use]
    pub fn layout(&self) -> &TopicLayout {
        &self.inner.layout
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Outstanding correlated requests.
    #[must_use]
    pub fn pending(&self) -> &CorrelationTable {
        &self.inner.pending
    }

    /// Allocate a request id.
    #[must_use]
    pub fn next_request_id(&self) -> RequestId {
        self.inner.ids.next_id()
    }

    /// Register the handler for a push kind, replacing any previous one.
    pub fn on<F>(&self, kind: PushKind, handler: F)
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.inner.handlers.register(kind, Arc::new(handler));
    }

    /// Spawn the periodic sweeper for abandoned pending entries.
    ///
    /// The task ends once every handle to the session is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = inner.pending.sweep();
                if evicted > 0 {
                    tracing::warn!(evicted, "Swept unanswered requests");
                }
            }
        })
    }

    /// Correlated request with qos 1.
    ///
    /// # Errors
    ///
    /// See [`Session::call_with_qos`].
    pub async fn call<P>(
        &self,
        op: &Operation,
        device: &DeviceKey,
        params: P,
        timeout: Duration,
    ) -> ClientResult<Value>
    where
        P: Serialize + Send,
    {
        self.call_with_qos(op, device, Qos::AtLeastOnce, params, timeout)
            .await
    }

    /// Publish `params` as `op` for `device` and wait for the reply.
    ///
    /// Sub-devices must be active. A session-error reply for a sub-device
    /// triggers one combine-login before the original error is returned.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`/`NotAvailable`/`NotActive` for an unusable device,
    /// `Transport` if the publish fails, `Timeout` when no reply arrives, and
    /// `Remote` when the platform rejects the request.
    pub async fn call_with_qos<P>(
        &self,
        op: &Operation,
        device: &DeviceKey,
        qos: Qos,
        params: P,
        timeout: Duration,
    ) -> ClientResult<Value>
    where
        P: Serialize + Send,
    {
        self.check_target(device)?;
        let result = self.request(op, device, qos, params, timeout).await;

        if let Err(Error::Remote { code, .. }) = &result {
            if *code == SESSION_ERROR_CODE && !self.registry().is_root(device) {
                self.remediate(device).await;
            }
        }
        result
    }

    /// Publish without correlation.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the publish.
    pub async fn publish(&self, topic: &str, qos: Qos, payload: Vec<u8>) -> ClientResult<()> {
        tracing::trace!(topic, qos = ?qos, payload_len = payload.len(), "Publishing");
        self.inner
            .transport
            .publish(topic, qos, payload)
            .await
            .map_err(Error::from)
    }

    /// Report properties for a device.
    ///
    /// # Errors
    ///
    /// See [`Session::call_with_qos`].
    pub async fn post_properties(
        &self,
        device: &DeviceKey,
        properties: Value,
        timeout: Duration,
    ) -> ClientResult<Value> {
        self.call(&ops::PROPERTY_POST, device, properties, timeout)
            .await
    }

    /// Report an event for a device.
    ///
    /// # Errors
    ///
    /// See [`Session::call_with_qos`].
    pub async fn post_event(
        &self,
        device: &DeviceKey,
        identifier: &str,
        value: Value,
        timeout: Duration,
    ) -> ClientResult<Value> {
        if identifier.is_empty() || identifier.contains(['/', '+', '#']) {
            return Err(Error::InvalidParameter(format!(
                "invalid event identifier '{identifier}'"
            )));
        }
        let params = json!({ "value": value, "time": now_ms() });
        self.call(&Operation::event_post(identifier), device, params, timeout)
            .await
    }

    /// Fetch the device's remote configuration descriptor.
    ///
    /// # Errors
    ///
    /// See [`Session::call_with_qos`].
    pub async fn get_config(&self, device: &DeviceKey, timeout: Duration) -> ClientResult<Value> {
        let params = json!({ "configScope": "product", "getType": "file" });
        self.call(&ops::CONFIG_GET, device, params, timeout).await
    }

    /// Send an NTP probe for the root device (qos 0, uncorrelated).
    ///
    /// The answer arrives as a [`PushKind::NtpResponse`] push.
    ///
    /// # Errors
    ///
    /// Returns `NotSupportedFeature` when NTP is disabled, or a transport error.
    pub async fn request_ntp(&self) -> ClientResult<()> {
        if !self.inner.config.features.ntp {
            return Err(Error::NotSupportedFeature("ntp"));
        }
        let topic = self
            .layout()
            .topic(&ops::NTP_REQUEST, self.registry().root_key());
        let payload = serde_json::to_vec(&NtpRequest {
            device_send_time: now_ms(),
        })
        .map_err(|e| Error::InvalidParameter(e.to_string()))?;
        self.publish(&topic, Qos::AtMostOnce, payload).await
    }

    /// Bind a sub-device's session to this connection.
    ///
    /// Published with qos 0; at most one attempt per device runs at a time.
    /// On success the device moves to `Logined` (or stays further along).
    ///
    /// # Errors
    ///
    /// Returns `LoginInProgress` if another attempt is running, `NotFound`
    /// for an unknown device, `InvalidParameter` without a device secret, or
    /// the call's error.
    pub async fn combine_login(
        &self,
        device: &DeviceKey,
        clean_session: bool,
        timeout: Duration,
    ) -> ClientResult<()> {
        self.require_gateway()?;
        let _guard = LoginGuard::acquire(&self.inner.logins, std::slice::from_ref(device))?;

        let record = self
            .registry()
            .get(device)
            .ok_or_else(|| Error::NotFound(device.clone()))?;
        check_login_ready(device, &record)?;

        let params = SignedDevice::new(&record.identity, self.inner.config.sign_method, now_ms())
            .with_clean_session(clean_session);
        let root = self.registry().root_key().clone();
        self.request(&ops::COMBINE_LOGIN, &root, Qos::AtMostOnce, params, timeout)
            .await?;

        self.raise_state(device, LifecycleState::Logined)?;
        tracing::info!(device = %device, "Sub-device logged in");
        Ok(())
    }

    /// Log in several sub-devices with one request; all or nothing.
    ///
    /// # Errors
    ///
    /// As [`Session::combine_login`]; no device changes state on error.
    pub async fn combine_batch_login(
        &self,
        devices: &[DeviceKey],
        clean_session: bool,
        timeout: Duration,
    ) -> ClientResult<()> {
        self.require_gateway()?;
        let devices = distinct(devices);
        if devices.is_empty() {
            return Ok(());
        }
        let _guard = LoginGuard::acquire(&self.inner.logins, &devices)?;

        let timestamp = now_ms();
        let mut device_list = Vec::with_capacity(devices.len());
        for device in &devices {
            let record = self
                .registry()
                .get(device)
                .ok_or_else(|| Error::NotFound(device.clone()))?;
            check_login_ready(device, &record)?;
            device_list.push(
                SignedDevice::new(&record.identity, self.inner.config.sign_method, timestamp)
                    .with_clean_session(clean_session),
            );
        }

        let root = self.registry().root_key().clone();
        let params = json!({ "deviceList": device_list });
        self.request(&ops::COMBINE_BATCH_LOGIN, &root, Qos::AtMostOnce, params, timeout)
            .await?;

        let behind: Vec<DeviceKey> = devices
            .iter()
            .filter(|key| {
                self.registry()
                    .get(key)
                    .is_some_and(|record| record.state < LifecycleState::Logined)
            })
            .cloned()
            .collect();
        self.registry().set_states(&behind, LifecycleState::Logined)?;
        tracing::info!(count = devices.len(), "Sub-devices logged in");
        Ok(())
    }

    /// Unbind a sub-device's session. The device drops back to `Attached`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown device, or the call's error.
    pub async fn combine_logout(&self, device: &DeviceKey, timeout: Duration) -> ClientResult<()> {
        self.require_gateway()?;
        if !self.registry().contains(device) {
            return Err(Error::NotFound(device.clone()));
        }

        let root = self.registry().root_key().clone();
        self.request(&ops::COMBINE_LOGOUT, &root, Qos::AtMostOnce, device, timeout)
            .await?;

        self.lower_state(device, LifecycleState::Attached)?;
        tracing::info!(device = %device, "Sub-device logged out");
        Ok(())
    }

    /// Subscribe to a device's reply and push topics.
    ///
    /// # Errors
    ///
    /// Returns the first transport error.
    pub async fn subscribe_device(&self, device: &DeviceKey) -> ClientResult<()> {
        let topics = if self.registry().is_root(device) && self.inner.config.features.gateway {
            self.layout().gateway_subscriptions(device)
        } else {
            self.layout().device_subscriptions(device)
        };
        for topic in &topics {
            self.inner
                .transport
                .subscribe(topic, Qos::AtLeastOnce)
                .await?;
        }
        tracing::debug!(device = %device, count = topics.len(), "Device topics subscribed");
        Ok(())
    }

    /// Remove a device's subscriptions.
    ///
    /// # Errors
    ///
    /// Returns the transport error.
    pub async fn unsubscribe_device(&self, device: &DeviceKey) -> ClientResult<()> {
        let topics = self.layout().device_subscriptions(device);
        self.inner.transport.unsubscribe(&topics).await?;
        tracing::debug!(device = %device, count = topics.len(), "Device topics unsubscribed");
        Ok(())
    }

    /// Publish a correlated request and wait, without target checks.
    pub(crate) async fn request<P>(
        &self,
        op: &Operation,
        device: &DeviceKey,
        qos: Qos,
        params: P,
        timeout: Duration,
    ) -> ClientResult<Value>
    where
        P: Serialize + Send,
    {
        let id = self.next_request_id();
        let payload = Request::new(id, &op.method, params).to_json()?;
        let topic = self.layout().topic(op, device);

        let waiter = self.inner.pending.register(id, timeout)?;
        if let Err(err) = self.inner.transport.publish(&topic, qos, payload).await {
            self.inner.pending.cancel(id);
            tracing::warn!(%id, topic, error = %err, "Publish failed");
            return Err(err.into());
        }
        tracing::debug!(%id, topic, method = %op.method, "Request sent");

        self.inner.pending.wait(waiter, timeout).await
    }

    /// Re-issue combine-login once after a session error.
    pub(crate) async fn remediate(&self, device: &DeviceKey) {
        let Some(record) = self.registry().get(device) else {
            return;
        };
        if record.state < LifecycleState::Attached {
            return;
        }
        let was_online = record.state == LifecycleState::Online;
        if let Err(err) = self.lower_state(device, LifecycleState::Attached) {
            tracing::warn!(device = %device, error = %err, "Cannot reset state for re-login");
            return;
        }

        let timeout = self.inner.config.request_timeout;
        match self.combine_login(device, false, timeout).await {
            Ok(()) => {
                if was_online {
                    if let Err(err) = self.registry().set_state(device, LifecycleState::Online) {
                        tracing::warn!(device = %device, error = %err, "Cannot restore online state");
                    }
                }
                tracing::info!(device = %device, "Sub-device session restored");
            }
            Err(err) => {
                tracing::warn!(device = %device, error = %err, "Sub-device re-login failed");
            }
        }
    }

    fn check_target(&self, device: &DeviceKey) -> ClientResult<()> {
        if self.registry().is_root(device) {
            return Ok(());
        }
        let record = self
            .registry()
            .get(device)
            .ok_or_else(|| Error::NotFound(device.clone()))?;
        if !record.available {
            return Err(Error::NotAvailable(device.clone()));
        }
        if record.state != LifecycleState::Online {
            return Err(Error::NotActive(device.clone()));
        }
        Ok(())
    }

    pub(crate) fn require_gateway(&self) -> ClientResult<()> {
        if self.inner.config.features.gateway {
            Ok(())
        } else {
            Err(Error::NotSupportedFeature("gateway"))
        }
    }

    pub(crate) fn raise_state(&self, device: &DeviceKey, state: LifecycleState) -> ClientResult<()> {
        let current = self
            .registry()
            .get(device)
            .ok_or_else(|| Error::NotFound(device.clone()))?
            .state;
        if current < state {
            self.registry().set_state(device, state)?;
        }
        Ok(())
    }

    pub(crate) fn lower_state(&self, device: &DeviceKey, state: LifecycleState) -> ClientResult<()> {
        let current = self
            .registry()
            .get(device)
            .ok_or_else(|| Error::NotFound(device.clone()))?
            .state;
        if current > state {
            self.registry().set_state(device, state)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("root", self.registry().root_key())
            .field("pending", &self.pending().len())
            .finish_non_exhaustive()
    }
}

/// `devices` without repeats, first occurrence kept.
pub(crate) fn distinct(devices: &[DeviceKey]) -> Vec<DeviceKey> {
    let mut seen = HashSet::with_capacity(devices.len());
    devices
        .iter()
        .filter(|device| seen.insert(*device))
        .cloned()
        .collect()
}

/// A device may log in only once it has a secret and sits in the topology.
fn check_login_ready(device: &DeviceKey, record: &DeviceRecord) -> ClientResult<()> {
    if !record.identity.has_secret() {
        return Err(Error::InvalidParameter(format!(
            "{device}: no device secret for combine-login"
        )));
    }
    if record.state < LifecycleState::Attached {
        return Err(Error::InvalidParameter(format!(
            "{device}: cannot log in while {}",
            record.state
        )));
    }
    Ok(())
}

/// Marks devices as having a combine-login in flight until dropped.
struct LoginGuard<'a> {
    logins: &'a DashMap<DeviceKey, ()>,
    devices: Vec<DeviceKey>,
}

impl<'a> LoginGuard<'a> {
    fn acquire(logins: &'a DashMap<DeviceKey, ()>, devices: &[DeviceKey]) -> ClientResult<Self> {
        let mut guard = Self {
            logins,
            devices: Vec::with_capacity(devices.len()),
        };
        for device in devices {
            match logins.entry(device.clone()) {
                Entry::Occupied(_) => return Err(Error::LoginInProgress(device.clone())),
                Entry::Vacant(slot) => {
                    slot.insert(());
                    guard.devices.push(device.clone());
                }
            }
        }
        Ok(guard)
    }
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        for device in &self.devices {
            self.logins.remove(device);
        }
    }
}
