//! Thread-safe device registry.
//!
//! Holds one record per `(productKey, deviceName)`. The root device (owner of
//! the physical connection) is installed at construction, starts `Online`,
//! and can never be re-added or deleted. The lock is only held for map
//! access, never across a network call.

use crate::identity::{DeviceIdentity, DeviceKey};
use crate::state::LifecycleState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A device known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Identity triad; the secret may be filled in later
    pub identity: DeviceIdentity,
    /// Administratively enabled by the platform
    pub available: bool,
    /// Current lifecycle state
    pub state: LifecycleState,
}

impl DeviceRecord {
    fn new(identity: DeviceIdentity, state: LifecycleState) -> Self {
        Self {
            identity,
            available: true,
            state,
        }
    }

    /// Registry key of this record.
    #[must_use]
    pub fn key(&self) -> DeviceKey {
        self.identity.key()
    }

    /// Enabled and fully online.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.available && self.state == LifecycleState::Online
    }
}

/// Shared device registry. Cloning yields another handle to the same store.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    root: DeviceKey,
    devices: Arc<RwLock<HashMap<DeviceKey, DeviceRecord>>>,
}

impl DeviceRegistry {
    /// Create a registry owning the given root device.
    ///
    /// # Panics
    ///
    /// Panics if the root identity has an empty or malformed product key or
    /// device name. The root is static configuration, so this is a
    /// programmer error rather than a runtime condition.
    #[must_use]
    pub fn new(root: DeviceIdentity) -> Self {
        let key = root.key();
        assert!(key.is_valid(), "invalid root device identity: {key}");

        let mut devices = HashMap::new();
        devices.insert(key.clone(), DeviceRecord::new(root, LifecycleState::Online));

        tracing::debug!(root = %key, "Device registry created");

        Self {
            root: key,
            devices: Arc::new(RwLock::new(devices)),
        }
    }

    /// Key of the root device.
    #[must_use]
    pub fn root_key(&self) -> &DeviceKey {
        &self.root
    }

    /// Snapshot of the root device record.
    #[must_use]
    pub fn root(&self) -> DeviceRecord {
        self.devices
            .read()
            .get(&self.root)
            .cloned()
            .unwrap_or_else(|| {
                let identity =
                    DeviceIdentity::unregistered(&self.root.product_key, &self.root.device_name);
                DeviceRecord::new(identity, LifecycleState::Online)
            })
    }

    /// Whether `key` names the root device.
    #[must_use]
    pub fn is_root(&self, key: &DeviceKey) -> bool {
        *key == self.root
    }

    /// Add a sub-device in state `Unauthorized`.
    ///
    /// # Errors
    ///
    /// Returns error if the key is malformed, names the root device, or is
    /// already present. The registry is unchanged on error.
    pub fn add(&self, identity: DeviceIdentity) -> Result<(), RegistryError> {
        let key = self.check_sub_device(&identity.key())?;

        let mut devices = self.devices.write();
        if devices.contains_key(&key) {
            return Err(RegistryError::AlreadyExists(key));
        }
        devices.insert(key.clone(), DeviceRecord::new(identity, LifecycleState::Unauthorized));
        drop(devices);

        tracing::debug!(device = %key, "Sub-device added");
        Ok(())
    }

    /// Insert the device if absent, or raise its state to at least `state`.
    ///
    /// A non-empty secret in `identity` replaces the stored one. Returns the
    /// resulting record.
    ///
    /// # Errors
    ///
    /// Returns error if the key is malformed or names the root device.
    pub fn ensure(
        &self,
        identity: DeviceIdentity,
        state: LifecycleState,
    ) -> Result<DeviceRecord, RegistryError> {
        let key = self.check_sub_device(&identity.key())?;

        let mut devices = self.devices.write();
        let record = devices
            .entry(key)
            .and_modify(|record| {
                if identity.has_secret() {
                    record.identity.device_secret.clone_from(&identity.device_secret);
                }
                if record.state < state {
                    record.state = state;
                }
            })
            .or_insert_with(|| DeviceRecord::new(identity.clone(), state));
        Ok(record.clone())
    }

    /// Remove a sub-device, returning its last record.
    ///
    /// # Errors
    ///
    /// Returns error for the root device or an unknown key.
    pub fn delete(&self, key: &DeviceKey) -> Result<DeviceRecord, RegistryError> {
        if self.is_root(key) {
            return Err(RegistryError::RootDevice(key.clone()));
        }
        let removed = self
            .devices
            .write()
            .remove(key)
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;

        tracing::debug!(device = %key, "Sub-device deleted");
        Ok(removed)
    }

    /// Snapshot of one record. Never mutates the registry.
    #[must_use]
    pub fn get(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.devices.read().get(key).cloned()
    }

    /// Whether a record exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.devices.read().contains_key(key)
    }

    /// Store a device secret.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown key.
    pub fn set_secret(&self, key: &DeviceKey, secret: &str) -> Result<(), RegistryError> {
        self.update(key, |record| {
            record.identity.device_secret = secret.to_string();
        })
    }

    /// Mark a device administratively enabled or disabled.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown key.
    pub fn set_available(&self, key: &DeviceKey, available: bool) -> Result<(), RegistryError> {
        self.update(key, |record| record.available = available)?;
        tracing::info!(device = %key, available, "Device availability changed");
        Ok(())
    }

    /// Set the lifecycle state, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown key.
    pub fn set_state(
        &self,
        key: &DeviceKey,
        state: LifecycleState,
    ) -> Result<LifecycleState, RegistryError> {
        let mut previous = state;
        self.update(key, |record| {
            previous = record.state;
            record.state = state;
        })?;
        if previous != state {
            tracing::info!(device = %key, from = %previous, to = %state, "Lifecycle transition");
        }
        Ok(previous)
    }

    /// Set the same state on every key in one transaction, returning each
    /// key that moved with its previous state.
    ///
    /// # Errors
    ///
    /// Returns error if any key is unknown; no record is changed in that case.
    pub fn set_states(
        &self,
        keys: &[DeviceKey],
        state: LifecycleState,
    ) -> Result<Vec<(DeviceKey, LifecycleState)>, RegistryError> {
        let mut devices = self.devices.write();
        if let Some(missing) = keys.iter().find(|key| !devices.contains_key(*key)) {
            return Err(RegistryError::NotFound(missing.clone()));
        }
        let mut moved = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = devices.get_mut(key) {
                if record.state != state {
                    moved.push((key.clone(), record.state));
                }
                record.state = state;
            }
        }
        drop(devices);

        for (key, previous) in &moved {
            tracing::info!(device = %key, from = %previous, to = %state, "Lifecycle transition");
        }
        Ok(moved)
    }

    /// Store the secret returned by dynamic registration and move the device
    /// to `Registered`, as a single transaction.
    ///
    /// A device already past `Registered` keeps its state.
    ///
    /// # Errors
    ///
    /// Returns error for an empty secret or an unknown key.
    pub fn complete_registration(&self, key: &DeviceKey, secret: &str) -> Result<(), RegistryError> {
        if secret.is_empty() {
            return Err(RegistryError::InvalidParameter(format!(
                "{key}: empty device secret"
            )));
        }
        self.update(key, |record| {
            record.identity.device_secret = secret.to_string();
            if record.state < LifecycleState::Registered {
                record.state = LifecycleState::Registered;
            }
        })?;
        tracing::info!(device = %key, "Sub-device registered");
        Ok(())
    }

    /// `available && state == Online`. Unknown devices are inactive.
    #[must_use]
    pub fn is_active(&self, key: &DeviceKey) -> bool {
        self.devices
            .read()
            .get(key)
            .is_some_and(DeviceRecord::is_active)
    }

    /// Snapshot of every sub-device, ordered by key.
    #[must_use]
    pub fn sub_devices(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self
            .devices
            .read()
            .values()
            .filter(|record| record.key() != self.root)
            .cloned()
            .collect();
        records.sort_by_key(DeviceRecord::key);
        records
    }

    /// Number of records, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Always false: the root record is never removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    fn check_sub_device(&self, key: &DeviceKey) -> Result<DeviceKey, RegistryError> {
        if !key.is_valid() {
            return Err(RegistryError::InvalidParameter(format!(
                "malformed device key '{key}'"
            )));
        }
        if self.is_root(key) {
            return Err(RegistryError::RootDevice(key.clone()));
        }
        Ok(key.clone())
    }

    fn update(
        &self,
        key: &DeviceKey,
        apply: impl FnOnce(&mut DeviceRecord),
    ) -> Result<(), RegistryError> {
        let mut devices = self.devices.write();
        let record = devices
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
        apply(record);
        Ok(())
    }
}

/// Errors for registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Malformed caller input
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The root device cannot be added or deleted as a sub-device
    #[error("{0} is the root device")]
    RootDevice(DeviceKey),
    /// A record already exists for this key
    #[error("device {0} already exists")]
    AlreadyExists(DeviceKey),
    /// No record for this key
    #[error("device {0} not found")]
    NotFound(DeviceKey),
}
