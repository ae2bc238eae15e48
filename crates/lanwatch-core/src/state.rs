//! Device state store.
//!
//! The single source of truth for discovered devices. Writers (the scan
//! loop) upsert observations; readers (renderers) take snapshots. One
//! readers-writer lock guards the device map, the listener list, and the
//! selection. Listeners are copied under the lock and invoked after it has
//! been released, so a listener may call back into the store.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::Device;

/// Callback invoked with the merged record after every successful upsert.
pub type Listener = Arc<dyn Fn(&Device) + Send + Sync>;

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    selected_ip: Option<String>,
    listeners: Vec<Listener>,
}

/// Concurrent, deduplicating store of devices keyed by IP.
#[derive(Default)]
pub struct DeviceStore {
    inner: RwLock<Inner>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked whenever a device is upserted.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&Device) + Send + Sync + 'static,
    {
        self.write().listeners.push(Arc::new(listener));
    }

    /// Merge `device` into the canonical record for its IP.
    ///
    /// Returns the merged record, or `None` when the observation carries no
    /// usable IP (in which case nothing changes and no listener fires).
    pub fn upsert(&self, device: Device) -> Option<Device> {
        if !device.has_ip() {
            tracing::trace!(device = ?device, "Ignoring device without an IP");
            return None;
        }

        let (updated, listeners) = {
            let mut inner = self.write();
            let updated = match inner.devices.entry(device.key()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().merge(&device);
                    entry.get().clone()
                }
                Entry::Vacant(entry) => {
                    tracing::debug!(ip = %device.ip, "New device discovered");
                    entry.insert(device).clone()
                }
            };
            (updated, inner.listeners.clone())
        };

        for listener in &listeners {
            listener(&updated);
        }

        Some(updated)
    }

    /// Independent copy of every device, ordered by IP.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.read().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.ip.cmp(&b.ip));
        devices
    }

    pub fn get(&self, ip: &str) -> Option<Device> {
        self.read().devices.get(ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().devices.is_empty()
    }

    /// Remember which device the user has selected. An empty string clears it.
    pub fn set_selected_ip(&self, ip: &str) {
        self.write().selected_ip = Some(ip.to_string()).filter(|ip| !ip.is_empty());
    }

    pub fn selected_ip(&self) -> Option<String> {
        self.read().selected_ip.clone()
    }

    /// The currently selected device, if one is selected and known.
    pub fn selected(&self) -> Option<Device> {
        let inner = self.read();
        let ip = inner.selected_ip.as_ref()?;
        inner.devices.get(ip).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
