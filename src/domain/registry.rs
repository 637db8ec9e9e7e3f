//! Present-device bookkeeping.

use std::collections::HashMap;

use crate::domain::models::{Device, DeviceId};

/// Tracks the devices currently known to be attached, keyed by device id.
///
/// A device id is present exactly when an attach event has been observed with
/// no subsequent detach for that id. Pure in-memory map; mutated only by the
/// presence-event handlers.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
}

impl DeviceRegistry {
    /// Insert or overwrite the entry for `device.id`. Idempotent.
    pub fn record(&mut self, device: Device) {
        self.devices.insert(device.id, device);
    }

    /// Delete the entry if present; no-op otherwise.
    pub fn remove(&mut self, id: DeviceId) {
        self.devices.remove(&id);
    }

    /// Any present device id, or `None` when the registry is empty.
    ///
    /// The tie-break among several present devices is deliberately
    /// unspecified: the bridge does not prioritize among attached devices.
    pub fn first_present(&self) -> Option<DeviceId> {
        self.devices.keys().next().copied()
    }

    /// Number of devices currently present.
    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: DeviceId) -> Device {
        Device {
            id,
            serial: format!("SER{id:04}"),
            product_id: None,
            location: None,
        }
    }

    #[test]
    fn test_present_set_tracks_attach_and_detach() {
        let mut registry = DeviceRegistry::default();
        assert_eq!(registry.first_present(), None);
        assert_eq!(registry.len(), 0);

        registry.record(device(1));
        registry.record(device(2));
        assert_eq!(registry.len(), 2);

        registry.remove(1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.first_present(), Some(2));

        registry.remove(2);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.first_present(), None);
    }

    #[test]
    fn test_record_overwrites_same_id() {
        let mut registry = DeviceRegistry::default();
        registry.record(device(5));
        let mut updated = device(5);
        updated.serial = "OTHER".to_string();
        registry.record(updated);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut registry = DeviceRegistry::default();
        registry.record(device(3));
        registry.remove(99);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.first_present(), Some(3));
    }

    #[test]
    fn test_first_present_returns_some_present_device() {
        let mut registry = DeviceRegistry::default();
        registry.record(device(10));
        registry.record(device(20));
        registry.record(device(30));
        let picked = registry.first_present().unwrap();
        assert!([10, 20, 30].contains(&picked));
    }
}
