//! One-time memory registration shared across broker instances.
//!
//! Worker threads each run their own broker but share one device and one
//! registered region. The registry keys registrations by device index so
//! that whichever broker initializes first performs the registration and
//! every later one reuses it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::arena::BackingRegion;
use crate::error::{Error, Result};
use crate::transport::{full_access, RdmaTransport};

/// Proof that the backing region is registered on a device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceHandle {
    /// Index of the device the region is registered on.
    pub device_index: usize,
    /// Memory id the region is registered under.
    pub memory_id: u64,
}

struct Registration {
    memory_id: u64,
    region: BackingRegion,
}

/// Per-process registry of registered devices.
///
/// Brokers sharing a device must share one registry instance (clone the
/// `Arc` it lives in). The first `ensure_registered` call for a device
/// registers the region; later calls verify they name the same region and
/// return the existing registration.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<usize, Registration>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `region` on `device_index` under `memory_id`, or return
    /// the registration a previous broker already made.
    ///
    /// Fails with [`Error::RegistrationFailed`] if the device already
    /// carries a registration for a different region.
    pub fn ensure_registered<T: RdmaTransport>(
        &self,
        transport: &T,
        device_index: usize,
        memory_id: u64,
        region: BackingRegion,
    ) -> Result<DeviceHandle> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(existing) = devices.get(&device_index) {
            if existing.region != region {
                return Err(Error::RegistrationFailed(memory_id));
            }
            tracing::debug!(device_index, memory_id = existing.memory_id, "region already registered");
            return Ok(DeviceHandle {
                device_index,
                memory_id: existing.memory_id,
            });
        }

        transport.register_memory(memory_id, region.base, region.len, full_access())?;
        tracing::debug!(device_index, memory_id, len = region.len, "registered region");
        devices.insert(device_index, Registration { memory_id, region });
        Ok(DeviceHandle {
            device_index,
            memory_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackFabric;

    #[test]
    fn test_first_registration_wins() {
        let fabric = LoopbackFabric::new();
        let transport = fabric.transport();
        let registry = DeviceRegistry::new();
        let region = BackingRegion {
            base: 0x1000,
            len: 4096,
        };

        let first = registry
            .ensure_registered(&transport, 0, 7, region)
            .unwrap();
        assert_eq!(first.memory_id, 7);

        // A second broker on the same device reuses the first memory id.
        let second = registry
            .ensure_registered(&transport, 0, 9, region)
            .unwrap();
        assert_eq!(second.memory_id, 7);
    }

    #[test]
    fn test_conflicting_region_rejected() {
        let fabric = LoopbackFabric::new();
        let transport = fabric.transport();
        let registry = DeviceRegistry::new();

        registry
            .ensure_registered(
                &transport,
                0,
                1,
                BackingRegion {
                    base: 0x1000,
                    len: 4096,
                },
            )
            .unwrap();
        let err = registry.ensure_registered(
            &transport,
            0,
            1,
            BackingRegion {
                base: 0x2000,
                len: 4096,
            },
        );
        assert!(matches!(err, Err(Error::RegistrationFailed(1))));
    }

    #[test]
    fn test_distinct_devices_register_independently() {
        let fabric = LoopbackFabric::new();
        let transport = fabric.transport();
        let registry = DeviceRegistry::new();

        let a = registry
            .ensure_registered(
                &transport,
                0,
                1,
                BackingRegion {
                    base: 0x1000,
                    len: 4096,
                },
            )
            .unwrap();
        let b = registry
            .ensure_registered(
                &transport,
                1,
                2,
                BackingRegion {
                    base: 0x2000,
                    len: 4096,
                },
            )
            .unwrap();
        assert_eq!(a.memory_id, 1);
        assert_eq!(b.memory_id, 2);
    }
}
