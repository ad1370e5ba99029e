//! Device registry.
//!
//! Owns every [`Device`] created during a probe. Drivers borrow devices from
//! the registry; nothing is leaked or kept alive elsewhere.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::bus::{Bus, FunctionAddress, FunctionInfo, Platform, VirtioDeviceType};
use crate::config::TransportConfig;
use crate::device::Device;
use crate::error::TransportError;

/// Probed VirtIO devices keyed by function address.
#[derive(Default)]
pub struct DeviceRegistry {
    /// Bound devices
    devices: HashMap<FunctionAddress, Device>,
    /// Latest bind error per function that could not be bound
    failures: HashMap<FunctionAddress, TransportError>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a device to every VirtIO function accepted by `predicate`.
    ///
    /// A function that cannot be bound is recorded in
    /// [`failures`](Self::failures), replacing any earlier error for it, and
    /// the probe moves on. Returns the
    /// number of devices added.
    pub fn probe(
        &mut self,
        bus: &dyn Bus,
        platform: &Arc<dyn Platform>,
        predicate: impl Fn(&FunctionInfo) -> bool,
    ) -> usize {
        self.probe_with_config(bus, platform, TransportConfig::default(), predicate)
    }

    /// [`probe`](Self::probe) with explicit transport tunables.
    pub fn probe_with_config(
        &mut self,
        bus: &dyn Bus,
        platform: &Arc<dyn Platform>,
        config: TransportConfig,
        predicate: impl Fn(&FunctionInfo) -> bool,
    ) -> usize {
        let functions = bus.enumerate(&|info| info.is_virtio() && predicate(info));
        let mut added = 0;

        for function in functions {
            let info = function.info();
            if self.devices.contains_key(&info.address) {
                log::debug!("[VirtIO] {} already bound", info.address);
                continue;
            }

            match Device::with_config(function, platform.clone(), config) {
                Ok(device) => {
                    log::info!(
                        "[VirtIO] Found {} at {} (irq {})",
                        info.virtio_device_type().unwrap_or(VirtioDeviceType::Unknown(0)),
                        info.address,
                        device.interrupt_line()
                    );
                    self.failures.remove(&info.address);
                    self.devices.insert(info.address, device);
                    added += 1;
                }
                Err(e) => {
                    log::warn!("[VirtIO] {}: cannot bind: {}", info.address, e);
                    self.failures.insert(info.address, e);
                }
            }
        }

        added
    }

    /// Get a device by address
    pub fn get(&self, address: FunctionAddress) -> Option<&Device> {
        self.devices.get(&address)
    }

    /// Get a mutable device by address
    pub fn get_mut(&mut self, address: FunctionAddress) -> Option<&mut Device> {
        self.devices.get_mut(&address)
    }

    /// Remove a device, e.g. on hot-unplug
    pub fn remove(&mut self, address: FunctionAddress) -> Option<Device> {
        self.devices.remove(&address)
    }

    /// Enumerate all devices
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Devices of one type
    pub fn of_type(&self, kind: VirtioDeviceType) -> impl Iterator<Item = &Device> {
        self.devices
            .values()
            .filter(move |device| device.info().virtio_device_type() == Some(kind))
    }

    /// Addresses of all devices, sorted
    pub fn addresses(&self) -> Vec<FunctionAddress> {
        let mut addresses: Vec<_> = self.devices.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Get device count
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Functions that failed to bind and have not bound since, with the
    /// latest error for each.
    pub fn failures(&self) -> impl Iterator<Item = (FunctionAddress, TransportError)> + '_ {
        self.failures.iter().map(|(address, error)| (*address, *error))
    }

    /// Latest bind error for `address`, if it is still unbound.
    pub fn failure(&self, address: FunctionAddress) -> Option<TransportError> {
        self.failures.get(&address).copied()
    }

    /// Offer an interrupt on `irq` to every device wired to it.
    ///
    /// Every device on the line is polled, since several may be pending at
    /// once. Returns whether any of them claimed it.
    pub fn dispatch_interrupt(&self, irq: u8) -> bool {
        let mut claimed = false;
        for device in self.devices.values().filter(|d| d.interrupt_line() == irq) {
            if device.handle_interrupt().is_ours() {
                claimed = true;
            }
        }

        #[cfg(feature = "debug-interrupts")]
        log::trace!("[VirtIO] irq {} claimed={}", irq, claimed);

        claimed
    }
}
