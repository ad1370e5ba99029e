//! Register sets of the two PCI transports.
//!
//! A [`Device`](crate::Device) picks one [`RegisterAccess`] implementation
//! when it is constructed and talks to the host only through it:
//!
//! - [`ModernAccess`]: common/notify/ISR/device regions located through the
//!   vendor capabilities (VirtIO 1.x)
//! - [`LegacyAccess`]: the fixed register block in I/O BAR0 of transitional
//!   devices (VirtIO 0.9.5)
//!
//! Every accessor is fallible because the underlying BAR is mapped on first
//! use.

use alloc::boxed::Box;

use crate::bus::BarKind;
use crate::capability::{CapabilityCatalog, ConfigurationRegion, RegionKind};
use crate::config::PAGE_SIZE;
use crate::device::TransportKind;
use crate::error::{MappingError, TransportError};
use crate::status::{DeviceStatus, IsrStatus};
use crate::window::{RegionWindow, RegisterWindow, WindowTable};

/// Common configuration structure layout (`struct virtio_pci_common_cfg`).
pub mod common {
    pub const DEVICE_FEATURE_SELECT: usize = 0x00;
    pub const DEVICE_FEATURE: usize = 0x04;
    pub const DRIVER_FEATURE_SELECT: usize = 0x08;
    pub const DRIVER_FEATURE: usize = 0x0C;
    pub const MSIX_CONFIG: usize = 0x10;
    pub const NUM_QUEUES: usize = 0x12;
    pub const DEVICE_STATUS: usize = 0x14;
    pub const CONFIG_GENERATION: usize = 0x15;
    pub const QUEUE_SELECT: usize = 0x16;
    pub const QUEUE_SIZE: usize = 0x18;
    pub const QUEUE_MSIX_VECTOR: usize = 0x1A;
    pub const QUEUE_ENABLE: usize = 0x1C;
    pub const QUEUE_NOTIFY_OFF: usize = 0x1E;
    pub const QUEUE_DESC: usize = 0x20;
    pub const QUEUE_DRIVER: usize = 0x28;
    pub const QUEUE_DEVICE: usize = 0x30;
    /// Size of the structure.
    pub const LEN: usize = 0x38;
}

/// Legacy I/O register offsets in BAR0.
pub mod legacy {
    pub const DEVICE_FEATURES: usize = 0x00;
    pub const GUEST_FEATURES: usize = 0x04;
    pub const QUEUE_PFN: usize = 0x08;
    pub const QUEUE_SIZE: usize = 0x0C;
    pub const QUEUE_SELECT: usize = 0x0E;
    pub const QUEUE_NOTIFY: usize = 0x10;
    pub const DEVICE_STATUS: usize = 0x12;
    pub const ISR_STATUS: usize = 0x13;
    /// Device-specific configuration (MSI-X disabled).
    pub const DEVICE_CONFIG: usize = 0x14;
}

/// Register operations shared by both transports.
///
/// Queue operations act on the queue chosen by the last `select_queue`.
pub trait RegisterAccess: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn status(&self) -> Result<DeviceStatus, MappingError>;
    fn set_status(&self, status: DeviceStatus) -> Result<(), MappingError>;

    /// Full feature word offered by the host.
    fn device_features(&self) -> Result<u64, MappingError>;
    fn set_driver_features(&self, features: u64) -> Result<(), MappingError>;

    fn select_queue(&self, index: u16) -> Result<(), MappingError>;
    /// Host-reported size; zero means the queue does not exist.
    fn queue_size(&self) -> Result<u16, MappingError>;
    /// Shrink the queue. Modern only.
    fn set_queue_size(&self, size: u16) -> Result<(), MappingError>;
    fn queue_notify_offset(&self) -> Result<u16, MappingError>;
    fn set_queue_addresses(&self, desc: u64, driver: u64, device: u64) -> Result<(), MappingError>;
    fn enable_queue(&self) -> Result<(), MappingError>;

    /// Tell the host queue `index` has new buffers.
    fn notify(&self, index: u16, notify_offset: u16) -> Result<(), MappingError>;

    /// Read (and acknowledge) the interrupt cause. Must be read once per
    /// interrupt.
    fn read_isr(&self) -> Result<IsrStatus, MappingError>;

    fn config_generation(&self) -> Result<u8, MappingError>;

    /// Device-specific configuration, if the device has any.
    fn device_config(&self) -> Result<Option<RegionWindow<'_>>, MappingError>;
}

/// VirtIO 1.x register access through capability-described regions.
pub struct ModernAccess {
    windows: WindowTable,
    common: ConfigurationRegion,
    notify: ConfigurationRegion,
    isr: ConfigurationRegion,
    device: Option<ConfigurationRegion>,
    notify_multiplier: u32,
}

impl ModernAccess {
    /// Bind to the first region of each kind in `catalog`.
    pub fn new(windows: WindowTable, catalog: &CapabilityCatalog) -> Result<Self, TransportError> {
        let required = |kind| catalog.first(kind).copied().ok_or(TransportError::MissingRegion(kind));
        let common = required(RegionKind::Common)?;
        let notify = required(RegionKind::Notify)?;
        let isr = required(RegionKind::Isr)?;

        ensure_len(&common, common::LEN)?;
        ensure_len(&isr, 1)?;

        Ok(Self {
            windows,
            common,
            notify,
            isr,
            device: catalog.first(RegionKind::Device).copied(),
            notify_multiplier: notify.notify_multiplier.unwrap_or(0),
        })
    }

    pub fn notify_multiplier(&self) -> u32 {
        self.notify_multiplier
    }

    fn common(&self) -> Result<RegionWindow<'_>, MappingError> {
        self.windows.region(&self.common)
    }
}

/// Reject a region too short for the registers read from it.
fn ensure_len(region: &ConfigurationRegion, min: usize) -> Result<(), TransportError> {
    if (region.length as usize) < min {
        log::warn!("[VirtIO] {:?} region only {:#x} bytes", region.kind, region.length);
        return Err(TransportError::Mapping(MappingError::OutOfBounds {
            bar: region.bar,
            offset: region.offset,
            length: region.length,
        }));
    }
    Ok(())
}

impl RegisterAccess for ModernAccess {
    fn kind(&self) -> TransportKind {
        TransportKind::Modern
    }

    fn status(&self) -> Result<DeviceStatus, MappingError> {
        let raw: u8 = self.common()?.read(common::DEVICE_STATUS);
        Ok(DeviceStatus::from_bits_retain(raw))
    }

    fn set_status(&self, status: DeviceStatus) -> Result<(), MappingError> {
        self.common()?.write(common::DEVICE_STATUS, status.bits());
        Ok(())
    }

    fn device_features(&self) -> Result<u64, MappingError> {
        let cfg = self.common()?;
        cfg.write(common::DEVICE_FEATURE_SELECT, 0u32);
        let low: u32 = cfg.read(common::DEVICE_FEATURE);
        cfg.write(common::DEVICE_FEATURE_SELECT, 1u32);
        let high: u32 = cfg.read(common::DEVICE_FEATURE);
        Ok((high as u64) << 32 | low as u64)
    }

    fn set_driver_features(&self, features: u64) -> Result<(), MappingError> {
        let cfg = self.common()?;
        cfg.write(common::DRIVER_FEATURE_SELECT, 0u32);
        cfg.write(common::DRIVER_FEATURE, features as u32);
        cfg.write(common::DRIVER_FEATURE_SELECT, 1u32);
        cfg.write(common::DRIVER_FEATURE, (features >> 32) as u32);
        Ok(())
    }

    fn select_queue(&self, index: u16) -> Result<(), MappingError> {
        self.common()?.write(common::QUEUE_SELECT, index);
        Ok(())
    }

    fn queue_size(&self) -> Result<u16, MappingError> {
        Ok(self.common()?.read(common::QUEUE_SIZE))
    }

    fn set_queue_size(&self, size: u16) -> Result<(), MappingError> {
        self.common()?.write(common::QUEUE_SIZE, size);
        Ok(())
    }

    fn queue_notify_offset(&self) -> Result<u16, MappingError> {
        Ok(self.common()?.read(common::QUEUE_NOTIFY_OFF))
    }

    fn set_queue_addresses(&self, desc: u64, driver: u64, device: u64) -> Result<(), MappingError> {
        let cfg = self.common()?;
        cfg.write(common::QUEUE_DESC, desc);
        cfg.write(common::QUEUE_DRIVER, driver);
        cfg.write(common::QUEUE_DEVICE, device);
        Ok(())
    }

    fn enable_queue(&self) -> Result<(), MappingError> {
        self.common()?.write(common::QUEUE_ENABLE, 1u16);
        Ok(())
    }

    fn notify(&self, index: u16, notify_offset: u16) -> Result<(), MappingError> {
        let area = self.windows.region(&self.notify)?;
        let at = notify_offset as usize * self.notify_multiplier as usize;
        if at + 2 > area.len() {
            return Err(MappingError::OutOfBounds {
                bar: self.notify.bar,
                offset: self.notify.offset.saturating_add(at as u32),
                length: 2,
            });
        }
        area.write(at, index);
        Ok(())
    }

    fn read_isr(&self) -> Result<IsrStatus, MappingError> {
        let raw: u8 = self.windows.region(&self.isr)?.read(0);
        Ok(IsrStatus::from_bits_truncate(raw))
    }

    fn config_generation(&self) -> Result<u8, MappingError> {
        Ok(self.common()?.read(common::CONFIG_GENERATION))
    }

    fn device_config(&self) -> Result<Option<RegionWindow<'_>>, MappingError> {
        self.device.as_ref().map(|region| self.windows.region(region)).transpose()
    }
}

/// Legacy register block in I/O BAR0.
pub struct LegacyAccess {
    windows: WindowTable,
    config: ConfigurationRegion,
}

impl LegacyAccess {
    pub const BAR: u8 = 0;

    pub fn new(windows: WindowTable) -> Result<Self, TransportError> {
        let bar = windows.descriptor(Self::BAR).ok_or(TransportError::NoTransport)?;
        let length = (bar.size as usize).saturating_sub(legacy::DEVICE_CONFIG) as u32;
        let config = ConfigurationRegion {
            kind: RegionKind::Device,
            bar: Self::BAR,
            offset: legacy::DEVICE_CONFIG as u32,
            length,
            notify_multiplier: None,
        };
        Ok(Self { windows, config })
    }

    fn bar0(&self) -> Result<&RegisterWindow, MappingError> {
        self.windows.get(Self::BAR)
    }
}

impl RegisterAccess for LegacyAccess {
    fn kind(&self) -> TransportKind {
        TransportKind::Legacy
    }

    fn status(&self) -> Result<DeviceStatus, MappingError> {
        let raw: u8 = self.bar0()?.read(legacy::DEVICE_STATUS);
        Ok(DeviceStatus::from_bits_retain(raw))
    }

    fn set_status(&self, status: DeviceStatus) -> Result<(), MappingError> {
        self.bar0()?.write(legacy::DEVICE_STATUS, status.bits());
        Ok(())
    }

    fn device_features(&self) -> Result<u64, MappingError> {
        let low: u32 = self.bar0()?.read(legacy::DEVICE_FEATURES);
        Ok(low as u64)
    }

    fn set_driver_features(&self, features: u64) -> Result<(), MappingError> {
        debug_assert_eq!(features >> 32, 0, "legacy transport has 32 feature bits");
        self.bar0()?.write(legacy::GUEST_FEATURES, features as u32);
        Ok(())
    }

    fn select_queue(&self, index: u16) -> Result<(), MappingError> {
        self.bar0()?.write(legacy::QUEUE_SELECT, index);
        Ok(())
    }

    fn queue_size(&self) -> Result<u16, MappingError> {
        Ok(self.bar0()?.read(legacy::QUEUE_SIZE))
    }

    fn set_queue_size(&self, _size: u16) -> Result<(), MappingError> {
        // Read-only on legacy devices.
        Ok(())
    }

    fn queue_notify_offset(&self) -> Result<u16, MappingError> {
        Ok(0)
    }

    fn set_queue_addresses(&self, desc: u64, driver: u64, device: u64) -> Result<(), MappingError> {
        // The host derives the avail and used rings from the PFN and size.
        debug_assert_eq!(desc % PAGE_SIZE as u64, 0);
        let _ = (driver, device);
        self.bar0()?.write(legacy::QUEUE_PFN, (desc / PAGE_SIZE as u64) as u32);
        Ok(())
    }

    fn enable_queue(&self) -> Result<(), MappingError> {
        // Writing the PFN already made the queue live.
        Ok(())
    }

    fn notify(&self, index: u16, _notify_offset: u16) -> Result<(), MappingError> {
        self.bar0()?.write(legacy::QUEUE_NOTIFY, index);
        Ok(())
    }

    fn read_isr(&self) -> Result<IsrStatus, MappingError> {
        let raw: u8 = self.bar0()?.read(legacy::ISR_STATUS);
        Ok(IsrStatus::from_bits_truncate(raw))
    }

    fn config_generation(&self) -> Result<u8, MappingError> {
        Ok(0)
    }

    fn device_config(&self) -> Result<Option<RegionWindow<'_>>, MappingError> {
        self.windows.region(&self.config).map(Some)
    }
}

/// Pick the transport a function supports.
pub fn select(
    windows: WindowTable,
    catalog: &CapabilityCatalog,
) -> Result<Box<dyn RegisterAccess>, TransportError> {
    if catalog.has_modern_transport() {
        return Ok(Box::new(ModernAccess::new(windows, catalog)?));
    }

    match windows.descriptor(LegacyAccess::BAR) {
        Some(bar) if bar.kind == BarKind::Io => Ok(Box::new(LegacyAccess::new(windows)?)),
        _ => Err(TransportError::NoTransport),
    }
}
