//! Bus and platform collaborators.
//!
//! The transport never touches PCI configuration space or page tables itself.
//! The PCI driver hands it [`FunctionHandle`]s, and the kernel memory subsystem
//! implements [`Platform`] to map BARs and allocate DMA memory.
//!
//! # Device IDs
//!
//! VirtIO functions use vendor ID 0x1AF4:
//! - 0x1000-0x103F: transitional devices (legacy port I/O capable)
//! - 0x1040 + device type: modern devices

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::config::VIRTIO_VENDOR_ID;
use crate::dma::DmaRegion;
use crate::error::{AllocError, MappingError};
use crate::io::RegisterIo;

/// PCI function address (Bus:Device:Function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl FunctionAddress {
    /// Create a new function address.
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        debug_assert!(device < 32, "Device must be 0-31");
        debug_assert!(function < 8, "Function must be 0-7");
        Self { bus, device, function }
    }
}

impl fmt::Display for FunctionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Identity of a discovered function, as read from its config header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    pub address: FunctionAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_id: u16,
}

impl FunctionInfo {
    /// Check if this is a VirtIO function.
    pub fn is_virtio(&self) -> bool {
        self.vendor_id == VIRTIO_VENDOR_ID && (0x1000..=0x107F).contains(&self.device_id)
    }

    /// Transitional functions expose the legacy register block in BAR0.
    pub fn is_transitional(&self) -> bool {
        self.is_virtio() && self.device_id < 0x1040
    }

    /// Get the VirtIO device type if this is a VirtIO function.
    pub fn virtio_device_type(&self) -> Option<VirtioDeviceType> {
        if !self.is_virtio() {
            return None;
        }

        let type_id = if self.is_transitional() {
            // Transitional IDs encode the type in the subsystem ID.
            match self.device_id {
                0x1000 => 1,
                0x1001 => 2,
                0x1003 => 3,
                0x1005 => 4,
                0x1009 => 9,
                _ => self.subsystem_id,
            }
        } else {
            self.device_id - 0x1040
        };
        Some(VirtioDeviceType::from(type_id))
    }
}

/// VirtIO device types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioDeviceType {
    Network,
    Block,
    Console,
    Entropy,
    Gpu,
    Input,
    Filesystem,
    Unknown(u16),
}

impl From<u16> for VirtioDeviceType {
    fn from(type_id: u16) -> Self {
        match type_id {
            1 => VirtioDeviceType::Network,
            2 => VirtioDeviceType::Block,
            3 => VirtioDeviceType::Console,
            4 => VirtioDeviceType::Entropy,
            9 => VirtioDeviceType::Filesystem,
            16 => VirtioDeviceType::Gpu,
            18 => VirtioDeviceType::Input,
            other => VirtioDeviceType::Unknown(other),
        }
    }
}

impl fmt::Display for VirtioDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioDeviceType::Network => write!(f, "Network"),
            VirtioDeviceType::Block => write!(f, "Block"),
            VirtioDeviceType::Console => write!(f, "Console"),
            VirtioDeviceType::Entropy => write!(f, "Entropy"),
            VirtioDeviceType::Gpu => write!(f, "GPU"),
            VirtioDeviceType::Input => write!(f, "Input"),
            VirtioDeviceType::Filesystem => write!(f, "Filesystem"),
            VirtioDeviceType::Unknown(id) => write!(f, "Unknown({:#x})", id),
        }
    }
}

/// One entry of a function's capability list, copied out of config space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapability {
    /// Config-space offset of the entry.
    pub offset: u8,
    /// Bytes of the entry starting at `cap_vndr`.
    pub bytes: Vec<u8>,
}

impl RawCapability {
    pub fn new(offset: u8, bytes: Vec<u8>) -> Self {
        Self { offset, bytes }
    }

    /// Capability ID (first byte).
    pub fn id(&self) -> Option<u8> {
        self.bytes.first().copied()
    }
}

/// Address space a BAR decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Memory,
    Io,
}

/// A BAR window as assigned by firmware or the PCI driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarWindow {
    pub index: u8,
    pub kind: BarKind,
    /// Physical address (memory) or port base (I/O).
    pub address: u64,
    pub size: u64,
}

/// A discovered function, owned by the bus layer.
pub trait FunctionHandle: Send + Sync {
    /// Identity of the function.
    fn info(&self) -> FunctionInfo;

    /// The function's capability list in chain order.
    fn capabilities(&self) -> Vec<RawCapability>;

    /// BAR `index`, if implemented.
    fn bar_window(&self, index: u8) -> Option<BarWindow>;

    /// Set the bus-master (and memory/I/O decode) bits in the command register.
    fn enable_bus_mastering(&self);

    /// Legacy INTx line routed for this function.
    fn interrupt_line(&self) -> u8;
}

/// Bus enumeration service.
pub trait Bus {
    /// Return every function matching `predicate`.
    fn enumerate(&self, predicate: &dyn Fn(&FunctionInfo) -> bool) -> Vec<Box<dyn FunctionHandle>>;
}

/// Kernel services the transport depends on.
pub trait Platform: Send + Sync {
    /// Map a BAR window. The mapping is never torn down.
    fn map_window(&self, window: &BarWindow) -> Result<Box<dyn RegisterIo>, MappingError>;

    /// Allocate `pages` zeroed, physically contiguous, DMA-visible pages.
    fn dma_alloc(&self, pages: usize) -> Result<DmaRegion, AllocError>;

    /// Return a region obtained from `dma_alloc`.
    ///
    /// # Safety
    ///
    /// The host must no longer reference the region.
    unsafe fn dma_dealloc(&self, region: &DmaRegion);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(device_id: u16, subsystem_id: u16) -> FunctionInfo {
        FunctionInfo {
            address: FunctionAddress::new(0, 3, 0),
            vendor_id: VIRTIO_VENDOR_ID,
            device_id,
            subsystem_id,
        }
    }

    #[test]
    fn test_address_display() {
        assert_eq!(alloc::format!("{}", FunctionAddress::new(0, 0x1f, 3)), "00:1f.3");
    }

    #[test]
    fn test_device_types() {
        assert_eq!(info(0x1000, 1).virtio_device_type(), Some(VirtioDeviceType::Network));
        assert_eq!(info(0x1041, 0).virtio_device_type(), Some(VirtioDeviceType::Network));
        assert_eq!(info(0x1043, 0).virtio_device_type(), Some(VirtioDeviceType::Console));
        assert_eq!(info(0x1044, 0).virtio_device_type(), Some(VirtioDeviceType::Entropy));
        assert_eq!(info(0x1050, 0).virtio_device_type(), Some(VirtioDeviceType::Gpu));
        assert_eq!(info(0x1010, 16).virtio_device_type(), Some(VirtioDeviceType::Gpu));
    }

    #[test]
    fn test_non_virtio() {
        let mut other = info(0x1041, 0);
        other.vendor_id = 0x8086;
        assert!(!other.is_virtio());
        assert_eq!(other.virtio_device_type(), None);
        assert!(!info(0x1100, 0).is_virtio());
    }

    #[test]
    fn test_transitional() {
        assert!(info(0x1000, 1).is_transitional());
        assert!(!info(0x1041, 0).is_transitional());
    }
}
