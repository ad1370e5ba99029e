//! VirtIO PCI capability parsing.
//!
//! Modern VirtIO functions describe where their register blocks live through
//! vendor-specific entries (ID 0x09) in the PCI capability list:
//!
//! ```text
//! 0       1        2        3         4    5   6..8  8..12   12..16   16..20
//! cap_vndr cap_next cap_len cfg_type  bar  id  pad   offset  length   notify_off_multiplier
//! ```
//!
//! The trailing multiplier is present only on the notification capability.
//!
//! # Reference
//! - VirtIO Spec 1.1 §4.1.4 (Virtio Structure PCI Capabilities)

use alloc::vec::Vec;

use crate::bus::RawCapability;
use crate::config::{BAR_COUNT, PCI_CAP_ID_VNDR};
use crate::error::{CapabilityError, MalformedReason};

/// Size of `struct virtio_pci_cap`.
pub const CAP_MIN_LEN: u8 = 16;

/// Size of `struct virtio_pci_notify_cap`.
pub const NOTIFY_CAP_MIN_LEN: u8 = 20;

/// Kind of configuration structure a capability points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionKind {
    /// Common configuration.
    Common = 1,
    /// Notification area.
    Notify = 2,
    /// ISR status.
    Isr = 3,
    /// Device-specific configuration.
    Device = 4,
    /// PCI configuration access window.
    Pci = 5,
}

impl RegionKind {
    fn from_cfg_type(cfg_type: u8) -> Option<Self> {
        match cfg_type {
            1 => Some(RegionKind::Common),
            2 => Some(RegionKind::Notify),
            3 => Some(RegionKind::Isr),
            4 => Some(RegionKind::Device),
            5 => Some(RegionKind::Pci),
            _ => None,
        }
    }
}

/// One parsed configuration region. Immutable once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationRegion {
    pub kind: RegionKind,
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
    /// Only set for [`RegionKind::Notify`].
    pub notify_multiplier: Option<u32>,
}

impl ConfigurationRegion {
    /// Parse a single vendor-specific capability entry.
    pub fn parse(raw: &RawCapability) -> Result<Self, CapabilityError> {
        let bytes = &raw.bytes;
        let malformed = |reason| CapabilityError::Malformed { offset: raw.offset, reason };

        if bytes.len() < 4 {
            return Err(malformed(MalformedReason::TooShort {
                declared: bytes.len() as u8,
                required: CAP_MIN_LEN,
            }));
        }

        let cap_len = bytes[2];
        let cfg_type = bytes[3];

        let kind = RegionKind::from_cfg_type(cfg_type)
            .ok_or_else(|| malformed(MalformedReason::UnknownKind(cfg_type)))?;

        let required = if kind == RegionKind::Notify { NOTIFY_CAP_MIN_LEN } else { CAP_MIN_LEN };
        // Trust neither the declared length nor the copied bytes on their own.
        let available = cap_len.min(bytes.len().min(u8::MAX as usize) as u8);
        if available < required {
            return Err(malformed(MalformedReason::TooShort { declared: available, required }));
        }

        let bar = bytes[4];
        if bar as usize >= BAR_COUNT {
            return Err(malformed(MalformedReason::BadBar(bar)));
        }

        let offset = read_le32(bytes, 8);
        let length = read_le32(bytes, 12);
        let notify_multiplier = if kind == RegionKind::Notify {
            Some(read_le32(bytes, 16))
        } else {
            None
        };

        Ok(ConfigurationRegion { kind, bar, offset, length, notify_multiplier })
    }

    /// Exclusive end offset within the BAR.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }
}

fn read_le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Every configuration region a function exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityCatalog {
    regions: Vec<ConfigurationRegion>,
    rejected: Vec<CapabilityError>,
}

impl CapabilityCatalog {
    /// Parse a capability list.
    ///
    /// Non-vendor entries are ignored. A malformed vendor entry is recorded
    /// and skipped; entries parsed before and after it are kept.
    pub fn parse(raw: &[RawCapability]) -> Self {
        let mut catalog = CapabilityCatalog::default();

        for entry in raw.iter().filter(|entry| entry.id() == Some(PCI_CAP_ID_VNDR)) {
            match ConfigurationRegion::parse(entry) {
                Ok(region) => {
                    log::trace!(
                        "[VirtIO] cap@{:#x}: {:?} bar={} off={:#x} len={:#x}",
                        entry.offset,
                        region.kind,
                        region.bar,
                        region.offset,
                        region.length
                    );
                    catalog.regions.push(region);
                }
                Err(e) => {
                    log::warn!("[VirtIO] Skipping capability: {}", e);
                    catalog.rejected.push(e);
                }
            }
        }

        catalog
    }

    /// All well-formed regions in list order.
    pub fn regions(&self) -> &[ConfigurationRegion] {
        &self.regions
    }

    /// Entries that were skipped.
    pub fn rejected(&self) -> &[CapabilityError] {
        &self.rejected
    }

    /// First region of `kind`. Later duplicates are ignored.
    pub fn first(&self, kind: RegionKind) -> Option<&ConfigurationRegion> {
        self.regions.iter().find(|region| region.kind == kind)
    }

    /// True when the modern register set (common, notify, ISR) is described.
    pub fn has_modern_transport(&self) -> bool {
        [RegionKind::Common, RegionKind::Notify, RegionKind::Isr]
            .iter()
            .all(|kind| self.first(*kind).is_some())
    }

    /// Distinct BAR indices referenced by any region.
    pub fn bars(&self) -> Vec<u8> {
        let mut bars: Vec<u8> = self.regions.iter().map(|region| region.bar).collect();
        bars.sort_unstable();
        bars.dedup();
        bars
    }
}
