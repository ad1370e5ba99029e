//! Transport error types.

use core::fmt;

use crate::capability::RegionKind;

/// A vendor-specific capability entry that could not be turned into a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityError {
    /// The entry violates the capability structure layout.
    Malformed {
        /// Config-space offset of the offending entry.
        offset: u8,
        /// What was wrong with it.
        reason: MalformedReason,
    },
}

/// Why a capability entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// `cfg_type` is not one of the five known kinds.
    UnknownKind(u8),
    /// `cap_len` (or the bytes actually present) is below the structure size.
    TooShort { declared: u8, required: u8 },
    /// BAR index outside 0..=5.
    BadBar(u8),
}

/// Mapping a BAR window into the kernel address space failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The function does not implement the BAR.
    MissingBar(u8),
    /// A region extends past the end of its BAR.
    OutOfBounds { bar: u8, offset: u32, length: u32 },
    /// The platform refused to map the window.
    MapFailed(u8),
}

/// DMA allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No physically contiguous block of the requested size.
    OutOfMemory { pages: usize },
}

/// Feature negotiation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationError {
    /// The host did not echo FEATURES_OK after the accepted set was written.
    RejectedByHost { accepted: u64 },
}

/// Virtqueue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Not enough free descriptors; back off and retry after a drain.
    Full { needed: usize, free: usize },
    /// The chain can never fit in this queue.
    ChainTooLong { len: usize, size: u16 },
    /// Chains must carry at least one buffer.
    EmptyChain,
    /// The host reports no queue at this index.
    Unavailable(u16),
    /// The queue size is zero, above the split-ring limit or not a power of two.
    InvalidSize(u16),
    /// Ring memory could not be allocated.
    Alloc(AllocError),
}

/// Errors surfaced by device lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Neither a modern capability set nor a legacy I/O BAR0 was found.
    NoTransport,
    /// A required configuration region is absent.
    MissingRegion(RegionKind),
    /// Register window mapping failed.
    Mapping(MappingError),
    /// Host rejected feature negotiation.
    Negotiation(NegotiationError),
    /// Virtqueue setup failed.
    Queue(QueueError),
    /// The host never reported a cleared status after reset.
    ResetTimeout,
    /// Device-specific config kept changing under a read.
    ConfigUnstable,
    /// Config access outside the device-specific region.
    ConfigOutOfRange { offset: u32, len: u32 },
    /// The device is marked FAILED and refuses further use.
    DeviceFailed,
}

/// Returned by a driver's config-change handler when it cannot cope with the
/// new device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigChangeError;

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind(kind) => write!(f, "unknown cfg_type {}", kind),
            Self::TooShort { declared, required } => {
                write!(f, "length {} below required {}", declared, required)
            }
            Self::BadBar(bar) => write!(f, "BAR index {} out of range", bar),
        }
    }
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { offset, reason } => {
                write!(f, "Malformed capability at {:#x}: {}", offset, reason)
            }
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBar(bar) => write!(f, "BAR{} not implemented", bar),
            Self::OutOfBounds { bar, offset, length } => write!(
                f,
                "Region {:#x}+{:#x} exceeds BAR{}",
                offset, length, bar
            ),
            Self::MapFailed(bar) => write!(f, "Failed to map BAR{}", bar),
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { pages } => write!(f, "Out of DMA memory ({} pages)", pages),
        }
    }
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RejectedByHost { accepted } => {
                write!(f, "Host rejected features {:#x}", accepted)
            }
        }
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { needed, free } => {
                write!(f, "Queue full ({} needed, {} free)", needed, free)
            }
            Self::ChainTooLong { len, size } => {
                write!(f, "Chain of {} exceeds queue size {}", len, size)
            }
            Self::EmptyChain => write!(f, "Empty descriptor chain"),
            Self::Unavailable(index) => write!(f, "Queue {} unavailable", index),
            Self::InvalidSize(size) => write!(f, "Invalid queue size {}", size),
            Self::Alloc(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTransport => write!(f, "No usable VirtIO transport"),
            Self::MissingRegion(kind) => write!(f, "Missing {:?} region", kind),
            Self::Mapping(e) => write!(f, "{}", e),
            Self::Negotiation(e) => write!(f, "{}", e),
            Self::Queue(e) => write!(f, "{}", e),
            Self::ResetTimeout => write!(f, "Device reset timed out"),
            Self::ConfigUnstable => write!(f, "Device config generation unstable"),
            Self::ConfigOutOfRange { offset, len } => {
                write!(f, "Config access {:#x}+{} out of range", offset, len)
            }
            Self::DeviceFailed => write!(f, "Device failed"),
        }
    }
}

impl From<MappingError> for TransportError {
    fn from(e: MappingError) -> Self {
        Self::Mapping(e)
    }
}

impl From<NegotiationError> for TransportError {
    fn from(e: NegotiationError) -> Self {
        Self::Negotiation(e)
    }
}

impl From<QueueError> for TransportError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<AllocError> for QueueError {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}
