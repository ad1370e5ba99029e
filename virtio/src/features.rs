//! Feature bits and the driver-side negotiation policy.
//!
//! Bits 0..=23 are device-specific and pass through untouched when the
//! driver asks for them; bits 24 and up are transport features whose
//! acceptance is decided here.

bitflags::bitflags! {
    /// Transport feature bits (VirtIO 1.1 §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u64 {
        /// Legacy: interrupt even when the avail ring is empty.
        const NOTIFY_ON_EMPTY = 1 << 24;
        /// Legacy: no framing assumptions on descriptor layout.
        const ANY_LAYOUT = 1 << 27;
        /// Indirect descriptor tables.
        const INDIRECT_DESC = 1 << 28;
        /// `used_event` / `avail_event` notification suppression.
        const EVENT_IDX = 1 << 29;
        /// Device complies with VirtIO 1.0+.
        const VERSION_1 = 1 << 32;
        /// Device sits behind an IOMMU / restricted DMA.
        const ACCESS_PLATFORM = 1 << 33;
        /// Packed virtqueue layout.
        const RING_PACKED = 1 << 34;
        /// Buffers are used in the order they were made available.
        const IN_ORDER = 1 << 35;
        /// Platform-ordered memory accesses.
        const ORDER_PLATFORM = 1 << 36;
        /// Single-root I/O virtualization.
        const SR_IOV = 1 << 37;
        /// Extra data in queue notifications.
        const NOTIFICATION_DATA = 1 << 38;
    }
}

impl Features {
    /// Transport features this crate does not implement. Never accepted.
    pub const UNSUPPORTED: Features = Features::RING_PACKED
        .union(Features::INDIRECT_DESC)
        .union(Features::NOTIFICATION_DATA);

    /// Accepted whenever the host offers them.
    pub const ALWAYS_ACCEPTED: Features = Features::VERSION_1.union(Features::IN_ORDER);

    /// Mask of the device-specific bits.
    pub const DEVICE_SPECIFIC_MASK: u64 = (1 << 24) - 1;

    /// Build a feature set from a raw 64-bit word, keeping device-specific bits.
    pub const fn from_raw(raw: u64) -> Self {
        Self::from_bits_retain(raw)
    }

    /// Device-specific portion of the set.
    pub fn device_specific(&self) -> u64 {
        self.bits() & Self::DEVICE_SPECIFIC_MASK
    }
}

/// Compute the set the driver writes back.
///
/// `offered` is what the host reports, `requested` what the driver asks for.
/// The result never contains anything the host did not offer.
pub fn select(offered: Features, requested: Features) -> Features {
    let mut accepted = offered.intersection(requested) | offered.intersection(Features::ALWAYS_ACCEPTED);
    accepted.remove(Features::UNSUPPORTED);
    accepted
}
