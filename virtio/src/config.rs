//! Transport configuration.
//!
//! Compile-time constants for the PCI transport plus the runtime
//! [`TransportConfig`] handed to each [`Device`](crate::Device).

use crate::poll::PollLimit;

/// Page size used for ring allocation and legacy queue PFNs (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Number of base address registers on a type 0 PCI function.
pub const BAR_COUNT: usize = 6;

/// PCI capability ID: vendor-specific (used by VirtIO).
pub const PCI_CAP_ID_VNDR: u8 = 0x09;

/// PCI vendor ID assigned to VirtIO devices.
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

/// Largest split-ring queue size allowed by the VirtIO specification.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Queue indices a device may configure; bounds the interrupt pending set.
pub const MAX_QUEUES: usize = 256;

/// Status polls attempted after writing zero during reset.
pub const RESET_POLL_ATTEMPTS: u32 = 1_000;

/// Status polls attempted while waiting for the FEATURES_OK echo.
pub const FEATURES_OK_POLL_ATTEMPTS: u32 = 16;

/// Retries for a config-space read that races a host-side generation change.
pub const CONFIG_GENERATION_ATTEMPTS: u32 = 8;

/// Upper bound on the spin-loop hints issued between two polls.
pub const MAX_BACKOFF_SPINS: u32 = 1 << 10;

/// Per-device transport tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bound for the status poll in `Device::reset`.
    pub reset_poll: PollLimit,
    /// Bound for the FEATURES_OK read-back in `Device::negotiate_features`.
    pub features_ok_poll: PollLimit,
    /// Bound for `Device::read_config_consistent`.
    pub config_generation_poll: PollLimit,
    /// Queues larger than this are shrunk on modern transports.
    pub max_queue_size: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reset_poll: PollLimit::new(RESET_POLL_ATTEMPTS, MAX_BACKOFF_SPINS),
            features_ok_poll: PollLimit::new(FEATURES_OK_POLL_ATTEMPTS, MAX_BACKOFF_SPINS),
            config_generation_poll: PollLimit::new(CONFIG_GENERATION_ATTEMPTS, 0),
            max_queue_size: MAX_QUEUE_SIZE,
        }
    }
}
