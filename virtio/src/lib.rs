//! VirtIO PCI transport for KPIO.
//!
//! This crate discovers VirtIO functions exposed by the hypervisor, negotiates
//! features with the host, builds split virtqueues in DMA-visible memory and
//! routes device interrupts back to the drivers built on top of it (network,
//! console, entropy, GPU).
//!
//! # Architecture
//!
//! - `bus`: traits the PCI layer and the kernel memory services implement
//! - `capability`: vendor-specific capability parsing
//! - `window`: lazily mapped BAR register windows
//! - `access`: modern (capability based) and legacy (BAR0 port) register sets
//! - `dma`: ring memory arena
//! - `queue`: split virtqueue and descriptor chains
//! - `irq`: interrupt masking around queue locks
//! - `device`: initialization state machine and interrupt routing
//! - `registry`: owner of every probed device
//!
//! # Initialization order
//!
//! ```text
//! reset -> acknowledge -> negotiate_features -> configure_queue (all)
//!       -> activate_queue (all) -> finish_init -> live
//! ```
//!
//! # References
//!
//! - VirtIO Specification 1.1+ §2.7 (Split Virtqueues), §4.1 (PCI transport)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod access;
pub mod bus;
pub mod capability;
pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod features;
pub mod io;
mod irq;
pub mod poll;
pub mod queue;
pub mod registry;
pub mod status;
pub mod window;

#[cfg(test)]
mod testing;

pub use bus::{Bus, FunctionAddress, FunctionHandle, FunctionInfo, Platform, VirtioDeviceType};
pub use capability::{CapabilityCatalog, ConfigurationRegion, RegionKind};
pub use config::TransportConfig;
pub use device::{Device, DeviceState, InterruptOutcome, QueueSet, TransportKind};
pub use error::{
    AllocError, CapabilityError, MappingError, NegotiationError, QueueError, TransportError,
};
pub use features::Features;
pub use queue::{BufferDescriptor, BufferDirection, CompletedChain, Queue, QueueChain};
pub use registry::DeviceRegistry;
pub use status::{DeviceStatus, IsrStatus};
