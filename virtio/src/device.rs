//! VirtIO device: initialization state machine and interrupt routing.
//!
//! A [`Device`] is bound to one PCI function. The driver on top walks it
//! through the VirtIO 1.1 §3.1.1 sequence:
//!
//! ```text
//! Reset -> Acknowledged -> DriverPresent -> FeaturesNegotiated
//!       -> QueuesConfigured -> QueuesActivated -> Live
//! ```
//!
//! Calling a transition out of order is a driver bug and panics. Host-side
//! failures (reset timeout, rejected features, unmappable registers) move the
//! device to `Failed` instead; from then on every lifecycle operation
//! returns [`TransportError::DeviceFailed`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, AtomicBool, AtomicU8, Ordering};

use crate::access::{self, RegisterAccess};
use crate::bus::{FunctionAddress, FunctionHandle, FunctionInfo, Platform};
use crate::capability::{CapabilityCatalog, RegionKind};
use crate::config::{TransportConfig, MAX_QUEUES};
use crate::error::{ConfigChangeError, MappingError, NegotiationError, QueueError, TransportError};
use crate::features::{self, Features};
use crate::io::Register;
use crate::poll::poll_until;
use crate::queue::Queue;
use crate::status::{DeviceStatus, IsrStatus};
use crate::window::WindowTable;

/// Lifecycle position of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Reset,
    Acknowledged,
    DriverPresent,
    FeaturesNegotiated,
    QueuesConfigured,
    QueuesActivated,
    Live,
    /// Dead but inspectable.
    Failed,
}

/// Register set in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Capability-described MMIO regions (VirtIO 1.x).
    Modern,
    /// Fixed I/O port block in BAR0 (transitional devices).
    Legacy,
}

/// Fixed-size set of queue indices, filled without allocating so it can be
/// built in interrupt context.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSet {
    bits: [u64; MAX_QUEUES / 64],
}

impl QueueSet {
    pub const fn new() -> Self {
        Self { bits: [0; MAX_QUEUES / 64] }
    }

    /// Add `index`. Panics if it is not below [`MAX_QUEUES`].
    pub fn insert(&mut self, index: u16) {
        let index = index as usize;
        assert!(index < MAX_QUEUES, "queue index {} out of range", index);
        self.bits[index / 64] |= 1 << (index % 64);
    }

    pub fn contains(&self, index: u16) -> bool {
        let index = index as usize;
        index < MAX_QUEUES && self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..MAX_QUEUES as u16).filter(move |index| self.contains(*index))
    }
}

impl fmt::Debug for QueueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// What a call to [`Device::handle_interrupt`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptOutcome {
    /// ISR bits read for this interrupt. Empty when it was not ours.
    pub cause: IsrStatus,
    /// Queues with used entries waiting to be drained.
    pub pending_queues: QueueSet,
}

impl InterruptOutcome {
    fn not_ours() -> Self {
        Self { cause: IsrStatus::empty(), pending_queues: QueueSet::new() }
    }

    /// Whether the interrupt was raised by this device.
    pub fn is_ours(&self) -> bool {
        !self.cause.is_empty()
    }

    pub fn queue_activity(&self) -> bool {
        self.cause.contains(IsrStatus::QUEUE_INTERRUPT)
    }

    pub fn config_changed(&self) -> bool {
        self.cause.contains(IsrStatus::DEVICE_CONFIG_INTERRUPT)
    }
}

type ConfigChangeHandler = Box<dyn Fn() -> Result<(), ConfigChangeError> + Send + Sync>;

/// A VirtIO device bound to one PCI function.
pub struct Device {
    function: Box<dyn FunctionHandle>,
    info: FunctionInfo,
    platform: Arc<dyn Platform>,
    catalog: CapabilityCatalog,
    access: Box<dyn RegisterAccess>,
    config: TransportConfig,
    /// Bits written so far. Only a reset clears them.
    status: AtomicU8,
    failed: AtomicBool,
    state: DeviceState,
    accepted: Features,
    did_accept_features: bool,
    did_setup_queues: bool,
    queues: Vec<Arc<Queue>>,
    /// Queues `activate_queue` was called for, enabled by `finish_init`.
    staged: Vec<u16>,
    on_config_change: Option<ConfigChangeHandler>,
}

impl Device {
    /// Bind to a function with the default [`TransportConfig`].
    pub fn new(
        function: Box<dyn FunctionHandle>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, TransportError> {
        Self::with_config(function, platform, TransportConfig::default())
    }

    /// Bind to a function: enable bus mastering, parse its capabilities and
    /// pick the modern or legacy register set. Nothing is written to the
    /// device itself.
    pub fn with_config(
        function: Box<dyn FunctionHandle>,
        platform: Arc<dyn Platform>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let info = function.info();
        function.enable_bus_mastering();

        let catalog = CapabilityCatalog::parse(&function.capabilities());
        let windows = WindowTable::new(function.as_ref(), platform.clone());
        let access = access::select(windows, &catalog)?;

        log::debug!(
            "[VirtIO] {} {:04x}:{:04x} using {:?} transport ({} regions)",
            info.address,
            info.vendor_id,
            info.device_id,
            access.kind(),
            catalog.regions().len()
        );

        Ok(Self {
            function,
            info,
            platform,
            catalog,
            access,
            config,
            status: AtomicU8::new(0),
            failed: AtomicBool::new(false),
            state: DeviceState::Reset,
            accepted: Features::empty(),
            did_accept_features: false,
            did_setup_queues: false,
            queues: Vec::new(),
            staged: Vec::new(),
            on_config_change: None,
        })
    }

    // ----- Lifecycle -----

    /// Write zero to the status register and wait for the host to clear it.
    pub fn reset(&mut self) -> Result<(), TransportError> {
        self.ensure_alive()?;
        assert!(!self.did_accept_features, "reset after feature negotiation");

        self.write_status(DeviceStatus::empty()).map_err(|e| self.fail(e.into()))?;
        let access = self.access.as_ref();
        let cleared = poll_until(self.config.reset_poll, || -> Result<bool, MappingError> {
            Ok(access.status()?.is_empty())
        })
        .map_err(|e| self.fail(e.into()))?;
        if !cleared {
            log::error!("[VirtIO] {}: reset did not complete", self.info.address);
            return Err(self.fail(TransportError::ResetTimeout));
        }

        self.state = DeviceState::Reset;
        log::debug!("[VirtIO] {}: reset", self.info.address);
        Ok(())
    }

    /// Set ACKNOWLEDGE, then DRIVER.
    pub fn acknowledge(&mut self) -> Result<(), TransportError> {
        self.ensure_alive()?;
        assert!(
            matches!(
                self.state,
                DeviceState::Reset | DeviceState::Acknowledged | DeviceState::DriverPresent
            ),
            "acknowledge after feature negotiation"
        );

        self.add_status(DeviceStatus::ACKNOWLEDGE).map_err(|e| self.fail(e.into()))?;
        self.state = DeviceState::Acknowledged;
        self.add_status(DeviceStatus::DRIVER).map_err(|e| self.fail(e.into()))?;
        self.state = DeviceState::DriverPresent;
        log::debug!("[VirtIO] {}: driver present", self.info.address);
        Ok(())
    }

    /// Negotiate features with the host. May be called once per device.
    ///
    /// The accepted set contains `VERSION_1` and `IN_ORDER` when offered,
    /// whatever of `requested` the host offers, and never a feature this
    /// transport does not implement.
    pub fn negotiate_features(&mut self, requested: Features) -> Result<Features, TransportError> {
        self.ensure_alive()?;
        assert!(!self.did_accept_features, "features already negotiated");
        assert_eq!(self.state, DeviceState::DriverPresent, "negotiate_features before acknowledge");

        let offered = self.access.device_features().map_err(|e| self.fail(e.into()))?;
        let offered = Features::from_raw(offered);
        let accepted = features::select(offered, requested);

        self.access.set_driver_features(accepted.bits()).map_err(|e| self.fail(e.into()))?;
        self.did_accept_features = true;
        self.accepted = accepted;

        self.add_status(DeviceStatus::FEATURES_OK).map_err(|e| self.fail(e.into()))?;
        self.state = DeviceState::FeaturesNegotiated;

        let access = self.access.as_ref();
        let echoed = poll_until(self.config.features_ok_poll, || -> Result<bool, MappingError> {
            Ok(access.status()?.contains(DeviceStatus::FEATURES_OK))
        })
        .map_err(|e| self.fail(e.into()))?;

        if !echoed {
            log::warn!(
                "[VirtIO] {}: host rejected features {:#x} (offered {:#x})",
                self.info.address,
                accepted.bits(),
                offered.bits()
            );
            let rejected = NegotiationError::RejectedByHost { accepted: accepted.bits() };
            return Err(self.fail(rejected.into()));
        }

        log::debug!(
            "[VirtIO] {}: features offered={:#x} accepted={:#x}",
            self.info.address,
            offered.bits(),
            accepted.bits()
        );
        Ok(accepted)
    }

    /// Allocate and register queue `index` without enabling it.
    ///
    /// Returns `Ok(None)` when the host has no such queue.
    pub fn configure_queue(&mut self, index: u16) -> Result<Option<Arc<Queue>>, TransportError> {
        self.ensure_alive()?;
        assert!(self.did_accept_features, "configure_queue before negotiate_features");
        assert!(
            matches!(
                self.state,
                DeviceState::FeaturesNegotiated
                    | DeviceState::QueuesConfigured
                    | DeviceState::QueuesActivated
            ),
            "configure_queue after finish_init"
        );
        assert!(self.queue(index).is_none(), "queue {} configured twice", index);
        assert!((index as usize) < MAX_QUEUES, "queue index {} out of range", index);

        self.did_setup_queues = true;

        self.access.select_queue(index).map_err(|e| self.fail(e.into()))?;
        let host_size = self.access.queue_size().map_err(|e| self.fail(e.into()))?;
        if host_size == 0 {
            log::debug!("[VirtIO] {}: queue {} unavailable", self.info.address, index);
            self.enter_queues_configured();
            return Ok(None);
        }

        let size = match self.transport_kind() {
            TransportKind::Modern => {
                let size = cap_queue_size(host_size, self.config.max_queue_size);
                if size != host_size {
                    self.access.set_queue_size(size).map_err(|e| self.fail(e.into()))?;
                }
                size
            }
            TransportKind::Legacy => host_size,
        };
        let notify_offset = self.access.queue_notify_offset().map_err(|e| self.fail(e.into()))?;
        let event_idx = self.accepted.contains(Features::EVENT_IDX);

        let queue = Queue::new(index, size, notify_offset, event_idx, &self.platform)?;
        let rings = queue.ring_addresses();
        self.access
            .set_queue_addresses(rings.desc, rings.driver, rings.device)
            .map_err(|e| self.fail(e.into()))?;

        let queue = Arc::new(queue);
        self.queues.push(queue.clone());
        self.enter_queues_configured();

        log::debug!(
            "[VirtIO] {}: queue {} configured (size {}, host {})",
            self.info.address,
            index,
            size,
            host_size
        );
        Ok(Some(queue))
    }

    /// Mark a configured queue for activation.
    ///
    /// The host-visible enable is deferred to [`finish_init`](Self::finish_init),
    /// which enables every marked queue in one pass. Configuring further
    /// queues afterwards is therefore still safe.
    pub fn activate_queue(&mut self, index: u16) -> Result<(), TransportError> {
        self.ensure_alive()?;
        assert!(self.did_setup_queues, "activate_queue before configure_queue");
        assert_ne!(self.state, DeviceState::Live, "activate_queue after finish_init");

        if self.queue(index).is_none() {
            return Err(QueueError::Unavailable(index).into());
        }
        if !self.staged.contains(&index) {
            self.staged.push(index);
        }
        self.state = DeviceState::QueuesActivated;
        Ok(())
    }

    /// Enable the activated queues and set DRIVER_OK.
    pub fn finish_init(&mut self) -> Result<(), TransportError> {
        self.ensure_alive()?;
        assert!(self.did_accept_features, "finish_init before negotiate_features");
        assert!(self.did_setup_queues, "finish_init before configure_queue");
        assert!(!self.queues.is_empty(), "finish_init with no queue configured");
        assert!(
            !self.status().contains(DeviceStatus::DRIVER_OK),
            "finish_init called twice"
        );

        self.staged.sort_unstable();
        for index in self.staged.iter().copied() {
            self.access
                .select_queue(index)
                .and_then(|()| self.access.enable_queue())
                .map_err(|e| self.fail(e.into()))?;
        }
        for queue in self.queues.iter().filter(|q| !self.staged.contains(&q.index())) {
            log::warn!(
                "[VirtIO] {}: queue {} configured but never activated",
                self.info.address,
                queue.index()
            );
        }

        self.add_status(DeviceStatus::DRIVER_OK).map_err(|e| self.fail(e.into()))?;
        self.state = DeviceState::Live;

        log::info!(
            "[VirtIO] {} {} live: {:?}, features={:#x}, queues={:?}",
            self.info.address,
            self.device_type_name(),
            self.transport_kind(),
            self.accepted.bits(),
            self.queues.iter().map(|q| (q.index(), q.size())).collect::<Vec<_>>()
        );
        Ok(())
    }

    // ----- Runtime -----

    /// Install the callback run when the host signals a config change.
    pub fn set_config_change_handler(
        &mut self,
        handler: impl Fn() -> Result<(), ConfigChangeError> + Send + Sync + 'static,
    ) {
        self.on_config_change = Some(Box::new(handler));
    }

    /// Classify an interrupt on this device's line.
    ///
    /// The ISR register is read exactly once. Queue activity is reported as
    /// the list of queues with used entries; draining them is up to the
    /// driver.
    pub fn handle_interrupt(&self) -> InterruptOutcome {
        if self.state != DeviceState::Live || self.is_failed() {
            return InterruptOutcome::not_ours();
        }

        let cause = match self.access.read_isr() {
            Ok(cause) => cause,
            Err(e) => {
                self.fail(e.into());
                return InterruptOutcome::not_ours();
            }
        };

        #[cfg(feature = "debug-interrupts")]
        log::trace!("[VirtIO] {}: ISR={:#04x}", self.info.address, cause.bits());

        if cause.is_empty() {
            return InterruptOutcome::not_ours();
        }

        if cause.contains(IsrStatus::DEVICE_CONFIG_INTERRUPT) {
            log::debug!("[VirtIO] {}: config changed", self.info.address);
            if let Some(handler) = &self.on_config_change {
                if handler().is_err() {
                    log::error!(
                        "[VirtIO] {}: driver rejected config change",
                        self.info.address
                    );
                    self.fail(TransportError::DeviceFailed);
                }
            }
        }

        let mut pending_queues = QueueSet::new();
        if cause.contains(IsrStatus::QUEUE_INTERRUPT) {
            for queue in self.queues.iter().filter(|queue| queue.has_completions()) {
                pending_queues.insert(queue.index());
            }
        }

        #[cfg(feature = "debug-interrupts")]
        log::trace!("[VirtIO] {}: pending queues {:?}", self.info.address, pending_queues);

        InterruptOutcome { cause, pending_queues }
    }

    /// Write the queue's notification register unconditionally.
    pub fn notify(&self, queue: &Queue) -> Result<(), TransportError> {
        self.ensure_alive()?;
        // The avail index must reach the host before the doorbell.
        fence(Ordering::SeqCst);
        self.access
            .notify(queue.index(), queue.notify_offset())
            .map_err(|e| self.fail(e.into()))
    }

    /// Notify only if the host asked for it. Returns whether it did.
    pub fn kick(&self, queue: &Queue) -> Result<bool, TransportError> {
        if !queue.should_notify() {
            return Ok(false);
        }
        self.notify(queue)?;
        Ok(true)
    }

    /// Read a device-specific config field at byte `offset`.
    pub fn read_config<T: Register>(&self, offset: u32) -> Result<T, TransportError> {
        self.ensure_alive()?;
        let region = self
            .access
            .device_config()
            .map_err(|e| self.fail(e.into()))?
            .ok_or(TransportError::MissingRegion(RegionKind::Device))?;

        let end = offset as usize + T::WIDTH;
        if end > region.len() {
            return Err(TransportError::ConfigOutOfRange { offset, len: T::WIDTH as u32 });
        }
        Ok(region.read(offset as usize))
    }

    /// Run `read` until the host's config generation is the same before and
    /// after it, so multi-field reads are not torn by a concurrent update.
    pub fn read_config_consistent<R>(
        &self,
        mut read: impl FnMut(&Self) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut value = None;
        let stable = poll_until(self.config.config_generation_poll, || -> Result<bool, TransportError> {
            let before = self.config_generation()?;
            let candidate = read(self)?;
            let after = self.config_generation()?;
            if before == after {
                value = Some(candidate);
                Ok(true)
            } else {
                Ok(false)
            }
        })?;

        match value {
            Some(value) if stable => Ok(value),
            _ => {
                log::warn!("[VirtIO] {}: config generation kept changing", self.info.address);
                Err(TransportError::ConfigUnstable)
            }
        }
    }

    fn config_generation(&self) -> Result<u8, TransportError> {
        self.ensure_alive()?;
        self.access.config_generation().map_err(|e| self.fail(e.into()))
    }

    // ----- Accessors -----

    pub fn state(&self) -> DeviceState {
        if self.is_failed() {
            DeviceState::Failed
        } else {
            self.state
        }
    }

    /// Status bits written by the driver.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.status.load(Ordering::Acquire))
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn accepted_features(&self) -> Features {
        self.accepted
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.access.kind()
    }

    pub fn info(&self) -> &FunctionInfo {
        &self.info
    }

    pub fn address(&self) -> FunctionAddress {
        self.info.address
    }

    pub fn interrupt_line(&self) -> u8 {
        self.function.interrupt_line()
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    /// Configured queue by index.
    pub fn queue(&self, index: u16) -> Option<Arc<Queue>> {
        self.queues.iter().find(|queue| queue.index() == index).cloned()
    }

    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.queues
    }

    // ----- Internals -----

    fn ensure_alive(&self) -> Result<(), TransportError> {
        if self.is_failed() {
            Err(TransportError::DeviceFailed)
        } else {
            Ok(())
        }
    }

    fn enter_queues_configured(&mut self) {
        if self.state == DeviceState::FeaturesNegotiated {
            self.state = DeviceState::QueuesConfigured;
        }
    }

    fn write_status(&self, status: DeviceStatus) -> Result<(), MappingError> {
        self.access.set_status(status)?;
        self.status.store(status.bits(), Ordering::Release);
        Ok(())
    }

    fn add_status(&self, bits: DeviceStatus) -> Result<(), MappingError> {
        self.write_status(self.status() | bits)
    }

    /// Mark the device dead and hand back `error` for propagation.
    fn fail(&self, error: TransportError) -> TransportError {
        if !self.failed.swap(true, Ordering::AcqRel) {
            log::error!("[VirtIO] {}: device failed: {}", self.info.address, error);
            // Best effort: the register window may be what failed.
            let _ = self.add_status(DeviceStatus::FAILED);
        }
        error
    }

    fn device_type_name(&self) -> alloc::string::String {
        use alloc::string::ToString;
        match self.info.virtio_device_type() {
            Some(kind) => kind.to_string(),
            None => "device".to_string(),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.info.address)
            .field("transport", &self.transport_kind())
            .field("state", &self.state())
            .field("status", &self.status())
            .field("accepted", &self.accepted)
            .field("queues", &self.queues)
            .finish()
    }
}

/// Largest power of two not above either bound.
fn cap_queue_size(host_size: u16, max: u16) -> u16 {
    let limit = host_size.min(max).max(1);
    1 << (15 - limit.leading_zeros().min(15))
}
