//! In-memory VirtIO host for unit tests.
//!
//! [`FakeHost`] models the device side of both register layouts (modern
//! capability regions in memory BAR4, legacy block in I/O BAR0) and can
//! consume available ring entries like a real backend. DMA memory comes from
//! the heap with physical == virtual addresses, so the host side reads the
//! rings straight through the addresses the driver programmed.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::bus::{
    BarKind, BarWindow, Bus, FunctionAddress, FunctionHandle, FunctionInfo, Platform,
    RawCapability,
};
use crate::config::{PAGE_SIZE, PCI_CAP_ID_VNDR, VIRTIO_VENDOR_ID};
use crate::dma::DmaRegion;
use crate::error::{AllocError, MappingError};
use crate::features::Features;
use crate::io::RegisterIo;
use crate::queue::{need_event, DescFlags, RingAddresses, VirtqDesc, VirtqUsedElem};
use crate::status::{DeviceStatus, IsrStatus};

const MODERN_BAR: u8 = 4;
const MODERN_BAR_SIZE: u64 = 0x4000;
const COMMON_OFFSET: usize = 0x0000;
const ISR_OFFSET: usize = 0x1000;
const DEVICE_OFFSET: usize = 0x2000;
const NOTIFY_OFFSET: usize = 0x3000;
const NOTIFY_MULTIPLIER: usize = 4;

const LEGACY_BAR: u8 = 0;
const LEGACY_BAR_SIZE: u64 = 0x40;

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

/// Host-side view of one queue's registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostQueue {
    pub max_size: u16,
    pub size: u16,
    pub notify_off: u16,
    pub desc: u64,
    pub driver: u64,
    pub device: u64,
    pub enabled: bool,
}

struct HostState {
    status: u8,
    device_features: u64,
    driver_features: u64,
    device_feature_select: u32,
    driver_feature_select: u32,
    queue_select: u16,
    queues: Vec<HostQueue>,
    rings: Vec<Option<HostRing>>,
    isr: u8,
    config: Vec<u8>,
    config_generation: u8,
    notifications: Vec<(u16, u16)>,
    status_writes: Vec<u8>,
    enable_writes: Vec<u16>,
    status_reads: usize,
    isr_reads: usize,
    reject_features_ok: bool,
    never_clears_status: bool,
    bus_mastering: bool,
}

impl HostState {
    fn new(device_features: u64, queue_sizes: &[u16], legacy: bool) -> Self {
        let mut state = Self {
            status: 0,
            device_features,
            driver_features: 0,
            device_feature_select: 0,
            driver_feature_select: 0,
            queue_select: 0,
            queues: Vec::new(),
            rings: Vec::new(),
            isr: 0,
            config: Vec::new(),
            config_generation: 0,
            notifications: Vec::new(),
            status_writes: Vec::new(),
            enable_writes: Vec::new(),
            status_reads: 0,
            isr_reads: 0,
            reject_features_ok: false,
            never_clears_status: false,
            bus_mastering: false,
        };
        state.set_queues(queue_sizes, legacy);
        state
    }

    fn set_queues(&mut self, sizes: &[u16], legacy: bool) {
        self.queues = sizes
            .iter()
            .enumerate()
            .map(|(index, &size)| HostQueue {
                max_size: size,
                size,
                notify_off: if legacy { 0 } else { index as u16 },
                ..HostQueue::default()
            })
            .collect();
        self.rings = sizes.iter().map(|_| None).collect();
    }

    fn selected(&mut self) -> Option<&mut HostQueue> {
        self.queues.get_mut(self.queue_select as usize)
    }

    fn write_status(&mut self, value: u8) {
        self.status_writes.push(value);
        if value == 0 {
            if !self.never_clears_status {
                self.reset();
            }
            return;
        }
        let mut value = DeviceStatus::from_bits_retain(value);
        if self.reject_features_ok {
            value.remove(DeviceStatus::FEATURES_OK);
        }
        self.status = value.bits();
    }

    fn reset(&mut self) {
        self.status = 0;
        self.driver_features = 0;
        self.queue_select = 0;
        self.isr = 0;
        for queue in &mut self.queues {
            queue.size = queue.max_size;
            queue.desc = 0;
            queue.driver = 0;
            queue.device = 0;
            queue.enabled = false;
        }
        for ring in &mut self.rings {
            *ring = None;
        }
    }

    fn read_status(&mut self) -> u32 {
        self.status_reads += 1;
        self.status as u32
    }

    fn read_isr(&mut self) -> u32 {
        self.isr_reads += 1;
        core::mem::take(&mut self.isr) as u32
    }

    fn read_config(&self, offset: usize, width: usize) -> u32 {
        (0..width).fold(0u32, |value, i| {
            let byte = self.config.get(offset + i).copied().unwrap_or(0);
            value | (byte as u32) << (8 * i)
        })
    }

    fn start_ring(&mut self, index: u16) {
        let Some(queue) = self.queues.get(index as usize) else { return };
        let addresses =
            RingAddresses { desc: queue.desc, driver: queue.driver, device: queue.device };
        self.rings[index as usize] = Some(HostRing::new(addresses, queue.size));
    }

    // ----- Modern layout (BAR4) -----

    fn modern_read(&mut self, offset: usize, width: usize) -> u32 {
        match offset {
            o if o < ISR_OFFSET => self.common_read(o - COMMON_OFFSET),
            o if o < DEVICE_OFFSET => self.read_isr(),
            o if o < NOTIFY_OFFSET => self.read_config(o - DEVICE_OFFSET, width),
            _ => 0,
        }
    }

    fn modern_write(&mut self, offset: usize, value: u32) {
        match offset {
            o if o < ISR_OFFSET => self.common_write(o - COMMON_OFFSET, value),
            o if o >= NOTIFY_OFFSET => {
                let slot = (o - NOTIFY_OFFSET) / NOTIFY_MULTIPLIER;
                self.notifications.push((value as u16, slot as u16));
            }
            _ => {}
        }
    }

    fn common_read(&mut self, offset: usize) -> u32 {
        let selected = self.queues.get(self.queue_select as usize).cloned().unwrap_or_default();
        match offset {
            0x00 => self.device_feature_select,
            0x04 => match self.device_feature_select {
                0 => self.device_features as u32,
                1 => (self.device_features >> 32) as u32,
                _ => 0,
            },
            0x08 => self.driver_feature_select,
            0x0C => match self.driver_feature_select {
                0 => self.driver_features as u32,
                1 => (self.driver_features >> 32) as u32,
                _ => 0,
            },
            0x10 | 0x1A => 0xFFFF,
            0x12 => self.queues.len() as u32,
            0x14 => self.read_status(),
            0x15 => self.config_generation as u32,
            0x16 => self.queue_select as u32,
            0x18 => selected.size as u32,
            0x1C => selected.enabled as u32,
            0x1E => selected.notify_off as u32,
            0x20 => selected.desc as u32,
            0x24 => (selected.desc >> 32) as u32,
            0x28 => selected.driver as u32,
            0x2C => (selected.driver >> 32) as u32,
            0x30 => selected.device as u32,
            0x34 => (selected.device >> 32) as u32,
            _ => 0,
        }
    }

    fn common_write(&mut self, offset: usize, value: u32) {
        match offset {
            0x00 => self.device_feature_select = value,
            0x08 => self.driver_feature_select = value,
            0x0C => {
                let shift = match self.driver_feature_select {
                    0 => 0,
                    1 => 32,
                    _ => return,
                };
                self.driver_features &= !(0xFFFF_FFFFu64 << shift);
                self.driver_features |= (value as u64) << shift;
            }
            0x14 => self.write_status(value as u8),
            0x16 => self.queue_select = value as u16,
            0x18 => {
                if let Some(queue) = self.selected() {
                    if value as u16 <= queue.max_size {
                        queue.size = value as u16;
                    }
                }
            }
            0x1C => {
                let index = self.queue_select;
                self.enable_writes.push(index);
                if let Some(queue) = self.selected() {
                    queue.enabled = value == 1;
                }
                self.start_ring(index);
            }
            0x20..=0x37 => {
                let Some(queue) = self.selected() else { return };
                let field = match offset & !7 {
                    0x20 => &mut queue.desc,
                    0x28 => &mut queue.driver,
                    _ => &mut queue.device,
                };
                let shift = if offset & 4 == 0 { 0 } else { 32 };
                *field &= !(0xFFFF_FFFFu64 << shift);
                *field |= (value as u64) << shift;
            }
            _ => {}
        }
    }

    // ----- Legacy layout (I/O BAR0) -----

    fn legacy_read(&mut self, offset: usize, width: usize) -> u32 {
        let selected = self.queues.get(self.queue_select as usize).cloned().unwrap_or_default();
        match offset {
            0x00 => self.device_features as u32,
            0x04 => self.driver_features as u32,
            0x08 => (selected.desc / PAGE_SIZE as u64) as u32,
            0x0C => selected.size as u32,
            0x0E => self.queue_select as u32,
            0x12 => self.read_status(),
            0x13 => self.read_isr(),
            o if o >= 0x14 => self.read_config(o - 0x14, width),
            _ => 0,
        }
    }

    fn legacy_write(&mut self, offset: usize, value: u32) {
        match offset {
            0x04 => self.driver_features = value as u64,
            0x08 => {
                let index = self.queue_select;
                let Some(queue) = self.selected() else { return };
                let n = queue.size as u64;
                queue.desc = value as u64 * PAGE_SIZE as u64;
                queue.driver = queue.desc + 16 * n;
                let avail_end = queue.driver + 6 + 2 * n;
                queue.device = avail_end.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
                queue.enabled = value != 0;
                if value != 0 {
                    self.start_ring(index);
                }
            }
            0x0E => self.queue_select = value as u16,
            0x10 => self.notifications.push((value as u16, 0)),
            0x12 => self.write_status(value as u8),
            _ => {}
        }
    }
}

/// A simulated VirtIO device. Clones share state.
#[derive(Clone)]
pub struct FakeHost {
    id: u64,
    legacy: bool,
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    /// Modern network device offering VERSION_1 and IN_ORDER, two queues.
    pub fn modern() -> Self {
        let features = Features::VERSION_1 | Features::IN_ORDER;
        Self::build(false, HostState::new(features.bits(), &[256, 256], false))
    }

    /// Transitional network device driven through the legacy block.
    pub fn legacy() -> Self {
        Self::build(true, HostState::new(0x0100_0020, &[256, 256], true))
    }

    fn build(legacy: bool, state: HostState) -> Self {
        Self {
            id: NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed),
            legacy,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_queues(self, sizes: &[u16]) -> Self {
        self.state.lock().set_queues(sizes, self.legacy);
        self
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn bar_window(&self, index: u8) -> Option<BarWindow> {
        match (self.legacy, index) {
            (false, MODERN_BAR) => Some(BarWindow {
                index,
                kind: BarKind::Memory,
                address: 0xFE00_0000 + self.id * 0x10_0000,
                size: MODERN_BAR_SIZE,
            }),
            (true, LEGACY_BAR) => Some(BarWindow {
                index,
                kind: BarKind::Io,
                address: 0x1000 + self.id * LEGACY_BAR_SIZE,
                size: LEGACY_BAR_SIZE,
            }),
            _ => None,
        }
    }

    // ----- Knobs -----

    pub fn set_device_features(&self, features: u64) {
        self.state.lock().device_features = features;
    }

    pub fn set_config(&self, bytes: &[u8]) {
        self.state.lock().config = bytes.to_vec();
    }

    pub fn bump_config_generation(&self) {
        let mut state = self.state.lock();
        state.config_generation = state.config_generation.wrapping_add(1);
    }

    /// Never echo FEATURES_OK.
    pub fn reject_features_ok(&self, reject: bool) {
        self.state.lock().reject_features_ok = reject;
    }

    /// Ignore reset requests, leaving a non-zero status.
    pub fn never_clears_status(&self, stuck: bool) {
        let mut state = self.state.lock();
        state.never_clears_status = stuck;
        if stuck && state.status == 0 {
            state.status = DeviceStatus::ACKNOWLEDGE.bits();
        }
    }

    pub fn raise(&self, cause: IsrStatus) {
        self.state.lock().isr |= cause.bits();
    }

    /// Consume every available entry of `queue`, reporting `written` bytes
    /// for each. Returns the number of chains completed.
    pub fn complete(&self, queue: u16, written: u32) -> usize {
        let mut state = self.state.lock();
        match state.rings.get_mut(queue as usize).and_then(Option::as_mut) {
            Some(ring) => ring.complete_all(written).len(),
            None => 0,
        }
    }

    // ----- Observations -----

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.state.lock().status)
    }

    pub fn status_writes(&self) -> Vec<u8> {
        self.state.lock().status_writes.clone()
    }

    pub fn status_reads(&self) -> usize {
        self.state.lock().status_reads
    }

    pub fn isr_reads(&self) -> usize {
        self.state.lock().isr_reads
    }

    pub fn driver_features(&self) -> u64 {
        self.state.lock().driver_features
    }

    pub fn queue(&self, index: u16) -> HostQueue {
        self.state.lock().queues.get(index as usize).cloned().unwrap_or_default()
    }

    /// Queue indices in the order their enable bit was written.
    pub fn enable_writes(&self) -> Vec<u16> {
        self.state.lock().enable_writes.clone()
    }

    /// `(value written, notify slot)` per doorbell write.
    pub fn notifications(&self) -> Vec<(u16, u16)> {
        self.state.lock().notifications.clone()
    }

    pub fn bus_mastering(&self) -> bool {
        self.state.lock().bus_mastering
    }

    fn capabilities(&self) -> Vec<RawCapability> {
        let config_len = self.state.lock().config.len() as u32;
        vec![
            // MSI-X, ignored by the parser.
            RawCapability::new(0x40, vec![0x11, 0x50, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            vendor_cap(0x50, 1, COMMON_OFFSET as u32, 0x38, None),
            vendor_cap(0x60, 2, NOTIFY_OFFSET as u32, 0x1000, Some(NOTIFY_MULTIPLIER as u32)),
            vendor_cap(0x74, 3, ISR_OFFSET as u32, 4, None),
            vendor_cap(0x84, 4, DEVICE_OFFSET as u32, config_len, None),
        ]
    }
}

fn vendor_cap(at: u8, cfg_type: u8, offset: u32, length: u32, multiplier: Option<u32>) -> RawCapability {
    let cap_len = if multiplier.is_some() { 20 } else { 16 };
    let mut bytes = vec![PCI_CAP_ID_VNDR, 0, cap_len, cfg_type, MODERN_BAR, 0, 0, 0];
    bytes.extend_from_slice(&offset.to_le_bytes());
    bytes.extend_from_slice(&length.to_le_bytes());
    if let Some(multiplier) = multiplier {
        bytes.extend_from_slice(&multiplier.to_le_bytes());
    }
    RawCapability::new(at, bytes)
}

/// Register window handed out by [`FakePlatform`].
struct FakeWindow {
    host: FakeHost,
}

impl FakeWindow {
    fn read(&self, offset: usize, width: usize) -> u32 {
        let mut state = self.host.state.lock();
        if self.host.legacy {
            state.legacy_read(offset, width)
        } else {
            state.modern_read(offset, width)
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.host.state.lock();
        if self.host.legacy {
            state.legacy_write(offset, value)
        } else {
            state.modern_write(offset, value)
        }
    }
}

impl RegisterIo for FakeWindow {
    fn read8(&self, offset: usize) -> u8 {
        self.read(offset, 1) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        self.read(offset, 2) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        self.read(offset, 4)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write(offset, value as u32)
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write(offset, value as u32)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }
}

/// PCI function backed by a [`FakeHost`].
#[derive(Clone)]
pub struct FakeFunction {
    host: FakeHost,
    info: FunctionInfo,
    irq: u8,
    has_capabilities: bool,
}

impl FakeFunction {
    pub fn new(host: &FakeHost) -> Self {
        Self::at(host, FunctionAddress::new(0, 3, 0), 11)
    }

    pub fn at(host: &FakeHost, address: FunctionAddress, irq: u8) -> Self {
        let device_id = if host.legacy { 0x1000 } else { 0x1041 };
        Self {
            host: host.clone(),
            info: FunctionInfo { address, vendor_id: VIRTIO_VENDOR_ID, device_id, subsystem_id: 1 },
            irq,
            has_capabilities: !host.legacy,
        }
    }

    pub fn without_capabilities(mut self) -> Self {
        self.has_capabilities = false;
        self
    }

    pub fn with_vendor(mut self, vendor_id: u16) -> Self {
        self.info.vendor_id = vendor_id;
        self
    }
}

impl FunctionHandle for FakeFunction {
    fn info(&self) -> FunctionInfo {
        self.info
    }

    fn capabilities(&self) -> Vec<RawCapability> {
        if self.has_capabilities {
            self.host.capabilities()
        } else {
            Vec::new()
        }
    }

    fn bar_window(&self, index: u8) -> Option<BarWindow> {
        self.host.bar_window(index)
    }

    fn enable_bus_mastering(&self) {
        self.host.state.lock().bus_mastering = true;
    }

    fn interrupt_line(&self) -> u8 {
        self.irq
    }
}

pub struct FakeBus {
    functions: Vec<FakeFunction>,
}

impl FakeBus {
    pub fn new(functions: Vec<FakeFunction>) -> Self {
        Self { functions }
    }
}

impl Bus for FakeBus {
    fn enumerate(&self, predicate: &dyn Fn(&FunctionInfo) -> bool) -> Vec<Box<dyn FunctionHandle>> {
        self.functions
            .iter()
            .filter(|function| predicate(&function.info))
            .map(|function| Box::new(function.clone()) as Box<dyn FunctionHandle>)
            .collect()
    }
}

/// Platform with heap-backed DMA and windows routed to attached hosts.
pub struct FakePlatform {
    hosts: Mutex<Vec<FakeHost>>,
    maps: AtomicUsize,
    fail_mapping: AtomicBool,
    live: AtomicUsize,
}

impl FakePlatform {
    pub fn new(host: &FakeHost) -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(vec![host.clone()]),
            maps: AtomicUsize::new(0),
            fail_mapping: AtomicBool::new(false),
            live: AtomicUsize::new(0),
        })
    }

    /// Serve another host's BARs.
    pub fn attach(&self, host: &FakeHost) {
        self.hosts.lock().push(host.clone());
    }

    pub fn fail_mapping(&self, fail: bool) {
        self.fail_mapping.store(fail, Ordering::SeqCst);
    }

    pub fn map_count(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Platform for FakePlatform {
    fn map_window(&self, window: &BarWindow) -> Result<Box<dyn RegisterIo>, MappingError> {
        self.maps.fetch_add(1, Ordering::SeqCst);
        if self.fail_mapping.load(Ordering::SeqCst) {
            return Err(MappingError::MapFailed(window.index));
        }
        let hosts = self.hosts.lock();
        let host = hosts
            .iter()
            .find(|host| host.bar_window(window.index) == Some(*window))
            .ok_or(MappingError::MapFailed(window.index))?;
        Ok(Box::new(FakeWindow { host: host.clone() }))
    }

    fn dma_alloc(&self, pages: usize) -> Result<DmaRegion, AllocError> {
        let len = pages * PAGE_SIZE;
        let layout =
            Layout::from_size_align(len, PAGE_SIZE).map_err(|_| AllocError::OutOfMemory { pages })?;
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(AllocError::OutOfMemory { pages })?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(unsafe { DmaRegion::new(virt.as_ptr() as u64, virt, len) })
    }

    unsafe fn dma_dealloc(&self, region: &DmaRegion) {
        let layout = Layout::from_size_align_unchecked(region.len(), PAGE_SIZE);
        dealloc(region.virt().as_ptr(), layout);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Device side of one split ring, reading guest memory directly.
pub struct HostRing {
    addresses: RingAddresses,
    size: u16,
    last_avail: u16,
    used_idx: u16,
}

impl HostRing {
    pub fn new(addresses: RingAddresses, size: u16) -> Self {
        Self { addresses, size, last_avail: 0, used_idx: 0 }
    }

    fn read<T: Copy>(address: u64) -> T {
        unsafe { ptr::read_volatile(address as *const T) }
    }

    fn write<T: Copy>(address: u64, value: T) {
        unsafe { ptr::write_volatile(address as *mut T, value) }
    }

    pub fn avail_flags(&self) -> u16 {
        Self::read(self.addresses.driver)
    }

    pub fn avail_idx(&self) -> u16 {
        Self::read(self.addresses.driver + 2)
    }

    pub fn avail_entry(&self, position: u16) -> u16 {
        let slot = (position % self.size) as u64;
        Self::read(self.addresses.driver + 4 + 2 * slot)
    }

    pub fn used_event(&self) -> u16 {
        Self::read(self.addresses.driver + 4 + 2 * self.size as u64)
    }

    /// Used index published so far.
    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    /// Whether moving the used index from `old` to its current value crosses
    /// the driver's `used_event`.
    pub fn event_wants_interrupt(&self, old: u16) -> bool {
        need_event(self.used_event(), self.used_idx, old)
    }

    pub fn set_used_flags(&self, flags: u16) {
        Self::write(self.addresses.device, flags)
    }

    pub fn set_avail_event(&self, idx: u16) {
        Self::write(self.addresses.device + 4 + 8 * self.size as u64, idx)
    }

    pub fn descriptor(&self, index: u16) -> VirtqDesc {
        Self::read(self.addresses.desc + 16 * index as u64)
    }

    /// Follow a chain from `head`.
    pub fn chain(&self, head: u16) -> Vec<VirtqDesc> {
        let mut chain = Vec::new();
        let mut index = head;
        loop {
            let desc = self.descriptor(index);
            chain.push(desc);
            if desc.flags & DescFlags::NEXT.bits() == 0 || chain.len() > self.size as usize {
                return chain;
            }
            index = desc.next;
        }
    }

    /// Append a used element and publish the new used index.
    pub fn push_used(&mut self, id: u32, len: u32) {
        let slot = (self.used_idx % self.size) as u64;
        Self::write(self.addresses.device + 4 + 8 * slot, VirtqUsedElem { id, len });
        fence(Ordering::Release);
        self.used_idx = self.used_idx.wrapping_add(1);
        Self::write(self.addresses.device + 2, self.used_idx);
    }

    /// Complete every available chain. Returns the heads in ring order.
    pub fn complete_all(&mut self, written: u32) -> Vec<u16> {
        let avail_idx = self.avail_idx();
        fence(Ordering::Acquire);
        let mut heads = Vec::new();
        while self.last_avail != avail_idx {
            let head = self.avail_entry(self.last_avail);
            self.last_avail = self.last_avail.wrapping_add(1);
            self.push_used(head as u32, written);
            heads.push(head);
        }
        heads
    }
}
