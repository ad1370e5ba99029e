//! Split virtqueue implementation.
//!
//! Virtqueues are the mechanism for bulk data transport between the driver
//! and the device. Each [`Queue`] owns one contiguous ring block (see
//! [`RingLayout`]) and a free list of descriptor indices, all behind a
//! per-queue spin lock that may be taken from interrupt context.
//!
//! Requests are built with a [`QueueChain`] and published with
//! [`Queue::submit`]; finished requests come back through
//! [`Queue::drain_completed`]. The lock is held only inside each call, with
//! interrupts masked, so a driver may submit while it drains.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};
use core::{fmt, ptr};

use spin::Mutex;

use crate::bus::Platform;
use crate::config::MAX_QUEUE_SIZE;
use crate::dma::{DmaArena, DmaSlice, DmaValue, RingLayout};
use crate::error::QueueError;
use crate::irq;

bitflags::bitflags! {
    /// VirtQueue descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the next field.
        const NEXT = 1;
        /// Buffer is write-only (device writes, driver reads).
        const WRITE = 2;
        /// Buffer contains a list of buffer descriptors (indirect).
        const INDIRECT = 4;
    }
}

bitflags::bitflags! {
    /// Driver-owned available ring flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AvailFlags: u16 {
        /// Ask the device not to interrupt on consumption.
        const NO_INTERRUPT = 1;
    }
}

bitflags::bitflags! {
    /// Device-owned used ring flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsedFlags: u16 {
        /// The device does not need a notification for new buffers.
        const NO_NOTIFY = 1;
    }
}

/// A virtqueue descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqDesc {
    /// Physical address of buffer.
    pub addr: u64,
    /// Length of buffer.
    pub len: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index if NEXT flag is set.
    pub next: u16,
}

/// Used ring element.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqUsedElem {
    /// Index of the descriptor chain head.
    pub id: u32,
    /// Total bytes written to buffer.
    pub len: u32,
}

// SAFETY: plain integers, no padding.
unsafe impl DmaValue for VirtqDesc {}
unsafe impl DmaValue for VirtqUsedElem {}

/// Which side of the transfer may touch a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    /// Driver fills it, device reads it.
    DeviceReadable,
    /// Device fills it, driver reads it.
    DeviceWritable,
}

/// One buffer of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub addr: u64,
    pub len: u32,
    pub direction: BufferDirection,
}

/// A chain handed back by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChain {
    /// Head descriptor index returned by `submit`.
    pub head: u16,
    /// The buffers as they were submitted.
    pub buffers: Vec<BufferDescriptor>,
    /// Bytes the device reports having written into the writable buffers.
    pub written: u32,
}

/// Physical addresses the device must be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAddresses {
    /// Descriptor table.
    pub desc: u64,
    /// Available ring ("driver area").
    pub driver: u64,
    /// Used ring ("device area").
    pub device: u64,
}

/// Shared ring memory and its typed views.
struct Ring {
    memory: DmaArena,
    desc: DmaSlice<VirtqDesc>,
    /// flags, idx, ring[size], used_event
    avail: DmaSlice<u16>,
    /// flags, idx
    used_header: DmaSlice<u16>,
    used_ring: DmaSlice<VirtqUsedElem>,
    avail_event: DmaSlice<u16>,
}

impl Ring {
    fn new(size: u16, platform: &Arc<dyn Platform>) -> Result<Self, QueueError> {
        let layout = RingLayout::new(size);
        let n = size as usize;
        let memory = DmaArena::allocate(platform, layout.total)?;
        Ok(Self {
            desc: memory.slice(layout.desc, n),
            avail: memory.slice(layout.avail, n + 3),
            used_header: memory.slice(layout.used, 2),
            used_ring: memory.slice(layout.used + 4, n),
            avail_event: memory.slice(layout.used + 4 + 8 * n, 1),
            memory,
        })
    }

    fn addresses(&self) -> RingAddresses {
        RingAddresses {
            desc: self.memory.phys(self.desc, 0),
            driver: self.memory.phys(self.avail, 0),
            device: self.memory.phys(self.used_header, 0),
        }
    }

    fn set_avail_flags(&self, flags: AvailFlags) {
        self.memory.write(self.avail, 0, flags.bits());
    }

    fn set_avail_idx(&self, idx: u16) {
        self.memory.write(self.avail, 1, idx);
    }

    fn set_avail_slot(&self, slot: usize, head: u16) {
        self.memory.write(self.avail, 2 + slot, head);
    }

    fn set_used_event(&self, idx: u16) {
        let at = self.avail.len() - 1;
        self.memory.write(self.avail, at, idx);
    }

    fn used_flags(&self) -> UsedFlags {
        UsedFlags::from_bits_truncate(self.memory.read(self.used_header, 0))
    }

    fn used_idx(&self) -> u16 {
        self.memory.read(self.used_header, 1)
    }

    fn avail_event(&self) -> u16 {
        self.memory.read(self.avail_event, 0)
    }
}

struct InFlight {
    indices: Vec<u16>,
    buffers: Vec<BufferDescriptor>,
}

/// Ring state guarded by the queue lock.
struct QueueState {
    ring: Ring,
    /// Free descriptor stack.
    free: Vec<u16>,
    /// Our copy of `avail.idx`.
    avail_idx: u16,
    /// Next used-ring position to consume.
    last_used: u16,
    /// `avail_idx` at the previous notification decision.
    notified_idx: u16,
    /// Chains owned by the device, keyed by head index.
    in_flight: Vec<Option<InFlight>>,
    in_flight_count: usize,
}

impl QueueState {
    /// Take the used entry at `last_used`. `None` for an entry whose head is
    /// not in flight; it is skipped.
    fn take_used(&mut self, queue: u16, mask: u16) -> Option<CompletedChain> {
        let slot = (self.last_used & mask) as usize;
        let elem = self.ring.memory.read(self.ring.used_ring, slot);
        self.last_used = self.last_used.wrapping_add(1);

        let head = elem.id as usize;
        let Some(InFlight { indices, buffers }) =
            self.in_flight.get_mut(head).and_then(Option::take)
        else {
            log::warn!("[VirtIO Queue] Queue {}: used entry for idle head {}", queue, elem.id);
            return None;
        };

        self.free.extend(indices.iter().rev());
        self.in_flight_count -= 1;
        Some(CompletedChain { head: head as u16, buffers, written: elem.len })
    }

    /// Ask for an interrupt on the next completion after `event`, then look
    /// at the used index again. Entries published before the device saw the
    /// new `used_event` raise no interrupt, so the caller must consume them.
    fn rearm(&mut self, event_idx: bool, event: u16) -> u16 {
        if event_idx {
            self.ring.set_used_event(event);
        }
        fence(Ordering::SeqCst);
        let used = self.ring.used_idx();
        fence(Ordering::Acquire);
        used
    }
}

/// One split virtqueue.
pub struct Queue {
    index: u16,
    size: u16,
    notify_offset: u16,
    event_idx: bool,
    state: Mutex<QueueState>,
}

impl Queue {
    /// Allocate ring memory for a queue of `size` entries.
    ///
    /// `size` must be a power of two no larger than 32768.
    pub fn new(
        index: u16,
        size: u16,
        notify_offset: u16,
        event_idx: bool,
        platform: &Arc<dyn Platform>,
    ) -> Result<Self, QueueError> {
        if size == 0 || size > MAX_QUEUE_SIZE || !size.is_power_of_two() {
            return Err(QueueError::InvalidSize(size));
        }

        let ring = Ring::new(size, platform)?;
        let mut in_flight = Vec::with_capacity(size as usize);
        in_flight.resize_with(size as usize, || None);

        log::debug!(
            "[VirtIO Queue] Queue {} allocated: size={} ring={:#x}",
            index,
            size,
            ring.addresses().desc
        );

        Ok(Self {
            index,
            size,
            notify_offset,
            event_idx,
            state: Mutex::new(QueueState {
                ring,
                // Reversed so descriptors are handed out in ascending order.
                free: (0..size).rev().collect(),
                avail_idx: 0,
                last_used: 0,
                notified_idx: 0,
                in_flight,
                in_flight_count: 0,
            }),
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Offset into the notification area, in multiplier units.
    pub fn notify_offset(&self) -> u16 {
        self.notify_offset
    }

    /// Whether `VIRTIO_F_EVENT_IDX` governs notifications for this queue.
    pub fn uses_event_idx(&self) -> bool {
        self.event_idx
    }

    pub fn ring_addresses(&self) -> RingAddresses {
        self.locked(|state| state.ring.addresses())
    }

    /// Run `f` under the queue lock with interrupts masked, so an interrupt
    /// handler draining this queue cannot spin on a lock its own CPU holds.
    fn locked<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        irq::without_interrupts(|| f(&mut *self.state.lock()))
    }

    /// Start building a request. No lock is taken until `submit`.
    pub fn begin_chain(&self) -> QueueChain<'_> {
        QueueChain { queue: self, buffers: Vec::new() }
    }

    /// Publish a chain to the device and return its head index.
    ///
    /// [`QueueError::Full`] is an expected condition: drain completions and
    /// retry.
    pub fn submit(&self, chain: QueueChain<'_>) -> Result<u16, QueueError> {
        assert!(ptr::eq(chain.queue, self), "chain submitted to a different queue");

        let buffers = chain.buffers;
        if buffers.is_empty() {
            return Err(QueueError::EmptyChain);
        }
        if buffers.len() > self.size as usize {
            return Err(QueueError::ChainTooLong { len: buffers.len(), size: self.size });
        }

        self.locked(|state| self.publish(state, buffers))
    }

    fn publish(&self, state: &mut QueueState, buffers: Vec<BufferDescriptor>) -> Result<u16, QueueError> {
        if state.free.len() < buffers.len() {
            return Err(QueueError::Full { needed: buffers.len(), free: state.free.len() });
        }

        let split = state.free.len() - buffers.len();
        let mut indices = state.free.split_off(split);
        indices.reverse();

        for (position, buffer) in buffers.iter().enumerate() {
            let mut flags = DescFlags::empty();
            if buffer.direction == BufferDirection::DeviceWritable {
                flags |= DescFlags::WRITE;
            }
            let next = match indices.get(position + 1) {
                Some(&next) => {
                    flags |= DescFlags::NEXT;
                    next
                }
                None => 0,
            };
            let desc = VirtqDesc { addr: buffer.addr, len: buffer.len, flags: flags.bits(), next };
            state.ring.memory.write(state.ring.desc, indices[position] as usize, desc);
        }

        let head = indices[0];
        let slot = (state.avail_idx & (self.size - 1)) as usize;
        state.ring.set_avail_slot(slot, head);

        // Descriptors and the ring slot must be visible before the index.
        fence(Ordering::Release);

        state.avail_idx = state.avail_idx.wrapping_add(1);
        let avail_idx = state.avail_idx;
        state.ring.set_avail_idx(avail_idx);

        state.in_flight[head as usize] = Some(InFlight { indices, buffers });
        state.in_flight_count += 1;

        log::trace!(
            "[VirtIO Queue] Queue {} submitted head={} avail_idx={}",
            self.index,
            head,
            avail_idx
        );
        Ok(head)
    }

    /// Iterate over chains the device has finished with.
    ///
    /// Each step takes the queue lock on its own, so submitting from inside
    /// the loop is fine. When the iterator catches up with the used index it
    /// re-arms completion interrupts and checks once more, returning `None`
    /// only when nothing arrived in between. Stopping early leaves the rest
    /// queued; [`has_completions`](Self::has_completions) still reports them.
    pub fn drain_completed(&self) -> Drain<'_> {
        let end = self.locked(|state| {
            let used = state.ring.used_idx();
            // Used entries must not be read before the index that covers them.
            fence(Ordering::Acquire);
            used
        });
        Drain { queue: self, end, done: false }
    }

    /// Whether the device wants to be notified about new buffers.
    ///
    /// Call after submitting and before writing the notify register.
    pub fn should_notify(&self) -> bool {
        self.locked(|state| {
            // The avail index store must be ordered before reading the host's
            // suppression state.
            fence(Ordering::SeqCst);

            let new = state.avail_idx;
            let old = core::mem::replace(&mut state.notified_idx, new);
            if self.event_idx {
                need_event(state.ring.avail_event(), new, old)
            } else {
                !state.ring.used_flags().contains(UsedFlags::NO_NOTIFY)
            }
        })
    }

    /// Ask the device to stop (or resume) interrupting for this queue.
    ///
    /// Advisory only; with `EVENT_IDX` the device consults `used_event`.
    pub fn set_interrupt_suppression(&self, suppress: bool) {
        let flags = if suppress { AvailFlags::NO_INTERRUPT } else { AvailFlags::empty() };
        self.locked(|state| state.ring.set_avail_flags(flags));
    }

    /// Lift interrupt suppression and re-arm `used_event`.
    ///
    /// Returns true if completions are already waiting: they will not raise
    /// an interrupt, so drain the queue again.
    pub fn enable_interrupts(&self) -> bool {
        self.locked(|state| {
            state.ring.set_avail_flags(AvailFlags::empty());
            let last_used = state.last_used;
            state.rearm(self.event_idx, last_used) != last_used
        })
    }

    /// Get the number of free descriptors.
    pub fn free_descriptors(&self) -> usize {
        self.locked(|state| state.free.len())
    }

    /// Chains submitted but not yet drained.
    pub fn in_flight(&self) -> usize {
        self.locked(|state| state.in_flight_count)
    }

    /// Check if the queue has pending completions.
    pub fn has_completions(&self) -> bool {
        self.locked(|state| {
            let used = state.ring.used_idx();
            fence(Ordering::Acquire);
            used != state.last_used
        })
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("index", &self.index)
            .field("size", &self.size)
            .field("notify_offset", &self.notify_offset)
            .field("event_idx", &self.event_idx)
            .finish()
    }
}

/// `vring_need_event`: has `avail_event` been crossed between `old` and `new`?
pub(crate) fn need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

/// Builder for one request against a single queue.
pub struct QueueChain<'a> {
    queue: &'a Queue,
    buffers: Vec<BufferDescriptor>,
}

impl<'a> QueueChain<'a> {
    /// Append a buffer to the chain.
    pub fn add_buffer(&mut self, addr: u64, len: u32, direction: BufferDirection) -> &mut Self {
        self.buffers.push(BufferDescriptor { addr, len, direction });
        self
    }

    /// Append a buffer the device reads.
    pub fn readable(&mut self, addr: u64, len: u32) -> &mut Self {
        self.add_buffer(addr, len, BufferDirection::DeviceReadable)
    }

    /// Append a buffer the device writes.
    pub fn writable(&mut self, addr: u64, len: u32) -> &mut Self {
        self.add_buffer(addr, len, BufferDirection::DeviceWritable)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Submit to the queue the chain was started on.
    pub fn submit(self) -> Result<u16, QueueError> {
        self.queue.submit(self)
    }
}

/// Iterator returned by [`Queue::drain_completed`].
pub struct Drain<'a> {
    queue: &'a Queue,
    /// Used index this pass runs up to.
    end: u16,
    /// Caught up and re-armed.
    done: bool,
}

impl Iterator for Drain<'_> {
    type Item = CompletedChain;

    fn next(&mut self) -> Option<CompletedChain> {
        if self.done {
            return None;
        }
        let queue = self.queue;
        let mask = queue.size - 1;
        let end = &mut self.end;
        let done = &mut self.done;

        queue.locked(|state| loop {
            let pending = end.wrapping_sub(state.last_used);
            if pending == 0 || pending > queue.size {
                let last_used = state.last_used;
                let used = state.rearm(queue.event_idx, last_used);
                if used == last_used {
                    *done = true;
                    return None;
                }
                *end = used;
                continue;
            }
            if let Some(chain) = state.take_used(queue.index, mask) {
                return Some(chain);
            }
        })
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        if self.done || !self.queue.event_idx {
            return;
        }
        // Stopped early: the unconsumed entries stay queued, but the next
        // completion must still interrupt.
        self.queue.locked(|state| {
            let used = state.ring.used_idx();
            state.rearm(true, used);
        });
    }
}
