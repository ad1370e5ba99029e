//! DMA-visible ring memory.
//!
//! The platform hands out physically contiguous, zeroed blocks as
//! [`DmaRegion`]s. A [`DmaArena`] owns one such block for its lifetime and
//! exposes it only through typed, bounds-checked [`DmaSlice`] handles: queue
//! code addresses ring entries by index and never does pointer arithmetic.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::bus::Platform;
use crate::config::PAGE_SIZE;
use crate::error::AllocError;

/// A physically contiguous allocation shared with the host.
#[derive(Debug)]
pub struct DmaRegion {
    phys: u64,
    virt: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain memory; all access goes through volatile ops
// serialized by the owning queue's lock.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// # Safety
    ///
    /// `virt..virt + len` must be mapped, writable and backed by the
    /// physical range starting at `phys` until the region is returned to
    /// the platform.
    pub unsafe fn new(phys: u64, virt: NonNull<u8>, len: usize) -> Self {
        Self { phys, virt, len }
    }

    /// Physical (bus) address of the first byte.
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Kernel virtual address of the first byte.
    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn pages(&self) -> usize {
        self.len.div_ceil(PAGE_SIZE)
    }
}

/// Values that may live in shared ring memory.
///
/// # Safety
///
/// Every bit pattern must be a valid value and the type must have no
/// padding: the host writes these bytes.
pub unsafe trait DmaValue: Copy {}

unsafe impl DmaValue for u16 {}
unsafe impl DmaValue for u32 {}
unsafe impl DmaValue for u64 {}

/// Index-based handle to `len` consecutive `T`s inside an arena.
pub struct DmaSlice<T> {
    offset: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DmaSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DmaSlice<T> {}

impl<T> DmaSlice<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    /// Byte offset of the slice within its arena.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// One owned DMA block, returned to the platform on drop.
pub struct DmaArena {
    region: DmaRegion,
    platform: Arc<dyn Platform>,
}

impl DmaArena {
    /// Allocate at least `bytes`, rounded up to whole pages.
    pub fn allocate(platform: &Arc<dyn Platform>, bytes: usize) -> Result<Self, AllocError> {
        let pages = bytes.div_ceil(PAGE_SIZE).max(1);
        let region = platform.dma_alloc(pages)?;
        debug_assert!(region.len() >= pages * PAGE_SIZE);
        debug_assert_eq!(region.phys() % PAGE_SIZE as u64, 0, "DMA block not page aligned");
        Ok(Self { region, platform: platform.clone() })
    }

    pub fn region(&self) -> &DmaRegion {
        &self.region
    }

    /// Carve out `len` values of `T` starting at byte `offset`.
    ///
    /// Panics if the slice leaves the arena or is misaligned; both are
    /// layout bugs, not runtime conditions.
    pub fn slice<T: DmaValue>(&self, offset: usize, len: usize) -> DmaSlice<T> {
        let end = offset + len * size_of::<T>();
        assert!(end <= self.region.len(), "DMA slice {:#x}..{:#x} outside arena", offset, end);
        assert_eq!(offset % align_of::<T>(), 0, "misaligned DMA slice at {:#x}", offset);
        DmaSlice { offset, len, _marker: PhantomData }
    }

    /// Bus address of `slice[index]`.
    pub fn phys<T: DmaValue>(&self, slice: DmaSlice<T>, index: usize) -> u64 {
        self.region.phys() + self.byte_offset(slice, index) as u64
    }

    pub fn read<T: DmaValue>(&self, slice: DmaSlice<T>, index: usize) -> T {
        let at = self.byte_offset(slice, index);
        // SAFETY: in bounds and aligned per `slice` and `byte_offset`.
        unsafe { ptr::read_volatile(self.region.virt().as_ptr().add(at) as *const T) }
    }

    pub fn write<T: DmaValue>(&self, slice: DmaSlice<T>, index: usize, value: T) {
        let at = self.byte_offset(slice, index);
        // SAFETY: as for `read`.
        unsafe { ptr::write_volatile(self.region.virt().as_ptr().add(at) as *mut T, value) }
    }

    fn byte_offset<T>(&self, slice: DmaSlice<T>, index: usize) -> usize {
        assert!(index < slice.len, "DMA index {} out of {}", index, slice.len);
        slice.offset + index * size_of::<T>()
    }
}

impl Drop for DmaArena {
    fn drop(&mut self) {
        // SAFETY: the arena is the sole owner and the queue holding it is gone.
        unsafe { self.platform.dma_dealloc(&self.region) }
    }
}

/// Byte layout of a split virtqueue in one contiguous block.
///
/// The used ring starts on a page boundary so the same block also satisfies
/// the legacy transport, which only learns the descriptor table's page frame
/// number and derives the other two addresses from the queue size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub size: u16,
    pub desc: usize,
    pub avail: usize,
    pub used: usize,
    pub total: usize,
}

impl RingLayout {
    pub fn new(size: u16) -> Self {
        let n = size as usize;
        let desc = 0;
        let avail = desc + 16 * n;
        let avail_end = avail + 6 + 2 * n;
        let used = align_up(avail_end, PAGE_SIZE);
        let total = used + 6 + 8 * n;
        Self { size, desc, avail, used, total }
    }

    pub fn pages(&self) -> usize {
        self.total.div_ceil(PAGE_SIZE)
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
