//! Register I/O backends.
//!
//! A [`RegisterIo`] is a byte-addressed register block: a mapped memory BAR or
//! a legacy I/O port range. The platform returns one per mapped BAR.

use core::ptr::{self, NonNull};

/// Width-typed access to one register block. Offsets are relative to the
/// start of the block.
pub trait RegisterIo: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);
}

/// Types that can be moved through a [`RegisterIo`].
///
/// 64-bit values are split into two 32-bit accesses, low half first, which
/// is what the PCI common configuration layout requires.
pub trait Register: Copy {
    const WIDTH: usize;
    fn read_from(io: &dyn RegisterIo, offset: usize) -> Self;
    fn write_to(io: &dyn RegisterIo, offset: usize, value: Self);
}

impl Register for u8 {
    const WIDTH: usize = 1;
    fn read_from(io: &dyn RegisterIo, offset: usize) -> Self {
        io.read8(offset)
    }
    fn write_to(io: &dyn RegisterIo, offset: usize, value: Self) {
        io.write8(offset, value)
    }
}

impl Register for u16 {
    const WIDTH: usize = 2;
    fn read_from(io: &dyn RegisterIo, offset: usize) -> Self {
        io.read16(offset)
    }
    fn write_to(io: &dyn RegisterIo, offset: usize, value: Self) {
        io.write16(offset, value)
    }
}

impl Register for u32 {
    const WIDTH: usize = 4;
    fn read_from(io: &dyn RegisterIo, offset: usize) -> Self {
        io.read32(offset)
    }
    fn write_to(io: &dyn RegisterIo, offset: usize, value: Self) {
        io.write32(offset, value)
    }
}

impl Register for u64 {
    const WIDTH: usize = 8;
    fn read_from(io: &dyn RegisterIo, offset: usize) -> Self {
        let lo = io.read32(offset) as u64;
        let hi = io.read32(offset + 4) as u64;
        hi << 32 | lo
    }
    fn write_to(io: &dyn RegisterIo, offset: usize, value: Self) {
        io.write32(offset, value as u32);
        io.write32(offset + 4, (value >> 32) as u32);
    }
}

/// Memory-mapped register block accessed with volatile loads and stores.
pub struct MmioRegisters {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the block is device memory; every access is a single volatile op.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wrap an already-mapped register block.
    ///
    /// # Safety
    ///
    /// `base..base + size` must be mapped uncached for the lifetime of the
    /// returned value.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        debug_assert!(
            offset + core::mem::size_of::<T>() <= self.size,
            "MMIO access {:#x} outside {:#x}-byte window",
            offset,
            self.size
        );
        // SAFETY: in bounds per the debug assertion and the constructor contract.
        unsafe { self.base.as_ptr().add(offset) as *mut T }
    }
}

impl RegisterIo for MmioRegisters {
    fn read8(&self, offset: usize) -> u8 {
        unsafe { ptr::read_volatile(self.ptr(offset)) }
    }

    fn read16(&self, offset: usize) -> u16 {
        unsafe { ptr::read_volatile(self.ptr(offset)) }
    }

    fn read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.ptr(offset)) }
    }

    fn write8(&self, offset: usize, value: u8) {
        unsafe { ptr::write_volatile(self.ptr(offset), value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        unsafe { ptr::write_volatile(self.ptr(offset), value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.ptr(offset), value) }
    }
}

/// Legacy I/O port register block (BAR0 of transitional devices).
#[cfg(target_arch = "x86_64")]
pub struct PortRegisters {
    base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortRegisters {
    /// # Safety
    ///
    /// `base` must be the I/O BAR of a VirtIO function with I/O decode enabled.
    pub unsafe fn new(base: u16) -> Self {
        Self { base }
    }

    fn port(&self, offset: usize) -> u16 {
        self.base + offset as u16
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterIo for PortRegisters {
    fn read8(&self, offset: usize) -> u8 {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u8>::new(self.port(offset)).read() }
    }

    fn read16(&self, offset: usize) -> u16 {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u16>::new(self.port(offset)).read() }
    }

    fn read32(&self, offset: usize) -> u32 {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u32>::new(self.port(offset)).read() }
    }

    fn write8(&self, offset: usize, value: u8) {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u8>::new(self.port(offset)).write(value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u16>::new(self.port(offset)).write(value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        use x86_64::instructions::port::Port;
        unsafe { Port::<u32>::new(self.port(offset)).write(value) }
    }
}
