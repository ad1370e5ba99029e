//! Lazily mapped BAR register windows.
//!
//! A [`RegisterWindow`] is created the first time any region inside its BAR
//! is touched and is never unmapped: the device may still raise interrupts
//! that reference it. A failed mapping is cached too, so the error surfaces
//! once per BAR instead of retrying on every access.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::array;

use spin::Once;

use crate::bus::{BarWindow, FunctionHandle, Platform};
use crate::capability::ConfigurationRegion;
use crate::config::BAR_COUNT;
use crate::error::MappingError;
use crate::io::{Register, RegisterIo};

/// Typed register access to one mapped BAR.
pub struct RegisterWindow {
    bar: u8,
    base: u64,
    size: u64,
    io: Box<dyn RegisterIo>,
}

impl RegisterWindow {
    /// Wrap a mapped BAR.
    pub fn new(window: &BarWindow, io: Box<dyn RegisterIo>) -> Self {
        Self { bar: window.index, base: window.address, size: window.size, io }
    }

    pub fn bar(&self) -> u8 {
        self.bar
    }

    /// Bus address of the BAR.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read a `T` at byte `offset`.
    pub fn read<T: Register>(&self, offset: usize) -> T {
        debug_assert!((offset + T::WIDTH) as u64 <= self.size, "BAR{} read past end", self.bar);
        T::read_from(self.io.as_ref(), offset)
    }

    /// Write a `T` at byte `offset`.
    pub fn write<T: Register>(&self, offset: usize, value: T) {
        debug_assert!((offset + T::WIDTH) as u64 <= self.size, "BAR{} write past end", self.bar);
        T::write_to(self.io.as_ref(), offset, value)
    }
}

/// The windows of one function, keyed by BAR index.
pub struct WindowTable {
    bars: [Option<BarWindow>; BAR_COUNT],
    platform: Arc<dyn Platform>,
    windows: [Once<Result<RegisterWindow, MappingError>>; BAR_COUNT],
}

impl WindowTable {
    /// Record the function's BAR assignments. Nothing is mapped yet.
    pub fn new(function: &dyn FunctionHandle, platform: Arc<dyn Platform>) -> Self {
        Self {
            bars: array::from_fn(|index| function.bar_window(index as u8)),
            platform,
            windows: array::from_fn(|_| Once::new()),
        }
    }

    /// BAR descriptor without mapping it.
    pub fn descriptor(&self, bar: u8) -> Option<&BarWindow> {
        self.bars.get(bar as usize).and_then(Option::as_ref)
    }

    /// Get (mapping on first use) the window for `bar`.
    pub fn get(&self, bar: u8) -> Result<&RegisterWindow, MappingError> {
        let slot = self.windows.get(bar as usize).ok_or(MappingError::MissingBar(bar))?;
        slot.call_once(|| {
            let descriptor = self.descriptor(bar).ok_or(MappingError::MissingBar(bar))?;
            let io = self.platform.map_window(descriptor).map_err(|e| {
                log::error!("[VirtIO] Mapping BAR{} at {:#x} failed: {}", bar, descriptor.address, e);
                e
            })?;
            log::debug!(
                "[VirtIO] Mapped BAR{} ({:?}) {:#x}+{:#x}",
                bar,
                descriptor.kind,
                descriptor.address,
                descriptor.size
            );
            Ok(RegisterWindow::new(descriptor, io))
        })
        .as_ref()
        .map_err(|e| *e)
    }

    /// Whether `bar` has already been mapped (successfully or not).
    pub fn is_mapped(&self, bar: u8) -> bool {
        self.windows.get(bar as usize).map_or(false, |slot| slot.is_completed())
    }

    /// Resolve a capability region to its window, checking it fits the BAR.
    pub fn region(&self, region: &ConfigurationRegion) -> Result<RegionWindow<'_>, MappingError> {
        let window = self.get(region.bar)?;
        if region.end() > window.size() {
            return Err(MappingError::OutOfBounds {
                bar: region.bar,
                offset: region.offset,
                length: region.length,
            });
        }
        Ok(RegionWindow { window, offset: region.offset as usize, length: region.length as usize })
    }
}

/// A capability region inside a mapped window. Offsets are region-relative.
#[derive(Clone, Copy)]
pub struct RegionWindow<'a> {
    window: &'a RegisterWindow,
    offset: usize,
    length: usize,
}

impl<'a> RegionWindow<'a> {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn read<T: Register>(&self, offset: usize) -> T {
        debug_assert!(offset + T::WIDTH <= self.length, "region read past end");
        self.window.read(self.offset + offset)
    }

    pub fn write<T: Register>(&self, offset: usize, value: T) {
        debug_assert!(offset + T::WIDTH <= self.length, "region write past end");
        self.window.write(self.offset + offset, value)
    }
}
