//! Device status and interrupt status registers.

bitflags::bitflags! {
    /// Device status byte (VirtIO 1.1 §2.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest has noticed the device.
        const ACKNOWLEDGE = 0x01;
        /// Guest knows how to drive the device.
        const DRIVER = 0x02;
        /// Driver is set up and ready to drive the device.
        const DRIVER_OK = 0x04;
        /// Feature negotiation complete.
        const FEATURES_OK = 0x08;
        /// Device has experienced an error and needs reset.
        const NEEDS_RESET = 0x40;
        /// Something went wrong; the device is unusable.
        const FAILED = 0x80;
    }
}

bitflags::bitflags! {
    /// ISR status byte. Reading it acknowledges the interrupt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IsrStatus: u8 {
        /// At least one virtqueue has new used entries.
        const QUEUE_INTERRUPT = 0x01;
        /// Device-specific configuration changed.
        const DEVICE_CONFIG_INTERRUPT = 0x02;
    }
}
