use core::time::Duration;

/// Services the driver consumes from the bus glue (PCI function, I/O BAR, IRQ routing).
///
/// Every method takes `&self`: submission, the interrupt handler and the periodic timer may call
/// into the driver from different threads at the same time.
pub trait HcPlatform: Send + Sync {
    /// Current frame number, 0..=1023.
    fn read_frame_number(&self) -> u16;

    /// Reads a register at `offset` in the UHCI I/O window. `width` is 1, 2 or 4 bytes.
    fn read_reg(&self, offset: u16, width: usize) -> u32;

    fn write_reg(&self, offset: u16, width: usize, value: u32);

    fn enable_interrupts(&self, mask: u16);

    fn disable_interrupts(&self);

    /// Monotonic wall-clock time since an arbitrary origin.
    fn uptime(&self) -> Duration;
}

impl<T: HcPlatform + ?Sized> HcPlatform for std::sync::Arc<T> {
    fn read_frame_number(&self) -> u16 {
        (**self).read_frame_number()
    }

    fn read_reg(&self, offset: u16, width: usize) -> u32 {
        (**self).read_reg(offset, width)
    }

    fn write_reg(&self, offset: u16, width: usize, value: u32) {
        (**self).write_reg(offset, width, value)
    }

    fn enable_interrupts(&self, mask: u16) {
        (**self).enable_interrupts(mask)
    }

    fn disable_interrupts(&self) {
        (**self).disable_interrupts()
    }

    fn uptime(&self) -> Duration {
        (**self).uptime()
    }
}
