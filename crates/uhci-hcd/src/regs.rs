//! UHCI 1.1 I/O register map, as seen from the host driver.

pub const REG_USBCMD: u16 = 0x00;
pub const REG_USBSTS: u16 = 0x02;
pub const REG_USBINTR: u16 = 0x04;
pub const REG_FRNUM: u16 = 0x06;
pub const REG_FLBASEADD: u16 = 0x08;
pub const REG_SOFMOD: u16 = 0x0c;
pub const REG_PORTSC1: u16 = 0x10;
pub const REG_PORTSC2: u16 = 0x12;

/// Number of root hub ports a UHCI function exposes.
pub const ROOT_PORTS: usize = 2;

// UHCI 1.1 spec, section 2.1.1 "USB Command (USBCMD)".
pub const USBCMD_RS: u16 = 1 << 0;
pub const USBCMD_HCRESET: u16 = 1 << 1;
pub const USBCMD_GRESET: u16 = 1 << 2;
pub const USBCMD_EGSM: u16 = 1 << 3;
pub const USBCMD_FGR: u16 = 1 << 4;
pub const USBCMD_SWDBG: u16 = 1 << 5;
pub const USBCMD_CF: u16 = 1 << 6;
pub const USBCMD_MAXP: u16 = 1 << 7;

// UHCI 1.1 spec, section 2.1.2 "USB Status (USBSTS)".
pub const USBSTS_USBINT: u16 = 1 << 0;
pub const USBSTS_USBERRINT: u16 = 1 << 1;
pub const USBSTS_RESUMEDETECT: u16 = 1 << 2;
pub const USBSTS_HSE: u16 = 1 << 3;
pub const USBSTS_HCPROCESSERR: u16 = 1 << 4;
pub const USBSTS_HCHALTED: u16 = 1 << 5;

/// Bits which are write-1-to-clear in [`REG_USBSTS`].
pub const USBSTS_W1C_MASK: u16 = USBSTS_USBINT
    | USBSTS_USBERRINT
    | USBSTS_RESUMEDETECT
    | USBSTS_HSE
    | USBSTS_HCPROCESSERR;

/// Status bits that mean the controller stopped walking the schedule on its own.
pub const USBSTS_FATAL_MASK: u16 = USBSTS_HSE | USBSTS_HCPROCESSERR;

// UHCI 1.1 spec, section 2.1.3 "USB Interrupt Enable (USBINTR)".
pub const USBINTR_TIMEOUT_CRC: u16 = 1 << 0;
pub const USBINTR_RESUME: u16 = 1 << 1;
pub const USBINTR_IOC: u16 = 1 << 2;
pub const USBINTR_SHORT_PACKET: u16 = 1 << 3;

pub const USBINTR_ALL: u16 =
    USBINTR_TIMEOUT_CRC | USBINTR_RESUME | USBINTR_IOC | USBINTR_SHORT_PACKET;

/// FRNUM is 11 bits wide, but only the low 10 index the frame list.
pub const FRNUM_MASK: u16 = 0x07ff;
pub const FRAME_LIST_INDEX_MASK: u16 = 0x03ff;

// UHCI 1.1 spec, section 2.1.7 "Port Status and Control (PORTSC)".
pub const PORTSC_CCS: u16 = 1 << 0;
pub const PORTSC_CSC: u16 = 1 << 1;
pub const PORTSC_PED: u16 = 1 << 2;
pub const PORTSC_PEDC: u16 = 1 << 3;
pub const PORTSC_LSDA: u16 = 1 << 8;
pub const PORTSC_PR: u16 = 1 << 9;
pub const PORTSC_SUSP: u16 = 1 << 12;

/// Change bits reported by [`crate::Hcd::poll_periodic_status`].
pub const PORTSC_CHANGE_MASK: u16 = PORTSC_CSC | PORTSC_PEDC;

pub fn portsc_offset(port: usize) -> u16 {
    REG_PORTSC1 + (port as u16) * 2
}
