use thiserror::Error;

pub type Result<T> = std::result::Result<T, HcdError>;

/// Errors returned synchronously by submission, cancellation and configuration calls.
///
/// Nothing is left linked into the hardware schedule when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HcdError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("endpoint {endpoint} of device {device} is halted")]
    EndpointHalted { device: u8, endpoint: u8 },

    #[error("endpoint {endpoint} of device {device} already has a transfer in flight")]
    EndpointBusy { device: u8, endpoint: u8 },

    #[error("transfer descriptor pool exhausted")]
    OutOfDescriptors,

    #[error("DMA buffer space exhausted (requested {requested} bytes)")]
    OutOfBufferSpace { requested: usize },

    #[error("isochronous window at frame {start_frame} for {packets} packets collides with an existing booking")]
    IsoConflict { start_frame: u16, packets: usize },

    #[error("isochronous span of {packets} frames exceeds the {max} frame ceiling")]
    IsoSpanTooLong { packets: usize, max: usize },

    #[error("unknown or already retired request")]
    UnknownRequest,

    #[error("host controller is dead; reinitialize before submitting")]
    ControllerDead,

    #[error("host controller is not running")]
    NotRunning,
}

/// Result codes delivered asynchronously through [`crate::Completion::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("bit stuffing error")]
    BitStuff,
    #[error("CRC error")]
    Crc,
    #[error("device did not respond")]
    Timeout,
    #[error("babble detected")]
    Babble,
    #[error("data buffer overrun/underrun")]
    BufferError,
    #[error("endpoint stalled")]
    Stall,
    #[error("protocol error")]
    Protocol,
    #[error("data toggle mismatch on queued transfer")]
    DataToggleMismatch,
    #[error("short packet")]
    ShortPacket,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer timed out")]
    TimedOut,
    #[error("host controller was reset")]
    ControllerReset,
    #[error("host controller is dead")]
    ControllerDead,
    #[error("host controller shut down")]
    Shutdown,
}
