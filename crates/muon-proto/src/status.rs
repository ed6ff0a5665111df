//! Primary status byte.
//!
//! The hardware publishes one status byte per command slot. Its decode is
//! mutually exclusive on the success bit: a successful completion carries
//! a read-buffer id in the code field, a failure carries a progress/error
//! code from [`StatusCode`].

/// Bit 5: the extended status buffer must be consulted.
const EXTEND_BIT: u8 = 1 << 5;
/// Bit 6: slot polarity at the time the status was written.
const ODD_BIT: u8 = 1 << 6;
/// Bit 7: command completed successfully.
const SUCCESS_BIT: u8 = 1 << 7;
/// Bits 0-4: status code, or the completion read-buffer id on success.
const CODE_MASK: u8 = 0x1F;

/// One slot's raw status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusByte(u8);

impl StatusByte {
    /// Wraps a raw byte as read from the status array.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Builds a status byte from its parts. The code field is masked to
    /// five bits.
    #[must_use]
    pub const fn from_parts(success: bool, odd: bool, extend: bool, code: u8) -> Self {
        let mut raw = code & CODE_MASK;
        if success {
            raw |= SUCCESS_BIT;
        }
        if odd {
            raw |= ODD_BIT;
        }
        if extend {
            raw |= EXTEND_BIT;
        }
        Self(raw)
    }

    /// The raw byte.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Whether the command completed successfully.
    #[must_use]
    pub const fn success(self) -> bool {
        self.0 & SUCCESS_BIT != 0
    }

    /// The polarity bit the hardware stamped into this update.
    #[must_use]
    pub const fn odd(self) -> bool {
        self.0 & ODD_BIT != 0
    }

    /// Whether the extended status word carries more detail.
    #[must_use]
    pub const fn extend(self) -> bool {
        self.0 & EXTEND_BIT != 0
    }

    /// The completion read-buffer id. Only meaningful when
    /// [`success`](Self::success) is set.
    #[must_use]
    pub const fn read_buffer(self) -> u8 {
        self.0 & CODE_MASK
    }

    /// The progress/error code. Only meaningful when
    /// [`success`](Self::success) is clear.
    #[must_use]
    pub const fn code(self) -> StatusCode {
        StatusCode::from_u8(self.0 & CODE_MASK)
    }
}

/// Progress and error codes shared by the read, write, and control decode
/// paths. Handling is direction-specific; the code space is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    /// Slot has no valid status (power-on value).
    Invalid = 0x00,
    /// Command accepted into the firmware queue.
    Queued = 0x01,
    /// Command received by the execution engine.
    Received = 0x02,
    /// Waiting on the backing device.
    WaitDevice = 0x03,
    /// Sequenced behind earlier commands; an alias of
    /// [`WaitDevice`](Self::WaitDevice) for timeout purposes.
    Sequenced = 0x04,
    /// Slot collision inside the firmware.
    Collision = 0x05,
    /// Correctable field error in the command word.
    FieldError = 0x06,
    /// Firmware rejected the command; the extended status low byte carries
    /// the fault subtype.
    IllegalCmd = 0x07,
    /// Execution error on the backing device.
    ExeError = 0x08,
    /// Uncorrectable ECC on the data payload.
    DataEcc = 0x09,
    /// Uncorrectable ECC on the command word.
    CmdEcc = 0x0A,
    /// Checksum mismatch on the DMA write path.
    XsumError = 0x0B,
    /// Hardware did not recognize the command.
    UnknownCmd = 0x0C,
    /// Duplicate completion of an out-of-order command.
    OooDup = 0x0D,
    /// Commands completed out of issue order; the extended status carries
    /// the current and missing sequence numbers.
    OutOfOrder = 0x0E,
    /// Non-fatal device warning; extended status is diagnostic only.
    DeviceWarn = 0x0F,
}

impl StatusCode {
    /// Decodes a five-bit code field. Unassigned values decode as
    /// [`Invalid`](Self::Invalid).
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        if raw <= 0x0F {
            // SAFETY: StatusCode is repr(u8) with contiguous values 0x00..=0x0F.
            unsafe { core::mem::transmute::<u8, Self>(raw) }
        } else {
            Self::Invalid
        }
    }

    /// Whether this code reports forward progress rather than an error.
    #[must_use]
    pub const fn is_progress(self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Received | Self::WaitDevice | Self::Sequenced
        )
    }
}
