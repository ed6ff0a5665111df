//! Extended status word.
//!
//! A 64-bit out-of-band value, read only when the primary status byte has
//! its extend bit set. The interpretation is keyed by the primary status
//! code:
//!
//! - illegal command: the low byte is a [`HwFault`] subtype,
//! - out of order: the low and high 32-bit halves carry the current and
//!   missing sequence numbers,
//! - anything else (warnings, execution errors): the low half is a set of
//!   diagnostic condition flags and the high half a raw task-file register
//!   snapshot. Diagnostic content never affects control flow.

use bitflags::bitflags;

use crate::opcode::HwFault;

/// One slot's extended status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtStatus(u64);

impl ExtStatus {
    /// Wraps a raw extended status word.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The hardware fault subtype. Only meaningful when the primary status
    /// is [`StatusCode::IllegalCmd`](crate::status::StatusCode::IllegalCmd);
    /// returns `None` when the low byte is not in the fault block.
    #[must_use]
    pub const fn fault(self) -> Option<HwFault> {
        HwFault::from_u8((self.0 & 0xFF) as u8)
    }

    /// The firmware's current sequence number (out-of-order decode).
    #[must_use]
    pub const fn ooo_current(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// The sequence number the firmware is missing (out-of-order decode).
    #[must_use]
    pub const fn ooo_missing(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Diagnostic condition flags (warning/error decode).
    #[must_use]
    pub const fn conditions(self) -> DiagFlags {
        DiagFlags::from_bits_retain((self.0 & 0xFFFF_FFFF) as u32)
    }

    /// Raw task-file register snapshot (warning/error decode).
    #[must_use]
    pub const fn taskfile(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Builds an out-of-order extended status from its sequence halves.
    #[must_use]
    pub const fn from_ooo(current: u32, missing: u32) -> Self {
        Self((missing as u64) << 32 | current as u64)
    }
}

bitflags! {
    /// Independently flagged diagnostic conditions in the low half of an
    /// extended status word. Logged verbatim on device warnings and
    /// execution errors; never consulted for control decisions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiagFlags: u32 {
        /// Host interface parity error.
        const HOST_IFC = 1 << 0;
        /// CRC mismatch on the internal link.
        const CRC = 1 << 1;
        /// Link handshake failure.
        const HANDSHAKE = 1 << 2;
        /// Link-layer sequence error.
        const LINK_SEQ = 1 << 3;
        /// PHY ready signal lost.
        const PHY_READY_LOST = 1 << 4;
        /// PHY internal error.
        const PHY_INTERNAL = 1 << 5;
        /// Unexpected COMWAKE.
        const COMM_WAKE = 1 << 6;
        /// 10b/8b decode error.
        const DECODE_10B8B = 1 << 7;
        /// Running disparity error.
        const DISPARITY = 1 << 8;
        /// Frame terminated abnormally.
        const BAD_END = 1 << 9;
        /// Frame shorter than its header claimed.
        const FRAME_SHORT = 1 << 10;
        /// Frame longer than its header claimed.
        const FRAME_LONG = 1 << 11;
        /// Unrecognized frame type.
        const UNKNOWN_FRAME = 1 << 12;
        /// Transport-layer protocol violation.
        const PROTOCOL = 1 << 13;
        /// Controller internal error.
        const INTERNAL = 1 << 14;
        /// Transport-layer state machine error.
        const TRANSPORT = 1 << 15;
        /// Link-layer timeout.
        const LINK_TIMEOUT = 1 << 16;
        /// Link retry limit reached.
        const RETRY_LIMIT = 1 << 17;
        /// Backing device reported a fault.
        const DEVICE_FAULT = 1 << 18;
        /// Media ECC event (corrected).
        const MEDIA_ECC = 1 << 19;
        /// Spare-block pool running low.
        const SPARE_LOW = 1 << 20;
        /// Temperature warning threshold crossed.
        const TEMP_WARN = 1 << 21;
        /// Write-back cache state degraded.
        const WRITEBACK = 1 << 22;
        /// Backup power source failing; persistence at risk.
        const POWER_LOSS = 1 << 23;
        /// Firmware observed a sequence-number gap.
        const SEQ_GAP = 1 << 24;
    }
}
