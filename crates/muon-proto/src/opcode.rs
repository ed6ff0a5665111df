//! Command opcode space.
//!
//! The module firmware accepts a fixed 8-bit opcode set. Values 0xF7-0xFF
//! are hardware-fault pseudo-opcodes: they never appear in an issued
//! command, only in the low byte of an extended status word when the
//! primary status reports an illegal command.

/// Command opcodes understood by the module firmware.
///
/// Values are part of the hardware contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// No-operation; used for liveness checks.
    Null = 0x00,
    /// Read a hardware register.
    GetRegister = 0x01,
    /// Write a hardware register.
    PutRegister = 0x02,
    /// Soft-reset the command engine.
    Reset = 0x03,
    /// Host-sequenced streaming read.
    SequentialRead = 0x04,
    /// Full-page read ("final" fast-path encoding, zero block count).
    PageRead = 0x05,
    /// Full-page write ("final" fast-path encoding, zero block count).
    PageWrite = 0x06,
    /// Sub-page read with an explicit sector count.
    ExtendedRead = 0x07,
    /// Sub-page write with an explicit sector count.
    ExtendedWrite = 0x08,
    /// Discard a block range.
    Trim = 0x09,
    /// Fetch device statistics.
    DeviceStats = 0x0A,
    /// Raw ATA passthrough to the backing device.
    DevicePassthrough = 0x0B,
    /// Device-side block copy.
    Copy = 0x0C,
    /// Firmware-level no-op (exercises the firmware path, not the engine).
    FirmwareNull = 0x0D,
    /// Orderly shutdown.
    Shutdown = 0x0E,
    /// Startup / resume.
    Startup = 0x0F,
    /// Enable or disable firmware tracing.
    TraceControl = 0x10,
    /// Self-test.
    Test = 0x11,
    /// Force the firmware sequence counter forward.
    SequenceAdvance = 0x12,
    /// Fetch the firmware debug log.
    DebugLog = 0x13,
    /// Fetch extended error state.
    ExtendedError = 0x14,
    /// Download a firmware image.
    FirmwareDownload = 0x15,
    /// Read a named parameter.
    GetParams = 0x16,
    /// Write a named parameter.
    SetParams = 0x17,
    /// Fetch the firmware crash log.
    CrashLog = 0x18,
    /// Diagnostic read (bypasses the translation layer).
    TestRead = 0x19,
    /// Diagnostic write (bypasses the translation layer).
    TestWrite = 0x1A,
    /// Reinitialize the SATA link to the backing device.
    SataReinit = 0x1B,
    /// Cancel the command in another slot.
    Cancel = 0x1C,
    /// Inject a fault (test builds of the firmware only).
    FaultInjection = 0x1D,
    /// Vendor diagnostic sub-command.
    Diagnostic = 0x1E,
}

impl Opcode {
    /// Decodes an opcode byte. Fault pseudo-opcodes and unassigned values
    /// return `None`.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        if raw <= 0x1E {
            // SAFETY: Opcode is repr(u8) with contiguous values 0x00..=0x1E.
            Some(unsafe { core::mem::transmute::<u8, Self>(raw) })
        } else {
            None
        }
    }

    /// Whether commands with this opcode address the underlying storage.
    ///
    /// Device-directed commands receive sequence numbers at issue time and
    /// escalate execution errors to a device halt; hardware-only commands
    /// do neither.
    #[must_use]
    pub const fn is_device_directed(self) -> bool {
        matches!(
            self,
            Self::SequentialRead
                | Self::PageRead
                | Self::PageWrite
                | Self::ExtendedRead
                | Self::ExtendedWrite
                | Self::Trim
                | Self::Copy
                | Self::TestRead
                | Self::TestWrite
        )
    }
}

// ---------------------------------------------------------------------------
// Hardware-fault pseudo-opcodes
// ---------------------------------------------------------------------------

/// First value of the fault pseudo-opcode block.
pub const FAULT_BLOCK_FIRST: u8 = 0xF7;

/// Hardware fault subtypes reported through the extended status low byte
/// when the primary status is "illegal command".
///
/// These occupy the 0xF7-0xFF pseudo-opcode block. The two unassigned
/// values in the block (0xFC, 0xFE) decode as [`HwFault::Fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HwFault {
    /// Command referenced an offset outside the addressable range.
    BadOffset = 0xF7,
    /// Uncorrectable ECC error on the command word itself.
    CmdEcc = 0xF8,
    /// Uncorrectable ECC error on the data payload.
    DataEcc = 0xF9,
    /// Command or payload checksum mismatch.
    Xsum = 0xFA,
    /// Write-execution-path timeout inside the firmware.
    WepTimeout = 0xFB,
    /// The firmware did not recognize the command.
    UnknownCmd = 0xFD,
    /// Unrecoverable firmware fault; the device must be halted.
    Fatal = 0xFF,
}

impl HwFault {
    /// Decodes an extended-status fault byte.
    ///
    /// Values below the fault block are not faults and return `None`;
    /// reserved values inside the block are treated as fatal.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0xF7 => Some(Self::BadOffset),
            0xF8 => Some(Self::CmdEcc),
            0xF9 => Some(Self::DataEcc),
            0xFA => Some(Self::Xsum),
            0xFB => Some(Self::WepTimeout),
            0xFD => Some(Self::UnknownCmd),
            0xFC | 0xFE | 0xFF => Some(Self::Fatal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for raw in 0x00..=0x1E {
            let op = Opcode::from_u8(raw).expect("assigned opcode");
            assert_eq!(op as u8, raw);
        }
    }

    #[test]
    fn fault_block_rejected_as_opcode() {
        for raw in FAULT_BLOCK_FIRST..=0xFE {
            assert!(Opcode::from_u8(raw).is_none());
        }
        assert!(Opcode::from_u8(0xFF).is_none());
        assert!(Opcode::from_u8(0x1F).is_none());
    }

    #[test]
    fn device_directed_classification() {
        assert!(Opcode::PageWrite.is_device_directed());
        assert!(Opcode::Trim.is_device_directed());
        assert!(!Opcode::GetRegister.is_device_directed());
        assert!(!Opcode::Shutdown.is_device_directed());
    }

    #[test]
    fn fault_decode() {
        assert_eq!(HwFault::from_u8(0xFA), Some(HwFault::Xsum));
        assert_eq!(HwFault::from_u8(0xFC), Some(HwFault::Fatal));
        assert_eq!(HwFault::from_u8(0xFE), Some(HwFault::Fatal));
        assert_eq!(HwFault::from_u8(0x05), None);
    }
}
