//! ATA passthrough encoding.
//!
//! The module forwards raw ATA commands to the backing device. Only the
//! two SCSI ATA PASS-THROUGH CDB forms are accepted, and only protocols
//! the firmware can drive synchronously; DMA, queued, and FPDMA
//! protocols are rejected up front.
//!
//! The 16-byte ATA command image is embedded into the three reserved
//! 56-bit-aligned sub-fields of the command word (the low 56 bits of
//! words 1, 2, and 6), leaving the polarity bits and the checksum MSB
//! bits untouched.

use crate::cmd::{CmdFlags, CmdWord, EncodeError};
use crate::opcode::Opcode;

/// ATA PASS-THROUGH (12) CDB opcode.
const PASSTHROUGH_12: u8 = 0xA1;
/// ATA PASS-THROUGH (16) CDB opcode.
const PASSTHROUGH_16: u8 = 0x85;

/// ATA protocol values the firmware cannot drive.
const PROTO_DMA: u8 = 6;
const PROTO_DMA_QUEUED: u8 = 7;
const PROTO_FPDMA: u8 = 12;

/// PIO data-in protocol.
const PROTO_PIO_IN: u8 = 4;
/// PIO data-out protocol.
const PROTO_PIO_OUT: u8 = 5;

/// Transfer direction derived from the CDB protocol sub-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaDirection {
    /// Non-data command.
    None,
    /// Host to device (PIO data-out).
    ToDevice,
    /// Device to host (PIO data-in).
    FromDevice,
}

/// A validated ATA passthrough command, normalized to the 16-byte form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaPassthrough {
    image: [u8; 16],
    direction: AtaDirection,
}

impl AtaPassthrough {
    /// Validates a SCSI ATA PASS-THROUGH CDB.
    ///
    /// Rejects CDBs that are not one of the two passthrough forms and
    /// protocols the firmware cannot execute (DMA, DMA queued, FPDMA).
    pub fn from_cdb(cdb: &[u8]) -> Result<Self, EncodeError> {
        let len = match cdb.first() {
            Some(&PASSTHROUGH_12) => 12,
            Some(&PASSTHROUGH_16) => 16,
            _ => return Err(EncodeError::BadCdb),
        };
        if cdb.len() < len {
            return Err(EncodeError::BadCdb);
        }

        let protocol = (cdb[1] >> 1) & 0xF;
        if matches!(protocol, PROTO_DMA | PROTO_DMA_QUEUED | PROTO_FPDMA) {
            return Err(EncodeError::UnsupportedProtocol(protocol));
        }
        let direction = match protocol {
            PROTO_PIO_IN => AtaDirection::FromDevice,
            PROTO_PIO_OUT => AtaDirection::ToDevice,
            _ => AtaDirection::None,
        };

        let mut image = [0u8; 16];
        image[..len].copy_from_slice(&cdb[..len]);
        Ok(Self { image, direction })
    }

    /// The normalized 16-byte command image.
    #[must_use]
    pub const fn image(&self) -> &[u8; 16] {
        &self.image
    }

    /// The transfer direction.
    #[must_use]
    pub const fn direction(&self) -> AtaDirection {
        self.direction
    }
}

/// Lowers a validated passthrough into `cmd`.
///
/// Called by [`encode`](crate::cmd::encode); not part of the public
/// encode surface.
pub(crate) fn embed(cmd: &mut CmdWord, ata: &AtaPassthrough) {
    let mut flags = CmdFlags::HWONLY;
    match ata.direction {
        AtaDirection::ToDevice => flags |= CmdFlags::H2D,
        AtaDirection::FromDevice => flags |= CmdFlags::D2H,
        AtaDirection::None => {}
    }

    cmd.set_opcode(Opcode::DevicePassthrough);
    cmd.set_flags(flags);
    cmd.set_low56(1, field56(&ata.image[0..7]));
    cmd.set_low56(2, field56(&ata.image[7..14]));
    cmd.set_low56(6, field56(&ata.image[14..16]));
}

/// Packs up to seven bytes into the low 56 bits of a word.
fn field56(bytes: &[u8]) -> u64 {
    let mut padded = [0u8; 8];
    padded[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(padded)
}

/// Recovers the embedded 16-byte ATA image from a passthrough command.
#[must_use]
pub fn extract(cmd: &CmdWord) -> [u8; 16] {
    let w = cmd.words();
    let mut image = [0u8; 16];
    image[0..7].copy_from_slice(&w[1].to_le_bytes()[..7]);
    image[7..14].copy_from_slice(&w[2].to_le_bytes()[..7]);
    image[14..16].copy_from_slice(&w[6].to_le_bytes()[..2]);
    image
}
