//! The 64-byte command word and its encoder.
//!
//! A command is eight little-endian 64-bit words written into a slot's
//! memory-mapped command buffer. Words 0-2 carry the control, source, and
//! destination fields; words 3-5 are firmware safety duplicates of words
//! 0-2 (bit-for-bit when the duplicate-check flag is set, except the top
//! two bits of word 5, which always carry the command checksum MSBs);
//! word 6 is the data checksum and word 7 the low 64 bits of the command
//! checksum.
//!
//! The meaning of the source and destination address fields varies by
//! opcode (LBA, buffer id, register address, diagnostic sub-command).
//! [`Operation`] is the typed face of that union; [`CmdWord`] is the raw
//! fixed layout underneath it.
//!
//! Word layout:
//!
//! ```text
//! word0  [0..8) opcode  [8..12) flags  [12..16) data size code
//!        [16..32) metadata bytes  [32..40) slot  [40..56) sequence
//!        bit 56 polarity
//! word1  [0..48) source address  [48..56) block count  bit 56 polarity
//! word2  [0..48) destination address  [48..55) dealloc buffer id
//!        bit 55 dealloc valid  bit 56 polarity
//! word5  bits 62-63 command checksum MSBs (never mirrored)
//! ```

use bitflags::bitflags;

use crate::opcode::Opcode;
use crate::static_assert;
use crate::xsum::{Fletcher128, fletcher128};

/// Number of 64-bit words in a command.
pub const CMD_WORDS: usize = 8;
/// Command size in bytes.
pub const CMD_BYTES: usize = 64;
/// Hardware page size; the unit of the fast-path data encoding.
pub const PAGE_BYTES: u32 = 4096;
/// Sector size; the unit of the extended encoding's block count.
pub const SECTOR_BYTES: u32 = 512;

const OPCODE_MASK: u64 = 0xFF;
const FLAGS_SHIFT: u32 = 8;
const DSIZE_SHIFT: u32 = 12;
const DSIZE_NONE: u64 = 0xF;
const MSIZE_SHIFT: u32 = 16;
const SLOT_SHIFT: u32 = 32;
const SEQ_SHIFT: u32 = 40;
const POLARITY_BIT: u64 = 1 << 56;
const ADDR_MASK: u64 = (1 << 48) - 1;
const BLOCK_COUNT_SHIFT: u32 = 48;
const DEALLOC_SHIFT: u32 = 48;
const DEALLOC_VALID_BIT: u64 = 1 << 55;
const XSUM_MSB_SHIFT: u32 = 62;

/// Words that carry a polarity bit: 0-2 and their duplicates.
const POLARITY_WORDS: usize = 6;

bitflags! {
    /// Decode flags in word 0.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u8 {
        /// Command moves data host-to-device.
        const H2D = 1 << 0;
        /// Command moves data device-to-host.
        const D2H = 1 << 1;
        /// Hardware-only: does not address the underlying storage.
        const HWONLY = 1 << 2;
        /// Firmware must verify the safety duplicate words.
        const DUPCHECK = 1 << 3;
    }
}

/// A hardware buffer id (command, write, or read buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId(u8);

impl BufId {
    /// Wraps a raw buffer id. Ids are 7 bits on the wire.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw & 0x7F)
    }

    /// The raw id.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

/// Transfer sizes the hardware accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataSize {
    /// 512 bytes.
    S512 = 0,
    /// 1024 bytes.
    S1024 = 1,
    /// 2048 bytes.
    S2048 = 2,
    /// 4096 bytes (one full page).
    S4096 = 3,
}

impl DataSize {
    /// Maps a byte length to its size code. Lengths the hardware does not
    /// support return `None`.
    #[must_use]
    pub const fn from_len(len: u32) -> Option<Self> {
        match len {
            512 => Some(Self::S512),
            1024 => Some(Self::S1024),
            2048 => Some(Self::S2048),
            4096 => Some(Self::S4096),
            _ => None,
        }
    }

    /// The length in bytes.
    #[must_use]
    pub const fn bytes(self) -> u32 {
        SECTOR_BYTES << (self as u32)
    }
}

// ---------------------------------------------------------------------------
// Raw command word
// ---------------------------------------------------------------------------

/// One 64-byte command as the hardware sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CmdWord {
    words: [u64; CMD_WORDS],
}

static_assert!(core::mem::size_of::<CmdWord>() == CMD_BYTES);

impl CmdWord {
    /// A zeroed command word.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            words: [0; CMD_WORDS],
        }
    }

    /// Builds a command word from raw words (captured traffic, tests).
    #[must_use]
    pub const fn from_words(words: [u64; CMD_WORDS]) -> Self {
        Self { words }
    }

    /// The raw words.
    #[must_use]
    pub const fn words(&self) -> &[u64; CMD_WORDS] {
        &self.words
    }

    /// Serializes to the 64 bytes written into the command buffer.
    #[must_use]
    pub fn as_bytes(&self) -> [u8; CMD_BYTES] {
        let mut out = [0u8; CMD_BYTES];
        for (i, w) in self.words.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Deserializes a captured command buffer.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; CMD_BYTES]) -> Self {
        let mut words = [0u64; CMD_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *w = u64::from_le_bytes(b);
        }
        Self { words }
    }

    /// The opcode byte. Fault pseudo-opcodes never appear here.
    #[must_use]
    pub const fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8((self.words[0] & OPCODE_MASK) as u8)
    }

    pub(crate) fn set_opcode(&mut self, op: Opcode) {
        self.words[0] = (self.words[0] & !OPCODE_MASK) | op as u64;
    }

    /// Overwrites the low 56 bits of a word. Used by the passthrough
    /// encoding, which claims the reserved sub-fields of words 1, 2, 6.
    pub(crate) fn set_low56(&mut self, index: usize, value: u64) {
        const LOW56: u64 = (1 << 56) - 1;
        self.words[index] = (self.words[index] & !LOW56) | (value & LOW56);
    }

    /// The decode flags.
    #[must_use]
    pub const fn flags(&self) -> CmdFlags {
        CmdFlags::from_bits_truncate(((self.words[0] >> FLAGS_SHIFT) & 0xF) as u8)
    }

    pub(crate) fn set_flags(&mut self, flags: CmdFlags) {
        self.words[0] =
            (self.words[0] & !(0xF << FLAGS_SHIFT)) | u64::from(flags.bits()) << FLAGS_SHIFT;
    }

    /// Clears the host-to-device flag. Used before retrying a write whose
    /// host data already reached the device.
    pub fn clear_h2d(&mut self) {
        self.set_flags(self.flags() - CmdFlags::H2D);
    }

    /// The data transfer size, if the command moves data.
    #[must_use]
    pub const fn data_size(&self) -> Option<DataSize> {
        match (self.words[0] >> DSIZE_SHIFT) & 0xF {
            0 => Some(DataSize::S512),
            1 => Some(DataSize::S1024),
            2 => Some(DataSize::S2048),
            3 => Some(DataSize::S4096),
            _ => None,
        }
    }

    fn set_data_size(&mut self, size: Option<DataSize>) {
        let code = match size {
            Some(s) => s as u64,
            None => DSIZE_NONE,
        };
        self.words[0] = (self.words[0] & !(0xF << DSIZE_SHIFT)) | code << DSIZE_SHIFT;
    }

    /// The metadata length in bytes.
    #[must_use]
    pub const fn metadata_len(&self) -> u16 {
        ((self.words[0] >> MSIZE_SHIFT) & 0xFFFF) as u16
    }

    /// Sets the metadata length in bytes.
    pub fn set_metadata_len(&mut self, len: u16) {
        self.words[0] =
            (self.words[0] & !(0xFFFF << MSIZE_SHIFT)) | u64::from(len) << MSIZE_SHIFT;
    }

    /// The slot index stamped at finalize time.
    #[must_use]
    pub const fn slot(&self) -> u8 {
        ((self.words[0] >> SLOT_SHIFT) & 0xFF) as u8
    }

    fn set_slot(&mut self, slot: u8) {
        self.words[0] = (self.words[0] & !(0xFF << SLOT_SHIFT)) | u64::from(slot) << SLOT_SHIFT;
    }

    /// The sequence number stamped at finalize time.
    #[must_use]
    pub const fn seq(&self) -> u16 {
        ((self.words[0] >> SEQ_SHIFT) & 0xFFFF) as u16
    }

    fn set_seq(&mut self, seq: u16) {
        self.words[0] = (self.words[0] & !(0xFFFF << SEQ_SHIFT)) | u64::from(seq) << SEQ_SHIFT;
    }

    /// The polarity bit (read from word 0; all polarity-bearing sub-words
    /// are stamped identically).
    #[must_use]
    pub const fn polarity(&self) -> bool {
        self.words[0] & POLARITY_BIT != 0
    }

    fn set_polarity(&mut self, odd: bool) {
        for w in &mut self.words[..POLARITY_WORDS] {
            if odd {
                *w |= POLARITY_BIT;
            } else {
                *w &= !POLARITY_BIT;
            }
        }
    }

    /// The 48-bit source address field (LBA, buffer id, register address,
    /// or parameter value, depending on the opcode).
    #[must_use]
    pub const fn src_addr(&self) -> u64 {
        self.words[1] & ADDR_MASK
    }

    fn set_src_addr(&mut self, addr: u64) {
        self.words[1] = (self.words[1] & !ADDR_MASK) | (addr & ADDR_MASK);
    }

    /// The 48-bit destination address field.
    #[must_use]
    pub const fn dst_addr(&self) -> u64 {
        self.words[2] & ADDR_MASK
    }

    fn set_dst_addr(&mut self, addr: u64) {
        self.words[2] = (self.words[2] & !ADDR_MASK) | (addr & ADDR_MASK);
    }

    /// The block count of the extended encoding; zero selects the
    /// full-page fast path.
    #[must_use]
    pub const fn block_count(&self) -> u8 {
        ((self.words[1] >> BLOCK_COUNT_SHIFT) & 0xFF) as u8
    }

    fn set_block_count(&mut self, count: u8) {
        self.words[1] = (self.words[1] & !(0xFF << BLOCK_COUNT_SHIFT))
            | u64::from(count) << BLOCK_COUNT_SHIFT;
    }

    /// The piggybacked deallocation buffer id, if one is attached.
    #[must_use]
    pub const fn dealloc(&self) -> Option<BufId> {
        if self.words[2] & DEALLOC_VALID_BIT != 0 {
            Some(BufId::new(((self.words[2] >> DEALLOC_SHIFT) & 0x7F) as u8))
        } else {
            None
        }
    }

    /// Sets or clears the piggybacked deallocation fields.
    pub fn set_dealloc(&mut self, buf: Option<BufId>) {
        self.words[2] &= !(DEALLOC_VALID_BIT | 0x7F << DEALLOC_SHIFT);
        if let Some(buf) = buf {
            self.words[2] |= DEALLOC_VALID_BIT | u64::from(buf.as_u8()) << DEALLOC_SHIFT;
        }
    }

    /// The data checksum field (word 6).
    #[must_use]
    pub const fn data_xsum(&self) -> u64 {
        self.words[6]
    }

    /// The command checksum field: low 64 bits (word 7) and the two MSBs
    /// (word 5, bits 62-63) of the 66-bit truncated Fletcher value.
    #[must_use]
    pub const fn cmd_xsum(&self) -> (u64, u8) {
        (self.words[7], (self.words[5] >> XSUM_MSB_SHIFT) as u8)
    }

    /// Computes the Fletcher sum the command checksum fields are derived
    /// from: words 0-6 with the checksum MSB bits of word 5 clear.
    #[must_use]
    pub fn compute_cmd_xsum(&self) -> Fletcher128 {
        let mut bytes = [0u8; 56];
        for (i, w) in self.words[..7].iter().enumerate() {
            let w = if i == 5 { w & !(0b11 << XSUM_MSB_SHIFT) } else { *w };
            bytes[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        fletcher128(&bytes)
    }

    /// Stamps the per-issue fields and seals the command.
    ///
    /// Writes the slot index, sequence number, piggybacked deallocation,
    /// and data checksum; mirrors words 0-2 into the safety duplicates
    /// when the duplicate-check flag is set; stamps the polarity bit into
    /// every polarity-bearing sub-word; and writes the command checksum
    /// (low 64 bits into word 7, MSBs into word 5).
    ///
    /// Must be called exactly once, after every other field is final and
    /// immediately before the command is submitted, since duplication copies
    /// whatever the protected words hold.
    ///
    /// Passthrough commands reuse words 2 and 6 for the embedded ATA
    /// command; they carry neither a piggybacked deallocation nor a data
    /// checksum, and those arguments are ignored for them.
    pub fn finalize(
        &mut self,
        odd: bool,
        slot: u8,
        seq: u16,
        dealloc: Option<BufId>,
        data_xsum: u64,
    ) {
        self.set_slot(slot);
        self.set_seq(seq);
        if self.opcode() != Some(Opcode::DevicePassthrough) {
            self.set_dealloc(dealloc);
            self.words[6] = data_xsum;
        }

        if self.flags().contains(CmdFlags::DUPCHECK) {
            self.words[3] = self.words[0];
            self.words[4] = self.words[1];
            self.words[5] = self.words[2];
        }
        self.set_polarity(odd);

        // The checksum input has word 5's MSB bits clear; the firmware
        // masks them the same way before verifying.
        self.words[5] &= !(0b11 << XSUM_MSB_SHIFT);
        let xsum = self.compute_cmd_xsum();
        self.words[7] = xsum.a;
        self.words[5] |= u64::from(xsum.high2()) << XSUM_MSB_SHIFT;
    }
}

// ---------------------------------------------------------------------------
// Typed operations and the encoder
// ---------------------------------------------------------------------------

/// A logical operation, the typed face of the command word's src/dst
/// union. [`encode`] lowers it to the raw layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Firmware liveness check.
    Null,
    /// Soft-reset the command engine.
    Reset,
    /// Orderly shutdown.
    Shutdown,
    /// Reinitialize the SATA link to the backing device.
    SataReinit,
    /// Cancel the command occupying `slot`.
    Cancel {
        /// Slot whose command is cancelled.
        slot: u8,
    },
    /// Force the firmware sequence counter to `next`.
    SequenceAdvance {
        /// The sequence number the firmware should expect next.
        next: u16,
    },
    /// Read a hardware register.
    GetRegister {
        /// Register address.
        addr: u64,
    },
    /// Write a hardware register.
    PutRegister {
        /// Register address.
        addr: u64,
        /// Value to write (48 bits on the wire).
        value: u64,
    },
    /// Read a named parameter.
    GetParams {
        /// Parameter index.
        index: u32,
    },
    /// Write a named parameter.
    SetParams {
        /// Parameter index.
        index: u32,
        /// Value to write (48 bits on the wire).
        value: u64,
    },
    /// Host read of `len` bytes at `lba`.
    Read {
        /// Starting logical block address.
        lba: u64,
        /// Transfer length in bytes (512/1024/2048/4096).
        len: u32,
    },
    /// Host-sequenced streaming read of whole pages.
    SeqRead {
        /// Starting logical block address.
        lba: u64,
        /// Number of pages to stream; must be nonzero.
        pages: u8,
    },
    /// Host write of `len` bytes at `lba` from a staged write buffer.
    Write {
        /// Starting logical block address.
        lba: u64,
        /// Transfer length in bytes (512/1024/2048/4096).
        len: u32,
        /// Write buffer holding the staged payload.
        wbuf: BufId,
    },
    /// Discard `sectors` sectors starting at `lba`.
    Trim {
        /// Starting logical block address.
        lba: u64,
        /// Number of sectors; must be nonzero.
        sectors: u8,
    },
    /// Raw ATA passthrough (pre-validated).
    Passthrough(crate::passthrough::AtaPassthrough),
}

/// Errors rejected synchronously at encode time; nothing that fails here
/// is ever submitted to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Transfer length is not one of 512/1024/2048/4096 bytes.
    BadDataSize(u32),
    /// Request carries both host-to-device and device-to-host data; the
    /// hardware does not support bidirectional commands.
    Bidirectional,
    /// A sector or page count of zero.
    ZeroCount,
    /// Passthrough CDB is not one of the two ATA passthrough forms.
    BadCdb,
    /// Passthrough protocol is DMA, queued, or FPDMA.
    UnsupportedProtocol(u8),
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadDataSize(len) => write!(f, "unsupported data size {len}"),
            Self::Bidirectional => f.write_str("bidirectional request"),
            Self::ZeroCount => f.write_str("zero block count"),
            Self::BadCdb => f.write_str("not an ATA passthrough CDB"),
            Self::UnsupportedProtocol(p) => write!(f, "unsupported ATA protocol {p}"),
        }
    }
}

/// Encodes a logical operation into a command word.
///
/// The result still needs [`CmdWord::finalize`] before submission.
pub fn encode(op: &Operation) -> Result<CmdWord, EncodeError> {
    let mut cmd = CmdWord::zeroed();
    cmd.set_data_size(None);

    match *op {
        Operation::Null => control(&mut cmd, Opcode::Null),
        Operation::Reset => control(&mut cmd, Opcode::Reset),
        Operation::Shutdown => control(&mut cmd, Opcode::Shutdown),
        Operation::SataReinit => control(&mut cmd, Opcode::SataReinit),
        Operation::Cancel { slot } => {
            control(&mut cmd, Opcode::Cancel);
            cmd.set_src_addr(u64::from(slot));
        }
        Operation::SequenceAdvance { next } => {
            control(&mut cmd, Opcode::SequenceAdvance);
            cmd.set_src_addr(u64::from(next));
        }
        Operation::GetRegister { addr } => {
            control(&mut cmd, Opcode::GetRegister);
            cmd.set_src_addr(addr);
        }
        Operation::PutRegister { addr, value } => {
            control(&mut cmd, Opcode::PutRegister);
            cmd.set_dst_addr(addr);
            cmd.set_src_addr(value);
        }
        Operation::GetParams { index } => {
            control(&mut cmd, Opcode::GetParams);
            cmd.set_src_addr(u64::from(index));
        }
        Operation::SetParams { index, value } => {
            control(&mut cmd, Opcode::SetParams);
            cmd.set_dst_addr(u64::from(index));
            cmd.set_src_addr(value);
        }
        Operation::Read { lba, len } => {
            let size = DataSize::from_len(len).ok_or(EncodeError::BadDataSize(len))?;
            let fast = len == PAGE_BYTES;
            cmd.set_opcode(if fast { Opcode::PageRead } else { Opcode::ExtendedRead });
            cmd.set_flags(CmdFlags::D2H);
            cmd.set_data_size(Some(size));
            cmd.set_src_addr(lba);
            #[allow(clippy::cast_possible_truncation, reason = "len / 512 <= 8")]
            cmd.set_block_count(if fast { 0 } else { (len / SECTOR_BYTES) as u8 });
        }
        Operation::SeqRead { lba, pages } => {
            if pages == 0 {
                return Err(EncodeError::ZeroCount);
            }
            cmd.set_opcode(Opcode::SequentialRead);
            cmd.set_flags(CmdFlags::D2H);
            cmd.set_data_size(Some(DataSize::S4096));
            cmd.set_src_addr(lba);
            cmd.set_block_count(pages);
        }
        Operation::Write { lba, len, wbuf } => {
            let size = DataSize::from_len(len).ok_or(EncodeError::BadDataSize(len))?;
            let fast = len == PAGE_BYTES;
            cmd.set_opcode(if fast { Opcode::PageWrite } else { Opcode::ExtendedWrite });
            cmd.set_flags(CmdFlags::H2D | CmdFlags::DUPCHECK);
            cmd.set_data_size(Some(size));
            cmd.set_src_addr(u64::from(wbuf.as_u8()));
            cmd.set_dst_addr(lba);
            #[allow(clippy::cast_possible_truncation, reason = "len / 512 <= 8")]
            cmd.set_block_count(if fast { 0 } else { (len / SECTOR_BYTES) as u8 });
        }
        Operation::Trim { lba, sectors } => {
            if sectors == 0 {
                return Err(EncodeError::ZeroCount);
            }
            cmd.set_opcode(Opcode::Trim);
            cmd.set_flags(CmdFlags::DUPCHECK);
            cmd.set_src_addr(lba);
            cmd.set_block_count(sectors);
        }
        Operation::Passthrough(ref ata) => {
            crate::passthrough::embed(&mut cmd, ata);
        }
    }

    Ok(cmd)
}

/// Shared setup for commands that never touch the underlying storage.
fn control(cmd: &mut CmdWord, op: Opcode) {
    cmd.set_opcode(op);
    cmd.set_flags(CmdFlags::HWONLY);
}
