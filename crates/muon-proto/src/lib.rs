//! Wire-format layer for the Muon persistent-memory block module.
//!
//! Everything the hardware sees or produces lives here: the opcode space,
//! the 64-byte command word and its encoder, the one-byte status word, the
//! 64-bit extended status, and the checksum primitives the firmware
//! verifies commands and payloads with.
//!
//! This crate is pure data: no MMIO, no locking, no allocation. The
//! engine crate drives it; hosts can also use it standalone to decode
//! captured command traffic.
//!
//! All multi-word structures are little-endian and bit-exact. Layouts in
//! this crate are a hardware contract and must not change.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod cmd;
pub mod ext;
pub mod opcode;
pub mod passthrough;
pub mod sha1;
pub mod status;
pub mod xsum;

pub use cmd::{BufId, CmdFlags, CmdWord, DataSize, EncodeError, Operation};
pub use ext::{DiagFlags, ExtStatus};
pub use opcode::{HwFault, Opcode};
pub use passthrough::{AtaDirection, AtaPassthrough};
pub use status::{StatusByte, StatusCode};
pub use xsum::{Fletcher128, fletcher128};

/// Asserts a condition at compile time.
#[macro_export]
macro_rules! static_assert {
    ($cond:expr $(,)?) => {
        const _: () = assert!($cond);
    };
    ($cond:expr, $msg:expr $(,)?) => {
        const _: () = assert!($cond, $msg);
    };
}
