//! Hardware access layer and external collaborator interfaces.
//!
//! The state machine drives hardware only through [`DeviceHal`] — one
//! implementation per hardware variant (see [`mmio`](crate::mmio) for the
//! memory-mapped one). Every call may be costly (cache-line flushes,
//! non-temporal stores, a cross-CPU round trip for extended status), and
//! the engine never assumes a status read is synchronous with a command
//! write.
//!
//! Data movement between device buffers and the host request's memory
//! goes through [`CopyOps`]; scatter-gather iteration and integrity
//! metadata interleaving live entirely on the embedder's side of that
//! boundary. Completions flow back through [`EngineHooks`].

use muon_proto::{BufId, CmdWord, EncodeError, ExtStatus, Operation, StatusByte, cmd};

use crate::config::Config;
use crate::pool::MAX_TOKENS;
use crate::token::{RequestId, SlotRetries, Token, TokenClass, TokenResult};

/// Device run state. A hard abort halts the device; nothing is issued
/// again until external recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// Accepting and executing commands.
    Running = 0,
    /// Dead until reset; every submission is rejected.
    Halted = 1,
}

impl RunState {
    /// Decodes the atomic representation.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            _ => Self::Halted,
        }
    }
}

/// Hardware access failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The hardware did not accept the operation in bounded time.
    NotReady,
    /// The command filter refused the command.
    Rejected,
    /// A data transfer failed.
    Io,
    /// The affine worker did not answer within its bound.
    AffinityTimeout,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotReady => f.write_str("hardware not ready"),
            Self::Rejected => f.write_str("command rejected by filter"),
            Self::Io => f.write_str("data transfer failed"),
            Self::AffinityTimeout => f.write_str("affine worker timed out"),
        }
    }
}

/// Result of staging a page transfer: bytes moved and the Fletcher sum
/// of the staged payload, folded for the command word's data checksum
/// field. Computed during the copy so the payload is read exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageXfer {
    /// Bytes copied.
    pub bytes: u32,
    /// Folded Fletcher-128 of the staged data.
    pub xsum: u64,
}

/// Data movement failures reported by the copy-operations collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyError {
    /// Fewer bytes were available than the command describes.
    Short,
    /// The request back-reference was not recognized.
    BadRequest,
}

impl core::fmt::Display for CopyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Short => f.write_str("short copy"),
            Self::BadRequest => f.write_str("unknown request"),
        }
    }
}

/// Moves data between device buffers and a host request.
///
/// Implemented by the block-I/O layer: plain buffers, scatter-gather
/// iteration, and the variants that interleave per-sector integrity
/// metadata all hide behind this interface.
pub trait CopyOps: Send + Sync {
    /// Copies from a device buffer into the request's data.
    ///
    /// # Errors
    ///
    /// [`CopyError`] when the request cannot accept `src.len()` bytes at
    /// `offset`.
    fn device_to_host(&self, req: RequestId, src: &[u8], offset: u32) -> Result<u32, CopyError>;

    /// Copies from the request's data into a device buffer.
    ///
    /// # Errors
    ///
    /// [`CopyError`] when the request cannot supply `dst.len()` bytes at
    /// `offset`.
    fn host_to_device(&self, req: RequestId, dst: &mut [u8], offset: u32) -> Result<u32, CopyError>;

    /// Copies from the request's data into one to three device buffers at
    /// once (write redundancy). Every destination receives the same bytes.
    ///
    /// # Errors
    ///
    /// [`CopyError`] as for [`host_to_device`](Self::host_to_device).
    fn host_to_device_mirrored(
        &self,
        req: RequestId,
        dsts: &mut [&mut [u8]],
        offset: u32,
    ) -> Result<u32, CopyError>;
}

/// Upward reporting from the engine to the request layer.
///
/// Called from inside the poll loop; implementations must not re-enter
/// the engine.
pub trait EngineHooks {
    /// A slot's status byte changed (diagnostic event stream).
    fn status_changed(&self, _slot: u8, _status: StatusByte) {}

    /// A write reached its configured commit level; the request may be
    /// reported durable before terminal completion.
    fn early_commit(&self, _req: RequestId) {}

    /// A token reached a terminal result. For successful reads, `rdbuf`
    /// is the completion read buffer, owned by the request layer until it
    /// calls [`Engine::release_read_buffer`](crate::engine::Engine::release_read_buffer).
    fn complete(&self, req: RequestId, result: TokenResult, rdbuf: Option<BufId>);
}

/// Capability set the state machine requires of a hardware variant.
pub trait DeviceHal: Send + Sync {
    /// One-time hardware initialization.
    ///
    /// # Errors
    ///
    /// [`HalError`] when the hardware cannot be brought up.
    fn init(&self, cfg: &Config) -> Result<(), HalError>;

    /// Enables command processing.
    ///
    /// # Errors
    ///
    /// [`HalError::NotReady`] when the engine does not come online.
    fn enable(&self) -> Result<(), HalError>;

    /// Stops command processing (shutdown, halt recovery).
    fn disable(&self);

    /// Lowers a logical operation into a command word. Variants with
    /// encoding quirks override this; the default is the stock encoder.
    ///
    /// # Errors
    ///
    /// [`EncodeError`] for operations the hardware cannot express.
    fn create_command(&self, op: &Operation) -> Result<CmdWord, EncodeError> {
        cmd::encode(op)
    }

    /// Snapshots the status array for one command class into `out`.
    ///
    /// The mapping may be cacheable; implementations apply the configured
    /// flush discipline so the snapshot is no staler than the last
    /// hardware write.
    fn read_status(&self, class: TokenClass, out: &mut [StatusByte; MAX_TOKENS]);

    /// Reads the extended status word for a slot. May block briefly on a
    /// CPU-affine worker where the interconnect requires it.
    fn read_ext_status(&self, slot: u8) -> ExtStatus;

    /// Writes the finalized command into the slot's command buffer and
    /// starts it. Applies flush/fence discipline before returning.
    ///
    /// # Errors
    ///
    /// [`HalError::NotReady`] when the doorbell handshake times out.
    fn start_token(&self, slot: u8, cmd: &CmdWord) -> Result<(), HalError>;

    /// Resets a slot's hardware state (abandoning any in-flight command).
    fn reset_token(&self, slot: u8);

    /// Stages a write token's payload into its write buffer via `ops`.
    ///
    /// # Errors
    ///
    /// [`HalError::Io`] when the copy fails.
    fn write_page(&self, tok: &Token, ops: &dyn CopyOps) -> Result<PageXfer, HalError>;

    /// Moves a completed read token's payload to the host via `ops`.
    ///
    /// # Errors
    ///
    /// [`HalError::Io`] when the copy fails.
    fn read_page(&self, tok: &Token, ops: &dyn CopyOps) -> Result<PageXfer, HalError>;

    /// Stages one payload into a redundant pair of write tokens.
    ///
    /// The default stages each token separately; variants with a
    /// multi-target copy path override this to read the host data once.
    ///
    /// # Errors
    ///
    /// [`HalError::Io`] when the copy fails.
    fn mirror_pages(
        &self,
        primary: &Token,
        secondary: &Token,
        ops: &dyn CopyOps,
    ) -> Result<PageXfer, HalError> {
        let xfer = self.write_page(primary, ops)?;
        self.write_page(secondary, ops)?;
        Ok(xfer)
    }

    /// Reads a raw hardware buffer (diagnostics, crash logs).
    ///
    /// # Errors
    ///
    /// [`HalError`] when the buffer cannot be read.
    fn raw_buffer(&self, buf: BufId, out: &mut [u8]) -> Result<(), HalError>;

    /// Overwrites a raw hardware buffer.
    ///
    /// # Errors
    ///
    /// [`HalError`] when the buffer cannot be written.
    fn set_raw_buffer(&self, buf: BufId, data: &[u8]) -> Result<(), HalError>;

    /// Whether a failed token may be re-issued, given its own counter and
    /// the slot's kind-specific counters.
    fn can_retry(&self, tok: &Token, retries: &SlotRetries, cfg: &Config) -> bool {
        let _ = retries;
        tok.retries < cfg.generic_retries
    }

    /// Validates a command against the current device state before issue.
    /// A refused command is never written to hardware.
    fn filter_command(&self, cmd: &CmdWord, run: RunState) -> bool {
        let _ = cmd;
        run == RunState::Running
    }
}
