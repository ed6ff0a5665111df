//! Token state.
//!
//! A token is one hardware command slot's worth of in-flight tracking: the
//! finalized command, the polarity expectation, buffer bindings, timers,
//! and retry accounting. Tokens live in the fixed pool
//! ([`TokenPool`](crate::pool::TokenPool)) and are owned exclusively by
//! the engine while active; the originating request holds only an opaque
//! back-reference, never the token itself.

use muon_proto::{BufId, CmdWord, ExtStatus, Operation, StatusByte};

use crate::TimeUs;

/// Opaque back-reference to the host request a token serves.
///
/// The engine reports completions against it and never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Command classes with separate hardware status arrays and separate
/// timeout tables. Trim shares the control path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    /// Host-sequenced reads.
    HostRead,
    /// Host writes.
    HostWrite,
    /// Generic/control commands (including trim).
    Control,
}

impl TokenClass {
    /// All classes, in polling order.
    pub const ALL: [Self; 3] = [Self::HostRead, Self::HostWrite, Self::Control];

    /// Dense index for per-class tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::HostRead => 0,
            Self::HostWrite => 1,
            Self::Control => 2,
        }
    }
}

/// Terminal and non-terminal token outcomes.
///
/// The poll loop never raises errors; it parks one of these on the token
/// and reports a done/not-done signal upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenResult {
    /// Still in flight.
    Pending,
    /// Completed successfully.
    Ok,
    /// Failed in a way worth retrying; the engine re-issues while budget
    /// remains, then degrades to [`Abort`](Self::Abort).
    Retry,
    /// Deadline elapsed without completion.
    Timeout,
    /// Failed terminally; the owning request is failed back to its caller.
    Abort,
    /// Failed in a way that halts the whole device.
    AbortHard,
}

impl TokenResult {
    /// Whether this result ends the token's lifetime.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Hardware buffer ids bound to a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffers {
    /// Core command buffer.
    pub core: Option<BufId>,
    /// Primary write buffer (staged host data).
    pub write: Option<BufId>,
    /// Extra write buffer for redundant writes.
    pub write_extra: Option<BufId>,
    /// Completion read buffer, captured from a successful read status.
    pub read: Option<BufId>,
}

impl Buffers {
    /// No buffers bound.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            core: None,
            write: None,
            write_extra: None,
            read: None,
        }
    }
}

/// Per-slot retry counters, by failure kind.
///
/// These outlive the tokens that occupy the slot; a slot that keeps
/// producing checksum faults stays accountable across reuse. All retry
/// accounting goes through these methods so the budget invariant stays
/// auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRetries {
    /// Checksum-fault retries.
    pub xsum: u8,
    /// Write-execution-path timeout retries.
    pub wep: u8,
    /// Everything else (collisions, field errors, ECC).
    pub generic: u8,
    /// Timeouts observed on this slot.
    pub timeouts: u8,
}

impl SlotRetries {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            xsum: 0,
            wep: 0,
            generic: 0,
            timeouts: 0,
        }
    }

    /// Counts a checksum fault; returns whether budget remains.
    pub fn count_xsum(&mut self, budget: u8) -> bool {
        self.xsum = self.xsum.saturating_add(1);
        self.xsum <= budget
    }

    /// Counts a write-execution-path timeout; returns whether budget
    /// remains.
    pub fn count_wep(&mut self, budget: u8) -> bool {
        self.wep = self.wep.saturating_add(1);
        self.wep <= budget
    }

    /// Counts a generic retryable failure.
    pub fn count_generic(&mut self) {
        self.generic = self.generic.saturating_add(1);
    }

    /// Counts a timeout.
    pub fn count_timeout(&mut self) {
        self.timeouts = self.timeouts.saturating_add(1);
    }
}

impl Default for SlotRetries {
    fn default() -> Self {
        Self::new()
    }
}

/// One command slot's in-flight state.
#[derive(Debug, Clone, Copy)]
pub struct Token {
    /// Slot index (fixed for the token's lifetime).
    pub slot: u8,
    /// Command class; selects the status array and timeout table.
    pub class: TokenClass,
    /// Claimed from the pool (allocated but possibly not yet issued).
    pub claimed: bool,
    /// Whether a command is in flight in this slot.
    pub active: bool,
    /// Expected polarity of the next fresh status update.
    pub polarity: bool,
    /// Last observed status byte, if any.
    pub last_status: Option<StatusByte>,
    /// Cached extended status for the current status byte.
    pub ext_status: Option<ExtStatus>,
    /// Bound hardware buffers.
    pub bufs: Buffers,
    /// Host-to-device length in bytes.
    pub h2d_len: u32,
    /// Device-to-host length in bytes.
    pub d2h_len: u32,
    /// Sequence number stamped at issue (device-directed commands).
    pub seq: u16,
    /// When the command was last (re-)written to hardware.
    pub issued_at: TimeUs,
    /// When this slot last saw any status movement.
    pub touched_at: TimeUs,
    /// Absolute deadline for the current stage.
    pub deadline: TimeUs,
    /// When the current deadline was armed. Guards against false
    /// timeouts caused by polling starvation.
    pub armed_at: TimeUs,
    /// Lost-command re-writes used for the current issue.
    pub refreshes: u8,
    /// Per-token retry counter; survives re-issues of this token.
    pub retries: u8,
    /// Orphaned-read-buffer recovery attempts used.
    pub rdbuf_recovery: u8,
    /// Current outcome.
    pub result: TokenResult,
    /// Originating request, if any.
    pub request: Option<RequestId>,
    /// Paired slot for redundant writes.
    pub buddy: Option<u8>,
    /// This token owns the sequence number a peer reported missing and is
    /// one short timeout away from replay.
    pub ooo_missing: bool,
    /// Marked for replay at the normal stage timeout.
    pub ooo_replay: bool,
    /// Expected-noisy maintenance token; timeout warnings are suppressed.
    pub quiet: bool,
    /// The firmware has confirmed it holds this command (out-of-order
    /// reports imply receipt).
    pub in_hw: bool,
    /// The host request was already released by an early commit.
    pub early_committed: bool,
    /// The logical operation this token carries.
    pub op: Operation,
    /// The finalized command occupying the slot.
    pub cmd: CmdWord,
}

impl Token {
    /// An idle token for `slot`.
    #[must_use]
    pub const fn idle(slot: u8) -> Self {
        Self {
            slot,
            class: TokenClass::Control,
            claimed: false,
            active: false,
            polarity: false,
            last_status: None,
            ext_status: None,
            bufs: Buffers::none(),
            h2d_len: 0,
            d2h_len: 0,
            seq: 0,
            issued_at: 0,
            touched_at: 0,
            deadline: 0,
            armed_at: 0,
            refreshes: 0,
            retries: 0,
            rdbuf_recovery: 0,
            result: TokenResult::Pending,
            request: None,
            buddy: None,
            ooo_missing: false,
            ooo_replay: false,
            quiet: false,
            in_hw: false,
            early_committed: false,
            op: Operation::Null,
            cmd: CmdWord::zeroed(),
        }
    }

    /// Whether this token's command addresses the underlying storage.
    #[must_use]
    pub fn is_device_directed(&self) -> bool {
        self.cmd.opcode().is_some_and(muon_proto::Opcode::is_device_directed)
    }

    /// Re-arms the stage deadline.
    pub(crate) fn arm_timeout(&mut self, now: TimeUs, budget: TimeUs) {
        self.armed_at = now;
        self.deadline = now.saturating_add(budget);
    }

    /// Records a (re-)issue to hardware.
    pub(crate) fn note_issued(&mut self, now: TimeUs) {
        self.issued_at = now;
    }

    /// Clears transient state on release back to the free pool. The slot
    /// index and polarity expectation persist, since polarity alternates
    /// across reuse of the slot.
    pub(crate) fn reset_for_release(&mut self) {
        let slot = self.slot;
        let polarity = self.polarity;
        *self = Self::idle(slot);
        self.polarity = polarity;
    }

    /// Counts a per-token retry; returns whether budget remains.
    pub(crate) fn count_retry(&mut self, budget: u8) -> bool {
        self.retries = self.retries.saturating_add(1);
        self.retries <= budget
    }
}
