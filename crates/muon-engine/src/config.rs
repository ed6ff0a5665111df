//! Engine configuration.
//!
//! The embedder owns a [`Config`] and passes it by reference into every
//! engine operation. Nothing here is global and nothing is read from the
//! environment; how values are loaded and persisted is the embedder's
//! concern.
//!
//! All durations are microseconds on the engine's injected clock.

use muon_proto::StatusCode;

use crate::TimeUs;
use crate::token::TokenClass;

/// Per-stage timeouts for one command class.
///
/// A command's deadline is re-armed as its status advances through the
/// progress stages; each stage has its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    /// Budget while the command sits in the firmware queue.
    pub queued: TimeUs,
    /// Budget after the execution engine has received it.
    pub received: TimeUs,
    /// Budget while waiting on the backing device. Also covers the
    /// `Sequenced` status, which has no timeout entry of its own.
    pub wait_device: TimeUs,
}

impl StageTimeouts {
    /// Selects the budget for a progress status.
    ///
    /// `Sequenced` aliases `WaitDevice`; anything that is not a progress
    /// stage (device warnings re-arming their wait) also gets the
    /// wait-device budget.
    #[must_use]
    pub const fn for_status(&self, code: StatusCode) -> TimeUs {
        match code {
            StatusCode::Queued => self.queued,
            StatusCode::Received => self.received,
            _ => self.wait_device,
        }
    }
}

/// Out-of-order replay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OooPolicy {
    /// Log only; let timeouts pick up the pieces.
    Off,
    /// Replay the missing command quickly: arm a short timeout on the
    /// token owning the missing sequence (or replay immediately when the
    /// quick timeout is configured to zero).
    Quick,
    /// Mark the observing token for replay at its normal stage timeout.
    Delayed,
}

/// Durability level at which a write is reported complete to its
/// originator before the device has fully persisted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitLevel {
    /// Never commit early; wait for terminal success.
    Never,
    /// Commit once one copy is queued in hardware.
    Single,
    /// Commit once both redundant copies are queued.
    Double,
    /// Commit once the data sits in two hardware write buffers. Falls
    /// back to [`Double`](Self::Double) when no extra write buffer was
    /// assigned.
    DoubleBuffer,
}

/// Cache discipline for the memory-mapped command/status regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFlushMode {
    /// Mapping is uncached; plain volatile access suffices.
    None,
    /// Cacheable mapping: flush lines before status reads and after
    /// command writes.
    Flush,
    /// Use non-temporal stores for command submission; flush before
    /// status reads.
    NonTemporal,
}

/// Tunables consumed by the engine. Field values are the knobs the
/// original hardware validation settled on; see [`Config::default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of usable command slots (at most [`MAX_TOKENS`](crate::MAX_TOKENS)).
    pub tokens: usize,
    /// Highest-numbered slots withheld from the general pool for
    /// maintenance commands; reachable only by id.
    pub reserved_tokens: usize,
    /// Stage timeouts for host-sequenced reads.
    pub read_timeouts: StageTimeouts,
    /// Stage timeouts for writes.
    pub write_timeouts: StageTimeouts,
    /// Stage timeouts for generic/control commands.
    pub control_timeouts: StageTimeouts,
    /// How long a slot may go without any status movement after issue
    /// before the command is considered silently dropped and re-written.
    pub lost_cmd_us: TimeUs,
    /// How many lost-command re-writes a single issue gets.
    pub lost_cmd_refreshes: u8,
    /// Retry budget for checksum faults.
    pub xsum_retries: u8,
    /// Retry budget for write-execution-path timeouts.
    pub wep_retries: u8,
    /// Generic per-token retry budget (collisions, field errors, ECC).
    pub generic_retries: u8,
    /// Out-of-order replay policy.
    pub ooo_policy: OooPolicy,
    /// Quick-replay timeout for host-sequenced reads (zero = replay
    /// immediately).
    pub ooo_quick_read_us: TimeUs,
    /// Quick-replay timeout for writes.
    pub ooo_quick_write_us: TimeUs,
    /// Quick-replay timeout for generic/control commands.
    pub ooo_quick_control_us: TimeUs,
    /// Early-commit durability level for writes.
    pub commit_level: CommitLevel,
    /// Cache discipline for the memory-mapped regions.
    pub cache_flush: CacheFlushMode,
    /// Treat an unknown-hardware-command error on the write path as fatal
    /// to the device.
    pub halt_on_write_error: bool,
    /// Track read-buffer exhaustion and attempt recovery of orphaned read
    /// buffers before failing a read stuck in `Queued`.
    pub rdbuf_tracking: bool,
    /// Bound on orphaned-read-buffer recovery attempts per token.
    pub rdbuf_recovery_attempts: u8,
    /// Strip the piggybacked deallocation from a timed-out command so a
    /// retry does not replay it.
    pub drop_dealloc_on_timeout: bool,
}

impl Config {
    /// The stage timeout table for a command class.
    #[must_use]
    pub const fn stage_timeouts(&self, class: TokenClass) -> &StageTimeouts {
        match class {
            TokenClass::HostRead => &self.read_timeouts,
            TokenClass::HostWrite => &self.write_timeouts,
            TokenClass::Control => &self.control_timeouts,
        }
    }

    /// The quick-replay timeout for a command class.
    #[must_use]
    pub const fn ooo_quick_us(&self, class: TokenClass) -> TimeUs {
        match class {
            TokenClass::HostRead => self.ooo_quick_read_us,
            TokenClass::HostWrite => self.ooo_quick_write_us,
            TokenClass::Control => self.ooo_quick_control_us,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tokens: crate::pool::MAX_TOKENS,
            reserved_tokens: 2,
            read_timeouts: StageTimeouts {
                queued: 1_000_000,
                received: 500_000,
                wait_device: 2_000_000,
            },
            write_timeouts: StageTimeouts {
                queued: 1_500_000,
                received: 750_000,
                wait_device: 3_000_000,
            },
            control_timeouts: StageTimeouts {
                queued: 2_000_000,
                received: 2_000_000,
                wait_device: 10_000_000,
            },
            lost_cmd_us: 250_000,
            lost_cmd_refreshes: 2,
            xsum_retries: 3,
            wep_retries: 2,
            generic_retries: 5,
            ooo_policy: OooPolicy::Quick,
            ooo_quick_read_us: 5_000,
            ooo_quick_write_us: 10_000,
            ooo_quick_control_us: 0,
            commit_level: CommitLevel::Never,
            cache_flush: CacheFlushMode::Flush,
            halt_on_write_error: false,
            rdbuf_tracking: true,
            rdbuf_recovery_attempts: 3,
            drop_dealloc_on_timeout: true,
        }
    }
}
