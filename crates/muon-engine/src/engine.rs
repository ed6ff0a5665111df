//! The engine: token pool, HAL, and the submit/poll entry points.
//!
//! One [`Engine`] exists per device. It owns the fixed token pool, the
//! deallocation piggyback queue, the monotonic sequence counter, and the
//! device run state; the [`Config`] stays with the embedder and is passed
//! by reference into every operation.
//!
//! Lock order: a submission takes its newly claimed slot lock(s), then
//! the dealloc queue; the poll loop takes one slot lock at a time and may
//! take a second slot's lock only during out-of-order replay. The queue
//! locks are always innermost, so the two paths cannot cycle.

use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU64, Ordering};

use muon_proto::{BufId, EncodeError, Operation, StatusByte};
use planck_noalloc::ringbuf::RingBuf;

use crate::TimeUs;
use crate::config::Config;
use crate::hal::{CopyOps, DeviceHal, EngineHooks, HalError, RunState};
use crate::pool::{MAX_TOKENS, PoolError, TokenPool};
use crate::sync::SpinLock;
use crate::token::{Buffers, RequestId, Token, TokenClass, TokenResult};
use crate::{mfatal, mwarn};

/// Dealloc queue backing size (usable capacity is one less).
const DEALLOC_QUEUE_SIZE: usize = 129;

/// Submission failures. Everything here is synchronous; a failed
/// submission never reaches hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The device is halted; only external recovery clears this.
    Halted,
    /// Request carries data in both directions.
    Bidirectional,
    /// No free token; queue and resubmit after a completion.
    Pool(PoolError),
    /// The operation failed validation in the encoder.
    Encode(EncodeError),
    /// The hardware refused the command or the doorbell timed out.
    Hal(HalError),
    /// Mirrored submission of an operation that is not a write.
    NotMirrorable,
}

impl core::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Halted => f.write_str("device halted"),
            Self::Bidirectional => f.write_str("bidirectional request"),
            Self::Pool(e) => write!(f, "pool: {e}"),
            Self::Encode(e) => write!(f, "encode: {e}"),
            Self::Hal(e) => write!(f, "hal: {e}"),
            Self::NotMirrorable => f.write_str("only writes can be mirrored"),
        }
    }
}

/// A host request bound for dispatch.
///
/// The request layer keeps ownership of its data; the engine holds only
/// `id` and reports against it.
#[derive(Debug, Clone, Copy)]
pub struct HostRequest {
    /// Opaque back-reference for completion reporting.
    pub id: RequestId,
    /// The operation to encode.
    pub op: Operation,
    /// Host-to-device payload length in bytes.
    pub h2d_len: u32,
    /// Device-to-host payload length in bytes.
    pub d2h_len: u32,
    /// Hardware buffers assigned to this request.
    pub bufs: Buffers,
    /// Expected-noisy maintenance request; suppress timeout warnings.
    pub quiet: bool,
}

/// Per-device command/response engine.
pub struct Engine<H: DeviceHal> {
    pub(crate) hal: H,
    pub(crate) pool: TokenPool,
    dealloc: SpinLock<RingBuf<BufId, DEALLOC_QUEUE_SIZE>>,
    next_seq: AtomicU16,
    run_state: AtomicU8,
    last_refresh: [AtomicU64; 3],
}

impl<H: DeviceHal> Engine<H> {
    /// Brings up the hardware and builds the engine around it.
    ///
    /// # Errors
    ///
    /// [`HalError`] when the hardware cannot be initialized or enabled.
    pub fn new(hal: H, cfg: &Config) -> Result<Self, HalError> {
        hal.init(cfg)?;
        hal.enable()?;
        Ok(Self {
            hal,
            pool: TokenPool::new(cfg.tokens, cfg.reserved_tokens),
            dealloc: SpinLock::new(RingBuf::new()),
            next_seq: AtomicU16::new(1),
            run_state: AtomicU8::new(RunState::Running as u8),
            last_refresh: [const { AtomicU64::new(0) }; 3],
        })
    }

    /// The hardware access layer.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// The token pool (diagnostics and reservation).
    #[must_use]
    pub fn pool(&self) -> &TokenPool {
        &self.pool
    }

    /// Current device run state.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.run_state.load(Ordering::Acquire))
    }

    /// Halts the device. No further commands are issued until
    /// [`recover`](Self::recover).
    pub(crate) fn halt(&self) {
        self.run_state
            .store(RunState::Halted as u8, Ordering::Release);
        self.hal.disable();
        mfatal!("device halted; external recovery required");
    }

    /// External recovery after a halt: re-enables the hardware and
    /// resumes accepting submissions. In-flight slot state is the
    /// embedder's cleanup problem; a halt fails everything back first.
    ///
    /// # Errors
    ///
    /// [`HalError`] when the hardware does not come back.
    pub fn recover(&self) -> Result<(), HalError> {
        self.hal.enable()?;
        self.run_state
            .store(RunState::Running as u8, Ordering::Release);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Maps a host request onto a free token, encodes and finalizes its
    /// command, and starts it.
    ///
    /// Returns the slot now serving the request. The result arrives later
    /// through [`EngineHooks::complete`].
    ///
    /// # Errors
    ///
    /// See [`SubmitError`]; a failed submission leaves no trace in the
    /// pool or hardware.
    pub fn submit(
        &self,
        cfg: &Config,
        ops: &dyn CopyOps,
        req: &HostRequest,
        now: TimeUs,
    ) -> Result<u8, SubmitError> {
        self.check_submittable(req)?;

        let class = class_of(&req.op);
        let slot = self.pool.allocate(class).map_err(SubmitError::Pool)?;
        let seq = self.assign_seq(&req.op);

        match self.start_request(cfg, ops, req, slot, seq, now) {
            Ok(()) => Ok(slot),
            Err(e) => {
                self.pool.release(slot);
                Err(e)
            }
        }
    }

    /// Submits a redundant write pair ("SEC buddies"): the payload is
    /// mirrored into two slots that share one sequence number and replay
    /// together. Each token completes separately; the request layer pairs
    /// the two completions.
    ///
    /// # Errors
    ///
    /// See [`SubmitError`]. On error neither slot stays claimed.
    pub fn submit_mirrored(
        &self,
        cfg: &Config,
        ops: &dyn CopyOps,
        req: &HostRequest,
        secondary_bufs: Buffers,
        now: TimeUs,
    ) -> Result<(u8, u8), SubmitError> {
        self.check_submittable(req)?;

        let Operation::Write { lba, len, .. } = req.op else {
            return Err(SubmitError::NotMirrorable);
        };
        let Some(second_wbuf) = secondary_bufs.write else {
            return Err(SubmitError::NotMirrorable);
        };

        let first = self.pool.allocate(TokenClass::HostWrite).map_err(SubmitError::Pool)?;
        let second = match self.pool.allocate(TokenClass::HostWrite) {
            Ok(s) => s,
            Err(e) => {
                self.pool.release(first);
                return Err(SubmitError::Pool(e));
            }
        };

        let seq = self.assign_seq(&req.op);
        let second_op = Operation::Write {
            lba,
            len,
            wbuf: second_wbuf,
        };
        let second_req = HostRequest {
            bufs: secondary_bufs,
            op: second_op,
            ..*req
        };

        let staged = {
            let mut a = self.pool.slot(first).lock();
            let mut b = self.pool.slot(second).lock();
            bind_request(&mut a, req, Some(second));
            bind_request(&mut b, &second_req, Some(first));
            self.hal.mirror_pages(&a, &b, ops)
        };
        let staged = match staged {
            Ok(xfer) => xfer.xsum,
            Err(e) => {
                self.pool.release(first);
                self.pool.release(second);
                return Err(SubmitError::Hal(e));
            }
        };

        for slot in [first, second] {
            if let Err(e) = self.issue_bound(cfg, slot, seq, staged, now) {
                self.hal.reset_token(first);
                self.hal.reset_token(second);
                self.pool.release(first);
                self.pool.release(second);
                return Err(e);
            }
        }
        Ok((first, second))
    }

    /// Shared submission guards.
    fn check_submittable(&self, req: &HostRequest) -> Result<(), SubmitError> {
        if self.run_state() == RunState::Halted {
            return Err(SubmitError::Halted);
        }
        // The hardware has no bidirectional commands.
        if req.h2d_len > 0 && req.d2h_len > 0 {
            return Err(SubmitError::Bidirectional);
        }
        Ok(())
    }

    /// Sequence numbers order device-directed commands; everything else
    /// rides outside the ordering contract.
    fn assign_seq(&self, op: &Operation) -> u16 {
        if class_of(op) == TokenClass::Control && !is_device_directed_op(op) {
            0
        } else {
            self.next_seq.fetch_add(1, Ordering::Relaxed)
        }
    }

    /// Binds, stages, finalizes, and starts a single-token request.
    fn start_request(
        &self,
        cfg: &Config,
        ops: &dyn CopyOps,
        req: &HostRequest,
        slot: u8,
        seq: u16,
        now: TimeUs,
    ) -> Result<(), SubmitError> {
        let staged = {
            let mut tok = self.pool.slot(slot).lock();
            bind_request(&mut tok, req, None);
            if req.h2d_len > 0 && tok.bufs.write.is_some() {
                self.hal
                    .write_page(&tok, ops)
                    .map_err(SubmitError::Hal)?
                    .xsum
            } else {
                0
            }
        };
        self.issue_bound(cfg, slot, seq, staged, now)
    }

    /// Finalizes and starts a token whose request is already bound.
    fn issue_bound(
        &self,
        cfg: &Config,
        slot: u8,
        seq: u16,
        data_xsum: u64,
        now: TimeUs,
    ) -> Result<(), SubmitError> {
        let mut tok = self.pool.slot(slot).lock();

        // Polarity alternates on every reuse of the slot; the expectation
        // is what makes stale status from the previous occupant
        // detectable. It commits only once the command reaches hardware.
        let polarity = !tok.polarity;
        let dealloc = self.pop_dealloc();

        let mut cmd = self.hal.create_command(&tok.op).map_err(SubmitError::Encode)?;
        cmd.finalize(polarity, slot, seq, dealloc, data_xsum);

        if !self.hal.filter_command(&cmd, self.run_state()) {
            self.requeue_dealloc(dealloc);
            return Err(SubmitError::Hal(HalError::Rejected));
        }

        if let Err(e) = self.hal.start_token(slot, &cmd) {
            self.requeue_dealloc(dealloc);
            return Err(SubmitError::Hal(e));
        }

        tok.polarity = polarity;
        tok.cmd = cmd;
        tok.seq = seq;
        tok.result = TokenResult::Pending;
        tok.note_issued(now);
        tok.touched_at = now;
        let queued_timeout = cfg.stage_timeouts(tok.class).queued;
        tok.arm_timeout(now, queued_timeout);
        tok.active = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Runs one polling cycle: snapshots each class's status array, then
    /// decodes every active token once. Returns the number of tokens that
    /// reached a terminal result this cycle.
    pub fn poll(
        &self,
        cfg: &Config,
        ops: &dyn CopyOps,
        hooks: &dyn EngineHooks,
        now: TimeUs,
    ) -> usize {
        let mut completed = 0;
        for class in TokenClass::ALL {
            let mut snap = [StatusByte::new(0); MAX_TOKENS];
            self.hal.read_status(class, &mut snap);
            self.last_refresh[class.index()].store(now, Ordering::Release);

            #[allow(clippy::cast_possible_truncation, reason = "pool count <= 64")]
            for slot in 0..self.pool.count() as u8 {
                if self.poll_slot(cfg, ops, hooks, class, slot, snap[slot as usize], now) {
                    completed += 1;
                }
            }
        }
        completed
    }

    /// Polls one slot; returns whether its token completed.
    fn poll_slot(
        &self,
        cfg: &Config,
        ops: &dyn CopyOps,
        hooks: &dyn EngineHooks,
        class: TokenClass,
        slot: u8,
        status: StatusByte,
        now: TimeUs,
    ) -> bool {
        let mut tok = self.pool.slot(slot).lock();
        if !tok.active || tok.class != class {
            return false;
        }

        if !self.poll_token(cfg, ops, hooks, &mut tok, status, now) {
            return false;
        }

        let req = tok.request;
        let result = tok.result;
        let rdbuf = tok.bufs.read;
        tok.active = false;
        // Read buffers pass to the request layer; any write-side buffers
        // still bound (terminal failure before the firmware queued the
        // data) go back for deallocation.
        tok.bufs.read = None;
        self.release_write_buffers(&mut tok);
        drop(tok);

        if result == TokenResult::AbortHard {
            self.halt();
        }
        self.pool.release(slot);
        if let Some(req) = req {
            hooks.complete(req, result, rdbuf);
        }
        true
    }

    /// When the request layer is done with a completed read's buffer, it
    /// hands the buffer back here to ride out on a future command's
    /// piggybacked deallocation.
    pub fn release_read_buffer(&self, buf: BufId) {
        self.push_dealloc(buf);
    }

    // -----------------------------------------------------------------------
    // Shared plumbing for the decode/timeout/replay paths
    // -----------------------------------------------------------------------

    /// Timestamp of the last status-array snapshot for a class.
    pub(crate) fn last_refresh_us(&self, class: TokenClass) -> TimeUs {
        self.last_refresh[class.index()].load(Ordering::Acquire)
    }

    /// Queues a hardware buffer for piggybacked deallocation.
    pub(crate) fn push_dealloc(&self, buf: BufId) {
        if self.dealloc.lock().try_push(buf).is_err() {
            // The queue only backs up if commands stop flowing; dropping
            // the id leaks a hardware buffer until the next device reset.
            mwarn!("dealloc queue full, leaking buffer {}", buf.as_u8());
        }
    }

    fn pop_dealloc(&self) -> Option<BufId> {
        self.dealloc.lock().pop()
    }

    fn requeue_dealloc(&self, buf: Option<BufId>) {
        if let Some(buf) = buf {
            self.push_dealloc(buf);
        }
    }

    /// Releases a token's write-side buffers into the dealloc queue.
    pub(crate) fn release_write_buffers(&self, tok: &mut Token) {
        for buf in [tok.bufs.write.take(), tok.bufs.write_extra.take()] {
            if let Some(buf) = buf {
                self.push_dealloc(buf);
            }
        }
    }

    /// Re-writes a token's command to hardware (retry, lost-command
    /// refresh, out-of-order replay). The polarity expectation is
    /// unchanged: the slot is not being reused, the same command is
    /// taking another lap.
    pub(crate) fn reissue(&self, tok: &mut Token, now: TimeUs) -> Result<(), HalError> {
        self.hal.start_token(tok.slot, &tok.cmd)?;
        tok.note_issued(now);
        Ok(())
    }
}

/// The command class an operation polls under. Trim rides the control
/// path.
fn class_of(op: &Operation) -> TokenClass {
    match op {
        Operation::Read { .. } | Operation::SeqRead { .. } => TokenClass::HostRead,
        Operation::Write { .. } => TokenClass::HostWrite,
        _ => TokenClass::Control,
    }
}

/// Whether an operation addresses the underlying storage (sequence
/// numbers, execution-error escalation).
fn is_device_directed_op(op: &Operation) -> bool {
    matches!(
        op,
        Operation::Read { .. }
            | Operation::SeqRead { .. }
            | Operation::Write { .. }
            | Operation::Trim { .. }
    )
}

/// Copies a request's bindings onto a freshly claimed token.
fn bind_request(tok: &mut Token, req: &HostRequest, buddy: Option<u8>) {
    tok.class = class_of(&req.op);
    tok.bufs = req.bufs;
    tok.h2d_len = req.h2d_len;
    tok.d2h_len = req.d2h_len;
    tok.request = Some(req.id);
    tok.quiet = req.quiet;
    tok.buddy = buddy;
    tok.op = req.op;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{NullOps, engine, write_request};

    #[test]
    fn submit_rejects_bidirectional() {
        let cfg = Config::default();
        let eng = engine(&cfg);
        let mut req = write_request(1);
        req.d2h_len = 512;
        assert_eq!(
            eng.submit(&cfg, &NullOps, &req, 0),
            Err(SubmitError::Bidirectional)
        );
    }

    #[test]
    fn submit_exhausts_pool() {
        let mut cfg = Config::default();
        cfg.tokens = 2;
        cfg.reserved_tokens = 1;
        let eng = engine(&cfg);
        eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        assert_eq!(
            eng.submit(&cfg, &NullOps, &write_request(2), 0),
            Err(SubmitError::Pool(PoolError::Exhausted))
        );
    }

    #[test]
    fn submit_writes_command_to_hardware() {
        let cfg = Config::default();
        let eng = engine(&cfg);
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        let starts = eng.hal().starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].0, slot);
        assert_eq!(starts[0].1.slot(), slot);
        // First use of the slot flips polarity to odd.
        assert!(starts[0].1.polarity());
    }

    #[test]
    fn mirrored_pair_shares_sequence() {
        let cfg = Config::default();
        let eng = engine(&cfg);
        let req = write_request(9);
        let mut second = Buffers::none();
        second.write = Some(BufId::new(21));
        let (a, b) = eng
            .submit_mirrored(&cfg, &NullOps, &req, second, 0)
            .unwrap();
        let (ta, tb) = (*eng.pool().slot(a).lock(), *eng.pool().slot(b).lock());
        assert_eq!(ta.seq, tb.seq);
        assert_eq!(ta.buddy, Some(b));
        assert_eq!(tb.buddy, Some(a));
    }

    #[test]
    fn mirrored_rejects_non_write() {
        let cfg = Config::default();
        let eng = engine(&cfg);
        let req = HostRequest {
            id: RequestId(1),
            op: Operation::Trim { lba: 0, sectors: 1 },
            h2d_len: 0,
            d2h_len: 0,
            bufs: Buffers::none(),
            quiet: false,
        };
        assert_eq!(
            eng.submit_mirrored(&cfg, &NullOps, &req, Buffers::none(), 0),
            Err(SubmitError::NotMirrorable)
        );
    }

    #[test]
    fn halted_engine_rejects_submissions() {
        let cfg = Config::default();
        let eng = engine(&cfg);
        eng.halt();
        assert_eq!(
            eng.submit(&cfg, &NullOps, &write_request(1), 0),
            Err(SubmitError::Halted)
        );
        eng.recover().unwrap();
        assert!(eng.submit(&cfg, &NullOps, &write_request(1), 0).is_ok());
    }

    #[test]
    fn control_commands_ride_outside_sequencing() {
        let cfg = Config::default();
        let eng = engine(&cfg);
        let req = HostRequest {
            id: RequestId(3),
            op: Operation::Null,
            h2d_len: 0,
            d2h_len: 0,
            bufs: Buffers::none(),
            quiet: true,
        };
        let slot = eng.submit(&cfg, &NullOps, &req, 0).unwrap();
        assert_eq!(eng.pool().slot(slot).lock().seq, 0);

        // Trim is device-directed and does get a sequence number.
        let req = HostRequest {
            op: Operation::Trim { lba: 4, sectors: 8 },
            ..req
        };
        let slot = eng.submit(&cfg, &NullOps, &req, 0).unwrap();
        assert_ne!(eng.pool().slot(slot).lock().seq, 0);
    }

    #[test]
    fn read_buffer_release_feeds_piggyback() {
        let cfg = Config::default();
        let eng = engine(&cfg);
        eng.release_read_buffer(BufId::new(5));
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        let tok = eng.pool().slot(slot).lock();
        assert_eq!(tok.cmd.dealloc(), Some(BufId::new(5)));
    }
}
