//! Per-token status decode.
//!
//! Three decode paths share this machinery — host reads, writes, and
//! generic/control commands (trim rides the control path). The paths
//! differ only inside the success and failure dispatch; the housekeeping
//! around them is identical and runs in a fixed order for every active
//! token, once per polling cycle:
//!
//! 1. compare the slot's status byte against the last observation; an
//!    unchanged byte skips decode entirely,
//! 2. on change, record it, drop the cached extended status, and emit the
//!    status-changed event,
//! 3. discard stale updates by polarity (a mismatched polarity bit means
//!    the update belongs to the slot's previous occupant) while still
//!    counting them as freshness for the lost-command logic,
//! 4. dispatch fresh updates on the success bit,
//! 5. re-issue commands that have shown no movement since issue for too
//!    long (lost-command refresh),
//! 6. check the stage deadline last.
//!
//! Status codes that intentionally share handling call the same handler
//! function from their match arms; there is no fallthrough to trace
//! through.
//!
//! Nothing in here returns an error. Every path parks a result on the
//! token and answers "done" or "not done".

use muon_proto::{BufId, ExtStatus, HwFault, StatusByte, StatusCode};

use crate::TimeUs;
use crate::config::{CommitLevel, Config};
use crate::engine::Engine;
use crate::hal::{CopyOps, DeviceHal, EngineHooks};
use crate::token::{Token, TokenClass, TokenResult};
use crate::{mdebug, merr, mfatal, mtrace, mwarn};

impl<H: DeviceHal> Engine<H> {
    /// Runs one decode cycle for an active token against its current
    /// status byte. Returns `true` when the token reached a terminal
    /// result.
    pub(crate) fn poll_token(
        &self,
        cfg: &Config,
        ops: &dyn CopyOps,
        hooks: &dyn EngineHooks,
        tok: &mut Token,
        status: StatusByte,
        now: TimeUs,
    ) -> bool {
        let baseline = tok.last_status.is_none();
        let changed = tok.last_status != Some(status);
        if changed {
            tok.last_status = Some(status);
            tok.ext_status = None;
            hooks.status_changed(tok.slot, status);

            if status.odd() != tok.polarity {
                // A previous occupant of the slot finishing late. Content
                // is meaningless, but the slot did move. The exception is when this is
                // the first observation after issue, which is just the
                // leftover byte the command was issued over.
                mtrace!("slot {}: stale status {:#04x}", tok.slot, status.raw());
                if !baseline {
                    tok.touched_at = now;
                }
            } else {
                tok.touched_at = now;
                if status.success() {
                    self.on_success(cfg, ops, hooks, tok, status);
                } else {
                    self.on_failure(cfg, hooks, tok, status, now);
                }
            }
        }

        if tok.result == TokenResult::Retry {
            self.service_retry(cfg, tok, now);
        }
        if tok.result.is_terminal() {
            return true;
        }

        self.lost_command_refresh(cfg, tok, now);

        if now >= tok.deadline {
            return self.handle_timeout(cfg, tok, now);
        }
        false
    }

    /// Reads (and caches) the extended status for the current status byte.
    pub(crate) fn fetch_ext(&self, tok: &mut Token) -> ExtStatus {
        if let Some(ext) = tok.ext_status {
            ext
        } else {
            let ext = self.hal.read_ext_status(tok.slot);
            tok.ext_status = Some(ext);
            ext
        }
    }

    // -----------------------------------------------------------------------
    // Success path
    // -----------------------------------------------------------------------

    fn on_success(
        &self,
        _cfg: &Config,
        ops: &dyn CopyOps,
        _hooks: &dyn EngineHooks,
        tok: &mut Token,
        status: StatusByte,
    ) {
        if status.extend() {
            // Extended status on a success is a non-fatal device warning.
            // Log it; the command still completed.
            let ext = self.fetch_ext(tok);
            mwarn!(
                "slot {}: warning on success: {:?} tf={:#010x}",
                tok.slot,
                ext.conditions(),
                ext.taskfile()
            );
        }

        match tok.class {
            TokenClass::HostRead => {
                if tok.d2h_len > 0 {
                    tok.bufs.read = Some(BufId::new(status.read_buffer()));
                    if self.hal.read_page(tok, ops).is_err() {
                        merr!("slot {}: read-page transfer failed", tok.slot);
                        tok.result = TokenResult::Abort;
                        return;
                    }
                }
                // The read buffer outlives the token; the request layer
                // releases it once it has consumed the data.
                tok.result = TokenResult::Ok;
            }
            TokenClass::HostWrite | TokenClass::Control => {
                self.release_write_buffers(tok);
                tok.result = TokenResult::Ok;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Failure dispatch
    // -----------------------------------------------------------------------

    fn on_failure(
        &self,
        cfg: &Config,
        hooks: &dyn EngineHooks,
        tok: &mut Token,
        status: StatusByte,
        now: TimeUs,
    ) {
        match status.code() {
            StatusCode::Queued | StatusCode::Received | StatusCode::WaitDevice => {
                self.on_progress(cfg, hooks, tok, status.code(), now);
            }
            StatusCode::Sequenced => match tok.class {
                // An uncompleted control message reporting `Sequenced` is
                // a pure no-op, unlike the data paths. Deliberate
                // asymmetry; do not merge with the arm above.
                TokenClass::Control => {}
                _ => self.on_progress(cfg, hooks, tok, StatusCode::Sequenced, now),
            },
            StatusCode::Collision => self.on_collision(tok),
            StatusCode::FieldError => self.on_field_error(tok),
            StatusCode::IllegalCmd => self.on_illegal(cfg, tok),
            StatusCode::ExeError => self.on_exe_error(tok),
            StatusCode::DataEcc | StatusCode::CmdEcc => self.on_ecc(tok),
            StatusCode::XsumError => self.on_xsum_dma(cfg, tok),
            StatusCode::UnknownCmd => self.on_unknown_cmd(cfg, tok),
            StatusCode::OooDup => self.on_ooo_dup(tok),
            StatusCode::OutOfOrder => self.on_out_of_order(cfg, tok, status, now),
            StatusCode::DeviceWarn => self.on_device_warn(cfg, tok, now),
            StatusCode::Invalid => {
                mdebug!("slot {}: invalid status code", tok.slot);
            }
        }
    }

    /// Progress stages advance the stage deadline. The write path also
    /// releases its device-side write buffers once the firmware has
    /// queued (and therefore copied) the data, and may report the request
    /// durable early.
    fn on_progress(
        &self,
        cfg: &Config,
        hooks: &dyn EngineHooks,
        tok: &mut Token,
        code: StatusCode,
        now: TimeUs,
    ) {
        tok.arm_timeout(now, cfg.stage_timeouts(tok.class).for_status(code));

        if tok.class == TokenClass::HostWrite {
            if code == StatusCode::Queued {
                self.release_write_buffers(tok);
            }
            if !tok.early_committed && self.commit_level_reached(cfg, tok) {
                tok.early_committed = true;
                if let Some(req) = tok.request {
                    hooks.early_commit(req);
                }
            }
        }
    }

    /// Whether the configured commit level is satisfied for a write that
    /// just reported progress.
    fn commit_level_reached(&self, cfg: &Config, tok: &Token) -> bool {
        match cfg.commit_level {
            CommitLevel::Never => false,
            CommitLevel::Single => true,
            CommitLevel::Double => self.buddy_queued(tok),
            CommitLevel::DoubleBuffer => {
                // Fall back to plain double semantics when no extra write
                // buffer was assigned.
                if tok.bufs.write_extra.is_some() {
                    true
                } else {
                    self.buddy_queued(tok)
                }
            }
        }
    }

    /// Whether a redundancy buddy (if any) has also reached hardware.
    fn buddy_queued(&self, tok: &Token) -> bool {
        match tok.buddy {
            None => true,
            Some(buddy) => {
                let bt = self.pool.slot(buddy).lock();
                bt.result == TokenResult::Ok
                    || bt
                        .last_status
                        .is_some_and(|s| s.success() || s.code().is_progress())
            }
        }
    }

    fn on_collision(&self, tok: &mut Token) {
        self.pool.retries(tok.slot).lock().count_generic();
        tok.result = TokenResult::Retry;
    }

    /// Correctable field error. A write whose host buffer is already gone
    /// (early commit) must not re-transfer from the host; the data
    /// already reached the device.
    fn on_field_error(&self, tok: &mut Token) {
        self.pool.retries(tok.slot).lock().count_generic();
        if tok.class == TokenClass::HostWrite && tok.early_committed {
            tok.cmd.clear_h2d();
        }
        tok.result = TokenResult::Retry;
    }

    /// Illegal command: the extended status low byte says why.
    fn on_illegal(&self, cfg: &Config, tok: &mut Token) {
        let ext = self.fetch_ext(tok);
        match ext.fault() {
            Some(HwFault::Xsum) => {
                let within = self
                    .pool
                    .retries(tok.slot)
                    .lock()
                    .count_xsum(cfg.xsum_retries);
                tok.result = if within {
                    TokenResult::Retry
                } else {
                    TokenResult::Abort
                };
            }
            Some(HwFault::WepTimeout) => {
                let within = self.pool.retries(tok.slot).lock().count_wep(cfg.wep_retries);
                tok.result = if within {
                    TokenResult::Retry
                } else {
                    TokenResult::Abort
                };
            }
            Some(HwFault::CmdEcc | HwFault::DataEcc | HwFault::BadOffset) => {
                self.pool.retries(tok.slot).lock().count_generic();
                tok.result = TokenResult::Retry;
            }
            Some(HwFault::UnknownCmd) => self.on_unknown_cmd(cfg, tok),
            Some(HwFault::Fatal) | None => {
                merr!(
                    "slot {}: fatal firmware fault {:#04x}",
                    tok.slot,
                    ext.raw() & 0xFF
                );
                tok.result = TokenResult::AbortHard;
            }
        }
    }

    /// Execution error. Fatal for commands that address the underlying
    /// storage, where the device state can no longer be trusted.
    fn on_exe_error(&self, tok: &mut Token) {
        if tok.is_device_directed() {
            let ext = self.fetch_ext(tok);
            mfatal!(
                "slot {}: execution error on storage command seq {}: {:?} tf={:#010x}",
                tok.slot,
                tok.seq,
                ext.conditions(),
                ext.taskfile()
            );
            tok.result = TokenResult::AbortHard;
        } else {
            tok.result = TokenResult::Abort;
        }
    }

    /// ECC on the data payload or the command word itself.
    fn on_ecc(&self, tok: &mut Token) {
        self.pool.retries(tok.slot).lock().count_generic();
        tok.result = TokenResult::Retry;
    }

    /// Checksum error on the DMA write path. Out of budget it shares the
    /// unknown-command handling.
    fn on_xsum_dma(&self, cfg: &Config, tok: &mut Token) {
        let within = self
            .pool
            .retries(tok.slot)
            .lock()
            .count_xsum(cfg.xsum_retries);
        if within {
            tok.result = TokenResult::Retry;
        } else {
            self.on_unknown_cmd(cfg, tok);
        }
    }

    fn on_unknown_cmd(&self, cfg: &Config, tok: &mut Token) {
        tok.result = if cfg.halt_on_write_error && tok.class == TokenClass::HostWrite {
            TokenResult::AbortHard
        } else {
            TokenResult::Abort
        };
    }

    /// Duplicate completion of an out-of-order command. With a redundancy
    /// buddy the data is already safe; without one the outcome depends on
    /// whether the host data is still available for a retry.
    fn on_ooo_dup(&self, tok: &mut Token) {
        if tok.buddy.is_some() {
            self.release_write_buffers(tok);
            tok.result = TokenResult::Ok;
        } else if tok.request.is_some() && !tok.early_committed {
            tok.result = TokenResult::Retry;
        } else {
            tok.result = TokenResult::Abort;
        }
    }

    /// Out-of-order completion. The control path deliberately ignores it
    /// (see the `Sequenced` arm); the data paths count it, note that the
    /// firmware demonstrably holds the command, and hand the sequence
    /// numbers to the replay policy when extended status is available.
    fn on_out_of_order(&self, cfg: &Config, tok: &mut Token, status: StatusByte, now: TimeUs) {
        if tok.class == TokenClass::Control {
            return;
        }

        self.pool.retries(tok.slot).lock().count_generic();
        tok.in_hw = true;

        if status.extend() {
            let ext = self.fetch_ext(tok);
            self.handle_ooo(cfg, tok, ext, now);
        } else {
            mdebug!("slot {}: out-of-order without extended status", tok.slot);
        }
    }

    /// Non-fatal device warning: log the decoded conditions and keep
    /// waiting on the wait-device budget.
    fn on_device_warn(&self, cfg: &Config, tok: &mut Token, now: TimeUs) {
        if tok.last_status.is_some_and(StatusByte::extend) {
            let ext = self.fetch_ext(tok);
            mwarn!(
                "slot {}: device warning: {:?} tf={:#010x}",
                tok.slot,
                ext.conditions(),
                ext.taskfile()
            );
        }
        tok.arm_timeout(now, cfg.stage_timeouts(tok.class).wait_device);
    }

    // -----------------------------------------------------------------------
    // Retry servicing
    // -----------------------------------------------------------------------

    /// Converts a retryable result into a re-issue while budget remains,
    /// or a terminal abort once it is spent.
    fn service_retry(&self, cfg: &Config, tok: &mut Token, now: TimeUs) {
        let allowed = {
            let retries = self.pool.retries(tok.slot).lock();
            self.hal.can_retry(tok, &retries, cfg)
        };

        if allowed && tok.count_retry(cfg.generic_retries) && self.reissue(tok, now).is_ok() {
            tok.result = TokenResult::Pending;
            tok.arm_timeout(now, cfg.stage_timeouts(tok.class).queued);
        } else {
            tok.result = TokenResult::Abort;
        }
    }

    // -----------------------------------------------------------------------
    // Lost-command refresh
    // -----------------------------------------------------------------------

    /// A slot whose status has not moved at all since issue may have had
    /// its command silently dropped. Re-write it, bounded by the refresh
    /// budget.
    fn lost_command_refresh(&self, cfg: &Config, tok: &mut Token, now: TimeUs) {
        if tok.touched_at > tok.issued_at {
            return;
        }
        if now.saturating_sub(tok.issued_at) <= cfg.lost_cmd_us {
            return;
        }
        if tok.refreshes >= cfg.lost_cmd_refreshes {
            return;
        }

        tok.refreshes += 1;
        mwarn!(
            "slot {}: no status movement {}us after issue, re-writing command",
            tok.slot,
            now - tok.issued_at
        );
        if self.reissue(tok, now).is_err() {
            merr!("slot {}: lost-command re-write failed", tok.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OooPolicy;
    use crate::testutil::{
        MockHal, NullOps, RecordingHooks, engine, read_request, set_fresh, write_request,
    };
    use muon_proto::StatusByte;

    fn quick_cfg() -> Config {
        let mut cfg = Config::default();
        cfg.ooo_policy = OooPolicy::Off;
        cfg
    }

    /// Polls once with the scripted status arrays.
    fn poll(eng: &Engine<MockHal>, cfg: &Config, hooks: &RecordingHooks, now: TimeUs) -> usize {
        eng.poll(cfg, &NullOps, hooks, now)
    }

    #[test]
    fn write_success_completes_and_frees_buffers() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        set_fresh(&eng, TokenClass::HostWrite, slot, true, false, 0);
        assert_eq!(poll(&eng, &cfg, &hooks, 10), 1);

        let done = hooks.completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, TokenResult::Ok);
        assert_eq!(done[0].2, None);

        // The write buffer went into the dealloc queue and piggybacks on
        // the next command.
        let slot = eng.submit(&cfg, &NullOps, &write_request(2), 20).unwrap();
        let tok = eng.pool().slot(slot).lock();
        assert_eq!(tok.cmd.dealloc(), Some(BufId::new(11)));
    }

    #[test]
    fn read_success_captures_read_buffer() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &read_request(7), 0).unwrap();

        set_fresh(&eng, TokenClass::HostRead, slot, true, false, 0x0C);
        assert_eq!(poll(&eng, &cfg, &hooks, 10), 1);

        let done = hooks.completions();
        assert_eq!(done[0].1, TokenResult::Ok);
        // Success code bits carry the completion read buffer.
        assert_eq!(done[0].2, Some(BufId::new(0x0C)));
    }

    #[test]
    fn stale_polarity_is_a_noop() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        let starts_before = eng.hal().starts().len();

        // Baseline observation: the byte the command was issued over.
        assert_eq!(poll(&eng, &cfg, &hooks, 5), 0);

        // Success bit set but polarity inverted: belongs to the slot's
        // previous occupant. Nothing may change except freshness.
        let odd = eng.pool().slot(slot).lock().polarity;
        eng.hal().set_status(
            TokenClass::HostWrite,
            slot,
            StatusByte::from_parts(true, !odd, false, 0),
        );
        assert_eq!(poll(&eng, &cfg, &hooks, 10), 0);

        let tok = eng.pool().slot(slot).lock();
        assert_eq!(tok.result, TokenResult::Pending);
        assert_eq!(tok.retries, 0);
        assert!(tok.bufs.write.is_some());
        assert_eq!(tok.touched_at, 10);
        drop(tok);
        assert!(hooks.completions().is_empty());
        assert_eq!(eng.hal().starts().len(), starts_before);
    }

    #[test]
    fn unchanged_status_skips_decode() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Queued as u8);
        poll(&eng, &cfg, &hooks, 10);
        let changes = hooks.changes().len();
        let starts = eng.hal().starts().len();
        let deadline = eng.pool().slot(slot).lock().deadline;

        // Same byte again: no event, no decode, no hardware write.
        poll(&eng, &cfg, &hooks, 20);
        assert_eq!(hooks.changes().len(), changes);
        assert_eq!(eng.hal().starts().len(), starts);
        assert_eq!(eng.pool().slot(slot).lock().deadline, deadline);
    }

    #[test]
    fn progress_advances_stage_deadline() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Received as u8);
        poll(&eng, &cfg, &hooks, 100);

        let tok = eng.pool().slot(slot).lock();
        assert_eq!(tok.deadline, 100 + cfg.write_timeouts.received);
        assert_eq!(tok.armed_at, 100);
    }

    #[test]
    fn write_queued_releases_write_buffers() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Queued as u8);
        poll(&eng, &cfg, &hooks, 10);

        assert!(eng.pool().slot(slot).lock().bufs.write.is_none());
    }

    #[test]
    fn early_commit_fires_at_single_level() {
        let mut cfg = quick_cfg();
        cfg.commit_level = CommitLevel::Single;
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(5), 0).unwrap();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Queued as u8);
        poll(&eng, &cfg, &hooks, 10);
        assert_eq!(hooks.commits(), [crate::token::RequestId(5)]);

        // Further progress does not re-fire the commit.
        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Received as u8);
        poll(&eng, &cfg, &hooks, 20);
        assert_eq!(hooks.commits().len(), 1);
    }

    #[test]
    fn collision_retries_then_aborts_when_spent() {
        let mut cfg = quick_cfg();
        cfg.generic_retries = 2;
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        // Each collision byte must differ from the last observation to
        // reach decode; toggle the extend bit.
        let mut now = 10;
        let mut extend = false;
        loop {
            set_fresh(&eng, TokenClass::HostWrite, slot, false, extend, StatusCode::Collision as u8);
            if poll(&eng, &cfg, &hooks, now) == 1 {
                break;
            }
            extend = !extend;
            now += 10;
            assert!(now < 200, "retry budget never terminated");
        }

        let done = hooks.completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, TokenResult::Abort);
        // Two retries allowed: initial start plus two re-issues.
        assert_eq!(eng.hal().starts().len(), 3);
    }

    #[test]
    fn xsum_fault_with_budget_is_retried_not_aborted() {
        let mut cfg = quick_cfg();
        cfg.xsum_retries = 2;
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        let starts_before = eng.hal().starts().len();

        eng.hal().set_ext(slot, ExtStatus::new(u64::from(0xFAu8)));
        set_fresh(&eng, TokenClass::HostWrite, slot, false, true, StatusCode::IllegalCmd as u8);
        assert_eq!(poll(&eng, &cfg, &hooks, 10), 0);

        // Not aborted: the command went back to hardware.
        assert!(hooks.completions().is_empty());
        assert_eq!(eng.hal().starts().len(), starts_before + 1);
        assert_eq!(eng.pool().retries(slot).lock().xsum, 1);
        assert_eq!(eng.pool().slot(slot).lock().result, TokenResult::Pending);
    }

    #[test]
    fn xsum_fault_without_budget_aborts() {
        let mut cfg = quick_cfg();
        cfg.xsum_retries = 0;
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        eng.hal().set_ext(slot, ExtStatus::new(u64::from(0xFAu8)));
        set_fresh(&eng, TokenClass::HostWrite, slot, false, true, StatusCode::IllegalCmd as u8);
        assert_eq!(poll(&eng, &cfg, &hooks, 10), 1);
        assert_eq!(hooks.completions()[0].1, TokenResult::Abort);
    }

    #[test]
    fn fatal_firmware_fault_halts_device() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        eng.hal().set_ext(slot, ExtStatus::new(0xFF));
        set_fresh(&eng, TokenClass::HostWrite, slot, false, true, StatusCode::IllegalCmd as u8);
        poll(&eng, &cfg, &hooks, 10);

        assert_eq!(hooks.completions()[0].1, TokenResult::AbortHard);
        assert_eq!(eng.run_state(), crate::hal::RunState::Halted);
        assert_eq!(
            eng.submit(&cfg, &NullOps, &write_request(2), 20),
            Err(crate::engine::SubmitError::Halted)
        );
    }

    #[test]
    fn exe_error_on_storage_command_halts() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::ExeError as u8);
        poll(&eng, &cfg, &hooks, 10);
        assert_eq!(hooks.completions()[0].1, TokenResult::AbortHard);
    }

    #[test]
    fn exe_error_on_control_command_plain_aborts() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let req = crate::engine::HostRequest {
            id: crate::token::RequestId(2),
            op: muon_proto::Operation::GetParams { index: 4 },
            h2d_len: 0,
            d2h_len: 0,
            bufs: crate::token::Buffers::none(),
            quiet: false,
        };
        let slot = eng.submit(&cfg, &NullOps, &req, 0).unwrap();

        set_fresh(&eng, TokenClass::Control, slot, false, false, StatusCode::ExeError as u8);
        poll(&eng, &cfg, &hooks, 10);
        assert_eq!(hooks.completions()[0].1, TokenResult::Abort);
        assert_eq!(eng.run_state(), crate::hal::RunState::Running);
    }

    #[test]
    fn control_sequenced_and_ooo_are_noops() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let req = crate::engine::HostRequest {
            id: crate::token::RequestId(3),
            op: muon_proto::Operation::Null,
            h2d_len: 0,
            d2h_len: 0,
            bufs: crate::token::Buffers::none(),
            quiet: true,
        };
        let slot = eng.submit(&cfg, &NullOps, &req, 0).unwrap();
        let deadline = eng.pool().slot(slot).lock().deadline;

        set_fresh(&eng, TokenClass::Control, slot, false, false, StatusCode::Sequenced as u8);
        poll(&eng, &cfg, &hooks, 10);
        let tok = eng.pool().slot(slot).lock();
        assert_eq!(tok.deadline, deadline);
        assert_eq!(tok.result, TokenResult::Pending);
        assert!(!tok.in_hw);
        drop(tok);

        set_fresh(&eng, TokenClass::Control, slot, false, false, StatusCode::OutOfOrder as u8);
        poll(&eng, &cfg, &hooks, 20);
        let tok = eng.pool().slot(slot).lock();
        assert_eq!(tok.deadline, deadline);
        assert!(!tok.in_hw);
        assert_eq!(eng.pool().retries(slot).lock().generic, 0);
    }

    #[test]
    fn ooo_dup_with_buddy_counts_as_success() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let req = write_request(4);
        let mut second = crate::token::Buffers::none();
        second.write = Some(BufId::new(12));
        let (a, _b) = eng
            .submit_mirrored(&cfg, &NullOps, &req, second, 0)
            .unwrap();

        set_fresh(&eng, TokenClass::HostWrite, a, false, false, StatusCode::OooDup as u8);
        poll(&eng, &cfg, &hooks, 10);
        assert_eq!(hooks.completions()[0].1, TokenResult::Ok);
    }

    #[test]
    fn ooo_dup_without_host_buffer_aborts() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(4), 0).unwrap();
        eng.pool().slot(slot).lock().early_committed = true;

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::OooDup as u8);
        poll(&eng, &cfg, &hooks, 10);
        assert_eq!(hooks.completions()[0].1, TokenResult::Abort);
    }

    #[test]
    fn device_warning_rearms_and_keeps_waiting() {
        let cfg = quick_cfg();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        eng.hal().set_ext(slot, ExtStatus::new(0x2)); // CRC condition bit
        set_fresh(&eng, TokenClass::HostWrite, slot, false, true, StatusCode::DeviceWarn as u8);
        assert_eq!(poll(&eng, &cfg, &hooks, 50), 0);

        let tok = eng.pool().slot(slot).lock();
        assert_eq!(tok.result, TokenResult::Pending);
        assert_eq!(tok.deadline, 50 + cfg.write_timeouts.wait_device);
    }

    #[test]
    fn field_error_after_early_commit_clears_h2d() {
        let mut cfg = quick_cfg();
        cfg.commit_level = CommitLevel::Single;
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Queued as u8);
        poll(&eng, &cfg, &hooks, 10);
        assert!(eng.pool().slot(slot).lock().early_committed);

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::FieldError as u8);
        poll(&eng, &cfg, &hooks, 20);

        // Retried with the host-transfer flag cleared.
        let tok = eng.pool().slot(slot).lock();
        assert!(!tok.cmd.flags().contains(muon_proto::CmdFlags::H2D));
        assert_eq!(tok.result, TokenResult::Pending);
    }

    #[test]
    fn lost_command_is_rewritten_within_budget() {
        let mut cfg = quick_cfg();
        cfg.lost_cmd_us = 100;
        cfg.lost_cmd_refreshes = 1;
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        let starts_before = eng.hal().starts().len();

        // No status movement at all; status array stays at power-on value.
        poll(&eng, &cfg, &hooks, 50);
        assert_eq!(eng.hal().starts().len(), starts_before);

        poll(&eng, &cfg, &hooks, 150);
        assert_eq!(eng.hal().starts().len(), starts_before + 1);
        assert_eq!(eng.pool().slot(slot).lock().refreshes, 1);

        // Budget spent: no further re-writes.
        poll(&eng, &cfg, &hooks, 300);
        assert_eq!(eng.hal().starts().len(), starts_before + 1);
    }
}
