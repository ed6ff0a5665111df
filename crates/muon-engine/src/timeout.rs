//! Timeout handling.
//!
//! A token whose stage deadline has passed is not necessarily dead: the
//! poll loop may have been starved (the status array snapshot predates
//! the deadline arming), a read may be stalled on transient read-buffer
//! exhaustion, or the token may be mid out-of-order replay and expected
//! to blow a deliberately short timeout. Only after those cases are ruled
//! out does the token take a terminal `Timeout` result.
//!
//! A timed-out command may still be in flight on the hardware side. The
//! design tolerates its completion arriving later — the polarity check
//! discards it — rather than requiring a positive cancellation handshake.

use muon_proto::{StatusByte, StatusCode};

use crate::TimeUs;
use crate::config::Config;
use crate::engine::Engine;
use crate::hal::DeviceHal;
use crate::token::{Token, TokenClass, TokenResult};
use crate::{mdebug, mwarn};

impl<H: DeviceHal> Engine<H> {
    /// Handles an elapsed deadline. Returns `true` when the token is now
    /// terminal.
    pub(crate) fn handle_timeout(&self, cfg: &Config, tok: &mut Token, now: TimeUs) -> bool {
        // If the status array has not been refreshed since this deadline
        // was armed, the token never had a chance to report progress.
        // That is polling starvation, not a device timeout.
        if self.last_refresh_us(tok.class) < tok.armed_at {
            return false;
        }

        // A read stuck in the firmware queue may just be waiting for a
        // read buffer. Reclaim orphans and extend, a bounded number of
        // times, before giving up.
        if tok.class == TokenClass::HostRead
            && cfg.rdbuf_tracking
            && stuck_in_queue(tok.last_status)
            && tok.rdbuf_recovery < cfg.rdbuf_recovery_attempts
        {
            tok.rdbuf_recovery += 1;
            let reclaimed = self.recover_read_buffers(tok.slot);
            mdebug!(
                "slot {}: queued-read timeout, reclaimed {} read buffers (attempt {})",
                tok.slot,
                reclaimed,
                tok.rdbuf_recovery
            );
            tok.arm_timeout(now, cfg.stage_timeouts(TokenClass::HostRead).queued);
            return false;
        }

        // Mid out-of-order replay this timeout is expected and quick:
        // re-issue, give it one more short cycle, and report nothing.
        if tok.ooo_missing {
            tok.ooo_missing = false;
            let _ = self.reissue(tok, now);
            tok.arm_timeout(now, cfg.ooo_quick_us(tok.class));
            return false;
        }

        // Delayed replay marker set by the out-of-order policy: the
        // normal stage timeout has now elapsed, so replay.
        if tok.ooo_replay {
            tok.ooo_replay = false;
            let _ = self.reissue(tok, now);
            tok.arm_timeout(now, cfg.stage_timeouts(tok.class).wait_device);
            return false;
        }

        if !tok.quiet {
            mwarn!(
                "slot {}: timeout {}us after issue (status {:?})",
                tok.slot,
                now.saturating_sub(tok.issued_at),
                tok.last_status.map(StatusByte::raw)
            );
        }
        self.pool.retries(tok.slot).lock().count_timeout();

        // A retried command must not replay a deallocation the hardware
        // may have already performed; strip it and requeue the buffer.
        if cfg.rdbuf_tracking && cfg.drop_dealloc_on_timeout {
            if let Some(buf) = tok.cmd.dealloc() {
                tok.cmd.set_dealloc(None);
                self.push_dealloc(buf);
            }
        }

        tok.result = TokenResult::Timeout;
        true
    }

    /// Reclaims read buffers left on inactive tokens, queueing them for
    /// piggybacked deallocation. Returns the number reclaimed.
    ///
    /// `holder` is the slot whose lock the caller already holds.
    fn recover_read_buffers(&self, holder: u8) -> usize {
        let mut reclaimed = 0;
        #[allow(clippy::cast_possible_truncation, reason = "pool count <= 64")]
        for slot in 0..self.pool.count() as u8 {
            if slot == holder {
                continue;
            }
            let mut tok = self.pool.slot(slot).lock();
            if !tok.active {
                if let Some(buf) = tok.bufs.read.take() {
                    drop(tok);
                    self.push_dealloc(buf);
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }
}

/// Whether the last fresh status left the command in the firmware queue.
fn stuck_in_queue(status: Option<StatusByte>) -> bool {
    status.is_some_and(|s| !s.success() && s.code() == StatusCode::Queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use muon_proto::BufId;

    use crate::config::OooPolicy;
    use crate::testutil::{NullOps, RecordingHooks, engine, read_request, set_fresh, write_request};

    fn cfg_short_write_queue() -> Config {
        let mut cfg = Config::default();
        cfg.ooo_policy = OooPolicy::Off;
        cfg.write_timeouts.queued = 100;
        cfg
    }

    #[test]
    fn queued_write_times_out() {
        let cfg = cfg_short_write_queue();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Queued as u8);
        assert_eq!(eng.poll(&cfg, &NullOps, &hooks, 10), 0);

        // Deadline re-armed at 10 for 100us; the freshness timestamp is
        // newer than the arming, so this is a real timeout.
        assert_eq!(eng.poll(&cfg, &NullOps, &hooks, 200), 1);
        let done = hooks.completions();
        assert_eq!(done[0].1, TokenResult::Timeout);
        assert_eq!(eng.pool().retries(slot).lock().timeouts, 1);
    }

    #[test]
    fn starved_poll_is_not_a_timeout() {
        let cfg = cfg_short_write_queue();
        let eng = engine(&cfg);
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 50).unwrap();

        // Deadline armed at 50; the class status array was last refreshed
        // at 0 (never). Direct timeout check far in the future.
        let mut tok = eng.pool().slot(slot).lock();
        assert!(!eng.handle_timeout(&cfg, &mut tok, 10_000));
        assert_eq!(tok.result, TokenResult::Pending);
        drop(tok);
        assert_eq!(eng.pool().retries(slot).lock().timeouts, 0);
    }

    #[test]
    fn ooo_missing_timeout_silently_reissues() {
        let cfg = cfg_short_write_queue();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        let starts_before = eng.hal().starts().len();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Queued as u8);
        eng.poll(&cfg, &NullOps, &hooks, 10);
        eng.pool().slot(slot).lock().ooo_missing = true;

        assert_eq!(eng.poll(&cfg, &NullOps, &hooks, 200), 0);
        let tok = eng.pool().slot(slot).lock();
        assert_eq!(tok.result, TokenResult::Pending);
        assert!(!tok.ooo_missing);
        assert_eq!(tok.issued_at, 200);
        drop(tok);
        assert_eq!(eng.hal().starts().len(), starts_before + 1);
        assert!(hooks.completions().is_empty());
    }

    #[test]
    fn delayed_replay_fires_at_stage_timeout() {
        let cfg = cfg_short_write_queue();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        let starts_before = eng.hal().starts().len();

        set_fresh(&eng, TokenClass::HostWrite, slot, false, false, StatusCode::Queued as u8);
        eng.poll(&cfg, &NullOps, &hooks, 10);
        eng.pool().slot(slot).lock().ooo_replay = true;

        assert_eq!(eng.poll(&cfg, &NullOps, &hooks, 200), 0);
        let tok = eng.pool().slot(slot).lock();
        assert!(!tok.ooo_replay);
        assert_eq!(tok.result, TokenResult::Pending);
        drop(tok);
        assert_eq!(eng.hal().starts().len(), starts_before + 1);
    }

    #[test]
    fn timed_out_command_sheds_its_dealloc() {
        let cfg = cfg_short_write_queue();
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();

        eng.release_read_buffer(BufId::new(5));
        let slot = eng.submit(&cfg, &NullOps, &write_request(1), 0).unwrap();
        assert_eq!(
            eng.pool().slot(slot).lock().cmd.dealloc(),
            Some(BufId::new(5))
        );

        // Deadline armed at issue; no progress ever reported.
        eng.poll(&cfg, &NullOps, &hooks, 200);
        assert_eq!(hooks.completions()[0].1, TokenResult::Timeout);

        // The buffer went back on the queue instead of leaking; the next
        // command carries it.
        let slot = eng.submit(&cfg, &NullOps, &write_request(2), 300).unwrap();
        assert_eq!(
            eng.pool().slot(slot).lock().cmd.dealloc(),
            Some(BufId::new(5))
        );
    }

    #[test]
    fn queued_read_recovers_buffers_before_failing() {
        let mut cfg = Config::default();
        cfg.ooo_policy = OooPolicy::Off;
        cfg.read_timeouts.queued = 100;
        cfg.rdbuf_recovery_attempts = 1;
        let eng = engine(&cfg);
        let hooks = RecordingHooks::new();
        let slot = eng.submit(&cfg, &NullOps, &read_request(1), 0).unwrap();

        // An inactive slot still holding a read buffer: an orphan.
        let orphan = eng.pool().allocate(TokenClass::HostRead).unwrap();
        eng.pool().slot(orphan).lock().bufs.read = Some(BufId::new(9));

        set_fresh(&eng, TokenClass::HostRead, slot, false, false, StatusCode::Queued as u8);
        eng.poll(&cfg, &NullOps, &hooks, 10);

        // First expiry recovers and extends instead of failing.
        assert_eq!(eng.poll(&cfg, &NullOps, &hooks, 200), 0);
        {
            let tok = eng.pool().slot(slot).lock();
            assert_eq!(tok.rdbuf_recovery, 1);
            assert_eq!(tok.deadline, 200 + cfg.read_timeouts.queued);
        }
        assert_eq!(eng.pool().slot(orphan).lock().bufs.read, None);

        // Second expiry: recovery budget spent, the timeout is real.
        assert_eq!(eng.poll(&cfg, &NullOps, &hooks, 400), 1);
        assert_eq!(hooks.completions()[0].1, TokenResult::Timeout);
    }
}
