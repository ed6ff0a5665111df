//! Out-of-order recovery.
//!
//! When the firmware reports completions out of issue order it names the
//! sequence number it is missing in the extended status. Sequence numbers
//! — not slot ids — are the ordering contract: they are assigned
//! monotonically at issue for device-directed commands and survive slot
//! reuse. Recovery therefore searches the active tokens for the missing
//! sequence and replays the match.
//!
//! A redundant write pair shares one sequence number, so when the first
//! match carries a buddy the search keeps going and replays the second
//! match as well.

use muon_proto::ExtStatus;

use crate::TimeUs;
use crate::config::{Config, OooPolicy};
use crate::engine::Engine;
use crate::hal::DeviceHal;
use crate::token::Token;
use crate::{mdebug, merr};

impl<H: DeviceHal> Engine<H> {
    /// Applies the configured replay policy to an out-of-order report
    /// observed on `tok`. `ext` carries the firmware's current and
    /// missing sequence numbers.
    pub(crate) fn handle_ooo(&self, cfg: &Config, tok: &mut Token, ext: ExtStatus, now: TimeUs) {
        #[allow(clippy::cast_possible_truncation, reason = "wire sequence numbers are 16-bit")]
        let missing = ext.ooo_missing() as u16;

        match cfg.ooo_policy {
            OooPolicy::Off => {
                mdebug!(
                    "slot {}: out of order (current {}, missing {}), policy off",
                    tok.slot,
                    ext.ooo_current(),
                    ext.ooo_missing()
                );
            }
            OooPolicy::Quick => {
                let quick = cfg.ooo_quick_us(tok.class);
                let targets = self.find_replay_targets(missing, tok.slot);
                if targets[0].is_none() {
                    mdebug!("slot {}: missing seq {} not in flight", tok.slot, missing);
                    return;
                }

                for target in targets.into_iter().flatten() {
                    let mut victim = self.pool.slot(target).lock();
                    if quick != 0 {
                        // Deferred replay: give the command one more
                        // status cycle on a short leash before declaring
                        // it lost.
                        victim.ooo_missing = true;
                        victim.arm_timeout(now, quick);
                    } else if self.reissue(&mut victim, now).is_err() {
                        merr!("slot {}: out-of-order replay failed", target);
                    }
                }
            }
            OooPolicy::Delayed => {
                tok.arm_timeout(now, cfg.stage_timeouts(tok.class).wait_device);
                tok.ooo_replay = true;
            }
        }
    }

    /// Finds the active device-directed token(s) carrying `missing`.
    ///
    /// Returns the first match in slot order, plus a second match when
    /// the first carries a redundancy buddy. `skip` is the slot whose
    /// lock the caller already holds.
    pub(crate) fn find_replay_targets(&self, missing: u16, skip: u8) -> [Option<u8>; 2] {
        let mut out = [None, None];
        let mut want_second = false;

        #[allow(clippy::cast_possible_truncation, reason = "pool count <= 64")]
        for slot in 0..self.pool.count() as u8 {
            if slot == skip {
                continue;
            }
            let tok = self.pool.slot(slot).lock();
            if !tok.active || !tok.is_device_directed() || tok.seq != missing {
                continue;
            }
            if out[0].is_none() {
                want_second = tok.buddy.is_some();
                out[0] = Some(slot);
                if !want_second {
                    break;
                }
            } else {
                out[1] = Some(slot);
                break;
            }
        }
        out
    }
}
