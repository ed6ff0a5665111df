//! Fixed token pool.
//!
//! A fixed arena of command slots indexed by slot id. Each slot's token
//! sits behind its own lock so distinct slots never contend; the free
//! list is a noalloc FIFO behind a separate lock. A configured number of
//! the highest slots is withheld from the general pool for maintenance
//! use (firmware status requests, probing) and can only be claimed by id.

use planck_noalloc::ringbuf::RingBuf;

use crate::sync::SpinLock;
use crate::token::{SlotRetries, Token, TokenClass};

/// Size of the hardware slot array. The configured pool may use fewer.
pub const MAX_TOKENS: usize = 64;

/// Free-list backing size (`RingBuf` usable capacity is `SIZE - 1`).
const FREE_LIST_SIZE: usize = MAX_TOKENS + 1;

/// Token pool allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// No free token; the caller must queue and apply backpressure.
    Exhausted,
    /// The requested slot is already claimed.
    InUse,
    /// The requested slot is outside the configured pool.
    BadId,
}

impl core::fmt::Display for PoolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Exhausted => f.write_str("token pool exhausted"),
            Self::InUse => f.write_str("slot already claimed"),
            Self::BadId => f.write_str("slot outside pool"),
        }
    }
}

/// The fixed arena of tokens plus per-slot retry accounting.
pub struct TokenPool {
    slots: [SpinLock<Token>; MAX_TOKENS],
    retries: [SpinLock<SlotRetries>; MAX_TOKENS],
    free: SpinLock<RingBuf<u8, FREE_LIST_SIZE>>,
    count: usize,
    reserved: usize,
}

impl TokenPool {
    /// Creates a pool of `count` slots with the `reserved` highest slots
    /// withheld from the general free list.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds [`MAX_TOKENS`] or `reserved` exceeds
    /// `count`; both are configuration errors.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, reason = "slot ids fit in u8")]
    pub fn new(count: usize, reserved: usize) -> Self {
        assert!(count <= MAX_TOKENS, "pool larger than slot array");
        assert!(reserved <= count, "more reserved slots than slots");

        let mut free = RingBuf::new();
        for slot in 0..(count - reserved) as u8 {
            free.push(slot);
        }

        Self {
            slots: core::array::from_fn(|i| SpinLock::new(Token::idle(i as u8))),
            retries: core::array::from_fn(|_| SpinLock::new(SlotRetries::new())),
            free: SpinLock::new(free),
            count,
            reserved,
        }
    }

    /// Number of configured slots.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// First slot id withheld from the general pool.
    #[must_use]
    pub const fn general_limit(&self) -> usize {
        self.count - self.reserved
    }

    /// The lock guarding one slot's token.
    #[must_use]
    pub fn slot(&self, slot: u8) -> &SpinLock<Token> {
        &self.slots[slot as usize]
    }

    /// The lock guarding one slot's retry counters.
    #[must_use]
    pub fn retries(&self, slot: u8) -> &SpinLock<SlotRetries> {
        &self.retries[slot as usize]
    }

    /// Claims a free token from the general pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] when every general slot is claimed; the
    /// caller queues the request and retries after a completion.
    pub fn allocate(&self, class: TokenClass) -> Result<u8, PoolError> {
        let slot = self.free.lock().pop().ok_or(PoolError::Exhausted)?;
        let mut tok = self.slots[slot as usize].lock();
        tok.claimed = true;
        tok.class = class;
        Ok(slot)
    }

    /// Claims a specific slot. Initialization and reservation use only;
    /// the general I/O path goes through [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// [`PoolError::BadId`] outside the configured pool,
    /// [`PoolError::InUse`] if the slot is already claimed.
    pub fn allocate_by_id(&self, slot: u8, class: TokenClass) -> Result<(), PoolError> {
        if slot as usize >= self.count {
            return Err(PoolError::BadId);
        }

        let mut tok = self.slots[slot as usize].lock();
        if tok.claimed {
            return Err(PoolError::InUse);
        }

        // General slots must also leave the free list.
        if (slot as usize) < self.general_limit() && !self.unlink_free(slot) {
            return Err(PoolError::InUse);
        }

        tok.claimed = true;
        tok.class = class;
        Ok(())
    }

    /// Returns a token to the pool, clearing its transient state.
    ///
    /// Must not be called while the token's buffers are still attached to
    /// an in-flight host request; the engine releases only after the
    /// request layer has been told the outcome.
    pub fn release(&self, slot: u8) {
        let mut tok = self.slots[slot as usize].lock();
        tok.reset_for_release();
        drop(tok);

        if (slot as usize) < self.general_limit() {
            self.free.lock().push(slot);
        }
    }

    /// Removes `slot` from the free list. Returns whether it was present.
    fn unlink_free(&self, slot: u8) -> bool {
        let mut free = self.free.lock();
        let n = free.len();
        let mut found = false;
        for _ in 0..n {
            match free.pop() {
                Some(s) if s == slot && !found => found = true,
                Some(s) => free.push(s),
                None => break,
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_release() {
        let pool = TokenPool::new(4, 0);
        let mut got = [0u8; 4];
        for g in &mut got {
            *g = pool.allocate(TokenClass::Control).unwrap();
        }
        assert_eq!(pool.allocate(TokenClass::Control), Err(PoolError::Exhausted));

        pool.release(got[2]);
        assert_eq!(pool.allocate(TokenClass::Control), Ok(got[2]));
    }

    #[test]
    fn reserved_slots_not_in_general_pool() {
        let pool = TokenPool::new(8, 2);
        for _ in 0..6 {
            let slot = pool.allocate(TokenClass::HostRead).unwrap();
            assert!((slot as usize) < pool.general_limit());
        }
        assert_eq!(pool.allocate(TokenClass::HostRead), Err(PoolError::Exhausted));

        // The reserved slots remain reachable by id.
        pool.allocate_by_id(6, TokenClass::Control).unwrap();
        pool.allocate_by_id(7, TokenClass::Control).unwrap();
        assert_eq!(
            pool.allocate_by_id(7, TokenClass::Control),
            Err(PoolError::InUse)
        );
    }

    #[test]
    fn allocate_by_id_unlinks_general_slot() {
        let pool = TokenPool::new(4, 0);
        pool.allocate_by_id(1, TokenClass::Control).unwrap();
        // Slot 1 must never come back from the general allocator.
        for _ in 0..3 {
            assert_ne!(pool.allocate(TokenClass::Control).unwrap(), 1);
        }
        assert_eq!(pool.allocate(TokenClass::Control), Err(PoolError::Exhausted));
    }

    #[test]
    fn bad_id_rejected() {
        let pool = TokenPool::new(4, 0);
        assert_eq!(
            pool.allocate_by_id(4, TokenClass::Control),
            Err(PoolError::BadId)
        );
    }

    #[test]
    fn release_clears_claim() {
        let pool = TokenPool::new(2, 1);
        pool.allocate_by_id(1, TokenClass::Control).unwrap();
        pool.release(1);
        pool.allocate_by_id(1, TokenClass::Control).unwrap();
    }
}
