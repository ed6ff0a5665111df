//! Token dispatch and status state machine for the Muon persistent-memory
//! block module.
//!
//! The module exposes a fixed array of command slots ("tokens") over a
//! memory-mapped command/status protocol. This crate owns the hard part of
//! the driver: allocating tokens, encoding and issuing commands through
//! the wire layer ([`muon_proto`]), polling and decoding status updates
//! (including extended status), detecting stale updates by slot polarity,
//! and driving retries, timeouts, and out-of-order replay until every
//! token reaches a terminal result.
//!
//! The embedder supplies:
//!
//! - a [`DeviceHal`](hal::DeviceHal) implementation for the hardware
//!   variant (one memory-mapped variant ships in [`mmio`]),
//! - a [`CopyOps`](hal::CopyOps) implementation that moves data between
//!   device buffers and host requests (scatter-gather iteration stays on
//!   that side of the boundary),
//! - an [`EngineHooks`](hal::EngineHooks) implementation that receives
//!   completions and early-commit notifications,
//! - a [`Config`](config::Config), passed by reference into every
//!   operation. The engine keeps no global state.
//!
//! One logical poll loop per device drives [`Engine::poll`](engine::Engine::poll);
//! the submission path may run concurrently from another context. Slot
//! state is locked per slot; distinct slots never contend.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod hal;
pub mod log;
pub mod mmio;
pub mod pool;
pub mod sync;
pub mod token;

mod decode;
mod ooo;
mod timeout;

#[cfg(test)]
mod testutil;

pub use config::{CacheFlushMode, CommitLevel, Config, OooPolicy, StageTimeouts};
pub use engine::{Engine, HostRequest, SubmitError};
pub use hal::{CopyError, CopyOps, DeviceHal, EngineHooks, HalError, PageXfer, RunState};
pub use log::LogLevel;
pub use pool::{MAX_TOKENS, PoolError, TokenPool};
pub use token::{Buffers, RequestId, SlotRetries, Token, TokenClass, TokenResult};

/// A monotonic timestamp in microseconds. The embedder's clock; the
/// engine only compares and adds.
pub type TimeUs = u64;
