//! Test doubles: a scriptable mock HAL, pass-through copy ops, and
//! recording hooks. The decode, timeout, and replay machinery is tested
//! against these without hardware.

use muon_proto::{BufId, CmdWord, ExtStatus, Operation, StatusByte};

use crate::config::Config;
use crate::engine::{Engine, HostRequest};
use crate::hal::{CopyError, CopyOps, DeviceHal, EngineHooks, HalError, PageXfer};
use crate::pool::MAX_TOKENS;
use crate::sync::SpinLock;
use crate::token::{Buffers, RequestId, Token, TokenClass, TokenResult};

/// Scriptable hardware double. Tests poke status/extended-status values
/// and observe every command start.
pub(crate) struct MockHal {
    status: SpinLock<[[StatusByte; MAX_TOKENS]; 3]>,
    ext: SpinLock<[ExtStatus; MAX_TOKENS]>,
    starts: SpinLock<Vec<(u8, CmdWord)>>,
}

impl MockHal {
    pub(crate) fn new() -> Self {
        Self {
            status: SpinLock::new([[StatusByte::new(0); MAX_TOKENS]; 3]),
            ext: SpinLock::new([ExtStatus::new(0); MAX_TOKENS]),
            starts: SpinLock::new(Vec::new()),
        }
    }

    pub(crate) fn set_status(&self, class: TokenClass, slot: u8, status: StatusByte) {
        self.status.lock()[class.index()][slot as usize] = status;
    }

    pub(crate) fn set_ext(&self, slot: u8, ext: ExtStatus) {
        self.ext.lock()[slot as usize] = ext;
    }

    /// Every `(slot, command)` started so far, in order.
    pub(crate) fn starts(&self) -> Vec<(u8, CmdWord)> {
        self.starts.lock().clone()
    }
}

impl DeviceHal for MockHal {
    fn init(&self, _cfg: &Config) -> Result<(), HalError> {
        Ok(())
    }

    fn enable(&self) -> Result<(), HalError> {
        Ok(())
    }

    fn disable(&self) {}

    fn read_status(&self, class: TokenClass, out: &mut [StatusByte; MAX_TOKENS]) {
        *out = self.status.lock()[class.index()];
    }

    fn read_ext_status(&self, slot: u8) -> ExtStatus {
        self.ext.lock()[slot as usize]
    }

    fn start_token(&self, slot: u8, cmd: &CmdWord) -> Result<(), HalError> {
        self.starts.lock().push((slot, *cmd));
        Ok(())
    }

    fn reset_token(&self, _slot: u8) {}

    fn write_page(&self, tok: &Token, _ops: &dyn CopyOps) -> Result<PageXfer, HalError> {
        Ok(PageXfer {
            bytes: tok.h2d_len,
            xsum: 0x5EED,
        })
    }

    fn read_page(&self, tok: &Token, _ops: &dyn CopyOps) -> Result<PageXfer, HalError> {
        Ok(PageXfer {
            bytes: tok.d2h_len,
            xsum: 0,
        })
    }

    fn raw_buffer(&self, _buf: BufId, _out: &mut [u8]) -> Result<(), HalError> {
        Ok(())
    }

    fn set_raw_buffer(&self, _buf: BufId, _data: &[u8]) -> Result<(), HalError> {
        Ok(())
    }
}

/// Copy ops that report full-length transfers without touching memory.
pub(crate) struct NullOps;

impl CopyOps for NullOps {
    fn device_to_host(&self, _req: RequestId, src: &[u8], _offset: u32) -> Result<u32, CopyError> {
        Ok(src.len() as u32)
    }

    fn host_to_device(
        &self,
        _req: RequestId,
        dst: &mut [u8],
        _offset: u32,
    ) -> Result<u32, CopyError> {
        Ok(dst.len() as u32)
    }

    fn host_to_device_mirrored(
        &self,
        _req: RequestId,
        dsts: &mut [&mut [u8]],
        _offset: u32,
    ) -> Result<u32, CopyError> {
        Ok(dsts.first().map_or(0, |d| d.len() as u32))
    }
}

/// Hooks that record every callback.
pub(crate) struct RecordingHooks {
    completions: SpinLock<Vec<(RequestId, TokenResult, Option<BufId>)>>,
    commits: SpinLock<Vec<RequestId>>,
    changes: SpinLock<Vec<(u8, StatusByte)>>,
}

impl RecordingHooks {
    pub(crate) fn new() -> Self {
        Self {
            completions: SpinLock::new(Vec::new()),
            commits: SpinLock::new(Vec::new()),
            changes: SpinLock::new(Vec::new()),
        }
    }

    pub(crate) fn completions(&self) -> Vec<(RequestId, TokenResult, Option<BufId>)> {
        self.completions.lock().clone()
    }

    pub(crate) fn commits(&self) -> Vec<RequestId> {
        self.commits.lock().clone()
    }

    pub(crate) fn changes(&self) -> Vec<(u8, StatusByte)> {
        self.changes.lock().clone()
    }
}

impl Default for RecordingHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineHooks for RecordingHooks {
    fn status_changed(&self, slot: u8, status: StatusByte) {
        self.changes.lock().push((slot, status));
    }

    fn early_commit(&self, req: RequestId) {
        self.commits.lock().push(req);
    }

    fn complete(&self, req: RequestId, result: TokenResult, rdbuf: Option<BufId>) {
        self.completions.lock().push((req, result, rdbuf));
    }
}

/// A fresh engine over a mock HAL.
pub(crate) fn engine(cfg: &Config) -> Engine<MockHal> {
    Engine::new(MockHal::new(), cfg).expect("mock hal init")
}

/// A full-page write request with a staged write buffer.
pub(crate) fn write_request(id: u64) -> HostRequest {
    let mut bufs = Buffers::none();
    bufs.write = Some(BufId::new(11));
    HostRequest {
        id: RequestId(id),
        op: Operation::Write {
            lba: 0x100,
            len: 4096,
            wbuf: BufId::new(11),
        },
        h2d_len: 4096,
        d2h_len: 0,
        bufs,
        quiet: false,
    }
}

/// A full-page read request.
pub(crate) fn read_request(id: u64) -> HostRequest {
    HostRequest {
        id: RequestId(id),
        op: Operation::Read { lba: 0x40, len: 4096 },
        h2d_len: 0,
        d2h_len: 4096,
        bufs: Buffers::none(),
        quiet: false,
    }
}

/// Builds a status byte whose polarity matches the token's expectation.
pub(crate) fn fresh_status(
    eng: &Engine<MockHal>,
    slot: u8,
    success: bool,
    extend: bool,
    code: u8,
) -> StatusByte {
    let odd = eng.pool().slot(slot).lock().polarity;
    StatusByte::from_parts(success, odd, extend, code)
}

/// Scripts a fresh (polarity-matching) status for a slot.
pub(crate) fn set_fresh(
    eng: &Engine<MockHal>,
    class: TokenClass,
    slot: u8,
    success: bool,
    extend: bool,
    code: u8,
) {
    let status = fresh_status(eng, slot, success, extend, code);
    eng.hal().set_status(class, slot, status);
}
