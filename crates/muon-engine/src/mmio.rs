//! Memory-mapped hardware variant.
//!
//! The module exposes its command slots, status arrays, extended status
//! words, and data buffers as one contiguous memory-mapped region. All
//! access is volatile; the mapping may be cacheable, in which case the
//! configured [`CacheFlushMode`] dictates explicit cache-line flushes
//! before status reads and after command/data writes. Nothing here
//! assumes a status read observes an earlier command write.
//!
//! Extended-status reads on some interconnects are only coherent from a
//! CPU affine to the mapped region; an embedder-provided [`AffineRunner`]
//! carries those reads across as a bounded blocking round trip.

use core::sync::atomic::{AtomicU8, Ordering, fence};

use muon_proto::{BufId, CmdWord, ExtStatus, StatusByte, cmd::CMD_BYTES};

use crate::config::{CacheFlushMode, Config};
use crate::hal::{CopyOps, DeviceHal, HalError, PageXfer};
use crate::pool::MAX_TOKENS;
use crate::sync::SpinLock;
use crate::token::{Token, TokenClass};

/// Control register: request command processing.
const CTRL_ENABLE: u64 = 1 << 0;
/// Control register: engine is online (hardware-owned).
const CTRL_READY: u64 = 1 << 1;

/// Doorbell: start the slot in the low bits.
const DB_GO: u64 = 1 << 63;
/// Doorbell: reset the slot in the low bits.
const DB_RESET: u64 = 1 << 62;

/// Maximum spin iterations when waiting for the ready semaphore.
const READY_SPIN_TIMEOUT: u32 = 1_000_000;

/// Cache line size for flush loops.
const CACHE_LINE: usize = 64;

/// Region offsets, all 8-byte aligned, fixed per hardware revision.
#[derive(Debug, Clone, Copy)]
pub struct MmioLayout {
    /// Control register (u64).
    pub control: usize,
    /// Doorbell register (u64).
    pub doorbell: usize,
    /// Command slots: [`CMD_BYTES`] bytes per slot.
    pub cmd_base: usize,
    /// Per-class status arrays: one byte per slot.
    pub status_base: [usize; 3],
    /// Extended status words: u64 per slot.
    pub ext_base: usize,
    /// Data buffers.
    pub buf_base: usize,
    /// Bytes per data buffer.
    pub buf_size: usize,
}

/// Runs a closure on the CPU affine to the mapped region, blocking until
/// it finishes or a bound elapses. A correctness requirement of the
/// interconnect, not an optimization.
pub trait AffineRunner: Send + Sync {
    /// Executes `f` on the designated worker.
    ///
    /// # Errors
    ///
    /// [`HalError::AffinityTimeout`] when the worker does not answer in
    /// bounded time.
    fn run(&self, f: &mut dyn FnMut()) -> Result<(), HalError>;
}

/// [`DeviceHal`] over a memory-mapped module.
pub struct MmioHal {
    base: usize,
    layout: MmioLayout,
    flush: AtomicU8,
    affinity: Option<&'static dyn AffineRunner>,
    /// Serializes doorbell writes; slots are independent but the
    /// doorbell register is shared.
    doorbell: SpinLock<()>,
}

// SAFETY: MmioHal holds only the region's base address and plain state.
// The raw pointers derived from it are used for volatile MMIO access,
// which is inherently shared-state safe; the doorbell lock serializes
// the one shared register.
unsafe impl Send for MmioHal {}
unsafe impl Sync for MmioHal {}

impl MmioHal {
    /// Builds a HAL over the mapped region at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a live mapping of the module's register
    /// region, valid for the whole layout and for the lifetime of the
    /// returned value.
    #[must_use]
    pub unsafe fn new(base: usize, layout: MmioLayout) -> Self {
        Self {
            base,
            layout,
            flush: AtomicU8::new(flush_to_u8(CacheFlushMode::Flush)),
            affinity: None,
            doorbell: SpinLock::new(()),
        }
    }

    /// Attaches an affine worker for extended-status reads.
    #[must_use]
    pub fn with_affinity(mut self, runner: &'static dyn AffineRunner) -> Self {
        self.affinity = Some(runner);
        self
    }

    fn flush_mode(&self) -> CacheFlushMode {
        flush_from_u8(self.flush.load(Ordering::Relaxed))
    }

    fn addr(&self, offset: usize) -> usize {
        self.base + offset
    }

    /// Flushes the cache lines covering `[addr, addr + len)` and fences.
    /// No-op when the mapping is uncached.
    fn flush_lines(&self, addr: usize, len: usize) {
        if self.flush_mode() == CacheFlushMode::None {
            return;
        }
        #[cfg(target_arch = "x86_64")]
        {
            let first = addr & !(CACHE_LINE - 1);
            let mut line = first;
            while line < addr + len {
                // SAFETY: The line lies within the mapped region the
                // constructor's caller vouched for.
                unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
                line += CACHE_LINE;
            }
            // SAFETY: _mm_mfence has no memory-safety preconditions.
            unsafe { core::arch::x86_64::_mm_mfence() };
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (addr, len);
            fence(Ordering::SeqCst);
        }
    }

    /// Orders a completed command/data write before the doorbell.
    fn publish_fence(&self) {
        match self.flush_mode() {
            CacheFlushMode::None => fence(Ordering::SeqCst),
            CacheFlushMode::Flush | CacheFlushMode::NonTemporal => {
                #[cfg(target_arch = "x86_64")]
                // SAFETY: _mm_sfence has no memory-safety preconditions.
                unsafe {
                    core::arch::x86_64::_mm_sfence();
                }
                #[cfg(not(target_arch = "x86_64"))]
                fence(Ordering::SeqCst);
            }
        }
    }

    fn read_u64(&self, offset: usize) -> u64 {
        // SAFETY: The offset lies within the mapped region.
        unsafe { core::ptr::read_volatile(self.addr(offset) as *const u64) }
    }

    fn write_u64(&self, offset: usize, value: u64) {
        // SAFETY: The offset lies within the mapped region.
        unsafe { core::ptr::write_volatile(self.addr(offset) as *mut u64, value) };
    }

    /// Rings the doorbell with `value` and flushes the posted write.
    fn ring(&self, value: u64) {
        let _guard = self.doorbell.lock();
        self.publish_fence();
        self.write_u64(self.layout.doorbell, value);
        // Read back to flush the posted write; the hardware consumes the
        // latch asynchronously.
        let _ = self.read_u64(self.layout.doorbell);
    }

    /// A data buffer as a mutable byte slice.
    fn buf_slice(&self, buf: BufId, len: usize) -> Result<&mut [u8], HalError> {
        if len > self.layout.buf_size {
            return Err(HalError::Io);
        }
        let addr = self.addr(self.layout.buf_base + usize::from(buf.as_u8()) * self.layout.buf_size);
        // SAFETY: The buffer lies within the mapped region; the engine
        // hands each buffer id to at most one token at a time.
        Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
    }
}

impl DeviceHal for MmioHal {
    fn init(&self, cfg: &Config) -> Result<(), HalError> {
        self.flush
            .store(flush_to_u8(cfg.cache_flush), Ordering::Relaxed);
        Ok(())
    }

    fn enable(&self) -> Result<(), HalError> {
        let ctrl = self.read_u64(self.layout.control);
        self.write_u64(self.layout.control, ctrl | CTRL_ENABLE);

        for _ in 0..READY_SPIN_TIMEOUT {
            self.flush_lines(self.addr(self.layout.control), 8);
            if self.read_u64(self.layout.control) & CTRL_READY != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(HalError::NotReady)
    }

    fn disable(&self) {
        let ctrl = self.read_u64(self.layout.control);
        self.write_u64(self.layout.control, ctrl & !CTRL_ENABLE);
    }

    fn read_status(&self, class: TokenClass, out: &mut [StatusByte; MAX_TOKENS]) {
        let base = self.layout.status_base[class.index()];
        self.flush_lines(self.addr(base), MAX_TOKENS);
        for (slot, status) in out.iter_mut().enumerate() {
            // SAFETY: The status array lies within the mapped region.
            let raw = unsafe { core::ptr::read_volatile(self.addr(base + slot) as *const u8) };
            *status = StatusByte::new(raw);
        }
    }

    fn read_ext_status(&self, slot: u8) -> ExtStatus {
        let offset = self.layout.ext_base + usize::from(slot) * 8;
        let mut raw = 0u64;
        let read = &mut || {
            self.flush_lines(self.addr(offset), 8);
            raw = self.read_u64(offset);
        };
        match self.affinity {
            Some(runner) => {
                if runner.run(read).is_err() {
                    // Bounded round trip failed; report an empty word
                    // rather than stall the poll loop.
                    return ExtStatus::new(0);
                }
            }
            None => read(),
        }
        ExtStatus::new(raw)
    }

    fn start_token(&self, slot: u8, cmd: &CmdWord) -> Result<(), HalError> {
        let mut words = *cmd.words();
        // Polarity fixup: the safety duplicates must agree with word 0
        // even if a retry path touched the protected words since
        // finalize.
        let polarity = words[0] >> 56 & 1;
        for w in &mut words[1..6] {
            *w = (*w & !(1 << 56)) | polarity << 56;
        }

        let base = self.layout.cmd_base + usize::from(slot) * CMD_BYTES;
        for (i, word) in words.iter().enumerate() {
            self.write_u64(base + i * 8, *word);
        }
        self.flush_lines(self.addr(base), CMD_BYTES);
        self.ring(DB_GO | u64::from(slot));
        Ok(())
    }

    fn reset_token(&self, slot: u8) {
        self.ring(DB_RESET | u64::from(slot));
    }

    fn write_page(&self, tok: &Token, ops: &dyn CopyOps) -> Result<PageXfer, HalError> {
        let req = tok.request.ok_or(HalError::Io)?;
        let buf = tok.bufs.write.ok_or(HalError::Io)?;
        let dst = self.buf_slice(buf, tok.h2d_len as usize)?;

        let bytes = ops.host_to_device(req, dst, 0).map_err(|_| HalError::Io)?;
        let xsum = muon_proto::fletcher128(dst).folded64();
        self.flush_lines(dst.as_ptr() as usize, dst.len());
        Ok(PageXfer { bytes, xsum })
    }

    fn read_page(&self, tok: &Token, ops: &dyn CopyOps) -> Result<PageXfer, HalError> {
        let req = tok.request.ok_or(HalError::Io)?;
        let buf = tok.bufs.read.ok_or(HalError::Io)?;
        let src = self.buf_slice(buf, tok.d2h_len as usize)?;

        self.flush_lines(src.as_ptr() as usize, src.len());
        let bytes = ops.device_to_host(req, src, 0).map_err(|_| HalError::Io)?;
        Ok(PageXfer { bytes, xsum: 0 })
    }

    fn mirror_pages(
        &self,
        primary: &Token,
        secondary: &Token,
        ops: &dyn CopyOps,
    ) -> Result<PageXfer, HalError> {
        let req = primary.request.ok_or(HalError::Io)?;
        let len = primary.h2d_len as usize;
        let a = self.buf_slice(primary.bufs.write.ok_or(HalError::Io)?, len)?;
        let b = self.buf_slice(secondary.bufs.write.ok_or(HalError::Io)?, len)?;

        let bytes = ops
            .host_to_device_mirrored(req, &mut [a, b], 0)
            .map_err(|_| HalError::Io)?;

        let a = self.buf_slice(primary.bufs.write.ok_or(HalError::Io)?, len)?;
        let xsum = muon_proto::fletcher128(a).folded64();
        self.flush_lines(a.as_ptr() as usize, a.len());
        let b = self.buf_slice(secondary.bufs.write.ok_or(HalError::Io)?, len)?;
        self.flush_lines(b.as_ptr() as usize, b.len());
        Ok(PageXfer { bytes, xsum })
    }

    fn raw_buffer(&self, buf: BufId, out: &mut [u8]) -> Result<(), HalError> {
        let src = self.buf_slice(buf, out.len())?;
        self.flush_lines(src.as_ptr() as usize, src.len());
        out.copy_from_slice(src);
        Ok(())
    }

    fn set_raw_buffer(&self, buf: BufId, data: &[u8]) -> Result<(), HalError> {
        let dst = self.buf_slice(buf, data.len())?;
        dst.copy_from_slice(data);
        self.flush_lines(dst.as_ptr() as usize, dst.len());
        Ok(())
    }
}

const fn flush_to_u8(mode: CacheFlushMode) -> u8 {
    match mode {
        CacheFlushMode::None => 0,
        CacheFlushMode::Flush => 1,
        CacheFlushMode::NonTemporal => 2,
    }
}

const fn flush_from_u8(raw: u8) -> CacheFlushMode {
    match raw {
        0 => CacheFlushMode::None,
        2 => CacheFlushMode::NonTemporal,
        _ => CacheFlushMode::Flush,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muon_proto::{Operation, cmd::encode};

    use crate::hal::{CopyError, CopyOps};
    use crate::token::RequestId;

    /// A fake module region on the heap: control, doorbell, 4 command
    /// slots, 3 status arrays, extended status, and 4 one-page buffers.
    struct FakeModule {
        region: Vec<u64>,
        layout: MmioLayout,
    }

    impl FakeModule {
        fn new() -> Self {
            let layout = MmioLayout {
                control: 0,
                doorbell: 8,
                cmd_base: 64,
                status_base: [320, 384, 448],
                ext_base: 512,
                buf_base: 1024,
                buf_size: 4096,
            };
            Self {
                region: vec![0u64; (1024 + 4 * 4096) / 8],
                layout,
            }
        }

        fn hal(&mut self) -> MmioHal {
            // SAFETY: The vector outlives the HAL within each test.
            unsafe { MmioHal::new(self.region.as_mut_ptr() as usize, self.layout) }
        }

        fn word(&self, offset: usize) -> u64 {
            self.region[offset / 8]
        }

        fn set_word(&mut self, offset: usize, value: u64) {
            self.region[offset / 8] = value;
        }
    }

    struct PatternOps;

    impl CopyOps for PatternOps {
        fn device_to_host(
            &self,
            _req: RequestId,
            src: &[u8],
            _offset: u32,
        ) -> Result<u32, CopyError> {
            Ok(src.len() as u32)
        }

        fn host_to_device(
            &self,
            _req: RequestId,
            dst: &mut [u8],
            _offset: u32,
        ) -> Result<u32, CopyError> {
            for (i, b) in dst.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            Ok(dst.len() as u32)
        }

        fn host_to_device_mirrored(
            &self,
            req: RequestId,
            dsts: &mut [&mut [u8]],
            offset: u32,
        ) -> Result<u32, CopyError> {
            let mut n = 0;
            for dst in dsts.iter_mut() {
                n = self.host_to_device(req, dst, offset)?;
            }
            Ok(n)
        }
    }

    #[test]
    fn enable_waits_for_ready() {
        let mut module = FakeModule::new();
        module.set_word(0, CTRL_READY);
        let hal = module.hal();
        hal.init(&Config::default()).unwrap();
        assert!(hal.enable().is_ok());
        // Enable bit set, ready bit preserved.
        assert_eq!(module.word(0), CTRL_ENABLE | CTRL_READY);
    }

    #[test]
    fn start_token_writes_command_and_rings_doorbell() {
        let mut module = FakeModule::new();
        module.set_word(0, CTRL_READY);
        let hal = module.hal();
        hal.init(&Config::default()).unwrap();

        let mut cmd = encode(&Operation::Trim { lba: 0x44, sectors: 4 }).unwrap();
        cmd.finalize(true, 2, 77, None, 0);
        hal.start_token(2, &cmd).unwrap();

        let base = module.layout.cmd_base + 2 * CMD_BYTES;
        for (i, &w) in cmd.words().iter().enumerate() {
            assert_eq!(module.word(base + i * 8), w, "word {i}");
        }
        assert_eq!(module.word(module.layout.doorbell), DB_GO | 2);
    }

    #[test]
    fn status_and_ext_reads() {
        let mut module = FakeModule::new();
        let read_base = module.layout.status_base[TokenClass::HostRead.index()];
        module.region[read_base / 8] = 0x0000_0000_0000_8003; // slot 0: 0x03, slot 1: 0x80
        module.set_word(module.layout.ext_base + 3 * 8, 0xABCD_0000_0000_00FA);
        let hal = module.hal();
        hal.init(&Config::default()).unwrap();

        let mut out = [StatusByte::new(0); MAX_TOKENS];
        hal.read_status(TokenClass::HostRead, &mut out);
        assert_eq!(out[0].raw(), 0x03);
        assert_eq!(out[1].raw(), 0x80);
        assert_eq!(out[2].raw(), 0x00);

        assert_eq!(hal.read_ext_status(3).raw(), 0xABCD_0000_0000_00FA);
    }

    #[test]
    fn write_page_stages_and_checksums() {
        let mut module = FakeModule::new();
        let hal = module.hal();
        hal.init(&Config::default()).unwrap();

        let mut tok = Token::idle(0);
        tok.request = Some(RequestId(1));
        tok.bufs.write = Some(BufId::new(1));
        tok.h2d_len = 4096;

        let xfer = hal.write_page(&tok, &PatternOps).unwrap();
        assert_eq!(xfer.bytes, 4096);

        // The staged bytes are in buffer 1 and the checksum matches them.
        let start = module.layout.buf_base + module.layout.buf_size;
        let staged: Vec<u8> = module.region[start / 8..(start + 4096) / 8]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        assert_eq!(staged[0], 0);
        assert_eq!(staged[1], 1);
        assert_eq!(xfer.xsum, muon_proto::fletcher128(&staged).folded64());
    }

    #[test]
    fn oversized_transfer_rejected() {
        let mut module = FakeModule::new();
        let hal = module.hal();
        let mut tok = Token::idle(0);
        tok.request = Some(RequestId(1));
        tok.bufs.write = Some(BufId::new(0));
        tok.h2d_len = 8192;
        assert_eq!(hal.write_page(&tok, &PatternOps), Err(HalError::Io));
    }
}
