// Trampoline installer
//
// The trampoline page is the first page of the text block. It gets
// tiled with aligned copies of a single syscall gate -- a short
// sequence that jumps into the dispatch thunk -- with the gap between
// the end of one gate and the next `OP_ALIGNMENT` boundary filled with
// the safe-halt pattern, so any mid-gate jump traps instead of running
// off into the next gate's bytes.
//
// The dispatch thunk itself lives outside the sandbox, in its own
// anonymous executable mapping; `DispatchThunk` owns that mapping and
// unmaps it on drop, matching the explicit make/free pair the loader
// historically called by hand.

use std::ffi::c_void;
use std::num::NonZeroUsize;

use log::debug;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::arch::{flush_icache_range, SAFE_HALT_PATTERN};
use crate::consts::OP_ALIGNMENT;
use crate::error::LoaderError;

const LOG_TARGET: &str = "trampoline";
const PAGE_SIZE: usize = 0x1000;

/// A single patch entry: the byte offset of a placeholder within the
/// copied template, and the value to write there.
#[derive(Debug, Clone, Copy)]
pub struct PatchEntry<W> {
    pub target_offset: usize,
    pub value: W,
}

/// Describes a template copy plus the absolute-address rewrites that
/// must follow it. Mirrors the three-width patch descriptor used to
/// rewrite the dispatch thunk's placeholders after it is copied to its
/// final load address.
#[derive(Debug, Default, Clone)]
pub struct PatchInfo {
    pub abs16: Vec<PatchEntry<u16>>,
    pub abs32: Vec<PatchEntry<u32>>,
    pub abs64: Vec<PatchEntry<u64>>,
}

impl PatchInfo {
    /// Copies `src` to `dst`, then applies every patch entry at
    /// `dst_base + target_offset`. Patches are applied after the copy;
    /// entries whose byte ranges overlap produce unspecified results,
    /// matching the original contract.
    ///
    /// # Safety
    /// `dst_base` must point at writable memory at least `src.len()`
    /// bytes long, and every `target_offset` must fall within that
    /// range for the entry's width.
    pub unsafe fn apply(&self, src: &[u8], dst_base: *mut u8) {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst_base, src.len());

        for entry in &self.abs16 {
            let ptr = dst_base.add(entry.target_offset) as *mut u16;
            std::ptr::write_unaligned(ptr, entry.value);
        }
        for entry in &self.abs32 {
            let ptr = dst_base.add(entry.target_offset) as *mut u32;
            std::ptr::write_unaligned(ptr, entry.value);
        }
        for entry in &self.abs64 {
            let ptr = dst_base.add(entry.target_offset) as *mut u64;
            std::ptr::write_unaligned(ptr, entry.value);
        }
    }
}

/// Tiles `page` (expected to be exactly one page) with copies of
/// `gate`, each starting at a multiple of `OP_ALIGNMENT`, padding the
/// remainder of each slot with the safe-halt pattern. Safe to invoke
/// while other threads are running: each slot is written gate-then-pad
/// and the whole range is cache-flushed before returning, so a
/// concurrent reader sees either the old page or the fully new one at
/// any `OP_ALIGNMENT` boundary it might jump to.
pub fn install_gate(page: &mut [u8], gate: &[u8]) -> Result<(), LoaderError> {
    if page.len() != PAGE_SIZE {
        return Err(LoaderError::Overlap(format!(
            "trampoline page is {} bytes, expected {PAGE_SIZE}",
            page.len()
        )));
    }
    if gate.len() > OP_ALIGNMENT {
        return Err(LoaderError::Overlap(format!(
            "syscall gate is {} bytes, exceeds OP_ALIGNMENT ({OP_ALIGNMENT})",
            gate.len()
        )));
    }

    let mut offset = 0;
    while offset + OP_ALIGNMENT <= page.len() {
        page[offset..offset + gate.len()].copy_from_slice(gate);
        fill_pad(&mut page[offset + gate.len()..offset + OP_ALIGNMENT]);
        offset += OP_ALIGNMENT;
    }

    debug!(
        target: LOG_TARGET,
        "tiled {} gate copies across the trampoline page",
        page.len() / OP_ALIGNMENT
    );

    // SAFETY: `page` is a valid, in-bounds slice the caller owns.
    unsafe { flush_icache_range(page.as_ptr() as usize, page.len()) };

    Ok(())
}

fn fill_pad(region: &mut [u8]) {
    for chunk in region.chunks_mut(SAFE_HALT_PATTERN.len()) {
        chunk.copy_from_slice(&SAFE_HALT_PATTERN[..chunk.len()]);
    }
}

/// The trusted, out-of-sandbox code fragment that the syscall gate
/// jumps into. Owns its executable mapping and unmaps it on drop.
pub struct DispatchThunk {
    addr: usize,
    len: usize,
}

impl DispatchThunk {
    /// Copies `template` into a freshly mapped executable region, then
    /// applies `patch` to rewrite the placeholder addresses baked into
    /// the template to this mapping's real load address and the trap
    /// handler's address.
    pub fn install(template: &[u8], patch: &PatchInfo) -> Result<Self, LoaderError> {
        let len = template.len().max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;

        // SAFETY: anonymous private mapping, no aliasing.
        let base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).expect("len rounded up to at least one page"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
            .map_err(|e| LoaderError::Oom(format!("dispatch thunk mmap failed: {e}")))?
        };
        let addr = base.as_ptr() as usize;

        // SAFETY: `addr` is writable for `len` bytes and `template` is
        // no larger than `len`.
        unsafe { patch.apply(template, addr as *mut u8) };

        // SAFETY: the mapping was created with PROT_READ | PROT_WRITE
        // above; making it executable here (and dropping write) is the
        // two-phase write-then-protect pattern used throughout.
        unsafe {
            nix::sys::mman::mprotect(base, len, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)
                .map_err(|e| LoaderError::Oom(format!("dispatch thunk mprotect failed: {e}")))?;
            flush_icache_range(addr, len);
        }

        debug!(target: LOG_TARGET, "installed dispatch thunk at 0x{addr:x} ({len} bytes)");

        Ok(DispatchThunk { addr, len })
    }

    pub fn address(&self) -> usize {
        self.addr
    }
}

impl Drop for DispatchThunk {
    fn drop(&mut self) {
        // SAFETY: `self.addr`/`self.len` describe exactly the mapping
        // `install` created, never shared or re-mapped elsewhere.
        unsafe {
            let ptr = std::ptr::NonNull::new(self.addr as *mut c_void)
                .expect("dispatch thunk address is never null");
            if let Err(e) = munmap(ptr, self.len) {
                log::warn!(target: LOG_TARGET, "failed to unmap dispatch thunk: {e}");
            }
        }
    }
}
