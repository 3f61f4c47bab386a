// Address-space builder
//
// Reserves one contiguous, power-of-two-sized virtual region with a
// single anonymous `PROT_NONE` mapping, then carves it into the eight
// fixed memory blocks. Protection happens in two passes: `build` grants
// every block that will hold data `PROT_READ | PROT_WRITE` so the ELF
// loader and trampoline installer can populate it, and
// `finalize_protections` locks each block down to its real final state
// once loading is done. Nothing is executable until that second pass,
// so a bug in block placement can never leave a transient
// writable-and-executable window.

use std::ffi::c_void;

use log::{debug, info};
use nix::sys::mman::{mmap_anonymous, mprotect, MapFlags, ProtFlags};

use crate::consts::ALLOC_QUANTUM;
use crate::error::LoaderError;

const LOG_TARGET: &str = "addrspace";

/// The eight ordered blocks every sandbox region is divided into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemBlock {
    LeftBumper,
    Text,
    Rodata,
    Heap,
    Hole,
    SysData,
    Stack,
    RightBumper,
}

impl MemBlock {
    pub const ORDER: [MemBlock; 8] = [
        MemBlock::LeftBumper,
        MemBlock::Text,
        MemBlock::Rodata,
        MemBlock::Heap,
        MemBlock::Hole,
        MemBlock::SysData,
        MemBlock::Stack,
        MemBlock::RightBumper,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MemBlock::LeftBumper => "left_bumper",
            MemBlock::Text => "text",
            MemBlock::Rodata => "rodata",
            MemBlock::Heap => "heap",
            MemBlock::Hole => "hole",
            MemBlock::SysData => "sysdata",
            MemBlock::Stack => "stack",
            MemBlock::RightBumper => "right_bumper",
        }
    }

    fn default_protection(self) -> Protection {
        match self {
            MemBlock::LeftBumper | MemBlock::Hole | MemBlock::RightBumper => Protection::None,
            MemBlock::Text => Protection::ReadExec,
            MemBlock::Rodata => Protection::Read,
            MemBlock::Heap | MemBlock::SysData | MemBlock::Stack => Protection::ReadWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadExec,
    ReadWrite,
}

impl Protection {
    fn to_prot_flags(self) -> ProtFlags {
        match self {
            Protection::None => ProtFlags::PROT_NONE,
            Protection::Read => ProtFlags::PROT_READ,
            Protection::ReadExec => ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemBlockInfo {
    pub block: MemBlock,
    pub start: usize,
    pub size: usize,
    pub protection: Protection,
}

impl MemBlockInfo {
    pub fn end(&self) -> usize {
        self.start + self.size
    }
}

/// A reserved sandbox region plus the final layout of its eight blocks.
pub struct AddressSpace {
    mem_start: usize,
    region_size: usize,
    blocks: Vec<MemBlockInfo>,
}

impl AddressSpace {
    /// Reserves `2^addr_bits` bytes of address space with no access,
    /// then lays out the seven concrete blocks -- `fixed_sizes`, in
    /// `MemBlock::ORDER` with the `Hole` entry omitted -- back to back
    /// starting at `mem_start`. `Hole` is not given a size by the
    /// caller: it is computed as whatever remains of the region after
    /// the other seven blocks, so the eight blocks always tile the
    /// sandbox exactly with no gap left uncovered by any block (spec
    /// invariant: "their union plus the bumpers covers the whole
    /// region exactly").
    pub fn build(addr_bits: u8, fixed_sizes: [usize; 7]) -> Result<Self, LoaderError> {
        const FIXED_BLOCKS: [MemBlock; 7] = [
            MemBlock::LeftBumper,
            MemBlock::Text,
            MemBlock::Rodata,
            MemBlock::Heap,
            MemBlock::SysData,
            MemBlock::Stack,
            MemBlock::RightBumper,
        ];

        for (block, size) in FIXED_BLOCKS.iter().zip(fixed_sizes.iter()) {
            if size % ALLOC_QUANTUM != 0 {
                return Err(LoaderError::Overlap(format!(
                    "{} size {size} is not a multiple of the allocation quantum",
                    block.name()
                )));
            }
        }

        let region_size = 1usize
            .checked_shl(addr_bits as u32)
            .ok_or_else(|| LoaderError::Oom("addr_bits overflow".into()))?;
        let fixed_total: usize = fixed_sizes.iter().sum();
        if fixed_total > region_size {
            return Err(LoaderError::Overlap(format!(
                "block layout ({fixed_total} bytes) exceeds the {region_size} byte sandbox"
            )));
        }
        let hole_size = region_size - fixed_total;

        let mut sizes = [0usize; 8];
        sizes[0] = fixed_sizes[0]; // left bumper
        sizes[1] = fixed_sizes[1]; // text
        sizes[2] = fixed_sizes[2]; // rodata
        sizes[3] = fixed_sizes[3]; // heap
        sizes[4] = hole_size; // hole: the remainder
        sizes[5] = fixed_sizes[4]; // sysdata
        sizes[6] = fixed_sizes[5]; // stack
        sizes[7] = fixed_sizes[6]; // right bumper

        // SAFETY: anonymous, fixed-size, PROT_NONE reservation; no file
        // backing and no aliasing with any existing mapping.
        let base = unsafe {
            mmap_anonymous(
                None,
                std::num::NonZeroUsize::new(region_size)
                    .ok_or_else(|| LoaderError::Oom("zero-size sandbox region".into()))?,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE,
            )
            .map_err(|e| LoaderError::Oom(format!("mmap reservation failed: {e}")))?
        };
        let mem_start = base.as_ptr() as usize;
        info!(target: LOG_TARGET, "reserved {region_size} byte sandbox at 0x{mem_start:x}");

        let mut blocks = Vec::with_capacity(8);
        let mut cursor = mem_start;
        for (block, size) in MemBlock::ORDER.iter().zip(sizes.iter()) {
            blocks.push(MemBlockInfo {
                block: *block,
                start: cursor,
                size: *size,
                protection: block.default_protection(),
            });
            cursor += size;
        }

        // Every block that will ever hold data (everything but the
        // bumpers and the hole) needs to be writable for the ELF loader
        // and trampoline installer to populate it; `finalize_protections`
        // locks each block down to its real final protection afterward.
        // Until then the whole region stays exactly as reserved above
        // (`PROT_NONE`) for any block with no data to load into it.
        for info in &blocks {
            if info.size == 0 || info.protection == Protection::None {
                continue;
            }
            // SAFETY: `info.start`/`info.size` lie within the single
            // reservation made above.
            unsafe {
                mprotect(
                    std::ptr::NonNull::new(info.start as *mut c_void).expect("block start is never null"),
                    info.size,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                )
                .map_err(|e| LoaderError::Oom(format!("mprotect failed: {e}")))?;
            }
        }

        Ok(AddressSpace {
            mem_start,
            region_size,
            blocks,
        })
    }

    pub fn mem_start(&self) -> usize {
        self.mem_start
    }

    pub fn blocks(&self) -> &[MemBlockInfo] {
        &self.blocks
    }

    pub fn block(&self, which: MemBlock) -> &MemBlockInfo {
        self.blocks
            .iter()
            .find(|b| b.block == which)
            .expect("all eight blocks are always present")
    }

    /// Applies every block's final protection via `mprotect`. Must be
    /// called exactly once, after the ELF loader and trampoline
    /// installer have finished writing into the region.
    pub fn finalize_protections(&self) -> Result<(), LoaderError> {
        for info in &self.blocks {
            if info.size == 0 {
                continue;
            }
            debug!(
                target: LOG_TARGET,
                "mprotect {} [0x{:x}, 0x{:x}) -> {:?}",
                info.block.name(),
                info.start,
                info.end(),
                info.protection
            );
            // SAFETY: `info.start`/`info.size` always lie within the
            // single reservation made by `build`.
            unsafe {
                mprotect(
                    std::ptr::NonNull::new(info.start as *mut c_void)
                        .expect("block start is never null"),
                    info.size,
                    info.protection.to_prot_flags(),
                )
                .map_err(|e| LoaderError::Oom(format!("mprotect failed: {e}")))?;
            }
        }
        Ok(())
    }

    /// `mem_start + u`, or the bad-address sentinel if `u` falls
    /// outside the reserved region.
    pub fn user_to_host(&self, u: usize) -> usize {
        if u < self.region_size {
            self.mem_start + u
        } else {
            crate::consts::BAD_ADDRESS
        }
    }

    /// `h - mem_start`, or the bad-address sentinel if `h` falls
    /// outside the reserved region.
    pub fn host_to_user(&self, h: usize) -> usize {
        if h >= self.mem_start && h < self.mem_start + self.region_size {
            h - self.mem_start
        } else {
            crate::consts::BAD_ADDRESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::BAD_ADDRESS;

    /// [left bumper, text, rodata, heap, sysdata, stack, right bumper] --
    /// `Hole` is never passed in; `build` computes it as the remainder.
    fn test_sizes() -> [usize; 7] {
        let q = ALLOC_QUANTUM;
        [q, q * 4, q, q * 4, q, q * 2, q]
    }

    #[test]
    fn blocks_are_strictly_ordered_and_contiguous() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        let blocks = space.blocks();
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start);
        }
        assert_eq!(blocks.first().unwrap().start, space.mem_start());
    }

    #[test]
    fn blocks_exactly_tile_the_region() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        let blocks = space.blocks();
        let total: usize = blocks.iter().map(|b| b.size).sum();
        assert_eq!(total, 1usize << 24);
        assert_eq!(blocks.last().unwrap().end(), space.mem_start() + (1usize << 24));
    }

    #[test]
    fn hole_absorbs_the_remainder() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        let fixed_total: usize = test_sizes().iter().sum();
        assert_eq!(
            space.block(MemBlock::Hole).size,
            (1usize << 24) - fixed_total
        );
    }

    #[test]
    fn sizes_must_be_quantum_aligned() {
        let mut sizes = test_sizes();
        sizes[1] += 1;
        assert!(AddressSpace::build(24, sizes).is_err());
    }

    #[test]
    fn layout_must_fit_the_region() {
        let sizes = [usize::MAX / 4; 7];
        assert!(AddressSpace::build(8, sizes).is_err());
    }

    #[test]
    fn user_to_host_round_trips_inside_region() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        let h = space.user_to_host(0x1000);
        assert_ne!(h, BAD_ADDRESS);
        assert_eq!(space.host_to_user(h), 0x1000);
    }

    #[test]
    fn user_to_host_rejects_out_of_range() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        assert_eq!(space.user_to_host(1 << 24), BAD_ADDRESS);
    }

    #[test]
    fn host_to_user_rejects_addresses_outside_region() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        assert_eq!(space.host_to_user(0), BAD_ADDRESS);
    }

    #[test]
    fn bumpers_and_hole_default_to_no_access() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        assert_eq!(space.block(MemBlock::LeftBumper).protection, Protection::None);
        assert_eq!(space.block(MemBlock::RightBumper).protection, Protection::None);
        assert_eq!(space.block(MemBlock::Hole).protection, Protection::None);
    }

    #[test]
    fn text_is_read_exec_rodata_is_read_only() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        assert_eq!(space.block(MemBlock::Text).protection, Protection::ReadExec);
        assert_eq!(space.block(MemBlock::Rodata).protection, Protection::Read);
    }

    #[test]
    fn data_blocks_are_writable_before_finalize_protections() {
        // The loader writes segment bytes into Text/Rodata/Heap between
        // `build` and `finalize_protections`; that window must already be
        // writable, not still the PROT_NONE the region was reserved with.
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        for which in [MemBlock::Text, MemBlock::Rodata, MemBlock::Heap, MemBlock::SysData, MemBlock::Stack] {
            let block = space.block(which);
            unsafe {
                let ptr = block.start as *mut u8;
                *ptr = 0x42;
                assert_eq!(*ptr, 0x42);
            }
        }
    }

    #[test]
    fn heap_and_stack_are_read_write_never_exec() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        assert_eq!(space.block(MemBlock::Heap).protection, Protection::ReadWrite);
        assert_eq!(space.block(MemBlock::Stack).protection, Protection::ReadWrite);
    }
}
