// ELF-subset loader
//
// Accepts a narrow profile of ELF64: statically linked, position
// dependent, a single target machine, a text segment fixed at
// `STATIC_TEXT_START`, an optional rodata segment, an optional
// read/write data segment, no dynamic-linking sections. Anything
// outside that profile is rejected rather than worked around -- this
// loader has no interpreter, no relocation processor, and no notion of
// shared objects.

use std::convert::TryInto;

use log::{debug, info};

use crate::addrspace::{AddressSpace, MemBlock};
use crate::consts::{LARGEST_NEXE, STATIC_TEXT_START};
use crate::error::LoaderError;

const EI_NIDENT: usize = 16;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const PAGE_SIZE: usize = 0x1000;
const MAX_PROGRAM_HEADERS: usize = 32;

/// State the ELF loader fills in on a successful load, mirroring the
/// fields the session launcher and validator adapter need afterward.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadedImage {
    pub static_text_end: usize,
    pub dynamic_text_start: usize,
    pub dynamic_text_end: usize,
    pub rodata_start: usize,
    pub data_start: usize,
    pub data_end: usize,
    pub initial_entry_pt: usize,
    pub break_addr: usize,
    pub bundle_size: usize,
}

#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// Parses and validates the ELF64 header, returning the entry point and
/// the raw program header table.
fn parse_headers(image: &[u8]) -> Result<(u64, Vec<ProgramHeader>), LoaderError> {
    if image.len() < EI_NIDENT + 48 {
        return Err(LoaderError::BadElf("image too small for an ELF header".into()));
    }
    if &image[0..4] != b"\x7fELF" {
        return Err(LoaderError::BadElf("missing ELF magic".into()));
    }
    if image[4] != ELFCLASS64 {
        return Err(LoaderError::BadElf("not a 64-bit ELF class".into()));
    }
    if image[5] != ELFDATA2LSB {
        return Err(LoaderError::BadElf("not little-endian".into()));
    }
    if image[6] != EV_CURRENT {
        return Err(LoaderError::BadElf("unsupported ELF identification version".into()));
    }

    let e_type = u16::from_le_bytes(image[16..18].try_into().unwrap());
    let e_machine = u16::from_le_bytes(image[18..20].try_into().unwrap());
    let e_version = u32::from_le_bytes(image[20..24].try_into().unwrap());
    let e_entry = u64::from_le_bytes(image[24..32].try_into().unwrap());
    let e_phoff = u64::from_le_bytes(image[32..40].try_into().unwrap());
    let e_phentsize = u16::from_le_bytes(image[54..56].try_into().unwrap());
    let e_phnum = u16::from_le_bytes(image[56..58].try_into().unwrap());

    if e_type != ET_EXEC {
        return Err(LoaderError::BadElf(format!("e_type {e_type} is not ET_EXEC")));
    }
    if e_machine != EM_X86_64 {
        return Err(LoaderError::BadElf(format!(
            "e_machine {e_machine} is not the accepted target machine"
        )));
    }
    if e_version != EV_CURRENT as u32 {
        return Err(LoaderError::BadElf("unsupported e_version".into()));
    }
    if e_phnum == 0 {
        return Err(LoaderError::BadElf("program header table is missing".into()));
    }
    if e_phnum as usize > MAX_PROGRAM_HEADERS {
        return Err(LoaderError::BadElf(format!(
            "program header table has {e_phnum} entries, exceeding the bound of {MAX_PROGRAM_HEADERS}"
        )));
    }
    if e_phentsize as usize != 56 {
        return Err(LoaderError::BadElf("unexpected program header entry size".into()));
    }

    let mut headers = Vec::with_capacity(e_phnum as usize);
    for i in 0..e_phnum as usize {
        let base = e_phoff as usize + i * 56;
        let entry = image
            .get(base..base + 56)
            .ok_or_else(|| LoaderError::BadElf("program header table runs past end of file".into()))?;
        headers.push(ProgramHeader {
            p_type: u32::from_le_bytes(entry[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(entry[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(entry[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(entry[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(entry[40..48].try_into().unwrap()),
            p_align: u64::from_le_bytes(entry[48..56].try_into().unwrap()),
        });
    }

    Ok((e_entry, headers))
}

/// Loads `image` into `space`, populating every field `LoadedImage`
/// describes. `bundle_size` must be a power of two (16 or 32).
pub fn load(image: &[u8], space: &AddressSpace, bundle_size: usize) -> Result<LoadedImage, LoaderError> {
    if image.len() as u64 > LARGEST_NEXE {
        return Err(LoaderError::TooLarge {
            what: "nexe",
            got: image.len() as u64,
            limit: LARGEST_NEXE,
        });
    }
    if !bundle_size.is_power_of_two() || (bundle_size != 16 && bundle_size != 32) {
        return Err(LoaderError::BadElf(format!(
            "bundle_size {bundle_size} is not 16 or 32"
        )));
    }

    let (e_entry, headers) = parse_headers(image)?;

    let text_block = space.block(MemBlock::Text);
    let rodata_block = space.block(MemBlock::Rodata);
    let heap_block = space.block(MemBlock::Heap);

    let mut text_seg = None;
    let mut rodata_seg = None;
    let mut data_seg = None;

    for ph in headers.iter().filter(|h| h.p_type == PT_LOAD) {
        if ph.p_align as usize != PAGE_SIZE {
            return Err(LoaderError::BadElf("segment alignment is not the page size".into()));
        }
        if ph.p_vaddr % PAGE_SIZE as u64 != 0 {
            return Err(LoaderError::BadElf("segment vaddr is not page-aligned".into()));
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(LoaderError::BadElf("segment filesz exceeds memsz".into()));
        }

        let user_start = ph.p_vaddr as usize;
        let user_end = user_start
            .checked_add(ph.p_memsz as usize)
            .ok_or_else(|| LoaderError::BadElf("segment size overflows address space".into()))?;
        let host_start = space.user_to_host(user_start);
        let host_end = space.user_to_host(user_end.saturating_sub(1));
        if host_start == crate::consts::BAD_ADDRESS || host_end == crate::consts::BAD_ADDRESS {
            return Err(LoaderError::Overlap("segment lies outside the sandbox".into()));
        }

        let writable = ph.p_flags & PF_W != 0;
        let executable = ph.p_flags & PF_X != 0;

        if executable {
            if writable {
                return Err(LoaderError::BadElf("text segment is writable".into()));
            }
            if user_start != STATIC_TEXT_START {
                return Err(LoaderError::BadElf(format!(
                    "text segment starts at 0x{user_start:x}, expected 0x{STATIC_TEXT_START:x}"
                )));
            }
            if text_seg.is_some() {
                return Err(LoaderError::BadElf("more than one text segment".into()));
            }
            if user_end > text_block.end() - space.mem_start() {
                return Err(LoaderError::TooLarge {
                    what: "text segment",
                    got: ph.p_memsz,
                    limit: text_block.size as u64,
                });
            }
            text_seg = Some(*ph);
        } else if writable {
            if data_seg.is_some() {
                return Err(LoaderError::BadElf("more than one data segment".into()));
            }
            if user_end > heap_block.end() - space.mem_start() {
                return Err(LoaderError::TooLarge {
                    what: "data segment",
                    got: ph.p_memsz,
                    limit: heap_block.size as u64,
                });
            }
            data_seg = Some(*ph);
        } else {
            if rodata_seg.is_some() {
                return Err(LoaderError::BadElf("more than one rodata segment".into()));
            }
            if user_end > rodata_block.end() - space.mem_start() {
                return Err(LoaderError::TooLarge {
                    what: "rodata segment",
                    got: ph.p_memsz,
                    limit: rodata_block.size as u64,
                });
            }
            rodata_seg = Some(*ph);
        }
    }

    let text_seg = text_seg.ok_or_else(|| LoaderError::BadElf("no text segment present".into()))?;

    copy_segment(image, space, &text_seg)?;
    if let Some(seg) = rodata_seg {
        copy_segment(image, space, &seg)?;
    }
    if let Some(seg) = data_seg {
        copy_segment(image, space, &seg)?;
    }

    let static_text_end = round_up(STATIC_TEXT_START + text_seg.p_filesz as usize, bundle_size);
    fill_halt_pattern(
        space.user_to_host(STATIC_TEXT_START + text_seg.p_filesz as usize),
        static_text_end - (STATIC_TEXT_START + text_seg.p_filesz as usize),
    );

    let (dynamic_text_start, dynamic_text_end) = (static_text_end, static_text_end);

    let rodata_start = rodata_seg.map(|s| s.p_vaddr as usize).unwrap_or(0);

    let (data_start, data_end) = match data_seg {
        Some(seg) => {
            let start = seg.p_vaddr as usize;
            let end = round_up(start + seg.p_memsz as usize, PAGE_SIZE);
            (start, end)
        }
        None => (0, 0),
    };

    if e_entry < STATIC_TEXT_START as u64 || e_entry >= static_text_end as u64 {
        return Err(LoaderError::BadElf(format!(
            "entry point 0x{e_entry:x} lies outside the static text segment"
        )));
    }

    info!(
        target: "elf",
        "loaded image: static_text_end=0x{static_text_end:x} entry=0x{e_entry:x}"
    );

    Ok(LoadedImage {
        static_text_end,
        dynamic_text_start,
        dynamic_text_end,
        rodata_start,
        data_start,
        data_end,
        initial_entry_pt: e_entry as usize,
        break_addr: data_end,
        bundle_size,
    })
}

fn copy_segment(image: &[u8], space: &AddressSpace, seg: &ProgramHeader) -> Result<(), LoaderError> {
    let src = image
        .get(seg.p_offset as usize..(seg.p_offset + seg.p_filesz) as usize)
        .ok_or_else(|| LoaderError::BadElf("segment file range runs past end of image".into()))?;
    let host_start = space.user_to_host(seg.p_vaddr as usize);
    debug!(target: "elf", "copying {} bytes to 0x{host_start:x}", src.len());

    // SAFETY: `host_start` was validated to lie within a block sized to
    // fit this segment's `memsz`, and the block is currently writable
    // (protections are finalized only after load completes).
    unsafe {
        let dst = std::slice::from_raw_parts_mut(host_start as *mut u8, seg.p_memsz as usize);
        dst[..src.len()].copy_from_slice(src);
        dst[src.len()..].fill(0);
    }
    Ok(())
}

/// Fills `len` bytes at `host_addr` with the architecture's safe-halt
/// pattern so any mid-bundle jump traps deterministically.
fn fill_halt_pattern(host_addr: usize, len: usize) {
    if len == 0 {
        return;
    }
    let pattern = crate::arch::SAFE_HALT_PATTERN;
    // SAFETY: caller guarantees `host_addr..host_addr+len` lies inside
    // the writable text block before protections are finalized.
    unsafe {
        let dst = std::slice::from_raw_parts_mut(host_addr as *mut u8, len);
        for chunk in dst.chunks_mut(pattern.len()) {
            chunk.copy_from_slice(&pattern[..chunk.len()]);
        }
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_rounds_to_next_multiple() {
        assert_eq!(round_up(0, 32), 0);
        assert_eq!(round_up(1, 32), 32);
        assert_eq!(round_up(32, 32), 32);
        assert_eq!(round_up(33, 32), 64);
    }

    #[test]
    fn rejects_short_images() {
        assert!(parse_headers(&[0u8; 4]).is_err());
    }

    #[test]
    fn rejects_missing_magic() {
        let mut image = vec![0u8; 64 + 56];
        image[0..4].copy_from_slice(b"BAD!");
        assert!(parse_headers(&image).is_err());
    }

    fn minimal_header(e_type: u16, e_machine: u16, phnum: u16) -> Vec<u8> {
        let mut image = vec![0u8; 64];
        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[6] = EV_CURRENT;
        image[16..18].copy_from_slice(&e_type.to_le_bytes());
        image[18..20].copy_from_slice(&e_machine.to_le_bytes());
        image[20..24].copy_from_slice(&(EV_CURRENT as u32).to_le_bytes());
        image[24..32].copy_from_slice(&(STATIC_TEXT_START as u64).to_le_bytes());
        image[32..40].copy_from_slice(&64u64.to_le_bytes());
        image[54..56].copy_from_slice(&56u16.to_le_bytes());
        image[56..58].copy_from_slice(&phnum.to_le_bytes());
        image
    }

    #[test]
    fn rejects_wrong_machine() {
        let image = minimal_header(ET_EXEC, 3, 0);
        assert!(parse_headers(&image).is_err());
    }

    #[test]
    fn rejects_zero_program_headers() {
        let image = minimal_header(ET_EXEC, EM_X86_64, 0);
        assert!(parse_headers(&image).is_err());
    }

    #[test]
    fn rejects_too_many_program_headers() {
        let image = minimal_header(ET_EXEC, EM_X86_64, (MAX_PROGRAM_HEADERS + 1) as u16);
        assert!(parse_headers(&image).is_err());
    }

    #[test]
    fn accepts_well_formed_header_with_one_text_segment() {
        let mut image = minimal_header(ET_EXEC, EM_X86_64, 1);
        let ph_offset = image.len();
        image.extend_from_slice(&PT_LOAD.to_le_bytes()); // p_type
        image.extend_from_slice(&(PF_R | PF_X).to_le_bytes()); // p_flags
        image.extend_from_slice(&0u64.to_le_bytes()); // p_offset
        image.extend_from_slice(&(STATIC_TEXT_START as u64).to_le_bytes()); // p_vaddr
        image.extend_from_slice(&0u64.to_le_bytes()); // p_paddr
        image.extend_from_slice(&4u64.to_le_bytes()); // p_filesz
        image.extend_from_slice(&4u64.to_le_bytes()); // p_memsz
        image.extend_from_slice(&(PAGE_SIZE as u64).to_le_bytes()); // p_align
        image[32..40].copy_from_slice(&(ph_offset as u64).to_le_bytes());

        let (entry, headers) = parse_headers(&image).unwrap();
        assert_eq!(entry, STATIC_TEXT_START as u64);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].p_type, PT_LOAD);
    }
}
