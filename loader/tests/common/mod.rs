// Shared test scaffolding: builds a minimal, hand-crafted ELF64 "nexe"
// image (one executable PT_LOAD segment, no rodata/data) good enough to
// exercise `sandloader::elf::load` and, for the process-level scenarios
// in `integration.rs`, to actually run under the built binary.

use std::io::Write;
use std::path::Path;

pub const STATIC_TEXT_START: u64 = 0x20000;
const PAGE_SIZE: u64 = 0x1000;

/// Builds a statically-linked ET_EXEC x86-64 image whose only segment
/// is `code`, loaded at `STATIC_TEXT_START` with entry point
/// `STATIC_TEXT_START + entry_offset`.
pub fn build_nexe(code: &[u8], entry_offset: u64) -> Vec<u8> {
    let ph_off: u64 = 64;
    let text_off: u64 = ph_off + 56;

    let mut header = vec![0u8; 64];
    header[0..4].copy_from_slice(b"\x7fELF");
    header[4] = 2; // ELFCLASS64
    header[5] = 1; // ELFDATA2LSB
    header[6] = 1; // EV_CURRENT
    header[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    header[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    header[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    header[24..32].copy_from_slice(&(STATIC_TEXT_START + entry_offset).to_le_bytes());
    header[32..40].copy_from_slice(&ph_off.to_le_bytes());
    header[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    header[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    let mut ph = vec![0u8; 56];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
    ph[8..16].copy_from_slice(&text_off.to_le_bytes()); // p_offset
    ph[16..24].copy_from_slice(&STATIC_TEXT_START.to_le_bytes()); // p_vaddr
    ph[24..32].copy_from_slice(&STATIC_TEXT_START.to_le_bytes()); // p_paddr
    ph[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes()); // p_filesz
    ph[40..48].copy_from_slice(&(code.len() as u64).to_le_bytes()); // p_memsz
    ph[48..56].copy_from_slice(&PAGE_SIZE.to_le_bytes()); // p_align

    let mut image = header;
    image.extend_from_slice(&ph);
    image.extend_from_slice(code);
    image
}

/// `mov eax, 60; xor edi, edi; syscall` -- exit(0) issued directly by
/// the guest. This loader's dispatch thunk/trampoline are a minimal
/// stand-in for the real syscall-gate ABI (validator enforcement is out
/// of scope, per spec), so a synthetic guest is free to call the OS
/// exit syscall itself to produce an observable, deterministic exit
/// code for process-level tests.
pub fn exit_zero_code() -> Vec<u8> {
    vec![0xB8, 0x3C, 0x00, 0x00, 0x00, 0x31, 0xFF, 0x0F, 0x05]
}

/// `ud2` -- raises SIGILL as soon as the guest is entered.
pub fn illegal_instruction_code() -> Vec<u8> {
    vec![0x0F, 0x0B]
}

/// Writes a manifest file referencing `program_path` with the given
/// channel line (or none), returning the manifest's path.
pub fn write_manifest(
    dir: &Path,
    program_path: &Path,
    memory: u64,
    channel_line: Option<&str>,
) -> std::path::PathBuf {
    let mut text = format!(
        "Version = {}\nProgram = {}\nMemory = {}\n",
        sandloader::consts::MANIFEST_VERSION,
        program_path.display(),
        memory
    );
    if let Some(line) = channel_line {
        text.push_str(&format!("Channel = {line}\n"));
    }

    let path = dir.join("test.mft");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(text.as_bytes()).unwrap();
    path
}

pub fn write_nexe(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}
