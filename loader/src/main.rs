// Loader driver
//
// Top-level sequence: parse the command line, open the manifest,
// snapshot the guest image, build the address space, load the ELF
// image into it, install the trampoline and dispatch thunk, validate
// the loaded text, then either stop (`-F`) or hand off to the guest.
// Every `Result::Err` produced along the way is converted straight
// into a process exit; nothing here retries or recovers.

use std::fs;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use sandloader::addrspace::{AddressSpace, MemBlock};
use sandloader::channel;
use sandloader::cli::{Cli, Config};
use sandloader::consts::{ALLOC_QUANTUM, DEFAULT_ADDR_BITS, DEFAULT_STACK_MAX, LARGEST_NEXE, MANIFEST_VERSION};
use sandloader::elf;
use sandloader::error::LoaderError;
use sandloader::log_setup;
use sandloader::manifest::ManifestStore;
use sandloader::report::AccountLog;
use sandloader::session;
use sandloader::signal;
use sandloader::trampoline::{DispatchThunk, PatchInfo};
use sandloader::validator::{self, NullValidator, SkippingValidator, TextSlab};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbosity = cli.verbosity;
    log_setup::init(verbosity);

    match run(cli) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(target: "loader", "{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), LoaderError> {
    let config = cli.into_config()?;

    // Scoped resource 1: the manifest store, open for the life of `run`.
    let manifest = ManifestStore::open(&config.manifest_path)?;
    manifest.require_version(MANIFEST_VERSION)?;

    if !config.skip_qualification {
        run_platform_qualification()?;
    }

    let mut account_log = AccountLog::new();
    let channels = channel::load_channels(&manifest)?;
    for ch in &channels {
        account_log.record_channel(ch);
    }

    // Scoped resource 2: the image snapshot, a whole-file read taken
    // once so later validation never races a concurrently modified file.
    let program_path = manifest
        .get("Program")
        .ok_or_else(|| LoaderError::BadManifest {
            path: config.manifest_path.clone(),
            reason: "missing required key 'Program'".into(),
        })?;
    let image = fs::read(program_path).map_err(|_| LoaderError::MissingFile(program_path.into()))?;
    if image.len() as u64 > LARGEST_NEXE {
        return Err(LoaderError::TooLarge {
            what: "nexe",
            got: image.len() as u64,
            limit: LARGEST_NEXE,
        });
    }

    let memory_limit: usize = manifest
        .get("Memory")
        .and_then(|v| v.parse().ok())
        .unwrap_or(256 * 1024 * 1024);

    let sizes = block_sizes(&image, memory_limit);
    let space = AddressSpace::build(DEFAULT_ADDR_BITS, sizes)?;

    let bundle_size = 32;
    let loaded = elf::load(&image, &space, bundle_size)?;
    info!(target: "loader", "loaded image, entry=0x{:x}", loaded.initial_entry_pt);

    // Scoped resource 3: signal handler registration, installed before
    // the trampoline is ever reachable by anything but this thread.
    // The handler reads a host RIP out of the ucontext, so the bounds it
    // classifies against must be host addresses too, not the
    // sandbox-relative ones `elf::load` returns.
    signal::set_text_bounds(
        space.user_to_host(sandloader::consts::STATIC_TEXT_START),
        space.user_to_host(loaded.static_text_end),
    );
    // SAFETY: called once, before any guest code can run.
    unsafe { signal::install(!config.disable_signals)? };

    let text_block = space.block(MemBlock::Text);
    let page_len = 0x1000usize;
    // SAFETY: the text block was just mapped writable by `elf::load`
    // and `finalize_protections` has not yet been called.
    let trampoline_page = unsafe {
        std::slice::from_raw_parts_mut(text_block.start as *mut u8, page_len)
    };
    let syscall_gate: [u8; 2] = [0xCD, 0x80]; // stand-in gate body: int 0x80
    sandloader::trampoline::install_gate(trampoline_page, &syscall_gate)?;

    // Scoped resource 4: the dispatch thunk, released automatically
    // when it goes out of scope at the end of `run` (or immediately on
    // an early error return). The template is `movabs rax, <imm64>;
    // jmp rax`, with the 8-byte immediate patched to this session's
    // entry point -- the minimal trusted body that loads the guest
    // register file from the thread context (here: just the entry pc;
    // `transfer_to_guest` already set rsp) and enters the guest. `rax`
    // must hold a host address: the guest text was copied to
    // `space.user_to_host(entry)`, not to the raw sandbox-relative
    // `entry` value itself.
    let host_entry_pt = space.user_to_host(loaded.initial_entry_pt);
    let thunk_template: [u8; 12] = [
        0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, // movabs rax, imm64
        0xFF, 0xE0, // jmp rax
    ];
    let thunk_patch = PatchInfo {
        abs16: vec![],
        abs32: vec![],
        abs64: vec![sandloader::trampoline::PatchEntry {
            target_offset: 2,
            value: host_entry_pt as u64,
        }],
    };
    let dispatch_thunk = DispatchThunk::install(&thunk_template, &thunk_patch)?;

    let validator_impl: Box<dyn validator::CodeValidator> = if config.skip_validation {
        Box::new(SkippingValidator)
    } else {
        Box::new(NullValidator)
    };
    let text_host_start = space.user_to_host(sandloader::consts::STATIC_TEXT_START);
    let text_len = loaded.static_text_end - sandloader::consts::STATIC_TEXT_START;
    // SAFETY: `elf::load` and `install_gate` have already populated
    // exactly this range of the (still writable) text block; the slab
    // handed to the validator is the loaded code, not the on-disk image.
    let text_bytes = unsafe { std::slice::from_raw_parts(text_host_start as *const u8, text_len) };
    let static_slab = TextSlab {
        start: sandloader::consts::STATIC_TEXT_START,
        end: loaded.static_text_end,
        bytes: text_bytes,
    };
    let verdict = validator::validate_text(validator_impl.as_ref(), &static_slab, None, loaded.initial_entry_pt)?;
    account_log.record_validation(verdict);

    space.finalize_protections()?;

    if config.fuzz_load {
        info!(target: "loader", "fuzz-load requested, stopping before session start");
        account_log.record_ok();
        eprintln!("{}", account_log.render());
        return Ok(());
    }

    // AT_SYSINFO must point at a syscall-gate slot inside the guest's own
    // trampoline page, not at the trusted out-of-sandbox dispatch thunk:
    // the guest is only ever allowed to reach the gate it jumps through,
    // never the thunk itself.
    let sp = session::build_user_stack(&space, &[], &[], host_entry_pt, text_block.start)?;
    let context = session::ThreadContext {
        pc: host_entry_pt,
        sp,
        tls_cookie: 0,
    };

    account_log.record_ok();
    // The account log is the only persisted state this loader produces,
    // and `create_session` never returns: flush it here, the last point
    // before control passes to the guest.
    eprintln!("{}", account_log.render());

    // SAFETY: the stack was just built for this session and the
    // dispatch thunk is mapped and executable.
    unsafe { session::create_session(context, dispatch_thunk.address()) }
}

/// Minimal platform qualification: verifies the running kernel supports
/// the primitives this loader depends on (anonymous mmap with
/// PROT_NONE, in practice always true on Linux/x86_64, but checked
/// explicitly so `-Q` has a real check to skip).
fn run_platform_qualification() -> Result<(), LoaderError> {
    if cfg!(target_arch = "x86_64") {
        Ok(())
    } else {
        Err(LoaderError::QualificationFailed(
            "loader is only qualified on x86_64".into(),
        ))
    }
}

/// Derives each of the seven concrete block sizes from the image size
/// and the manifest's memory limit, rounded up to the allocation
/// quantum. `Hole` is not among them: `AddressSpace::build` sizes it to
/// whatever remains of the sandbox region once these seven are placed.
///
/// `LeftBumper` is fixed at `STATIC_TEXT_START`, not one quantum: the
/// ELF loader places the text segment's first byte at that exact
/// sandbox-relative address, so `Text` (the block immediately after
/// `LeftBumper`) must begin there too.
fn block_sizes(image: &[u8], memory_limit: usize) -> [usize; 7] {
    let round = |v: usize| (v + ALLOC_QUANTUM - 1) / ALLOC_QUANTUM * ALLOC_QUANTUM;
    let text = round(image.len().max(ALLOC_QUANTUM));
    let rodata = round(ALLOC_QUANTUM);
    let heap = round(memory_limit.max(ALLOC_QUANTUM));
    let sysdata = round(ALLOC_QUANTUM);
    let stack = round(DEFAULT_STACK_MAX);
    [
        sandloader::consts::STATIC_TEXT_START, // left bumper
        text,
        rodata,
        heap,
        sysdata,
        stack,
        ALLOC_QUANTUM, // right bumper
    ]
}
