// Signal and fault reporter
//
// Installs a process-wide handler for the four synchronous faults a
// misbehaving or malicious guest can raise, and chains an ordered list
// of handlers in front of the terminal classifier, matching the
// source's tri-state verdict model: `Search` (try the next handler),
// `Skip` (let the OS default apply), `Return` (suppress and resume).
// The chain stops at the first non-`Search` verdict.
//
// `-S` (`SetSignalHandling(false)`) disables installation entirely, for
// benchmarking against an unsandboxed baseline.

use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::LoaderError;

const LOG_TARGET: &str = "signal";

/// Bounds of the static text slab, set once before `install` so the
/// async-signal-safe handler can classify a faulting pc without calling
/// back into the rest of the loader. `usize::MAX` as the start marks
/// "not yet set" (pre-load faults classify as outside sandbox text).
static TEXT_START: AtomicUsize = AtomicUsize::new(usize::MAX);
static TEXT_END: AtomicUsize = AtomicUsize::new(0);

/// Records the static text range the handler should classify faults
/// against. Must be called before `install`.
pub fn set_text_bounds(start: usize, end: usize) {
    TEXT_START.store(start, Ordering::Release);
    TEXT_END.store(end, Ordering::Release);
}

/// Verdict returned by one handler in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResult {
    /// Try the next handler in the chain.
    Search,
    /// Let the OS default disposition apply (usually: terminate).
    Skip,
    /// The fault was handled; resume execution.
    Return,
}

/// Faults this loader intercepts.
pub const HANDLED_SIGNALS: [Signal; 4] = [
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGFPE,
    Signal::SIGBUS,
];

/// Where a faulting program counter landed, used to build the
/// account-log classification line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultLocation {
    InsideSandboxText,
    OutsideSandboxText,
}

/// Classifies `pc` as inside or outside the static/dynamic text range.
pub fn classify_pc(pc: usize, static_text_start: usize, static_text_end: usize) -> FaultLocation {
    if pc >= static_text_start && pc < static_text_end {
        FaultLocation::InsideSandboxText
    } else {
        FaultLocation::OutsideSandboxText
    }
}

pub fn signal_kind_name(sig: Signal) -> &'static str {
    match sig {
        Signal::SIGILL => "illegal instruction",
        Signal::SIGSEGV => "segmentation violation",
        Signal::SIGFPE => "floating point error",
        Signal::SIGBUS => "bus error",
        _ => "unknown fault",
    }
}

pub fn fault_location_str(loc: FaultLocation) -> &'static str {
    match loc {
        FaultLocation::InsideSandboxText => "fault inside sandbox text",
        FaultLocation::OutsideSandboxText => "fault outside sandbox text",
    }
}

/// One link in the fault-handling chain. A tagged enum rather than a
/// trait object: the set of handler kinds is closed and small, and
/// every variant must stay safe to evaluate from inside a signal
/// context, which rules out arbitrary `dyn` dispatch.
#[derive(Debug, Clone, Copy)]
pub enum HandlerKind {
    /// The sandbox's own terminal classifier: always returns `Return`.
    SandboxTerminal,
    /// A debugging hook that only intercepts `SIGTRAP`; defers to the
    /// next handler for everything else.
    DebugTrapOnly,
}

impl HandlerKind {
    fn evaluate(self, sig: Signal) -> SignalResult {
        match self {
            HandlerKind::SandboxTerminal => SignalResult::Return,
            HandlerKind::DebugTrapOnly => {
                if sig == Signal::SIGTRAP {
                    SignalResult::Return
                } else {
                    SignalResult::Search
                }
            }
        }
    }
}

/// Walks `chain` in registration order, stopping at the first verdict
/// that isn't `Search`. An empty chain (or one where every link
/// defers) falls through to `Skip`, letting the OS default apply.
pub fn run_chain(chain: &[HandlerKind], sig: Signal) -> SignalResult {
    for handler in chain {
        match handler.evaluate(sig) {
            SignalResult::Search => continue,
            verdict => return verdict,
        }
    }
    SignalResult::Skip
}

/// Builds the `LoaderError::GuestFault` this loader's exit path
/// converts into the `128 + signal` exit code, after logging the
/// classification line to the account log.
pub fn report_guest_fault(sig: Signal, pc: usize, location: FaultLocation) -> LoaderError {
    let line = format!("{} at pc=0x{pc:x}: {}", signal_kind_name(sig), fault_location_str(location));
    log::error!(target: LOG_TARGET, "{line}");
    LoaderError::GuestFault {
        kind: signal_kind_name(sig).to_string(),
        pc,
        location: fault_location_str(location),
    }
}

/// Installs the four signal handlers unless `enabled` is false, in
/// which case this is a no-op (the `-S` flag). `set_text_bounds` should
/// be called first so the handler can classify faults; faults that
/// arrive before it is called are classified as outside sandbox text.
///
/// # Safety
/// Must be called once, before the guest starts running, and never
/// concurrently with another call to this function.
pub unsafe fn install(enabled: bool) -> Result<(), LoaderError> {
    if !enabled {
        log::info!(target: LOG_TARGET, "signal handling disabled by request");
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::SigAction(handle_fault),
        SaFlags::SA_NODEFER | SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );

    for sig in HANDLED_SIGNALS {
        signal::sigaction(sig, &action)
            .map_err(|e| LoaderError::QualificationFailed(format!("sigaction({sig:?}) failed: {e}")))?;
    }

    log::info!(target: LOG_TARGET, "installed handlers for {HANDLED_SIGNALS:?}");
    Ok(())
}

/// The terminal handler of the fault-handling chain: captures the
/// faulting pc, classifies it, writes one classification line to the
/// account log (via a raw, allocation-free `write(2)`, since the `log`
/// crate's global logger is not async-signal-safe), and exits the
/// process with the `128 + signal` exit code.
///
/// Async-signal-safe by construction: no allocation, no locking, no
/// panics, no calls into the `log` crate.
extern "C" fn handle_fault(sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    // SAFETY: `ctx` is the ucontext the kernel passed this SA_SIGINFO
    // handler; reading the saved pc does not allocate or block.
    let pc = unsafe { crate::arch::fault_pc_from_ucontext(ctx) };

    let start = TEXT_START.load(Ordering::Acquire);
    let end = TEXT_END.load(Ordering::Acquire);
    let location = classify_pc(pc, start, end);

    write_fault_line(sig, pc, location);

    // SAFETY: this process is about to terminate; _exit is the only
    // async-signal-safe way to end it from inside a handler.
    unsafe { libc::_exit(128 + sig) };
}

/// Formats `"<signal> at pc=0x<hex>: <location>\n"` into a fixed stack
/// buffer and writes it to stderr with a raw `write(2)`, avoiding any
/// heap allocation or locking that would be unsafe from a signal
/// handler.
fn write_fault_line(sig: libc::c_int, pc: usize, location: FaultLocation) {
    let mut buf = [0u8; 160];
    let mut n = 0;

    n += push_str(&mut buf[n..], signal_kind_name_from_raw(sig));
    n += push_str(&mut buf[n..], " at pc=0x");
    n += push_hex(&mut buf[n..], pc);
    n += push_str(&mut buf[n..], ": ");
    n += push_str(&mut buf[n..], fault_location_str(location));
    n += push_str(&mut buf[n..], "\n");

    // SAFETY: `buf[..n]` is a valid, initialized, in-bounds slice; a
    // short write to a blocking fd is the worst case and is acceptable
    // for a diagnostic line emitted right before process exit.
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, n);
    }
}

fn push_str(dst: &mut [u8], s: &str) -> usize {
    let n = s.len().min(dst.len());
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
    n
}

fn push_hex(dst: &mut [u8], mut value: usize) -> usize {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut tmp = [0u8; 16];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = DIGITS[value & 0xf];
        value >>= 4;
        if value == 0 || i == 0 {
            break;
        }
    }
    push_str(dst, std::str::from_utf8(&tmp[i..]).unwrap_or(""))
}

/// Same mapping as `signal_kind_name`, usable directly on the raw
/// `libc::c_int` the kernel hands the handler (no `nix::Signal`
/// conversion, which can allocate on some platforms).
fn signal_kind_name_from_raw(sig: libc::c_int) -> &'static str {
    match sig {
        libc::SIGILL => "illegal instruction",
        libc::SIGSEGV => "segmentation violation",
        libc::SIGFPE => "floating point error",
        libc::SIGBUS => "bus error",
        _ => "unknown fault",
    }
}
