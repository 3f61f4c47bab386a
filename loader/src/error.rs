// Loader error taxonomy
//
// Defines the single error type that every loader subsystem returns.
// Each variant corresponds to exactly one of the error kinds in the
// external interface contract and carries the context needed to produce
// the single structured log line the caller emits before exiting.
//
// Propagation policy: nothing below `main` catches or retries an error.
// Every `Result::Err` that reaches `main` is converted straight into a
// process exit via `exit_code()`; the only error handled rather than
// propagated is a guest fault observed after control has already been
// handed to untrusted code (see `signal`).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("bad command line: {0}")]
    BadCmdline(String),

    #[error("invalid manifest '{path}': {reason}")]
    BadManifest { path: PathBuf, reason: String },

    #[error("manifest version not supported: {0}")]
    BadVersion(String),

    #[error("missing file: {0}")]
    MissingFile(PathBuf),

    #[error("bad elf: {0}")]
    BadElf(String),

    #[error("{what} too large ({got} > {limit} bytes)")]
    TooLarge {
        what: &'static str,
        got: u64,
        limit: u64,
    },

    #[error("overlapping segment: {0}")]
    Overlap(String),

    #[error("validation failed: {0}")]
    BadText(String),

    #[error("platform qualification failed: {0}")]
    QualificationFailed(String),

    #[error("guest fault: {kind} at pc=0x{pc:x} ({location})")]
    GuestFault {
        kind: String,
        pc: usize,
        location: &'static str,
    },

    #[error("out of memory: {0}")]
    Oom(String),
}

impl LoaderError {
    /// Exit code this error maps to, per the external interface contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoaderError::BadCmdline(_) => libc::EINVAL,
            LoaderError::BadManifest { .. }
            | LoaderError::BadVersion(_)
            | LoaderError::Overlap(_)
            | LoaderError::Oom(_) => libc::EFAULT,
            LoaderError::MissingFile(_) => libc::ENOENT,
            LoaderError::BadElf(_) => libc::ENOEXEC,
            LoaderError::TooLarge { what, .. } if *what == "manifest" => libc::EFBIG,
            LoaderError::TooLarge { .. } => libc::ENOENT,
            LoaderError::BadText(_) => libc::ENOEXEC,
            LoaderError::QualificationFailed(_) => libc::EFAULT,
            LoaderError::GuestFault { kind, .. } => 128 + signal_number(kind),
        }
    }
}

/// Maps the textual fault kind back to a POSIX signal number for the
/// conventional `128 + signal` exit code. Unknown kinds fall back to
/// `SIGSYS` (31) since they can only originate from our own classifier.
fn signal_number(kind: &str) -> i32 {
    match kind {
        "illegal instruction" => libc::SIGILL,
        "segmentation violation" => libc::SIGSEGV,
        "floating point error" => libc::SIGFPE,
        "bus error" => libc::SIGBUS,
        _ => 31,
    }
}
