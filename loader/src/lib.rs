// Sandbox loader library
//
// This crate implements a single-process loader that reads a manifest,
// builds a fixed-layout virtual address space, loads a restricted ELF
// image into it, installs a syscall gate and trusted dispatch thunk,
// validates the loaded text, and hands control to the untrusted guest
// in-process. It never returns to its caller after a session starts:
// the only way back into trusted code is a syscall gate trap or a
// signal raised by the guest.
//
// Key responsibilities:
// - Parse and hold the manifest table for the life of the process
// - Reserve and lay out the eight-block sandbox address space
// - Load a restricted ELF64 profile into that address space
// - Tile the trampoline page with syscall gates and install the
//   out-of-sandbox dispatch thunk
// - Present loaded text to an external validator and record its verdict
// - Build the initial user stack and transfer control
// - Intercept synchronous guest faults and classify them
//
// Design and implementation:
// - All process-wide state (manifest, signal handlers, the image
//   snapshot, the dispatch thunk) is acquired in a fixed order in
//   `main` and released in reverse via `Drop`, rather than modelled as
//   untracked global state
// - Memory blocks are addressed by a closed enumeration so both the
//   loader and its tests can refer to them by name
// - Only x86_64 is supported; architecture-specific code is isolated
//   behind `arch`
//
// Public interface:
// - `manifest`, `channel`: manifest parsing and channel descriptors
// - `addrspace`: the eight-block address space builder
// - `elf`: the restricted ELF loader
// - `trampoline`: syscall gate tiling and dispatch thunk management
// - `validator`: the validation adapter and verdict bookkeeping
// - `session`: user stack construction and control transfer
// - `signal`: fault interception and classification
// - `report`: the account log and exit report
// - `cli`, `error`, `log_setup`, `consts`: ambient plumbing

pub mod addrspace;
pub mod arch;
pub mod channel;
pub mod cli;
pub mod consts;
pub mod elf;
pub mod error;
pub mod log_setup;
pub mod manifest;
pub mod report;
pub mod session;
pub mod signal;
pub mod trampoline;
pub mod validator;
