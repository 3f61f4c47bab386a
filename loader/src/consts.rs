// Sandbox-wide constants
//
// Gathers the fixed numeric contract shared by every loader subsystem
// in one place so a reader does not have to hunt across modules for a
// single magic number.

/// Manifest format version this loader accepts. Bump when the on-disk
/// `key = value` schema changes in an incompatible way.
pub const MANIFEST_VERSION: &str = "20130611";

/// Upper bound on the manifest file size, rejecting anything larger
/// before it is even read into memory.
pub const MANIFEST_MAX: u64 = 8 * 1024 * 1024;

/// Upper bound on the guest executable image size.
pub const LARGEST_NEXE: u64 = 512 * 1024 * 1024;

/// Sandbox-relative address the static text segment must start at.
pub const STATIC_TEXT_START: usize = 0x20000;

/// Allocation quantum every memory block's size must be a multiple of.
pub const ALLOC_QUANTUM: usize = 64 * 1024;

/// Default address space size selector (4 GiB sandbox).
pub const DEFAULT_ADDR_BITS: u8 = 32;

/// Default maximum size of the eagerly reserved main-thread stack.
pub const DEFAULT_STACK_MAX: usize = 16 * 1024 * 1024;

/// Alignment boundary at which syscall gates are tiled across the
/// trampoline page.
pub const OP_ALIGNMENT: usize = 0x20;

/// Auxiliary vector keys used when building the initial user stack.
pub const AT_NULL: u64 = 0;
pub const AT_ENTRY: u64 = 9;
pub const AT_SYSINFO: u64 = 32;

/// Sentinel returned by `user_to_host` for an out-of-range user address.
pub const BAD_ADDRESS: usize = usize::MAX;
