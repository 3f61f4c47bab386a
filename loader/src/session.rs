// Session launcher
//
// Builds the initial user stack and hands control to the guest. Once
// `create_session` calls into the dispatch thunk there is no return:
// the only way back into trusted code is through the syscall gate
// (`TrapHandler`), which this loader never sees directly -- it only
// ever observes the process either exiting cleanly or faulting, which
// the signal module turns into a report.

use log::info;

use crate::addrspace::{AddressSpace, MemBlock};
use crate::arch::transfer_to_guest;
use crate::consts::{AT_ENTRY, AT_NULL, AT_SYSINFO};
use crate::error::LoaderError;

const LOG_TARGET: &str = "session";
const STACK_ALIGNMENT: usize = 16;
const WORD: usize = 8;

/// Program counter, stack pointer, and TLS cookie for one session.
/// Built once at session creation; mutated only by the transfer
/// sequence and by the fault reporter after a guest fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadContext {
    pub pc: usize,
    pub sp: usize,
    pub tls_cookie: usize,
}

/// Writes argv, envp, and the auxiliary vector onto the top of the
/// stack block, high to low: auxv (terminated by `(AT_NULL, 0)`), envp
/// (null-terminated), argv (null-terminated), then argc. Returns the
/// host address of argc, aligned down to `STACK_ALIGNMENT`, which is
/// the stack pointer handed to the guest.
pub fn build_user_stack(
    space: &AddressSpace,
    argv: &[&str],
    envp: &[&str],
    initial_entry_pt: usize,
    trampoline_gate_address: usize,
) -> Result<usize, LoaderError> {
    let stack_block = space.block(MemBlock::Stack);
    let mut cursor = stack_block.end();

    // String tables first, so their addresses are known before we lay
    // out the pointer arrays that reference them.
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        cursor = write_cstr(cursor, s)?;
        argv_ptrs.push(cursor);
    }
    argv_ptrs.reverse();

    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for s in envp.iter().rev() {
        cursor = write_cstr(cursor, s)?;
        envp_ptrs.push(cursor);
    }
    envp_ptrs.reverse();

    // Pointer arrays and auxv are word-sized; align the cursor before
    // laying them down.
    cursor &= !(WORD - 1);

    let auxv: [(u64, u64); 3] = [
        (AT_ENTRY, initial_entry_pt as u64),
        (AT_SYSINFO, trampoline_gate_address as u64),
        (AT_NULL, 0),
    ];
    for (key, value) in auxv.iter().rev() {
        cursor = write_word(cursor, *value as usize, stack_block.start)?;
        cursor = write_word(cursor, *key as usize, stack_block.start)?;
    }

    cursor = write_word(cursor, 0, stack_block.start)?; // envp terminator
    for ptr in envp_ptrs.iter().rev() {
        cursor = write_word(cursor, *ptr, stack_block.start)?;
    }

    cursor = write_word(cursor, 0, stack_block.start)?; // argv terminator
    for ptr in argv_ptrs.iter().rev() {
        cursor = write_word(cursor, *ptr, stack_block.start)?;
    }

    cursor = write_word(cursor, argv.len(), stack_block.start)?; // argc

    let sp = cursor & !(STACK_ALIGNMENT - 1);
    info!(target: LOG_TARGET, "built user stack, sp=0x{sp:x}");
    Ok(sp)
}

fn write_cstr(cursor: usize, s: &str) -> Result<usize, LoaderError> {
    let bytes_len = s.len() + 1; // NUL terminator
    let new_cursor = cursor
        .checked_sub(bytes_len)
        .ok_or_else(|| LoaderError::Overlap("stack underflow while writing argv/envp".into()))?;
    // SAFETY: the stack block is reserved with enough headroom for the
    // manifest-declared argv/envp; callers size it accordingly.
    unsafe {
        let dst = std::slice::from_raw_parts_mut(new_cursor as *mut u8, s.len());
        dst.copy_from_slice(s.as_bytes());
        *((new_cursor + s.len()) as *mut u8) = 0;
    }
    Ok(new_cursor)
}

fn write_word(cursor: usize, value: usize, stack_start: usize) -> Result<usize, LoaderError> {
    let new_cursor = cursor
        .checked_sub(WORD)
        .ok_or_else(|| LoaderError::Overlap("stack underflow while writing pointer array".into()))?;
    if new_cursor < stack_start {
        return Err(LoaderError::Overlap("stack block exhausted".into()));
    }
    // SAFETY: `new_cursor` was just checked to lie within the stack
    // block and is word-aligned by construction.
    unsafe {
        *(new_cursor as *mut usize) = value;
    }
    Ok(new_cursor)
}

/// One-way handoff into the guest. Never returns under normal
/// operation: the guest's only way back into trusted code is the
/// syscall gate, which terminates the process directly.
///
/// # Safety
/// `context` must describe a fully built stack and a dispatch thunk
/// address that is currently mapped and executable.
pub unsafe fn create_session(context: ThreadContext, dispatch_thunk_addr: usize) -> ! {
    info!(target: LOG_TARGET, "transferring control to guest at pc=0x{:x}", context.pc);
    transfer_to_guest(dispatch_thunk_addr, context.sp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::ALLOC_QUANTUM;

    fn test_sizes() -> [usize; 7] {
        let q = ALLOC_QUANTUM;
        [q, q * 4, q, q * 4, q, q * 4, q]
    }

    #[test]
    fn stack_pointer_is_aligned() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        let sp = build_user_stack(&space, &["prog"], &["HOME=/"], 0x20000, 0x20100).unwrap();
        assert_eq!(sp % STACK_ALIGNMENT, 0);
    }

    #[test]
    fn stack_pointer_lies_within_stack_block() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        let block = space.block(MemBlock::Stack);
        let sp = build_user_stack(&space, &[], &[], 0x20000, 0x20100).unwrap();
        assert!(sp >= block.start && sp < block.end());
    }

    #[test]
    fn empty_argv_and_envp_still_builds_a_valid_stack() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        let sp = build_user_stack(&space, &[], &[], 0x20000, 0x20100);
        assert!(sp.is_ok());
    }

    #[test]
    fn argc_reflects_argv_length() {
        let space = AddressSpace::build(24, test_sizes()).unwrap();
        let sp = build_user_stack(&space, &["a", "b", "c"], &[], 0x20000, 0x20100).unwrap();
        // SAFETY: test-only read back of memory this same call wrote.
        let argc = unsafe { *(sp as *const usize) };
        assert_eq!(argc, 3);
    }
}
