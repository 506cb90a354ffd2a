//! System V x86_64 context switch
//!
//! A suspended context is a stack pointer: the callee-saved registers
//! (rbp, rbx, r12-r15) are pushed on the suspended stack, the return address
//! of the `swap` call sits right above them.

use std::arch::naked_asm;

use crate::StartCb;

/// Number of callee-saved registers pushed by [`swap`]
const SAVED_REGISTERS: usize = 6;

extern "C" fn __unreachable() -> ! {
    crate::die("Unreachable coroutine protection");
}

/// Saves the current context into `*from` and resumes `to`
///
/// Returns when some other context swaps back to the one saved in `*from`.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn swap(_from: *mut *mut (), _to: *mut ()) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// First code executed on a fresh stack, reached through the `ret` of [`swap`]
///
/// Pops the start callback and its argument, then jumps to the callback with
/// `__unreachable` as its return address.
#[unsafe(naked)]
unsafe extern "C" fn boot() -> ! {
    naked_asm!("pop rax", "pop rdi", "jmp rax")
}

/// Writes the initial frame consumed by [`swap`] then [`boot`]
///
/// `top` must be 16 bytes aligned; returns the stack pointer to resume.
pub(crate) unsafe fn setup(top: *mut u8, start_cb: StartCb, start_arg: *mut ()) -> *mut () {
    debug_assert!(top as usize % 16 == 0);
    unsafe {
        let mut sp = top as *mut usize;
        // Leave 128 bytes at the top of the stack
        sp = sp.sub(16);
        // Unreachable return address ; `start_cb` is entered with rsp = 8 (mod 16)
        sp = sp.sub(1);
        sp.write(__unreachable as usize);
        sp = sp.sub(1);
        sp.write(start_arg as usize);
        sp = sp.sub(1);
        sp.write(start_cb as usize);
        sp = sp.sub(1);
        sp.write(boot as usize);
        // Zeroed rbp terminates backtraces
        for _ in 0..SAVED_REGISTERS {
            sp = sp.sub(1);
            sp.write(0);
        }
        sp as *mut ()
    }
}
