//! AAPCS64 context switch
//!
//! [`swap`] stores x19-x30 and d8-d15 in a 160 bytes frame at the bottom of
//! the suspended stack and saves the resulting stack pointer.

use std::arch::naked_asm;

use crate::StartCb;

/// Size of the frame written by [`swap`], in words
const FRAME_WORDS: usize = 20;
const SLOT_X19: usize = 0;
const SLOT_X20: usize = 1;
const SLOT_X21: usize = 2;
const SLOT_X30: usize = 11;

extern "C" fn __unreachable() -> ! {
    crate::die("Unreachable coroutine protection");
}

/// Saves the current context into `*from` and resumes `to`
///
/// Returns when some other context swaps back to the one saved in `*from`.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn swap(_from: *mut *mut (), _to: *mut ()) {
    naked_asm!(
        "sub sp, sp, #0xa0",
        "stp x19, x20, [sp, #0x00]",
        "stp x21, x22, [sp, #0x10]",
        "stp x23, x24, [sp, #0x20]",
        "stp x25, x26, [sp, #0x30]",
        "stp x27, x28, [sp, #0x40]",
        "stp x29, x30, [sp, #0x50]",
        "stp d8, d9, [sp, #0x60]",
        "stp d10, d11, [sp, #0x70]",
        "stp d12, d13, [sp, #0x80]",
        "stp d14, d15, [sp, #0x90]",
        "mov x2, sp",
        "str x2, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, #0x00]",
        "ldp x21, x22, [sp, #0x10]",
        "ldp x23, x24, [sp, #0x20]",
        "ldp x25, x26, [sp, #0x30]",
        "ldp x27, x28, [sp, #0x40]",
        "ldp x29, x30, [sp, #0x50]",
        "ldp d8, d9, [sp, #0x60]",
        "ldp d10, d11, [sp, #0x70]",
        "ldp d12, d13, [sp, #0x80]",
        "ldp d14, d15, [sp, #0x90]",
        "add sp, sp, #0xa0",
        "ret",
    )
}

/// First code executed on a fresh stack, reached through the `ret` of [`swap`]
///
/// x19 holds the start callback, x20 its argument and x21 the guard used as
/// return address.
#[unsafe(naked)]
unsafe extern "C" fn boot() -> ! {
    naked_asm!("mov x0, x20", "mov x30, x21", "br x19")
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
        sp = sp.sub(FRAME_WORDS);
        std::ptr::write_bytes(sp, 0, FRAME_WORDS);
        sp.add(SLOT_X19).write(start_cb as usize);
        sp.add(SLOT_X20).write(start_arg as usize);
        sp.add(SLOT_X21).write(__unreachable as usize);
        sp.add(SLOT_X30).write(boot as usize);
        sp as *mut ()
    }
}
