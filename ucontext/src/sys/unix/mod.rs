use std::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[path = "x86_64.rs"]
        pub(crate) mod asm;
    } else if #[cfg(target_arch = "aarch64")] {
        #[path = "aarch64.rs"]
        pub(crate) mod asm;
    } else {
        compile_error!("ucontext only supports x86_64 and aarch64");
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "openbsd"
    ))] {
        const MMAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_STACK;
    } else {
        const MMAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;
    }
}
const MMAP_PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;

/// Maps `total_size` bytes and protects the lowest `guard_size` ones
///
/// Returns the lowest usable address (just above the guard page)
pub(crate) fn stack_alloc(total_size: usize, guard_size: usize) -> Option<NonNull<u8>> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total_size,
            MMAP_PROT,
            MMAP_FLAGS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        log::debug!(
            "mmap({}) failed: {:?}",
            total_size,
            std::io::Error::last_os_error()
        );
        return None;
    }
    if unsafe { libc::mprotect(base, guard_size, libc::PROT_NONE) } < 0 {
        log::warn!(
            "mprotect(guard) failed: {:?}",
            std::io::Error::last_os_error()
        );
        unsafe { libc::munmap(base, total_size) };
        return None;
    }
    NonNull::new(unsafe { (base as *mut u8).add(guard_size) })
}

pub(crate) fn stack_dealloc(total_size: usize, guard_size: usize, bottom: NonNull<u8>) {
    let base = unsafe { bottom.as_ptr().sub(guard_size) };
    if unsafe { libc::munmap(base as _, total_size) } < 0 {
        log::warn!(
            "munmap({:?}, {}) failed: {:?}",
            base,
            total_size,
            std::io::Error::last_os_error()
        );
    }
}
