extern crate page_size;

cfg_if::cfg_if! {
    if #[cfg(target_family = "unix")] {
        mod unix;
        pub(crate) use unix::*;
    } else {
        compile_error!("ucontext only supports unix targets");
    }
}

use std::{ops::Range, ptr::NonNull};

#[cfg(feature = "valgrind")]
use crabgrind as cg;

struct ValgrindStackId {
    #[cfg(feature = "valgrind")]
    id: usize,
}

impl ValgrindStackId {
    #[cfg(feature = "valgrind")]
    const INVALID: usize = usize::MAX;

    const fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "valgrind")] {
                Self { id: Self::INVALID }
            } else {
                Self {}
            }
        }
    }

    fn register(&mut self, _bottom: *mut libc::c_void, _top: *mut libc::c_void) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "valgrind")] {
                debug_assert!(self.id == Self::INVALID);
                self.id = if cg::run_mode() != cg::RunMode::Native {
                    cg::memcheck::stack::register(_bottom, _top)
                } else {
                    Self::INVALID
                }
            }
        }
    }

    fn deregister(&mut self) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "valgrind")] {
                if self.id != Self::INVALID {
                    cg::memcheck::stack::deregister(self.id);
                    self.id = Self::INVALID;
                }
            }
        }
    }

    #[inline]
    fn is_registered(&self) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(feature = "valgrind")] {
                self.id != Self::INVALID
            } else {
                false
            }
        }
    }
}

/// A coroutine stack
///
/// The usable region is `[bottom, top)`; one inaccessible guard page sits right
/// below `bottom` so that an overflow faults instead of silently overwriting
/// whatever is mapped next to it.
pub struct Stack {
    /// The total size of the mapping (including the guard page)
    total_size: usize,
    /// The lowest usable address, or null for the root stack
    bottom: *mut u8,
    /// The valgrind stack identifier (When built with the `valgrind` feature)
    valgrind_stack_id: ValgrindStackId,
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Some(bottom) = NonNull::new(self.bottom) {
            self.valgrind_stack_id.deregister();
            stack_dealloc(self.total_size, Self::guard_size(), bottom);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            f.write_str("Stack(root)")
        } else {
            f.debug_struct("Stack")
                .field("bottom", &self.bottom())
                .field("top", &self.top())
                .finish()
        }
    }
}

impl Stack {
    /// Usable size of a coroutine stack when none is configured
    pub const DEFAULT_SIZE: usize = 64 * 1024;

    /// Returns the system page allocation granularity
    #[inline(always)]
    pub fn page_size() -> usize {
        page_size::get_granularity()
    }

    /// Returns the guard size
    #[inline(always)]
    pub fn guard_size() -> usize {
        page_size::get_granularity()
    }

    /// Rounds `size_hint` up to a whole, non-zero number of pages
    ///
    /// Returns `None` if the rounded size does not fit in `usize`
    #[inline]
    pub fn round_to_pages(size_hint: usize) -> Option<usize> {
        let page_align_mask = Self::page_size() - 1;
        Some(size_hint.max(1).checked_add(page_align_mask)? & !page_align_mask)
    }

    #[inline(always)]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Returns the usable size (0 for the root stack)
    #[inline(always)]
    pub fn size(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.total_size - Self::guard_size()
        }
    }

    #[inline(always)]
    pub fn bottom(&self) -> *mut u8 {
        self.bottom
    }

    #[inline(always)]
    pub fn top(&self) -> *mut u8 {
        self.bottom.wrapping_add(self.size())
    }

    /// `true` for the stack the thread was started on, which this type does not own
    #[inline(always)]
    pub fn is_root(&self) -> bool {
        self.bottom.is_null()
    }

    #[inline(always)]
    pub fn is_registered(&self) -> bool {
        self.valgrind_stack_id.is_registered()
    }

    /// Returns `true` if `addr` lies in the usable region
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        !self.is_root() && addr >= self.bottom as usize && addr < self.top() as usize
    }

    pub fn guard_range(&self) -> Range<usize> {
        if self.is_root() {
            Range { start: 0, end: 0 }
        } else {
            let guard = self.bottom as usize - Self::guard_size();
            Range {
                start: guard,
                end: guard + Self::guard_size(),
            }
        }
    }

    /// Returns the placeholder for the thread's own stack
    pub const fn root() -> Self {
        Self {
            total_size: 0,
            bottom: std::ptr::null_mut(),
            valgrind_stack_id: ValgrindStackId::default(),
        }
    }

    /// Maps a new stack of at least `size_hint` usable bytes
    ///
    /// # Returns
    ///  * `Some(stack)` on success
    ///  * `None` when the system is out of memory or `size_hint` is too large
    ///    to be mapped
    pub fn with_size(size_hint: usize) -> Option<Self> {
        let guard_size = Self::guard_size();
        let total_size = Self::round_to_pages(size_hint)?.checked_add(guard_size)?;
        let bottom = stack_alloc(total_size, guard_size)?;
        let mut stack = Self {
            total_size,
            bottom: bottom.as_ptr(),
            valgrind_stack_id: ValgrindStackId::default(),
        };
        stack
            .valgrind_stack_id
            .register(stack.bottom() as _, stack.top() as _);
        Some(stack)
    }

    /// Maps a new stack with the default size
    pub fn new() -> Option<Self> {
        Self::with_size(Self::DEFAULT_SIZE)
    }
}
