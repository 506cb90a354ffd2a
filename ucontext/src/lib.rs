//! Minimal execution-context layer for stackful coroutines.
//!
//! Two primitives, everything else being architecture independent:
//!  * [`Context::swap`] captures the running context and resumes another one;
//!  * [`Context::launch`] installs a fresh [`Stack`] and transfers control to a
//!    start callback on it, one way.

mod sys;

pub use sys::Stack;

/// Entry point of a launched context
///
/// It receives the `start_arg` given to [`Context::launch`] and must never
/// return: it leaves by swapping to another context.
pub type StartCb = unsafe extern "C" fn(start_arg: *mut ()) -> !;

/// A saved execution context
///
/// Only the stack pointer is stored here; the callee-saved registers are
/// spilled on the suspended stack itself.
#[repr(transparent)]
pub struct Context {
    stack_pointer: *mut (),
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Context({:?})", self.stack_pointer))
    }
}

impl Context {
    /// Returns an empty context, filled by the first [`Context::swap`] away from it
    pub const fn new() -> Self {
        Self {
            stack_pointer: std::ptr::null_mut(),
        }
    }

    /// `true` once a context has been captured (or prepared) in `self`
    #[inline(always)]
    pub fn is_captured(&self) -> bool {
        !self.stack_pointer.is_null()
    }

    /// Captures the running context into `from` and resumes `to`
    ///
    /// Returns when another context resumes `from`, with the caller's stack and
    /// locals intact.
    ///
    /// # Safety
    ///  * `from` and `to` must be distinct and valid for the whole suspension;
    ///  * `to` must hold a context captured by `swap` or prepared by `launch`
    ///    whose stack is still alive;
    ///  * a captured context must be resumed at most once.
    #[inline(always)]
    pub unsafe fn swap(from: *mut Self, to: *const Self) {
        debug_assert!(!std::ptr::eq(from, to));
        unsafe {
            debug_assert!((*to).is_captured());
            sys::asm::swap(&raw mut (*from).stack_pointer, (*to).stack_pointer);
        }
    }

    /// Captures the running context into `from`, prepares `to` on `stack` and
    /// calls `start_cb(start_arg)` there
    ///
    /// The launched code never unwinds back into the caller's frame: the call
    /// only returns when some context later resumes `from`.
    ///
    /// # Safety
    /// Same as [`Context::swap`]; additionally `stack` must outlive every
    /// resumption of `to` and must not be used by any other context.
    pub unsafe fn launch(
        from: *mut Self,
        to: *mut Self,
        stack: &Stack,
        start_cb: StartCb,
        start_arg: *mut (),
    ) {
        if stack.is_root() {
            die("Cannot launch a context on the root stack");
        }
        unsafe {
            (*to).stack_pointer = sys::asm::setup(stack.top(), start_cb, start_arg);
            Self::swap(from, to);
        }
    }
}

pub(crate) fn die(message: &str) -> ! {
    log::error!("{}, aborting.", message);
    eprintln!("{}, aborting.", message);
    std::process::abort();
}
