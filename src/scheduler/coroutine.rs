use std::{
    alloc::Layout,
    borrow::Cow,
    cell::{Cell, UnsafeCell},
    mem::{ManuallyDrop, MaybeUninit},
    panic::AssertUnwindSafe,
    ptr::NonNull,
};

use bitflags::bitflags;
use ucontext::{Context, StartCb, Stack};

use super::Scheduler;
use crate::die;

/// Coroutine state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Spawned, never dispatched
    New = 1,
    /// Dispatched at least once; either executing or suspended in `yield_now`
    Running,
    /// Blocked in `wait` on an unfinished coroutine
    Waiting,
    /// Entry returned, resources not reclaimed yet
    Dead,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::New => "CO_NEW",
            Status::Running => "CO_RUNNING",
            Status::Waiting => "CO_WAITING",
            Status::Dead => "CO_DEAD",
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CoFlags: u8 {
        /// The coroutine standing for the thread's own stack
        const ROOT = 1 << 0;
        /// The entry closure has been moved out by the trampoline
        const ENTRY_TAKEN = 1 << 1;
        /// A `Coroutine` handle refers to the descriptor
        const HANDLE = 1 << 2;
        /// The runtime is gone, the handle owns the descriptor
        const ORPHANED = 1 << 3;
    }
}

type DropErasedCb = unsafe fn(thiz: *mut CoInner);

struct VTable {
    start: StartCb,
    drop_erased: DropErasedCb,
    layout: Layout,
}

/// Type-erased coroutine descriptor
///
/// Always the first field of a `CoBox<F>` (or alone for the root coroutine);
/// only ever accessed through shared references, every mutable part being a
/// `Cell`.
#[repr(C)]
pub(crate) struct CoInner {
    vtable: &'static VTable,
    flags: Cell<CoFlags>,
    status: Cell<Status>,
    waiter: Cell<Option<NonNull<CoInner>>>,
    context: UnsafeCell<Context>,
    stack: Stack,
    name: Cow<'static, str>,
    sched: NonNull<Scheduler>,
}

impl CoInner {
    const ROOT_VTABLE: VTable = VTable {
        start: Self::root_start,
        drop_erased: Self::root_drop_erased,
        layout: Layout::new::<Self>(),
    };

    /// Allocates the descriptor of the coroutine already running on the current stack
    pub(crate) fn new_root(sched: NonNull<Scheduler>) -> Option<NonNull<CoInner>> {
        let thiz = unsafe { std::alloc::alloc(Self::ROOT_VTABLE.layout) } as *mut Self;
        let thiz = NonNull::new(thiz)?;
        unsafe {
            thiz.as_ptr().write(Self {
                vtable: &Self::ROOT_VTABLE,
                flags: Cell::new(CoFlags::ROOT),
                status: Cell::new(Status::Running),
                waiter: Cell::new(None),
                context: UnsafeCell::new(Context::new()),
                stack: Stack::root(),
                name: Cow::Borrowed("main"),
                sched,
            })
        };
        Some(thiz)
    }

    /// Allocates a `New` coroutine running `f` on `stack`
    pub(crate) fn new<F>(
        name: Cow<'static, str>,
        f: F,
        stack: Stack,
        sched: NonNull<Scheduler>,
    ) -> Option<NonNull<CoInner>>
    where
        F: FnOnce(&Scheduler) + 'static,
    {
        CoBox::make(name, f, stack, sched)
    }

    /// Releases the descriptor, its stack and the entry closure if it never ran
    ///
    /// # Safety
    /// `thiz` must come from `new`/`new_root`, must not be referenced by any
    /// ready list anymore, and no context may run on its stack.
    pub(crate) unsafe fn destroy(thiz: NonNull<CoInner>) {
        unsafe {
            let vtable = thiz.as_ref().vtable;
            (vtable.drop_erased)(thiz.as_ptr());
            std::ptr::drop_in_place(thiz.as_ptr());
            std::alloc::dealloc(thiz.as_ptr() as *mut u8, vtable.layout);
        }
    }

    #[inline(always)]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub(crate) fn status(&self) -> Status {
        self.status.get()
    }

    #[inline(always)]
    pub(crate) fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    #[inline(always)]
    pub(crate) fn waiter(&self) -> Option<NonNull<CoInner>> {
        self.waiter.get()
    }

    #[inline(always)]
    pub(crate) fn set_waiter(&self, waiter: NonNull<CoInner>) {
        self.waiter.set(Some(waiter));
    }

    #[inline(always)]
    pub(crate) fn flags(&self) -> CoFlags {
        self.flags.get()
    }

    #[inline(always)]
    fn insert_flags(&self, flags: CoFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    #[inline(always)]
    fn remove_flags(&self, flags: CoFlags) {
        self.flags.set(self.flags.get() - flags);
    }

    #[inline(always)]
    pub(crate) fn sched(&self) -> NonNull<Scheduler> {
        self.sched
    }

    #[inline(always)]
    pub(crate) fn context(&self) -> *mut Context {
        self.context.get()
    }

    #[inline(always)]
    pub(crate) fn stack(&self) -> &Stack {
        &self.stack
    }

    #[inline(always)]
    pub(crate) fn start_cb(&self) -> StartCb {
        self.vtable.start
    }

    /// Called by the runtime teardown for every descriptor left in its ready list
    ///
    /// # Safety
    /// Same as [`CoInner::destroy`].
    pub(crate) unsafe fn release(thiz: NonNull<CoInner>) {
        let inner = unsafe { thiz.as_ref() };
        if inner.flags().contains(CoFlags::HANDLE) {
            inner.insert_flags(CoFlags::ORPHANED);
        } else {
            unsafe { Self::destroy(thiz) };
        }
    }

    unsafe extern "C" fn root_start(_: *mut ()) -> ! {
        die("The main coroutine cannot be launched");
    }
    unsafe fn root_drop_erased(_: *mut CoInner) {}
}

#[repr(C)]
struct CoBox<F: FnOnce(&Scheduler) + 'static> {
    as_inner: CoInner,
    f: UnsafeCell<MaybeUninit<F>>,
}

impl<F: FnOnce(&Scheduler) + 'static> CoBox<F> {
    const VTABLE: VTable = VTable {
        start: Self::start,
        drop_erased: Self::drop_erased,
        layout: Layout::new::<Self>(),
    };

    fn make(
        name: Cow<'static, str>,
        f: F,
        stack: Stack,
        sched: NonNull<Scheduler>,
    ) -> Option<NonNull<CoInner>> {
        let thiz = unsafe { std::alloc::alloc(Self::VTABLE.layout) } as *mut Self;
        let thiz = NonNull::new(thiz)?;
        unsafe {
            thiz.as_ptr().write(Self {
                as_inner: CoInner {
                    vtable: &Self::VTABLE,
                    flags: Cell::new(CoFlags::empty()),
                    status: Cell::new(Status::New),
                    waiter: Cell::new(None),
                    context: UnsafeCell::new(Context::new()),
                    stack,
                    name,
                    sched,
                },
                f: UnsafeCell::new(MaybeUninit::new(f)),
            })
        };
        Some(thiz.cast::<CoInner>())
    }

    unsafe fn drop_erased(thiz: *mut CoInner) {
        let thiz = thiz as *mut Self;
        unsafe {
            if !(*thiz).as_inner.flags().contains(CoFlags::ENTRY_TAKEN) {
                (*(*thiz).f.get()).assume_init_drop();
            }
        }
    }

    /// Trampoline executed on the coroutine's own stack
    unsafe extern "C" fn start(arg: *mut ()) -> ! {
        let thiz = arg as *mut Self;
        let (inner, f) = unsafe {
            let inner = &(*thiz).as_inner;
            inner.insert_flags(CoFlags::ENTRY_TAKEN);
            (inner, (*(*thiz).f.get()).assume_init_read())
        };
        let sched = unsafe { inner.sched.as_ref() };
        // Unwinding cannot cross the stack switch
        if std::panic::catch_unwind(AssertUnwindSafe(|| f(sched))).is_err() {
            die(&format!("Coroutine '{}' panicked", inner.name()));
        }
        sched.exit_current()
    }
}

/// Handle on a spawned coroutine
///
/// Not `Clone`: [`Scheduler::wait`] consumes it, so a coroutine has at most one
/// waiter and is reclaimed at most once. Dropping the handle detaches the
/// coroutine; it then stays in the ready list until the runtime is dropped.
pub struct Coroutine {
    inner: NonNull<CoInner>,
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        let inner = unsafe { self.inner.as_ref() };
        if inner.flags().contains(CoFlags::ORPHANED) {
            unsafe { CoInner::destroy(self.inner) };
        } else {
            inner.remove_flags(CoFlags::HANDLE);
        }
    }
}

impl Coroutine {
    pub(crate) fn new(inner: NonNull<CoInner>) -> Self {
        unsafe { inner.as_ref() }.insert_flags(CoFlags::HANDLE);
        Self { inner }
    }

    /// Gives up the handle without detaching the descriptor
    pub(crate) fn into_inner(self) -> NonNull<CoInner> {
        ManuallyDrop::new(self).inner
    }

    #[cfg(test)]
    pub(crate) fn inner_for_test(&self) -> NonNull<CoInner> {
        self.inner
    }

    #[inline(always)]
    fn inner(&self) -> &CoInner {
        unsafe { self.inner.as_ref() }
    }

    pub fn name(&self) -> &str {
        self.inner().name()
    }

    pub fn status(&self) -> Status {
        self.inner().status()
    }

    /// `true` once the entry returned
    pub fn is_finished(&self) -> bool {
        self.status() == Status::Dead
    }
}
