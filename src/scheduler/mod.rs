//! Round-robin scheduler of stackful coroutines sharing one thread

mod coroutine;
pub use coroutine::{Coroutine, Status};

use std::{
    borrow::Cow,
    cell::{Cell, UnsafeCell},
    io::{Error, ErrorKind, Result},
    ops::Deref,
    ptr::NonNull,
};

use coroutine::{CoFlags, CoInner};
use ucontext::{Context, Stack};

use crate::{die, Config, PhantomUnsend, PhantomUnsync, ReadyList};

/// Scheduler state shared by every coroutine of a [`Runtime`]
///
/// Coroutine entries receive a `&Scheduler` to spawn, yield and wait.
pub struct Scheduler {
    config: Config,
    current: Cell<NonNull<CoInner>>,
    main: Cell<NonNull<CoInner>>,
    ready: UnsafeCell<ReadyList<NonNull<CoInner>>>,
    _unsync: PhantomUnsync,
    _unsend: PhantomUnsend,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ready = self.with_ready(|ready| {
            ready
                .iter()
                .map(|co| {
                    let co = unsafe { co.as_ref() };
                    format!("{}:{}", co.name(), co.status())
                })
                .collect::<Vec<_>>()
        });
        f.debug_struct("Scheduler")
            .field("current", &self.current_name())
            .field("ready", &ready)
            .finish()
    }
}

impl Scheduler {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of coroutines not reclaimed yet, the main one included
    pub fn len(&self) -> usize {
        self.with_ready(|ready| ready.len())
    }

    /// Name of the coroutine calling this method
    pub fn current_name(&self) -> &str {
        unsafe { self.current.get().as_ref() }.name()
    }

    /// Status of the coroutine calling this method
    pub fn current_status(&self) -> Status {
        unsafe { self.current.get().as_ref() }.status()
    }

    /// `true` when called from the coroutine standing for the thread's own stack
    pub fn is_main(&self) -> bool {
        self.current.get() == self.main.get()
    }

    #[inline(always)]
    fn with_ready<R>(&self, f: impl FnOnce(&mut ReadyList<NonNull<CoInner>>) -> R) -> R {
        // Never held across a context switch
        f(unsafe { &mut *self.ready.get() })
    }

    /// Spawns a coroutine running `f` on its own stack, aborting when out of resources
    pub fn spawn<F>(&self, name: impl Into<Cow<'static, str>>, f: F) -> Coroutine
    where
        F: FnOnce(&Scheduler) + 'static,
    {
        let name = name.into();
        match self.try_spawn(name.clone(), f) {
            Ok(co) => co,
            Err(err) => die(&format!("Cannot spawn co[{}]: {}", name, err)),
        }
    }

    /// Spawns a coroutine running `f` on its own stack
    ///
    /// The coroutine is enqueued `New`; `f` runs at its first dispatch.
    ///
    /// # Errors
    /// `ErrorKind::OutOfMemory` when the ready list is full or the descriptor
    /// or its stack cannot be allocated.
    pub fn try_spawn<F>(&self, name: impl Into<Cow<'static, str>>, f: F) -> Result<Coroutine>
    where
        F: FnOnce(&Scheduler) + 'static,
    {
        if self.with_ready(|ready| ready.is_full()) {
            return Err(Error::new(ErrorKind::OutOfMemory, "ready list is full"));
        }
        let stack = Stack::with_size(self.config.stack_size).ok_or_else(|| {
            Error::new(ErrorKind::OutOfMemory, "cannot allocate a coroutine stack")
        })?;
        let inner = CoInner::new(name.into(), f, stack, NonNull::from(self))
            .ok_or_else(|| Error::from(ErrorKind::OutOfMemory))?;
        if let Err(inner) = self.with_ready(|ready| ready.push_back(inner)) {
            unsafe { CoInner::destroy(inner) };
            return Err(Error::new(ErrorKind::OutOfMemory, "ready list is full"));
        }
        let co = Coroutine::new(inner);
        log::trace!("insert co[{}] status: {}", co.name(), co.status());
        Ok(co)
    }

    /// Hands the thread over to the next runnable coroutine
    ///
    /// Returns when the round-robin gets back to the caller.
    pub fn yield_now(&self) {
        let prev = self.current.get();
        let next = self.pick_next();
        self.current.set(next);
        if next == prev {
            log::trace!("co[{}] resumes itself", unsafe { prev.as_ref() }.name());
            return;
        }
        let (prev_co, next_co) = unsafe { (prev.as_ref(), next.as_ref()) };
        match next_co.status() {
            Status::Running => {
                log::trace!("switch co[{}] => co[{}]", prev_co.name(), next_co.name());
                unsafe { Context::swap(prev_co.context(), next_co.context()) };
            }
            Status::New => {
                next_co.set_status(Status::Running);
                log::trace!("co[{}] start run", next_co.name());
                unsafe {
                    Context::launch(
                        prev_co.context(),
                        next_co.context(),
                        next_co.stack(),
                        next_co.start_cb(),
                        next.as_ptr() as *mut (),
                    )
                };
            }
            status => die(&format!(
                "Cannot dispatch co[{}] in status {}",
                next_co.name(),
                status
            )),
        }
        // Resumed by a later dispatch
        debug_assert!(self.current.get() == prev);
        log::trace!("co[{}] continue run", prev_co.name());
    }

    /// Blocks until `co` finished, then frees its descriptor and stack
    ///
    /// Returns immediately (after reclamation) when `co` already finished.
    pub fn wait(&self, co: Coroutine) {
        let target = co.into_inner();
        let current = self.current.get();
        let target_co = unsafe { target.as_ref() };
        if target_co.sched() != NonNull::from(self) {
            die(&format!(
                "co[{}] belongs to another runtime",
                target_co.name()
            ));
        }
        if target == current {
            die(&format!("co[{}] cannot wait on itself", target_co.name()));
        }
        if target_co.status() != Status::Dead {
            if target_co.waiter().is_some() {
                die(&format!("co[{}] already has a waiter", target_co.name()));
            }
            let current_co = unsafe { current.as_ref() };
            target_co.set_waiter(current);
            current_co.set_status(Status::Waiting);
            log::trace!("co[{}] waits on co[{}]", current_co.name(), target_co.name());
            self.yield_now();
        }
        debug_assert_eq!(target_co.status(), Status::Dead);
        self.reclaim(target);
    }

    /// Called by the entry trampoline once the entry of the current coroutine returned
    pub(crate) fn exit_current(&self) -> ! {
        let current_co = unsafe { self.current.get().as_ref() };
        current_co.set_status(Status::Dead);
        log::trace!("co[{}] run over", current_co.name());
        if let Some(waiter) = current_co.waiter() {
            let waiter = unsafe { waiter.as_ref() };
            waiter.set_status(Status::Running);
            log::trace!("co[{}] wakes co[{}]", current_co.name(), waiter.name());
        }
        self.yield_now();
        die(&format!("Dead co[{}] was resumed", current_co.name()));
    }

    /// Rotates the ready list until a `New` or `Running` coroutine reaches its front
    fn pick_next(&self) -> NonNull<CoInner> {
        loop {
            if let Some(next) = self.scan() {
                return next;
            }
            if self.config.detect_deadlock {
                die(&format!(
                    "Deadlock: no runnable coroutine among {}",
                    self.len()
                ));
            }
        }
    }

    /// One full pass over the ready list
    ///
    /// The chosen coroutine is pushed back at the tail like the skipped ones.
    fn scan(&self) -> Option<NonNull<CoInner>> {
        self.with_ready(|ready| {
            for _ in 0..ready.len() {
                let co = ready.pop_front()?;
                let pushed = ready.push_back(co);
                debug_assert!(pushed.is_ok());
                let inner = unsafe { co.as_ref() };
                match inner.status() {
                    Status::New | Status::Running => {
                        log::trace!("chose co[{}] status: {}", inner.name(), inner.status());
                        return Some(co);
                    }
                    status => log::trace!("skip co[{}] status: {}", inner.name(), status),
                }
            }
            None
        })
    }

    /// Removes the finished `target` from the ready list and frees it
    fn reclaim(&self, target: NonNull<CoInner>) {
        let found = self.with_ready(|ready| {
            for _ in 0..ready.len() {
                match ready.pop_front() {
                    Some(co) if co == target => return true,
                    Some(co) => {
                        let pushed = ready.push_back(co);
                        debug_assert!(pushed.is_ok());
                    }
                    None => break,
                }
            }
            false
        });
        let target_co = unsafe { target.as_ref() };
        if !found {
            die(&format!(
                "co[{}] is not in the ready list",
                target_co.name()
            ));
        }
        log::trace!(
            "wait release co[{}] status: {}",
            target_co.name(),
            target_co.status()
        );
        unsafe { CoInner::destroy(target) };
    }

    /// Releases every descriptor left in the ready list, without running them
    fn teardown(&self) {
        while let Some(co) = self.with_ready(|ready| ready.pop_front()) {
            let inner = unsafe { co.as_ref() };
            log::debug!("release co[{}] status: {}", inner.name(), inner.status());
            debug_assert!(
                inner.flags().contains(CoFlags::ROOT) == (co == self.main.get())
            );
            unsafe { CoInner::release(co) };
        }
    }
}

/// An independent coroutine runtime bound to the thread and stack creating it
///
/// The creating context becomes the "main" coroutine. Dropping the runtime
/// releases every coroutine that was not reclaimed by `wait`, without running
/// any more of their code; it must happen on the main coroutine.
pub struct Runtime {
    sched: NonNull<Scheduler>,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self> {
        let ready = ReadyList::with_capacity(config.capacity)?;
        let sched = NonNull::from(Box::leak(Box::new(Scheduler {
            config,
            current: Cell::new(NonNull::dangling()),
            main: Cell::new(NonNull::dangling()),
            ready: UnsafeCell::new(ready),
            _unsync: PhantomUnsync {},
            _unsend: PhantomUnsend {},
        })));
        let Some(main) = CoInner::new_root(sched) else {
            drop(unsafe { Box::from_raw(sched.as_ptr()) });
            return Err(Error::from(ErrorKind::OutOfMemory));
        };
        let thiz = unsafe { sched.as_ref() };
        // Capacity is at least 1
        let pushed = thiz.with_ready(|ready| ready.push_back(main));
        debug_assert!(pushed.is_ok());
        thiz.current.set(main);
        thiz.main.set(main);
        log::debug!(
            "runtime started: stack_size={}, capacity={}",
            config.stack_size,
            config.capacity
        );
        Ok(Self { sched })
    }
}

impl Deref for Runtime {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        unsafe { self.sched.as_ref() }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let sched = unsafe { self.sched.as_ref() };
        if !sched.is_main() {
            die(&format!(
                "Runtime dropped from co[{}] instead of its main coroutine",
                sched.current_name()
            ));
        }
        log::debug!("runtime teardown: {} coroutine(s) left", sched.len());
        sched.teardown();
        drop(unsafe { Box::from_raw(self.sched.as_ptr()) });
    }
}
