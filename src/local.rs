//! Per-thread default runtime behind free functions
//!
//! The runtime is created by the first call made on a thread; the calling
//! context becomes its main coroutine. It is torn down with the thread's
//! locals.

use std::{borrow::Cow, cell::OnceCell};

use crate::{die, Coroutine, Runtime, Scheduler};

thread_local! {
    static RUNTIME: OnceCell<Runtime> = const { OnceCell::new() };
}

fn with_runtime<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    RUNTIME.with(|runtime| {
        let runtime = runtime.get_or_init(|| {
            Runtime::new().unwrap_or_else(|err| {
                die(&format!("Cannot start the thread coroutine runtime: {}", err))
            })
        });
        f(runtime)
    })
}

/// Spawns `f` as a new coroutine of the thread runtime
pub fn spawn<F>(name: impl Into<Cow<'static, str>>, f: F) -> Coroutine
where
    F: FnOnce() + 'static,
{
    with_runtime(|sched| sched.spawn(name, move |_| f()))
}

/// Yields the thread runtime to its next runnable coroutine
pub fn yield_now() {
    with_runtime(|sched| sched.yield_now())
}

/// Blocks until `co` finished, then reclaims it
pub fn wait(co: Coroutine) {
    with_runtime(|sched| sched.wait(co))
}

/// Name of the running coroutine of the thread runtime
pub fn current_name() -> String {
    with_runtime(|sched| sched.current_name().to_owned())
}
