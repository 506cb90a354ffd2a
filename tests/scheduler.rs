use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use coro::{Config, Coroutine, Runtime, Scheduler, Status};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[test]
fn round_robin_fairness() {
    const TURNS: usize = 4;
    for n in 1..=5 {
        let rt = Runtime::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let handles: Vec<Coroutine> = (0..n)
            .map(|id| {
                let log = log.clone();
                rt.spawn(format!("rr{id}"), move |sched: &Scheduler| {
                    for _ in 0..TURNS {
                        log.borrow_mut().push(id);
                        sched.yield_now();
                    }
                })
            })
            .collect();
        for co in handles {
            rt.wait(co);
        }
        let expected: Vec<usize> = (0..TURNS).flat_map(|_| 0..n).collect();
        assert_eq!(*log.borrow(), expected, "n = {n}");
        assert_eq!(rt.len(), 1);
    }
}

#[test]
fn single_current_coroutine() {
    let rt = Runtime::new().unwrap();
    let active = Rc::new(Cell::new(0));
    let max_active = Rc::new(Cell::new(0));
    let misnamed = Rc::new(RefCell::new(Vec::new()));
    let handles: Vec<Coroutine> = (0..4)
        .map(|id| {
            let (active, max_active) = (active.clone(), max_active.clone());
            let misnamed = misnamed.clone();
            rt.spawn(format!("body{id}"), move |sched: &Scheduler| {
                for _ in 0..8 {
                    active.set(active.get() + 1);
                    max_active.set(max_active.get().max(active.get()));
                    if sched.current_name() != format!("body{id}") {
                        misnamed.borrow_mut().push(sched.current_name().to_owned());
                    }
                    active.set(active.get() - 1);
                    sched.yield_now();
                }
            })
        })
        .collect();
    for co in handles {
        rt.wait(co);
    }
    assert_eq!(active.get(), 0);
    assert_eq!(max_active.get(), 1);
    assert!(misnamed.borrow().is_empty(), "{:?}", misnamed.borrow());
}

#[test]
fn wait_blocks_until_entry_returns() {
    let rt = Runtime::new().unwrap();
    let counter = Rc::new(Cell::new(0));
    let observed = Rc::new(RefCell::new(Vec::new()));
    let (c, o) = (counter.clone(), observed.clone());
    let a = rt.spawn("A", move |sched: &Scheduler| {
        let inc = c.clone();
        let b = sched.spawn("B", move |_: &Scheduler| inc.set(inc.get() + 1));
        o.borrow_mut().push(c.get());
        sched.wait(b);
        o.borrow_mut().push(c.get());
    });
    rt.wait(a);
    assert_eq!(*observed.borrow(), vec![0, 1]);
    assert_eq!(counter.get(), 1);
    assert_eq!(rt.len(), 1);
}

#[test]
fn wait_on_finished_returns_immediately() {
    let rt = Runtime::new().unwrap();
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    let co = rt.spawn("quick", move |_: &Scheduler| d.set(true));
    // First yield re-picks main, the second one runs `quick` to completion
    rt.yield_now();
    rt.yield_now();
    assert!(done.get());
    assert!(co.is_finished());
    assert_eq!(co.status(), Status::Dead);
    // The corpse is still enqueued until reclaimed
    assert_eq!(rt.len(), 2);
    rt.wait(co);
    assert_eq!(rt.len(), 1);
}

#[test]
fn reclamation_releases_descriptor() {
    let rt = Runtime::new().unwrap();
    let witness = Rc::new(());
    let handles: Vec<Coroutine> = (0..3)
        .map(|id| {
            let w = witness.clone();
            rt.spawn(format!("r{id}"), move |sched: &Scheduler| {
                sched.yield_now();
                drop(w);
            })
        })
        .collect();
    assert_eq!(rt.len(), 4);
    assert_eq!(Rc::strong_count(&witness), 4);
    for (done, co) in handles.into_iter().enumerate() {
        rt.wait(co);
        assert_eq!(rt.len(), 3 - done);
    }
    assert_eq!(Rc::strong_count(&witness), 1);
}

#[test]
fn death_wakes_waiter() {
    let rt = Runtime::new().unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    let e = events.clone();
    let outer = rt.spawn("A", move |sched: &Scheduler| {
        let eb = e.clone();
        let b = sched.spawn("B", move |sched: &Scheduler| {
            for i in 0..3 {
                eb.borrow_mut().push(format!("B{i}"));
                sched.yield_now();
            }
            eb.borrow_mut().push("B done".to_owned());
        });
        e.borrow_mut().push("A waits".to_owned());
        sched.wait(b);
        e.borrow_mut().push(format!("A woke {}", sched.current_status()));
    });
    rt.wait(outer);
    assert_eq!(
        *events.borrow(),
        vec!["A waits", "B0", "B1", "B2", "B done", "A woke CO_RUNNING"]
    );
}

#[test]
fn stacks_are_isolated() {
    const WORDS: usize = 1024;
    let rt = Runtime::new().unwrap();
    let corrupted = Rc::new(Cell::new(0usize));
    let handles: Vec<Coroutine> = (0..2u64)
        .map(|seed| {
            let corrupted = corrupted.clone();
            rt.spawn(format!("pattern{seed}"), move |sched: &Scheduler| {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut pattern = [0u64; WORDS];
                for word in pattern.iter_mut() {
                    *word = rng.gen();
                }
                let expected = pattern;
                for _ in 0..5 {
                    sched.yield_now();
                    let seen = std::hint::black_box(&pattern);
                    if seen[..] != expected[..] {
                        corrupted.set(corrupted.get() + 1);
                    }
                    std::hint::black_box(&mut pattern);
                }
            })
        })
        .collect();
    for co in handles {
        rt.wait(co);
    }
    assert_eq!(corrupted.get(), 0);
}

#[test]
fn lone_coroutine_resumes_itself() {
    let rt = Runtime::new().unwrap();
    let resumed_as = Rc::new(RefCell::new(Vec::new()));
    let r = resumed_as.clone();
    let solo = rt.spawn("solo", move |sched: &Scheduler| {
        for _ in 0..10 {
            sched.yield_now();
            r.borrow_mut().push(sched.current_name().to_owned());
        }
    });
    rt.wait(solo);
    assert_eq!(*resumed_as.borrow(), vec!["solo"; 10]);
}

#[test]
fn try_spawn_reports_exhaustion() {
    let rt = Runtime::with_config(Config::default().capacity(3)).unwrap();
    let a = rt.try_spawn("a", |_: &Scheduler| {}).unwrap();
    let b = rt.try_spawn("b", |_: &Scheduler| {}).unwrap();
    let err = rt.try_spawn("c", |_: &Scheduler| {}).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::OutOfMemory);
    rt.wait(a);
    rt.wait(b);
    assert_eq!(rt.len(), 1);
}

#[test]
fn oversized_stack_is_rejected() {
    let rt = Runtime::with_config(Config::default().stack_size(usize::MAX)).unwrap();
    let ran = Rc::new(Cell::new(false));
    let r = ran.clone();
    let err = rt
        .try_spawn("huge", move |_: &Scheduler| r.set(true))
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::OutOfMemory);
    // Nothing was enqueued: the runtime keeps working
    assert_eq!(rt.len(), 1);
    rt.yield_now();
    assert!(!ran.get());
    assert!(rt.is_main());
}

#[test]
fn custom_stack_size() {
    const WORDS: usize = 48 * 1024;
    let rt = Runtime::with_config(Config::default().stack_size(1024 * 1024)).unwrap();
    let sum = Rc::new(Cell::new(0u64));
    let s = sum.clone();
    let big = rt.spawn("big", move |sched: &Scheduler| {
        let mut buffer = [1u64; WORDS];
        std::hint::black_box(&mut buffer);
        sched.yield_now();
        s.set(buffer.iter().sum());
    });
    rt.wait(big);
    assert_eq!(sum.get(), WORDS as u64);
}

#[test]
fn teardown_releases_leftovers() {
    let unstarted = Rc::new(());
    let finished = Rc::new(Cell::new(false));
    {
        let rt = Runtime::new().unwrap();
        let f = finished.clone();
        // Detached: never waited on, its corpse stays until teardown
        drop(rt.spawn("detached", move |_: &Scheduler| f.set(true)));

        let suspended = rt.spawn("suspended", |sched: &Scheduler| loop {
            sched.yield_now();
        });

        rt.yield_now();
        rt.yield_now();
        assert!(finished.get());
        assert_eq!(suspended.status(), Status::Running);

        let u = unstarted.clone();
        let idle = rt.spawn("idle", move |_: &Scheduler| drop(u));
        assert_eq!(rt.len(), 4);

        // Handles may outlive the runtime
        drop(rt);
        assert_eq!(idle.status(), Status::New);
        assert_eq!(Rc::strong_count(&unstarted), 2);
        drop(idle);
        drop(suspended);
    }
    assert_eq!(Rc::strong_count(&unstarted), 1);
}

#[test]
fn independent_runtimes() {
    let first = Runtime::new().unwrap();
    let second = Runtime::new().unwrap();
    let hits = Rc::new(Cell::new(0));
    let (h1, h2) = (hits.clone(), hits.clone());
    let a = first.spawn("first", move |_: &Scheduler| h1.set(h1.get() + 1));
    let b = second.spawn("second", move |_: &Scheduler| h2.set(h2.get() + 10));
    second.wait(b);
    assert_eq!(hits.get(), 10);
    first.wait(a);
    assert_eq!(hits.get(), 11);
}
