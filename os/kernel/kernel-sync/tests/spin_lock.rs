use kernel_sync::{IrqGuard, SpinLock, interrupts_enabled};
use std::panic;

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }

    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
    assert!(!l.is_locked());
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn get_mut_and_into_inner() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn contended_increments_are_exact() {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let threads = 4;
    let iters = 2_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| *v += 1);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 123);
}

// Interrupt state is process-global on the host; keep all IF assertions in
// one test so parallel tests cannot interleave with them.
#[test]
fn irq_guards_nest_and_restore() {
    assert!(interrupts_enabled());
    {
        let _outer = IrqGuard::new();
        assert!(!interrupts_enabled());
        {
            let _inner = IrqGuard::new();
            assert!(!interrupts_enabled());
        }
        assert!(!interrupts_enabled(), "inner guard must not re-enable");
    }
    assert!(interrupts_enabled());

    let l = SpinLock::new(5u8);
    {
        let mut g = l.lock_irq();
        *g += 1;
        assert!(!interrupts_enabled());
        assert!(l.is_locked());
    }
    assert!(interrupts_enabled());
    assert_eq!(*l.lock(), 6);
}
