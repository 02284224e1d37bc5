//! Runtime locks shared by OS threads
use kport::{tls::ZeroInitRuntime, PortCfg, PortOptions};
use kport_std::{SimKernel, StdPort};
use std::{
    alloc::Layout,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

fn boot() -> (&'static SimKernel, &'static StdPort<ZeroInitRuntime>) {
    let cfg = PortCfg::new(PortOptions::DEFAULT).unwrap();
    kport_std::boot(cfg, ZeroInitRuntime(Layout::new::<u32>())).unwrap()
}

#[test]
fn acquire_blocks_until_release() {
    let (kernel, port) = boot();
    kernel.start();
    let locks = port.subsystem();
    let l = locks.lock_create();
    assert!(l.is_some());

    locks.lock_acquire(l);

    let acquired = &*Box::leak(Box::new(AtomicBool::new(false)));
    let (send, recv) = mpsc::channel();
    let waiter = thread::spawn(move || {
        send.send(()).unwrap();
        locks.lock_acquire(l);
        acquired.store(true, Ordering::SeqCst);
        locks.lock_release(l);
    });

    recv.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(!acquired.load(Ordering::SeqCst));

    locks.lock_release(l);
    waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}

#[test]
fn mutual_exclusion() {
    const NUM_THREADS: usize = 4;
    const NUM_ITERATIONS: usize = 200;

    let (kernel, port) = boot();
    kernel.start();
    let locks = port.subsystem();
    let l = locks.lock_create();

    let inside = &*Box::leak(Box::new(AtomicUsize::new(0)));
    let total = &*Box::leak(Box::new(AtomicUsize::new(0)));

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            thread::spawn(move || {
                for _ in 0..NUM_ITERATIONS {
                    locks.lock_acquire(l);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    total.fetch_add(1, Ordering::Relaxed);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    locks.lock_release(l);
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(total.load(Ordering::Relaxed), NUM_THREADS * NUM_ITERATIONS);
    assert!(!kernel.in_critical());
}

#[test]
fn no_op_before_start() {
    let (kernel, port) = boot();
    let locks = port.subsystem();
    let l = locks.lock_create();

    // Would deadlock if these pended on the semaphore
    locks.lock_acquire(l);
    locks.lock_acquire(l);
    locks.lock_release(l);

    kernel.start();
    locks.lock_acquire(l);
    locks.lock_release(l);
}

#[test]
fn concurrent_create_destroy() {
    let (kernel, port) = boot();
    let locks = port.subsystem();
    let capacity = kernel.cfg().lock_pool_capacity();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(move || {
                for _ in 0..100 {
                    if let Some(l) = locks.lock_create() {
                        locks.lock_destroy(l);
                    }
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(locks.lock_free_count(), capacity);
    assert_eq!(kernel.live_semaphore_count(), 0);
}
