#![cfg(all(test, feature = "sync"))]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use keyed_lazy_cache::sync::{Cache, Singleton};
use once_cell::sync::Lazy;

const NUM_CALLERS: usize = 1000;

static CREATED: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct Printer {
    serial: usize,
}

static PRINTER: Lazy<Singleton<Arc<Printer>>> = Lazy::new(|| {
    Singleton::new(|| {
        let serial = CREATED.fetch_add(1, Ordering::AcqRel) + 1;
        Arc::new(Printer { serial })
    })
});

#[test]
fn thousand_callers_one_instance() {
    let barrier = Arc::new(std::sync::Barrier::new(NUM_CALLERS));

    let threads: Vec<_> = (0..NUM_CALLERS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                PRINTER.get()
            })
        })
        .collect();

    let printers = threads
        .into_iter()
        .map(|t| t.join().expect("Thread failed"))
        .collect::<Vec<_>>();

    assert_eq!(CREATED.load(Ordering::Acquire), 1);
    assert!(printers.iter().all(|p| Arc::ptr_eq(p, &printers[0])));
    assert_eq!(printers[0].serial, 1);
}

#[test]
fn unit_keyed_cache_is_a_singleton() {
    let cache: Cache<(), Arc<usize>> = Cache::builder().segments(1).build();
    let counter = Arc::new(AtomicUsize::default());

    let threads: Vec<_> = (0..64)
        .map(|_| {
            let cache = cache.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                cache.get_with((), || Arc::new(counter.fetch_add(1, Ordering::AcqRel)))
            })
        })
        .collect();

    let values = threads
        .into_iter()
        .map(|t| t.join().expect("Thread failed"))
        .collect::<Vec<_>>();

    assert_eq!(counter.load(Ordering::Acquire), 1);
    assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    assert_eq!(cache.num_segments(), 1);
}
