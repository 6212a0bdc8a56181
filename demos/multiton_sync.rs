// One printer per subsystem, created on first use and shared by every thread
// afterwards.
//
// Run with: `cargo run --example multiton_sync`

use keyed_lazy_cache::sync::Cache;
use once_cell::sync::Lazy;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum SubSystem {
    Primary,
    Auxiliary,
    Fallback,
}

#[derive(Debug)]
struct Printer {
    id: usize,
    subsystem: SubSystem,
}

static PRINTERS_CREATED: AtomicUsize = AtomicUsize::new(0);

static PRINTERS: Lazy<Cache<SubSystem, Arc<Printer>>> = Lazy::new(|| {
    Cache::builder()
        .name("printers")
        .initial_capacity(3)
        .segments(1)
        .build()
});

fn printer(subsystem: SubSystem) -> Arc<Printer> {
    PRINTERS.get_with(subsystem, || {
        let id = PRINTERS_CREATED.fetch_add(1, Ordering::AcqRel) + 1;
        println!("Creating printer #{id} for {subsystem:?}");
        Arc::new(Printer { id, subsystem })
    })
}

fn main() {
    let subsystems = [SubSystem::Primary, SubSystem::Auxiliary, SubSystem::Fallback];

    let threads: Vec<_> = (0..12)
        .map(|i| {
            let subsystem = subsystems[i % subsystems.len()];
            thread::spawn(move || printer(subsystem))
        })
        .collect();

    for t in threads {
        let p = t.join().expect("Thread failed");
        println!("Got printer #{} for {:?}", p.id, p.subsystem);
    }

    assert_eq!(PRINTERS_CREATED.load(Ordering::Acquire), 3);
    assert!(Arc::ptr_eq(
        &printer(SubSystem::Primary),
        &printer(SubSystem::Primary)
    ));
    println!("{:?}", *PRINTERS);
}
