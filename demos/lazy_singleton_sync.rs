// A process-wide singleton created lazily by the first caller, and another one
// created eagerly. Many threads race for the lazy one; it is built only once.
//
// Run with: `cargo run --example lazy_singleton_sync`

use keyed_lazy_cache::sync::{Singleton, TrySingleton};
use once_cell::sync::Lazy;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

#[derive(Debug)]
struct Database {
    url: String,
}

static CONNECTS: AtomicUsize = AtomicUsize::new(0);

static DATABASE: Lazy<Singleton<Arc<Database>>> = Lazy::new(|| {
    Singleton::new(|| {
        CONNECTS.fetch_add(1, Ordering::AcqRel);
        // Pretend that connecting takes a while.
        thread::sleep(Duration::from_millis(100));
        Arc::new(Database {
            url: "postgres://localhost/app".to_string(),
        })
    })
});

fn main() {
    let threads: Vec<_> = (0..100)
        .map(|_| thread::spawn(|| DATABASE.get()))
        .collect();
    let dbs: Vec<_> = threads
        .into_iter()
        .map(|t| t.join().expect("Thread failed"))
        .collect();

    assert_eq!(CONNECTS.load(Ordering::Acquire), 1);
    assert!(dbs.iter().all(|db| Arc::ptr_eq(db, &dbs[0])));
    println!("100 threads share {:?}", dbs[0]);

    let workers = Singleton::eager(|| {
        println!("Counting workers eagerly");
        std::thread::available_parallelism().map_or(1, |n| n.get())
    });
    println!("Workers: {}", workers.get());

    let port = TrySingleton::new(|| std::env::var("PORT").map(|p| p.parse::<u16>().ok()));
    match port.get() {
        Ok(p) => println!("PORT is {p:?}"),
        Err(e) => println!("PORT is not available ({e}); will retry on the next get"),
    }
}
