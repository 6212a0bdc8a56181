// Async tasks load configuration sections on demand. Each section is loaded once
// no matter how many tasks ask for it at the same time. A failed load is not
// cached, so it is retried on the next request.
//
// Run with: `RUST_LOG=debug cargo run --example config_loader_async`

use anyhow::{bail, Context};
use keyed_lazy_cache::future::Cache;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

type Section = Arc<BTreeMap<String, String>>;

static LOADS: AtomicUsize = AtomicUsize::new(0);

async fn load_section(name: &str) -> anyhow::Result<Section> {
    LOADS.fetch_add(1, Ordering::AcqRel);
    println!("Loading section [{name}]");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let text = match name {
        "server" => "host=0.0.0.0\nport=8080",
        "database" => "url=postgres://localhost/app\npool=16",
        _ => bail!("no such section: {name}"),
    };

    let mut entries = BTreeMap::new();
    for line in text.lines() {
        let (k, v) = line
            .split_once('=')
            .with_context(|| format!("malformed line in [{name}]: {line}"))?;
        entries.insert(k.to_string(), v.to_string());
    }
    Ok(Arc::new(entries))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config: Cache<String, Section> = Cache::builder().name("config").record_stats().build();

    let tasks: Vec<_> = ["server", "database", "server", "database", "server"]
        .into_iter()
        .map(|name| {
            let config = config.clone();
            tokio::spawn(async move {
                config
                    .try_get_with_by_ref(name, load_section(name))
                    .await
                    .map(|section| (name, section.len()))
            })
        })
        .collect();

    for task in futures_util::future::join_all(tasks).await {
        let (name, len) = task?.map_err(|e| match e.producer_error() {
            Some(cause) => anyhow::anyhow!("{cause:#}"),
            None => anyhow::anyhow!("{e}"),
        })?;
        println!("[{name}] has {len} entries");
    }
    assert_eq!(LOADS.load(Ordering::Acquire), 2);

    for _ in 0..2 {
        let result = config
            .try_get_with_by_ref("logging", load_section("logging"))
            .await;
        if let Some(cause) = result.as_ref().err().and_then(|e| e.producer_error()) {
            println!("Failed: {cause:#}");
        }
    }
    assert_eq!(LOADS.load(Ordering::Acquire), 4);

    println!("{:#?}", config.stats());
    Ok(())
}
