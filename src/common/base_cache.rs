use super::{
    builder_utils::CacheConfig,
    iter::Iter,
    segmented_map::SegmentedHashMap,
    stats_counter::{DisabledStatsCounter, SaturatingStatsCounter, StatsCounter},
    time::LoadTimer,
};
use crate::stats::CacheStats;

use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash},
    sync::Arc,
};

/// The part of a cache that does not depend on how callers wait for each other:
/// the computed (`Ready`) entries and the statistics.
///
/// Entries are only ever added. Once a key has a value, that value is returned to
/// every later caller for the lifetime of the cache.
pub(crate) struct BaseCache<K, V, S> {
    name: Option<String>,
    entries: SegmentedHashMap<K, V, S>,
    stats_counter: Box<dyn StatsCounter + Send + Sync>,
}

impl<K, V, S> BaseCache<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher + Clone,
{
    pub(crate) fn new(config: &CacheConfig, build_hasher: S) -> Self {
        let stats_counter: Box<dyn StatsCounter + Send + Sync> = if config.record_stats {
            Box::<SaturatingStatsCounter>::default()
        } else {
            Box::new(DisabledStatsCounter)
        };

        Self {
            name: config.name.clone(),
            entries: SegmentedHashMap::with_num_segments_capacity_and_hasher(
                config.num_segments(),
                config.initial_capacity(),
                build_hasher,
            ),
            stats_counter,
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn build_hasher(&self) -> &S {
        self.entries.build_hasher()
    }

    pub(crate) fn num_segments(&self) -> usize {
        self.entries.num_segments()
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    #[inline]
    pub(crate) fn hash<Q>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.hash(key)
    }

    /// The fast path. Takes only a shared segment lock. Records a hit or a miss.
    pub(crate) fn get_with_hash<Q>(&self, key: &Q, hash: u64) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let maybe_value = self.entries.get(hash, |k| k.borrow() == key);
        if maybe_value.is_some() {
            self.stats_counter.record_hits(1);
        } else {
            self.stats_counter.record_misses(1);
        }
        maybe_value
    }

    /// The re-check done after this caller became the producer for the key. Not
    /// counted as a request.
    pub(crate) fn get_without_recording(&self, key: &Arc<K>, hash: u64) -> Option<V> {
        self.entries.get(hash, |k| k == &**key)
    }

    pub(crate) fn contains_key_with_hash<Q>(&self, key: &Q, hash: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(hash, |k| k.borrow() == key)
    }

    /// Publishes a computed value and returns the value now held by the cache.
    ///
    /// A computed entry is never replaced, so if a value is already present it is
    /// returned and `value` is dropped.
    pub(crate) fn insert(&self, key: Arc<K>, hash: u64, value: V) -> V {
        match self.entries.insert_if_not_present(key, hash, value.clone()) {
            Some(existing) => existing,
            None => value,
        }
    }

    pub(crate) fn record_load<T, E>(&self, timer: LoadTimer, result: &Result<T, E>) {
        let nanos = timer.elapsed_nanos();
        match result {
            Ok(_) => self.stats_counter.record_load_success(nanos),
            Err(_) => self.stats_counter.record_load_failure(nanos),
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.stats_counter.snapshot()
    }

    pub(crate) fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.entries)
    }
}
