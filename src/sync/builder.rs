use super::Cache;
use crate::common::builder_utils::{self, CacheConfig};

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    time::Duration,
};

/// Builds a [`Cache`][cache-struct] with various configuration knobs.
///
/// [cache-struct]: ./struct.Cache.html
///
/// # Examples
///
/// ```rust
/// use keyed_lazy_cache::sync::Cache;
///
/// use std::time::Duration;
///
/// let cache = Cache::builder()
///     // A name shows up in log messages emitted by the cache.
///     .name("line-adapter")
///     // Give up after 5 seconds of waiting for another caller's producer.
///     .wait_timeout(Duration::from_secs(5))
///     .record_stats()
///     // Create the cache.
///     .build();
///
/// cache.get_with(0, || "zero");
/// assert_eq!(cache.stats().load_success_count(), 1);
/// ```
///
#[must_use]
pub struct CacheBuilder<K, V, C> {
    config: CacheConfig,
    cache_type: PhantomData<(K, V, C)>,
}

impl<K, V> Default for CacheBuilder<K, V, Cache<K, V, RandomState>>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
            cache_type: PhantomData,
        }
    }
}

impl<K, V> CacheBuilder<K, V, Cache<K, V, RandomState>>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Construct a new `CacheBuilder` with the default settings: 16 segments,
    /// no wait timeout and no statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a `Cache<K, V>`.
    ///
    /// If you want to build a `Cache<K, V, S>` with a custom hasher, call the
    /// [`build_with_hasher`](#method.build_with_hasher) method instead.
    pub fn build(self) -> Cache<K, V, RandomState> {
        let build_hasher = RandomState::default();
        Cache::with_config(self.config, build_hasher)
    }

    /// Builds a `Cache<K, V, S>` with the given `hasher` of type `S`.
    ///
    /// # Examples
    ///
    /// This example uses AHash hasher from [AHash][ahash-crate] crate.
    ///
    /// [ahash-crate]: https://crates.io/crates/ahash
    ///
    /// ```rust
    /// // Cargo.toml
    /// // [dependencies]
    /// // ahash = "0.8"
    /// // keyed-lazy-cache = "0.1"
    /// use keyed_lazy_cache::sync::Cache;
    ///
    /// // The type of this cache is: Cache<i32, String, ahash::RandomState>
    /// let cache = Cache::builder().build_with_hasher(ahash::RandomState::default());
    /// cache.get_with(1, || "one".to_string());
    /// ```
    pub fn build_with_hasher<S>(self, hasher: S) -> Cache<K, V, S>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        Cache::with_config(self.config, hasher)
    }
}

impl<K, V, C> CacheBuilder<K, V, C> {
    /// Sets the name of the cache. Currently the name is used for identification
    /// only in logging messages.
    pub fn name(self, name: &str) -> Self {
        Self {
            config: CacheConfig {
                name: Some(name.to_string()),
                ..self.config
            },
            ..self
        }
    }

    /// Sets the initial capacity (number of entries) of the cache.
    pub fn initial_capacity(self, number_of_entries: usize) -> Self {
        Self {
            config: CacheConfig {
                initial_capacity: Some(number_of_entries),
                ..self.config
            },
            ..self
        }
    }

    /// Sets the number of segments of the cache.
    ///
    /// Each segment is guarded by its own lock, so more segments mean less
    /// contention between callers of distinct keys. The number is rounded up to
    /// the next power of two.
    ///
    /// # Panics
    ///
    /// Panics if `num_segments` is zero.
    pub fn segments(self, num_segments: usize) -> Self {
        builder_utils::ensure_num_segments_or_panic(num_segments);
        Self {
            config: CacheConfig {
                num_segments: Some(num_segments),
                ..self.config
            },
            ..self
        }
    }

    /// Sets how long a `try_get_with` call waits for a producer that is running
    /// in another thread. When the time is up, the call returns
    /// [`ComputeError::WaitTimedOut`](crate::ComputeError::WaitTimedOut).
    ///
    /// The producer itself is never interrupted. `get_with` is not affected by
    /// this setting.
    ///
    /// # Panics
    ///
    /// Panics if the given `duration` is longer than 1000 years.
    pub fn wait_timeout(self, duration: Duration) -> Self {
        builder_utils::ensure_wait_timeout_or_panic(duration);
        Self {
            config: CacheConfig {
                wait_timeout: Some(duration),
                ..self.config
            },
            ..self
        }
    }

    /// Enables recording of the cache statistics. See
    /// [`CacheStats`](crate::stats::CacheStats).
    pub fn record_stats(self) -> Self {
        Self {
            config: CacheConfig {
                record_stats: true,
                ..self.config
            },
            ..self
        }
    }
}
