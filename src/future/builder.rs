use super::Cache;
use crate::common::builder_utils::{self, CacheConfig};

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
};

/// Builds a [`Cache`][cache-struct] with various configuration knobs.
///
/// [cache-struct]: ./struct.Cache.html
///
/// # Example
///
/// ```rust
/// // Cargo.toml
/// //
/// // [dependencies]
/// // keyed-lazy-cache = { version = "0.1", features = ["future"] }
/// // tokio = { version = "1", features = ["rt-multi-thread", "macros" ] }
/// use keyed_lazy_cache::future::Cache;
///
/// #[tokio::main]
/// async fn main() {
///     let cache = Cache::builder()
///         .name("config")
///         .segments(4)
///         .record_stats()
///         // Create the cache.
///         .build();
///
///     let port = cache.get_with("port", async { 8080 }).await;
///     assert_eq!(port, 8080);
///     assert_eq!(cache.stats().load_success_count(), 1);
/// }
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
    /// Construct a new `CacheBuilder` with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a `Cache<K, V>`.
    pub fn build(self) -> Cache<K, V, RandomState> {
        let build_hasher = RandomState::default();
        Cache::with_config(self.config, build_hasher)
    }

    /// Builds a `Cache<K, V, S>` with the given `hasher` of type `S`.
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

    /// Sets the number of segments of the cache. The number is rounded up to the
    /// next power of two.
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

    /// Enables recording of the cache statistics.
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
