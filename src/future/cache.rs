use super::{value_initializer::ValueInitializer, CacheBuilder};
use crate::{
    common::{
        base_cache::BaseCache, builder_utils::CacheConfig, error::ComputeError, iter::Iter,
        time::LoadTimer, InitResult,
    },
    stats::CacheStats,
};

use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    convert::Infallible,
    fmt,
    future::Future,
    hash::{BuildHasher, Hash},
    pin::Pin,
    sync::Arc,
};

/// A thread-safe, futures-aware cache that computes the value of each key at
/// most once.
///
/// `Cache` is the async counterpart of [`sync::Cache`](crate::sync::Cache). The
/// producers are futures. When many tasks ask for the same absent key at the same
/// time, exactly one of them resolves its `init` future and the others await it,
/// without blocking their executor threads.
///
/// `Cache` does not depend on any async runtime. It works with `tokio`,
/// `async-std` or any other executor.
///
/// # Examples
///
/// ```rust
/// // Cargo.toml
/// //
/// // [dependencies]
/// // keyed-lazy-cache = { version = "0.1", features = ["future"] }
/// // tokio = { version = "1", features = ["rt-multi-thread", "macros" ] }
/// // futures-util = "0.3"
///
/// use keyed_lazy_cache::future::Cache;
///
/// #[tokio::main]
/// async fn main() {
///     const NUM_TASKS: usize = 16;
///
///     let cache: Cache<String, String> = Cache::new();
///
///     // Spawn async tasks that all ask for the same key.
///     let tasks: Vec<_> = (0..NUM_TASKS)
///         .map(|i| {
///             // To share the same cache across the async tasks, clone it.
///             // This is a cheap operation.
///             let my_cache = cache.clone();
///
///             tokio::spawn(async move {
///                 my_cache
///                     .get_with("greeting".to_string(), async move {
///                         format!("hello from task {i}")
///                     })
///                     .await
///             })
///         })
///         .collect();
///
///     // Wait for all tasks to complete.
///     let greetings = futures_util::future::join_all(tasks).await;
///
///     // Only one task's `init` future was resolved. Everybody got its value.
///     let first = greetings[0].as_ref().unwrap();
///     assert!(greetings.iter().all(|g| g.as_ref().unwrap() == first));
///     assert_eq!(cache.entry_count(), 1);
/// }
/// ```
///
/// # Timeouts
///
/// There is no built-in wait timeout. Wrap a call in your runtime's timeout,
/// such as `tokio::time::timeout`. When the timeout drops a task that was waiting,
/// only that wait is cancelled. When it drops the task that was resolving the
/// `init` future, the waiting tasks retry with their own futures.
///
/// # Avoiding to clone the value at `get`
///
/// The return type of `get` and the `get_with` family is `V` rather than `&V`.
/// Wrap the value in `std::sync::Arc` if it is expensive to clone or if tasks must
/// share the very same instance.
pub struct Cache<K, V, S = RandomState> {
    inner: Arc<Inner<K, V, S>>,
}

struct Inner<K, V, S> {
    base: BaseCache<K, V, S>,
    value_initializer: ValueInitializer<K, V, S>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
    /// Makes a clone of this shared cache.
    ///
    /// This operation is cheap as it only creates thread-safe reference counted
    /// pointers to the shared internal data structures.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, S> fmt::Debug for Cache<K, V, S>
where
    K: fmt::Debug + Eq + Hash + Send + Sync + 'static,
    V: fmt::Debug + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d_map = f.debug_map();

        for (k, v) in self {
            d_map.entry(&k, &v);
        }

        d_map.finish()
    }
}

impl<K, V> Cache<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Constructs a new, empty `Cache<K, V>`.
    ///
    /// To adjust configuration knobs such as `segments` or `record_stats`, use the
    /// [`CacheBuilder`][builder-struct].
    ///
    /// [builder-struct]: ./struct.CacheBuilder.html
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default(), RandomState::default())
    }

    /// Returns a [`CacheBuilder`][builder-struct], which can builds a `Cache` with
    /// various configuration knobs.
    ///
    /// [builder-struct]: ./struct.CacheBuilder.html
    pub fn builder() -> CacheBuilder<K, V, Cache<K, V, RandomState>> {
        CacheBuilder::default()
    }
}

impl<K, V> Default for Cache<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn with_config(config: CacheConfig, build_hasher: S) -> Self {
        let base = BaseCache::new(&config, build_hasher);
        let value_initializer =
            ValueInitializer::with_hasher(base.build_hasher().clone(), config.name.clone());
        Self {
            inner: Arc::new(Inner {
                base,
                value_initializer,
            }),
        }
    }

    /// Returns cache’s name.
    pub fn name(&self) -> Option<&str> {
        self.inner.base.name()
    }

    /// Returns the number of internal segments of this cache.
    pub fn num_segments(&self) -> usize {
        self.inner.base.num_segments()
    }

    /// Returns the number of computed entries in this cache.
    pub fn entry_count(&self) -> u64 {
        self.inner.base.entry_count()
    }

    /// Returns a snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.inner.base.stats()
    }

    /// Returns `true` if the cache holds a computed value for the key. Does not
    /// update the statistics.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.inner.base.hash(key);
        self.inner.base.contains_key_with_hash(key, hash)
    }

    /// Returns a _clone_ of the value corresponding to the key.
    ///
    /// This method is not `async`. It returns `None` while the key is absent,
    /// including while another task is still resolving its `init` future.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.inner.base.hash(key);
        self.inner.base.get_with_hash(key, hash)
    }

    /// Returns a _clone_ of the value corresponding to the key. If the value does
    /// not exist, resolves the `init` future and inserts the output.
    ///
    /// # Concurrent calls on the same key
    ///
    /// This method guarantees that concurrent calls on the same not-existing key are
    /// coalesced into one evaluation of the `init` future. Only one of the calls
    /// evaluates its future, and other calls wait for that future to resolve.
    ///
    /// If the task resolving the `init` future is dropped before the future
    /// resolves, one of the waiting calls resolves its own `init` future instead.
    ///
    /// # Panics
    ///
    /// This method panics when the `init` future has panicked. When it happens,
    /// only the caller whose `init` future panicked will get the panic. If there
    /// are other calls in progress, this method will restart and resolve one of the
    /// remaining `init` futures.
    pub async fn get_with(&self, key: K, init: impl Future<Output = V>) -> V {
        futures_util::pin_mut!(init);
        let hash = self.inner.base.hash(&key);
        if let Some(value) = self.inner.base.get_with_hash(&key, hash) {
            return value;
        }
        self.inner
            .compute_with_hash(Arc::new(key), hash, init)
            .await
    }

    /// Similar to [`get_with`](#method.get_with), but instead of passing an owned
    /// key, you can pass a reference to the key. If the key does not exist in the
    /// cache, the key will be cloned to create new entry in the cache.
    pub async fn get_with_by_ref<Q>(&self, key: &Q, init: impl Future<Output = V>) -> V
    where
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + ?Sized,
    {
        futures_util::pin_mut!(init);
        let hash = self.inner.base.hash(key);
        if let Some(value) = self.inner.base.get_with_hash(key, hash) {
            return value;
        }
        self.inner
            .compute_with_hash(Arc::new(key.to_owned()), hash, init)
            .await
    }

    /// Returns a _clone_ of the value corresponding to the key. If the value does
    /// not exist, resolves the `init` future, and inserts the value if `Ok(value)`
    /// was returned. If `Err(_)` was returned from the future, this method does not
    /// insert a value and returns [`ComputeError::ProducerFailed`] holding the
    /// error wrapped by [`std::sync::Arc`][std-arc].
    ///
    /// A failure is not remembered. The next call for the key resolves its `init`
    /// future again.
    ///
    /// [std-arc]: https://doc.rust-lang.org/stable/std/sync/struct.Arc.html
    ///
    /// # Concurrent calls on the same key
    ///
    /// Concurrent calls on the same not-existing key are coalesced into one
    /// evaluation of the `init` future. If that future fails, the waiting calls
    /// with the same error type receive the same error.
    ///
    /// # Panics
    ///
    /// This method panics when the `init` future has panicked. Only the caller
    /// whose `init` future panicked will get the panic.
    pub async fn try_get_with<F, E>(&self, key: K, init: F) -> Result<V, ComputeError<E>>
    where
        F: Future<Output = Result<V, E>>,
        E: Send + Sync + 'static,
    {
        futures_util::pin_mut!(init);
        let hash = self.inner.base.hash(&key);
        if let Some(value) = self.inner.base.get_with_hash(&key, hash) {
            return Ok(value);
        }
        self.inner
            .initialize(Arc::new(key), hash, init)
            .await
            .into_result()
    }

    /// Similar to [`try_get_with`](#method.try_get_with), but instead of passing an
    /// owned key, you can pass a reference to the key. If the key does not exist in
    /// the cache, the key will be cloned to create new entry in the cache.
    pub async fn try_get_with_by_ref<F, E, Q>(
        &self,
        key: &Q,
        init: F,
    ) -> Result<V, ComputeError<E>>
    where
        F: Future<Output = Result<V, E>>,
        E: Send + Sync + 'static,
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + ?Sized,
    {
        futures_util::pin_mut!(init);
        let hash = self.inner.base.hash(key);
        if let Some(value) = self.inner.base.get_with_hash(key, hash) {
            return Ok(value);
        }
        self.inner
            .initialize(Arc::new(key.to_owned()), hash, init)
            .await
            .into_result()
    }

    /// Creates an iterator visiting all computed key-value pairs in arbitrary
    /// order. The iterator element type is `(Arc<K>, V)`.
    ///
    /// Unlike the `get` method, visiting entries via an iterator do not update the
    /// statistics.
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.inner.base.iter()
    }

    #[cfg(test)]
    fn is_waiter_map_empty(&self) -> bool {
        self.inner.value_initializer.waiter_count() == 0
    }
}

impl<'a, K, V, S> IntoIterator for &'a Cache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    type Item = (Arc<K>, V);

    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, S> Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    async fn compute_with_hash(
        &self,
        key: Arc<K>,
        hash: u64,
        init: Pin<&mut impl Future<Output = V>>,
    ) -> V {
        let init = async { Ok::<_, Infallible>(init.await) };
        futures_util::pin_mut!(init);
        match self.initialize(key, hash, init).await {
            InitResult::Initialized(v) | InitResult::ReadExisting(v) => v,
            InitResult::InitErr(_) | InitResult::WaitTimedOut(_) => unreachable!(),
        }
    }

    async fn initialize<E>(
        &self,
        key: Arc<K>,
        hash: u64,
        init: Pin<&mut impl Future<Output = Result<V, E>>>,
    ) -> InitResult<V, E>
    where
        E: Send + Sync + 'static,
    {
        let get = || self.base.get_without_recording(&key, hash);
        let insert = |value| self.base.insert(Arc::clone(&key), hash, value);
        let init = async {
            let timer = LoadTimer::start();
            let result = init.await;
            self.base.record_load(timer, &result);
            result
        };
        futures_util::pin_mut!(init);

        self.value_initializer
            .try_init_or_read(&key, hash, get, init, insert)
            .await
    }
}
