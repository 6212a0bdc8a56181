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
    hash::{BuildHasher, Hash},
    sync::Arc,
    time::Duration,
};

/// A thread-safe cache that computes the value of each key at most once.
///
/// `Cache` maps a key to the value produced by the first caller that asked for
/// it. The producer is a closure passed to [`get_with`](#method.get_with) or
/// [`try_get_with`](#method.try_get_with). When many threads ask for the same
/// absent key at the same time, exactly one of them runs its closure. The others
/// block until it finishes and then receive the same value.
///
/// Computed entries are never evicted, replaced or removed. The cache grows for
/// as long as new keys are seen.
///
/// # Examples
///
/// ```rust
/// use keyed_lazy_cache::sync::Cache;
///
/// use std::{sync::Arc, thread};
///
/// #[derive(Debug, PartialEq)]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// // A vertical line from (0, 0) to (0, 5), drawn as points.
/// fn rasterize(x: i32, from_y: i32, to_y: i32) -> Arc<Vec<Point>> {
///     Arc::new((from_y..=to_y).map(|y| Point { x, y }).collect())
/// }
///
/// let cache = Cache::new();
///
/// let threads: Vec<_> = (0..8)
///     .map(|_| {
///         // To share the same cache across the threads, clone it.
///         // This is a cheap operation.
///         let my_cache = cache.clone();
///         thread::spawn(move || my_cache.get_with("line:(0,0)-(0,5)", || rasterize(0, 0, 5)))
///     })
///     .collect();
///
/// let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
///
/// // Every thread received the very same vector.
/// assert!(results.iter().all(|points| Arc::ptr_eq(points, &results[0])));
/// assert_eq!(results[0].len(), 6);
/// ```
///
/// # Sharing a cache across threads
///
/// To share a cache across threads, do one of the followings:
///
/// - Create a clone of the cache by calling its `clone` method and pass it to
///   other thread.
/// - Wrap the cache by a `sync::OnceCell` or `sync::Lazy` from
///   [once_cell][once-cell-crate] create, and set it to a `static` variable.
///
/// Cloning is a cheap operation for `Cache` as it only creates thread-safe
/// reference-counted pointers to the internal data structures.
///
/// [once-cell-crate]: https://crates.io/crates/once_cell
///
/// # Avoiding to clone the value at `get`
///
/// The return type of `get` and the `get_with` family is `V` rather than `&V`.
/// Every call returns a clone of the stored value. If the value is expensive to
/// clone, or if callers must observe the very same instance, wrap it in
/// `std::sync::Arc`.
///
/// # Keys
///
/// A key must not change its `Hash` or `Eq` behavior while it is used with the
/// cache, for example through interior mutability. Doing so does not cause memory
/// unsafety, but lookups for it will behave unpredictably.
///
/// # Producers
///
/// A producer must not call `get_with` on the same cache for its own key; that
/// call would wait on itself forever. Calls for other keys are fine.
///
/// If a producer panics, the panic is propagated to its caller, nothing is
/// cached, and callers that were waiting on it retry with their own producers.
///
/// # Hashing Algorithm
///
/// By default, `Cache` uses a hashing algorithm selected to provide resistance
/// against HashDoS attacks. It will be the same one used by
/// `std::collections::HashMap`, which is currently SipHash 1-3.
///
/// The hashing algorithm can be replaced on a per-`Cache` basis using the
/// [`build_with_hasher`][build-with-hasher-method] method of the `CacheBuilder`.
///
/// [build-with-hasher-method]: ./struct.CacheBuilder.html#method.build_with_hasher
pub struct Cache<K, V, S = RandomState> {
    inner: Arc<Inner<K, V, S>>,
}

struct Inner<K, V, S> {
    base: BaseCache<K, V, S>,
    value_initializer: ValueInitializer<K, V, S>,
    wait_timeout: Option<Duration>,
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
    /// To adjust configuration knobs such as `segments` or `wait_timeout`, use the
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
                wait_timeout: config.wait_timeout,
            }),
        }
    }

    /// Returns cache’s name.
    pub fn name(&self) -> Option<&str> {
        self.inner.base.name()
    }

    /// Returns how long `try_get_with` waits for another caller's producer before
    /// giving up, or `None` if it waits until that producer completes.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.inner.wait_timeout
    }

    /// Returns the number of internal segments of this cache.
    pub fn num_segments(&self) -> usize {
        self.inner.base.num_segments()
    }

    /// Returns the number of computed entries in this cache.
    ///
    /// Keys whose producer is still running, or whose producer failed, are not
    /// counted.
    pub fn entry_count(&self) -> u64 {
        self.inner.base.entry_count()
    }

    /// Returns a snapshot of the cache statistics.
    ///
    /// All counters are zero unless the cache was built with
    /// [`record_stats`](./struct.CacheBuilder.html#method.record_stats).
    pub fn stats(&self) -> CacheStats {
        self.inner.base.stats()
    }

    /// Returns `true` if the cache holds a computed value for the key.
    ///
    /// Unlike the `get` method, this method is not considered a cache read
    /// operation, so it does not update the statistics.
    ///
    /// The key may be any borrowed form of the cache's key type, but `Hash` and
    /// `Eq` on the borrowed form _must_ match those for the key type.
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
    /// Returns `None` while the key is absent, including while another thread is
    /// still computing its value. This method never runs a producer and never
    /// blocks on one.
    ///
    /// If you want to store values that will be expensive to clone, wrap them by
    /// `std::sync::Arc` before storing in a cache. [`Arc`][rustdoc-std-arc] is a
    /// thread-safe reference-counted pointer and its `clone()` method is cheap.
    ///
    /// The key may be any borrowed form of the cache's key type, but `Hash` and
    /// `Eq` on the borrowed form _must_ match those for the key type.
    ///
    /// [rustdoc-std-arc]: https://doc.rust-lang.org/stable/std/sync/struct.Arc.html
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.inner.base.hash(key);
        self.inner.base.get_with_hash(key, hash)
    }

    /// Returns a _clone_ of the value corresponding to the key. If the value does
    /// not exist, evaluates the `init` closure and inserts the output.
    ///
    /// # Concurrent calls on the same key
    ///
    /// This method guarantees that concurrent calls on the same not-existing key are
    /// coalesced into one evaluation of the `init` closure. Only one of the calls
    /// evaluates its closure, and other calls wait for that closure to complete.
    ///
    /// The following code snippet demonstrates this behavior:
    ///
    /// ```rust
    /// use keyed_lazy_cache::sync::Cache;
    /// use std::{sync::Arc, thread};
    ///
    /// const TEN_MIB: usize = 10 * 1024 * 1024; // 10MiB
    /// let cache = Cache::new();
    ///
    /// // Spawn four threads.
    /// let threads: Vec<_> = (0..4_u8)
    ///     .map(|task_id| {
    ///         let my_cache = cache.clone();
    ///         thread::spawn(move || {
    ///             println!("Thread {task_id} started.");
    ///
    ///             // Try to insert and get the value for key1. Although all four
    ///             // threads will call `get_with` at the same time, the `init` closure
    ///             // must be evaluated only once.
    ///             let value = my_cache.get_with("key1", || {
    ///                 println!("Thread {task_id} inserting a value.");
    ///                 Arc::new(vec![0u8; TEN_MIB])
    ///             });
    ///
    ///             // Ensure the value exists now.
    ///             assert_eq!(value.len(), TEN_MIB);
    ///             assert!(my_cache.get(&"key1").is_some());
    ///
    ///             println!("Thread {task_id} got the value. (len: {})", value.len());
    ///         })
    ///     })
    ///     .collect();
    ///
    /// // Wait all threads to complete.
    /// threads
    ///     .into_iter()
    ///     .for_each(|t| t.join().expect("Thread failed"));
    /// ```
    ///
    /// **Result**
    ///
    /// - The `init` closure was called exactly once by thread 1.
    /// - Other threads were blocked until thread 1 inserted the value.
    ///
    /// ```console
    /// Thread 1 started.
    /// Thread 0 started.
    /// Thread 3 started.
    /// Thread 2 started.
    /// Thread 1 inserting a value.
    /// Thread 2 got the value. (len: 10485760)
    /// Thread 1 got the value. (len: 10485760)
    /// Thread 0 got the value. (len: 10485760)
    /// Thread 3 got the value. (len: 10485760)
    /// ```
    ///
    /// This method never times out, even if the cache was built with a
    /// `wait_timeout`.
    ///
    /// # Panics
    ///
    /// This method panics when the `init` closure has panicked. When it happens,
    /// only the caller whose `init` closure panicked will get the panic (e.g. only
    /// thread 1 in the above sample). If there are other calls in progress (e.g.
    /// thread 0, 2 and 3 above), this method will restart and resolve one of the
    /// remaining `init` closure.
    pub fn get_with(&self, key: K, init: impl FnOnce() -> V) -> V {
        let hash = self.inner.base.hash(&key);
        if let Some(value) = self.inner.base.get_with_hash(&key, hash) {
            return value;
        }
        self.inner.compute_with_hash(Arc::new(key), hash, init)
    }

    /// Similar to [`get_with`](#method.get_with), but instead of passing an owned
    /// key, you can pass a reference to the key. If the key does not exist in the
    /// cache, the key will be cloned to create new entry in the cache.
    pub fn get_with_by_ref<Q>(&self, key: &Q, init: impl FnOnce() -> V) -> V
    where
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + ?Sized,
    {
        let hash = self.inner.base.hash(key);
        if let Some(value) = self.inner.base.get_with_hash(key, hash) {
            return value;
        }
        self.inner
            .compute_with_hash(Arc::new(key.to_owned()), hash, init)
    }

    /// Returns a _clone_ of the value corresponding to the key. If the value does
    /// not exist, evaluates the `init` closure, and inserts the value if `Ok(value)`
    /// was returned. If `Err(_)` was returned from the closure, this method does not
    /// insert a value and returns [`ComputeError::ProducerFailed`] holding the
    /// error wrapped by [`std::sync::Arc`][std-arc].
    ///
    /// A failure is not remembered: the key stays absent, and the next call for it
    /// evaluates its `init` closure again.
    ///
    /// [std-arc]: https://doc.rust-lang.org/stable/std/sync/struct.Arc.html
    ///
    /// # Concurrent calls on the same key
    ///
    /// This method guarantees that concurrent calls on the same not-existing key are
    /// coalesced into one evaluation of the `init` closure. Only one of the calls
    /// evaluates its closure, and other calls wait for that closure to complete.
    /// If that closure fails, the waiting calls receive the same error, as long as
    /// their closures have the same error type. Waiting calls with another error
    /// type, or waiting `get_with` calls, start over and one of them evaluates its
    /// own closure.
    ///
    /// If the cache was built with a
    /// [`wait_timeout`](./struct.CacheBuilder.html#method.wait_timeout), a call
    /// that waits for longer than that returns [`ComputeError::WaitTimedOut`].
    /// The closure it was waiting on keeps running and its value is cached when it
    /// completes.
    ///
    /// # Panics
    ///
    /// This method panics when the `init` closure has panicked. When it happens,
    /// only the caller whose `init` closure panicked will get the panic. If there
    /// are other calls in progress, this method will restart and resolve one of the
    /// remaining `init` closure.
    pub fn try_get_with<F, E>(&self, key: K, init: F) -> Result<V, ComputeError<E>>
    where
        F: FnOnce() -> Result<V, E>,
        E: Send + Sync + 'static,
    {
        let hash = self.inner.base.hash(&key);
        if let Some(value) = self.inner.base.get_with_hash(&key, hash) {
            return Ok(value);
        }
        self.inner
            .try_compute_with_hash(Arc::new(key), hash, init)
            .into_result()
    }

    /// Similar to [`try_get_with`](#method.try_get_with), but instead of passing an
    /// owned key, you can pass a reference to the key. If the key does not exist in
    /// the cache, the key will be cloned to create new entry in the cache.
    pub fn try_get_with_by_ref<F, E, Q>(&self, key: &Q, init: F) -> Result<V, ComputeError<E>>
    where
        F: FnOnce() -> Result<V, E>,
        E: Send + Sync + 'static,
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + ?Sized,
    {
        let hash = self.inner.base.hash(key);
        if let Some(value) = self.inner.base.get_with_hash(key, hash) {
            return Ok(value);
        }
        self.inner
            .try_compute_with_hash(Arc::new(key.to_owned()), hash, init)
            .into_result()
    }

    /// Creates an iterator visiting all computed key-value pairs in arbitrary
    /// order. The iterator element type is `(Arc<K>, V)`, where `V` is a clone of
    /// a stored value.
    ///
    /// Iterators do not block concurrent reads and writes on the cache. An entry
    /// can be computed while an iterator is alive, and it may or may not be visited.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use keyed_lazy_cache::sync::Cache;
    ///
    /// let cache = Cache::new();
    /// cache.get_with("Julia", || 14);
    ///
    /// let mut iter = cache.iter();
    /// let (k, v) = iter.next().unwrap(); // (Arc<K>, V)
    /// assert_eq!(*k, "Julia");
    /// assert_eq!(v, 14);
    ///
    /// assert!(iter.next().is_none());
    /// ```
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
    fn compute_with_hash(&self, key: Arc<K>, hash: u64, init: impl FnOnce() -> V) -> V {
        let init = || Ok::<_, Infallible>(init());
        // `get_with` ignores the wait timeout.
        match self.initialize(key, hash, None, init) {
            InitResult::Initialized(v) | InitResult::ReadExisting(v) => v,
            InitResult::InitErr(_) | InitResult::WaitTimedOut(_) => unreachable!(),
        }
    }

    fn try_compute_with_hash<F, E>(&self, key: Arc<K>, hash: u64, init: F) -> InitResult<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: Send + Sync + 'static,
    {
        self.initialize(key, hash, self.wait_timeout, init)
    }

    fn initialize<F, E>(
        &self,
        key: Arc<K>,
        hash: u64,
        wait_timeout: Option<Duration>,
        init: F,
    ) -> InitResult<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: Send + Sync + 'static,
    {
        let get = || self.base.get_without_recording(&key, hash);
        let insert = |value| self.base.insert(Arc::clone(&key), hash, value);
        let init = || {
            let timer = LoadTimer::start();
            let result = init();
            self.base.record_load(timer, &result);
            result
        };

        self.value_initializer
            .try_init_or_read(&key, hash, wait_timeout, get, init, insert)
    }
}

// To see the debug prints, run test as `cargo test -- --nocapture`
#[cfg(test)]
mod tests {
    use super::Cache;
    use crate::ComputeError;

    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread::{sleep, spawn},
        time::Duration,
    };

    #[derive(thiserror::Error, Debug)]
    #[error("{}", _0)]
    pub struct MyError(String);

    type MyResult<T> = Result<T, ComputeError<MyError>>;

    #[test]
    fn basic_single_thread() {
        let cache = Cache::builder().record_stats().build();
        let calls = AtomicUsize::default();

        let v = cache.get_with("a", || {
            calls.fetch_add(1, Ordering::AcqRel);
            "alice"
        });
        assert_eq!(v, "alice");
        let v = cache.get_with("a", || {
            calls.fetch_add(1, Ordering::AcqRel);
            "alex"
        });
        assert_eq!(v, "alice");

        assert_eq!(calls.load(Ordering::Acquire), 1);
        assert_eq!(cache.get(&"a"), Some("alice"));
        assert_eq!(cache.get(&"b"), None);
        assert!(cache.contains_key(&"a"));
        assert!(!cache.contains_key(&"b"));
        assert_eq!(cache.entry_count(), 1);

        let stats = cache.stats();
        // get_with miss, get_with hit, get hit, get miss
        assert_eq!(stats.hit_count(), 2);
        assert_eq!(stats.miss_count(), 2);
        assert_eq!(stats.load_success_count(), 1);
        assert_eq!(stats.load_failure_count(), 0);

        assert!(cache.is_waiter_map_empty());
    }

    #[test]
    fn get_with_by_ref_clones_key_only_on_miss() {
        let cache: Cache<String, usize> = Cache::new();

        assert_eq!(cache.get_with_by_ref("hello", || 5), 5);
        assert_eq!(cache.get_with_by_ref("hello", || unreachable!()), 5);
        assert_eq!(cache.get("hello"), Some(5));
        assert_eq!(cache.get_with("hello".to_string(), || unreachable!()), 5);
    }

    #[test]
    fn distinct_keys_are_computed_independently() {
        let cache = Cache::new();
        assert_eq!(cache.get_with(1, || "one"), "one");
        assert_eq!(cache.get_with(2, || "two"), "two");
        assert_eq!(cache.get_with(1, || "uno"), "one");
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn get_with() {
        let cache = Cache::new();
        const KEY: u32 = 0;

        // This test will run five threads:
        //
        // Thread1 will be the first thread to call `get_with` for a key, so its init
        // closure will be evaluated and then a &str value "thread1" will be inserted
        // to the cache.
        let thread1 = {
            let cache1 = cache.clone();
            spawn(move || {
                // Call `get_with` immediately.
                let v = cache1.get_with(KEY, || {
                    // Wait for 300 ms and return a &str value.
                    sleep(Duration::from_millis(300));
                    "thread1"
                });
                assert_eq!(v, "thread1");
            })
        };

        // Thread2 will be the second thread to call `get_with` for the same key, so
        // its init closure will not be evaluated. Once thread1's init closure
        // finishes, it will get the value inserted by thread1's init closure.
        let thread2 = {
            let cache2 = cache.clone();
            spawn(move || {
                // Wait for 100 ms before calling `get_with`.
                sleep(Duration::from_millis(100));
                let v = cache2.get_with(KEY, || unreachable!());
                assert_eq!(v, "thread1");
            })
        };

        // Thread3 will be the third thread to call `get_with` for the same key. By
        // the time it calls, thread1's init closure should have finished already and
        // the value should be already inserted to the cache. So its init closure
        // will not be evaluated and will get the value insert by thread1's init
        // closure immediately.
        let thread3 = {
            let cache3 = cache.clone();
            spawn(move || {
                // Wait for 400 ms before calling `get_with`.
                sleep(Duration::from_millis(400));
                let v = cache3.get_with(KEY, || unreachable!());
                assert_eq!(v, "thread1");
            })
        };

        // Thread4 will call `get` for the same key. It will call when thread1's init
        // closure is still running, so it will get none for the key.
        let thread4 = {
            let cache4 = cache.clone();
            spawn(move || {
                // Wait for 200 ms before calling `get`.
                sleep(Duration::from_millis(200));
                let maybe_v = cache4.get(&KEY);
                assert!(maybe_v.is_none());
            })
        };

        // Thread5 will call `get` for the same key. It will call after thread1's init
        // closure finished, so it will get the value insert by thread1's init closure.
        let thread5 = {
            let cache5 = cache.clone();
            spawn(move || {
                // Wait for 400 ms before calling `get`.
                sleep(Duration::from_millis(400));
                let maybe_v = cache5.get(&KEY);
                assert_eq!(maybe_v, Some("thread1"));
            })
        };

        for t in [thread1, thread2, thread3, thread4, thread5] {
            t.join().expect("Failed to join");
        }

        assert!(cache.is_waiter_map_empty());
    }

    #[test]
    fn try_get_with() {
        let cache = Cache::builder().record_stats().build();
        const KEY: u32 = 0;

        // This test will run eight threads:
        //
        // Thread1 will be the first thread to call `try_get_with` for a key, so its
        // init closure will be evaluated and then an error will be returned. Nothing
        // will be inserted to the cache.
        let thread1 = {
            let cache1 = cache.clone();
            spawn(move || {
                // Call `try_get_with` immediately.
                let v = cache1.try_get_with(KEY, || {
                    // Wait for 300 ms and return an error.
                    sleep(Duration::from_millis(300));
                    Err(MyError("thread1 error".into()))
                });
                assert!(matches!(v, Err(ComputeError::ProducerFailed(_))));
            })
        };

        // Thread2 will be the second thread to call `try_get_with` for the same key,
        // so its init closure will not be evaluated. Once thread1's init closure
        // finishes, it will get the same error value returned by thread1's init
        // closure.
        let thread2 = {
            let cache2 = cache.clone();
            spawn(move || {
                // Wait for 100 ms before calling `try_get_with`.
                sleep(Duration::from_millis(100));
                let v: MyResult<_> = cache2.try_get_with(KEY, || unreachable!());
                let e = v.expect_err("thread2 should see thread1's error");
                assert_eq!(
                    e.producer_error().map(|e| e.to_string()).as_deref(),
                    Some("thread1 error")
                );
            })
        };

        // Thread3 will be the third thread to call `try_get_with` for the same key.
        // By the time it calls, thread1's init closure should have finished already,
        // but the key still does not exist in the cache. So its init closure will be
        // evaluated and then an okay &str value will be returned. That value will be
        // inserted to the cache.
        let thread3 = {
            let cache3 = cache.clone();
            spawn(move || {
                // Wait for 400 ms before calling `try_get_with`.
                sleep(Duration::from_millis(400));
                let v: MyResult<_> = cache3.try_get_with(KEY, || {
                    // Wait for 300 ms and return an Ok(&str) value.
                    sleep(Duration::from_millis(300));
                    Ok("thread3")
                });
                assert_eq!(v.unwrap(), "thread3");
            })
        };

        // thread4 will be the fourth thread to call `try_get_with` for the same
        // key. So its init closure will not be evaluated. Once thread3's init
        // closure finishes, it will get the same okay &str value.
        let thread4 = {
            let cache4 = cache.clone();
            spawn(move || {
                // Wait for 500 ms before calling `try_get_with`.
                sleep(Duration::from_millis(500));
                let v: MyResult<_> = cache4.try_get_with(KEY, || unreachable!());
                assert_eq!(v.unwrap(), "thread3");
            })
        };

        // Thread5 will be the fifth thread to call `try_get_with` for the same
        // key. So its init closure will not be evaluated. By the time it calls,
        // thread3's init closure should have finished already, so its init closure
        // will not be evaluated and will get the value insert by thread3's init
        // closure immediately.
        let thread5 = {
            let cache5 = cache.clone();
            spawn(move || {
                // Wait for 800 ms before calling `try_get_with`.
                sleep(Duration::from_millis(800));
                let v: MyResult<_> = cache5.try_get_with(KEY, || unreachable!());
                assert_eq!(v.unwrap(), "thread3");
            })
        };

        // Thread6 will call `get` for the same key. It will call when thread1's init
        // closure is still running, so it will get none for the key.
        let thread6 = {
            let cache6 = cache.clone();
            spawn(move || {
                // Wait for 200 ms before calling `get`.
                sleep(Duration::from_millis(200));
                let maybe_v = cache6.get(&KEY);
                assert!(maybe_v.is_none());
            })
        };

        // Thread7 will call `get` for the same key. It will call after thread1's init
        // closure finished with an error. So it will get none for the key.
        let thread7 = {
            let cache7 = cache.clone();
            spawn(move || {
                // Wait for 400 ms before calling `get`.
                sleep(Duration::from_millis(400));
                let maybe_v = cache7.get(&KEY);
                assert!(maybe_v.is_none());
            })
        };

        // Thread8 will call `get` for the same key. It will call after thread3's init
        // closure finished, so it will get the value insert by thread3's init closure.
        let thread8 = {
            let cache8 = cache.clone();
            spawn(move || {
                // Wait for 800 ms before calling `get`.
                sleep(Duration::from_millis(800));
                let maybe_v = cache8.get(&KEY);
                assert_eq!(maybe_v, Some("thread3"));
            })
        };

        for t in [
            thread1, thread2, thread3, thread4, thread5, thread6, thread7, thread8,
        ] {
            t.join().expect("Failed to join");
        }

        assert!(cache.is_waiter_map_empty());

        // Only thread1 and thread3 ran their init closures.
        let stats = cache.stats();
        assert_eq!(stats.load_success_count(), 1);
        assert_eq!(stats.load_failure_count(), 1);
    }

    #[test]
    fn failed_producer_is_not_cached() {
        let cache: Cache<&str, u32> = Cache::new();
        let calls = AtomicUsize::default();

        for _ in 0..3 {
            let v: MyResult<_> = cache.try_get_with("k", || {
                calls.fetch_add(1, Ordering::AcqRel);
                Err(MyError("nope".into()))
            });
            assert!(v.is_err());
            assert!(cache.get(&"k").is_none());
        }
        assert_eq!(calls.load(Ordering::Acquire), 3);
        assert_eq!(cache.entry_count(), 0);

        let v: MyResult<_> = cache.try_get_with("k", || Ok(9));
        assert_eq!(v.unwrap(), 9);
        // Ready is terminal.
        let v: MyResult<_> = cache.try_get_with("k", || Err(MyError("late".into())));
        assert_eq!(v.unwrap(), 9);
        assert!(cache.is_waiter_map_empty());
    }

    #[test]
    fn waiter_with_another_error_type_retries() {
        let cache = Cache::new();
        const KEY: u32 = 0;

        // Thread1 fails with `MyError`.
        let thread1 = {
            let cache1 = cache.clone();
            spawn(move || {
                let v: MyResult<&str> = cache1.try_get_with(KEY, || {
                    sleep(Duration::from_millis(300));
                    Err(MyError("thread1 error".into()))
                });
                assert!(v.is_err());
            })
        };

        // Thread2 waits on thread1 with a producer of another error type. Thread1's
        // error is not its to report, so it runs its own producer afterwards.
        let thread2 = {
            let cache2 = cache.clone();
            spawn(move || {
                sleep(Duration::from_millis(100));
                let v: Result<_, ComputeError<std::io::Error>> =
                    cache2.try_get_with(KEY, || Ok("thread2"));
                assert_eq!(v.unwrap(), "thread2");
            })
        };

        // Thread3 is a plain `get_with`, it also starts over after thread1 failed.
        let thread3 = {
            let cache3 = cache.clone();
            spawn(move || {
                sleep(Duration::from_millis(100));
                let v = cache3.get_with(KEY, || "thread3");
                assert!(v == "thread2" || v == "thread3");
            })
        };

        for t in [thread1, thread2, thread3] {
            t.join().expect("Failed to join");
        }

        let v = cache.get(&KEY).expect("a value should be cached");
        assert!(v == "thread2" || v == "thread3");
        assert!(cache.is_waiter_map_empty());
    }

    #[test]
    fn panicking_producer_lets_waiters_retry() {
        let cache = Cache::new();
        const KEY: u32 = 0;

        // Thread1 panics in its init closure. The panic is propagated to thread1
        // only.
        let thread1 = {
            let cache1 = cache.clone();
            spawn(move || {
                cache1.get_with(KEY, || {
                    sleep(Duration::from_millis(300));
                    panic!("thread1 panicked on purpose");
                })
            })
        };

        // Thread2 waits on thread1, then evaluates its own init closure.
        let thread2 = {
            let cache2 = cache.clone();
            spawn(move || {
                sleep(Duration::from_millis(100));
                cache2.get_with(KEY, || "thread2")
            })
        };

        assert!(thread1.join().is_err());
        assert_eq!(thread2.join().expect("Failed to join"), "thread2");
        assert_eq!(cache.get(&KEY), Some("thread2"));
        assert!(cache.is_waiter_map_empty());
    }

    #[test]
    fn panic_while_storing_the_value_lets_others_retry() {
        static PANIC_ON_CLONE: AtomicBool = AtomicBool::new(false);

        // A value whose `clone` panics once, after the producer has returned.
        #[derive(Debug, PartialEq)]
        struct Touchy(u32);

        impl Clone for Touchy {
            fn clone(&self) -> Self {
                if PANIC_ON_CLONE.swap(false, Ordering::SeqCst) {
                    panic!("cloning Touchy({}) panicked on purpose", self.0);
                }
                Touchy(self.0)
            }
        }

        let cache = Cache::new();
        const KEY: u32 = 0;
        PANIC_ON_CLONE.store(true, Ordering::SeqCst);

        // Thread1's producer succeeds, but storing its value panics.
        let thread1 = {
            let cache1 = cache.clone();
            spawn(move || {
                cache1.get_with(KEY, || {
                    sleep(Duration::from_millis(300));
                    Touchy(1)
                })
            })
        };

        // Thread2 waits on thread1, then evaluates its own init closure.
        let thread2 = {
            let cache2 = cache.clone();
            spawn(move || {
                sleep(Duration::from_millis(100));
                cache2.get_with(KEY, || Touchy(2))
            })
        };

        assert!(thread1.join().is_err());
        assert_eq!(thread2.join().expect("Failed to join"), Touchy(2));
        assert!(cache.is_waiter_map_empty());

        // The key is not stuck. Later calls read the stored value.
        assert_eq!(cache.get_with(KEY, || Touchy(3)), Touchy(2));
        assert_eq!(cache.get(&KEY), Some(Touchy(2)));
    }

    #[test]
    fn panic_while_storing_the_value_does_not_poison_the_key() {
        static PANIC_ON_CLONE: AtomicBool = AtomicBool::new(false);

        #[derive(Debug, PartialEq)]
        struct Touchy(u32);

        impl Clone for Touchy {
            fn clone(&self) -> Self {
                if PANIC_ON_CLONE.swap(false, Ordering::SeqCst) {
                    panic!("cloning Touchy({}) panicked on purpose", self.0);
                }
                Touchy(self.0)
            }
        }

        let cache = Cache::new();
        const KEY: u32 = 1;
        PANIC_ON_CLONE.store(true, Ordering::SeqCst);

        let first = {
            let cache = cache.clone();
            spawn(move || cache.get_with(KEY, || Touchy(1)))
        };
        assert!(first.join().is_err());
        assert!(cache.is_waiter_map_empty());
        assert_eq!(cache.get(&KEY), None);

        assert_eq!(cache.get_with(KEY, || Touchy(2)), Touchy(2));
        assert!(cache.is_waiter_map_empty());
    }

    #[test]
    fn wait_timeout_does_not_cancel_the_producer() {
        let cache = Cache::builder()
            .wait_timeout(Duration::from_millis(100))
            .build();
        const KEY: u32 = 0;

        // Thread1 takes 400 ms to compute the value.
        let thread1 = {
            let cache1 = cache.clone();
            spawn(move || {
                let v: MyResult<_> = cache1.try_get_with(KEY, || {
                    sleep(Duration::from_millis(400));
                    Ok("thread1")
                });
                assert_eq!(v.unwrap(), "thread1");
            })
        };

        // Thread2 gives up after 100 ms of waiting.
        let thread2 = {
            let cache2 = cache.clone();
            spawn(move || {
                sleep(Duration::from_millis(100));
                let v: MyResult<&str> = cache2.try_get_with(KEY, || unreachable!());
                match v {
                    Err(ComputeError::WaitTimedOut(d)) => {
                        assert_eq!(d, Duration::from_millis(100))
                    }
                    other => panic!("unexpected result: {other:?}"),
                }
            })
        };

        // Thread3 uses `get_with`, which ignores the timeout.
        let thread3 = {
            let cache3 = cache.clone();
            spawn(move || {
                sleep(Duration::from_millis(100));
                assert_eq!(cache3.get_with(KEY, || unreachable!()), "thread1");
            })
        };

        for t in [thread1, thread2, thread3] {
            t.join().expect("Failed to join");
        }

        assert_eq!(cache.get(&KEY), Some("thread1"));
        assert!(cache.is_waiter_map_empty());
    }

    #[test]
    fn slow_key_does_not_block_other_keys() {
        let cache = Cache::new();
        let (tx, rx) = std::sync::mpsc::channel();

        let slow = {
            let cache = cache.clone();
            spawn(move || {
                cache.get_with("slow", || {
                    // Stay in the producer until the fast key has been computed.
                    rx.recv().expect("sender dropped");
                    1
                })
            })
        };

        sleep(Duration::from_millis(50));
        assert_eq!(cache.get_with("fast", || 2), 2);
        tx.send(()).expect("receiver dropped");

        assert_eq!(slow.join().expect("Failed to join"), 1);
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn arc_values_keep_their_identity() {
        let cache = Cache::new();
        let calls = Arc::new(AtomicUsize::default());

        let handles = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = Arc::clone(&calls);
                spawn(move || {
                    cache.get_with("shared", || {
                        calls.fetch_add(1, Ordering::AcqRel);
                        sleep(Duration::from_millis(50));
                        Arc::new(vec![1, 2, 3])
                    })
                })
            })
            .collect::<Vec<_>>();

        let values = handles
            .into_iter()
            .map(|h| h.join().expect("Failed to join"))
            .collect::<Vec<_>>();

        assert_eq!(calls.load(Ordering::Acquire), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn iter_and_debug() {
        let cache = Cache::builder().segments(4).build();
        for i in 0..10u32 {
            cache.get_with(i, || i * i);
        }

        let mut entries = cache.iter().map(|(k, v)| (*k, v)).collect::<Vec<_>>();
        entries.sort_unstable();
        assert_eq!(entries, (0..10u32).map(|i| (i, i * i)).collect::<Vec<_>>());
        assert_eq!((&cache).into_iter().count(), 10);

        let single: Cache<&str, u32> = Cache::new();
        single.get_with("a", || 1);
        assert_eq!(format!("{single:?}"), r#"{"a": 1}"#);
    }
}
