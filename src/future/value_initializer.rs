use async_lock::{RwLock, RwLockWriteGuard};
use futures_util::FutureExt;
use std::{
    future::Future,
    hash::{BuildHasher, Hash},
    pin::Pin,
    sync::Arc,
};
use triomphe::Arc as TrioArc;

use crate::common::{segmented_map::SegmentedHashMap, ErrorObject, InitResult};

const WAITER_MAP_NUM_SEGMENTS: usize = 64;
const MAX_RETRIES: usize = 200;

enum WaiterValue<V> {
    Computing,
    Ready(Result<V, ErrorObject>),
    InitFuturePanicked,
    EnclosingFutureAborted,
}

type Waiter<V> = TrioArc<RwLock<WaiterValue<V>>>;
type WaiterMap<K, V, S> = SegmentedHashMap<K, Waiter<V>, S>;

struct WaiterGuard<'a, K, V, S>
// NOTE: We usually do not attach trait bounds to here at the struct definition, but
// the Drop trait requires these bounds here.
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    key: Option<Arc<K>>,
    hash: u64,
    waiter: &'a Waiter<V>,
    waiters: &'a WaiterMap<K, V, S>,
    write_lock: RwLockWriteGuard<'a, WaiterValue<V>>,
    #[cfg(feature = "logging")]
    cache_name: Option<&'a str>,
}

impl<'a, K, V, S> WaiterGuard<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    fn new(
        key: Arc<K>,
        hash: u64,
        waiter: &'a Waiter<V>,
        waiters: &'a WaiterMap<K, V, S>,
        write_lock: RwLockWriteGuard<'a, WaiterValue<V>>,
        _cache_name: Option<&'a str>,
    ) -> Self {
        Self {
            key: Some(key),
            hash,
            waiter,
            waiters,
            write_lock,
            #[cfg(feature = "logging")]
            cache_name: _cache_name,
        }
    }

    fn set_waiter_value(mut self, v: WaiterValue<V>) {
        *self.write_lock = v;
        if let Some(key) = self.key.take() {
            remove_waiter(self.waiters, &key, self.hash, self.waiter);
        }
    }
}

impl<'a, K, V, S> Drop for WaiterGuard<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // Value is not set. This means the future containing `*get_with` method
            // has been aborted. Remove our waiter so that the tasks waiting on it
            // retry instead of waiting forever.
            *self.write_lock = WaiterValue::EnclosingFutureAborted;
            remove_waiter(self.waiters, &key, self.hash, self.waiter);
            #[cfg(feature = "logging")]
            log::debug!(
                "{}The future running a producer was dropped. Waiting tasks will retry",
                crate::common::log_prefix(self.cache_name)
            );
        }
    }
}

/// The async counterpart of the blocking value initializer. Waiters are
/// `async_lock::RwLock`s, so tasks waiting on a producer yield to the executor
/// instead of blocking a worker thread.
pub(crate) struct ValueInitializer<K, V, S> {
    // Keyed by the cache key alone, the same way as the blocking initializer.
    waiters: WaiterMap<K, V, S>,
    cache_name: Option<String>,
}

impl<K, V, S> ValueInitializer<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn with_hasher(hasher: S, cache_name: Option<String>) -> Self {
        Self {
            waiters: SegmentedHashMap::with_num_segments_and_hasher(
                WAITER_MAP_NUM_SEGMENTS,
                hasher,
            ),
            cache_name,
        }
    }

    //
    // NOTES: We use `Pin<&mut impl Future>` instead of `impl Future` here for the
    // `init` argument. This is because we want to avoid the future size inflation
    // caused by calling nested async functions.
    //

    /// # Panics
    /// Panics if the `init` future has been panicked, or if other tasks' `init`
    /// futures kept panicking or being aborted while this task was waiting on
    /// them.
    pub(crate) async fn try_init_or_read<E>(
        &self,
        key: &Arc<K>,
        hash: u64,
        // Closure to get an existing value from cache.
        mut get: impl FnMut() -> Option<V>,
        // Future to initialize a new value.
        init: Pin<&mut impl Future<Output = Result<V, E>>>,
        // Closure to insert a new value into cache. Returns the value held by the
        // cache after the insertion.
        mut insert: impl FnMut(V) -> V,
    ) -> InitResult<V, E>
    where
        E: Send + Sync + 'static,
    {
        use std::panic::{resume_unwind, AssertUnwindSafe};
        use InitResult::*;

        let mut retries = 0;

        let waiter = TrioArc::new(RwLock::new(WaiterValue::Computing));
        // NOTE: We have to acquire a write lock before `try_insert_waiter`,
        // so that any concurrent attempt will get our lock and wait on it.
        let lock = waiter.write().await;

        loop {
            let Some(existing) = self.try_insert_waiter(key, hash, &waiter) else {
                break;
            };

            // Somebody else's waiter already exists, so wait for its result to become
            // available.
            let waiter_result = existing.read().await;
            match &*waiter_result {
                WaiterValue::Ready(Ok(value)) => return ReadExisting(value.clone()),
                WaiterValue::Ready(Err(e)) => {
                    if let Ok(e) = Arc::clone(e).downcast::<E>() {
                        return InitErr(e);
                    }
                    // The other task's producer returned an error of another type.
                    // The key is absent again.
                }
                // Somebody else's init future has been panicked, or the future
                // containing `get_with`/`try_get_with` has been aborted.
                WaiterValue::InitFuturePanicked
                | WaiterValue::EnclosingFutureAborted
                | WaiterValue::Computing => (),
            }

            retries += 1;
            panic_if_retry_exhausted(retries);
            #[cfg(feature = "logging")]
            log::trace!(
                "{}The attempt we waited on ended without a value. Retrying ({})",
                self.log_prefix(),
                retries
            );
            // Retry from the beginning.
        }

        // Our waiter was inserted.

        // Create a guard. This will ensure to remove our waiter when the
        // enclosing future has been aborted.
        let waiter_guard = WaiterGuard::new(
            Arc::clone(key),
            hash,
            &waiter,
            &self.waiters,
            lock,
            self.cache_name.as_deref(),
        );

        // Check if the value has already been inserted by other task.
        if let Some(value) = get() {
            // Yes. Set the waiter value, remove our waiter, and return
            // the existing value.
            waiter_guard.set_waiter_value(WaiterValue::Ready(Ok(value.clone())));
            return ReadExisting(value);
        }

        // The value still does not exist. Let's resolve the init
        // future. Catching panic is safe here as we do not try to
        // resolve the future again.
        match AssertUnwindSafe(init).catch_unwind().await {
            Ok(Ok(value)) => {
                let value = insert(value);
                waiter_guard.set_waiter_value(WaiterValue::Ready(Ok(value.clone())));
                Initialized(value)
            }
            Ok(Err(e)) => {
                #[cfg(feature = "logging")]
                log::debug!(
                    "{}The producer failed. The key stays absent",
                    self.log_prefix()
                );
                let err = Arc::new(e);
                let err_obj: ErrorObject = Arc::clone(&err) as ErrorObject;
                waiter_guard.set_waiter_value(WaiterValue::Ready(Err(err_obj)));
                InitErr(err)
            }
            // Panicked.
            Err(payload) => {
                #[cfg(feature = "logging")]
                crate::common::log_panic(&*payload, self.cache_name.as_deref());
                waiter_guard.set_waiter_value(WaiterValue::InitFuturePanicked);
                resume_unwind(payload);
            }
        }
        // The lock will be unlocked here.
    }

    #[inline]
    fn try_insert_waiter(&self, key: &Arc<K>, hash: u64, waiter: &Waiter<V>) -> Option<Waiter<V>> {
        let waiter = TrioArc::clone(waiter);
        self.waiters
            .insert_if_not_present(Arc::clone(key), hash, waiter)
    }

    #[cfg(feature = "logging")]
    fn log_prefix(&self) -> String {
        crate::common::log_prefix(self.cache_name.as_deref())
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

#[inline]
fn remove_waiter<K, V, S>(waiters: &WaiterMap<K, V, S>, key: &Arc<K>, hash: u64, waiter: &Waiter<V>)
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    waiters.remove_if(hash, |k| k == &**key, |_k, w| TrioArc::ptr_eq(w, waiter));
}

fn panic_if_retry_exhausted(retries: usize) {
    if retries >= MAX_RETRIES {
        panic!(
            "Too many retries. Tried to read the return value from the `init` future \
            but failed {retries} times. Maybe the `init` kept panicking, or the \
            enclosing futures kept being aborted?"
        );
    }
}
