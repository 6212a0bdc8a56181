use parking_lot::{RwLock, RwLockWriteGuard};
use std::{
    hash::{BuildHasher, Hash},
    sync::Arc,
    time::Duration,
};
use triomphe::Arc as TrioArc;

use crate::common::{segmented_map::SegmentedHashMap, ErrorObject, InitResult};

const WAITER_MAP_NUM_SEGMENTS: usize = 64;
const MAX_RETRIES: usize = 200;

enum WaiterValue<V> {
    Computing,
    Ready(Result<V, ErrorObject>),
    InitClosurePanicked,
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
            // Value is not set. This means the thread unwound somewhere between
            // inserting our waiter and publishing the outcome, e.g. in a `Clone`
            // or `Eq` impl called while storing the value. Remove our waiter so
            // that the callers waiting on it retry.
            *self.write_lock = WaiterValue::InitClosurePanicked;
            remove_waiter(self.waiters, &key, self.hash, self.waiter);
            #[cfg(feature = "logging")]
            log::debug!(
                "{}The caller running a producer unwound before publishing a value. \
                Waiting callers will retry",
                crate::common::log_prefix(self.cache_name)
            );
        }
    }
}

/// Coalesces concurrent `get_with` calls on the same absent key into a single
/// evaluation of the producer.
///
/// The caller that manages to insert its waiter into the waiter map holds the
/// waiter's write lock while the producer runs. Everybody else blocks on a read
/// lock of that waiter, and then reads the published outcome.
pub(crate) struct ValueInitializer<K, V, S> {
    // Keyed by the cache key alone, so at most one producer per key is in flight
    // no matter which error type each caller's producer returns. A waiter that
    // sees an error of another type retries from the beginning.
    waiters: WaiterMap<K, V, S>,
    cache_name: Option<String>,
}

impl<K, V, S> ValueInitializer<K, V, S>
where
    K: Eq + Hash,
    V: Clone,
    S: BuildHasher + Clone,
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

    /// # Panics
    /// Panics if the `init` closure has been panicked, or if other callers' `init`
    /// closures kept panicking while this caller was waiting on them.
    pub(crate) fn try_init_or_read<E>(
        &self,
        key: &Arc<K>,
        hash: u64,
        wait_timeout: Option<Duration>,
        // Closure to get an existing value from cache.
        mut get: impl FnMut() -> Option<V>,
        init: impl FnOnce() -> Result<V, E>,
        // Closure to insert a new value into cache. Returns the value held by the
        // cache after the insertion.
        mut insert: impl FnMut(V) -> V,
    ) -> InitResult<V, E>
    where
        E: Send + Sync + 'static,
    {
        use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
        use InitResult::*;

        let mut retries = 0;

        loop {
            let waiter = TrioArc::new(RwLock::new(WaiterValue::Computing));
            // NOTE: We have to acquire a write lock before `try_insert_waiter`,
            // so that any concurrent attempt will get our lock and wait on it.
            let lock = waiter.write();

            match self.try_insert_waiter(key, hash, &waiter) {
                None => {
                    // Our waiter was inserted.

                    // Create a guard. This will ensure to remove our waiter when
                    // this thread unwinds before publishing a value.
                    let waiter_guard = WaiterGuard::new(
                        Arc::clone(key),
                        hash,
                        &waiter,
                        &self.waiters,
                        lock,
                        self.cache_name.as_deref(),
                    );

                    // Check if the value has already been inserted by other thread.
                    if let Some(value) = get() {
                        // Yes. Set the waiter value, remove our waiter, and return
                        // the existing value.
                        waiter_guard.set_waiter_value(WaiterValue::Ready(Ok(value.clone())));
                        return ReadExisting(value);
                    }

                    // The value still does not exist. Let's evaluate the init
                    // closure. Catching panic is safe here as we do not try to
                    // evaluate the closure again.
                    match catch_unwind(AssertUnwindSafe(init)) {
                        Ok(Ok(value)) => {
                            let value = insert(value);
                            waiter_guard.set_waiter_value(WaiterValue::Ready(Ok(value.clone())));
                            return Initialized(value);
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
                            return InitErr(err);
                        }
                        Err(payload) => {
                            #[cfg(feature = "logging")]
                            crate::common::log_panic(&*payload, self.cache_name.as_deref());
                            // Remove the waiter so that others can retry.
                            waiter_guard.set_waiter_value(WaiterValue::InitClosurePanicked);
                            resume_unwind(payload);
                        }
                    } // The write lock will be unlocked here.
                }
                Some(existing) => {
                    // Somebody else's waiter already exists. Drop our write lock and
                    // wait for the read lock to become available.
                    std::mem::drop(lock);

                    let waiter_value = match wait_timeout {
                        Some(timeout) => match existing.try_read_for(timeout) {
                            Some(guard) => guard,
                            None => {
                                #[cfg(feature = "logging")]
                                log::warn!(
                                    "{}Gave up after waiting {:?} for another caller's producer",
                                    self.log_prefix(),
                                    timeout
                                );
                                return WaitTimedOut(timeout);
                            }
                        },
                        None => existing.read(),
                    };

                    match &*waiter_value {
                        WaiterValue::Ready(Ok(value)) => return ReadExisting(value.clone()),
                        WaiterValue::Ready(Err(e)) => {
                            if let Ok(e) = Arc::clone(e).downcast::<E>() {
                                return InitErr(e);
                            }
                            // The other caller's producer returned an error of
                            // another type. It is not ours to report, and the key
                            // is absent again.
                        }
                        // Somebody else's init closure has been panicked, or its
                        // caller unwound before publishing a value.
                        WaiterValue::InitClosurePanicked | WaiterValue::Computing => (),
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
                    continue;
                }
            }
        }
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
            "Too many retries. Tried to read the return value from the `init` closure \
            but failed {retries} times. Maybe the `init` kept panicking?"
        );
    }
}
