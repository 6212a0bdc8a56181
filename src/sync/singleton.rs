use super::Cache;
use crate::ComputeError;

use std::fmt;

type Producer<V> = Box<dyn Fn() -> V + Send + Sync + 'static>;
type TryProducer<V, E> = Box<dyn Fn() -> Result<V, E> + Send + Sync + 'static>;

fn single_slot_cache<V>() -> Cache<(), V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder().segments(1).build()
}

/// A value that is computed at most once and then shared by every caller.
///
/// `Singleton` is a [`Cache`] with exactly one key. The first `get` runs the
/// producer; concurrent callers block until it completes, and every caller
/// receives a clone of the same value. Store an `Arc<T>` to share a single
/// instance.
///
/// To make a process-wide instance, put it in a `once_cell::sync::Lazy` static.
///
/// # Examples
///
/// ```rust
/// use keyed_lazy_cache::sync::Singleton;
/// use once_cell::sync::Lazy;
///
/// use std::sync::Arc;
///
/// struct Registry {
///     names: Vec<&'static str>,
/// }
///
/// static REGISTRY: Lazy<Singleton<Arc<Registry>>> = Lazy::new(|| {
///     Singleton::new(|| Arc::new(Registry { names: vec!["a", "b"] }))
/// });
///
/// assert!(!REGISTRY.is_initialized());
/// let r1 = REGISTRY.get();
/// let r2 = REGISTRY.get();
/// assert!(Arc::ptr_eq(&r1, &r2));
/// assert_eq!(r1.names.len(), 2);
/// ```
pub struct Singleton<V> {
    cache: Cache<(), V>,
    producer: Producer<V>,
}

impl<V> Singleton<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a lazy singleton. `init` runs on the first call to `get`.
    pub fn new(init: impl Fn() -> V + Send + Sync + 'static) -> Self {
        Self {
            cache: single_slot_cache(),
            producer: Box::new(init),
        }
    }

    /// Creates a singleton and runs `init` before returning it.
    ///
    /// # Panics
    ///
    /// Propagates a panic from `init`.
    pub fn eager(init: impl Fn() -> V + Send + Sync + 'static) -> Self {
        let singleton = Self::new(init);
        singleton.get();
        singleton
    }

    /// Returns the value, computing it first if this is the first call.
    ///
    /// # Panics
    ///
    /// Propagates a panic from the producer. The singleton stays uninitialized and
    /// the next call runs the producer again.
    pub fn get(&self) -> V {
        self.cache.get_with((), &self.producer)
    }

    /// Returns the value if it has already been computed. Never runs the producer.
    pub fn get_if_initialized(&self) -> Option<V> {
        self.cache.get(&())
    }

    pub fn is_initialized(&self) -> bool {
        self.cache.contains_key(&())
    }
}

impl<V> fmt::Debug for Singleton<V>
where
    V: fmt::Debug + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Singleton")
            .field("value", &self.get_if_initialized())
            .finish()
    }
}

/// A [`Singleton`] whose producer may fail.
///
/// A failed attempt is not remembered. `get` returns the error to the callers of
/// that attempt, the singleton stays uninitialized, and the next `get` runs the
/// producer again.
///
/// # Examples
///
/// ```rust
/// use keyed_lazy_cache::sync::TrySingleton;
///
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// static ATTEMPTS: AtomicUsize = AtomicUsize::new(0);
///
/// let port = TrySingleton::new(|| {
///     // Fails the first time.
///     if ATTEMPTS.fetch_add(1, Ordering::AcqRel) == 0 {
///         "x".parse::<u16>()
///     } else {
///         "8080".parse::<u16>()
///     }
/// });
///
/// assert!(port.get().is_err());
/// assert!(!port.is_initialized());
/// assert_eq!(port.get().unwrap(), 8080);
/// ```
pub struct TrySingleton<V, E> {
    cache: Cache<(), V>,
    producer: TryProducer<V, E>,
}

impl<V, E> TrySingleton<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a lazy singleton. `init` runs on the first call to `get`.
    pub fn new(init: impl Fn() -> Result<V, E> + Send + Sync + 'static) -> Self {
        Self {
            cache: single_slot_cache(),
            producer: Box::new(init),
        }
    }

    /// Creates a singleton and runs `init` before returning it. If `init` fails,
    /// the error is returned instead of the singleton.
    pub fn eager(
        init: impl Fn() -> Result<V, E> + Send + Sync + 'static,
    ) -> Result<Self, ComputeError<E>> {
        let singleton = Self::new(init);
        singleton.get()?;
        Ok(singleton)
    }

    /// Returns the value, computing it first if it has not been computed yet.
    pub fn get(&self) -> Result<V, ComputeError<E>> {
        self.cache.try_get_with((), &self.producer)
    }

    /// Returns the value if it has already been computed. Never runs the producer.
    pub fn get_if_initialized(&self) -> Option<V> {
        self.cache.get(&())
    }

    pub fn is_initialized(&self) -> bool {
        self.cache.contains_key(&())
    }
}

impl<V, E> fmt::Debug for TrySingleton<V, E>
where
    V: fmt::Debug + Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrySingleton")
            .field("value", &self.get_if_initialized())
            .finish()
    }
}
