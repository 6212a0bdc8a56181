use std::{any::Any, sync::Arc, time::Duration};

pub(crate) mod base_cache;
pub(crate) mod builder_utils;
pub(crate) mod error;
pub(crate) mod iter;
pub(crate) mod segmented_map;
pub(crate) mod stats_counter;
pub(crate) mod time;

use self::error::ComputeError;

/// A type-erased producer error shared between the caller that ran the producer
/// and the callers waiting on it. Waiters downcast it back to their own error
/// type.
pub(crate) type ErrorObject = Arc<dyn Any + Send + Sync + 'static>;

pub(crate) enum InitResult<V, E> {
    /// This caller ran the producer and the value is now cached.
    Initialized(V),
    /// The value was produced by another caller.
    ReadExisting(V),
    /// The producer failed in this attempt. Nothing was cached.
    InitErr(Arc<E>),
    /// Gave up waiting for another caller's producer. Only the blocking cache
    /// supports wait timeouts.
    #[cfg_attr(not(feature = "sync"), allow(dead_code))]
    WaitTimedOut(Duration),
}

impl<V, E> InitResult<V, E> {
    pub(crate) fn into_result(self) -> Result<V, ComputeError<E>> {
        use InitResult::*;
        match self {
            Initialized(v) | ReadExisting(v) => Ok(v),
            InitErr(e) => Err(ComputeError::ProducerFailed(e)),
            WaitTimedOut(d) => Err(ComputeError::WaitTimedOut(d)),
        }
    }
}

pub(crate) fn available_parallelism() -> usize {
    use std::{num::NonZeroUsize, thread::available_parallelism};
    available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

/// The `[name] ` prefix of the log messages of a named cache.
#[cfg(feature = "logging")]
pub(crate) fn log_prefix(cache_name: Option<&str>) -> String {
    cache_name
        .map(|name| format!("[{name}] "))
        .unwrap_or_default()
}

#[cfg(feature = "logging")]
pub(crate) fn log_panic(payload: &(dyn Any + Send + 'static), cache_name: Option<&str>) {
    // Try to downcast the payload into &str or String.
    //
    // NOTE: Clippy will complain if we use `if let Some(_)` here.
    // https://rust-lang.github.io/rust-clippy/master/index.html#manual_map
    let message: Option<std::borrow::Cow<'_, str>> =
        (payload.downcast_ref::<&str>().map(|s| (*s).into()))
            .or_else(|| payload.downcast_ref::<String>().map(Into::into));

    let cn = log_prefix(cache_name);

    if let Some(m) = message {
        log::error!("{cn}The producer panicked at '{m}'. Waiting callers will retry");
    } else {
        log::error!("{cn}The producer panicked. Waiting callers will retry");
    }
}
