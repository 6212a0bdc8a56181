use std::{sync::Arc, time::Duration};

/// The error type for the `try_get_with` family of methods and for
/// [`TrySingleton`](crate::sync::TrySingleton).
///
/// A failed computation is never cached. The key stays absent, and the next call
/// for it runs the producer again.
#[derive(thiserror::Error, Debug)]
pub enum ComputeError<E> {
    /// The producer returned an error.
    ///
    /// The same error is handed to the caller that ran the producer and to every
    /// caller that was waiting on that attempt, hence the `Arc`.
    #[error("the producer for this key failed")]
    ProducerFailed(#[source] Arc<E>),
    /// This caller gave up waiting for a producer running in another thread.
    ///
    /// The other producer keeps running; if it succeeds its value is cached as
    /// usual. Returned only when the cache was built with
    /// [`wait_timeout`](crate::sync::CacheBuilder::wait_timeout).
    #[error("timed out after {0:?} waiting for another caller's producer")]
    WaitTimedOut(Duration),
}

impl<E> ComputeError<E> {
    /// Returns the producer's error, if this is a `ProducerFailed`.
    pub fn producer_error(&self) -> Option<&Arc<E>> {
        match self {
            Self::ProducerFailed(e) => Some(e),
            Self::WaitTimedOut(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimedOut(_))
    }
}

impl<E> Clone for ComputeError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::ProducerFailed(e) => Self::ProducerFailed(Arc::clone(e)),
            Self::WaitTimedOut(d) => Self::WaitTimedOut(*d),
        }
    }
}
