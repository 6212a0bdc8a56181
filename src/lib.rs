#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
// Temporary disable this lint as the MSRV (1.65) require an older lint name:
// #![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Keyed lazy cache is a concurrent cache library for Rust that computes the
//! value of each key at most once.
//!
//! A cache maps a key to the value produced by the first caller that asked for
//! it. Callers pass a producer along with the key. When many callers ask for the
//! same absent key at the same time, exactly one of them runs its producer and the
//! others wait for it, then everybody receives the same value. Callers asking for
//! distinct keys never wait for each other.
//!
//! Keyed lazy cache provides the following caches:
//!
//! - Thread-safe, blocking cache:
//!     - [`sync::Cache`][sync-cache-struct], with producers that are closures.
//! - Thread-safe, futures-aware cache:
//!     - [`future::Cache`][future-cache-struct], with producers that are futures.
//!
//! And a single-value variant built on the blocking cache:
//!
//! - [`sync::Singleton`][singleton-struct] and
//!   [`sync::TrySingleton`][try-singleton-struct]: a value computed lazily (on the
//!   first `get`) or eagerly (in the constructor), exactly once.
//!
//! [sync-cache-struct]: ./sync/struct.Cache.html
//! [future-cache-struct]: ./future/struct.Cache.html
//! [singleton-struct]: ./sync/struct.Singleton.html
//! [try-singleton-struct]: ./sync/struct.TrySingleton.html
//!
//! # Features
//!
//! - Computes each value at most once. A value that has been computed is never
//!   replaced, evicted or removed.
//! - A producer that fails (returns `Err`) is not remembered. The key stays
//!   absent and the next caller runs its producer again. The callers that were
//!   waiting on the failed attempt receive the same error.
//! - A producer that panics does not poison the cache. The panic is propagated to
//!   the caller that ran the producer, and the waiting callers retry.
//! - Lock-striped storage, so lookups of distinct keys rarely contend.
//! - Optional statistics and logging.
//!
//! # Examples
//!
//! See the following document:
//!
//! - Thread-safe, blocking cache:
//!     - [`sync::Cache`][sync-cache-struct]
//! - Thread-safe, futures-aware cache:
//!     - [`future::Cache`][future-cache-struct]
//!
//! # Minimum Supported Rust Versions
//!
//! This crate's minimum supported Rust versions (MSRV) are the followings:
//!
//! | Feature          | MSRV                       |
//! |:-----------------|:--------------------------:|
//! | default features | Rust 1.65.0 (Nov 3, 2022)  |
//!
//! It will keep a rolling MSRV policy of at least 6 months. If only the default
//! features are enabled, MSRV will be updated conservatively.

#[cfg(not(any(feature = "sync", feature = "future")))]
compile_error!(
    "At least one of the crate features `sync` or `future` must be enabled for \
    `keyed-lazy-cache` crate. Please update your dependencies in Cargo.toml"
);

#[cfg(feature = "future")]
#[cfg_attr(docsrs, doc(cfg(feature = "future")))]
pub mod future;

#[cfg(feature = "sync")]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub mod sync;

pub(crate) mod common;
pub mod stats;

pub use common::error::ComputeError;
pub use common::iter::Iter;
