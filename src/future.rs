//! Provides a thread-safe, concurrent asynchronous (futures aware) cache that
//! computes each value at most once.
//!
//! To use this module, enable a crate feature called "future".

mod builder;
mod cache;
mod value_initializer;

pub use crate::common::iter::Iter;
pub use {builder::CacheBuilder, cache::Cache};
