//! Provides a thread-safe, blocking cache that computes each value at most once,
//! and the single-value [`Singleton`] built on top of it.

mod builder;
mod cache;
mod singleton;
mod value_initializer;

pub use crate::common::iter::Iter;
pub use {
    builder::CacheBuilder,
    cache::Cache,
    singleton::{Singleton, TrySingleton},
};
