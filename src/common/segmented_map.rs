//! A lock-striped hash map addressed by precomputed hashes.
//!
//! The API follows the shape of a concurrent hash table: callers hash a key once
//! with [`SegmentedHashMap::hash`] and then pass the hash together with an
//! equality closure. This lets the caches look up an `Arc<K>`-keyed entry with a
//! borrowed `&Q` where `K: Borrow<Q>`, which `std::collections::HashMap` cannot
//! do for `Arc<K>` keys.
//!
//! Each segment is a `parking_lot::RwLock` over a map from the full 64-bit hash
//! to a small bucket of entries. Readers only ever take the shared lock.

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    hash::{BuildHasher, Hash, Hasher},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use super::iter::ScanningGet;

// Full 64-bit hash collisions are rare, so one inline slot is enough.
type Bucket<K, V> = SmallVec<[(Arc<K>, V); 1]>;
type Segment<K, V, S> = CachePadded<RwLock<HashMap<u64, Bucket<K, V>, S>>>;

pub(crate) struct SegmentedHashMap<K, V, S> {
    segments: Box<[Segment<K, V, S>]>,
    build_hasher: S,
    len: AtomicUsize,
    segment_shift: u32,
}

impl<K, V, S> SegmentedHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    /// # Panics
    ///
    /// Panics if `num_segments` is 0.
    pub(crate) fn with_num_segments_capacity_and_hasher(
        num_segments: usize,
        capacity: usize,
        build_hasher: S,
    ) -> Self {
        assert!(num_segments > 0);

        let actual_num_segments = num_segments.next_power_of_two();
        let segment_shift = 64 - actual_num_segments.trailing_zeros();
        let seg_capacity = (capacity + actual_num_segments - 1) / actual_num_segments;

        let segments = (0..actual_num_segments)
            .map(|_| {
                CachePadded::new(RwLock::new(HashMap::with_capacity_and_hasher(
                    seg_capacity,
                    build_hasher.clone(),
                )))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            segments,
            build_hasher,
            len: AtomicUsize::default(),
            segment_shift,
        }
    }

    pub(crate) fn with_num_segments_and_hasher(num_segments: usize, build_hasher: S) -> Self {
        Self::with_num_segments_capacity_and_hasher(num_segments, 0, build_hasher)
    }

    #[inline]
    pub(crate) fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn build_hasher(&self) -> &S {
        &self.build_hasher
    }

    pub(crate) fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a clone of the value whose key satisfies `eq`.
    pub(crate) fn get(&self, hash: u64, mut eq: impl FnMut(&K) -> bool) -> Option<V>
    where
        V: Clone,
    {
        let segment = self.select(hash).read();
        segment
            .get(&hash)?
            .iter()
            .find(|(k, _)| eq(k))
            .map(|(_, v)| v.clone())
    }

    pub(crate) fn contains_key(&self, hash: u64, mut eq: impl FnMut(&K) -> bool) -> bool {
        let segment = self.select(hash).read();
        segment
            .get(&hash)
            .map(|bucket| bucket.iter().any(|(k, _)| eq(k)))
            .unwrap_or_default()
    }

    /// Inserts the entry only when no entry for the key exists. Returns a clone of
    /// the existing value if there was one, or `None` if the entry was inserted.
    pub(crate) fn insert_if_not_present(&self, key: Arc<K>, hash: u64, value: V) -> Option<V>
    where
        V: Clone,
    {
        let mut segment = self.select(hash).write();
        let bucket = segment.entry(hash).or_default();
        if let Some((_, existing)) = bucket.iter().find(|(k, _)| **k == *key) {
            return Some(existing.clone());
        }
        bucket.push((key, value));
        self.len.fetch_add(1, Ordering::AcqRel);
        None
    }

    /// Removes the entry whose key satisfies `eq`, but only if `condition`
    /// returns `true` for it.
    pub(crate) fn remove_if(
        &self,
        hash: u64,
        mut eq: impl FnMut(&K) -> bool,
        mut condition: impl FnMut(&K, &V) -> bool,
    ) -> Option<V> {
        let mut segment = self.select(hash).write();
        let bucket = segment.get_mut(&hash)?;
        let index = bucket.iter().position(|(k, v)| eq(k) && condition(k, v))?;
        let (_, value) = bucket.swap_remove(index);
        if bucket.is_empty() {
            segment.remove(&hash);
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    #[inline]
    fn select(&self, hash: u64) -> &RwLock<HashMap<u64, Bucket<K, V>, S>> {
        let index = if self.segment_shift == 64 {
            0
        } else {
            (hash >> self.segment_shift) as usize
        };
        &self.segments[index]
    }
}

impl<K, V, S> ScanningGet<K, V> for SegmentedHashMap<K, V, S>
where
    K: Eq + Hash,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn num_segments(&self) -> usize {
        self.segments.len()
    }

    fn entries(&self, segment: usize) -> Option<Vec<(Arc<K>, V)>> {
        let segment = self.segments.get(segment)?.read();
        let entries = segment
            .values()
            .flat_map(|bucket| bucket.iter())
            .map(|(k, v)| (Arc::clone(k), v.clone()))
            .collect();
        Some(entries)
    }
}
