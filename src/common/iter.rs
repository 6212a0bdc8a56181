use std::sync::Arc;

// This trait is implemented by the segmented map holding the ready entries.
pub(crate) trait ScanningGet<K, V> {
    /// Returns the number of segments in the map.
    fn num_segments(&self) -> usize;

    /// Returns clones of the entries in the specified segment, or `None` if the
    /// segment does not exist.
    fn entries(&self, segment: usize) -> Option<Vec<(Arc<K>, V)>>;
}

/// Iterator visiting all computed key-value pairs in a cache in arbitrary order.
///
/// The iterator takes a snapshot of one internal segment at a time, so it never
/// blocks producers for longer than a segment copy. Entries computed while the
/// iteration is in progress may or may not be visited.
///
/// Call `Cache::iter` of [`sync::Cache`](crate::sync::Cache) or
/// [`future::Cache`](crate::future::Cache) to obtain an `Iter`.
pub struct Iter<'i, K, V> {
    map: &'i dyn ScanningGet<K, V>,
    num_segments: usize,
    seg_index: usize,
    current: std::vec::IntoIter<(Arc<K>, V)>,
}

impl<'i, K, V> Iter<'i, K, V> {
    pub(crate) fn new(map: &'i dyn ScanningGet<K, V>) -> Self {
        Self {
            map,
            num_segments: map.num_segments(),
            seg_index: 0,
            current: Vec::new().into_iter(),
        }
    }
}

impl<'i, K, V> Iterator for Iter<'i, K, V> {
    type Item = (Arc<K>, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.current.next() {
                return Some(entry);
            }
            if self.seg_index >= self.num_segments {
                return None;
            }
            self.current = self
                .map
                .entries(self.seg_index)
                .unwrap_or_default()
                .into_iter();
            self.seg_index += 1;
        }
    }
}
