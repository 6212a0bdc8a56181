use std::time::Duration;

/// The default number of lock stripes of the map holding the computed entries.
pub(crate) const DEFAULT_NUM_SEGMENTS: usize = 16;

const YEAR_SECONDS: u64 = 365 * 24 * 3600;

/// Settings shared by the blocking and the async cache builders.
#[derive(Clone, Debug, Default)]
pub(crate) struct CacheConfig {
    pub(crate) name: Option<String>,
    pub(crate) initial_capacity: Option<usize>,
    pub(crate) num_segments: Option<usize>,
    #[cfg_attr(not(feature = "sync"), allow(dead_code))]
    pub(crate) wait_timeout: Option<Duration>,
    pub(crate) record_stats: bool,
}

impl CacheConfig {
    pub(crate) fn num_segments(&self) -> usize {
        self.num_segments.unwrap_or(DEFAULT_NUM_SEGMENTS)
    }

    pub(crate) fn initial_capacity(&self) -> usize {
        self.initial_capacity.unwrap_or_default()
    }
}

pub(crate) fn ensure_num_segments_or_panic(num_segments: usize) {
    assert!(num_segments > 0, "num_segments must be greater than zero");
}

#[cfg_attr(not(feature = "sync"), allow(dead_code))]
pub(crate) fn ensure_wait_timeout_or_panic(wait_timeout: Duration) {
    let max_duration = Duration::from_secs(1_000 * YEAR_SECONDS);
    assert!(
        wait_timeout <= max_duration,
        "wait_timeout is longer than 1000 years"
    );
}
