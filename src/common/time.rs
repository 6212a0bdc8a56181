#[cfg(feature = "quanta")]
pub(crate) type Instant = quanta::Instant;

#[cfg(not(feature = "quanta"))]
pub(crate) type Instant = std::time::Instant;

/// Measures how long a producer takes, for the load statistics.
#[derive(Clone, Copy)]
pub(crate) struct LoadTimer {
    started_at: Instant,
}

impl LoadTimer {
    pub(crate) fn start() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub(crate) fn elapsed_nanos(&self) -> u64 {
        Instant::now()
            .duration_since(self.started_at)
            .as_nanos()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}
