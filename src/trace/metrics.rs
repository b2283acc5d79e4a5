use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters describing tracing activity since the last harvest.
///
/// The host polls these on its reporting interval via
/// [`TracingMetrics::get_and_reset`]; every read resets the counters to zero
/// so each snapshot covers exactly one interval.
#[derive(Debug, Default)]
pub struct TracingMetrics {
    opened: AtomicU64,
    closed: AtomicU64,
    dropped: AtomicU64,
}

/// One harvest of the tracing activity counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Spans started since the last snapshot.
    pub opened: u64,
    /// Spans completed (transmitted or cancelled) since the last snapshot.
    pub closed: u64,
    /// Spans discarded because the buffer was over capacity.
    pub dropped: u64,
}

impl TracingMetrics {
    pub(crate) fn increment_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Takes a snapshot of all counters and resets them to zero.
    pub fn get_and_reset(&self) -> CounterSnapshot {
        CounterSnapshot {
            opened: self.opened.swap(0, Ordering::Relaxed),
            closed: self.closed.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_counters() {
        let metrics = TracingMetrics::default();
        metrics.increment_opened();
        metrics.increment_opened();
        metrics.increment_closed();
        metrics.increment_dropped(3);

        let snapshot = metrics.get_and_reset();
        assert_eq!(
            snapshot,
            CounterSnapshot {
                opened: 2,
                closed: 1,
                dropped: 3
            }
        );

        let empty = metrics.get_and_reset();
        assert_eq!(
            empty,
            CounterSnapshot {
                opened: 0,
                closed: 0,
                dropped: 0
            }
        );
    }
}
