//! Id Generator
#[cfg(any(feature = "testing", test))]
pub use sequential::SequentialIdGenerator;

use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;

use crate::trace::{SpanId, TraceId};

/// Interface for generating IDs
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SpanId`
    fn new_span_id(&self) -> SpanId;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates Trace and Span ids using a random number generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId::from(rng.borrow_mut().gen::<u128>()))
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| SpanId::from(rng.borrow_mut().gen::<u64>()))
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

#[cfg(any(feature = "testing", test))]
mod sequential {
    use crate::trace::{IdGenerator, SpanId, TraceId};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    /// [`IdGenerator`] implementation that increments a counter for each new ID. This helps produce
    /// predictable IDs for testing.
    #[derive(Clone, Debug)]
    pub struct SequentialIdGenerator(Arc<AtomicU64>);

    impl SequentialIdGenerator {
        /// Create a new [`SequentialIdGenerator`]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Default for SequentialIdGenerator {
        fn default() -> Self {
            Self(Arc::new(AtomicU64::new(1)))
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn new_trace_id(&self) -> TraceId {
            TraceId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as u128)
        }

        fn new_span_id(&self) -> SpanId {
            SpanId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_nonzero_and_distinct() {
        let generator = RandomIdGenerator::default();
        let mut trace_ids = std::collections::HashSet::new();
        let mut span_ids = std::collections::HashSet::new();
        for _ in 0..512 {
            let t = generator.new_trace_id();
            let s = generator.new_span_id();
            assert!(t.is_valid());
            assert!(s.is_valid());
            assert!(trace_ids.insert(t), "trace id collision: {t}");
            assert!(span_ids.insert(s), "span id collision: {s}");
        }
    }

    #[test]
    fn sequential_ids_are_predictable() {
        let generator = SequentialIdGenerator::new();
        assert_eq!(generator.new_trace_id(), TraceId::from(1u128));
        assert_eq!(generator.new_span_id(), SpanId::from(2u64));
        assert_eq!(generator.new_span_id(), SpanId::from(3u64));
    }
}
