use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SendResult;
use crate::trace::span::SpanRecord;

/// Accepts batches of completed span records for delivery to a backend.
///
/// This is the one outward-facing seam of the engine. The returned result is
/// the only feedback channel: `Err` makes the buffer re-queue the batch for
/// the next scheduled transmission. Implementations apply their own
/// timeouts; the engine has none.
pub trait DownstreamSender: Send + Sync + fmt::Debug {
    /// Delivers one batch. The engine retains ownership of the records so a
    /// failed batch can be re-queued without copying.
    fn send_spans(&self, spans: &[SpanRecord]) -> SendResult;
}

/// A [`DownstreamSender`] that stores batches in memory.
///
/// ```
/// use tracecore::trace::InMemorySender;
///
/// let sender = InMemorySender::default();
/// // ... hand a clone to a SpanBuffer, drive some spans through ...
/// let spans = sender.get_finished_spans();
/// ```
#[derive(Clone, Default, Debug)]
pub struct InMemorySender {
    spans: Arc<Mutex<Vec<SpanRecord>>>,
}

impl InMemorySender {
    /// Returns all records received so far.
    pub fn get_finished_spans(&self) -> Vec<SpanRecord> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of batches is not tracked; this is the total record count.
    pub fn span_count(&self) -> usize {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Clears the stored records.
    pub fn reset(&self) {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl DownstreamSender for InMemorySender {
    fn send_spans(&self, spans: &[SpanRecord]) -> SendResult {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(spans);
        Ok(())
    }
}
