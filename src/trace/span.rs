use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::trace::ids::{SpanId, TraceId};
use crate::trace::metrics::TracingMetrics;
use crate::trace::span_buffer::SpanBuffer;

/// Classifies the direction of the work a span records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// Inbound work received, e.g. an incoming HTTP request.
    Entry,
    /// Outbound work initiated, e.g. a database query.
    Exit,
    /// Internal work performed between receiving and initiating.
    Intermediate,
}

// The wire format encodes kinds numerically.
impl Serialize for SpanKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value: u8 = match self {
            SpanKind::Entry => 1,
            SpanKind::Exit => 2,
            SpanKind::Intermediate => 3,
        };
        serializer.serialize_u8(value)
    }
}

/// Aggregate counts carried by a record that represents a merged group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BatchInfo {
    /// How many original spans this record stands for.
    #[serde(rename = "s")]
    pub count: u64,
    /// Sum of the original spans' own durations, in milliseconds.
    #[serde(rename = "d")]
    pub merged_duration: u64,
}

/// One observed unit of work, in its transmitted shape.
///
/// Records reference each other only by identifier, never by pointer, so a
/// record can be buffered and transmitted independently of its ancestors'
/// lifetimes. Field names map to the compact wire format on serialization.
#[derive(Clone, Debug, Serialize)]
pub struct SpanRecord {
    #[serde(rename = "t")]
    pub trace_id: TraceId,
    #[serde(rename = "s")]
    pub span_id: SpanId,
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    /// Symbolic type tag, e.g. `"sql"` or `"queue"`. Display name and
    /// batching equality key.
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "k")]
    pub kind: SpanKind,
    #[serde(rename = "ec")]
    pub error_count: u64,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "ts")]
    pub start_time: u64,
    /// Milliseconds; stays 0 until the span completes.
    #[serde(rename = "d")]
    pub duration: u64,
    #[serde(rename = "b", skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchInfo>,
    #[serde(rename = "stack", skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// Open, nested payload. By convention exactly one recognized top-level
    /// key holds the domain payload; an `"sdk"` key may coexist for manual
    /// annotations.
    pub data: Map<String, Value>,
}

impl SpanRecord {
    pub(crate) fn new(
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: Option<SpanId>,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        SpanRecord {
            trace_id,
            span_id,
            parent_span_id,
            name: name.into(),
            kind,
            error_count: 0,
            start_time: now_millis(),
            duration: 0,
            batch: None,
            stack_trace: None,
            data: Map::new(),
        }
    }

    /// End of the record's time interval, in milliseconds since the epoch.
    pub fn end_time(&self) -> u64 {
        self.start_time + self.duration
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

struct SpanState {
    record: SpanRecord,
    transmitted: bool,
    manual_end: bool,
    cleanups: Vec<Box<dyn FnOnce() + Send>>,
}

struct SpanInner {
    buffer: Option<Arc<SpanBuffer>>,
    metrics: Arc<TracingMetrics>,
    pseudo: bool,
    state: Mutex<SpanState>,
}

/// A live span, shared between the collaborator that started it and the
/// cleanup hooks registered in the active binding set.
///
/// Cloning is cheap and aliases the same span. The span moves through a
/// two-state machine: created (mutable) and completed (absorbing, reached
/// via [`transmit`], [`transmit_manual`] or [`cancel`], all idempotent).
///
/// [`transmit`]: Span::transmit
/// [`transmit_manual`]: Span::transmit_manual
/// [`cancel`]: Span::cancel
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

impl Span {
    pub(crate) fn new(
        record: SpanRecord,
        buffer: Option<Arc<SpanBuffer>>,
        metrics: Arc<TracingMetrics>,
        pseudo: bool,
    ) -> Self {
        Span {
            inner: Arc::new(SpanInner {
                buffer,
                metrics,
                pseudo,
                state: Mutex::new(SpanState {
                    record,
                    transmitted: false,
                    manual_end: false,
                    cleanups: Vec::new(),
                }),
            }),
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.lock_state().record.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.lock_state().record.span_id
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.lock_state().record.parent_span_id
    }

    pub fn name(&self) -> String {
        self.lock_state().record.name.clone()
    }

    pub fn kind(&self) -> SpanKind {
        self.lock_state().record.kind
    }

    /// `true` for spans recording outbound work. Collaborators must check
    /// this on the current span before starting a nested exit span; a leaf
    /// operation cannot itself cause another outbound operation to be traced
    /// as its child.
    pub fn is_exit_span(&self) -> bool {
        self.kind() == SpanKind::Exit
    }

    pub fn is_entry_span(&self) -> bool {
        self.kind() == SpanKind::Entry
    }

    /// `true` if this span only re-anchors a trace identity and is never
    /// transmitted.
    pub fn is_pseudo(&self) -> bool {
        self.inner.pseudo
    }

    pub fn is_transmitted(&self) -> bool {
        self.lock_state().transmitted
    }

    /// Mutates the underlying record while the span is still live.
    ///
    /// No-op after completion; the buffered snapshot is immutable.
    pub fn with_record<T>(&self, f: impl FnOnce(&mut SpanRecord) -> T) -> Option<T> {
        let mut state = self.lock_state();
        if state.transmitted {
            return None;
        }
        Some(f(&mut state.record))
    }

    /// Returns a copy of the record in its current state.
    pub fn snapshot(&self) -> SpanRecord {
        self.lock_state().record.clone()
    }

    /// Registers a hook to run exactly once when the span completes,
    /// regardless of how (transmit, manual transmit, or cancel).
    pub(crate) fn add_cleanup(&self, cleanup: Box<dyn FnOnce() + Send>) {
        let mut state = self.lock_state();
        if state.transmitted {
            // Completed already; fire immediately rather than never.
            drop(state);
            cleanup();
            return;
        }
        state.cleanups.push(cleanup);
    }

    /// Switches the span to manual-end mode: ordinary [`transmit`] calls
    /// from auto-instrumentation become no-ops and only
    /// [`transmit_manual`] finishes the span.
    ///
    /// [`transmit`]: Span::transmit
    /// [`transmit_manual`]: Span::transmit_manual
    pub fn disable_auto_end(&self) {
        self.lock_state().manual_end = true;
    }

    /// Completes the span and hands it to the buffer, unless it has already
    /// completed or is in manual-end mode.
    pub fn transmit(&self) {
        self.finish(true, true);
    }

    /// Completes the span and hands it to the buffer even in manual-end
    /// mode. This is the one call that ends a manually-managed span.
    pub fn transmit_manual(&self) {
        self.finish(false, true);
    }

    /// Completes the span without handing it to the buffer. Used when a
    /// span was started speculatively but turned out not to represent real
    /// work.
    pub fn cancel(&self) {
        self.finish(false, false);
    }

    fn finish(&self, respect_manual_end: bool, send: bool) {
        let (record, cleanups) = {
            let mut state = self.lock_state();
            if state.transmitted || (respect_manual_end && state.manual_end) {
                return;
            }
            state.transmitted = true;
            let cleanups = std::mem::take(&mut state.cleanups);
            let record = if send && !self.inner.pseudo {
                Some(state.record.clone())
            } else {
                None
            };
            (record, cleanups)
        };

        // Hooks restore context bindings and may re-enter span accessors,
        // so they run outside the state lock.
        for cleanup in cleanups {
            cleanup();
        }

        if let Some(record) = record {
            if let Some(buffer) = &self.inner.buffer {
                buffer.add_span(record);
            }
        }

        if !self.inner.pseudo {
            self.inner.metrics.increment_closed();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SpanState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Span")
            .field("trace_id", &state.record.trace_id)
            .field("span_id", &state.record.span_id)
            .field("name", &state.record.name)
            .field("kind", &state.record.kind)
            .field("transmitted", &state.transmitted)
            .field("pseudo", &self.inner.pseudo)
            .finish()
    }
}
