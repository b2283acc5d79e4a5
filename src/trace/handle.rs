//! A restricted span view for SDK users.
//!
//! Adapters inside the agent hold a full [`Span`]; application code that
//! wants to enrich a trace gets a [`SpanHandle`] instead. The handle hides
//! the lifecycle internals and degrades to a no-op when no span is active,
//! so user code never has to branch on "am I currently traced".

use serde_json::{Map, Value};

use crate::trace::ids::{SpanId, TraceId};
use crate::trace::span::{now_millis, Span, SpanKind};
use crate::trace::tracer::current_span;

/// Annotation key under which manual SDK writes land by convention.
pub const SDK_DATA_KEY: &str = "sdk";

/// A handle to the span currently active in the calling flow, or a no-op
/// stand-in when there is none.
#[derive(Clone, Debug, Default)]
pub struct SpanHandle {
    span: Option<Span>,
}

impl SpanHandle {
    /// Handle for the current span. Always succeeds; when no span is active
    /// the handle is a no-op, see [`is_noop`].
    ///
    /// [`is_noop`]: SpanHandle::is_noop
    pub fn current() -> SpanHandle {
        SpanHandle {
            span: current_span(),
        }
    }

    /// Handle for a specific span, e.g. one an adapter is holding on to.
    pub fn from_span(span: Span) -> SpanHandle {
        SpanHandle { span: Some(span) }
    }

    /// `true` when there was no active span and every operation on this
    /// handle does nothing.
    pub fn is_noop(&self) -> bool {
        self.span.is_none()
    }

    pub fn trace_id(&self) -> Option<TraceId> {
        self.span.as_ref().map(Span::trace_id)
    }

    pub fn span_id(&self) -> Option<SpanId> {
        self.span.as_ref().map(Span::span_id)
    }

    pub fn is_entry_span(&self) -> bool {
        self.kind() == Some(SpanKind::Entry)
    }

    pub fn is_exit_span(&self) -> bool {
        self.kind() == Some(SpanKind::Exit)
    }

    pub fn is_intermediate_span(&self) -> bool {
        self.kind() == Some(SpanKind::Intermediate)
    }

    fn kind(&self) -> Option<SpanKind> {
        self.span.as_ref().map(Span::kind)
    }

    /// Writes a value into the span's `data` payload at a dotted path,
    /// creating nested objects along the way.
    ///
    /// ```
    /// # use tracecore::trace::SpanHandle;
    /// # use serde_json::json;
    /// let handle = SpanHandle::current();
    /// handle.annotate("sdk.custom.tags.user_tier", json!("gold"));
    /// ```
    pub fn annotate(&self, path: &str, value: Value) {
        let segments = path.split('.').filter(|s| !s.is_empty()).collect::<Vec<_>>();
        self.annotate_path(&segments, value);
    }

    /// Like [`annotate`], with the path pre-split. Use this when a segment
    /// legitimately contains a dot (e.g. a hostname used as a key).
    ///
    /// [`annotate`]: SpanHandle::annotate
    pub fn annotate_path(&self, path: &[&str], value: Value) {
        let Some(span) = &self.span else { return };
        if path.is_empty() {
            return;
        }
        span.with_record(|record| write_at_path(&mut record.data, path, value));
    }

    /// Marks the span as erroneous; the count accumulates.
    pub fn mark_as_erroneous(&self) {
        if let Some(span) = &self.span {
            span.with_record(|record| record.error_count += 1);
        }
    }

    /// Keeps auto-instrumentation from completing the span; only [`end`]
    /// will.
    ///
    /// [`end`]: SpanHandle::end
    pub fn disable_auto_end(&self) {
        if let Some(span) = &self.span {
            span.disable_auto_end();
        }
    }

    /// Completes the span manually: sets its duration to now minus start,
    /// folds in `error_count` if given, and transmits regardless of
    /// manual-end mode.
    pub fn end(&self, error_count: Option<u64>) {
        let Some(span) = &self.span else { return };
        span.with_record(|record| {
            record.duration = now_millis().saturating_sub(record.start_time);
            if let Some(error_count) = error_count {
                record.error_count += error_count;
            }
        });
        span.transmit_manual();
    }
}

fn write_at_path(data: &mut Map<String, Value>, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = data;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        // A scalar in the way is replaced by an object; the deeper write
        // wins, as with the reference SDK.
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(object) => object,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}
