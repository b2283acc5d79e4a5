//! Span lifecycle control and the well-known context bindings.
//!
//! The [`Tracer`] is the entry point for per-library adapters: it builds
//! span records, links them to whatever span is currently active in the
//! binding set, and registers the cleanup hooks that un-bind them again on
//! completion. The free functions at the bottom are the ambient read side
//! (`current_span()` and friends) that adapters call from anywhere inside a
//! traced flow.

use std::backtrace::Backtrace;
use std::sync::Arc;

use crate::agent_warn;
use crate::context::AsyncContext;
use crate::propagation::TraceContext;
use crate::trace::id_generator::{IdGenerator, RandomIdGenerator};
use crate::trace::ids::{SpanId, TraceId};
use crate::trace::metrics::TracingMetrics;
use crate::trace::span::{Span, SpanKind, SpanRecord};
use crate::trace::span_buffer::SpanBuffer;

/// Binding: the span whose operation is currently running.
#[derive(Clone, Debug)]
struct CurrentSpan(Span);

/// Binding: the entry span of the current flow. Framework-level annotation
/// (e.g. attaching a route template) always targets the entry span, even if
/// an intermediate span is nominally current.
#[derive(Clone, Debug)]
struct CurrentEntrySpan(Span);

/// Binding: a short-lived fallback parent, used after a span retires while a
/// trailing async operation still needs one.
#[derive(Clone, Debug)]
struct ReducedSpan(Span);

/// Binding: the tracing level for this flow. A level starting with `'0'`
/// suppresses tracing.
#[derive(Clone, Debug)]
struct TracingLevel(String);

/// Binding: the distributed trace-context carrier inherited from upstream.
#[derive(Clone, Debug)]
struct CurrentTraceContext(TraceContext);

/// Arguments for [`Tracer::start_span`].
///
/// `kind` is optional so a collaborator that failed to determine one can
/// still start a span; the tracer warns and falls back to [`SpanKind::Exit`].
#[derive(Debug, Default)]
pub struct SpanOptions {
    pub name: String,
    pub kind: Option<SpanKind>,
    /// Externally supplied trace continuation; when set, `parent_span_id`
    /// is taken as given instead of resolved from the binding set.
    pub trace_id: Option<TraceId>,
    pub parent_span_id: Option<SpanId>,
    pub trace_context: Option<TraceContext>,
}

impl SpanOptions {
    pub fn new(name: impl Into<String>) -> Self {
        SpanOptions {
            name: name.into(),
            ..SpanOptions::default()
        }
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_parent_span_id(mut self, parent_span_id: SpanId) -> Self {
        self.parent_span_id = Some(parent_span_id);
        self
    }

    pub fn with_trace_context(mut self, trace_context: TraceContext) -> Self {
        self.trace_context = Some(trace_context);
        self
    }
}

/// Builds spans and links them into the active flow.
#[derive(Debug)]
pub struct Tracer {
    buffer: Arc<SpanBuffer>,
    metrics: Arc<TracingMetrics>,
    id_generator: Box<dyn IdGenerator>,
    capture_stack_traces: bool,
}

impl Tracer {
    pub fn new(buffer: Arc<SpanBuffer>, metrics: Arc<TracingMetrics>) -> Self {
        Tracer {
            buffer,
            metrics,
            id_generator: Box::new(RandomIdGenerator::default()),
            capture_stack_traces: false,
        }
    }

    /// Replaces the id source, e.g. with a deterministic one in tests.
    pub fn with_id_generator(mut self, id_generator: Box<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Captures a stack trace into every started span, for diagnostics.
    pub fn with_stack_trace_capture(mut self, enabled: bool) -> Self {
        self.capture_stack_traces = enabled;
        self
    }

    /// Starts a span and registers it as the current span of the active
    /// flow, with a cleanup hook that un-registers it on completion.
    ///
    /// Parent resolution: explicitly supplied ids win, then the current
    /// span, otherwise the span becomes the root of a fresh trace. A fresh
    /// span id is always minted.
    pub fn start_span(&self, options: SpanOptions) -> Span {
        let kind = match options.kind {
            Some(kind) => kind,
            None => {
                agent_warn!(
                    name: "span_kind_missing",
                    span_name = options.name.clone(),
                    message = "No span kind was supplied, falling back to an exit span"
                );
                SpanKind::Exit
            }
        };

        let cx = AsyncContext::current();
        let parent = cx.get::<CurrentSpan>().map(|binding| binding.0);
        let span_id = self.id_generator.new_span_id();
        let (trace_id, parent_span_id) = match options.trace_id {
            Some(trace_id) => (trace_id, options.parent_span_id),
            None => match &parent {
                Some(parent) => (parent.trace_id(), Some(parent.span_id())),
                None => (self.id_generator.new_trace_id(), None),
            },
        };

        let mut record = SpanRecord::new(trace_id, span_id, parent_span_id, options.name, kind);
        if self.capture_stack_traces {
            record.stack_trace = Some(Backtrace::force_capture().to_string());
        }
        let span = Span::new(
            record,
            Some(self.buffer.clone()),
            self.metrics.clone(),
            false,
        );

        // The parent's carrier is cloned, never mutated: siblings started
        // later must still see the parent's identifiers.
        let inherited = options
            .trace_context
            .or_else(|| cx.get::<CurrentTraceContext>().map(|binding| binding.0));
        if let Some(mut trace_context) = inherited {
            trace_context.update_parent(trace_id, span_id);
            let undo = cx.set(CurrentTraceContext(trace_context));
            span.add_cleanup(Box::new(move || undo.undo()));
        }

        if kind == SpanKind::Entry {
            let undo = cx.set(CurrentEntrySpan(span.clone()));
            span.add_cleanup(Box::new(move || undo.undo()));
        }
        let undo = cx.set(CurrentSpan(span.clone()));
        span.add_cleanup(Box::new(move || undo.undo()));

        self.metrics.increment_opened();
        span
    }

    /// Re-anchors an existing trace identity in the active flow, e.g. when a
    /// worker picks up a job that was produced under another process's entry
    /// span. The span is never transmitted and only exists so children can
    /// attach to it.
    ///
    /// Both identifiers are required; a missing one logs a warning and the
    /// call becomes a no-op.
    pub fn start_pseudo_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        trace_id: Option<TraceId>,
        span_id: Option<SpanId>,
    ) -> Option<Span> {
        let name = name.into();
        let (Some(trace_id), Some(span_id)) = (trace_id, span_id) else {
            agent_warn!(
                name: "pseudo_span_missing_ids",
                span_name = name.clone(),
                message = "A pseudo span needs both a trace id and a span id"
            );
            return None;
        };

        let record = SpanRecord::new(trace_id, span_id, None, name, kind);
        let span = Span::new(record, None, self.metrics.clone(), true);

        let cx = AsyncContext::current();
        if kind == SpanKind::Entry {
            let undo = cx.set(CurrentEntrySpan(span.clone()));
            span.add_cleanup(Box::new(move || undo.undo()));
        }
        let undo = cx.set(CurrentSpan(span.clone()));
        span.add_cleanup(Box::new(move || undo.undo()));

        Some(span)
    }

    /// `true` if the current span records outbound work. Collaborators call
    /// this before starting an exit span; nesting one exit under another is
    /// a protocol violation this module does not structurally prevent.
    pub fn exit_span_in_progress(&self) -> bool {
        current_span().is_some_and(|span| span.is_exit_span())
    }
}

/// The span currently active in this flow, if any.
pub fn current_span() -> Option<Span> {
    AsyncContext::map_current(|cx| cx.get::<CurrentSpan>()).map(|binding| binding.0)
}

/// The entry span of this flow, if any.
pub fn current_entry_span() -> Option<Span> {
    AsyncContext::map_current(|cx| cx.get::<CurrentEntrySpan>()).map(|binding| binding.0)
}

/// The fallback parent span of this flow, if any.
pub fn reduced_span() -> Option<Span> {
    AsyncContext::map_current(|cx| cx.get::<ReducedSpan>()).map(|binding| binding.0)
}

/// Installs a fallback parent for trailing async operations of a span that
/// has already retired.
pub fn set_reduced_span(span: Span) {
    let _ = AsyncContext::current().set(ReducedSpan(span));
}

/// The distributed trace-context carrier bound to this flow, if any.
pub fn current_trace_context() -> Option<TraceContext> {
    AsyncContext::map_current(|cx| cx.get::<CurrentTraceContext>()).map(|binding| binding.0)
}

/// Sets the tracing level for this flow. A level starting with `'0'`
/// suppresses tracing.
pub fn set_tracing_level(level: impl Into<String>) {
    let _ = AsyncContext::current().set(TracingLevel(level.into()));
}

/// `true` if the current flow has tracing suppressed via its level.
pub fn tracing_suppressed() -> bool {
    AsyncContext::map_current(|cx| cx.get::<TracingLevel>())
        .map(|binding| binding.0.starts_with('0'))
        .unwrap_or(false)
}

/// `true` if a span is active in this flow and tracing is not suppressed.
pub fn is_tracing() -> bool {
    !tracing_suppressed() && current_span().is_some()
}
