//! Span lifecycle, buffering and transmission.
//!
//! The [`Tracer`] starts spans and links them into the active flow via the
//! [`context`] module; completed spans land in the [`SpanBuffer`], which
//! merges short siblings and hands batches to a [`DownstreamSender`] on a
//! schedule.
//!
//! [`context`]: crate::context

mod export;
mod handle;
mod id_generator;
mod ids;
mod metrics;
mod span;
mod span_buffer;
mod tracer;

pub use export::{DownstreamSender, InMemorySender};
pub use handle::{SpanHandle, SDK_DATA_KEY};
#[cfg(any(feature = "testing", test))]
pub use id_generator::SequentialIdGenerator;
pub use id_generator::{IdGenerator, RandomIdGenerator};
pub use ids::{SpanId, TraceId};
pub use metrics::{CounterSnapshot, TracingMetrics};
pub use span::{BatchInfo, Span, SpanKind, SpanRecord};
pub use span_buffer::{BufferConfig, BufferConfigBuilder, SpanBuffer};
pub use tracer::{
    current_entry_span, current_span, current_trace_context, is_tracing, reduced_span,
    set_reduced_span, set_tracing_level, tracing_suppressed, SpanOptions, Tracer,
};
