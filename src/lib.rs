//! Tracing core of an application-performance-monitoring agent.
//!
//! The crate tracks causally related units of work ("spans") across
//! asynchronous execution, assembles them into traces, and prepares them for
//! efficient transmission to a backend collector. It is meant to be embedded
//! by per-library adapters, which consume a narrow interface: start a span,
//! annotate it, transmit it.
//!
//! # Getting started
//!
//! ```
//! use std::sync::Arc;
//! use tracecore::context;
//! use tracecore::trace::{
//!     BufferConfig, InMemorySender, SpanBuffer, SpanKind, SpanOptions, Tracer, TracingMetrics,
//! };
//!
//! let sender = Arc::new(InMemorySender::default());
//! let metrics = Arc::new(TracingMetrics::default());
//! let buffer = SpanBuffer::new(sender, BufferConfig::default(), metrics.clone());
//! buffer.activate();
//!
//! let tracer = Tracer::new(buffer.clone(), metrics);
//!
//! // One logical flow, e.g. an inbound request.
//! context::run(|| {
//!     let span = tracer.start_span(SpanOptions::new("http").with_kind(SpanKind::Entry));
//!     // ... do the work, start child spans, annotate ...
//!     span.transmit();
//! });
//!
//! buffer.deactivate();
//! ```
//!
//! # Modules
//!
//! - [`context`]: execution-scoped binding propagation; makes "the current
//!   span" an ambient value that follows a logical flow across async
//!   continuations and threads.
//! - [`trace`]: the span lifecycle, the buffering/merging engine, and the
//!   activity counters.
//! - [`propagation`]: the W3C trace-context carrier for crossing process
//!   boundaries.

pub mod context;
pub mod propagation;
pub mod trace;

mod error;
mod internal_logging;

pub use error::{SendResult, TraceError};

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
