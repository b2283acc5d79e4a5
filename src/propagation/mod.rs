//! Interoperable trace-context carriers for process boundaries.

mod trace_context;

pub use trace_context::{
    TraceContext, TraceContextError, TRACEPARENT_HEADER, TRACESTATE_HEADER,
};
