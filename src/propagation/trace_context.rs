//! W3C trace-context carrier.
//!
//! Parses and renders the `traceparent` and `tracestate` headers so a trace
//! that crosses a process boundary keeps one identity across tracing
//! systems. The carrier preserves foreign `tracestate` entries and maintains
//! a single vendor entry (`tc=<trace id>;<parent id>`) holding the
//! identifiers this system last contributed.

use std::fmt;

use thiserror::Error;

use crate::trace::{SpanId, TraceId};

const SUPPORTED_VERSION: u8 = 0;
const MAX_VERSION: u8 = 254;

/// Header carrying version, trace id, parent id and flags.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Header carrying vendor-specific entries.
pub const TRACESTATE_HEADER: &str = "tracestate";

const VENDOR_KEY: &str = "tc";

// The W3C spec allows at most 32 tracestate entries; ours takes one slot.
const MAX_FOREIGN_STATE_ENTRIES: usize = 31;

/// Reasons an incoming pair of headers was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceContextError {
    #[error("traceparent header has too few sections")]
    TooFewSections,
    #[error("traceparent version is invalid or unsupported")]
    InvalidVersion,
    #[error("traceparent trace id is invalid")]
    InvalidTraceId,
    #[error("traceparent parent id is invalid")]
    InvalidParentId,
    #[error("traceparent flags are invalid")]
    InvalidFlags,
}

/// One parsed pair of W3C trace-context headers.
///
/// The carrier is a value type: it is cloned into every child span and the
/// clone updated, never the parent's copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: TraceId,
    parent_id: SpanId,
    sampled: bool,
    /// Foreign tracestate entries left of the vendor entry.
    state_head: Vec<String>,
    /// Identifiers carried in the vendor entry, if one was present.
    vendor: Option<(TraceId, SpanId)>,
    /// Foreign tracestate entries right of the vendor entry.
    state_tail: Vec<String>,
}

impl TraceContext {
    /// Builds a carrier for a trace that starts in this process.
    pub fn from_ids(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        TraceContext {
            trace_id,
            parent_id: span_id,
            sampled,
            state_head: Vec::new(),
            vendor: Some((trace_id, span_id)),
            state_tail: Vec::new(),
        }
    }

    /// Parses the incoming header pair.
    ///
    /// The `traceparent` header is validated strictly (length, lowercase
    /// hex, version range, non-zero identifiers); a malformed one rejects
    /// the whole carrier. A malformed `tracestate` never does: unusable
    /// entries are simply dropped, per the W3C processing rules.
    pub fn parse(traceparent: &str, tracestate: Option<&str>) -> Result<Self, TraceContextError> {
        let parts = traceparent.trim().split('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return Err(TraceContextError::TooFewSections);
        }

        if parts[0].len() != 2 || has_uppercase(parts[0]) {
            return Err(TraceContextError::InvalidVersion);
        }
        let version =
            u8::from_str_radix(parts[0], 16).map_err(|_| TraceContextError::InvalidVersion)?;
        // For version 0 there must be exactly 4 sections; future versions
        // may append more.
        if version > MAX_VERSION || version == SUPPORTED_VERSION && parts.len() != 4 {
            return Err(TraceContextError::InvalidVersion);
        }

        if parts[1].len() != 32 || has_uppercase(parts[1]) {
            return Err(TraceContextError::InvalidTraceId);
        }
        let trace_id =
            TraceId::from_hex(parts[1]).map_err(|_| TraceContextError::InvalidTraceId)?;
        if !trace_id.is_valid() {
            return Err(TraceContextError::InvalidTraceId);
        }

        if parts[2].len() != 16 || has_uppercase(parts[2]) {
            return Err(TraceContextError::InvalidParentId);
        }
        let parent_id =
            SpanId::from_hex(parts[2]).map_err(|_| TraceContextError::InvalidParentId)?;
        if !parent_id.is_valid() {
            return Err(TraceContextError::InvalidParentId);
        }

        if parts[3].len() != 2 || has_uppercase(parts[3]) {
            return Err(TraceContextError::InvalidFlags);
        }
        let flags =
            u8::from_str_radix(parts[3], 16).map_err(|_| TraceContextError::InvalidFlags)?;
        // Version 0 defines only the sampled bit.
        if version == SUPPORTED_VERSION && flags > 2 {
            return Err(TraceContextError::InvalidFlags);
        }
        let sampled = flags & 1 == 1;

        let mut context = TraceContext {
            trace_id,
            parent_id,
            sampled,
            state_head: Vec::new(),
            vendor: None,
            state_tail: Vec::new(),
        };
        if let Some(tracestate) = tracestate {
            context.parse_state(tracestate);
        }
        Ok(context)
    }

    fn parse_state(&mut self, tracestate: &str) {
        let mut foreign_kept = 0;
        for entry in tracestate.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            if key == VENDOR_KEY && self.vendor.is_none() {
                match parse_vendor_value(value) {
                    Some(ids) => self.vendor = Some(ids),
                    // An unusable vendor entry is dropped, not inherited.
                    None => continue,
                }
            } else if foreign_kept < MAX_FOREIGN_STATE_ENTRIES {
                if self.vendor.is_none() {
                    self.state_head.push(entry.to_string());
                } else {
                    self.state_tail.push(entry.to_string());
                }
                foreign_kept += 1;
            }
        }
    }

    /// Records this system's newest identifiers before the headers travel
    /// onward: the vendor entry is set and moved leftmost (it is the most
    /// recently updated one), `parent-id` points at the outgoing span, and
    /// the trace is marked sampled.
    pub fn update_parent(&mut self, trace_id: TraceId, span_id: SpanId) {
        self.vendor = Some((trace_id, span_id));
        self.parent_id = span_id;
        self.sampled = true;
        let mut tail = std::mem::take(&mut self.state_head);
        tail.append(&mut self.state_tail);
        self.state_tail = tail;
    }

    /// Renders the `traceparent` header value.
    pub fn render_traceparent(&self) -> String {
        format!(
            "{:02x}-{}-{}-{:02x}",
            SUPPORTED_VERSION,
            self.trace_id,
            self.parent_id,
            u8::from(self.sampled)
        )
    }

    /// Renders the `tracestate` header value, or `None` when there is
    /// nothing to carry.
    pub fn render_tracestate(&self) -> Option<String> {
        let mut entries = Vec::with_capacity(self.state_head.len() + self.state_tail.len() + 1);
        entries.extend(self.state_head.iter().cloned());
        if let Some((trace_id, span_id)) = self.vendor {
            entries.push(format!("{VENDOR_KEY}={trace_id};{span_id}"));
        }
        entries.extend(self.state_tail.iter().cloned());
        if entries.is_empty() {
            None
        } else {
            Some(entries.join(","))
        }
    }

    /// Trace id from `traceparent`. This is the foreign trace identity and
    /// may differ from the id in the vendor entry.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Parent id from `traceparent`.
    pub fn parent_id(&self) -> SpanId {
        self.parent_id
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }

    /// Trace id this system last wrote into the vendor entry.
    pub fn vendor_trace_id(&self) -> Option<TraceId> {
        self.vendor.map(|(trace_id, _)| trace_id)
    }

    /// Span id this system last wrote into the vendor entry.
    pub fn vendor_parent_id(&self) -> Option<SpanId> {
        self.vendor.map(|(_, span_id)| span_id)
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_traceparent())
    }
}

fn has_uppercase(section: &str) -> bool {
    section.chars().any(|c| c.is_ascii_uppercase())
}

fn parse_vendor_value(value: &str) -> Option<(TraceId, SpanId)> {
    let (trace_hex, span_hex) = value.split_once(';')?;
    if trace_hex.len() != 32 || span_hex.len() != 16 {
        return None;
    }
    let trace_id = TraceId::from_hex(trace_hex).ok()?;
    let span_id = SpanId::from_hex(span_hex).ok()?;
    (trace_id.is_valid() && span_id.is_valid()).then_some((trace_id, span_id))
}
