//! Span buffering, merging and transmission scheduling.
//!
//! Completed span records accumulate in a [`SpanBuffer`] until a recurring
//! flush hands them to the [`DownstreamSender`]. Short sibling spans of the
//! same registered name are opportunistically merged into one record before
//! transmission to reduce volume.

use std::collections::{HashMap, HashSet};
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::trace::export::DownstreamSender;
use crate::trace::ids::TraceId;
use crate::trace::metrics::TracingMetrics;
use crate::trace::span::{BatchInfo, SpanRecord};
use crate::{agent_debug, agent_warn};

/// Delay in milliseconds between two consecutive scheduled transmissions.
pub(crate) const TRACECORE_TRANSMISSION_DELAY: &str = "TRACECORE_TRANSMISSION_DELAY";
pub(crate) const TRACECORE_TRANSMISSION_DELAY_DEFAULT: u64 = 1_000;

/// Hard cap on buffered spans; the oldest excess is dropped.
pub(crate) const TRACECORE_MAX_BUFFERED_SPANS: &str = "TRACECORE_MAX_BUFFERED_SPANS";
pub(crate) const TRACECORE_MAX_BUFFERED_SPANS_DEFAULT: usize = 1_000;

/// Buffer length at which a flush is triggered ahead of schedule.
pub(crate) const TRACECORE_FORCE_TRANSMISSION_STARTING_AT: &str =
    "TRACECORE_FORCE_TRANSMISSION_STARTING_AT";
pub(crate) const TRACECORE_FORCE_TRANSMISSION_STARTING_AT_DEFAULT: usize = 500;

/// Minimum time in milliseconds after activation before a forced flush may
/// fire; guards against bursts immediately at startup.
pub(crate) const TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING: &str =
    "TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING";
pub(crate) const TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING_DEFAULT: u64 = 1_000;

/// Spans with a duration at or above this many milliseconds are never merged.
pub(crate) const TRACECORE_DEV_BATCH_THRESHOLD: &str = "TRACECORE_DEV_BATCH_THRESHOLD";
pub(crate) const TRACECORE_DEV_BATCH_THRESHOLD_DEFAULT: u64 = 10;

/// Span buffer configuration.
/// Use [`BufferConfigBuilder`] to configure your own instance of
/// [`BufferConfig`].
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// The delay between two consecutive scheduled transmissions. The
    /// default value is 1 second.
    pub(crate) transmission_delay: Duration,

    /// The maximum number of spans held in the buffer. When the buffer grows
    /// beyond it, the oldest excess spans are dropped. The default value is
    /// 1000.
    pub(crate) max_buffered_spans: usize,

    /// Buffer length at which a transmission is forced immediately instead
    /// of waiting for the next scheduled one. The default value is 500.
    pub(crate) force_transmission_starting_at: usize,

    /// Forced transmissions are suppressed until this much time has passed
    /// since activation. The default value is 1 second.
    pub(crate) min_delay_before_sending: Duration,

    /// Only spans shorter than this many milliseconds are merge candidates.
    /// The default value is 10.
    pub(crate) batch_threshold: u64,

    /// Whether span merging starts out enabled. It can also be switched on
    /// later via [`SpanBuffer::enable_span_batching`]. Off by default.
    pub(crate) batching_enabled: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfigBuilder::default().build()
    }
}

/// A builder for creating [`BufferConfig`] instances.
#[derive(Debug)]
pub struct BufferConfigBuilder {
    transmission_delay: Duration,
    max_buffered_spans: usize,
    force_transmission_starting_at: usize,
    min_delay_before_sending: Duration,
    batch_threshold: u64,
    batching_enabled: bool,
}

impl Default for BufferConfigBuilder {
    /// Create a new [`BufferConfigBuilder`] initialized with the default
    /// values, overridden by environment variables if set. The supported
    /// environment variables are:
    /// * `TRACECORE_TRANSMISSION_DELAY`
    /// * `TRACECORE_MAX_BUFFERED_SPANS`
    /// * `TRACECORE_FORCE_TRANSMISSION_STARTING_AT`
    /// * `TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING`
    /// * `TRACECORE_DEV_BATCH_THRESHOLD`
    fn default() -> Self {
        BufferConfigBuilder {
            transmission_delay: Duration::from_millis(TRACECORE_TRANSMISSION_DELAY_DEFAULT),
            max_buffered_spans: TRACECORE_MAX_BUFFERED_SPANS_DEFAULT,
            force_transmission_starting_at: TRACECORE_FORCE_TRANSMISSION_STARTING_AT_DEFAULT,
            min_delay_before_sending: Duration::from_millis(
                TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING_DEFAULT,
            ),
            batch_threshold: TRACECORE_DEV_BATCH_THRESHOLD_DEFAULT,
            batching_enabled: false,
        }
        .init_from_env_vars()
    }
}

impl BufferConfigBuilder {
    /// Set transmission_delay for [`BufferConfigBuilder`].
    /// It's the delay between two consecutive scheduled transmissions.
    /// The default value is 1000 milliseconds.
    pub fn with_transmission_delay(mut self, transmission_delay: Duration) -> Self {
        self.transmission_delay = transmission_delay;
        self
    }

    /// Set max_buffered_spans for [`BufferConfigBuilder`].
    /// It's the maximum number of spans held in the buffer; the oldest
    /// excess is dropped. The default value is 1000.
    pub fn with_max_buffered_spans(mut self, max_buffered_spans: usize) -> Self {
        self.max_buffered_spans = max_buffered_spans;
        self
    }

    /// Set force_transmission_starting_at for [`BufferConfigBuilder`].
    /// It's the buffer length at which a transmission is forced immediately.
    /// The default value is 500.
    pub fn with_force_transmission_starting_at(
        mut self,
        force_transmission_starting_at: usize,
    ) -> Self {
        self.force_transmission_starting_at = force_transmission_starting_at;
        self
    }

    /// Set min_delay_before_sending for [`BufferConfigBuilder`].
    /// Forced transmissions are suppressed until this much time has passed
    /// since activation. The default value is 1000 milliseconds.
    pub fn with_min_delay_before_sending(mut self, min_delay_before_sending: Duration) -> Self {
        self.min_delay_before_sending = min_delay_before_sending;
        self
    }

    /// Set batch_threshold for [`BufferConfigBuilder`].
    /// Only spans shorter than this many milliseconds are merge candidates,
    /// and only gaps shorter than it qualify two spans as partners.
    /// The default value is 10.
    pub fn with_batch_threshold(mut self, batch_threshold: u64) -> Self {
        self.batch_threshold = batch_threshold;
        self
    }

    /// Set whether span merging starts out enabled for
    /// [`BufferConfigBuilder`]. Off by default.
    pub fn with_span_batching_enabled(mut self, batching_enabled: bool) -> Self {
        self.batching_enabled = batching_enabled;
        self
    }

    /// Builds a [`BufferConfig`], clamping `force_transmission_starting_at`
    /// to `max_buffered_spans` so a forced flush can actually be reached.
    pub fn build(self) -> BufferConfig {
        let force_transmission_starting_at =
            std::cmp::min(self.force_transmission_starting_at, self.max_buffered_spans);

        BufferConfig {
            transmission_delay: self.transmission_delay,
            max_buffered_spans: self.max_buffered_spans,
            force_transmission_starting_at,
            min_delay_before_sending: self.min_delay_before_sending,
            batch_threshold: self.batch_threshold,
            batching_enabled: self.batching_enabled,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(transmission_delay) = env::var(TRACECORE_TRANSMISSION_DELAY)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.transmission_delay = Duration::from_millis(transmission_delay);
        }

        if let Some(max_buffered_spans) = env::var(TRACECORE_MAX_BUFFERED_SPANS)
            .ok()
            .and_then(|max| usize::from_str(&max).ok())
        {
            self.max_buffered_spans = max_buffered_spans;
        }

        if let Some(force_transmission_starting_at) =
            env::var(TRACECORE_FORCE_TRANSMISSION_STARTING_AT)
                .ok()
                .and_then(|at| usize::from_str(&at).ok())
        {
            self.force_transmission_starting_at = force_transmission_starting_at;
        }

        if let Some(min_delay_before_sending) = env::var(TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.min_delay_before_sending = Duration::from_millis(min_delay_before_sending);
        }

        if let Some(batch_threshold) = env::var(TRACECORE_DEV_BATCH_THRESHOLD)
            .ok()
            .and_then(|threshold| u64::from_str(&threshold).ok())
        {
            self.batch_threshold = batch_threshold;
        }

        self
    }
}

/// Messages exchanged between the owning handle and the worker thread.
#[derive(Debug)]
enum WorkerMessage {
    Shutdown,
}

#[derive(Debug)]
struct WorkerHandle {
    message_sender: SyncSender<WorkerMessage>,
    handle: thread::JoinHandle<()>,
}

/// Positions into `pending`, indexed by trace and end-time bucket, used only
/// to find merge partners. Cleared wholesale whenever `pending` is swapped
/// or compacted; never persisted.
type BucketIndex = HashMap<TraceId, HashMap<u64, Vec<usize>>>;

#[derive(Debug, Default)]
struct BufferState {
    pending: Vec<SpanRecord>,
    buckets: BucketIndex,
}

/// Accumulates completed span records, merges short sibling spans, and
/// delivers batches to a [`DownstreamSender`] on a recurring schedule, with
/// bounded memory.
///
/// The buffer has an explicit `activate`/`deactivate` lifecycle. While
/// active, a dedicated worker thread triggers a flush every
/// `transmission_delay`; growing past `force_transmission_starting_at`
/// triggers one immediately (once `min_delay_before_sending` has elapsed
/// since activation). A failed delivery re-queues the batch ahead of newer
/// spans; the capacity cap then drops the oldest excess if necessary, the
/// only path on which spans are lost.
#[derive(Debug)]
pub struct SpanBuffer {
    downstream: Arc<dyn DownstreamSender>,
    config: BufferConfig,
    metrics: Arc<TracingMetrics>,
    state: Mutex<BufferState>,
    /// Names opted into batching by the adapters that produce them. Only
    /// types known to occur as high-frequency, low-value leaves belong here.
    batchable_names: RwLock<HashSet<String>>,
    batching_enabled: AtomicBool,
    is_active: AtomicBool,
    activated_at: Mutex<Option<Instant>>,
    worker: Mutex<Option<WorkerHandle>>,
    /// End-time bucket width for partner lookup; bounds how far a merged
    /// span can keep growing.
    bucket_width: u64,
}

impl SpanBuffer {
    /// Creates a deactivated buffer. Call [`activate`] before adding spans.
    ///
    /// [`activate`]: SpanBuffer::activate
    pub fn new(
        downstream: Arc<dyn DownstreamSender>,
        config: BufferConfig,
        metrics: Arc<TracingMetrics>,
    ) -> Arc<Self> {
        let bucket_width = (config.batch_threshold * 3).max(1);
        Arc::new(SpanBuffer {
            downstream,
            batching_enabled: AtomicBool::new(config.batching_enabled),
            config,
            metrics,
            state: Mutex::new(BufferState::default()),
            batchable_names: RwLock::new(HashSet::new()),
            is_active: AtomicBool::new(false),
            activated_at: Mutex::new(None),
            worker: Mutex::new(None),
            bucket_width,
        })
    }

    /// Starts accepting spans and spawns the worker thread that drives
    /// scheduled transmissions. Idempotent; re-activation restarts the
    /// minimum-delay guard.
    pub fn activate(self: &Arc<Self>) {
        if self.is_active.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.lock_activated_at() = Some(Instant::now());

        let (message_sender, message_receiver) = sync_channel(1);
        let weak = Arc::downgrade(self);
        let transmission_delay = self.config.transmission_delay;
        // The first flush waits out the minimum delay too.
        let initial_delay = transmission_delay.max(self.config.min_delay_before_sending);

        let spawned = thread::Builder::new()
            .name("tracecore-span-buffer".to_string())
            .spawn(move || {
                Self::worker_loop(weak, message_receiver, initial_delay, transmission_delay)
            });

        match spawned {
            Ok(handle) => {
                *self.lock_worker() = Some(WorkerHandle {
                    message_sender,
                    handle,
                });
            }
            Err(err) => {
                // Keep accepting spans; forced flushes still work, only the
                // schedule is gone.
                agent_warn!(
                    name: "span_buffer_worker_spawn_failed",
                    error = format!("{err}")
                );
            }
        }
    }

    /// Stops accepting spans, flushes what is buffered, and joins the worker
    /// thread. Idempotent.
    pub fn deactivate(&self) {
        if !self.is_active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.lock_worker().take() {
            let _ = worker.message_sender.send(WorkerMessage::Shutdown);
            if worker.handle.join().is_err() {
                agent_warn!(name: "span_buffer_worker_panicked");
            }
        }
        let mut state = self.lock_state();
        state.pending.clear();
        state.buckets.clear();
        *self.lock_activated_at() = None;
    }

    fn worker_loop(
        weak: Weak<SpanBuffer>,
        message_receiver: std::sync::mpsc::Receiver<WorkerMessage>,
        initial_delay: Duration,
        transmission_delay: Duration,
    ) {
        let mut next_delay = initial_delay;
        let mut last_flush = Instant::now();

        loop {
            let timeout = next_delay.saturating_sub(last_flush.elapsed());
            match message_receiver.recv_timeout(timeout) {
                Ok(WorkerMessage::Shutdown) => {
                    if let Some(buffer) = weak.upgrade() {
                        buffer.flush();
                    }
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    match weak.upgrade() {
                        Some(buffer) => buffer.flush(),
                        // The buffer is gone; nothing left to schedule.
                        None => break,
                    }
                    last_flush = Instant::now();
                    next_delay = transmission_delay;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Marks a span name as eligible for merging. Called once per adapter at
    /// initialization.
    pub fn register_batchable_name(&self, name: impl Into<String>) {
        self.batchable_names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into());
    }

    /// Switches span merging on globally. Registered names start merging
    /// from the next span added.
    pub fn enable_span_batching(&self) {
        self.batching_enabled.store(true, Ordering::Release);
    }

    /// Accepts one completed span record.
    ///
    /// Dropped silently (with a debug log) while the buffer is deactivated.
    pub fn add_span(&self, record: SpanRecord) {
        if !self.is_active.load(Ordering::Acquire) {
            agent_debug!(name: "span_buffer_inactive_span_discarded");
            return;
        }

        let force = {
            let mut state = self.lock_state();
            if self.is_batchable(&record) {
                if let Some(record) = self.merge_or_keep(&mut state, record) {
                    let position = state.pending.len();
                    let key = self.bucket_key(record.end_time());
                    let trace_id = record.trace_id;
                    state.pending.push(record);
                    state
                        .buckets
                        .entry(trace_id)
                        .or_default()
                        .entry(key)
                        .or_default()
                        .push(position);
                }
            } else {
                state.pending.push(record);
            }
            self.apply_capacity_cap(&mut state);
            state.pending.len() >= self.config.force_transmission_starting_at
        };

        if force && self.min_delay_elapsed() {
            self.flush();
        }
    }

    /// Drains all buffered spans without involving the worker thread or the
    /// downstream sender. For hosts that transmit on their own schedule.
    pub fn get_and_reset_spans(&self) -> Vec<SpanRecord> {
        let mut state = self.lock_state();
        state.buckets.clear();
        std::mem::take(&mut state.pending)
    }

    fn is_batchable(&self, record: &SpanRecord) -> bool {
        self.batching_enabled.load(Ordering::Acquire)
            && record.duration < self.config.batch_threshold
            // Never merge a trace root.
            && record.parent_span_id.is_some()
            && self
                .batchable_names
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&record.name)
    }

    /// Tries to fold `record` into an already-buffered partner. Returns the
    /// record back if no partner was found, for regular insertion.
    fn merge_or_keep(&self, state: &mut BufferState, record: SpanRecord) -> Option<SpanRecord> {
        let (filed_key, vec_index, position) = match self.find_partner(state, &record) {
            Some(found) => found,
            None => return Some(record),
        };

        let partner = &state.pending[position];
        // Tie-break: higher error count wins, then longer duration, then
        // earlier start. The survivor keeps its identifiers and payload.
        let incoming_wins = record.error_count > partner.error_count
            || (record.error_count == partner.error_count
                && (record.duration > partner.duration
                    || (record.duration == partner.duration
                        && record.start_time < partner.start_time)));

        let merged = merge_records(partner, &record);
        let (mut survivor, batch) = if incoming_wins {
            (record, merged)
        } else {
            (state.pending[position].clone(), merged)
        };
        survivor.start_time = batch.start_time;
        survivor.duration = batch.duration;
        survivor.error_count = batch.error_count;
        survivor.batch = Some(batch.batch);

        let new_key = self.bucket_key(survivor.start_time + survivor.duration);
        let trace_id = survivor.trace_id;
        state.pending[position] = survivor;

        // The merged interval may have grown into the next bucket; re-file
        // so later spans can still find it.
        if new_key != filed_key {
            if let Some(by_bucket) = state.buckets.get_mut(&trace_id) {
                if let Some(positions) = by_bucket.get_mut(&filed_key) {
                    positions.swap_remove(vec_index);
                }
                by_bucket.entry(new_key).or_default().push(position);
            }
        }

        None
    }

    /// Searches the record's own end-time bucket and the one before it.
    /// Checking only two buckets can miss a merge when records arrive out of
    /// chronological order; that trade for O(1) lookup is deliberate.
    fn find_partner(
        &self,
        state: &BufferState,
        record: &SpanRecord,
    ) -> Option<(u64, usize, usize)> {
        let by_bucket = state.buckets.get(&record.trace_id)?;
        let key = self.bucket_key(record.end_time());

        let candidate_keys = [Some(key), key.checked_sub(self.bucket_width)];
        for candidate_key in candidate_keys.into_iter().flatten() {
            if let Some(positions) = by_bucket.get(&candidate_key) {
                for (vec_index, &position) in positions.iter().enumerate() {
                    let candidate = &state.pending[position];
                    if candidate.parent_span_id == record.parent_span_id
                        && candidate.name == record.name
                        && interval_gap(candidate, record) < self.config.batch_threshold
                    {
                        return Some((candidate_key, vec_index, position));
                    }
                }
            }
        }
        None
    }

    fn bucket_key(&self, end_time: u64) -> u64 {
        (end_time / self.bucket_width) * self.bucket_width
    }

    /// Swaps out everything pending and hands it to the downstream sender.
    /// On failure the batch is re-queued ahead of any spans that arrived in
    /// the meantime. The partner index is cleared either way; a few missed
    /// merges after a failure are cheaper than rebuilding it.
    fn flush(&self) {
        let batch = {
            let mut state = self.lock_state();
            if state.pending.is_empty() {
                return;
            }
            state.buckets.clear();
            std::mem::take(&mut state.pending)
        };

        agent_debug!(name: "span_buffer_transmitting", spans = batch.len());
        if let Err(err) = self.downstream.send_spans(&batch) {
            agent_warn!(
                name: "span_buffer_transmission_failed",
                spans = batch.len(),
                error = format!("{err}")
            );
            let mut state = self.lock_state();
            let mut requeued = batch;
            requeued.append(&mut state.pending);
            state.pending = requeued;
            state.buckets.clear();
            self.apply_capacity_cap(&mut state);
        }
    }

    /// Keeps the most recent `max_buffered_spans` records, dropping the
    /// oldest excess. The only place spans are silently lost.
    fn apply_capacity_cap(&self, state: &mut BufferState) {
        let excess = state
            .pending
            .len()
            .saturating_sub(self.config.max_buffered_spans);
        if excess == 0 {
            return;
        }
        state.pending.drain(..excess);
        // Positions shifted; the index is rebuilt as new spans arrive.
        state.buckets.clear();
        self.metrics.increment_dropped(excess as u64);
        agent_warn!(
            name: "span_buffer_over_capacity",
            dropped = excess,
            max_buffered_spans = self.config.max_buffered_spans
        );
    }

    fn min_delay_elapsed(&self) -> bool {
        match *self.lock_activated_at() {
            Some(activated_at) => activated_at.elapsed() >= self.config.min_delay_before_sending,
            None => false,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_activated_at(&self) -> MutexGuard<'_, Option<Instant>> {
        self.activated_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct MergedFields {
    start_time: u64,
    duration: u64,
    error_count: u64,
    batch: BatchInfo,
}

/// Aggregate arithmetic for two merge partners; independent of which side
/// survives.
fn merge_records(a: &SpanRecord, b: &SpanRecord) -> MergedFields {
    let start_time = a.start_time.min(b.start_time);
    let end_time = a.end_time().max(b.end_time());
    MergedFields {
        start_time,
        // The merged record spans the full covered interval.
        duration: end_time - start_time,
        error_count: a.error_count + b.error_count,
        batch: BatchInfo {
            count: side_count(a) + side_count(b),
            merged_duration: side_duration(a) + side_duration(b),
        },
    }
}

/// An unbatched side counts as one span.
fn side_count(record: &SpanRecord) -> u64 {
    record.batch.map(|batch| batch.count).unwrap_or(1)
}

/// An unbatched side contributes its own duration; an already-merged one
/// contributes the sum it carries.
fn side_duration(record: &SpanRecord) -> u64 {
    record
        .batch
        .map(|batch| batch.merged_duration)
        .unwrap_or(record.duration)
}

/// Distance between two records' time intervals; 0 when they overlap,
/// regardless of which started first.
fn interval_gap(a: &SpanRecord, b: &SpanRecord) -> u64 {
    if a.start_time >= b.end_time() {
        a.start_time - b.end_time()
    } else if b.start_time >= a.end_time() {
        b.start_time - a.end_time()
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TraceError;
    use crate::trace::export::InMemorySender;
    use crate::trace::ids::SpanId;
    use crate::trace::span::SpanKind;
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` deliveries, then accepts everything.
    #[derive(Debug, Default)]
    struct FlakySender {
        failures: AtomicUsize,
        accepted: Mutex<Vec<SpanRecord>>,
    }

    impl FlakySender {
        fn failing(failures: usize) -> Self {
            FlakySender {
                failures: AtomicUsize::new(failures),
                accepted: Mutex::new(Vec::new()),
            }
        }

        fn accepted(&self) -> Vec<SpanRecord> {
            self.accepted.lock().unwrap().clone()
        }
    }

    impl DownstreamSender for FlakySender {
        fn send_spans(&self, spans: &[SpanRecord]) -> Result<(), TraceError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TraceError::SendFailed("connection refused".into()));
            }
            self.accepted.lock().unwrap().extend_from_slice(spans);
            Ok(())
        }
    }

    fn test_config() -> BufferConfigBuilder {
        // A far-away schedule keeps the worker thread out of these tests.
        BufferConfigBuilder::default()
            .with_transmission_delay(Duration::from_secs(3600))
            .with_min_delay_before_sending(Duration::ZERO)
            .with_batch_threshold(10)
            .with_span_batching_enabled(true)
    }

    fn buffer_with(
        sender: Arc<dyn DownstreamSender>,
        config: BufferConfig,
    ) -> (Arc<SpanBuffer>, Arc<TracingMetrics>) {
        let metrics = Arc::new(TracingMetrics::default());
        let buffer = SpanBuffer::new(sender, config, metrics.clone());
        buffer.activate();
        (buffer, metrics)
    }

    fn record(span_id: u64, parent: Option<u64>, name: &str, ts: u64, d: u64) -> SpanRecord {
        let mut record = SpanRecord::new(
            TraceId::from(1u128),
            SpanId::from(span_id),
            parent.map(SpanId::from),
            name,
            SpanKind::Exit,
        );
        record.start_time = ts;
        record.duration = d;
        record
    }

    #[test]
    fn inactive_buffer_discards_spans() {
        let sender = Arc::new(InMemorySender::default());
        let metrics = Arc::new(TracingMetrics::default());
        let buffer = SpanBuffer::new(sender, test_config().build(), metrics);

        buffer.add_span(record(1, None, "http", 1_000, 20));
        assert!(buffer.get_and_reset_spans().is_empty());
        buffer.deactivate();
    }

    #[test]
    fn unbatchable_spans_are_kept_in_insertion_order() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());

        buffer.add_span(record(1, None, "http", 1_000, 20));
        buffer.add_span(record(2, Some(1), "sql", 1_005, 50));

        let spans = buffer.get_and_reset_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].span_id, SpanId::from(1u64));
        assert_eq!(spans[1].span_id, SpanId::from(2u64));
        buffer.deactivate();
    }

    #[test]
    fn eligible_siblings_are_merged() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());
        buffer.register_batchable_name("redis");

        buffer.add_span(record(2, Some(1), "redis", 1_000, 3));
        buffer.add_span(record(3, Some(1), "redis", 1_005, 4));

        let spans = buffer.get_and_reset_spans();
        assert_eq!(spans.len(), 1);
        let merged = &spans[0];
        assert_eq!(
            merged.batch,
            Some(BatchInfo {
                count: 2,
                merged_duration: 7
            })
        );
        assert_eq!(merged.start_time, 1_000);
        // Earliest start to latest end: 1000..1009.
        assert_eq!(merged.duration, 9);
        buffer.deactivate();
    }

    #[test]
    fn longer_duration_wins_the_tie_break() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());
        buffer.register_batchable_name("redis");

        buffer.add_span(record(2, Some(1), "redis", 1_000, 5));
        buffer.add_span(record(3, Some(1), "redis", 1_002, 6));

        let spans = buffer.get_and_reset_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_id, SpanId::from(3u64));
        assert_eq!(spans[0].batch.map(|b| b.count), Some(2));
        buffer.deactivate();
    }

    #[test]
    fn error_count_overrides_duration_in_the_tie_break() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());
        buffer.register_batchable_name("redis");

        let mut erroneous = record(2, Some(1), "redis", 1_000, 5);
        erroneous.error_count = 1;
        buffer.add_span(erroneous);
        buffer.add_span(record(3, Some(1), "redis", 1_002, 6));

        let spans = buffer.get_and_reset_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_id, SpanId::from(2u64));
        assert_eq!(spans[0].error_count, 1);
        buffer.deactivate();
    }

    #[test]
    fn second_merge_accumulates_counts() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());
        buffer.register_batchable_name("redis");

        buffer.add_span(record(2, Some(1), "redis", 1_000, 2));
        buffer.add_span(record(3, Some(1), "redis", 1_003, 3));
        buffer.add_span(record(4, Some(1), "redis", 1_007, 4));

        let spans = buffer.get_and_reset_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(
            spans[0].batch,
            Some(BatchInfo {
                count: 3,
                merged_duration: 9
            })
        );
        buffer.deactivate();
    }

    #[test]
    fn spans_at_or_above_the_threshold_are_never_merged() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());
        buffer.register_batchable_name("redis");

        buffer.add_span(record(2, Some(1), "redis", 1_000, 10));
        buffer.add_span(record(3, Some(1), "redis", 1_011, 10));

        assert_eq!(buffer.get_and_reset_spans().len(), 2);
        buffer.deactivate();
    }

    #[test]
    fn different_parent_or_name_is_never_merged() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());
        buffer.register_batchable_name("redis");
        buffer.register_batchable_name("memcached");

        buffer.add_span(record(2, Some(1), "redis", 1_000, 3));
        buffer.add_span(record(3, Some(9), "redis", 1_001, 3));
        buffer.add_span(record(4, Some(1), "memcached", 1_002, 3));

        assert_eq!(buffer.get_and_reset_spans().len(), 3);
        buffer.deactivate();
    }

    #[test]
    fn spans_from_different_traces_are_never_merged() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());
        buffer.register_batchable_name("redis");

        buffer.add_span(record(2, Some(1), "redis", 1_000, 3));
        // Same parent id, name and time window, but a foreign trace.
        let mut foreign = record(3, Some(1), "redis", 1_001, 3);
        foreign.trace_id = TraceId::from(9u128);
        buffer.add_span(foreign);

        let spans = buffer.get_and_reset_spans();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.batch.is_none()));
        buffer.deactivate();
    }

    #[test]
    fn distant_spans_are_never_merged() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());
        buffer.register_batchable_name("redis");

        buffer.add_span(record(2, Some(1), "redis", 1_000, 3));
        // Gap of 12 ms, beyond the 10 ms threshold.
        buffer.add_span(record(3, Some(1), "redis", 1_015, 3));

        assert_eq!(buffer.get_and_reset_spans().len(), 2);
        buffer.deactivate();
    }

    #[test]
    fn unregistered_names_are_never_merged() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender, test_config().build());

        buffer.add_span(record(2, Some(1), "redis", 1_000, 3));
        buffer.add_span(record(3, Some(1), "redis", 1_002, 3));

        assert_eq!(buffer.get_and_reset_spans().len(), 2);
        buffer.deactivate();
    }

    #[test]
    fn capacity_cap_drops_exactly_the_oldest_excess() {
        let sender = Arc::new(InMemorySender::default());
        let config = test_config()
            .with_max_buffered_spans(5)
            .with_force_transmission_starting_at(100)
            .build();
        // force_transmission_starting_at is clamped to the cap.
        assert_eq!(config.force_transmission_starting_at, 5);

        let config = test_config()
            .with_max_buffered_spans(5)
            .with_force_transmission_starting_at(5)
            // Keep forced flushes out of this test.
            .with_min_delay_before_sending(Duration::from_secs(3600))
            .build();
        let (buffer, metrics) = buffer_with(sender, config);

        for span_id in 1..=8 {
            buffer.add_span(record(span_id, None, "http", 1_000 + span_id, 20));
        }

        let spans = buffer.get_and_reset_spans();
        assert_eq!(spans.len(), 5);
        // The oldest three are gone, the most recent five remain.
        assert_eq!(spans[0].span_id, SpanId::from(4u64));
        assert_eq!(spans[4].span_id, SpanId::from(8u64));
        assert_eq!(metrics.get_and_reset().dropped, 3);
        buffer.deactivate();
    }

    #[test]
    fn reaching_the_force_threshold_flushes_immediately() {
        let sender = Arc::new(InMemorySender::default());
        let config = test_config().with_force_transmission_starting_at(3).build();
        let (buffer, _) = buffer_with(sender.clone(), config);

        buffer.add_span(record(1, None, "http", 1_000, 20));
        buffer.add_span(record(2, None, "http", 1_001, 20));
        assert_eq!(sender.span_count(), 0);

        buffer.add_span(record(3, None, "http", 1_002, 20));
        assert_eq!(sender.span_count(), 3);
        assert!(buffer.get_and_reset_spans().is_empty());
        buffer.deactivate();
    }

    #[test]
    fn forced_flush_waits_for_the_minimum_delay() {
        let sender = Arc::new(InMemorySender::default());
        let config = test_config()
            .with_force_transmission_starting_at(2)
            .with_min_delay_before_sending(Duration::from_secs(3600))
            .build();
        let (buffer, _) = buffer_with(sender.clone(), config);

        buffer.add_span(record(1, None, "http", 1_000, 20));
        buffer.add_span(record(2, None, "http", 1_001, 20));

        // Threshold reached, but the buffer was activated too recently.
        assert_eq!(sender.span_count(), 0);
        assert_eq!(buffer.get_and_reset_spans().len(), 2);
        buffer.deactivate();
    }

    #[test]
    fn failed_transmission_requeues_ahead_of_newer_spans() {
        let sender = Arc::new(FlakySender::failing(1));
        let (buffer, _) = buffer_with(sender.clone(), test_config().build());

        buffer.add_span(record(1, None, "http", 1_000, 20));
        buffer.flush();
        assert!(sender.accepted().is_empty());

        buffer.add_span(record(2, None, "http", 1_001, 20));
        buffer.flush();

        let accepted = sender.accepted();
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].span_id, SpanId::from(1u64));
        assert_eq!(accepted[1].span_id, SpanId::from(2u64));
        buffer.deactivate();
    }

    #[test]
    fn scheduled_worker_flushes_on_its_own() {
        let sender = Arc::new(InMemorySender::default());
        let config = test_config()
            .with_transmission_delay(Duration::from_millis(20))
            .build();
        let (buffer, _) = buffer_with(sender.clone(), config);

        buffer.add_span(record(1, None, "http", 1_000, 20));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sender.span_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sender.span_count(), 1);
        buffer.deactivate();
    }

    #[test]
    fn deactivate_flushes_remaining_spans() {
        let sender = Arc::new(InMemorySender::default());
        let (buffer, _) = buffer_with(sender.clone(), test_config().build());

        buffer.add_span(record(1, None, "http", 1_000, 20));
        buffer.deactivate();

        assert_eq!(sender.span_count(), 1);
        // Fully idempotent.
        buffer.deactivate();
        assert_eq!(sender.span_count(), 1);
    }

    #[test]
    fn late_batching_opt_in_takes_effect() {
        let sender = Arc::new(InMemorySender::default());
        let config = test_config().with_span_batching_enabled(false).build();
        let (buffer, _) = buffer_with(sender, config);
        buffer.register_batchable_name("redis");

        buffer.add_span(record(2, Some(1), "redis", 1_000, 3));
        buffer.add_span(record(3, Some(1), "redis", 1_002, 3));
        assert_eq!(buffer.get_and_reset_spans().len(), 2);

        buffer.enable_span_batching();
        buffer.add_span(record(4, Some(1), "redis", 1_000, 3));
        buffer.add_span(record(5, Some(1), "redis", 1_002, 3));
        assert_eq!(buffer.get_and_reset_spans().len(), 1);
        buffer.deactivate();
    }

    #[test]
    fn test_buffer_config_defaults() {
        temp_env::with_vars_unset(
            vec![
                TRACECORE_TRANSMISSION_DELAY,
                TRACECORE_MAX_BUFFERED_SPANS,
                TRACECORE_FORCE_TRANSMISSION_STARTING_AT,
                TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING,
                TRACECORE_DEV_BATCH_THRESHOLD,
            ],
            || {
                let config = BufferConfig::default();
                assert_eq!(
                    config.transmission_delay,
                    Duration::from_millis(TRACECORE_TRANSMISSION_DELAY_DEFAULT)
                );
                assert_eq!(config.max_buffered_spans, TRACECORE_MAX_BUFFERED_SPANS_DEFAULT);
                assert_eq!(
                    config.force_transmission_starting_at,
                    TRACECORE_FORCE_TRANSMISSION_STARTING_AT_DEFAULT
                );
                assert_eq!(
                    config.min_delay_before_sending,
                    Duration::from_millis(TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING_DEFAULT)
                );
                assert_eq!(config.batch_threshold, TRACECORE_DEV_BATCH_THRESHOLD_DEFAULT);
                assert!(!config.batching_enabled);
            },
        );
    }

    #[test]
    fn test_buffer_config_from_env_vars() {
        temp_env::with_vars(
            vec![
                (TRACECORE_TRANSMISSION_DELAY, Some("250")),
                (TRACECORE_MAX_BUFFERED_SPANS, Some("40")),
                (TRACECORE_FORCE_TRANSMISSION_STARTING_AT, Some("20")),
                (TRACECORE_DEV_MIN_DELAY_BEFORE_SENDING, Some("0")),
                (TRACECORE_DEV_BATCH_THRESHOLD, Some("25")),
            ],
            || {
                let config = BufferConfig::default();
                assert_eq!(config.transmission_delay, Duration::from_millis(250));
                assert_eq!(config.max_buffered_spans, 40);
                assert_eq!(config.force_transmission_starting_at, 20);
                assert_eq!(config.min_delay_before_sending, Duration::ZERO);
                assert_eq!(config.batch_threshold, 25);
            },
        );
    }

    #[test]
    fn test_buffer_config_ignores_invalid_env_values() {
        temp_env::with_vars(
            vec![
                (TRACECORE_TRANSMISSION_DELAY, Some("not-a-number")),
                (TRACECORE_MAX_BUFFERED_SPANS, Some("-7")),
            ],
            || {
                let config = BufferConfig::default();
                assert_eq!(
                    config.transmission_delay,
                    Duration::from_millis(TRACECORE_TRANSMISSION_DELAY_DEFAULT)
                );
                assert_eq!(config.max_buffered_spans, TRACECORE_MAX_BUFFERED_SPANS_DEFAULT);
            },
        );
    }
}
