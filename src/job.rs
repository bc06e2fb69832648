//! Per-topic job descriptors.
//!
//! A [`Job`] carries everything one topic needs: the queue shape and
//! connection parameters, the fork policy (baseline and burst worker counts,
//! health threshold), the recycling limits workers honor, and the handler
//! invoked for each payload. The supervisor owns registered descriptors and
//! is the only mutator of their runtime state (the live-worker map and the
//! crash back-off deadline); workers read their inherited copy after fork.
//!
//! Descriptors double as the producer-side API: [`Job::deliver`] and
//! [`Job::revoke_delay`] work without any supervisor running, so the
//! process that enqueues work only needs the descriptor value.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::queue::{QueueConfig, QueueError, QueueKind, TopicQueue};

/// Inclusive bounds for both worker counts.
const WORKER_COUNT_RANGE: (u32, u32) = (1, 1000);

/// Payload handler for one topic.
///
/// Returning `Err` terminates the worker with a non-zero status, which the
/// master answers with a per-topic back-off before the replacement starts
/// consuming.
pub trait JobHandler: Send + Sync {
    fn handle(&self, payload: &str) -> anyhow::Result<()>;
}

impl<F> JobHandler for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, payload: &str) -> anyhow::Result<()> {
        self(payload)
    }
}

/// Runtime record for one live worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerSlot {
    /// Workers created by the autoscaler are not respawned when they exit.
    pub dynamic: bool,
}

/// Configuration plus runtime state for a single topic.
pub struct Job {
    topic: String,
    kind: QueueKind,
    static_worker_count: u32,
    dynamic_worker_count: u32,
    health_queue_length: u64,
    max_execute_secs: u64,
    max_consume_count: u64,
    handler: Arc<dyn JobHandler>,
    queue: TopicQueue,
    /// Live children keyed by PID. Maintained by the master only.
    pub(crate) workers: HashMap<i32, WorkerSlot>,
    /// Instant before which newly started workers sleep instead of consuming.
    enabled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a descriptor for `topic` with a baseline of one worker, burst
    /// disabled and no recycling limits, against a default local backend.
    pub fn new(topic: impl Into<String>, kind: QueueKind, handler: impl JobHandler + 'static) -> Self {
        Self {
            topic: topic.into(),
            kind,
            static_worker_count: 1,
            dynamic_worker_count: 1,
            health_queue_length: 0,
            max_execute_secs: 0,
            max_consume_count: 0,
            handler: Arc::new(handler),
            queue: TopicQueue::new(kind, QueueConfig::default()),
            workers: HashMap::new(),
            enabled_at: None,
        }
    }

    /// Sets the baseline worker count (clamped to [1, 1000] on registration).
    pub fn with_static_workers(mut self, count: u32) -> Self {
        self.static_worker_count = count;
        self
    }

    /// Sets the burst worker count (clamped to [1, 1000] on registration).
    pub fn with_dynamic_workers(mut self, count: u32) -> Self {
        self.dynamic_worker_count = count;
        self
    }

    /// Sets the backlog size above which the autoscaler may fire.
    /// Zero disables autoscaling for the topic.
    pub fn with_health_queue_length(mut self, length: u64) -> Self {
        self.health_queue_length = length;
        self
    }

    /// Sets the worker soft TTL in seconds. Zero means no TTL.
    pub fn with_max_execute_secs(mut self, secs: u64) -> Self {
        self.max_execute_secs = secs;
        self
    }

    /// Sets the worker soft message cap. Zero means uncapped.
    pub fn with_max_consume_count(mut self, count: u64) -> Self {
        self.max_consume_count = count;
        self
    }

    /// Sets the backend connection parameters for the topic.
    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = TopicQueue::new(self.kind, config);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn static_worker_count(&self) -> u32 {
        self.static_worker_count
    }

    pub fn dynamic_worker_count(&self) -> u32 {
        self.dynamic_worker_count
    }

    pub fn health_queue_length(&self) -> u64 {
        self.health_queue_length
    }

    pub fn max_execute_secs(&self) -> u64 {
        self.max_execute_secs
    }

    pub fn max_consume_count(&self) -> u64 {
        self.max_consume_count
    }

    /// Enqueues a payload on this topic.
    ///
    /// `eligible_at` (Unix epoch seconds) is honored on delay topics and
    /// ignored on FIFO topics; pass 0 for immediately-eligible work. Returns
    /// `false` when the backend rejected the delivery.
    pub fn deliver(&mut self, payload: &str, eligible_at: i64) -> bool {
        match self.queue.deliver(&self.topic, payload, eligible_at) {
            Ok(()) => true,
            Err(err) => {
                warn!(topic = %self.topic, error = %err, "deliver failed");
                false
            }
        }
    }

    /// Removes a not-yet-consumed payload from a delay topic.
    ///
    /// Returns `false` for FIFO topics and for payloads that are no longer
    /// (or never were) queued.
    pub fn revoke_delay(&mut self, payload: &str) -> bool {
        match self.queue.revoke(&self.topic, payload) {
            Ok(revoked) => revoked,
            Err(err) => {
                warn!(topic = %self.topic, error = %err, "revoke failed");
                false
            }
        }
    }

    /// Invokes the registered handler for one payload.
    pub fn handle(&self, payload: &str) -> anyhow::Result<()> {
        self.handler.handle(payload)
    }

    /// Dequeues one payload, waiting up to `timeout`.
    pub(crate) fn pop(&mut self, timeout: Duration) -> Result<Option<String>, QueueError> {
        self.queue.pop(&self.topic, timeout)
    }

    /// Returns the consumable backlog of the topic.
    pub(crate) fn backlog(&mut self) -> Result<u64, QueueError> {
        self.queue.size(&self.topic)
    }

    /// Drops the queue connection. Forked workers call this first so the
    /// socket inherited from the master is never shared; the master calls it
    /// after a backlog probe so no handle is open across a later fork.
    pub(crate) fn disconnect_queue(&mut self) {
        self.queue.disconnect();
    }

    /// Clamps numeric fields to their documented ranges. Invoked on
    /// registration.
    pub(crate) fn normalize(&mut self) {
        let (lo, hi) = WORKER_COUNT_RANGE;
        self.static_worker_count = self.static_worker_count.clamp(lo, hi);
        self.dynamic_worker_count = self.dynamic_worker_count.clamp(lo, hi);
    }

    pub(crate) fn track_worker(&mut self, pid: i32, dynamic: bool) {
        self.workers.insert(pid, WorkerSlot { dynamic });
    }

    /// Removes a reaped PID, returning its slot when it was tracked here.
    pub(crate) fn forget_worker(&mut self, pid: i32) -> Option<WorkerSlot> {
        self.workers.remove(&pid)
    }

    pub(crate) fn is_tracking(&self, pid: i32) -> bool {
        self.workers.contains_key(&pid)
    }

    pub(crate) fn live_worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn worker_pids(&self) -> Vec<i32> {
        self.workers.keys().copied().collect()
    }

    /// Imposes the crash back-off: workers started within the next `secs`
    /// seconds sleep before consuming. Set by the master when reaping a
    /// failed child; honored only by subsequently forked workers.
    pub(crate) fn apply_backoff(&mut self, secs: i64) {
        self.enabled_at = Some(Utc::now() + chrono::Duration::seconds(secs));
    }

    /// Time left on the back-off deadline, if it lies in the future.
    pub(crate) fn backoff_remaining(&self) -> Option<Duration> {
        let deadline = self.enabled_at?;
        (deadline - Utc::now()).to_std().ok()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("topic", &self.topic)
            .field("kind", &self.kind)
            .field("static_worker_count", &self.static_worker_count)
            .field("dynamic_worker_count", &self.dynamic_worker_count)
            .field("health_queue_length", &self.health_queue_length)
            .field("max_execute_secs", &self.max_execute_secs)
            .field("max_consume_count", &self.max_consume_count)
            .field("live_workers", &self.workers.len())
            .field("enabled_at", &self.enabled_at)
            .finish()
    }
}
