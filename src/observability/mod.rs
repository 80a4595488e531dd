//! # Request tracing and telemetry export
//!
//! Every request handled by the server is recorded as a **trace** containing
//! nested **observations**. An observation is either a plain span or a
//! `generation`, the subtype used for model calls, which additionally carries
//! model name, parameters and token usage.
//!
//! ## Core pieces
//!
//! - [`Recorder`]: opens traces and fans every record out to the configured
//!   [`TelemetrySink`]s. Cheap to clone and shared by all requests.
//! - [`RequestContext`]: the per-request handle. It knows the trace and the
//!   currently active observation, and is passed explicitly to the prompt
//!   resolver, the tool gateway and the agent loop. Child contexts created
//!   with [`RequestContext::start_observation`] share the trace but point at
//!   a nested observation.
//! - [`Finalizer`]: deferred-task queue for work that must outlive the
//!   response (the telemetry flush). The server drains it before exiting.
//!
//! Records are pushed to sinks synchronously, in the order the request issues
//! them. Exporting is the sink's job and only happens on `flush`. Flush
//! failures are logged and swallowed; they never reach the caller.
//!
//! ```rust
//! use tower_assist::observability::{
//!     MemorySink, ObservationKind, Recorder, TelemetrySink, TraceUpdate,
//! };
//! use std::sync::Arc;
//!
//! let sink = Arc::new(MemorySink::default());
//! let recorder = Recorder::new(vec![sink.clone() as Arc<dyn TelemetrySink>]);
//! let ctx = recorder.start_trace("handle-request", ObservationKind::Span);
//! ctx.update_active_trace(TraceUpdate {
//!     name: Some("Demo".into()),
//!     ..Default::default()
//! });
//! assert!(ctx.end_active_span());
//! assert!(!ctx.end_active_span());
//! // trace, root observation, trace update, root end
//! assert_eq!(sink.buffered().len(), 4);
//! ```

pub mod langfuse;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AssistError, Result};

pub use langfuse::LangfuseSink;

/// A unique identifier for a trace (32 lowercase hex characters).
pub type TraceId = String;

/// A unique identifier for an observation.
pub type ObservationId = String;

pub fn gen_trace_id() -> TraceId {
    Uuid::new_v4().simple().to_string()
}

pub fn gen_observation_id() -> ObservationId {
    Uuid::new_v4().simple().to_string()
}

/// Observation subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationKind {
    Span,
    Generation,
}

/// Severity attached to an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Default,
    Warning,
    Error,
}

/// Token accounting for a generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl Usage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

/// Snapshot of a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub id: TraceId,
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub tags: Vec<String>,
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationRecord {
    pub id: ObservationId,
    pub trace_id: TraceId,
    pub parent_id: Option<ObservationId>,
    pub name: String,
    pub kind: ObservationKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub completion_start_time: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub model: Option<String>,
    pub model_parameters: Option<Value>,
    pub usage: Option<Usage>,
    pub metadata: Option<Value>,
    pub level: Option<Level>,
    pub status_message: Option<String>,
}

/// Fields to merge into the active trace. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct TraceUpdate {
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Value>,
}

/// Fields to merge into the active observation. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ObservationUpdate {
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub model: Option<String>,
    pub model_parameters: Option<Value>,
    pub usage: Option<Usage>,
    pub metadata: Option<Value>,
    pub level: Option<Level>,
    pub status_message: Option<String>,
    pub completion_start_time: Option<DateTime<Utc>>,
}

/// What the recorder hands to sinks.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    TraceUpsert(TraceRecord),
    ObservationCreate(ObservationRecord),
    ObservationUpdate(ObservationRecord),
}

impl TelemetryEvent {
    pub fn trace_id(&self) -> &str {
        match self {
            TelemetryEvent::TraceUpsert(t) => &t.id,
            TelemetryEvent::ObservationCreate(o) | TelemetryEvent::ObservationUpdate(o) => {
                &o.trace_id
            }
        }
    }
}

/// Destination for telemetry records.
///
/// `record` only buffers; `flush` resolves once everything buffered so far
/// has been exported.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);

    async fn flush(&self) -> Result<()>;
}

/// Sink that keeps records in memory. Used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Mutex<Vec<TelemetryEvent>>,
    exported: Mutex<Vec<TelemetryEvent>>,
    fail_flush: AtomicBool,
}

impl MemorySink {
    /// Make every subsequent flush fail (records stay buffered).
    pub fn fail_flushes(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    pub fn buffered(&self) -> Vec<TelemetryEvent> {
        lock(&self.buffer).clone()
    }

    pub fn exported(&self) -> Vec<TelemetryEvent> {
        lock(&self.exported).clone()
    }

    /// Latest trace snapshot seen for `trace_id`, buffered or exported.
    pub fn trace(&self, trace_id: &str) -> Option<TraceRecord> {
        let exported = self.exported();
        let buffered = self.buffered();
        exported
            .iter()
            .chain(buffered.iter())
            .filter_map(|e| match e {
                TelemetryEvent::TraceUpsert(t) if t.id == trace_id => Some(t.clone()),
                _ => None,
            })
            .last()
    }

    /// Latest snapshot of every observation in `trace_id`, in creation order.
    pub fn observations(&self, trace_id: &str) -> Vec<ObservationRecord> {
        let mut out: Vec<ObservationRecord> = Vec::new();
        for event in self.exported().into_iter().chain(self.buffered()) {
            match event {
                TelemetryEvent::ObservationCreate(o) | TelemetryEvent::ObservationUpdate(o)
                    if o.trace_id == trace_id =>
                {
                    match out.iter_mut().find(|existing| existing.id == o.id) {
                        Some(existing) => *existing = o,
                        None => out.push(o),
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    fn record(&self, event: TelemetryEvent) {
        lock(&self.buffer).push(event);
    }

    async fn flush(&self) -> Result<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(AssistError::Telemetry {
                message: "memory sink configured to fail".to_string(),
            });
        }
        let drained: Vec<TelemetryEvent> = std::mem::take(&mut *lock(&self.buffer));
        lock(&self.exported).extend(drained);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Opens traces and forwards records to every configured sink.
#[derive(Clone, Default)]
pub struct Recorder {
    sinks: Arc<Vec<Arc<dyn TelemetrySink>>>,
}

impl Recorder {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    /// Recorder with no sinks; records are dropped.
    pub fn disabled() -> Self {
        Self::default()
    }

    fn emit(&self, event: TelemetryEvent) {
        for sink in self.sinks.iter() {
            sink.record(event.clone());
        }
    }

    /// Open a trace with a root observation and return its context.
    pub fn start_trace(&self, root_name: &str, kind: ObservationKind) -> RequestContext {
        let now = Utc::now();
        let trace = TraceRecord {
            id: gen_trace_id(),
            name: None,
            user_id: None,
            session_id: None,
            input: None,
            output: None,
            tags: Vec::new(),
            metadata: None,
            timestamp: now,
        };
        debug!(trace_id = %trace.id, root = root_name, "starting trace");
        self.emit(TelemetryEvent::TraceUpsert(trace.clone()));

        let root = ObservationRecord::new(trace.id.clone(), None, root_name, kind);
        self.emit(TelemetryEvent::ObservationCreate(root.clone()));

        RequestContext {
            recorder: self.clone(),
            trace: Arc::new(Mutex::new(trace)),
            observation: Arc::new(ObservationHandle::new(root)),
        }
    }

    /// Flush all sinks concurrently. Failures are logged, never returned.
    pub async fn flush(&self) {
        let flushes = self.sinks.iter().map(|sink| sink.flush());
        for result in futures::future::join_all(flushes).await {
            if let Err(e) = result {
                warn!(error = %e, "telemetry flush failed");
            }
        }
    }

    /// Defer a flush onto `finalizer` so it runs after the response is produced.
    pub fn schedule_flush(&self, finalizer: &Finalizer) {
        let recorder = self.clone();
        finalizer.defer(async move { recorder.flush().await });
    }
}

impl ObservationRecord {
    fn new(
        trace_id: TraceId,
        parent_id: Option<ObservationId>,
        name: &str,
        kind: ObservationKind,
    ) -> Self {
        Self {
            id: gen_observation_id(),
            trace_id,
            parent_id,
            name: name.to_string(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            completion_start_time: None,
            input: None,
            output: None,
            model: None,
            model_parameters: None,
            usage: None,
            metadata: None,
            level: None,
            status_message: None,
        }
    }

    fn merge(&mut self, update: ObservationUpdate) {
        let ObservationUpdate {
            input,
            output,
            model,
            model_parameters,
            usage,
            metadata,
            level,
            status_message,
            completion_start_time,
        } = update;
        if input.is_some() {
            self.input = input;
        }
        if output.is_some() {
            self.output = output;
        }
        if model.is_some() {
            self.model = model;
        }
        if model_parameters.is_some() {
            self.model_parameters = model_parameters;
        }
        if usage.is_some() {
            self.usage = usage;
        }
        if metadata.is_some() {
            self.metadata = metadata;
        }
        if level.is_some() {
            self.level = level;
        }
        if status_message.is_some() {
            self.status_message = status_message;
        }
        if completion_start_time.is_some() {
            self.completion_start_time = completion_start_time;
        }
    }
}

struct ObservationHandle {
    record: Mutex<ObservationRecord>,
    ended: AtomicBool,
}

impl ObservationHandle {
    fn new(record: ObservationRecord) -> Self {
        Self {
            record: Mutex::new(record),
            ended: AtomicBool::new(false),
        }
    }
}

/// Per-request handle on a trace and its active observation.
///
/// Clones share state; ending the active span through any clone ends it for all.
#[derive(Clone)]
pub struct RequestContext {
    recorder: Recorder,
    trace: Arc<Mutex<TraceRecord>>,
    observation: Arc<ObservationHandle>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("trace_id", &self.trace_id())
            .field("observation_id", &self.observation_id())
            .finish()
    }
}

impl RequestContext {
    /// Id of the trace this context belongs to.
    pub fn trace_id(&self) -> TraceId {
        lock(&self.trace).id.clone()
    }

    pub fn observation_id(&self) -> ObservationId {
        lock(&self.observation.record).id.clone()
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Merge `update` into the trace and emit the new snapshot.
    pub fn update_active_trace(&self, update: TraceUpdate) {
        let snapshot = {
            let mut trace = lock(&self.trace);
            let TraceUpdate {
                name,
                user_id,
                session_id,
                input,
                output,
                tags,
                metadata,
            } = update;
            if name.is_some() {
                trace.name = name;
            }
            if user_id.is_some() {
                trace.user_id = user_id;
            }
            if session_id.is_some() {
                trace.session_id = session_id;
            }
            if input.is_some() {
                trace.input = input;
            }
            if output.is_some() {
                trace.output = output;
            }
            if let Some(tags) = tags {
                for tag in tags {
                    if !trace.tags.contains(&tag) {
                        trace.tags.push(tag);
                    }
                }
            }
            if metadata.is_some() {
                trace.metadata = metadata;
            }
            trace.clone()
        };
        self.recorder.emit(TelemetryEvent::TraceUpsert(snapshot));
    }

    /// Merge `update` into the active observation, retyping it as `as_type`.
    pub fn update_active_observation(&self, update: ObservationUpdate, as_type: ObservationKind) {
        let snapshot = {
            let mut record = lock(&self.observation.record);
            record.kind = as_type;
            record.merge(update);
            record.clone()
        };
        self.recorder
            .emit(TelemetryEvent::ObservationUpdate(snapshot));
    }

    /// Open a nested observation and return a context whose active observation is it.
    pub fn start_observation(&self, name: &str, kind: ObservationKind) -> RequestContext {
        let parent_id = self.observation_id();
        let record = ObservationRecord::new(self.trace_id(), Some(parent_id), name, kind);
        debug!(trace_id = %record.trace_id, observation = name, "starting observation");
        self.recorder
            .emit(TelemetryEvent::ObservationCreate(record.clone()));
        RequestContext {
            recorder: self.recorder.clone(),
            trace: self.trace.clone(),
            observation: Arc::new(ObservationHandle::new(record)),
        }
    }

    /// Run `f` inside a nested observation that is ended when `f` resolves.
    ///
    /// An `Err` marks the observation with level `ERROR` and the error text.
    /// If the returned future is dropped before `f` resolves (a request
    /// deadline, a disconnected client) the observation is ended as
    /// cancelled.
    pub async fn in_observation<F, Fut, T, E>(&self, name: &str, kind: ObservationKind, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let child = self.start_observation(name, kind);
        let guard = EndOnDrop(child.clone());
        let result = f(child.clone()).await;
        if let Err(e) = &result {
            child.record_error(e.to_string());
        }
        child.end_active_span();
        drop(guard);
        result
    }

    /// Mark the active observation as failed without changing its type.
    pub fn record_error(&self, message: impl Into<String>) {
        let snapshot = {
            let mut record = lock(&self.observation.record);
            record.level = Some(Level::Error);
            record.status_message = Some(message.into());
            record.clone()
        };
        self.recorder
            .emit(TelemetryEvent::ObservationUpdate(snapshot));
    }

    /// End the active observation. Returns `false` if it was already ended.
    pub fn end_active_span(&self) -> bool {
        if self.observation.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        let snapshot = {
            let mut record = lock(&self.observation.record);
            record.end_time = Some(Utc::now());
            record.clone()
        };
        self.recorder
            .emit(TelemetryEvent::ObservationUpdate(snapshot));
        true
    }

    pub fn is_ended(&self) -> bool {
        self.observation.ended.load(Ordering::SeqCst)
    }

    /// Current trace snapshot.
    pub fn trace_snapshot(&self) -> TraceRecord {
        lock(&self.trace).clone()
    }
}

/// Ends a nested observation that was abandoned mid-flight.
struct EndOnDrop(RequestContext);

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        if !self.0.is_ended() {
            self.0.record_error(CANCELLED);
            self.0.end_active_span();
        }
    }
}

/// Status message of observations ended because their work was dropped.
pub const CANCELLED: &str = "cancelled";

/// Deferred-task queue for post-response work.
///
/// Tasks start immediately on the runtime; [`Finalizer::drain`] waits for all
/// of them, so the host can keep the process alive until they are done.
#[derive(Clone, Default)]
pub struct Finalizer {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Finalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                warn!(error = %e, "deferred task failed");
            }
        }
        tasks.spawn(fut);
    }

    /// Number of tasks not yet reaped.
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Wait for every deferred task, including ones deferred while draining.
    pub async fn drain(&self) {
        loop {
            let mut batch = std::mem::take(&mut *lock(&self.tasks));
            if batch.is_empty() {
                return;
            }
            while let Some(done) = batch.join_next().await {
                if let Err(e) = done {
                    warn!(error = %e, "deferred task failed");
                }
            }
        }
    }
}
