//! Request accounting.
//!
//! Every inbound event, from either side, is handled under a [`Request`].
//! The tracker records how each one ends and escalates requests that take
//! too long: first a delay metric, then a failure metric once the request is
//! considered dead. A dead request is still tracked until it finishes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info_span, Span};

use crate::common::error::BridgeError;
use crate::common::metrics::{MetricsSink, RequestOutcome};
use crate::common::types::RequestOrigin;

/// Time before an unfinished request is reported as delayed.
pub const DELAY_TIMEOUT: Duration = Duration::from_secs(10);
/// Further time before a delayed request is reported as dead.
pub const DEAD_TIMEOUT: Duration = Duration::from_secs(300);

/// How a handler disposed of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Done,
    /// Deliberately dropped, e.g. an echo of the bridge's own virtual user.
    Ignored,
}

/// Snapshot of an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: String,
    pub origin: RequestOrigin,
    pub started: Instant,
}

struct TrackerInner {
    requests: DashMap<String, RequestInfo>,
    metrics: Arc<dyn MetricsSink>,
}

impl TrackerInner {
    fn record(&self, origin: RequestOrigin, outcome: RequestOutcome, started: Instant) {
        self.metrics.request(origin, outcome, started.elapsed());
    }
}

/// Issues and supervises requests.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

impl RequestTracker {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                requests: DashMap::new(),
                metrics,
            }),
        }
    }

    /// Start tracking a new request. Must be called inside a runtime.
    pub fn new_request(&self, origin: RequestOrigin) -> Request {
        let id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let span = info_span!("request", request_id = %id, origin = %origin);
        self.inner.requests.insert(
            id.clone(),
            RequestInfo {
                id: id.clone(),
                origin,
                started,
            },
        );

        let (done, finished) = oneshot::channel();
        tokio::spawn(watchdog(self.inner.clone(), id.clone(), finished));

        Request {
            tracker: self.inner.clone(),
            id,
            origin,
            started,
            span,
            _done: done,
            finished: false,
        }
    }

    pub fn find(&self, id: &str) -> Option<RequestInfo> {
        self.inner.requests.get(id).map(|entry| entry.value().clone())
    }

    /// Number of requests not yet finished.
    pub fn outstanding(&self) -> usize {
        self.inner.requests.len()
    }
}

async fn watchdog(tracker: Arc<TrackerInner>, id: String, mut finished: oneshot::Receiver<()>) {
    tokio::select! {
        _ = sleep(DELAY_TIMEOUT) => {}
        _ = &mut finished => return,
    }
    let Some(info) = tracker.requests.get(&id).map(|e| e.value().clone()) else {
        return;
    };
    error!(request_id = %id, "DELAYED - taking more than {:?}", DELAY_TIMEOUT);
    tracker.record(info.origin, RequestOutcome::Delay, info.started);

    tokio::select! {
        _ = sleep(DEAD_TIMEOUT) => {}
        _ = &mut finished => return,
    }
    if tracker.requests.contains_key(&id) {
        error!(request_id = %id, "DEAD - no response after {:?}", DELAY_TIMEOUT + DEAD_TIMEOUT);
        tracker.record(info.origin, RequestOutcome::Fail, info.started);
    }
}

/// One inbound event being handled.
///
/// Finish it with [`resolve`](Request::resolve), [`reject`](Request::reject)
/// or [`ignore`](Request::ignore). Dropping it unfinished counts as a failure.
pub struct Request {
    tracker: Arc<TrackerInner>,
    id: String,
    origin: RequestOrigin,
    started: Instant,
    span: Span,
    /// Dropping this stops the watchdog.
    _done: oneshot::Sender<()>,
    finished: bool,
}

impl Request {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin(&self) -> RequestOrigin {
        self.origin
    }

    /// Span to run the request's work under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    fn finish(&mut self) {
        self.finished = true;
        self.tracker.requests.remove(&self.id);
    }

    pub fn resolve(mut self) {
        self.finish();
        let _enter = self.span.enter();
        debug!("SUCCESS - {} ms", self.started.elapsed().as_millis());
        self.tracker
            .record(self.origin, RequestOutcome::Success, self.started);
    }

    /// Dropped on purpose; no failure is recorded.
    pub fn ignore(mut self) {
        self.finish();
        let _enter = self.span.enter();
        debug!("IGNORED - {} ms", self.started.elapsed().as_millis());
    }

    pub fn reject(mut self, err: &BridgeError) {
        self.finish();
        let _enter = self.span.enter();
        error!("FAILED - {} ms ({})", self.started.elapsed().as_millis(), err);
        self.tracker
            .record(self.origin, RequestOutcome::Fail, self.started);
    }

    /// Finish according to a handler's result.
    pub fn complete(self, result: Result<Disposition, BridgeError>) {
        match result {
            Ok(Disposition::Done) => self.resolve(),
            Ok(Disposition::Ignored) => self.ignore(),
            Err(e) => self.reject(&e),
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.requests.remove(&self.id);
            let _enter = self.span.enter();
            error!("FAILED - dropped unfinished");
            self.tracker
                .record(self.origin, RequestOutcome::Fail, self.started);
        }
    }
}
