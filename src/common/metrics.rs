//! Request metrics.

use std::time::Duration;

use tracing::info;

use crate::common::types::RequestOrigin;

/// Outcome recorded for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
    Success,
    Fail,
    Delay,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Fail => "fail",
            RequestOutcome::Delay => "delay",
        }
    }
}

/// Receives request metrics.
pub trait MetricsSink: Send + Sync {
    fn request(&self, origin: RequestOrigin, outcome: RequestOutcome, duration: Duration);
}

/// Metrics sink that writes through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn request(&self, origin: RequestOrigin, outcome: RequestOutcome, duration: Duration) {
        info!(
            target: "metrics",
            origin = %origin,
            outcome = outcome.as_str(),
            duration_ms = duration.as_millis() as u64,
            "request"
        );
    }
}
