//! Coordination metrics and the queue that applies them off the hot path.
//!
//! Outcomes are pushed onto a bounded channel drained by a background task.
//! When the channel is full, closed, or no Tokio runtime was available at
//! construction, the update is applied inline instead, so no outcome is ever
//! dropped. [`MetricsRecorder::snapshot`] flushes the queue before reading,
//! which bounds staleness to the updates still in flight at that moment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Default capacity of the metrics queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Counters for one source/target tool pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolPairMetric {
    pub source_tool: String,
    pub target_tool: String,
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_time: Duration,
}

/// Aggregate coordination counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinationMetrics {
    pub total_coordinations: u64,
    pub successful_coordinations: u64,
    pub failed_coordinations: u64,
    /// Mean duration over every recorded coordination.
    pub average_latency: Duration,
    /// Keyed by `"{source}->{target}"`.
    pub tool_pairs: BTreeMap<String, ToolPairMetric>,
    #[serde(skip)]
    total_latency: Duration,
}

impl CoordinationMetrics {
    fn apply(&mut self, outcome: &Outcome) {
        self.total_coordinations += 1;
        if outcome.success {
            self.successful_coordinations += 1;
        } else {
            self.failed_coordinations += 1;
        }
        self.total_latency = self.total_latency.saturating_add(outcome.duration);
        let count = u32::try_from(self.total_coordinations).unwrap_or(u32::MAX);
        self.average_latency = self.total_latency / count;

        let key = format!("{}->{}", outcome.source_tool, outcome.target_tool);
        let pair = self.tool_pairs.entry(key).or_insert_with(|| ToolPairMetric {
            source_tool: outcome.source_tool.clone(),
            target_tool: outcome.target_tool.clone(),
            ..Default::default()
        });
        pair.count += 1;
        if outcome.success {
            pair.successes += 1;
        } else {
            pair.failures += 1;
        }
        pair.total_time = pair.total_time.saturating_add(outcome.duration);
    }

    /// Metrics for one tool pair.
    pub fn pair(&self, source_tool: &str, target_tool: &str) -> Option<&ToolPairMetric> {
        self.tool_pairs.get(&format!("{source_tool}->{target_tool}"))
    }
}

/// Result of one coordination, as recorded.
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    pub source_tool: String,
    pub target_tool: String,
    pub success: bool,
    pub duration: Duration,
}

#[derive(Debug)]
enum Update {
    Outcome(Outcome),
    Flush(oneshot::Sender<()>),
}

/// Applies outcomes to shared metrics through a bounded queue.
#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    state: Arc<Mutex<CoordinationMetrics>>,
    queue: Option<mpsc::Sender<Update>>,
}

impl MetricsRecorder {
    /// Start the worker on the current runtime, if there is one.
    pub fn new(capacity: usize) -> Self {
        let state = Arc::new(Mutex::new(CoordinationMetrics::default()));
        let queue = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                handle.spawn(drain(rx, Arc::clone(&state)));
                Some(tx)
            }
            Err(_) => {
                debug!("No async runtime; coordination metrics are applied inline");
                None
            }
        };
        Self { state, queue }
    }

    pub fn record(&self, outcome: Outcome) {
        let Some(queue) = &self.queue else {
            self.state.lock().apply(&outcome);
            return;
        };
        match queue.try_send(Update::Outcome(outcome)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Update::Outcome(outcome)))
            | Err(mpsc::error::TrySendError::Closed(Update::Outcome(outcome))) => {
                debug!("Metrics queue unavailable; applying update inline");
                self.state.lock().apply(&outcome);
            }
            Err(_) => {}
        }
    }

    /// Wait for queued updates, then read the metrics.
    pub async fn snapshot(&self) -> CoordinationMetrics {
        if let Some(queue) = &self.queue {
            let (ack, done) = oneshot::channel();
            if queue.send(Update::Flush(ack)).await.is_ok() {
                let _ = done.await;
            }
        }
        self.state.lock().clone()
    }
}

async fn drain(mut rx: mpsc::Receiver<Update>, state: Arc<Mutex<CoordinationMetrics>>) {
    while let Some(update) = rx.recv().await {
        match update {
            Update::Outcome(outcome) => state.lock().apply(&outcome),
            Update::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(success: bool, millis: u64) -> Outcome {
        Outcome {
            source_tool: "build_image".into(),
            target_tool: "analyze_repository".into(),
            success,
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_inline_without_runtime() {
        let recorder = MetricsRecorder::new(4);
        recorder.record(outcome(true, 100));
        recorder.record(outcome(false, 300));

        let metrics = recorder.state.lock().clone();
        assert_eq!(metrics.total_coordinations, 2);
        assert_eq!(metrics.successful_coordinations, 1);
        assert_eq!(metrics.failed_coordinations, 1);
        assert_eq!(metrics.average_latency, Duration::from_millis(200));

        let pair = metrics.pair("build_image", "analyze_repository").unwrap();
        assert_eq!(pair.count, 2);
        assert_eq!(pair.total_time, Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_snapshot_flushes_queue() {
        let recorder = MetricsRecorder::new(2);
        // More than the capacity: overflow is applied inline.
        for _ in 0..10 {
            recorder.record(outcome(true, 10));
        }
        let metrics = recorder.snapshot().await;
        assert_eq!(metrics.total_coordinations, 10);
        assert_eq!(metrics.successful_coordinations, 10);
    }
}
