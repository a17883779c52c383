//! Phase timing for deploy operations
//!
//! One recorder per task holds a monotonic anchor and the wall-clock time
//! taken at the same moment. Phases are measured against the monotonic
//! clock and only converted to wall-clock milliseconds when they become
//! [`LaunchTaskDetail`]s.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};

use droidswap_core::prelude::*;
use droidswap_core::{current_thread_id, DeployMetric, LaunchTaskDetail};

/// Status recorded for a phase dropped without [`Phase::done`]
pub const STATUS_FAILED: &str = "FAILED";

struct Inner {
    anchor: Instant,
    wall_anchor: DateTime<Utc>,
    metrics: Mutex<Vec<DeployMetric>>,
}

/// Append-only metric sink shared by the deployers of one task
#[derive(Clone)]
pub struct MetricsRecorder {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("wall_anchor", &self.inner.wall_anchor)
            .field("recorded", &self.len())
            .finish()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                anchor: Instant::now(),
                wall_anchor: Utc::now(),
                metrics: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Nanoseconds since the anchor
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.inner.anchor.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Start measuring a phase. It is recorded when the returned guard is
    /// finished or dropped.
    pub fn phase(&self, name: &str) -> Phase {
        Phase {
            recorder: self.clone(),
            name: name.to_string(),
            start_ns: self.now_ns(),
            status: None,
            done: false,
        }
    }

    fn push(&self, metric: DeployMetric) {
        match self.inner.metrics.lock() {
            Ok(mut metrics) => metrics.push(metric),
            Err(_) => warn!("Metrics lock poisoned, dropping {}", metric.name),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.metrics.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metrics recorded at or after position `from`
    pub fn since(&self, from: usize) -> Vec<DeployMetric> {
        self.inner
            .metrics
            .lock()
            .map(|m| m.get(from..).map(<[_]>::to_vec).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<DeployMetric> {
        self.since(0)
    }

    /// Convert one metric to wall-clock telemetry under `task_id`
    pub fn to_detail(&self, task_id: &str, metric: &DeployMetric) -> LaunchTaskDetail {
        let base_ms = self.inner.wall_anchor.timestamp_millis();
        let to_ms = |ns: u64| base_ms + i64::try_from(ns / 1_000_000).unwrap_or(i64::MAX - base_ms);
        let start = to_ms(metric.start_ns);
        let end = to_ms(metric.end_ns).max(start);

        LaunchTaskDetail {
            id: format!("{}.{}", task_id, metric.name),
            start_timestamp_ms: start,
            end_timestamp_ms: end,
            thread_id: metric.thread_id,
            status: metric.status.clone(),
        }
    }

    pub fn to_details(&self, task_id: &str, metrics: &[DeployMetric]) -> Vec<LaunchTaskDetail> {
        metrics.iter().map(|m| self.to_detail(task_id, m)).collect()
    }
}

/// A running phase measurement
#[must_use = "a phase is recorded when finished or dropped"]
pub struct Phase {
    recorder: MetricsRecorder,
    name: String,
    start_ns: u64,
    status: Option<String>,
    done: bool,
}

impl Phase {
    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = Some(status.into());
    }

    /// Record the phase as completed
    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for Phase {
    fn drop(&mut self) {
        let status = if self.done {
            self.status.take()
        } else {
            Some(self.status.take().unwrap_or_else(|| STATUS_FAILED.to_string()))
        };
        let end_ns = self.recorder.now_ns().max(self.start_ns);

        trace!(
            "Phase {} took {}us",
            self.name,
            (end_ns - self.start_ns) / 1_000
        );

        self.recorder.push(DeployMetric {
            name: std::mem::take(&mut self.name),
            start_ns: self.start_ns,
            end_ns,
            thread_id: current_thread_id(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_are_ordered_and_monotonic() {
        let recorder = MetricsRecorder::new();
        recorder.phase("PUSH").done();
        recorder.phase("INSTALL").done();

        let metrics = recorder.all();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "PUSH");
        assert!(metrics.iter().all(|m| m.end_ns >= m.start_ns));
        assert!(metrics[1].start_ns >= metrics[0].start_ns);
        assert!(metrics.iter().all(|m| m.status.is_none()));
    }

    #[test]
    fn test_dropped_phase_is_failed() {
        let recorder = MetricsRecorder::new();
        {
            let _phase = recorder.phase("SWAP");
        }
        assert_eq!(recorder.all()[0].status.as_deref(), Some(STATUS_FAILED));
    }

    #[test]
    fn test_custom_status_kept() {
        let recorder = MetricsRecorder::new();
        let mut phase = recorder.phase("INSTALL");
        phase.set_status("DELTA");
        phase.done();
        assert_eq!(recorder.all()[0].status.as_deref(), Some("DELTA"));
    }

    #[test]
    fn test_since() {
        let recorder = MetricsRecorder::new();
        recorder.phase("A").done();
        let mark = recorder.len();
        recorder.phase("B").done();
        let later = recorder.since(mark);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].name, "B");
        assert!(recorder.since(10).is_empty());
    }

    #[test]
    fn test_details() {
        let recorder = MetricsRecorder::new();
        let metric = DeployMetric {
            name: "PUSH".to_string(),
            start_ns: 2_000_000,
            end_ns: 5_500_000,
            thread_id: 3,
            status: None,
        };

        let detail = recorder.to_detail("DEPLOY", &metric);
        assert_eq!(detail.id, "DEPLOY.PUSH");
        assert_eq!(detail.end_timestamp_ms - detail.start_timestamp_ms, 3);
        assert!(detail.start_timestamp_ms <= detail.end_timestamp_ms);
        assert_eq!(detail.thread_id, 3);
    }
}
