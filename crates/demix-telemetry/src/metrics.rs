//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges the job orchestrator reports.

use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared by the orchestrator and CLI.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    jobs_total: IntCounterVec,
    job_steps_total: IntCounterVec,
    events_emitted_total: IntCounterVec,
    cache_lookups_total: IntCounterVec,
    active_jobs: IntGauge,
    engine_last_duration_ms: IntGauge,
    reclaim_failures_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Jobs currently between staging and a terminal state.
    pub active_jobs: i64,
    /// Wall-clock duration of the most recent engine invocation.
    pub engine_last_duration_ms: i64,
    /// Jobs that reached `completed`.
    pub jobs_completed_total: u64,
    /// Jobs that reached `failed`.
    pub jobs_failed_total: u64,
    /// Reclamations that left entries behind.
    pub reclaim_failures_total: u64,
    /// Cache lookups served from a stored result.
    pub cache_hits_total: u64,
}

fn counter_vec(name: &'static str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::metric(name, "build", source))
}

fn gauge(name: &'static str, help: &str) -> Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::metric(name, "build", source))
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::metric(name, "build", source))
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::metric(name, "register", source))
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs_total = counter_vec(
            "jobs_total",
            "Separation jobs that reached a terminal state",
            &["status"],
        )?;
        let job_steps_total = counter_vec(
            "job_steps_total",
            "Job lifecycle steps executed by status",
            &["step", "status"],
        )?;
        let events_emitted_total = counter_vec(
            "events_emitted_total",
            "Lifecycle events emitted by type",
            &["type"],
        )?;
        let cache_lookups_total = counter_vec(
            "cache_lookups_total",
            "Result cache lookups by outcome",
            &["result"],
        )?;
        let active_jobs = gauge("active_jobs", "Jobs staged or running")?;
        let engine_last_duration_ms = gauge(
            "engine_last_duration_ms",
            "Duration of the most recent engine invocation (ms)",
        )?;
        let reclaim_failures_total = counter(
            "reclaim_failures_total",
            "Workspace reclamations that could not remove every entry",
        )?;

        register(&registry, "jobs_total", &jobs_total)?;
        register(&registry, "job_steps_total", &job_steps_total)?;
        register(&registry, "events_emitted_total", &events_emitted_total)?;
        register(&registry, "cache_lookups_total", &cache_lookups_total)?;
        register(&registry, "active_jobs", &active_jobs)?;
        register(&registry, "engine_last_duration_ms", &engine_last_duration_ms)?;
        register(&registry, "reclaim_failures_total", &reclaim_failures_total)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                jobs_total,
                job_steps_total,
                events_emitted_total,
                cache_lookups_total,
                active_jobs,
                engine_last_duration_ms,
                reclaim_failures_total,
            }),
        })
    }

    /// Increment the terminal job counter for `status`.
    pub fn inc_job(&self, status: &str) {
        self.inner.jobs_total.with_label_values(&[status]).inc();
    }

    /// Increment the lifecycle step counter.
    pub fn inc_job_step(&self, step: &str, status: &str) {
        self.inner
            .job_steps_total
            .with_label_values(&[step, status])
            .inc();
    }

    /// Increment the emitted event counter for the specific event type.
    pub fn inc_event(&self, event_type: &str) {
        self.inner
            .events_emitted_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Record a cache lookup outcome (`hit`, `miss`, `expired`).
    pub fn inc_cache_lookup(&self, result: &str) {
        self.inner
            .cache_lookups_total
            .with_label_values(&[result])
            .inc();
    }

    /// Adjust the active job gauge.
    pub fn set_active_jobs(&self, count: i64) {
        self.inner.active_jobs.set(count);
    }

    /// Record how long the last engine invocation took.
    pub fn observe_engine_duration(&self, duration: Duration) {
        self.inner
            .engine_last_duration_ms
            .set(Self::duration_to_ms(duration));
    }

    /// Increment the partial reclamation counter.
    pub fn inc_reclaim_failure(&self) {
        self.inner.reclaim_failures_total.inc();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::Render { source })?;
        String::from_utf8(buffer).map_err(TelemetryError::from)
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_jobs: self.inner.active_jobs.get(),
            engine_last_duration_ms: self.inner.engine_last_duration_ms.get(),
            jobs_completed_total: self.inner.jobs_total.with_label_values(&["completed"]).get(),
            jobs_failed_total: self.inner.jobs_total.with_label_values(&["failed"]).get(),
            reclaim_failures_total: self.inner.reclaim_failures_total.get(),
            cache_hits_total: self.inner.cache_lookups_total.with_label_values(&["hit"]).get(),
        }
    }

    /// Convert a duration to milliseconds saturating at `i64::MAX`.
    pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_to_ms_saturates_on_large_values() {
        let duration = Duration::from_secs(u64::MAX / 2);
        assert_eq!(Metrics::duration_to_ms(duration), i64::MAX);
    }

    #[test]
    fn metrics_snapshot_reflects_updates() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.inc_job("completed");
        metrics.inc_job("completed");
        metrics.inc_job("failed");
        metrics.inc_job_step("invoke", "completed");
        metrics.inc_event("job_staged");
        metrics.inc_cache_lookup("hit");
        metrics.inc_cache_lookup("miss");
        metrics.set_active_jobs(3);
        metrics.observe_engine_duration(Duration::from_millis(1_250));
        metrics.inc_reclaim_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                active_jobs: 3,
                engine_last_duration_ms: 1_250,
                jobs_completed_total: 2,
                jobs_failed_total: 1,
                reclaim_failures_total: 1,
                cache_hits_total: 1,
            }
        );

        let rendered = metrics.render()?;
        assert!(rendered.contains("jobs_total"));
        assert!(rendered.contains("job_steps_total"));
        assert!(rendered.contains("cache_lookups_total"));
        Ok(())
    }

    #[test]
    fn registries_are_independent() -> Result<()> {
        let first = Metrics::new()?;
        let second = Metrics::new()?;
        first.set_active_jobs(7);
        assert_eq!(second.snapshot().active_jobs, 0);
        Ok(())
    }
}
