// Service metrics
//
// Counters and gauges for request outcomes, pool behaviour and environment
// lifecycle. A registry is owned by the dispatcher and shared with its pool;
// there is no process-wide instance so independent services never mix counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::types::{FailureKind, LimitBreach, Outcome};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Histogram with latency buckets from 1ms to 60s
    pub fn new_latency() -> Self {
        let bounds = [
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ];
        Self {
            buckets: bounds
                .into_iter()
                .map(|le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn export(&self, name: &str, help: &str, out: &mut String) {
        out.push_str(&format!("# HELP {name} {help}\n"));
        out.push_str(&format!("# TYPE {name} histogram\n"));
        for bucket in &self.buckets {
            out.push_str(&format!(
                "{name}_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", self.get_count()));
        out.push_str(&format!(
            "{name}_sum {}\n",
            self.get_sum_micros() as f64 / 1_000_000.0
        ));
        out.push_str(&format!("{name}_count {}\n", self.get_count()));
    }
}

/// Metrics registry for one service instance
#[derive(Debug)]
pub struct MetricsRegistry {
    // Request outcomes
    pub requests_total: Counter,
    pub requests_rejected: Counter,
    pub outcome_success: Counter,
    pub outcome_compile_error: Counter,
    pub outcome_runtime_error: Counter,
    pub outcome_timeout: Counter,
    pub outcome_resource_exceeded: Counter,
    pub outcome_infrastructure_error: Counter,

    // Infrastructure failure kinds
    pub failure_pool_exhausted: Counter,
    pub failure_pool_shutdown: Counter,
    pub failure_provisioning: Counter,
    pub failure_infrastructure: Counter,

    // Limit breaches
    pub limit_violations_memory: Counter,
    pub limit_violations_cpu: Counter,
    pub limit_violations_process: Counter,
    pub limit_violations_disk: Counter,

    // Pool activity
    pub acquisitions_warm: Counter,
    pub acquisitions_cold: Counter,
    pub environments_provisioned: Counter,
    pub environments_reset: Counter,
    pub environments_destroyed: Counter,
    pub environments_contaminated: Counter,
    pub destroy_failures: Counter,
    pub reset_failures: Counter,

    // Pool occupancy
    pub pool_live: Gauge,
    pub pool_idle: Gauge,
    pub pool_in_use: Gauge,

    // Latency
    pub acquire_latency: Histogram,
    pub compile_duration: Histogram,
    pub run_duration: Histogram,
    pub request_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_total: Counter::new(),
            requests_rejected: Counter::new(),
            outcome_success: Counter::new(),
            outcome_compile_error: Counter::new(),
            outcome_runtime_error: Counter::new(),
            outcome_timeout: Counter::new(),
            outcome_resource_exceeded: Counter::new(),
            outcome_infrastructure_error: Counter::new(),

            failure_pool_exhausted: Counter::new(),
            failure_pool_shutdown: Counter::new(),
            failure_provisioning: Counter::new(),
            failure_infrastructure: Counter::new(),

            limit_violations_memory: Counter::new(),
            limit_violations_cpu: Counter::new(),
            limit_violations_process: Counter::new(),
            limit_violations_disk: Counter::new(),

            acquisitions_warm: Counter::new(),
            acquisitions_cold: Counter::new(),
            environments_provisioned: Counter::new(),
            environments_reset: Counter::new(),
            environments_destroyed: Counter::new(),
            environments_contaminated: Counter::new(),
            destroy_failures: Counter::new(),
            reset_failures: Counter::new(),

            pool_live: Gauge::new(),
            pool_idle: Gauge::new(),
            pool_in_use: Gauge::new(),

            acquire_latency: Histogram::new_latency(),
            compile_duration: Histogram::new_latency(),
            run_duration: Histogram::new_latency(),
            request_duration: Histogram::new_latency(),
        }
    }

    /// Record the terminal outcome of one request
    pub fn record_outcome(&self, outcome: Outcome, failure: Option<FailureKind>) {
        self.requests_total.inc();
        match outcome {
            Outcome::Success => self.outcome_success.inc(),
            Outcome::CompileError => self.outcome_compile_error.inc(),
            Outcome::RuntimeError => self.outcome_runtime_error.inc(),
            Outcome::Timeout => self.outcome_timeout.inc(),
            Outcome::ResourceExceeded => self.outcome_resource_exceeded.inc(),
            Outcome::InfrastructureError => self.outcome_infrastructure_error.inc(),
        }
        match failure {
            Some(FailureKind::PoolExhausted) => self.failure_pool_exhausted.inc(),
            Some(FailureKind::PoolShutdown) => self.failure_pool_shutdown.inc(),
            Some(FailureKind::Provisioning) => self.failure_provisioning.inc(),
            Some(FailureKind::Infrastructure) => self.failure_infrastructure.inc(),
            None => {}
        }
    }

    pub fn record_breach(&self, breach: LimitBreach) {
        match breach {
            LimitBreach::Memory => self.limit_violations_memory.inc(),
            LimitBreach::CpuTime => self.limit_violations_cpu.inc(),
            LimitBreach::Processes => self.limit_violations_process.inc(),
            LimitBreach::Disk => self.limit_violations_disk.inc(),
        }
    }

    /// Publish pool occupancy
    pub fn record_pool_occupancy(&self, live: usize, idle: usize, in_use: usize) {
        self.pool_live.set(live as u64);
        self.pool_idle.set(idle as u64);
        self.pool_in_use.set(in_use as u64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP boltbox_requests_total Requests handled\n");
        output.push_str("# TYPE boltbox_requests_total counter\n");
        output.push_str(&format!(
            "boltbox_requests_total {}\n",
            self.requests_total.get()
        ));
        output.push_str(&format!(
            "boltbox_requests_rejected_total {}\n",
            self.requests_rejected.get()
        ));

        output.push_str("# HELP boltbox_outcomes_total Requests by outcome\n");
        output.push_str("# TYPE boltbox_outcomes_total counter\n");
        for (label, counter) in [
            ("success", &self.outcome_success),
            ("compile-error", &self.outcome_compile_error),
            ("runtime-error", &self.outcome_runtime_error),
            ("timeout", &self.outcome_timeout),
            ("resource-exceeded", &self.outcome_resource_exceeded),
            ("infrastructure-error", &self.outcome_infrastructure_error),
        ] {
            output.push_str(&format!(
                "boltbox_outcomes_total{{outcome=\"{}\"}} {}\n",
                label,
                counter.get()
            ));
        }

        output.push_str("# HELP boltbox_failures_total Infrastructure failures by kind\n");
        output.push_str("# TYPE boltbox_failures_total counter\n");
        for (label, counter) in [
            ("pool-exhausted", &self.failure_pool_exhausted),
            ("pool-shutdown", &self.failure_pool_shutdown),
            ("provisioning", &self.failure_provisioning),
            ("infrastructure", &self.failure_infrastructure),
        ] {
            output.push_str(&format!(
                "boltbox_failures_total{{kind=\"{}\"}} {}\n",
                label,
                counter.get()
            ));
        }

        output.push_str("# HELP boltbox_limit_violations_total Limit breaches by resource\n");
        output.push_str("# TYPE boltbox_limit_violations_total counter\n");
        for (label, counter) in [
            ("memory", &self.limit_violations_memory),
            ("cpu", &self.limit_violations_cpu),
            ("process", &self.limit_violations_process),
            ("disk", &self.limit_violations_disk),
        ] {
            output.push_str(&format!(
                "boltbox_limit_violations_total{{resource=\"{}\"}} {}\n",
                label,
                counter.get()
            ));
        }

        output.push_str("# HELP boltbox_environment_events_total Environment lifecycle events\n");
        output.push_str("# TYPE boltbox_environment_events_total counter\n");
        for (label, counter) in [
            ("provisioned", &self.environments_provisioned),
            ("reset", &self.environments_reset),
            ("destroyed", &self.environments_destroyed),
            ("contaminated", &self.environments_contaminated),
            ("destroy-failed", &self.destroy_failures),
            ("reset-failed", &self.reset_failures),
        ] {
            output.push_str(&format!(
                "boltbox_environment_events_total{{event=\"{}\"}} {}\n",
                label,
                counter.get()
            ));
        }

        output.push_str("# HELP boltbox_acquisitions_total Pool acquisitions by source\n");
        output.push_str("# TYPE boltbox_acquisitions_total counter\n");
        output.push_str(&format!(
            "boltbox_acquisitions_total{{source=\"warm\"}} {}\n",
            self.acquisitions_warm.get()
        ));
        output.push_str(&format!(
            "boltbox_acquisitions_total{{source=\"cold\"}} {}\n",
            self.acquisitions_cold.get()
        ));

        output.push_str("# HELP boltbox_pool_environments Pool occupancy\n");
        output.push_str("# TYPE boltbox_pool_environments gauge\n");
        for (label, gauge) in [
            ("live", &self.pool_live),
            ("idle", &self.pool_idle),
            ("in-use", &self.pool_in_use),
        ] {
            output.push_str(&format!(
                "boltbox_pool_environments{{state=\"{}\"}} {}\n",
                label,
                gauge.get()
            ));
        }

        self.acquire_latency.export(
            "boltbox_acquire_latency_seconds",
            "Time spent waiting for an environment",
            &mut output,
        );
        self.compile_duration.export(
            "boltbox_compile_duration_seconds",
            "Compiler wall time",
            &mut output,
        );
        self.run_duration.export(
            "boltbox_run_duration_seconds",
            "Program wall time",
            &mut output,
        );
        self.request_duration.export(
            "boltbox_request_duration_seconds",
            "End-to-end request time",
            &mut output,
        );

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::new();
        gauge.set(7);
        gauge.set(3);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new_latency();

        histogram.observe(Duration::from_millis(50));
        histogram.observe(Duration::from_millis(150));
        histogram.observe(Duration::from_secs(20));

        assert_eq!(histogram.get_count(), 3);
        assert_eq!(histogram.get_bucket_count(0.1), 1);
        assert_eq!(histogram.get_bucket_count(0.25), 2);
        assert_eq!(histogram.get_bucket_count(10.0), 2);
        assert_eq!(histogram.get_bucket_count(30.0), 3);
    }

    #[test]
    fn test_record_outcome() {
        let metrics = MetricsRegistry::new();

        metrics.record_outcome(Outcome::Success, None);
        metrics.record_outcome(Outcome::Timeout, None);
        metrics.record_outcome(
            Outcome::InfrastructureError,
            Some(FailureKind::PoolExhausted),
        );

        assert_eq!(metrics.requests_total.get(), 3);
        assert_eq!(metrics.outcome_success.get(), 1);
        assert_eq!(metrics.outcome_timeout.get(), 1);
        assert_eq!(metrics.failure_pool_exhausted.get(), 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsRegistry::new();

        metrics.record_outcome(Outcome::CompileError, None);
        metrics.record_breach(LimitBreach::Memory);
        metrics.record_pool_occupancy(3, 1, 2);

        let output = metrics.export_prometheus();

        assert!(output.contains("boltbox_requests_total 1"));
        assert!(output.contains("boltbox_outcomes_total{outcome=\"compile-error\"} 1"));
        assert!(output.contains("boltbox_limit_violations_total{resource=\"memory\"} 1"));
        assert!(output.contains("boltbox_pool_environments{state=\"in-use\"} 2"));
        assert!(output.contains("boltbox_acquire_latency_seconds_count 0"));
    }
}
