use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all jobhost metrics
const PREFIX: &str = "jobhost";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_SUBMITTED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_jobs_submitted_total"),
        "Total number of jobs submitted"
    ).expect("Failed to create jobs_submitted_total metric");

    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Finished job executions"),
        &["status"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]),
        &["status"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_running"),
        "Number of jobs currently running"
    ).expect("Failed to create jobs_running metric");

    pub static ref TRIGGER_FIRES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_trigger_fires_total"), "Total trigger fires"),
        &["trigger"]
    ).expect("Failed to create trigger_fires_total metric");
}

/// Register all metrics with the global registry.
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_SUBMITTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(TRIGGER_FIRES_TOTAL.clone()));
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_job_submitted() {
    JOBS_SUBMITTED_TOTAL.inc();
}

pub fn record_job_started() {
    JOBS_RUNNING.inc();
}

/// Record a finished execution. `was_running` is false for jobs stopped
/// before their worker started.
pub fn record_job_finished(status: &str, duration: Duration, was_running: bool) {
    if was_running {
        JOBS_RUNNING.dec();
    }
    JOB_EXECUTIONS_TOTAL.with_label_values(&[status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration.as_secs_f64());
}

pub fn record_trigger_fired(trigger_id: &str) {
    TRIGGER_FIRES_TOTAL.with_label_values(&[trigger_id]).inc();
}
