//! Prometheus metrics for the quota manager.
//!
//! Instruments live in a private registry owned by [`Metrics`]; call
//! [`Metrics::render`] to produce the text exposition format.

use std::time::Duration;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Buckets for time spent waiting on a rate limiter (in seconds)
const WAIT_BUCKETS: &[f64] = &[0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    submit_calls: Counter,
    poll_calls: Counter,
    throttled: CounterVec,
    retries_scheduled: CounterVec,
    jobs_terminal: CounterVec,
    in_flight: Gauge,
    rate_limit_wait: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let submit_calls = Counter::with_opts(Opts::new(
            "textract_submit_calls_total",
            "Start-job calls issued to the extraction service",
        ))?;
        let poll_calls = Counter::with_opts(Opts::new(
            "textract_poll_calls_total",
            "Job status calls issued to the extraction service",
        ))?;
        let throttled = CounterVec::new(
            Opts::new(
                "textract_throttled_total",
                "Throttling responses received, by operation",
            ),
            &["operation"],
        )?;
        let retries_scheduled = CounterVec::new(
            Opts::new(
                "textract_retries_scheduled_total",
                "Retries scheduled by the backoff policy, by error class",
            ),
            &["class"],
        )?;
        let jobs_terminal = CounterVec::new(
            Opts::new(
                "textract_jobs_terminal_total",
                "Documents reaching a terminal state",
            ),
            &["state"],
        )?;
        let in_flight = Gauge::with_opts(Opts::new(
            "textract_in_flight_jobs",
            "Concurrency slots currently held",
        ))?;
        let rate_limit_wait = HistogramVec::new(
            HistogramOpts::new(
                "textract_rate_limit_wait_seconds",
                "Time spent waiting for a rate limiter token",
            )
            .buckets(WAIT_BUCKETS.to_vec()),
            &["operation"],
        )?;

        registry.register(Box::new(submit_calls.clone()))?;
        registry.register(Box::new(poll_calls.clone()))?;
        registry.register(Box::new(throttled.clone()))?;
        registry.register(Box::new(retries_scheduled.clone()))?;
        registry.register(Box::new(jobs_terminal.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(rate_limit_wait.clone()))?;

        Ok(Self {
            registry,
            submit_calls,
            poll_calls,
            throttled,
            retries_scheduled,
            jobs_terminal,
            in_flight,
            rate_limit_wait,
        })
    }

    pub fn record_submit_call(&self) {
        self.submit_calls.inc();
    }

    pub fn record_poll_call(&self) {
        self.poll_calls.inc();
    }

    pub fn record_throttled(&self, operation: &str) {
        self.throttled.with_label_values(&[operation]).inc();
    }

    pub fn record_retry(&self, class: &str) {
        self.retries_scheduled.with_label_values(&[class]).inc();
    }

    pub fn record_terminal(&self, state: &str) {
        self.jobs_terminal.with_label_values(&[state]).inc();
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        self.in_flight.set(in_flight as f64);
    }

    pub fn observe_rate_limit_wait(&self, operation: &str, waited: Duration) {
        self.rate_limit_wait
            .with_label_values(&[operation])
            .observe(waited.as_secs_f64());
    }

    pub fn submit_calls(&self) -> u64 {
        self.submit_calls.get() as u64
    }

    pub fn poll_calls(&self) -> u64 {
        self.poll_calls.get() as u64
    }

    pub fn throttled_count(&self, operation: &str) -> u64 {
        self.throttled.with_label_values(&[operation]).get() as u64
    }

    pub fn terminal_count(&self, state: &str) -> u64 {
        self.jobs_terminal.with_label_values(&[state]).get() as u64
    }

    /// Prometheus text exposition of every instrument.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
