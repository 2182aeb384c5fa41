use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Gauge, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use pin_project_lite::pin_project;

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0,
    ]
}

pin_project! {
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct TimedFuture<F, C>
    where
        F: Future,
        C: FnOnce(Duration),
    {
        #[pin]
        inner: F,
        start: Instant,
        callback: Option<C>,
    }
}

impl<F, C> Future for TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.inner.poll(cx);

        if poll_result.is_ready() {
            let elapsed = this.start.elapsed();
            // Taken so that a future polled after completion reports once.
            if let Some(callback) = this.callback.take() {
                callback(elapsed);
            }
        }

        poll_result
    }
}

/// Wraps `future` so that `callback` receives its wall time on completion.
pub fn timed<F, C>(future: F, callback: C) -> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    TimedFuture {
        inner: future,
        start: Instant::now(),
        callback: Some(callback),
    }
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: Option<&String>,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let mut resource_builder = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "lrp"))
        .with_attribute(KeyValue::new("service.name", "lrp-convergence-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ));
    if let Some(instance_id) = instance_id {
        resource_builder = resource_builder
            .with_attribute(KeyValue::new("service.instance.id", instance_id.to_owned()));
    }
    let resource = resource_builder.build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between its creation and its drop.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

#[derive(Clone, Debug)]
pub struct StateStoreMetrics {
    pub state_write: Histogram<f64>,
    pub state_read: Histogram<f64>,
    pub conflicts: Counter<u64>,
}

impl Default for StateStoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStoreMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("state_store");

        let state_write = meter
            .f64_histogram("lrp.state_store_write_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("State store write latency in seconds")
            .build();

        let state_read = meter
            .f64_histogram("lrp.state_store_read_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("State store read latency in seconds")
            .build();

        let conflicts = meter
            .u64_counter("lrp.state_store_conflicts")
            .with_description("Number of writes rejected by a version mismatch")
            .build();

        Self {
            state_write,
            state_read,
            conflicts,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConvergenceMetrics {
    pub run_duration: Histogram<f64>,
    pub phase_duration: Histogram<f64>,
    pub runs: Counter<u64>,
    pub actual_lrps: Gauge<u64>,
    pub desired_lrps: Gauge<u64>,
    pub discrepancies: Counter<u64>,
    pub pruned_records: Counter<u64>,
    pub start_requests: Counter<u64>,
    pub retired_lrps: Counter<u64>,
}

impl Default for ConvergenceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvergenceMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("convergence");

        let run_duration = meter
            .f64_histogram("lrp.convergence_run_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("Duration of a full convergence run in seconds")
            .build();

        let phase_duration = meter
            .f64_histogram("lrp.convergence_phase_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("Duration of gather, calculate and resolve phases in seconds")
            .build();

        let runs = meter
            .u64_counter("lrp.convergence_runs")
            .with_description("Number of convergence runs by outcome")
            .build();

        let actual_lrps = meter
            .u64_gauge("lrp.actual_lrps")
            .with_description("Actual LRPs seen by the last convergence run, by state")
            .build();

        let desired_lrps = meter
            .u64_gauge("lrp.desired_lrps")
            .with_description("Desired LRPs and instances seen by the last convergence run")
            .build();

        let discrepancies = meter
            .u64_counter("lrp.convergence_discrepancies")
            .with_description("Discrepancies found by convergence, by kind")
            .build();

        let pruned_records = meter
            .u64_counter("lrp.convergence_pruned_records")
            .with_description("Invalid or orphaned records deleted by convergence")
            .build();

        let start_requests = meter
            .u64_counter("lrp.convergence_start_requests")
            .with_description("Instances submitted to the placement service")
            .build();

        let retired_lrps = meter
            .u64_counter("lrp.convergence_retired_lrps")
            .with_description("Extra instances retired by convergence")
            .build();

        Self {
            run_duration,
            phase_duration,
            runs,
            actual_lrps,
            desired_lrps,
            discrepancies,
            pruned_records,
            start_requests,
            retired_lrps,
        }
    }
}
