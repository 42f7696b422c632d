//! Prometheus-backed metrics registry
//!
//! The registry is an explicit object created once at startup and shared by
//! `Arc`. Nothing is installed as the process-global `metrics` recorder, so
//! tests can build as many independent registries as they like and inspect
//! each one through [`MetricsRegistry::render`].
//!
//! Two metric families are recorded per request:
//!
//! - the basic family, named `{namespace}_{subsystem}_*` and labelled by
//!   `host`, `family`, `proto` (plus `status` for response metrics)
//! - the tenant family, named `bucket_*` and labelled by `bucket_name`,
//!   `method`, `status`, `internal`, `bucket_owner`

use std::time::Duration;

use metrics::{Counter, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, Unit};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use tracing::debug;

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Latency buckets: the Prometheus defaults extended for slow transfers
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0, 30.0, 60.0, 120.0,
    180.0, 240.0, 480.0, 960.0,
];

const SIZE_BUCKETS: &[f64] = &[
    0.0, 500.0, 1000.0, 2000.0, 3000.0, 4000.0, 5000.0, 10000.0, 20000.0, 30000.0, 50000.0, 1e5,
    5e5, 1e6, 2e6, 3e6, 4e6, 5e6, 10e6,
];

const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

pub const BUCKET_RESPONSE_COUNT: &str = "bucket_response_count_total";
pub const BUCKET_RESPONSE_SIZE: &str = "bucket_response_size_bytes";
pub const BUCKET_UPSTREAM_TIME: &str = "bucket_upstream_time_seconds";
pub const BUCKET_UPSTREAM_TIME_HIST: &str = "bucket_upstream_time_seconds_hist";
pub const BUCKET_RESPONSE_TIME: &str = "bucket_response_time_seconds";
pub const BUCKET_RESPONSE_TIME_HIST: &str = "bucket_response_time_seconds_hist";

/// Fully-qualified names of the namespaced metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNames {
    pub request_count: String,
    pub request_duration: String,
    pub response_size: String,
    pub response_status_count: String,
    pub response_latency: String,
    pub breaker_transitions: String,
    pub ownership_lookups: String,
}

impl MetricNames {
    pub fn new(namespace: &str, subsystem: &str) -> Self {
        let http = |name: &str| qualify(&[namespace, subsystem, name]);
        Self {
            request_count: http("request_count_total"),
            request_duration: http("request_duration_seconds"),
            response_size: http("response_size_bytes"),
            response_status_count: http("response_status_count_total"),
            response_latency: http("response_latency_seconds"),
            breaker_transitions: qualify(&[namespace, "breaker_state_transitions_total"]),
            ownership_lookups: qualify(&[namespace, "ownership_lookups_total"]),
        }
    }
}

fn qualify(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches('_'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Everything recorded for one request
///
/// Built once by the metrics middleware and consumed by
/// [`MetricsRegistry::record_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeasurement {
    pub host: String,
    pub family: &'static str,
    pub proto: &'static str,
    pub status: u16,
    pub bucket_name: String,
    pub method: String,
    pub internal: &'static str,
    pub owner_id: String,
    pub byte_size: u64,
    /// Start of the request until the body finished
    pub total_duration: Duration,
    /// Start of the request until the response head was produced
    pub time_to_first_byte: Duration,
    /// Time the inner handler spent before returning the response head
    pub upstream_duration: Duration,
}

/// Process-wide metrics registry
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    names: MetricNames,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// Build a registry whose basic metrics are named `{namespace}_{subsystem}_*`
    pub fn new(namespace: &str, subsystem: &str) -> Result<Self, BuildError> {
        let names = MetricNames::new(namespace, subsystem);

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(names.request_duration.clone()), DURATION_BUCKETS)?
            .set_buckets_for_metric(Matcher::Full(names.response_latency.clone()), DURATION_BUCKETS)?
            .set_buckets_for_metric(Matcher::Full(names.response_size.clone()), SIZE_BUCKETS)?
            .set_buckets_for_metric(
                Matcher::Full(BUCKET_UPSTREAM_TIME_HIST.to_string()),
                DEFAULT_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Full(BUCKET_RESPONSE_TIME_HIST.to_string()),
                DEFAULT_BUCKETS,
            )?
            .build_recorder();
        let handle = recorder.handle();

        let registry = Self {
            recorder,
            handle,
            names,
        };
        registry.describe();

        debug!(
            namespace = %namespace,
            subsystem = %subsystem,
            "Metrics registry created"
        );

        Ok(registry)
    }

    fn describe(&self) {
        let names = &self.names;
        let describe_counter = |name: &str, unit: Option<Unit>, help: &'static str| {
            self.recorder
                .describe_counter(KeyName::from(name.to_string()), unit, help.into());
        };
        let describe_histogram = |name: &str, unit: Option<Unit>, help: &'static str| {
            self.recorder
                .describe_histogram(KeyName::from(name.to_string()), unit, help.into());
        };

        describe_counter(&names.request_count, None, "Counter of HTTP(S) requests made.");
        describe_histogram(
            &names.request_duration,
            Some(Unit::Seconds),
            "Histogram of the time (in seconds) each request took.",
        );
        describe_histogram(
            &names.response_size,
            Some(Unit::Bytes),
            "Size of the returned response in bytes.",
        );
        describe_counter(
            &names.response_status_count,
            None,
            "Counter of response status codes.",
        );
        describe_histogram(
            &names.response_latency,
            Some(Unit::Seconds),
            "Histogram of the time (in seconds) until the first write for each request.",
        );
        describe_counter(
            BUCKET_RESPONSE_COUNT,
            None,
            "Amount of processed HTTP requests per bucket.",
        );
        describe_counter(
            BUCKET_RESPONSE_SIZE,
            Some(Unit::Bytes),
            "Total amount of transferred bytes per bucket.",
        );
        describe_histogram(
            BUCKET_UPSTREAM_TIME,
            Some(Unit::Seconds),
            "Time needed by the upstream handler to produce a response.",
        );
        describe_histogram(
            BUCKET_UPSTREAM_TIME_HIST,
            Some(Unit::Seconds),
            "Time needed by the upstream handler to produce a response.",
        );
        describe_histogram(
            BUCKET_RESPONSE_TIME,
            Some(Unit::Seconds),
            "Time needed to fully serve a request.",
        );
        describe_histogram(
            BUCKET_RESPONSE_TIME_HIST,
            Some(Unit::Seconds),
            "Time needed to fully serve a request.",
        );
        describe_counter(
            &names.breaker_transitions,
            None,
            "Circuit breaker state transitions.",
        );
        describe_counter(
            &names.ownership_lookups,
            None,
            "Bucket ownership lookups by outcome.",
        );
    }

    pub fn names(&self) -> &MetricNames {
        &self.names
    }

    pub fn counter(&self, name: &str, labels: Vec<Label>) -> Counter {
        let key = Key::from_parts(name.to_string(), labels);
        self.recorder.register_counter(&key, &METADATA)
    }

    pub fn histogram(&self, name: &str, labels: Vec<Label>) -> Histogram {
        let key = Key::from_parts(name.to_string(), labels);
        self.recorder.register_histogram(&key, &METADATA)
    }

    /// Record the full measurement set for one request
    pub fn record_request(&self, m: &RequestMeasurement) {
        let status = m.status.to_string();

        let basic = vec![
            Label::new("host", m.host.clone()),
            Label::new("family", m.family),
            Label::new("proto", m.proto),
        ];
        let mut with_status = basic.clone();
        with_status.push(Label::new("status", status.clone()));

        self.counter(&self.names.request_count, basic.clone())
            .increment(1);
        self.histogram(&self.names.request_duration, basic)
            .record(m.total_duration.as_secs_f64());
        self.histogram(&self.names.response_size, with_status.clone())
            .record(m.byte_size as f64);
        self.counter(&self.names.response_status_count, with_status.clone())
            .increment(1);
        self.histogram(&self.names.response_latency, with_status)
            .record(m.time_to_first_byte.as_secs_f64());

        let tenant = vec![
            Label::new("bucket_name", m.bucket_name.clone()),
            Label::new("method", m.method.clone()),
            Label::new("status", status),
            Label::new("internal", m.internal),
            Label::new("bucket_owner", m.owner_id.clone()),
        ];

        let upstream = m.upstream_duration.as_secs_f64();
        let response = m.total_duration.as_secs_f64();

        self.counter(BUCKET_RESPONSE_COUNT, tenant.clone()).increment(1);
        self.counter(BUCKET_RESPONSE_SIZE, tenant.clone())
            .increment(m.byte_size);
        self.histogram(BUCKET_UPSTREAM_TIME, tenant.clone())
            .record(upstream);
        self.histogram(BUCKET_UPSTREAM_TIME_HIST, tenant.clone())
            .record(upstream);
        self.histogram(BUCKET_RESPONSE_TIME, tenant.clone())
            .record(response);
        self.histogram(BUCKET_RESPONSE_TIME_HIST, tenant)
            .record(response);
    }

    pub fn record_breaker_transition(&self, breaker: &str, to: &'static str) {
        let labels = vec![
            Label::new("breaker", breaker.to_string()),
            Label::new("to", to),
        ];
        self.counter(&self.names.breaker_transitions, labels)
            .increment(1);
    }

    pub fn record_ownership_lookup(&self, result: &'static str) {
        self.counter(
            &self.names.ownership_lookups,
            vec![Label::new("result", result)],
        )
        .increment(1);
    }

    /// Prometheus text exposition of everything recorded so far
    pub fn render(&self) -> String {
        self.handle.run_upkeep();
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetricsRegistry {
        MetricsRegistry::new("gateway", "http").unwrap()
    }

    fn measurement() -> RequestMeasurement {
        RequestMeasurement {
            host: "s3.example.com".to_string(),
            family: "1",
            proto: "1.1",
            status: 200,
            bucket_name: "photos".to_string(),
            method: "GET".to_string(),
            internal: "y",
            owner_id: "acct-1".to_string(),
            byte_size: 1024,
            total_duration: Duration::from_millis(40),
            time_to_first_byte: Duration::from_millis(10),
            upstream_duration: Duration::from_millis(10),
        }
    }

    /// Lines of the rendering for one metric, excluding comments
    fn lines_for<'a>(output: &'a str, name: &str) -> Vec<&'a str> {
        output
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter(|line| {
                line.strip_prefix(name)
                    .is_some_and(|rest| rest.starts_with('{') || rest.starts_with(' '))
            })
            .collect()
    }

    #[test]
    fn test_metric_names() {
        let names = MetricNames::new("gateway", "http");
        assert_eq!(names.request_count, "gateway_http_request_count_total");
        assert_eq!(names.response_latency, "gateway_http_response_latency_seconds");
        assert_eq!(names.breaker_transitions, "gateway_breaker_state_transitions_total");

        let names = MetricNames::new("", "http");
        assert_eq!(names.request_count, "http_request_count_total");
    }

    #[test]
    fn test_record_request_renders_both_families() {
        let registry = registry();
        registry.record_request(&measurement());

        let output = registry.render();

        let count = lines_for(&output, "gateway_http_request_count_total");
        assert_eq!(count.len(), 1);
        assert!(count[0].contains("host=\"s3.example.com\""));
        assert!(count[0].contains("family=\"1\""));
        assert!(count[0].contains("proto=\"1.1\""));
        assert!(count[0].ends_with(" 1"));

        let status = lines_for(&output, "gateway_http_response_status_count_total");
        assert_eq!(status.len(), 1);
        assert!(status[0].contains("status=\"200\""));

        let tenant = lines_for(&output, BUCKET_RESPONSE_COUNT);
        assert_eq!(tenant.len(), 1);
        assert!(tenant[0].contains("bucket_name=\"photos\""));
        assert!(tenant[0].contains("method=\"GET\""));
        assert!(tenant[0].contains("internal=\"y\""));
        assert!(tenant[0].contains("bucket_owner=\"acct-1\""));

        let bytes = lines_for(&output, BUCKET_RESPONSE_SIZE);
        assert_eq!(bytes.len(), 1);
        assert!(bytes[0].ends_with(" 1024"));
    }

    #[test]
    fn test_latency_metrics_are_histograms_and_tenant_times_summaries() {
        let registry = registry();
        registry.record_request(&measurement());

        let output = registry.render();

        assert!(output.contains("gateway_http_request_duration_seconds_bucket{"));
        assert!(output.contains("gateway_http_response_size_bytes_bucket{"));
        assert!(output.contains("bucket_upstream_time_seconds_hist_bucket{"));
        assert!(output.contains("bucket_response_time_seconds_hist_bucket{"));

        assert!(output.contains("bucket_upstream_time_seconds{"));
        assert!(output.contains("quantile=\""));
        assert!(output.contains("bucket_response_time_seconds_count{"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = registry();
        let second = registry();

        first.record_request(&measurement());

        assert!(first.render().contains(BUCKET_RESPONSE_COUNT));
        assert!(lines_for(&second.render(), BUCKET_RESPONSE_COUNT).is_empty());
    }

    #[test]
    fn test_ownership_and_breaker_counters() {
        let registry = registry();
        registry.record_ownership_lookup("hit");
        registry.record_ownership_lookup("hit");
        registry.record_breaker_transition("admin", "open");

        let output = registry.render();

        let lookups = lines_for(&output, "gateway_ownership_lookups_total");
        assert_eq!(lookups.len(), 1);
        assert!(lookups[0].contains("result=\"hit\""));
        assert!(lookups[0].ends_with(" 2"));

        let transitions = lines_for(&output, "gateway_breaker_state_transitions_total");
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].contains("breaker=\"admin\""));
        assert!(transitions[0].contains("to=\"open\""));
    }
}
