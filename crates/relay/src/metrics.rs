use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    mutations_denied_total: Mutex<HashMap<String, u64>>,
    mutations_applied_total: AtomicU64,
    flush_failures_total: AtomicU64,
    versions_created_total: AtomicU64,
    session_teardowns_total: AtomicU64,
    active_sessions: AtomicI64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_request(endpoint: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(endpoint, is_error, latency_ms);
    }
}

pub fn record_mutation_applied() {
    if let Some(metrics) = global_metrics() {
        metrics.mutations_applied_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_mutation_denied(reason: &str) {
    if let Some(metrics) = global_metrics() {
        increment_label_counter(&metrics.mutations_denied_total, reason, 1);
    }
}

pub fn record_flush_failure() {
    if let Some(metrics) = global_metrics() {
        metrics.flush_failures_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_version_created() {
    if let Some(metrics) = global_metrics() {
        metrics.versions_created_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_session_teardown() {
    if let Some(metrics) = global_metrics() {
        metrics.session_teardowns_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn session_started() {
    if let Some(metrics) = global_metrics() {
        metrics.active_sessions.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn session_stopped() {
    if let Some(metrics) = global_metrics() {
        metrics.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, endpoint: &str, is_error: bool, latency_ms: u64) {
        let endpoint = normalize_label(endpoint);
        increment_label_counter(&self.ws_rate_total, &endpoint, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &endpoint, latency_ms);
        increment_label_counter(&self.ws_duration_count, &endpoint, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &endpoint, 1);
        }
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        push_header(&mut output, "relay_request_rate_total", "Total HTTP requests by endpoint.", "counter");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        push_header(
            &mut output,
            "relay_request_errors_total",
            "Total HTTP error responses by endpoint.",
            "counter",
        );
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        push_header(
            &mut output,
            "relay_request_duration_ms_sum",
            "Sum of HTTP request latency in milliseconds by endpoint.",
            "counter",
        );
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        push_header(
            &mut output,
            "relay_request_duration_ms_count",
            "Count of HTTP request latency samples by endpoint.",
            "counter",
        );
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        push_header(&mut output, "relay_ws_rate_total", "Total websocket commands by type.", "counter");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", "endpoint", &self.ws_rate_total);

        push_header(
            &mut output,
            "relay_ws_errors_total",
            "Total websocket commands answered with an error, by type.",
            "counter",
        );
        append_label_counter_lines(&mut output, "relay_ws_errors_total", "endpoint", &self.ws_errors_total);

        push_header(
            &mut output,
            "relay_ws_duration_ms_sum",
            "Sum of websocket command latency in milliseconds by type.",
            "counter",
        );
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            "endpoint",
            &self.ws_duration_sum_ms,
        );

        push_header(
            &mut output,
            "relay_ws_duration_ms_count",
            "Count of websocket latency samples by type.",
            "counter",
        );
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            "endpoint",
            &self.ws_duration_count,
        );

        push_header(
            &mut output,
            "page_mutations_applied_total",
            "Mutations accepted into a page session.",
            "counter",
        );
        push_value(&mut output, "page_mutations_applied_total", self.mutations_applied_total.load(Ordering::Relaxed));

        push_header(
            &mut output,
            "page_mutations_denied_total",
            "Mutations rejected, by reason.",
            "counter",
        );
        append_label_counter_lines(
            &mut output,
            "page_mutations_denied_total",
            "reason",
            &self.mutations_denied_total,
        );

        push_header(
            &mut output,
            "page_flush_failures_total",
            "Failed page flush attempts (retried).",
            "counter",
        );
        push_value(&mut output, "page_flush_failures_total", self.flush_failures_total.load(Ordering::Relaxed));

        push_header(&mut output, "page_versions_created_total", "Page versions appended.", "counter");
        push_value(
            &mut output,
            "page_versions_created_total",
            self.versions_created_total.load(Ordering::Relaxed),
        );

        push_header(
            &mut output,
            "page_session_teardowns_total",
            "Page sessions torn down after an invariant violation.",
            "counter",
        );
        push_value(
            &mut output,
            "page_session_teardowns_total",
            self.session_teardowns_total.load(Ordering::Relaxed),
        );

        push_header(&mut output, "page_sessions_active", "Live page sessions on this node.", "gauge");
        output.push_str(&format!(
            "page_sessions_active {}\n",
            self.active_sessions.load(Ordering::Relaxed).max(0)
        ));

        output
    }
}

fn push_header(output: &mut String, name: &str, help: &str, kind: &str) {
    output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n"));
}

fn push_value(output: &mut String, name: &str, value: u64) {
    output.push_str(&format!("{name} {value}\n"));
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if uuid::Uuid::parse_str(segment).is_ok() {
                "{uuid}"
            } else if segment.chars().all(|c| c.is_ascii_digit()) {
                "{number}"
            } else {
                segment
            }
        })
        .collect();

    format!("/{}", segments.join("/"))
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(normalize_label(label)).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| {
        left.method.cmp(&right.method).then_with(|| left.endpoint.cmp(&right.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
