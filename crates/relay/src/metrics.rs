use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
};

use crate::realtime::CloseReason;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    sessions_admitted_total: AtomicU64,
    sessions_replaced_total: AtomicU64,
    sessions_closed_total: Mutex<HashMap<&'static str, u64>>,
    active_sessions: AtomicI64,
    notifications_queued_total: AtomicU64,
    notifications_dropped_total: AtomicU64,
    notifications_offline_total: AtomicU64,
    frames_written_total: AtomicU64,
    pings_sent_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let mut sessions_closed_total = HashMap::new();
        for reason in CloseReason::ALL {
            sessions_closed_total.insert(reason.as_str(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            sessions_admitted_total: AtomicU64::new(0),
            sessions_replaced_total: AtomicU64::new(0),
            sessions_closed_total: Mutex::new(sessions_closed_total),
            active_sessions: AtomicI64::new(0),
            notifications_queued_total: AtomicU64::new(0),
            notifications_dropped_total: AtomicU64::new(0),
            notifications_offline_total: AtomicU64::new(0),
            frames_written_total: AtomicU64::new(0),
            pings_sent_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_session_admitted(replaced: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_session_admitted(replaced);
    }
}

pub fn record_session_closed(reason: CloseReason) {
    if let Some(metrics) = global_metrics() {
        metrics.record_session_closed(reason);
    }
}

pub fn increment_notifications_queued() {
    if let Some(metrics) = global_metrics() {
        metrics.notifications_queued_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_notifications_dropped() {
    if let Some(metrics) = global_metrics() {
        metrics.notifications_dropped_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_notifications_offline() {
    if let Some(metrics) = global_metrics() {
        metrics.notifications_offline_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_frames_written() {
    if let Some(metrics) = global_metrics() {
        metrics.frames_written_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_pings_sent() {
    if let Some(metrics) = global_metrics() {
        metrics.pings_sent_total.fetch_add(1, Ordering::Relaxed);
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

    pub fn record_session_admitted(&self, replaced: bool) {
        self.sessions_admitted_total.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.sessions_replaced_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_session_closed(&self, reason: CloseReason) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        let mut guard = self.sessions_closed_total.lock().unwrap_or_else(PoisonError::into_inner);
        let value = guard.entry(reason.as_str()).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        append_scalar(
            &mut output,
            "realtime_sessions_admitted_total",
            "Total realtime sessions admitted to the registry.",
            "counter",
            self.sessions_admitted_total.load(Ordering::Relaxed),
        );
        append_scalar(
            &mut output,
            "realtime_sessions_replaced_total",
            "Total realtime sessions superseded by a newer connection for the same user.",
            "counter",
            self.sessions_replaced_total.load(Ordering::Relaxed),
        );

        output.push_str(
            "# HELP realtime_sessions_closed_total Total realtime sessions closed by reason.\n",
        );
        output.push_str("# TYPE realtime_sessions_closed_total counter\n");
        append_close_reason_lines(&mut output, &self.sessions_closed_total);

        append_scalar(
            &mut output,
            "realtime_active_sessions",
            "Realtime sessions currently open.",
            "gauge",
            self.active_sessions.load(Ordering::Relaxed).max(0),
        );
        append_scalar(
            &mut output,
            "realtime_notifications_queued_total",
            "Notifications placed on a session outbound queue.",
            "counter",
            self.notifications_queued_total.load(Ordering::Relaxed),
        );
        append_scalar(
            &mut output,
            "realtime_notifications_dropped_total",
            "Notifications dropped because a session outbound queue was full or closed.",
            "counter",
            self.notifications_dropped_total.load(Ordering::Relaxed),
        );
        append_scalar(
            &mut output,
            "realtime_notifications_offline_total",
            "Notifications addressed to users without a live session.",
            "counter",
            self.notifications_offline_total.load(Ordering::Relaxed),
        );
        append_scalar(
            &mut output,
            "realtime_frames_written_total",
            "Notification frames written to realtime clients.",
            "counter",
            self.frames_written_total.load(Ordering::Relaxed),
        );
        append_scalar(
            &mut output,
            "realtime_pings_sent_total",
            "Heartbeat pings written to realtime clients.",
            "counter",
            self.pings_sent_total.load(Ordering::Relaxed),
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().unwrap_or_else(PoisonError::into_inner);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_scalar(
    output: &mut String,
    metric_name: &str,
    help: &str,
    kind: &str,
    value: impl std::fmt::Display,
) {
    output.push_str(&format!("# HELP {metric_name} {help}\n"));
    output.push_str(&format!("# TYPE {metric_name} {kind}\n"));
    output.push_str(&format!("{metric_name} {value}\n"));
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().unwrap_or_else(PoisonError::into_inner);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_close_reason_lines(output: &mut String, map: &Mutex<HashMap<&'static str, u64>>) {
    let guard = map.lock().unwrap_or_else(PoisonError::into_inner);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (reason, value) in entries {
        output.push_str(&format!(
            "realtime_sessions_closed_total{{reason=\"{}\"}} {value}\n",
            escape_label_value(reason),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
