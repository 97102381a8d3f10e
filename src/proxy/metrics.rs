//! Forwarder metrics, one registry per forwarder instance.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

use crate::proxy::error::ErrorClass;

const DURATION_BUCKETS: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

#[derive(Clone)]
pub struct ForwarderMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    active_requests: IntGauge,
    errors_total: IntCounterVec,
}

impl ForwarderMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("http_proxy_requests_total", "Forwarded HTTP requests"),
            &["method", "status_code", "error_code"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_proxy_request_duration_seconds",
                "Forwarded HTTP request duration",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["method"],
        )?;
        let active_requests = IntGauge::new(
            "http_proxy_active_requests",
            "Forwarded HTTP requests in flight",
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("http_proxy_errors_total", "Forwarding failures by class"),
            &["error_type"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            active_requests,
            errors_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Marks one request in flight until the guard drops.
    pub fn start(&self, method: &str) -> RequestGuard {
        self.active_requests.inc();
        RequestGuard {
            metrics: self.clone(),
            method: method.to_string(),
            started: Instant::now(),
        }
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.get()
    }

    pub fn request_count(&self, method: &str, status_code: &str, error_code: &str) -> u64 {
        self.requests_total
            .with_label_values(&[method, status_code, error_code])
            .get()
    }

    pub fn error_count(&self, class: ErrorClass) -> u64 {
        self.errors_total.with_label_values(&[class.as_str()]).get()
    }

    pub fn duration_samples(&self, method: &str) -> u64 {
        self.request_duration
            .with_label_values(&[method])
            .get_sample_count()
    }

    /// Prometheus text exposition of this registry.
    pub fn encode(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| format!("encode metrics: {}", e))?;
        String::from_utf8(buffer).map_err(|e| format!("metrics not utf-8: {}", e))
    }
}

/// In-flight request. Dropping it, including by cancellation, lowers the
/// active gauge and records the duration.
pub struct RequestGuard {
    metrics: ForwarderMetrics,
    method: String,
    started: Instant,
}

impl RequestGuard {
    pub fn succeeded(&self, status: u16) {
        let status = status.to_string();
        self.metrics
            .requests_total
            .with_label_values(&[self.method.as_str(), status.as_str(), "none"])
            .inc();
    }

    pub fn failed(&self, error_code: &str, class: ErrorClass) {
        self.metrics
            .requests_total
            .with_label_values(&[self.method.as_str(), "error", error_code])
            .inc();
        self.metrics
            .errors_total
            .with_label_values(&[class.as_str()])
            .inc();
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.metrics.active_requests.dec();
        self.metrics
            .request_duration
            .with_label_values(&[self.method.as_str()])
            .observe(self.started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_active_requests() {
        let metrics = ForwarderMetrics::new().unwrap();
        {
            let guard = metrics.start("GET");
            assert_eq!(metrics.active_requests(), 1);
            guard.succeeded(200);
        }
        assert_eq!(metrics.active_requests(), 0);
        assert_eq!(metrics.request_count("GET", "200", "none"), 1);
        assert_eq!(metrics.duration_samples("GET"), 1);
    }

    #[test]
    fn test_failure_counts_once_per_class() {
        let metrics = ForwarderMetrics::new().unwrap();
        metrics.start("POST").failed("FORBIDDEN", ErrorClass::Security);
        assert_eq!(metrics.request_count("POST", "error", "FORBIDDEN"), 1);
        assert_eq!(metrics.error_count(ErrorClass::Security), 1);
        assert_eq!(metrics.error_count(ErrorClass::Network), 0);
    }

    #[test]
    fn test_encode_exposes_metric_names() {
        let metrics = ForwarderMetrics::new().unwrap();
        metrics.start("GET").succeeded(204);
        let text = metrics.encode().unwrap();
        assert!(text.contains("http_proxy_requests_total"));
        assert!(text.contains("http_proxy_request_duration_seconds_bucket"));
        assert!(text.contains("http_proxy_active_requests 0"));
    }
}
