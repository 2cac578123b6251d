use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::models::ScopeKind;

/// Prometheus collectors for one service instance. Cloning shares the registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    audit_events_total: IntCounterVec,
    access_denied_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "path", "status"],
        )?;
        let audit_events_total = IntCounterVec::new(
            Opts::new("audit_events_total", "Audit log entries written"),
            &["resource", "action"],
        )?;
        let access_denied_total = IntCounterVec::new(
            Opts::new("access_denied_total", "Requests rejected by access control"),
            &["scope", "reason"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(audit_events_total.clone()))?;
        registry.register(Box::new(access_denied_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            audit_events_total,
            access_denied_total,
        })
    }

    pub fn record_request(&self, method: &str, path: &str, status: u16, seconds: f64) {
        let status = status.to_string();
        let labels = [method, path, status.as_str()];
        self.http_requests_total.with_label_values(&labels).inc();
        self.http_request_duration_seconds
            .with_label_values(&labels)
            .observe(seconds);
    }

    pub fn record_audit_event(&self, resource: &str, action: &str) {
        self.audit_events_total
            .with_label_values(&[resource, action])
            .inc();
    }

    pub fn record_denied(&self, scope: ScopeKind, reason: &str) {
        self.access_denied_total
            .with_label_values(&[scope.as_str(), reason])
            .inc();
    }

    /// Text exposition format for `/metrics`.
    pub fn render(&self) -> Result<String, anyhow::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("GET", "/organizations/:org_id", 200, 0.01);
        metrics.record_audit_event("secret", "create");
        metrics.record_denied(ScopeKind::Project, "InsufficientRole");

        let output = metrics.render().unwrap();
        assert!(output.contains("http_requests_total"));
        assert!(output.contains("audit_events_total{action=\"create\",resource=\"secret\"} 1"));
        assert!(output.contains("access_denied_total"));
    }
}
