//! Refresh audit trail
//!
//! `AuditSink::record_refresh` returns nothing, so a broken sink can never
//! fail a refresh.

use oauth_provider::RefreshErrorKind;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Which token endpoint produced the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMethod {
    Primary,
    Fallback,
}

impl RefreshMethod {
    pub fn label(self) -> &'static str {
        match self {
            RefreshMethod::Primary => "primary",
            RefreshMethod::Fallback => "fallback",
        }
    }
}

/// One refresh attempt. Times are unix milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshAuditRecord {
    pub instance_id: Uuid,
    pub method: RefreshMethod,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<RefreshErrorKind>,
    pub started_at: u64,
    pub finished_at: u64,
}

impl RefreshAuditRecord {
    pub fn duration_ms(&self) -> u64 {
        self.finished_at.saturating_sub(self.started_at)
    }
}

pub trait AuditSink: Send + Sync {
    fn record_refresh(&self, record: &RefreshAuditRecord);
}

/// Writes audit records as structured log events and refresh metrics:
///
/// - `token_refresh_total` (counter): labels `method`, `outcome`, `error_type`
/// - `token_refresh_duration_seconds` (histogram): label `method`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_refresh(&self, record: &RefreshAuditRecord) {
        let method = record.method.label();
        let error_type = record.error_type.map_or("none", RefreshErrorKind::as_str);
        let outcome = if record.success { "success" } else { "failure" };

        metrics::counter!(
            "token_refresh_total",
            "method" => method,
            "outcome" => outcome,
            "error_type" => error_type
        )
        .increment(1);
        metrics::histogram!("token_refresh_duration_seconds", "method" => method)
            .record(record.duration_ms() as f64 / 1000.0);

        if record.success {
            info!(
                target: "audit",
                instance_id = %record.instance_id,
                method,
                duration_ms = record.duration_ms(),
                "token refresh succeeded"
            );
        } else {
            warn!(
                target: "audit",
                instance_id = %record.instance_id,
                method,
                error_type,
                duration_ms = record.duration_ms(),
                "token refresh failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(success: bool) -> RefreshAuditRecord {
        RefreshAuditRecord {
            instance_id: Uuid::nil(),
            method: RefreshMethod::Fallback,
            success,
            error_type: (!success).then_some(RefreshErrorKind::NetworkError),
            started_at: 1_000,
            finished_at: 1_250,
        }
    }

    fn series<'a>(rendered: &'a str, name: &str, label: &str) -> Option<&'a str> {
        rendered
            .lines()
            .find(|line| line.starts_with(name) && line.contains(label))
    }

    #[test]
    fn tracing_sink_records_outcome_metrics() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        TracingAuditSink.record_refresh(&record(true));
        TracingAuditSink.record_refresh(&RefreshAuditRecord {
            method: RefreshMethod::Primary,
            error_type: Some(RefreshErrorKind::InvalidRefreshToken),
            ..record(false)
        });
        TracingAuditSink.record_refresh(&record(false));

        let rendered = handle.render();
        let revoked = series(&rendered, "token_refresh_total{", "INVALID_REFRESH_TOKEN").unwrap();
        assert!(revoked.contains(r#"method="primary""#), "{revoked}");
        assert!(revoked.contains(r#"outcome="failure""#), "{revoked}");
        assert!(revoked.ends_with(" 1"), "{revoked}");

        let ok = series(&rendered, "token_refresh_total{", r#"outcome="success""#).unwrap();
        assert!(ok.contains(r#"error_type="none""#), "{ok}");
        assert!(series(&rendered, "token_refresh_total{", "NETWORK_ERROR").is_some());

        let count = series(
            &rendered,
            "token_refresh_duration_seconds_count{",
            r#"method="fallback""#,
        )
        .unwrap();
        assert!(count.ends_with(" 2"), "{count}");
    }

    #[test]
    fn record_serializes_error_type_only_on_failure() {
        let ok = serde_json::to_value(record(true)).unwrap();
        assert_eq!(ok["method"], "fallback");
        assert!(ok.get("error_type").is_none());

        let failed = serde_json::to_value(record(false)).unwrap();
        assert_eq!(failed["error_type"], "NETWORK_ERROR");
        assert_eq!(record(false).duration_ms(), 250);
    }
}
