//! # Metrics — Prometheus Counters for the Log Pipeline
//!
//! Operational metrics in the Prometheus text exposition format.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `logwatch_records_received_total` | Counter | — | Records delivered by the tail |
//! | `logwatch_alert_worthy_total` | Counter | `task` | Records at or above the alert threshold |
//! | `logwatch_alerts_triggered_total` | Counter | `reason` | Alert reasons raised while unmuted |
//! | `logwatch_tail_reconnects_total` | Counter | — | Tail reconnects scheduled |
//! | `logwatch_tail_connected` | Gauge | — | 1 while the tail is streaming |
//! | `logwatch_page_requests_total` | Counter | — | Underlying history queries sent |
//!
//! Deduplicated page requests count once.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct TaskLabel {
    pub task: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ReasonLabel {
    pub reason: String,
}

/// All fields are atomic and safe to update from any task.
pub struct Metrics {
    pub registry: Registry,
    pub records_received: Counter,
    pub alert_worthy: Family<TaskLabel, Counter>,
    pub alerts_triggered: Family<ReasonLabel, Counter>,
    pub tail_reconnects: Counter,
    pub tail_connected: Gauge,
    pub page_requests: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let records_received = Counter::default();
        registry.register(
            "logwatch_records_received",
            "Records delivered by the tail",
            records_received.clone(),
        );

        let alert_worthy = Family::<TaskLabel, Counter>::default();
        registry.register(
            "logwatch_alert_worthy",
            "Records at or above the alert threshold by task",
            alert_worthy.clone(),
        );

        let alerts_triggered = Family::<ReasonLabel, Counter>::default();
        registry.register(
            "logwatch_alerts_triggered",
            "Alert reasons raised while unmuted",
            alerts_triggered.clone(),
        );

        let tail_reconnects = Counter::default();
        registry.register(
            "logwatch_tail_reconnects",
            "Tail reconnects scheduled",
            tail_reconnects.clone(),
        );

        let tail_connected = Gauge::default();
        registry.register(
            "logwatch_tail_connected",
            "1 while the tail is streaming",
            tail_connected.clone(),
        );

        let page_requests = Counter::default();
        registry.register(
            "logwatch_page_requests",
            "History queries sent to the log store",
            page_requests.clone(),
        );

        Self {
            registry,
            records_received,
            alert_worthy,
            alerts_triggered,
            tail_reconnects,
            tail_connected,
            page_requests,
        }
    }

    pub fn alert_worthy_for(&self, task: &str) -> u64 {
        self.alert_worthy
            .get_or_create(&TaskLabel {
                task: task.to_string(),
            })
            .get()
    }

    pub fn triggered_for(&self, reason: &str) -> u64 {
        self.alerts_triggered
            .get_or_create(&ReasonLabel {
                reason: reason.to_string(),
            })
            .get()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::warn!(error = %e, "metrics: encoding failed");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
