//! # Pipeline — Tail, Distribution, and Alerting for One Service
//!
//! [`LogPipeline`] owns every stateful piece for one configured service and
//! wires them together:
//!
//! ```text
//! TailSession ──batch──▶ PipelineListener ──▶ DistributionHub ──▶ subscribers
//!                              │
//!                              ├─▶ ThresholdEvaluator ─▶ AlertMuteState ("error")
//!                              └─▶ TaskTracker (unread counts)
//! PageFetcher ◀── query_page (on demand)
//! ```
//!
//! ## Alert Rules
//!
//! | Event | Effect |
//! |-------|--------|
//! | worthy record, watched task | `trigger_alert("error")` (mute-gated) |
//! | worthy record, task not in view | unread count +1 |
//! | any batch while the tail is initializing | no evaluation |
//! | stream opened | `"disconnect"` retracted |
//! | stream failed after a previous open | `trigger_alert("disconnect")` |
//!
//! The pipeline is built for a current-thread runtime but is `Send + Sync`.
//! Construct it with [`LogPipeline::builder`] and tear it down with
//! [`LogPipeline::dispose`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{resolve_api_base, ServiceConfig};
use crate::error::{Error, Result};
use crate::hub::{DistributionHub, Subscription};
use crate::lock_or_recover;
use crate::metrics::{Metrics, ReasonLabel, TaskLabel};
use crate::mute::AlertMuteState;
use crate::page::{Page, PageFetcher, PageRequest};
use crate::record::{LogRecord, RecordDecoder};
use crate::store::{MemoryStore, StateStore};
use crate::tail::{
    CloseKind, HttpTailTransport, TailBatch, TailListener, TailOptions, TailRequest, TailSession,
    TailState, TailTransport,
};
use crate::tasks::TaskTracker;
use crate::threshold::ThresholdEvaluator;

pub const REASON_ERROR: &str = "error";
pub const REASON_DISCONNECT: &str = "disconnect";

/// Snapshot of pipeline state for status output.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub service: String,
    pub connected: bool,
    pub tail_state: Option<TailState>,
    pub reconnects: u64,
    pub batches: u64,
    pub records: u64,
    /// Subscriber callback invocations across all batches.
    pub deliveries: u64,
    pub mute_until: i64,
    pub alert_reasons: Vec<String>,
    pub unread: BTreeMap<String, u64>,
    pub watched: Vec<String>,
    pub current_task: Option<String>,
}

#[derive(Default)]
struct Link {
    connected: bool,
    had_connection: bool,
}

struct PipelineInner {
    config: ServiceConfig,
    evaluator: ThresholdEvaluator,
    hub: DistributionHub,
    mute: AlertMuteState,
    tasks: TaskTracker,
    metrics: Arc<Metrics>,
    link: Mutex<Link>,
    batches: AtomicU64,
    records: AtomicU64,
    deliveries: AtomicU64,
}

impl PipelineInner {
    fn handle_batch(&self, batch: TailBatch) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.records
            .fetch_add(batch.records.len() as u64, Ordering::Relaxed);
        self.metrics
            .records_received
            .inc_by(batch.records.len() as u64);

        if !batch.initializing {
            for record in &batch.records {
                self.evaluate(record);
            }
        }
        let delivered = self.hub.on_batch(&batch.records);
        self.deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    fn evaluate(&self, record: &LogRecord) {
        if !self
            .evaluator
            .is_alert_worthy(Some(&record.level), &self.config.alert.level)
        {
            return;
        }
        let Some(task) = record.resolved_task() else {
            return;
        };
        self.metrics
            .alert_worthy
            .get_or_create(&TaskLabel {
                task: task.to_string(),
            })
            .inc();
        if self.tasks.is_watched(task) {
            self.trigger(REASON_ERROR);
        }
        self.tasks.note_alert_worthy(task);
    }

    fn trigger(&self, reason: &str) {
        if self.mute.trigger_alert(reason) {
            self.metrics
                .alerts_triggered
                .get_or_create(&ReasonLabel {
                    reason: reason.to_string(),
                })
                .inc();
        }
    }
}

/// Bridges tail events into the pipeline without keeping it alive.
struct PipelineListener {
    inner: Weak<PipelineInner>,
}

impl TailListener for PipelineListener {
    fn on_open(&self) {
        let Some(inner) = self.inner.upgrade() else { return };
        {
            let mut link = lock_or_recover(&inner.link);
            link.connected = true;
            link.had_connection = true;
        }
        inner.metrics.tail_connected.set(1);
        inner.mute.remove_alert_reason(REASON_DISCONNECT);
    }

    fn on_records(&self, batch: TailBatch) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_batch(batch);
        }
    }

    fn on_error(&self, error: &Error) {
        warn!(error = %error, "pipeline: tail error");
    }

    fn on_close(&self, kind: CloseKind) {
        let Some(inner) = self.inner.upgrade() else { return };
        let had_connection = {
            let mut link = lock_or_recover(&inner.link);
            link.connected = false;
            link.had_connection
        };
        inner.metrics.tail_connected.set(0);
        if kind != CloseKind::Manual {
            inner.metrics.tail_reconnects.inc();
        }
        if had_connection && kind == CloseKind::Error {
            inner.trigger(REASON_DISCONNECT);
        }
    }
}

pub struct LogPipelineBuilder {
    config: ServiceConfig,
    store: Option<Arc<dyn StateStore>>,
    clock: Option<Arc<dyn Clock>>,
    transport: Option<Arc<dyn TailTransport>>,
    client: Option<reqwest::Client>,
    metrics: Option<Arc<Metrics>>,
    origin: Option<String>,
}

impl LogPipelineBuilder {
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the HTTP tail transport.
    pub fn transport(mut self, transport: Arc<dyn TailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Origin for resolving a relative `api_base_path`.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn build(self) -> Result<LogPipeline> {
        let config = self.config;
        let api_base = resolve_api_base(&config.vmlog.api_base_path, self.origin.as_deref())?;
        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let client = self.client.unwrap_or_default();
        let metrics = self.metrics.unwrap_or_default();
        let transport: Arc<dyn TailTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTailTransport::new(client.clone(), &api_base)),
        };

        let fetcher = PageFetcher::new(
            &config,
            api_base,
            client,
            clock.clone(),
            Some(metrics.clone()),
        );
        let decoder = RecordDecoder::new(
            &config.vmlog.task_label,
            config.vmlog.fixed_labels.keys().cloned(),
        );
        let inner = Arc::new(PipelineInner {
            evaluator: ThresholdEvaluator::from_config(&config.log_levels),
            hub: DistributionHub::new(),
            mute: AlertMuteState::new(&config.id, &config.alert, store.clone(), clock.clone()),
            tasks: TaskTracker::new(&config.id, store),
            metrics,
            link: Mutex::new(Link::default()),
            batches: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            records: AtomicU64::new(0),
            config,
        });
        info!(service = %inner.config.id, "pipeline: created");
        Ok(LogPipeline {
            inner,
            fetcher,
            decoder,
            clock,
            transport,
            session: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }
}

pub struct LogPipeline {
    inner: Arc<PipelineInner>,
    fetcher: PageFetcher,
    decoder: RecordDecoder,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn TailTransport>,
    session: Mutex<Option<Arc<TailSession>>>,
    disposed: AtomicBool,
}

impl LogPipeline {
    pub fn builder(config: ServiceConfig) -> LogPipelineBuilder {
        LogPipelineBuilder {
            config,
            store: None,
            clock: None,
            transport: None,
            client: None,
            metrics: None,
            origin: None,
        }
    }

    /// HTTP transport, system clock, and the given state store.
    pub fn new(config: ServiceConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        Self::builder(config).store(store).build()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn fetcher(&self) -> &PageFetcher {
        &self.fetcher
    }

    pub fn tail_request(&self) -> TailRequest {
        let tail = &self.inner.config.vmlog.tail;
        TailRequest {
            query: self.fetcher.selectors().base(),
            delay_for: tail.delay_for.clone(),
            refresh_interval: tail.refresh_interval.clone(),
        }
    }

    /// Start tailing the service's stream. A no-op if a session is live or
    /// the pipeline has been disposed.
    pub fn connect(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let session = {
            let mut slot = lock_or_recover(&self.session);
            if slot
                .as_ref()
                .is_some_and(|s| s.state() != TailState::ManualClose)
            {
                return;
            }
            let config = &self.inner.config;
            let session = Arc::new(TailSession::new(
                self.transport.clone(),
                Arc::new(PipelineListener {
                    inner: Arc::downgrade(&self.inner),
                }),
                self.decoder.clone(),
                self.tail_request(),
                TailOptions {
                    reconnect_delay: config.reconnect_delay(),
                    initialization_delay: config.initialization_delay(),
                    optimistic_open: config.vmlog.tail.optimistic_open,
                },
                self.clock.clone(),
            ));
            *slot = Some(session.clone());
            session
        };
        session.connect();
    }

    /// Close the tail. Subscribers stay registered.
    pub fn disconnect(&self) {
        let session = lock_or_recover(&self.session).take();
        if let Some(session) = session {
            session.close();
        }
    }

    /// Close the tail and stop background work.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
        self.inner.mute.dispose();
        info!(service = %self.inner.config.id, "pipeline: disposed");
    }

    pub fn is_connected(&self) -> bool {
        lock_or_recover(&self.inner.link).connected
    }

    pub fn tail_state(&self) -> Option<TailState> {
        lock_or_recover(&self.session).as_ref().map(|s| s.state())
    }

    pub fn is_initializing(&self) -> bool {
        lock_or_recover(&self.session)
            .as_ref()
            .is_some_and(|s| s.is_initializing())
    }

    pub fn pending_timers(&self) -> usize {
        lock_or_recover(&self.session)
            .as_ref()
            .map(|s| s.pending_timers())
            .unwrap_or(0)
    }

    pub fn subscribe<F>(&self, task: &str, callback: F) -> Subscription
    where
        F: Fn(&[LogRecord]) + Send + Sync + 'static,
    {
        self.inner.hub.subscribe(task, callback)
    }

    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[LogRecord]) + Send + Sync + 'static,
    {
        self.inner.hub.subscribe_all(callback)
    }

    pub fn hub(&self) -> &DistributionHub {
        &self.inner.hub
    }

    /// One page of a task's history (or the whole service when `task` is
    /// `None`), filtered by the display level when `level` is set.
    pub async fn query_page(
        &self,
        task: Option<&str>,
        request: PageRequest,
        level: Option<&str>,
    ) -> Result<Page> {
        match task.filter(|t| !t.is_empty()) {
            Some(task) => self.fetcher.query_task_page(task, request, level).await,
            None => {
                let mut page = self
                    .fetcher
                    .query_page(&self.fetcher.selectors().base(), request)
                    .await?;
                if let Some(level) = level {
                    page.records = self.inner.evaluator.filter(page.records, level);
                }
                Ok(page)
            }
        }
    }

    pub async fn task_names(&self) -> Result<Vec<String>> {
        self.fetcher.task_names().await
    }

    pub fn set_current_viewing_task(&self, task: Option<&str>) {
        self.inner.tasks.set_current_viewing_task(task);
    }

    pub fn current_viewing_task(&self) -> Option<String> {
        self.inner.tasks.current_viewing_task()
    }

    pub fn unread_alert_count(&self, task: &str) -> u64 {
        self.inner.tasks.unread_count(task)
    }

    pub fn toggle_watched(&self, task: &str) -> bool {
        self.inner.tasks.toggle_watched(task)
    }

    pub fn is_watched(&self, task: &str) -> bool {
        self.inner.tasks.is_watched(task)
    }

    pub fn watched_tasks(&self) -> Vec<String> {
        self.inner.tasks.watched()
    }

    pub fn mute(&self) -> &AlertMuteState {
        &self.inner.mute
    }

    pub fn set_mute(&self, minutes: i64) {
        self.inner.mute.set_mute(minutes);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.mute.is_muted()
    }

    pub fn trigger_alert(&self, reason: &str) -> bool {
        self.inner.mute.trigger_alert(reason)
    }

    pub fn dismiss_alert(&self) {
        self.inner.mute.dismiss_alert();
    }

    pub fn alert_reasons(&self) -> Vec<String> {
        self.inner.mute.alert_reasons()
    }

    pub fn is_alert_visible(&self) -> bool {
        self.inner.mute.is_alert_visible()
    }

    pub fn stats(&self) -> PipelineStats {
        let (tail_state, reconnects) = match lock_or_recover(&self.session).as_ref() {
            Some(s) => (Some(s.state()), s.reconnects()),
            None => (None, 0),
        };
        PipelineStats {
            service: self.inner.config.id.clone(),
            connected: self.is_connected(),
            tail_state,
            reconnects,
            batches: self.inner.batches.load(Ordering::Relaxed),
            records: self.inner.records.load(Ordering::Relaxed),
            deliveries: self.inner.deliveries.load(Ordering::Relaxed),
            mute_until: self.inner.mute.mute_until(),
            alert_reasons: self.inner.mute.alert_reasons(),
            unread: self.inner.tasks.unread_counts(),
            watched: self.inner.tasks.watched(),
            current_task: self.inner.tasks.current_viewing_task(),
        }
    }
}

impl Drop for LogPipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rec(task: &str, level: &str) -> LogRecord {
        LogRecord {
            id: format!("{}-{}", task, level),
            timestamp_millis: 0,
            timestamp_nanos: 0,
            line: String::new(),
            labels: BTreeMap::new(),
            task_name: Some(task.to_string()),
            service: Some("Batch-Sync".into()),
            level: level.into(),
        }
    }

    fn pipeline() -> LogPipeline {
        let mut config = ServiceConfig::with_id("batch-sync");
        config.alert.level = "WARN".into();
        LogPipeline::builder(config).build().unwrap()
    }

    fn listener(p: &LogPipeline) -> PipelineListener {
        PipelineListener {
            inner: Arc::downgrade(&p.inner),
        }
    }

    #[test]
    fn worthy_record_alerts_only_for_watched_tasks() {
        let p = pipeline();
        let l = listener(&p);
        l.on_records(TailBatch {
            records: vec![rec("checkout", "ERROR")],
            initializing: false,
        });
        assert!(p.alert_reasons().is_empty());
        assert_eq!(p.unread_alert_count("checkout"), 1);

        p.toggle_watched("checkout");
        l.on_records(TailBatch {
            records: vec![rec("checkout", "INFO"), rec("checkout", "WARN")],
            initializing: false,
        });
        assert_eq!(p.alert_reasons(), vec![REASON_ERROR]);
        assert_eq!(p.unread_alert_count("checkout"), 2);
        assert_eq!(p.metrics().alert_worthy_for("checkout"), 2);
    }

    #[test]
    fn initializing_batches_are_not_evaluated_but_still_distributed() {
        let p = pipeline();
        p.toggle_watched("checkout");
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let _sub = p.subscribe("checkout", move |rs| {
            s.fetch_add(rs.len() as u64, Ordering::SeqCst);
        });
        listener(&p).on_records(TailBatch {
            records: vec![rec("checkout", "ERROR")],
            initializing: true,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(p.alert_reasons().is_empty());
        assert_eq!(p.unread_alert_count("checkout"), 0);
    }

    #[test]
    fn viewing_a_task_clears_and_suppresses_unread() {
        let p = pipeline();
        let l = listener(&p);
        l.on_records(TailBatch {
            records: vec![rec("billing", "ERROR")],
            initializing: false,
        });
        assert_eq!(p.unread_alert_count("billing"), 1);
        p.set_current_viewing_task(Some("billing"));
        assert_eq!(p.unread_alert_count("billing"), 0);
        l.on_records(TailBatch {
            records: vec![rec("billing", "ERROR")],
            initializing: false,
        });
        assert_eq!(p.unread_alert_count("billing"), 0);
        assert_eq!(p.current_viewing_task().as_deref(), Some("billing"));
    }

    #[test]
    fn disconnect_alert_needs_prior_connection_and_error_close() {
        let p = pipeline();
        let l = listener(&p);
        l.on_close(CloseKind::Error);
        assert!(p.alert_reasons().is_empty());

        l.on_open();
        assert!(p.is_connected());
        l.on_close(CloseKind::Completed);
        assert!(!p.is_connected());
        assert!(p.alert_reasons().is_empty());

        l.on_close(CloseKind::Error);
        assert_eq!(p.alert_reasons(), vec![REASON_DISCONNECT]);
        l.on_open();
        assert!(p.alert_reasons().is_empty());
        assert!(!p.is_alert_visible());
    }

    #[test]
    fn muted_pipeline_raises_nothing() {
        let p = pipeline();
        p.toggle_watched("checkout");
        p.set_mute(-1);
        listener(&p).on_records(TailBatch {
            records: vec![rec("checkout", "ERROR")],
            initializing: false,
        });
        assert!(p.alert_reasons().is_empty());
        assert_eq!(p.unread_alert_count("checkout"), 1);
        assert_eq!(p.metrics().triggered_for(REASON_ERROR), 0);
    }

    #[test]
    fn relative_api_base_requires_origin() {
        let mut config = ServiceConfig::with_id("a");
        config.vmlog.api_base_path = "/select/logsql".into();
        assert!(matches!(
            LogPipeline::builder(config.clone()).build(),
            Err(Error::InvalidUrl(_))
        ));
        assert!(LogPipeline::builder(config)
            .origin("http://127.0.0.1:9428")
            .build()
            .is_ok());
    }

    #[test]
    fn tail_request_uses_base_selector() {
        let p = pipeline();
        let req = p.tail_request();
        assert_eq!(req.query, r#"{job="tasks", service="Batch-Sync"}"#);
        assert_eq!(req.delay_for, "0");
        assert_eq!(req.refresh_interval, "1s");
    }
}
