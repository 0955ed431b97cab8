//! # Test Harness — Mock Log Store and Scripted Tail Transport
//!
//! Two fakes shared by the integration tests:
//!
//! | Fake | Used for | Time |
//! |------|----------|------|
//! | [`MockLogStore`] | HTTP paths (`/query`, `/stream_field_values`, `/tail`) | real, short delays |
//! | [`FakeTransport`] | tail state machine and pipeline wiring | paused tokio clock |
//!
//! ## Mock Log Store
//!
//! ```text
//! MockLogStore::builder().rows(..).start()
//!   └─ TcpListener::bind("127.0.0.1:0")   (random port)
//!   └─ axum::serve(listener, router)       (background tokio task)
//!   └─ Arc<Mutex<MockState>>               (scripted responses + request log)
//! ```
//!
//! `/query` filters the configured rows by the selector: `task_name="X"`
//! matches the row's `task_name` field and `_msg:"X"` matches a substring of
//! `_msg`. Rows are served by `offset`/`limit` as newline-delimited JSON.
//!
//! ## Fake Transport
//!
//! Each `open()` pops the next scripted outcome. An accepted open hands back
//! a channel-backed stream the test feeds with `send`, `end_stream` or
//! `fail_stream`. Unscripted opens are accepted.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Router};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use logwatch::error::{Error, Result};
use logwatch::record::LogRecord;
use logwatch::tail::{ChunkStream, CloseKind, TailBatch, TailListener, TailRequest, TailTransport};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const API_PATH: &str = "/select/logsql";

// ── Rows ────────────────────────────────────────────────────────────

/// A VictoriaLogs-shaped row for the default fixed labels.
pub fn row(task: &str, level: &str, msg: &str, time: &str) -> Value {
    json!({
        "_time": time,
        "_msg": format!("[{}] {} {} ", time, level, msg),
        "_stream": format!(
            "{{job=\"tasks\",service=\"Batch-Sync\",task_name=\"{}\"}}",
            task
        ),
        "task_name": task,
        "level": level,
    })
}

/// A row whose task only appears in the message text.
pub fn unlabelled_row(msg: &str, time: &str) -> Value {
    json!({
        "_time": time,
        "_msg": msg,
        "_stream": "{job=\"tasks\",service=\"Batch-Sync\"}",
    })
}

pub fn line(value: &Value) -> String {
    format!("{}\n", value)
}

// ── Mock Log Store ──────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    rows: Vec<Value>,
    query_delay: Duration,
    query_failures: VecDeque<(StatusCode, String)>,
    query_forms: Vec<HashMap<String, String>>,
    field_values: Vec<String>,
    field_forms: Vec<HashMap<String, String>>,
    tail_lines: Vec<String>,
    tail_status: Option<StatusCode>,
    tail_hold_open: bool,
    tail_forms: Vec<HashMap<String, String>>,
}

type SharedState = Arc<Mutex<MockState>>;

pub struct MockLogStore {
    base_url: String,
    _abort_handle: tokio::task::AbortHandle,
    state: SharedState,
}

impl MockLogStore {
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn builder() -> MockLogStoreBuilder {
        MockLogStoreBuilder {
            state: MockState {
                tail_hold_open: true,
                ..MockState::default()
            },
        }
    }

    /// `http://127.0.0.1:<port>/select/logsql`
    pub fn api_base(&self) -> String {
        format!("{}{}", self.base_url, API_PATH)
    }

    pub fn origin(&self) -> &str {
        &self.base_url
    }

    pub fn query_hits(&self) -> usize {
        self.state.lock().unwrap().query_forms.len()
    }

    pub fn query_forms(&self) -> Vec<HashMap<String, String>> {
        self.state.lock().unwrap().query_forms.clone()
    }

    pub fn field_forms(&self) -> Vec<HashMap<String, String>> {
        self.state.lock().unwrap().field_forms.clone()
    }

    pub fn tail_forms(&self) -> Vec<HashMap<String, String>> {
        self.state.lock().unwrap().tail_forms.clone()
    }

    pub fn push_failures(&self, status: StatusCode, body: &str, count: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state
                .query_failures
                .push_back((status, body.to_string()));
        }
    }
}

pub struct MockLogStoreBuilder {
    state: MockState,
}

impl MockLogStoreBuilder {
    pub fn rows(mut self, rows: Vec<Value>) -> Self {
        self.state.rows = rows;
        self
    }

    pub fn query_delay(mut self, delay: Duration) -> Self {
        self.state.query_delay = delay;
        self
    }

    /// Fail the next `count` queries with `status` and `body`.
    pub fn failing(mut self, status: StatusCode, body: &str, count: usize) -> Self {
        for _ in 0..count {
            self.state
                .query_failures
                .push_back((status, body.to_string()));
        }
        self
    }

    pub fn field_values(mut self, values: &[&str]) -> Self {
        self.state.field_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn tail_lines(mut self, lines: Vec<String>) -> Self {
        self.state.tail_lines = lines;
        self
    }

    pub fn tail_status(mut self, status: StatusCode) -> Self {
        self.state.tail_status = Some(status);
        self
    }

    /// End the tail response after the scripted lines.
    pub fn tail_completes(mut self) -> Self {
        self.state.tail_hold_open = false;
        self
    }

    pub async fn start(self) -> MockLogStore {
        let shared_state: SharedState = Arc::new(Mutex::new(self.state));

        let app = Router::new()
            .route(&format!("{}/query", API_PATH), post(handle_query))
            .route(
                &format!("{}/stream_field_values", API_PATH),
                post(handle_field_values),
            )
            .route(&format!("{}/tail", API_PATH), post(handle_tail))
            .with_state(Arc::clone(&shared_state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock log store to random port");
        let addr: SocketAddr = listener
            .local_addr()
            .expect("Failed to get mock log store local address");
        let base_url = format!("http://127.0.0.1:{}", addr.port());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("Mock log store server failed");
        });

        MockLogStore {
            base_url,
            _abort_handle: handle.abort_handle(),
            state: shared_state,
        }
    }
}

fn selector_matches(query: &str, row: &Value) -> bool {
    if let Some(rest) = query.split("task_name=\"").nth(1) {
        let task = rest.split('"').next().unwrap_or_default();
        return row.get("task_name").and_then(Value::as_str) == Some(task);
    }
    if let Some(rest) = query.split("_msg:\"").nth(1) {
        let needle = rest.trim_end_matches('"');
        return row
            .get("_msg")
            .and_then(Value::as_str)
            .is_some_and(|m| m.contains(needle));
    }
    true
}

async fn handle_query(
    State(state): State<SharedState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let (delay, failure) = {
        let mut s = state.lock().unwrap();
        s.query_forms.push(form.clone());
        (s.query_delay, s.query_failures.pop_front())
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if let Some((status, body)) = failure {
        return (status, body).into_response();
    }
    let query = form.get("query").cloned().unwrap_or_default();
    let offset: usize = form
        .get("offset")
        .and_then(|o| o.parse().ok())
        .unwrap_or(0);
    let limit: usize = form
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(usize::MAX);
    let body: String = {
        let s = state.lock().unwrap();
        s.rows
            .iter()
            .filter(|r| selector_matches(&query, r))
            .skip(offset)
            .take(limit)
            .map(line)
            .collect()
    };
    (StatusCode::OK, body).into_response()
}

async fn handle_field_values(
    State(state): State<SharedState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let mut s = state.lock().unwrap();
    s.field_forms.push(form);
    let values: Vec<Value> = s
        .field_values
        .iter()
        .map(|v| json!({"value": v, "hits": 1}))
        .collect();
    axum::Json(json!({ "values": values })).into_response()
}

async fn handle_tail(
    State(state): State<SharedState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let (lines, status, hold_open) = {
        let mut s = state.lock().unwrap();
        s.tail_forms.push(form);
        (s.tail_lines.clone(), s.tail_status, s.tail_hold_open)
    };
    if let Some(status) = status {
        return (status, "tail unavailable").into_response();
    }
    let chunks = futures::stream::iter(
        lines
            .into_iter()
            .map(|l| Ok::<_, std::io::Error>(Bytes::from(l))),
    );
    let body = if hold_open {
        Body::from_stream(chunks.chain(futures::stream::pending()))
    } else {
        Body::from_stream(chunks)
    };
    Response::new(body)
}

// ── Fake Transport ──────────────────────────────────────────────────

pub enum FakeOpen {
    /// Accept and hand back a stream the test drives.
    Accept,
    /// Fail the open with this error.
    Fail(Error),
    /// Never resolve (headers held back by a proxy).
    Hang,
}

#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<FakeOpen>>,
    requests: Mutex<Vec<TailRequest>>,
    streams: Mutex<Vec<mpsc::UnboundedSender<Result<Bytes>>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = FakeOpen>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn opens(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<TailRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Push raw bytes into the most recent stream.
    pub fn send(&self, chunk: &str) {
        if let Some(tx) = self.streams.lock().unwrap().last() {
            let _ = tx.unbounded_send(Ok(Bytes::from(chunk.to_string())));
        }
    }

    pub fn send_row(&self, row: &Value) {
        self.send(&line(row));
    }

    /// End the most recent stream normally.
    pub fn end_stream(&self) {
        self.streams.lock().unwrap().pop();
    }

    /// Fail the most recent stream.
    pub fn fail_stream(&self, error: Error) {
        if let Some(tx) = self.streams.lock().unwrap().pop() {
            let _ = tx.unbounded_send(Err(error));
        }
    }
}

impl TailTransport for FakeTransport {
    fn open(&self, request: TailRequest) -> BoxFuture<'static, Result<ChunkStream>> {
        self.requests.lock().unwrap().push(request);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeOpen::Accept);
        match outcome {
            FakeOpen::Accept => {
                let (tx, rx) = mpsc::unbounded();
                self.streams.lock().unwrap().push(tx);
                let stream: ChunkStream = rx.boxed();
                futures::future::ready(Ok(stream)).boxed()
            }
            FakeOpen::Fail(err) => futures::future::ready(Err(err)).boxed(),
            FakeOpen::Hang => futures::future::pending().boxed(),
        }
    }
}

// ── Recording Listener ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    Open,
    Records { lines: Vec<String>, initializing: bool },
    Error(String),
    Close(CloseKind),
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<TailEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TailEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&TailEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl TailListener for RecordingListener {
    fn on_open(&self) {
        self.events.lock().unwrap().push(TailEvent::Open);
    }

    fn on_records(&self, batch: TailBatch) {
        self.events.lock().unwrap().push(TailEvent::Records {
            lines: batch.records.iter().map(|r| r.line.clone()).collect(),
            initializing: batch.initializing,
        });
    }

    fn on_error(&self, error: &Error) {
        self.events
            .lock()
            .unwrap()
            .push(TailEvent::Error(error.to_string()));
    }

    fn on_close(&self, kind: CloseKind) {
        self.events.lock().unwrap().push(TailEvent::Close(kind));
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Let spawned tasks run without advancing the clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Collects every record a subscriber receives.
pub fn sink() -> (
    Arc<Mutex<Vec<Vec<LogRecord>>>>,
    impl Fn(&[LogRecord]) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let target = seen.clone();
    let callback = move |records: &[LogRecord]| {
        target.lock().unwrap().push(records.to_vec());
    };
    (seen, callback)
}

/// Poll `cond` every 10ms for up to two seconds (real time).
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
