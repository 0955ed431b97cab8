//! # Tail — Streaming Log Connection with Reconnect State Machine
//!
//! One [`TailSession`] owns at most one live streaming call to the log store's
//! `/tail` endpoint and reports what happens on it to a [`TailListener`].
//!
//! ## States
//!
//! | State | Meaning | Next |
//! |-------|---------|------|
//! | `Disconnected` | initial | `Connecting` |
//! | `Connecting` | request sent, no response yet | `Streaming`, `Reconnecting` |
//! | `Streaming` | response accepted, reading lines | `Reconnecting` |
//! | `Reconnecting` | waiting `reconnect_delay` | `Connecting` |
//! | `ManualClose` | closed by the owner; terminal | — |
//!
//! ## Initialization Guard
//!
//! Right after a stream opens the store replays a burst of recent records.
//! For `initialization_delay` after every open the session reports batches as
//! initializing so consumers can skip alert evaluation for that replay.
//!
//! ## Teardown
//!
//! Every transition out of `Streaming` releases the stream task. `close()`
//! aborts the stream, both timers, and bumps the session generation so any
//! work that raced the close finds itself stale and stays silent.
//!
//! Reconnects use a fixed delay and are never capped: a dashboard tail should
//! come back on its own after any outage.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::lock_or_recover;
use crate::record::{LogRecord, RecordDecoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    ManualClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// `close()` was called.
    Manual,
    /// The transport failed.
    Error,
    /// The store ended the stream.
    Completed,
}

#[derive(Debug, Clone)]
pub struct TailBatch {
    pub records: Vec<LogRecord>,
    /// True while the post-open guard is armed.
    pub initializing: bool,
}

pub trait TailListener: Send + Sync {
    fn on_open(&self) {}
    fn on_records(&self, batch: TailBatch);
    fn on_error(&self, _error: &Error) {}
    fn on_close(&self, _kind: CloseKind) {}
}

/// Parameters of one `/tail` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailRequest {
    pub query: String,
    /// Seconds the store holds records back, sent as `offset = "{delay_for}s"`.
    pub delay_for: String,
    pub refresh_interval: String,
}

impl TailRequest {
    pub fn form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("query", self.query.clone()),
            ("offset", format!("{}s", self.delay_for)),
            ("refresh_interval", self.refresh_interval.clone()),
        ]
    }
}

pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// Opens streaming calls. Resolves once the response has been accepted.
pub trait TailTransport: Send + Sync {
    fn open(&self, request: TailRequest) -> BoxFuture<'static, Result<ChunkStream>>;
}

/// `POST {api_base}/tail` over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTailTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTailTransport {
    pub fn new(client: reqwest::Client, api_base: &url::Url) -> Self {
        HttpTailTransport {
            client,
            endpoint: crate::config::endpoint(api_base, "tail"),
        }
    }
}

impl TailTransport for HttpTailTransport {
    fn open(&self, request: TailRequest) -> BoxFuture<'static, Result<ChunkStream>> {
        let call = self.client.post(&self.endpoint).form(&request.form());
        async move {
            let resp = call.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::from_response(status, body));
            }
            let stream: ChunkStream = resp.bytes_stream().map_err(Error::from).boxed();
            Ok(stream)
        }
        .boxed()
    }
}

#[derive(Debug, Clone)]
pub struct TailOptions {
    pub reconnect_delay: Duration,
    pub initialization_delay: Duration,
    /// Report the stream open when the call starts instead of on response.
    pub optimistic_open: bool,
}

impl Default for TailOptions {
    fn default() -> Self {
        TailOptions {
            reconnect_delay: Duration::from_millis(3000),
            initialization_delay: Duration::from_millis(2000),
            optimistic_open: false,
        }
    }
}

/// Splits a byte stream into lines, keeping partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

struct Slot {
    state: TailState,
    manual_close: bool,
    initializing: bool,
    generation: u64,
    reconnects: u64,
    stream_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    guard_timer: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn TailTransport>,
    listener: Arc<dyn TailListener>,
    decoder: RecordDecoder,
    request: TailRequest,
    options: TailOptions,
    clock: Arc<dyn Clock>,
    slot: Mutex<Slot>,
}

pub struct TailSession {
    inner: Arc<Inner>,
}

impl TailSession {
    pub fn new(
        transport: Arc<dyn TailTransport>,
        listener: Arc<dyn TailListener>,
        decoder: RecordDecoder,
        request: TailRequest,
        options: TailOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        TailSession {
            inner: Arc::new(Inner {
                transport,
                listener,
                decoder,
                request,
                options,
                clock,
                slot: Mutex::new(Slot {
                    state: TailState::Disconnected,
                    manual_close: false,
                    initializing: false,
                    generation: 0,
                    reconnects: 0,
                    stream_task: None,
                    reconnect_timer: None,
                    guard_timer: None,
                }),
            }),
        }
    }

    /// Start streaming. A no-op while connecting, streaming, or after `close()`.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Stop for good. Safe to call repeatedly; nothing is reported afterwards.
    pub fn close(&self) {
        self.inner.close(true);
    }

    pub fn state(&self) -> TailState {
        lock_or_recover(&self.inner.slot).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TailState::Streaming
    }

    pub fn is_initializing(&self) -> bool {
        lock_or_recover(&self.inner.slot).initializing
    }

    /// Reconnects scheduled so far.
    pub fn reconnects(&self) -> u64 {
        lock_or_recover(&self.inner.slot).reconnects
    }

    /// Live reconnect and guard timers.
    pub fn pending_timers(&self) -> usize {
        let slot = lock_or_recover(&self.inner.slot);
        let live = |timer: &Option<JoinHandle<()>>| {
            usize::from(timer.as_ref().is_some_and(|h| !h.is_finished()))
        };
        live(&slot.reconnect_timer) + live(&slot.guard_timer)
    }

    pub fn request(&self) -> &TailRequest {
        &self.inner.request
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        self.inner.close(false);
    }
}

impl Inner {
    fn connect(self: &Arc<Self>) {
        let generation = {
            let mut slot = lock_or_recover(&self.slot);
            if slot.manual_close
                || matches!(slot.state, TailState::Connecting | TailState::Streaming)
            {
                return;
            }
            if let Some(stale) = slot.stream_task.take() {
                stale.abort();
            }
            if let Some(timer) = slot.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(timer) = slot.guard_timer.take() {
                timer.abort();
            }
            slot.generation += 1;
            let generation = slot.generation;
            slot.state = TailState::Connecting;
            slot.initializing = false;
            if self.options.optimistic_open {
                slot.state = TailState::Streaming;
                self.arm_guard(&mut slot, generation);
            }
            let me = self.clone();
            slot.stream_task = Some(tokio::spawn(async move { me.run(generation).await }));
            generation
        };
        info!(query = %self.request.query, optimistic = self.options.optimistic_open, "tail: connecting");
        if self.options.optimistic_open && self.is_current(generation) {
            self.listener.on_open();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let slot = lock_or_recover(&self.slot);
        slot.generation == generation && !slot.manual_close
    }

    fn arm_guard(self: &Arc<Self>, slot: &mut Slot, generation: u64) {
        if let Some(timer) = slot.guard_timer.take() {
            timer.abort();
        }
        slot.initializing = true;
        let me = self.clone();
        let delay = self.options.initialization_delay;
        slot.guard_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut slot = lock_or_recover(&me.slot);
            if slot.generation == generation {
                slot.initializing = false;
                slot.guard_timer = None;
                debug!("tail: initialization guard released");
            }
        }));
    }

    /// Mark the stream accepted. False if this generation is stale.
    fn mark_open(self: &Arc<Self>, generation: u64) -> bool {
        let mut slot = lock_or_recover(&self.slot);
        if slot.generation != generation || slot.manual_close {
            return false;
        }
        slot.state = TailState::Streaming;
        self.arm_guard(&mut slot, generation);
        true
    }

    /// The guard flag for a live generation, `None` if stale.
    fn initializing_if_current(&self, generation: u64) -> Option<bool> {
        let slot = lock_or_recover(&self.slot);
        (slot.generation == generation && !slot.manual_close).then_some(slot.initializing)
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut stream = match self.transport.open(self.request.clone()).await {
            Ok(stream) => stream,
            Err(err) => return self.fail(generation, err),
        };
        if !self.options.optimistic_open {
            if !self.mark_open(generation) {
                return;
            }
            info!("tail: stream open");
            self.listener.on_open();
        }

        let mut lines = LineBuffer::default();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    let complete = lines.push(&chunk);
                    if !self.deliver(generation, complete) {
                        return;
                    }
                }
                Some(Err(err)) => return self.fail(generation, err),
                None => {
                    if !self.deliver(generation, lines.finish().into_iter().collect()) {
                        return;
                    }
                    debug!("tail: stream completed");
                    return self.end(generation, CloseKind::Completed);
                }
            }
        }
    }

    /// Decode and report one chunk's lines. False once the session is stale.
    fn deliver(&self, generation: u64, lines: Vec<String>) -> bool {
        let now_nanos = self.clock.now_ms().saturating_mul(1_000_000);
        let records: Vec<LogRecord> = lines
            .iter()
            .filter_map(|line| self.decoder.decode_line(line, now_nanos))
            .collect();
        let Some(initializing) = self.initializing_if_current(generation) else {
            return false;
        };
        if !records.is_empty() {
            self.listener.on_records(TailBatch {
                records,
                initializing,
            });
        }
        true
    }

    fn fail(self: &Arc<Self>, generation: u64, err: Error) {
        if !self.is_current(generation) {
            return;
        }
        warn!(error = %err, "tail: stream error");
        self.listener.on_error(&err);
        self.end(generation, CloseKind::Error);
    }

    /// Leave `Streaming`/`Connecting` and schedule the next attempt.
    fn end(self: &Arc<Self>, generation: u64, kind: CloseKind) {
        {
            let mut slot = lock_or_recover(&self.slot);
            if slot.generation != generation || slot.manual_close {
                return;
            }
            slot.state = TailState::Reconnecting;
            slot.initializing = false;
            // Called from inside the stream task; release without aborting ourselves.
            slot.stream_task = None;
            if let Some(timer) = slot.guard_timer.take() {
                timer.abort();
            }
            slot.reconnects += 1;
            let me = self.clone();
            let delay = self.options.reconnect_delay;
            slot.reconnect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                {
                    let mut slot = lock_or_recover(&me.slot);
                    if slot.generation != generation || slot.manual_close {
                        return;
                    }
                    slot.reconnect_timer = None;
                }
                info!("tail: reconnecting");
                me.connect();
            }));
        }
        info!(?kind, delay_ms = self.options.reconnect_delay.as_millis() as u64, "tail: closed, reconnect scheduled");
        if self.is_current(generation) {
            self.listener.on_close(kind);
        }
    }

    fn close(&self, notify: bool) {
        let previous = {
            let mut slot = lock_or_recover(&self.slot);
            let previous = slot.state;
            slot.manual_close = true;
            slot.generation += 1;
            slot.state = TailState::ManualClose;
            slot.initializing = false;
            for handle in [
                slot.stream_task.take(),
                slot.reconnect_timer.take(),
                slot.guard_timer.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.abort();
            }
            previous
        };
        if previous == TailState::ManualClose {
            return;
        }
        info!("tail: closed by owner");
        if notify && previous != TailState::Disconnected {
            self.listener.on_close(CloseKind::Manual);
        }
    }
}
