//! # Page — Historical Log Queries
//!
//! Offset-paginated scrollback against `POST {api_base}/query`.
//!
//! ## Cursors
//!
//! A cursor is `"{offset}:{start_ms}:{end_ms}"`. The window is fixed by the
//! first page and carried forward, so paging never shifts while new records
//! arrive. A bare integer is accepted as an offset with a fresh window.
//!
//! ## In-Flight Dedup
//!
//! Identical requests (same selector, offset and limit) that overlap in time
//! share one underlying call. The call runs on its own task so it completes
//! even if the caller that started it goes away, and it removes its registry
//! entry when it settles, whatever the outcome.
//!
//! ## `has_more`
//!
//! `has_more` is `records.len() >= limit`. An exact-fit last page therefore
//! costs one extra, empty request.

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use url::Url;

use crate::backoff::{Backoff, RetryPolicy};
use crate::clock::Clock;
use crate::config::{endpoint, ServiceConfig};
use crate::error::{Error, Result};
use crate::lock_or_recover;
use crate::metrics::Metrics;
use crate::record::{LogRecord, RecordDecoder};
use crate::selector::SelectorBuilder;
use crate::threshold::ThresholdEvaluator;

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub records: Vec<LogRecord>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub offset: u64,
    /// `(start_ms, end_ms)` the first page was anchored to.
    pub window: Option<(i64, i64)>,
}

impl PageCursor {
    pub fn encode(&self) -> String {
        match self.window {
            Some((start, end)) => format!("{}:{}:{}", self.offset, start, end),
            None => self.offset.to_string(),
        }
    }

    /// Lenient: anything unreadable is offset 0 with no window.
    pub fn parse(token: &str) -> Self {
        let parts: Vec<&str> = token.trim().split(':').collect();
        let offset = parts
            .first()
            .and_then(|o| o.parse::<i64>().ok())
            .map(|o| o.max(0) as u64)
            .unwrap_or(0);
        let window = match parts.as_slice() {
            [_, start, end] => match (start.parse::<i64>(), end.parse::<i64>()) {
                (Ok(start), Ok(end)) if start <= end => Some((start, end)),
                _ => None,
            },
            _ => None,
        };
        PageCursor { offset, window }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InFlightKey {
    selector: String,
    offset: u64,
    limit: usize,
    window: (i64, i64),
}

type SharedPage = Shared<BoxFuture<'static, Result<Page>>>;

#[derive(Deserialize)]
struct FieldValues {
    #[serde(default)]
    values: Vec<FieldValue>,
}

#[derive(Deserialize)]
struct FieldValue {
    value: serde_json::Value,
}

struct FetcherInner {
    client: reqwest::Client,
    api_base: Url,
    decoder: RecordDecoder,
    selectors: SelectorBuilder,
    evaluator: ThresholdEvaluator,
    backoff: Backoff,
    range_days: u32,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    in_flight: Mutex<HashMap<InFlightKey, SharedPage>>,
}

#[derive(Clone)]
pub struct PageFetcher {
    inner: Arc<FetcherInner>,
}

fn rfc3339(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn send_text(call: reqwest::RequestBuilder) -> Result<String> {
    let resp = call.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(Error::from_response(status, body));
    }
    Ok(body)
}

impl PageFetcher {
    pub fn new(
        config: &ServiceConfig,
        api_base: Url,
        client: reqwest::Client,
        clock: Arc<dyn Clock>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let vmlog = &config.vmlog;
        PageFetcher {
            inner: Arc::new(FetcherInner {
                client,
                api_base,
                decoder: RecordDecoder::new(&vmlog.task_label, vmlog.fixed_labels.keys().cloned()),
                selectors: SelectorBuilder::new(
                    &vmlog.fixed_labels,
                    &vmlog.label_rules,
                    &vmlog.task_label,
                ),
                evaluator: ThresholdEvaluator::from_config(&config.log_levels),
                backoff: Backoff::new(
                    vmlog.api.max_retries,
                    config.retry_base_delay(),
                    RetryPolicy::Historical,
                ),
                range_days: config.query.range_days,
                clock,
                metrics,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn selectors(&self) -> &SelectorBuilder {
        &self.inner.selectors
    }

    /// Requests currently in flight (distinct underlying calls).
    pub fn in_flight(&self) -> usize {
        lock_or_recover(&self.inner.in_flight).len()
    }

    pub async fn query_page(&self, selector: &str, request: PageRequest) -> Result<Page> {
        let limit = request.limit.max(1);
        let cursor = request
            .cursor
            .as_deref()
            .map(PageCursor::parse)
            .unwrap_or_default();
        let window = cursor.window.unwrap_or_else(|| self.inner.window());
        let key = InFlightKey {
            selector: selector.to_string(),
            offset: cursor.offset,
            limit,
            window,
        };

        let call = {
            let mut in_flight = lock_or_recover(&self.inner.in_flight);
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(selector, offset = key.offset, "page: joining in-flight request");
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let task_key = key.clone();
                    let task = tokio::spawn(async move {
                        let result = inner
                            .fetch(
                                &task_key.selector,
                                task_key.offset,
                                limit,
                                task_key.window,
                            )
                            .await;
                        lock_or_recover(&inner.in_flight).remove(&task_key);
                        result
                    });
                    let inner = self.inner.clone();
                    let join_key = key.clone();
                    let shared = async move {
                        task.await.unwrap_or_else(|e| {
                            lock_or_recover(&inner.in_flight).remove(&join_key);
                            Err(Error::Transport(format!("page request aborted: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };
        call.await
    }

    /// Query one task's records, falling back to a message search on the
    /// first page when the label query finds nothing or fails. `level`
    /// applies the display filter.
    pub async fn query_task_page(
        &self,
        task: &str,
        request: PageRequest,
        level: Option<&str>,
    ) -> Result<Page> {
        let first_page = request.cursor.is_none();
        let selectors = &self.inner.selectors;
        let primary = self
            .query_page(&selectors.for_task(Some(task)), request.clone())
            .await;
        let mut page = match primary {
            Ok(page) if !(first_page && page.records.is_empty()) => page,
            Ok(_) => {
                debug!(task, "page: label query empty, trying message search");
                self.query_page(&selectors.message_fallback(task), request)
                    .await?
            }
            Err(err) if first_page => {
                warn!(task, error = %err, "page: label query failed, trying message search");
                self.query_page(&selectors.message_fallback(task), request)
                    .await?
            }
            Err(err) => return Err(err),
        };
        if let Some(level) = level {
            page.records = self.inner.evaluator.filter(page.records, level);
        }
        Ok(page)
    }

    /// Distinct values of a stream field within the configured window.
    pub async fn label_values(&self, field: &str) -> Result<Vec<String>> {
        let (start, end) = self.inner.window();
        let url = endpoint(&self.inner.api_base, "stream_field_values");
        let form = vec![
            ("query", self.inner.selectors.base()),
            ("field", field.to_string()),
            ("start", rfc3339(start)),
            ("end", rfc3339(end)),
        ];
        let body = self
            .inner
            .backoff
            .execute(|| send_text(self.inner.client.post(&url).form(&form)))
            .await?;
        let parsed: FieldValues =
            serde_json::from_str(&body).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(parsed
            .values
            .into_iter()
            .filter_map(|v| match v.value {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect())
    }

    /// Task names seen in the window, sorted and deduplicated.
    pub async fn task_names(&self) -> Result<Vec<String>> {
        let label = self.inner.selectors.task_label().to_string();
        let mut names = self.label_values(&label).await?;
        names.retain(|n| !n.is_empty());
        names.sort();
        names.dedup();
        Ok(names)
    }
}

impl FetcherInner {
    /// `[now - range_days, now]`; a zero range is an empty window at now.
    fn window(&self) -> (i64, i64) {
        let end = self.clock.now_ms();
        let start = end - i64::from(self.range_days) * DAY_MS;
        (start, end)
    }

    async fn fetch(
        &self,
        selector: &str,
        offset: u64,
        limit: usize,
        (start, end): (i64, i64),
    ) -> Result<Page> {
        if let Some(metrics) = &self.metrics {
            metrics.page_requests.inc();
        }
        let url = endpoint(&self.api_base, "query");
        let form = vec![
            ("query", selector.to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
            ("start", rfc3339(start)),
            ("end", rfc3339(end)),
        ];
        debug!(selector, offset, limit, "page: querying");
        let body = self
            .backoff
            .execute(|| send_text(self.client.post(&url).form(&form)))
            .await?;
        let now_nanos = self.clock.now_ms().saturating_mul(1_000_000);
        let records = self.decoder.decode_body(&body, now_nanos);
        let has_more = records.len() >= limit;
        let next_cursor = has_more.then(|| {
            PageCursor {
                offset: offset + records.len() as u64,
                window: Some((start, end)),
            }
            .encode()
        });
        Ok(Page {
            records,
            next_cursor,
            has_more,
        })
    }
}
