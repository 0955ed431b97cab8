//! # Record — Log Record Model and Decoding
//!
//! Normalizes rows from the log store into [`LogRecord`]s. Two response shapes
//! are understood:
//!
//! | Shape | Produced by | Example |
//! |-------|-------------|---------|
//! | Newline-delimited JSON rows | VictoriaLogs `/query` and `/tail` | `{"_time":"…","_msg":"…","_stream":"{…}"}` |
//! | Label-tagged streams | Loki-style `query_range` | `{"data":{"result":[{"stream":{…},"values":[["<ns>","line"]]}]}}` |
//!
//! Record ids come from a process-wide counter so they never collide, no
//! matter how many records share a timestamp.

use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::selector::parse_stream_labels;

/// Label key consulted when the configured task label is absent.
pub const FALLBACK_TASK_LABEL: &str = "task_name";

pub const DEFAULT_LEVEL: &str = "INFO";

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub timestamp_millis: i64,
    pub timestamp_nanos: i64,
    pub line: String,
    pub labels: BTreeMap<String, String>,
    pub task_name: Option<String>,
    pub service: Option<String>,
    pub level: String,
}

impl LogRecord {
    /// Task name used for distribution: the configured label, then `task_name`.
    pub fn resolved_task(&self) -> Option<&str> {
        self.task_name
            .as_deref()
            .or_else(|| self.labels.get(FALLBACK_TASK_LABEL).map(String::as_str))
            .filter(|t| !t.is_empty())
    }
}

fn next_record_id(timestamp_nanos: i64) -> String {
    let n = NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", timestamp_nanos, n)
}

fn level_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\]\s+(ERROR|WARN|INFO|DEBUG|TRACE)\s+").expect("valid level regex")
    })
}

/// Extract a level from lines shaped like `[2025-01-01 12:00:00] ERROR message`.
pub fn extract_level(line: &str) -> Option<&str> {
    level_regex()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Decodes store rows using the service's label configuration.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    task_label: String,
    fixed_label_keys: Vec<String>,
}

impl RecordDecoder {
    pub fn new(task_label: &str, fixed_label_keys: impl IntoIterator<Item = String>) -> Self {
        RecordDecoder {
            task_label: task_label.to_string(),
            fixed_label_keys: fixed_label_keys.into_iter().collect(),
        }
    }

    pub fn task_label(&self) -> &str {
        &self.task_label
    }

    /// Decode one JSON row. `now_nanos` stands in for a missing `_time`.
    pub fn decode_row(&self, row: &Value, now_nanos: i64) -> LogRecord {
        let mut labels = row
            .get("_stream")
            .and_then(Value::as_str)
            .map(parse_stream_labels)
            .unwrap_or_default();

        // Some labels appear both in _stream and as top-level fields.
        let promoted = self
            .fixed_label_keys
            .iter()
            .map(String::as_str)
            .chain([self.task_label.as_str(), "service", "level", "job"]);
        for key in promoted {
            if let Some(v) = row.get(key).and_then(value_to_string) {
                labels.insert(key.to_string(), v);
            }
        }

        let timestamp_nanos = row
            .get("_time")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or(now_nanos);

        let line = ["_msg", "msg", "message"]
            .iter()
            .find_map(|k| row.get(*k).and_then(value_to_string))
            .unwrap_or_default();

        self.build(labels, timestamp_nanos, line)
    }

    fn build(
        &self,
        labels: BTreeMap<String, String>,
        timestamp_nanos: i64,
        line: String,
    ) -> LogRecord {
        let level = labels
            .get("level")
            .map(String::as_str)
            .filter(|l| !l.is_empty())
            .or_else(|| extract_level(&line))
            .unwrap_or(DEFAULT_LEVEL)
            .to_uppercase();
        LogRecord {
            id: next_record_id(timestamp_nanos),
            timestamp_millis: timestamp_nanos.div_euclid(1_000_000),
            timestamp_nanos,
            task_name: labels.get(&self.task_label).cloned(),
            service: labels.get("service").cloned(),
            level,
            line,
            labels,
        }
    }

    /// Decode a single newline-delimited JSON line; malformed lines yield `None`.
    pub fn decode_line(&self, line: &str, now_nanos: i64) -> Option<LogRecord> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(row @ Value::Object(_)) => Some(self.decode_row(&row, now_nanos)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "record: skipping malformed line");
                None
            }
        }
    }

    /// Decode a full response body in either supported shape.
    pub fn decode_body(&self, body: &str, now_nanos: i64) -> Vec<LogRecord> {
        let trimmed = body.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                if let Some(streams) = streams_of(&value) {
                    return self.decode_streams(streams);
                }
            }
        }
        body.lines()
            .filter_map(|l| self.decode_line(l, now_nanos))
            .collect()
    }

    /// Records from label-tagged streams, newest first.
    fn decode_streams(&self, streams: &[Value]) -> Vec<LogRecord> {
        let mut records = Vec::new();
        for stream in streams {
            let labels: BTreeMap<String, String> = stream
                .get("stream")
                .and_then(Value::as_object)
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| value_to_string(v).map(|v| (k.clone(), v)))
                        .collect()
                })
                .unwrap_or_default();
            let values = stream.get("values").and_then(Value::as_array);
            for entry in values.into_iter().flatten() {
                let Some(pair) = entry.as_array() else { continue };
                let ts = pair
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<i64>().ok());
                let Some(ts) = ts else { continue };
                let line = pair.get(1).and_then(value_to_string).unwrap_or_default();
                records.push(self.build(labels.clone(), ts, line));
            }
        }
        records.sort_by(|a, b| b.timestamp_nanos.cmp(&a.timestamp_nanos));
        records
    }
}

fn streams_of(value: &Value) -> Option<&[Value]> {
    value
        .pointer("/data/result")
        .or_else(|| value.get("streams"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn decoder() -> RecordDecoder {
        RecordDecoder::new("task_name", ["job".to_string(), "service".to_string()])
    }

    #[test]
    fn decodes_victorialogs_row() {
        let row = json!({
            "_time": "2025-01-01T12:00:00.123456789Z",
            "_msg": "[2025-01-01 12:00:00] ERROR sync failed ",
            "_stream": "{job=\"tasks\",service=\"Batch-Sync\",task_name=\"checkout\"}",
        });
        let rec = decoder().decode_row(&row, 0);
        assert_eq!(rec.task_name.as_deref(), Some("checkout"));
        assert_eq!(rec.service.as_deref(), Some("Batch-Sync"));
        assert_eq!(rec.level, "ERROR");
        assert_eq!(rec.timestamp_nanos, 1_735_732_800_123_456_789);
        assert_eq!(rec.timestamp_millis, 1_735_732_800_123);
        assert!(rec.id.starts_with("1735732800123456789-"));
    }

    #[test]
    fn top_level_fields_override_stream_labels() {
        let row = json!({
            "_msg": "hello",
            "_stream": "{task_name=\"old\"}",
            "task_name": "new",
            "level": "warn",
        });
        let rec = decoder().decode_row(&row, 42);
        assert_eq!(rec.task_name.as_deref(), Some("new"));
        assert_eq!(rec.level, "WARN");
        assert_eq!(rec.timestamp_nanos, 42);
    }

    #[test]
    fn level_defaults_to_info() {
        let rec = decoder().decode_row(&json!({"_msg": "no level here"}), 0);
        assert_eq!(rec.level, "INFO");
        let rec = decoder().decode_row(&json!({"message": "[x] DEBUG detail "}), 0);
        assert_eq!(rec.level, "DEBUG");
        assert_eq!(rec.line, "[x] DEBUG detail ");
    }

    #[test]
    fn custom_task_label_with_fallback() {
        let dec = RecordDecoder::new("job_name", Vec::new());
        let rec = dec.decode_row(&json!({"_msg": "x", "_stream": "{task_name=\"t\"}"}), 0);
        assert_eq!(rec.task_name, None);
        assert_eq!(rec.resolved_task(), Some("t"));
    }

    #[test]
    fn ids_never_collide() {
        let dec = decoder();
        let row = json!({"_time": "2025-01-01T00:00:00Z", "_msg": "same"});
        let ids: HashSet<String> = (0..500).map(|_| dec.decode_row(&row, 0).id).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn ndjson_body_skips_blank_and_malformed_lines() {
        let body = "{\"_msg\":\"a\"}\n\n not json\n[1,2]\n{\"_msg\":\"b\"}\n";
        let recs = decoder().decode_body(body, 0);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].line, "a");
        assert_eq!(recs[1].line, "b");
    }

    #[test]
    fn loki_streams_sorted_newest_first() {
        let body = json!({
            "data": {"result": [
                {"stream": {"task_name": "a", "level": "error"},
                 "values": [["100", "first"], ["300", "third"]]},
                {"stream": {"task_name": "b"},
                 "values": [["200", "[t] WARN second "]]}
            ]}
        })
        .to_string();
        let recs = decoder().decode_body(&body, 0);
        let lines: Vec<&str> = recs.iter().map(|r| r.line.as_str()).collect();
        assert_eq!(lines, vec!["third", "[t] WARN second ", "first"]);
        assert_eq!(recs[0].level, "ERROR");
        assert_eq!(recs[1].level, "WARN");
    }

    #[test]
    fn extract_level_requires_bracket_prefix() {
        assert_eq!(extract_level("] ERROR boom "), Some("ERROR"));
        assert_eq!(extract_level("ERROR boom"), None);
        assert_eq!(extract_level("] error boom "), None);
    }
}
