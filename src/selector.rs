//! Stream selector construction and `_stream` label parsing.
//!
//! A selector is a LogsQL stream filter such as
//! `{job="tasks", service="Batch-Sync", task_name="checkout"}`. Fixed labels
//! come first (equality), followed by any explicit label rules, followed by the
//! task label when a task is selected.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// A single label matcher inside a stream selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LabelRule {
    Eq { label: String, value: String },
    Ne { label: String, value: String },
    Regex { label: String, value: String },
    NotRegex { label: String, value: String },
}

impl LabelRule {
    pub fn render(&self) -> String {
        let (label, op, value) = match self {
            LabelRule::Eq { label, value } => (label, "=", value),
            LabelRule::Ne { label, value } => (label, "!=", value),
            LabelRule::Regex { label, value } => (label, "=~", value),
            LabelRule::NotRegex { label, value } => (label, "!~", value),
        };
        format!("{}{}\"{}\"", label, op, escape_value(value))
    }
}

/// Escape a label value for use inside double quotes.
pub fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Debug, Clone)]
pub struct SelectorBuilder {
    rules: Vec<LabelRule>,
    task_label: String,
}

impl SelectorBuilder {
    pub fn new(
        fixed_labels: &BTreeMap<String, String>,
        extra_rules: &[LabelRule],
        task_label: &str,
    ) -> Self {
        let mut rules: Vec<LabelRule> = fixed_labels
            .iter()
            .map(|(label, value)| LabelRule::Eq {
                label: label.clone(),
                value: value.clone(),
            })
            .collect();
        rules.extend(extra_rules.iter().cloned());
        SelectorBuilder {
            rules,
            task_label: task_label.to_string(),
        }
    }

    pub fn task_label(&self) -> &str {
        &self.task_label
    }

    /// Selector for the whole filtered stream (no task restriction).
    pub fn base(&self) -> String {
        self.for_task(None)
    }

    pub fn for_task(&self, task: Option<&str>) -> String {
        let mut parts: Vec<String> = self.rules.iter().map(LabelRule::render).collect();
        if let Some(task) = task.filter(|t| !t.is_empty()) {
            parts.push(
                LabelRule::Eq {
                    label: self.task_label.clone(),
                    value: task.to_string(),
                }
                .render(),
            );
        }
        format!("{{{}}}", parts.join(", "))
    }

    /// Fallback for stores where the task name only appears in the message.
    pub fn message_fallback(&self, task: &str) -> String {
        if task.is_empty() {
            return self.base();
        }
        format!("{} _msg:\"{}\"", self.base(), escape_value(task))
    }
}

fn stream_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([A-Za-z0-9_]+)="([^"]*)""#).expect("valid label regex"))
}

/// Parse the `_stream` field (`{a="1",b="2"}`) into a label map.
/// Anything that is not a braced label list yields an empty map.
pub fn parse_stream_labels(stream: &str) -> BTreeMap<String, String> {
    let s = stream.trim();
    let mut labels = BTreeMap::new();
    let Some(inner) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
        return labels;
    };
    for caps in stream_label_regex().captures_iter(inner) {
        labels.insert(caps[1].to_string(), caps[2].to_string());
    }
    labels
}
