//! Severity threshold evaluation.
//!
//! Levels form a ladder in descending severity. With the default ladder a
//! threshold of `WARN` allows `{ERROR, WARN}`. An explicit mapping from
//! threshold to allowed levels takes precedence and need not be cumulative.

use std::collections::{BTreeMap, HashSet};

use crate::config::LogLevelsConfig;
use crate::record::{LogRecord, DEFAULT_LEVEL};

pub const DEFAULT_LADDER: &[&str] = &["ERROR", "WARN", "INFO", "DEBUG"];

#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    ladder: Vec<String>,
    mapping: Option<BTreeMap<String, HashSet<String>>>,
}

impl Default for ThresholdEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_LADDER.iter().map(|s| s.to_string()).collect(), None)
    }
}

impl ThresholdEvaluator {
    pub fn new(ladder: Vec<String>, mapping: Option<BTreeMap<String, Vec<String>>>) -> Self {
        ThresholdEvaluator {
            ladder: ladder.into_iter().map(|l| l.to_uppercase()).collect(),
            mapping: mapping.map(|m| {
                m.into_iter()
                    .map(|(k, v)| {
                        (
                            k.to_uppercase(),
                            v.into_iter().map(|l| l.to_uppercase()).collect(),
                        )
                    })
                    .collect()
            }),
        }
    }

    pub fn from_config(levels: &LogLevelsConfig) -> Self {
        Self::new(levels.order.clone(), levels.mapping.clone())
    }

    pub fn ladder(&self) -> &[String] {
        &self.ladder
    }

    /// Levels allowed by `threshold`, or `None` if the threshold is unknown.
    pub fn allowed(&self, threshold: &str) -> Option<HashSet<String>> {
        let threshold = threshold.to_uppercase();
        if let Some(mapping) = &self.mapping {
            if let Some(allowed) = mapping.get(&threshold) {
                return Some(allowed.clone());
            }
        }
        let idx = self.ladder.iter().position(|l| *l == threshold)?;
        Some(self.ladder[..=idx].iter().cloned().collect())
    }

    pub fn is_alert_worthy(&self, level: Option<&str>, threshold: &str) -> bool {
        let level = level
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LEVEL)
            .to_uppercase();
        self.allowed(threshold)
            .map(|allowed| allowed.contains(&level))
            .unwrap_or(false)
    }

    /// Display filter: an empty or unknown threshold passes everything.
    pub fn filter(&self, records: Vec<LogRecord>, threshold: &str) -> Vec<LogRecord> {
        if threshold.is_empty() {
            return records;
        }
        let Some(allowed) = self.allowed(threshold) else {
            return records;
        };
        records
            .into_iter()
            .filter(|r| allowed.contains(&r.level.to_uppercase()))
            .collect()
    }
}
