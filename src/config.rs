//! TOML service configuration, legacy key resolution, and defaults.
//!
//! A config file lists one or more services, mirroring the dashboard's
//! runtime config:
//!
//! ```toml
//! active_service = "batch-sync"
//!
//! [[services]]
//! id = "batch-sync"
//! default_log_level = "WARN"
//!
//! [services.vmlog]
//! api_base_path = "http://127.0.0.1:9428/select/logsql"
//! task_label = "task_name"
//! fixed_labels = { job = "tasks", service = "Batch-Sync" }
//!
//! [services.vmlog.tail]
//! reconnect_delay_ms = 3000
//! initialization_delay_ms = 2000
//!
//! [services.alert]
//! level = "ERROR"
//! dismiss_mute_minutes = 10
//! ```
//!
//! Older files used camelCase keys (`apiBasePath`, `websocket.reconnectDelay`,
//! `alertMuteMinutes`, …). Those are rewritten to their current names through
//! [`KEY_ALIASES`] before deserialization, so the typed structs below only
//! ever see current names.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use toml::{Table, Value};
use url::Url;

use crate::selector::LabelRule;

// ── Legacy Key Resolution ───────────────────────────────────────

/// Current dotted key → legacy dotted keys, in lookup order. Paths are
/// relative to one `[[services]]` entry.
pub const KEY_ALIASES: &[(&str, &[&str])] = &[
    ("display_name", &["displayName"]),
    ("default_log_level", &["defaultLogLevel"]),
    ("logs_per_page", &["logsPerPage"]),
    ("log_levels", &["logLevels"]),
    ("vmlog.api_base_path", &["vmlog.apiBasePath"]),
    ("vmlog.task_label", &["vmlog.taskLabel"]),
    ("vmlog.fixed_labels", &["vmlog.fixedLabels"]),
    ("vmlog.label_rules", &["vmlog.labelRules"]),
    (
        "vmlog.tail.reconnect_delay_ms",
        &["vmlog.websocket.reconnectDelay", "vmlog.websocket.reconnect_delay_ms"],
    ),
    (
        "vmlog.tail.initialization_delay_ms",
        &[
            "vmlog.websocket.initializationDelay",
            "vmlog.websocket.initialization_delay_ms",
        ],
    ),
    (
        "vmlog.tail.refresh_interval",
        &["vmlog.websocket.refreshInterval", "vmlog.websocket.refresh_interval"],
    ),
    ("vmlog.tail.delay_for", &["vmlog.api.tailDelayFor", "vmlog.api.tail_delay_for"]),
    ("vmlog.tail.optimistic_open", &["vmlog.websocket.optimisticOpen"]),
    ("vmlog.api.max_retries", &["vmlog.api.maxRetries"]),
    ("vmlog.api.retry_base_delay_ms", &["vmlog.api.retryBaseDelay"]),
    ("alert.dismiss_mute_minutes", &["alert.alertMuteMinutes"]),
    (
        "alert.fingerprint_mute_minutes",
        &["alertmanager.alertMuteMinutes", "alert.fingerprintMuteMinutes"],
    ),
    ("query.range_days", &["query.defaultTimeRangeDays"]),
];

const TOP_LEVEL_ALIASES: &[(&str, &[&str])] = &[("active_service", &["activeService"])];

fn lookup<'a>(table: &'a Table, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = table.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn insert_path(table: &mut Table, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else { return };
    let mut current = table;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        let Value::Table(next) = entry else { return };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Copy legacy keys onto their current names when the current name is unset.
pub fn resolve_aliases(table: &mut Table, aliases: &[(&str, &[&str])]) {
    for (current, legacy) in aliases {
        if lookup(table, current).is_some() {
            continue;
        }
        if let Some(value) = legacy.iter().find_map(|l| lookup(table, l)).cloned() {
            insert_path(table, current, value);
        }
    }
    // `log_levels = ["ERROR", …]` is shorthand for `log_levels.order`.
    if let Some(Value::Array(order)) = table.get("log_levels").cloned() {
        let mut levels = Table::new();
        levels.insert("order".to_string(), Value::Array(order));
        table.insert("log_levels".to_string(), Value::Table(levels));
    }
}

// ── Typed Configuration ─────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub active_service: Option<String>,
    /// Origin used to resolve relative `api_base_path`s.
    pub origin: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub vmlog: VmlogConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub log_levels: LogLevelsConfig,
    /// Display filter threshold; empty shows everything.
    #[serde(default)]
    pub default_log_level: String,
    #[serde(default = "default_logs_per_page")]
    pub logs_per_page: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmlogConfig {
    #[serde(default = "default_api_base_path")]
    pub api_base_path: String,
    #[serde(default = "default_task_label")]
    pub task_label: String,
    #[serde(default = "default_fixed_labels")]
    pub fixed_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub label_rules: Vec<LabelRule>,
    #[serde(default)]
    pub tail: TailConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_initialization_delay_ms")]
    pub initialization_delay_ms: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
    /// Seconds the store holds back new records before streaming them.
    #[serde(default = "default_delay_for", deserialize_with = "string_or_number")]
    pub delay_for: String,
    /// Report the stream open as soon as the request starts, for proxies
    /// that hold back response headers until the first line.
    #[serde(default)]
    pub optimistic_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_alert_level")]
    pub level: String,
    /// Mute applied on dismiss when no mute is active (minutes, -1 = permanent).
    pub dismiss_mute_minutes: Option<i64>,
    #[serde(default = "default_fingerprint_mute_minutes")]
    pub fingerprint_mute_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// History window in days. `0` is a valid (empty) window.
    #[serde(default = "default_range_days")]
    pub range_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLevelsConfig {
    #[serde(default = "default_level_order")]
    pub order: Vec<String>,
    /// Explicit threshold → allowed levels; wins over the cumulative ladder.
    pub mapping: Option<BTreeMap<String, Vec<String>>>,
}

fn default_logs_per_page() -> usize {
    500
}
fn default_api_base_path() -> String {
    "http://127.0.0.1:9428/select/logsql".to_string()
}
fn default_task_label() -> String {
    "task_name".to_string()
}
fn default_fixed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("job".to_string(), "tasks".to_string()),
        ("service".to_string(), "Batch-Sync".to_string()),
    ])
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_initialization_delay_ms() -> u64 {
    2000
}
fn default_refresh_interval() -> String {
    "1s".to_string()
}
fn default_delay_for() -> String {
    "0".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_alert_level() -> String {
    "ERROR".to_string()
}
fn default_fingerprint_mute_minutes() -> u64 {
    10
}
fn default_range_days() -> u32 {
    7
}
fn default_level_order() -> Vec<String> {
    crate::threshold::DEFAULT_LADDER
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        S(String),
        I(i64),
        F(f64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::S(s) => s,
        Raw::I(i) => i.to_string(),
        Raw::F(f) => f.to_string(),
    })
}

impl Default for VmlogConfig {
    fn default() -> Self {
        VmlogConfig {
            api_base_path: default_api_base_path(),
            task_label: default_task_label(),
            fixed_labels: default_fixed_labels(),
            label_rules: Vec::new(),
            tail: TailConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        TailConfig {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            initialization_delay_ms: default_initialization_delay_ms(),
            refresh_interval: default_refresh_interval(),
            delay_for: default_delay_for(),
            optimistic_open: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            level: default_alert_level(),
            dismiss_mute_minutes: None,
            fingerprint_mute_minutes: default_fingerprint_mute_minutes(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            range_days: default_range_days(),
        }
    }
}

impl Default for LogLevelsConfig {
    fn default() -> Self {
        LogLevelsConfig {
            order: default_level_order(),
            mapping: None,
        }
    }
}

impl ServiceConfig {
    /// A service with every default applied.
    pub fn with_id(id: &str) -> Self {
        ServiceConfig {
            id: id.to_string(),
            display_name: String::new(),
            vmlog: VmlogConfig::default(),
            alert: AlertConfig::default(),
            query: QueryConfig::default(),
            log_levels: LogLevelsConfig::default(),
            default_log_level: String::new(),
            logs_per_page: default_logs_per_page(),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.vmlog.tail.reconnect_delay_ms)
    }

    pub fn initialization_delay(&self) -> Duration {
        Duration::from_millis(self.vmlog.tail.initialization_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.vmlog.api.retry_base_delay_ms)
    }

    /// Warnings for settings that parse but will not behave as intended.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.log_levels.order.is_empty() {
            warnings.push(format!("service '{}': log_levels.order is empty", self.id));
        }
        let known = |level: &str| {
            let upper = level.to_uppercase();
            self.log_levels
                .mapping
                .as_ref()
                .map(|m| m.keys().any(|k| k.to_uppercase() == upper))
                .unwrap_or(false)
                || self.log_levels.order.iter().any(|l| l.to_uppercase() == upper)
        };
        if !known(&self.alert.level) {
            warnings.push(format!(
                "service '{}': alert level '{}' is not a configured level; no record will alert",
                self.id, self.alert.level
            ));
        }
        if !self.default_log_level.is_empty() && !known(&self.default_log_level) {
            warnings.push(format!(
                "service '{}': default_log_level '{}' is unknown; all records are shown",
                self.id, self.default_log_level
            ));
        }
        if self.vmlog.api.max_retries == 0 {
            warnings.push(format!(
                "service '{}': vmlog.api.max_retries = 0 still makes one attempt",
                self.id
            ));
        }
        warnings
    }
}

impl AppConfig {
    /// Select a service by id, else `active_service`, else the first entry.
    pub fn service(&self, id: Option<&str>) -> Result<&ServiceConfig> {
        let wanted = id.or(self.active_service.as_deref());
        match wanted {
            Some(id) => self
                .services
                .iter()
                .find(|s| s.id == id)
                .with_context(|| format!("service '{}' is not configured", id)),
            None => self
                .services
                .first()
                .context("config defines no [[services]]"),
        }
    }
}

/// Resolve `api_base_path` to an absolute URL. Relative paths need an origin.
pub fn resolve_api_base(path: &str, origin: Option<&str>) -> crate::Result<Url> {
    if let Ok(url) = Url::parse(path) {
        return Ok(url);
    }
    let origin = origin.ok_or_else(|| crate::Error::InvalidUrl(path.to_string()))?;
    Url::parse(origin)
        .and_then(|base| base.join(path))
        .map_err(|_| crate::Error::InvalidUrl(format!("{} (origin {})", path, origin)))
}

/// `{api_base}/{name}` without doubling slashes.
pub fn endpoint(api_base: &Url, name: &str) -> String {
    format!("{}/{}", api_base.as_str().trim_end_matches('/'), name)
}

/// Parse a TOML config string, resolving legacy keys first.
pub fn parse_toml(content: &str) -> Result<AppConfig> {
    let mut root: Table = toml::from_str(content).context("invalid TOML")?;
    resolve_aliases(&mut root, TOP_LEVEL_ALIASES);
    if let Some(Value::Array(services)) = root.get_mut("services") {
        for service in services.iter_mut() {
            if let Value::Table(table) = service {
                resolve_aliases(table, KEY_ALIASES);
            }
        }
    }
    let config: AppConfig = Value::Table(root)
        .try_into()
        .context("config does not match the expected schema")?;
    Ok(config)
}

/// Load and parse a config file.
pub fn load(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_toml(&content).with_context(|| format!("failed to parse config {}", path.display()))
}
