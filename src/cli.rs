//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Each runner loads
//! the selected service, builds a [`LogPipeline`] over a file-backed state
//! store, and prints results to stdout. Diagnostics go through `tracing`.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use logwatch::config::{self, resolve_api_base, ServiceConfig};
use logwatch::page::PageRequest;
use logwatch::record::LogRecord;
use logwatch::store::FileStore;
use logwatch::threshold::ThresholdEvaluator;
use logwatch::LogPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::Cli;

// ── Setup ───────────────────────────────────────────────────────

fn load_service(cli: &Cli) -> Result<(ServiceConfig, Option<String>)> {
    let app = config::load(&cli.config)?;
    let mut service = app.service(cli.service.as_deref())?.clone();
    if let Some(api_base) = &cli.api_base {
        service.vmlog.api_base_path = api_base.clone();
    }
    Ok((service, app.origin))
}

fn build_pipeline(cli: &Cli) -> Result<LogPipeline> {
    let (service, origin) = load_service(cli)?;
    let store = FileStore::new(&cli.state_dir).with_context(|| {
        format!("failed to open state directory {}", cli.state_dir.display())
    })?;
    let mut builder = LogPipeline::builder(service).store(Arc::new(store));
    if let Some(origin) = origin {
        builder = builder.origin(origin);
    }
    Ok(builder.build()?)
}

fn format_record(record: &LogRecord) -> String {
    let ts = DateTime::<Utc>::from_timestamp_millis(record.timestamp_millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| record.timestamp_millis.to_string());
    format!(
        "{} {:<5} [{}] {}",
        ts,
        record.level,
        record.resolved_task().unwrap_or("-"),
        record.line
    )
}

fn describe_mute(pipeline: &LogPipeline) -> String {
    match pipeline.mute().remaining_mute_minutes() {
        None => "alerts muted until unmuted".to_string(),
        Some(0) => "alerts not muted".to_string(),
        Some(1) => "alerts muted for 1 more minute".to_string(),
        Some(n) => format!("alerts muted for {} more minutes", n),
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Commands ────────────────────────────────────────────────────

/// Stream records until Ctrl-C or `duration_secs`, announcing alert changes.
pub async fn run_tail(
    cli: &Cli,
    task: Option<&str>,
    level: Option<&str>,
    duration_secs: Option<u64>,
    print_metrics: bool,
) -> Result<()> {
    let pipeline = build_pipeline(cli)?;
    let evaluator = ThresholdEvaluator::from_config(&pipeline.config().log_levels);
    let threshold = level
        .map(str::to_string)
        .unwrap_or_else(|| pipeline.config().default_log_level.clone());

    let print = move |records: &[LogRecord]| {
        for record in evaluator.filter(records.to_vec(), &threshold) {
            println!("{}", format_record(&record));
        }
    };
    let subscription = match task {
        Some(task) => {
            pipeline.set_current_viewing_task(Some(task));
            pipeline.subscribe(task, print)
        }
        None => pipeline.subscribe_all(print),
    };

    info!(
        service = %pipeline.config().id,
        query = %pipeline.tail_request().query,
        "logwatch tail starting"
    );
    pipeline.connect();

    let deadline = duration_secs.map(|s| Instant::now() + Duration::from_secs(s));
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut announced: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep_until_deadline(deadline) => break,
            _ = ticker.tick() => {
                let reasons = pipeline.alert_reasons();
                if reasons != announced {
                    if !reasons.is_empty() {
                        warn!(reasons = ?reasons, "ALERT");
                    }
                    announced = reasons;
                }
            }
        }
    }

    subscription.unsubscribe();
    let stats = pipeline.stats();
    pipeline.dispose();
    info!(
        batches = stats.batches,
        records = stats.records,
        reconnects = stats.reconnects,
        unread = ?stats.unread,
        "logwatch tail stopped"
    );
    if print_metrics {
        print!("{}", pipeline.metrics().encode());
    }
    Ok(())
}

pub async fn run_query(
    cli: &Cli,
    task: Option<&str>,
    limit: Option<usize>,
    cursor: Option<String>,
    level: Option<&str>,
    json: bool,
) -> Result<()> {
    let pipeline = build_pipeline(cli)?;
    let request = PageRequest {
        limit: limit.unwrap_or(pipeline.config().logs_per_page),
        cursor,
    };
    let page = pipeline
        .query_page(task, request, level)
        .await
        .context("history query failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }
    for record in &page.records {
        println!("{}", format_record(record));
    }
    match &page.next_cursor {
        Some(cursor) => println!("-- more: --cursor {}", cursor),
        None => println!("-- end of results"),
    }
    Ok(())
}

pub async fn run_tasks(cli: &Cli) -> Result<()> {
    let pipeline = build_pipeline(cli)?;
    let names = pipeline
        .task_names()
        .await
        .context("failed to list task names")?;
    for name in names {
        let mark = if pipeline.is_watched(&name) { '*' } else { ' ' };
        println!("{} {}", mark, name);
    }
    Ok(())
}

pub fn run_mute(cli: &Cli, minutes: i64) -> Result<()> {
    let pipeline = build_pipeline(cli)?;
    pipeline.set_mute(minutes);
    println!("{}", describe_mute(&pipeline));
    Ok(())
}

pub fn run_mute_status(cli: &Cli) -> Result<()> {
    let pipeline = build_pipeline(cli)?;
    println!("{}", describe_mute(&pipeline));
    Ok(())
}

pub fn run_watch(cli: &Cli, task: &str) -> Result<()> {
    let pipeline = build_pipeline(cli)?;
    if pipeline.toggle_watched(task) {
        println!("watching {}", task);
    } else {
        println!("no longer watching {}", task);
    }
    Ok(())
}

/// Parse the config and report every service's warnings.
pub fn run_check_config(cli: &Cli) -> Result<()> {
    let app = config::load(&cli.config)?;
    if app.services.is_empty() {
        anyhow::bail!("{} defines no [[services]]", cli.config.display());
    }
    let active = app.service(cli.service.as_deref())?.id.clone();
    for service in &app.services {
        let mut warnings = service.validate();
        let api_base = cli
            .api_base
            .as_deref()
            .unwrap_or(&service.vmlog.api_base_path);
        if let Err(e) = resolve_api_base(api_base, app.origin.as_deref()) {
            warnings.push(format!("service '{}': {}", service.id, e));
        }
        let marker = if service.id == active { " (active)" } else { "" };
        if warnings.is_empty() {
            println!("{}{}: ok", service.id, marker);
        } else {
            println!("{}{}: {} warning(s)", service.id, marker, warnings.len());
            for warning in warnings {
                println!("  warning: {}", warning);
            }
        }
    }
    Ok(())
}
