//! # Hub — Per-Task Fan-Out of Tail Batches
//!
//! Consumers subscribe either to one task or to everything. Each tail batch is
//! grouped by task name and every task's callbacks run once with that task's
//! records, in batch order. Global callbacks receive the whole batch.
//!
//! ## Cost
//!
//! | Situation | Work done |
//! |-----------|-----------|
//! | No subscribers at all | nothing is built |
//! | Record's task has no subscribers | the record is not copied |
//! | Record has no task name | global callbacks only |
//!
//! Callbacks are invoked on a snapshot taken under the lock and run with the
//! lock released, so a callback may subscribe or unsubscribe re-entrantly.
//! A panicking callback is logged and skipped.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

use crate::lock_or_recover;
use crate::record::LogRecord;

pub type RecordCallback = Arc<dyn Fn(&[LogRecord]) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_task: HashMap<String, Vec<(u64, RecordCallback)>>,
    global: Vec<(u64, RecordCallback)>,
}

#[derive(Clone, Default)]
pub struct DistributionHub {
    registry: Arc<Mutex<Registry>>,
}

/// Handle returned by `subscribe`; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
    task: Option<String>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    fn remove(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut reg = lock_or_recover(&registry);
        match self.task.as_deref() {
            Some(task) => {
                if let Some(callbacks) = reg.by_task.get_mut(task) {
                    callbacks.retain(|(id, _)| *id != self.id);
                    if callbacks.is_empty() {
                        reg.by_task.remove(task);
                    }
                }
            }
            None => reg.global.retain(|(id, _)| *id != self.id),
        }
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl DistributionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, task: &str, callback: F) -> Subscription
    where
        F: Fn(&[LogRecord]) + Send + Sync + 'static,
    {
        let mut reg = lock_or_recover(&self.registry);
        reg.next_id += 1;
        let id = reg.next_id;
        reg.by_task
            .entry(task.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
            task: Some(task.to_string()),
        }
    }

    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[LogRecord]) + Send + Sync + 'static,
    {
        let mut reg = lock_or_recover(&self.registry);
        reg.next_id += 1;
        let id = reg.next_id;
        reg.global.push((id, Arc::new(callback)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
            task: None,
        }
    }

    pub fn subscriber_count(&self, task: &str) -> usize {
        lock_or_recover(&self.registry)
            .by_task
            .get(task)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn global_count(&self) -> usize {
        lock_or_recover(&self.registry).global.len()
    }

    /// Tasks with at least one subscriber.
    pub fn subscribed_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = lock_or_recover(&self.registry)
            .by_task
            .keys()
            .cloned()
            .collect();
        tasks.sort();
        tasks
    }

    /// Distribute one batch. Returns the number of callback invocations.
    pub fn on_batch(&self, records: &[LogRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }

        let (groups, globals) = {
            let reg = lock_or_recover(&self.registry);
            if reg.by_task.is_empty() && reg.global.is_empty() {
                return 0;
            }
            let mut order: Vec<&str> = Vec::new();
            let mut grouped: HashMap<&str, Vec<LogRecord>> = HashMap::new();
            if !reg.by_task.is_empty() {
                for record in records {
                    let Some(task) = record.resolved_task() else {
                        continue;
                    };
                    if !reg.by_task.contains_key(task) {
                        continue;
                    }
                    grouped
                        .entry(task)
                        .or_insert_with(|| {
                            order.push(task);
                            Vec::new()
                        })
                        .push(record.clone());
                }
            }
            let groups: Vec<(Vec<RecordCallback>, Vec<LogRecord>)> = order
                .into_iter()
                .filter_map(|task| {
                    let batch = grouped.remove(task)?;
                    let callbacks = reg
                        .by_task
                        .get(task)?
                        .iter()
                        .map(|(_, cb)| cb.clone())
                        .collect();
                    Some((callbacks, batch))
                })
                .collect();
            let globals: Vec<RecordCallback> = reg.global.iter().map(|(_, cb)| cb.clone()).collect();
            (groups, globals)
        };

        let mut calls = 0;
        for (callbacks, batch) in &groups {
            for callback in callbacks {
                invoke(callback, batch);
                calls += 1;
            }
        }
        for callback in &globals {
            invoke(callback, records);
            calls += 1;
        }
        calls
    }
}

fn invoke(callback: &RecordCallback, records: &[LogRecord]) {
    if catch_unwind(AssertUnwindSafe(|| callback(records))).is_err() {
        error!(records = records.len(), "hub: subscriber callback panicked");
    }
}
