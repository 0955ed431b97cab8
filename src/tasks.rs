//! Per-task view state: watched tasks, unread alert counts, current view.
//!
//! The watched set is persisted per service as a JSON array. Unread counts
//! and the current view live only in memory.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::lock_or_recover;
use crate::store::{namespaced_key, StateStore, WATCHED_TASKS_PREFIX};

#[derive(Default)]
struct TaskState {
    watched: BTreeSet<String>,
    unread: HashMap<String, u64>,
    current: Option<String>,
}

pub struct TaskTracker {
    store: Arc<dyn StateStore>,
    key: String,
    state: Mutex<TaskState>,
}

impl TaskTracker {
    pub fn new(service: &str, store: Arc<dyn StateStore>) -> Self {
        let key = namespaced_key(WATCHED_TASKS_PREFIX, service);
        let watched = match store.get(&key) {
            Ok(Some(json)) => serde_json::from_str::<Vec<String>>(&json)
                .map(|tasks| tasks.into_iter().collect())
                .unwrap_or_else(|e| {
                    warn!(error = %e, "tasks: ignoring unreadable watched list");
                    BTreeSet::new()
                }),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(error = %e, "tasks: failed to restore watched list");
                BTreeSet::new()
            }
        };
        TaskTracker {
            store,
            key,
            state: Mutex::new(TaskState {
                watched,
                ..TaskState::default()
            }),
        }
    }

    pub fn is_watched(&self, task: &str) -> bool {
        lock_or_recover(&self.state).watched.contains(task)
    }

    pub fn watched(&self) -> Vec<String> {
        lock_or_recover(&self.state).watched.iter().cloned().collect()
    }

    /// Flip membership and persist. Returns whether the task is now watched.
    pub fn toggle_watched(&self, task: &str) -> bool {
        let mut state = lock_or_recover(&self.state);
        let now_watched = if state.watched.remove(task) {
            false
        } else {
            state.watched.insert(task.to_string());
            true
        };
        let list: Vec<&String> = state.watched.iter().collect();
        let result = serde_json::to_string(&list)
            .map_err(|e| crate::Error::Persistence(e.to_string()))
            .and_then(|json| self.store.set(&self.key, &json));
        if let Err(e) = result {
            warn!(task, error = %e, "tasks: failed to persist watched list");
        }
        now_watched
    }

    /// Count an alert-worthy record unless `task` is the current view.
    /// Returns whether the count moved.
    pub fn note_alert_worthy(&self, task: &str) -> bool {
        let mut state = lock_or_recover(&self.state);
        if state.current.as_deref() == Some(task) {
            return false;
        }
        *state.unread.entry(task.to_string()).or_insert(0) += 1;
        true
    }

    pub fn unread_count(&self, task: &str) -> u64 {
        lock_or_recover(&self.state)
            .unread
            .get(task)
            .copied()
            .unwrap_or(0)
    }

    pub fn unread_counts(&self) -> BTreeMap<String, u64> {
        lock_or_recover(&self.state)
            .unread
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(t, n)| (t.clone(), *n))
            .collect()
    }

    pub fn total_unread(&self) -> u64 {
        lock_or_recover(&self.state).unread.values().sum()
    }

    pub fn clear_unread(&self, task: &str) {
        lock_or_recover(&self.state).unread.remove(task);
    }

    /// Switch the current view; opening a task clears its unread count.
    pub fn set_current_viewing_task(&self, task: Option<&str>) {
        let mut state = lock_or_recover(&self.state);
        state.current = task.map(str::to_string);
        if let Some(task) = task {
            state.unread.remove(task);
        }
    }

    pub fn current_viewing_task(&self) -> Option<String> {
        lock_or_recover(&self.state).current.clone()
    }
}
