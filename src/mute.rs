//! # Mute — Alert Overlay State and Mute Windows
//!
//! Decides whether an alert-worthy condition becomes a visible alert.
//!
//! ## `mute_until`
//!
//! | Value | Meaning |
//! |-------|---------|
//! | `0` | not muted |
//! | `-1` | muted until explicitly unmuted |
//! | `> 0` | muted until this epoch-millisecond instant |
//!
//! The value is persisted per service. A timed mute also runs a 30-second
//! backstop task that clears it once expired, so a stale mute cannot linger
//! if nobody asks.
//!
//! ## Fingerprints
//!
//! Sources that raise alerts may attach a fingerprint. Dismissing the overlay
//! mutes every pending fingerprint for `fingerprint_mute_minutes`; the map is
//! persisted and expired entries are pruned whenever it is read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AlertConfig;
use crate::lock_or_recover;
use crate::store::{namespaced_key, StateStore, FINGERPRINT_MUTES_PREFIX, MUTE_UNTIL_PREFIX};

pub const PERMANENT_MUTE: i64 = -1;
pub const BACKSTOP_INTERVAL: Duration = Duration::from_secs(30);
/// Longest timed mute (100 years). Longer requests are clamped to it.
pub const MAX_MUTE_MINUTES: i64 = 100 * 365 * 24 * 60;
const MINUTE_MS: i64 = 60_000;

fn mute_deadline(now_ms: i64, minutes: i64) -> i64 {
    now_ms.saturating_add(minutes.min(MAX_MUTE_MINUTES) * MINUTE_MS)
}

struct MuteInner {
    mute_until: i64,
    reasons: Vec<String>,
    visible: bool,
    pending_fingerprints: Vec<String>,
    fingerprint_mutes: HashMap<String, i64>,
    backstop: Option<JoinHandle<()>>,
}

struct MuteShared {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    mute_key: String,
    fingerprint_key: String,
    dismiss_mute_minutes: Option<i64>,
    fingerprint_mute_minutes: u64,
    inner: Mutex<MuteInner>,
}

pub struct AlertMuteState {
    shared: Arc<MuteShared>,
}

impl AlertMuteState {
    /// Restore persisted state for `service`. A stored mute survives only if
    /// permanent or still in the future.
    pub fn new(
        service: &str,
        alert: &AlertConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mute_key = namespaced_key(MUTE_UNTIL_PREFIX, service);
        let fingerprint_key = namespaced_key(FINGERPRINT_MUTES_PREFIX, service);
        let now = clock.now_ms();

        let stored = match store.get(&mute_key) {
            Ok(value) => value.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(0),
            Err(e) => {
                warn!(error = %e, "mute: failed to restore mute state");
                0
            }
        };
        let mute_until = if stored == PERMANENT_MUTE || stored > now {
            stored
        } else {
            if stored != 0 {
                if let Err(e) = store.remove(&mute_key) {
                    warn!(error = %e, "mute: failed to clear expired mute");
                }
            }
            0
        };

        let fingerprint_mutes: HashMap<String, i64> = match store.get(&fingerprint_key) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(error = %e, "mute: ignoring unreadable fingerprint mutes");
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "mute: failed to restore fingerprint mutes");
                HashMap::new()
            }
        };

        let state = AlertMuteState {
            shared: Arc::new(MuteShared {
                store,
                clock,
                mute_key,
                fingerprint_key,
                dismiss_mute_minutes: alert.dismiss_mute_minutes,
                fingerprint_mute_minutes: alert.fingerprint_mute_minutes,
                inner: Mutex::new(MuteInner {
                    mute_until,
                    reasons: Vec::new(),
                    visible: false,
                    pending_fingerprints: Vec::new(),
                    fingerprint_mutes,
                    backstop: None,
                }),
            }),
        };
        if mute_until > 0 {
            let shared = &state.shared;
            start_backstop(shared, &mut lock_or_recover(&shared.inner));
        }
        state
    }

    pub fn mute_until(&self) -> i64 {
        lock_or_recover(&self.shared.inner).mute_until
    }

    pub fn is_muted(&self) -> bool {
        let inner = lock_or_recover(&self.shared.inner);
        self.shared.muted(&inner)
    }

    /// `0` unmutes, a negative value mutes permanently, `n > 0` mutes for n
    /// minutes (at most `MAX_MUTE_MINUTES`).
    pub fn set_mute(&self, minutes: i64) {
        let mut inner = lock_or_recover(&self.shared.inner);
        apply_mute(&self.shared, &mut inner, minutes);
    }

    /// Raise `reason` unless muted. Returns whether it was newly added.
    pub fn trigger_alert(&self, reason: &str) -> bool {
        let mut inner = lock_or_recover(&self.shared.inner);
        if self.shared.muted(&inner) {
            debug!(reason, "mute: alert suppressed");
            return false;
        }
        inner.visible = true;
        if inner.reasons.iter().any(|r| r == reason) {
            return false;
        }
        info!(reason, "mute: alert raised");
        inner.reasons.push(reason.to_string());
        true
    }

    /// Retract one reason; the overlay hides once none remain.
    pub fn remove_alert_reason(&self, reason: &str) {
        let mut inner = lock_or_recover(&self.shared.inner);
        inner.reasons.retain(|r| r != reason);
        if inner.reasons.is_empty() {
            inner.visible = false;
        }
    }

    pub fn dismiss_alert(&self) {
        let mut inner = lock_or_recover(&self.shared.inner);
        inner.reasons.clear();
        inner.visible = false;

        if !inner.pending_fingerprints.is_empty() {
            let minutes =
                i64::try_from(self.shared.fingerprint_mute_minutes).unwrap_or(MAX_MUTE_MINUTES);
            let until = mute_deadline(self.shared.clock.now_ms(), minutes);
            let pending = std::mem::take(&mut inner.pending_fingerprints);
            for fingerprint in pending {
                inner.fingerprint_mutes.insert(fingerprint, until);
            }
            self.shared.persist_fingerprints(&inner);
        }

        if inner.mute_until == PERMANENT_MUTE || self.shared.muted(&inner) {
            return;
        }
        if let Some(minutes) = self.shared.dismiss_mute_minutes.filter(|m| *m != 0) {
            apply_mute(&self.shared, &mut inner, minutes);
        }
    }

    pub fn alert_reasons(&self) -> Vec<String> {
        lock_or_recover(&self.shared.inner).reasons.clone()
    }

    pub fn is_alert_visible(&self) -> bool {
        lock_or_recover(&self.shared.inner).visible
    }

    /// Queue a source fingerprint for muting on the next dismiss. Returns
    /// false if the fingerprint is currently muted.
    pub fn add_alert_fingerprint(&self, fingerprint: &str) -> bool {
        let mut inner = lock_or_recover(&self.shared.inner);
        if self.shared.fingerprint_muted(&mut inner, fingerprint) {
            return false;
        }
        if !inner.pending_fingerprints.iter().any(|f| f == fingerprint) {
            inner.pending_fingerprints.push(fingerprint.to_string());
        }
        true
    }

    pub fn is_fingerprint_muted(&self, fingerprint: &str) -> bool {
        let mut inner = lock_or_recover(&self.shared.inner);
        self.shared.fingerprint_muted(&mut inner, fingerprint)
    }

    /// Whole minutes left, rounded up. `None` for a permanent mute.
    pub fn remaining_mute_minutes(&self) -> Option<i64> {
        let inner = lock_or_recover(&self.shared.inner);
        match inner.mute_until {
            PERMANENT_MUTE => None,
            until if until > 0 => {
                let left = until - self.shared.clock.now_ms();
                Some(if left > 0 { left.saturating_add(MINUTE_MS - 1) / MINUTE_MS } else { 0 })
            }
            _ => Some(0),
        }
    }

    /// Clear an expired timed mute. Returns true if one was cleared.
    pub fn check_mute_expiration(&self) -> bool {
        let mut inner = lock_or_recover(&self.shared.inner);
        let cleared = self.shared.expire(&mut inner);
        if cleared {
            if let Some(backstop) = inner.backstop.take() {
                backstop.abort();
            }
        }
        cleared
    }

    /// Whether the expiry backstop task is running.
    pub fn backstop_running(&self) -> bool {
        lock_or_recover(&self.shared.inner)
            .backstop
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop background work. State stays readable.
    pub fn dispose(&self) {
        if let Some(backstop) = lock_or_recover(&self.shared.inner).backstop.take() {
            backstop.abort();
        }
    }
}

impl Drop for AlertMuteState {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl MuteShared {
    fn muted(&self, inner: &MuteInner) -> bool {
        match inner.mute_until {
            PERMANENT_MUTE => true,
            until if until > 0 => self.clock.now_ms() < until,
            _ => false,
        }
    }

    fn expire(&self, inner: &mut MuteInner) -> bool {
        if inner.mute_until > 0 && self.clock.now_ms() >= inner.mute_until {
            info!("mute: timed mute expired");
            inner.mute_until = 0;
            self.persist_mute(inner);
            return true;
        }
        false
    }

    fn fingerprint_muted(&self, inner: &mut MuteInner, fingerprint: &str) -> bool {
        let now = self.clock.now_ms();
        let before = inner.fingerprint_mutes.len();
        inner.fingerprint_mutes.retain(|_, until| *until > now);
        if inner.fingerprint_mutes.len() != before {
            self.persist_fingerprints(inner);
        }
        inner.fingerprint_mutes.contains_key(fingerprint)
    }

    fn persist_mute(&self, inner: &MuteInner) {
        let result = if inner.mute_until == 0 {
            self.store.remove(&self.mute_key)
        } else {
            self.store.set(&self.mute_key, &inner.mute_until.to_string())
        };
        if let Err(e) = result {
            warn!(error = %e, "mute: failed to persist mute state");
        }
    }

    fn persist_fingerprints(&self, inner: &MuteInner) {
        let result = if inner.fingerprint_mutes.is_empty() {
            self.store.remove(&self.fingerprint_key)
        } else {
            serde_json::to_string(&inner.fingerprint_mutes)
                .map_err(|e| crate::Error::Persistence(e.to_string()))
                .and_then(|json| self.store.set(&self.fingerprint_key, &json))
        };
        if let Err(e) = result {
            warn!(error = %e, "mute: failed to persist fingerprint mutes");
        }
    }
}

fn apply_mute(shared: &Arc<MuteShared>, inner: &mut MuteInner, minutes: i64) {
    inner.mute_until = match minutes {
        0 => 0,
        m if m < 0 => PERMANENT_MUTE,
        m => mute_deadline(shared.clock.now_ms(), m),
    };
    info!(minutes, mute_until = inner.mute_until, "mute: updated");
    shared.persist_mute(inner);
    if let Some(backstop) = inner.backstop.take() {
        backstop.abort();
    }
    if inner.mute_until > 0 {
        start_backstop(shared, inner);
    }
}

/// Periodic expiry check. Skipped outside a tokio runtime.
fn start_backstop(shared: &Arc<MuteShared>, inner: &mut MuteInner) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("mute: no runtime, expiry backstop not started");
        return;
    };
    let weak: Weak<MuteShared> = Arc::downgrade(shared);
    inner.backstop = Some(handle.spawn(async move {
        loop {
            tokio::time::sleep(BACKSTOP_INTERVAL).await;
            let Some(shared) = weak.upgrade() else { return };
            let mut inner = lock_or_recover(&shared.inner);
            shared.expire(&mut inner);
            if inner.mute_until <= 0 {
                inner.backstop = None;
                return;
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const T0: i64 = 1_700_000_000_000;

    fn setup(alert: AlertConfig) -> (AlertMuteState, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let state = AlertMuteState::new("svc", &alert, store.clone(), clock.clone());
        (state, store, clock)
    }

    #[test]
    fn timed_mute_round_trip() {
        let (state, store, clock) = setup(AlertConfig::default());
        state.set_mute(10);
        assert!(state.is_muted());
        assert_eq!(state.mute_until(), T0 + 600_000);
        assert_eq!(
            store.get("dashboard-mute-until-svc").unwrap().as_deref(),
            Some("1700000600000")
        );
        assert_eq!(state.remaining_mute_minutes(), Some(10));
        clock.advance(Duration::from_secs(11 * 60));
        assert!(!state.is_muted());
        assert!(state.check_mute_expiration());
        assert_eq!(state.mute_until(), 0);
        assert_eq!(store.get("dashboard-mute-until-svc").unwrap(), None);
        assert!(!state.check_mute_expiration());
    }

    #[test]
    fn remaining_minutes_round_up() {
        let (state, _, clock) = setup(AlertConfig::default());
        assert_eq!(state.remaining_mute_minutes(), Some(0));
        state.set_mute(2);
        clock.advance(Duration::from_secs(61));
        assert_eq!(state.remaining_mute_minutes(), Some(1));
        clock.advance(Duration::from_secs(58));
        assert_eq!(state.remaining_mute_minutes(), Some(1));
        state.set_mute(-1);
        assert_eq!(state.remaining_mute_minutes(), None);
    }

    #[test]
    fn permanent_mute_survives_dismiss() {
        let alert = AlertConfig {
            dismiss_mute_minutes: Some(10),
            ..AlertConfig::default()
        };
        let (state, _, clock) = setup(alert);
        state.set_mute(-1);
        state.dismiss_alert();
        assert_eq!(state.mute_until(), PERMANENT_MUTE);
        clock.advance(Duration::from_secs(86_400));
        assert!(state.is_muted());
        assert!(!state.check_mute_expiration());
    }

    #[test]
    fn triggers_are_deduplicated_and_gated() {
        let (state, _, _) = setup(AlertConfig::default());
        assert!(state.trigger_alert("error"));
        assert!(!state.trigger_alert("error"));
        assert!(state.trigger_alert("disconnect"));
        assert_eq!(state.alert_reasons(), vec!["error", "disconnect"]);
        assert!(state.is_alert_visible());

        state.remove_alert_reason("error");
        assert!(state.is_alert_visible());
        state.remove_alert_reason("disconnect");
        assert!(!state.is_alert_visible());

        state.set_mute(5);
        assert!(!state.trigger_alert("error"));
        assert!(state.alert_reasons().is_empty());
    }

    #[test]
    fn dismiss_applies_default_mute_only_when_unmuted() {
        let alert = AlertConfig {
            dismiss_mute_minutes: Some(10),
            ..AlertConfig::default()
        };
        let (state, _, _) = setup(alert);
        state.trigger_alert("error");
        state.dismiss_alert();
        assert!(!state.is_alert_visible());
        assert!(state.alert_reasons().is_empty());
        assert_eq!(state.mute_until(), T0 + 600_000);

        state.set_mute(1);
        state.dismiss_alert();
        assert_eq!(state.mute_until(), T0 + 60_000);
    }

    #[test]
    fn dismiss_without_default_leaves_unmuted() {
        let (state, _, _) = setup(AlertConfig::default());
        state.trigger_alert("error");
        state.dismiss_alert();
        assert_eq!(state.mute_until(), 0);
    }

    #[test]
    fn restore_keeps_future_and_permanent_only() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let alert = AlertConfig::default();

        store.set("dashboard-mute-until-svc", "-1").unwrap();
        let s = AlertMuteState::new("svc", &alert, store.clone(), clock.clone());
        assert_eq!(s.mute_until(), PERMANENT_MUTE);

        store
            .set("dashboard-mute-until-svc", &(T0 + 5_000).to_string())
            .unwrap();
        let s = AlertMuteState::new("svc", &alert, store.clone(), clock.clone());
        assert_eq!(s.mute_until(), T0 + 5_000);

        store
            .set("dashboard-mute-until-svc", &(T0 - 5_000).to_string())
            .unwrap();
        let s = AlertMuteState::new("svc", &alert, store.clone(), clock.clone());
        assert_eq!(s.mute_until(), 0);
        assert_eq!(store.get("dashboard-mute-until-svc").unwrap(), None);

        // Other services are independent.
        let other = AlertMuteState::new("other", &alert, store, clock);
        assert_eq!(other.mute_until(), 0);
    }

    #[test]
    fn persistence_failure_keeps_memory_semantics() {
        let (state, store, _) = setup(AlertConfig::default());
        store.set_failing(true);
        state.set_mute(10);
        assert!(state.is_muted());
        assert!(!state.trigger_alert("error"));
        state.set_mute(0);
        assert!(state.trigger_alert("error"));
    }

    #[test]
    fn huge_mute_is_clamped() {
        let (state, store, _) = setup(AlertConfig::default());
        for minutes in [i64::MAX / 1000, i64::MAX] {
            state.set_mute(minutes);
            assert!(state.is_muted());
            assert_eq!(state.mute_until(), T0 + MAX_MUTE_MINUTES * MINUTE_MS);
            assert_eq!(state.remaining_mute_minutes(), Some(MAX_MUTE_MINUTES));
        }
        let persisted = store.get("dashboard-mute-until-svc").unwrap().unwrap();
        assert_eq!(persisted, (T0 + MAX_MUTE_MINUTES * MINUTE_MS).to_string());
    }

    #[test]
    fn huge_fingerprint_mute_is_clamped() {
        let alert = AlertConfig {
            fingerprint_mute_minutes: u64::MAX,
            ..AlertConfig::default()
        };
        let (state, _, clock) = setup(alert);
        state.add_alert_fingerprint("fp-1");
        state.dismiss_alert();
        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert!(state.is_fingerprint_muted("fp-1"));
        assert!(!state.is_muted());
    }

    #[test]
    fn fingerprints_mute_on_dismiss_and_expire() {
        let (state, store, clock) = setup(AlertConfig::default());
        assert!(state.add_alert_fingerprint("fp-1"));
        assert!(!state.is_fingerprint_muted("fp-1"));
        state.trigger_alert("alertmanager");
        state.dismiss_alert();
        assert!(state.is_fingerprint_muted("fp-1"));
        assert!(!state.add_alert_fingerprint("fp-1"));
        assert!(store
            .get("dashboard-am-fingerprint-mutes-svc")
            .unwrap()
            .is_some_and(|json| json.contains("fp-1")));

        clock.advance(Duration::from_secs(10 * 60));
        assert!(!state.is_fingerprint_muted("fp-1"));
        assert_eq!(store.get("dashboard-am-fingerprint-mutes-svc").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn backstop_clears_expired_mute() {
        let (state, store, clock) = setup(AlertConfig::default());
        state.set_mute(1);
        assert!(state.backstop_running());
        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(BACKSTOP_INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(state.mute_until(), 0);
        assert_eq!(store.get("dashboard-mute-until-svc").unwrap(), None);
        assert!(!state.backstop_running());
    }

    #[tokio::test(start_paused = true)]
    async fn unmute_and_dispose_stop_backstop() {
        let (state, _, _) = setup(AlertConfig::default());
        state.set_mute(5);
        assert!(state.backstop_running());
        state.set_mute(0);
        assert!(!state.backstop_running());
        state.set_mute(5);
        state.dispose();
        assert!(!state.backstop_running());
    }
}
