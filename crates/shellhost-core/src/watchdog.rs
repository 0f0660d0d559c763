//! Headless instance watchdog.
//!
//! Every headless instance is timestamped when it is created. After boot, a
//! shared timer (at most once per `check_interval_ms`) tears down instances
//! that outlived `headless_timeout_ms` with no dependent windows, unless their
//! app id is allow-listed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ids::InstanceId;

/// Watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Minimum spacing between sweeps.
    pub check_interval_ms: u64,
    /// Age after which a headless instance is reaped.
    pub headless_timeout_ms: u64,
    /// App ids allowed to stay headless (started during boot).
    pub boot_allow_list: BTreeSet<String>,
    /// App ids that are never reaped, even under memory pressure.
    pub permanent_keep_alive: BTreeSet<String>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 12_000,
            headless_timeout_ms: 60_000,
            boot_allow_list: BTreeSet::new(),
            permanent_keep_alive: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Tracked {
    app_id: String,
    created_at_ms: u64,
}

/// Timeout reaper for windowless instances.
#[derive(Debug)]
pub struct HeadlessWatchdog {
    config: WatchdogConfig,
    tracked: BTreeMap<InstanceId, Tracked>,
    last_fired_ms: Option<u64>,
}

impl HeadlessWatchdog {
    #[must_use]
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            tracked: BTreeMap::new(),
            last_fired_ms: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn track(&mut self, instance: InstanceId, app_id: impl Into<String>, now_ms: u64) {
        let app_id = app_id.into();
        debug!(%instance, %app_id, "tracking headless instance");
        self.tracked.entry(instance).or_insert(Tracked {
            app_id,
            created_at_ms: now_ms,
        });
    }

    pub fn untrack(&mut self, instance: InstanceId) -> bool {
        self.tracked.remove(&instance).is_some()
    }

    #[must_use]
    pub fn is_tracked(&self, instance: InstanceId) -> bool {
        self.tracked.contains_key(&instance)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    fn is_exempt(&self, app_id: &str) -> bool {
        self.config.boot_allow_list.contains(app_id)
            || self.config.permanent_keep_alive.contains(app_id)
    }

    /// Claim the shared timer. Returns `false` if it fired less than
    /// `check_interval_ms` ago.
    pub fn should_fire(&mut self, now_ms: u64) -> bool {
        if !self.config.enabled {
            return false;
        }
        if let Some(last) = self.last_fired_ms {
            if now_ms.saturating_sub(last) < self.config.check_interval_ms {
                return false;
            }
        }
        self.last_fired_ms = Some(now_ms);
        true
    }

    /// Instances due for teardown. Returned instances are no longer tracked.
    pub fn sweep(
        &mut self,
        now_ms: u64,
        boot_finished: bool,
        has_dependents: impl Fn(InstanceId) -> bool,
    ) -> Vec<InstanceId> {
        if !boot_finished {
            return Vec::new();
        }
        let timeout = self.config.headless_timeout_ms;
        let expired: Vec<InstanceId> = self
            .tracked
            .iter()
            .filter(|(id, t)| {
                !self.is_exempt(&t.app_id)
                    && now_ms.saturating_sub(t.created_at_ms) > timeout
                    && !has_dependents(**id)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(t) = self.tracked.remove(id) {
                info!(instance = %id, app_id = %t.app_id, age_ms = now_ms.saturating_sub(t.created_at_ms), "reaping headless instance");
            }
        }
        expired
    }

    /// Under memory pressure: tracked instances the caller selects as
    /// kept-alive and idle, regardless of age. Allow-listed and permanently
    /// kept-alive apps are always spared.
    pub fn reap_kept_alive(&mut self, is_candidate: impl Fn(InstanceId) -> bool) -> Vec<InstanceId> {
        let victims: Vec<InstanceId> = self
            .tracked
            .iter()
            .filter(|(id, t)| !self.is_exempt(&t.app_id) && is_candidate(**id))
            .map(|(id, _)| *id)
            .collect();
        for id in &victims {
            self.tracked.remove(id);
        }
        if !victims.is_empty() {
            info!(count = victims.len(), "reaping kept-alive headless instances under memory pressure");
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog() -> HeadlessWatchdog {
        HeadlessWatchdog::new(WatchdogConfig {
            boot_allow_list: ["com.example.clock".to_string()].into_iter().collect(),
            permanent_keep_alive: ["com.example.phone".to_string()].into_iter().collect(),
            ..WatchdogConfig::default()
        })
    }

    #[test]
    fn fires_at_most_every_interval() {
        let mut w = watchdog();
        assert!(w.should_fire(0));
        assert!(!w.should_fire(11_999));
        assert!(w.should_fire(12_000));
        assert!(!w.should_fire(12_001));
    }

    #[test]
    fn nothing_reaped_before_boot() {
        let mut w = watchdog();
        w.track(InstanceId(1), "com.example.mail", 0);
        assert!(w.sweep(120_000, false, |_| false).is_empty());
        assert!(w.is_tracked(InstanceId(1)));
    }

    #[test]
    fn reaps_only_old_unexempt_without_dependents() {
        let mut w = watchdog();
        w.track(InstanceId(1), "com.example.mail", 0);
        w.track(InstanceId(2), "com.example.clock", 0);
        w.track(InstanceId(3), "com.example.phone", 0);
        w.track(InstanceId(4), "com.example.maps", 0);
        w.track(InstanceId(5), "com.example.notes", 50_000);

        let reaped = w.sweep(60_001, true, |id| id == InstanceId(4));
        assert_eq!(reaped, vec![InstanceId(1)]);
        assert!(!w.is_tracked(InstanceId(1)));
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn exactly_timeout_is_not_reaped() {
        let mut w = watchdog();
        w.track(InstanceId(1), "com.example.mail", 0);
        assert!(w.sweep(60_000, true, |_| false).is_empty());
    }

    #[test]
    fn kept_alive_reap_ignores_age_but_spares_exempt() {
        let mut w = watchdog();
        w.track(InstanceId(1), "com.example.mail", 100);
        w.track(InstanceId(2), "com.example.clock", 100);
        w.track(InstanceId(3), "com.example.phone", 100);
        w.track(InstanceId(4), "com.example.radio", 100);
        let reaped = w.reap_kept_alive(|id| id != InstanceId(4));
        assert_eq!(reaped, vec![InstanceId(1)]);
        assert!(w.is_tracked(InstanceId(2)));
        assert!(w.is_tracked(InstanceId(3)));
        assert!(w.is_tracked(InstanceId(4)));
    }

    #[test]
    fn disabled_never_fires() {
        let mut w = HeadlessWatchdog::new(WatchdogConfig {
            enabled: false,
            ..WatchdogConfig::default()
        });
        assert!(!w.should_fire(1_000_000));
    }
}
