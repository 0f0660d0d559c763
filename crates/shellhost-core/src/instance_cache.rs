//! Application instances and the freeze/thaw cache of backgrounded ones.
//!
//! [`InstanceTable`] is the arena of every live [`AppInstance`].
//! [`InstanceCache`] holds the instances parked off-screen instead of being
//! destroyed when their last window closed, subject to [`KeepAlivePolicy`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ids::{ConnectionId, IdGen, InstanceId, ProcessId};

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global switch; when off every close destroys.
    pub enabled: bool,
    /// App ids allowed to be parked on close.
    pub keep_alive_apps: BTreeSet<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_alive_apps: BTreeSet::new(),
        }
    }
}

/// One running application instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstance {
    pub id: InstanceId,
    pub app_id: String,
    pub pid: ProcessId,
    pub connection: Option<ConnectionId>,
    /// Not a child scene of another instance.
    pub top_level: bool,
    pub loaded: bool,
    pub shutting_down: bool,
    /// No visible card window.
    pub headless: bool,
    pub created_at_ms: u64,
    /// Windows still open that belong to this instance.
    pub dependent_windows: usize,
}

/// Arena of application instances.
#[derive(Debug, Default)]
pub struct InstanceTable {
    ids: IdGen,
    instances: BTreeMap<InstanceId, AppInstance>,
}

impl InstanceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a headless, not-yet-loaded instance.
    pub fn create(
        &mut self,
        app_id: impl Into<String>,
        pid: ProcessId,
        connection: Option<ConnectionId>,
        now_ms: u64,
    ) -> InstanceId {
        let id = InstanceId(self.ids.next_raw());
        self.instances.insert(
            id,
            AppInstance {
                id,
                app_id: app_id.into(),
                pid,
                connection,
                top_level: true,
                loaded: false,
                shutting_down: false,
                headless: true,
                created_at_ms: now_ms,
                dependent_windows: 0,
            },
        );
        id
    }

    #[must_use]
    pub fn get(&self, id: InstanceId) -> Option<&AppInstance> {
        self.instances.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut AppInstance> {
        self.instances.get_mut(&id)
    }

    pub fn remove(&mut self, id: InstanceId) -> Option<AppInstance> {
        self.instances.remove(&id)
    }

    #[must_use]
    pub fn by_connection(&self, conn: ConnectionId) -> Option<InstanceId> {
        self.instances
            .values()
            .find(|i| i.connection == Some(conn))
            .map(|i| i.id)
    }

    #[must_use]
    pub fn by_pid(&self, pid: ProcessId) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| i.pid == pid)
            .map(|i| i.id)
            .collect()
    }

    #[must_use]
    pub fn by_app_id(&self, app_id: &str) -> Option<InstanceId> {
        self.instances
            .values()
            .find(|i| i.app_id == app_id)
            .map(|i| i.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppInstance> {
        self.instances.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Decides whether a closing instance is parked or destroyed.
#[derive(Debug, Clone, Default)]
pub struct KeepAlivePolicy {
    keep_alive_apps: BTreeSet<String>,
}

impl KeepAlivePolicy {
    #[must_use]
    pub fn new(keep_alive_apps: BTreeSet<String>) -> Self {
        Self { keep_alive_apps }
    }

    /// All conditions must hold; any failure means immediate destruction.
    #[must_use]
    pub fn should_park(&self, instance: &AppInstance, caching_enabled: bool) -> bool {
        caching_enabled
            && self.keep_alive_apps.contains(&instance.app_id)
            && instance.top_level
            && instance.loaded
            && !instance.shutting_down
    }

    #[must_use]
    pub fn is_keep_alive(&self, app_id: &str) -> bool {
        self.keep_alive_apps.contains(app_id)
    }
}

/// A parked instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedInstance {
    pub instance: InstanceId,
    pub app_id: String,
    pub parked_at_ms: u64,
}

/// Parked instances in parking order.
#[derive(Debug, Default)]
pub struct InstanceCache {
    policy: KeepAlivePolicy,
    enabled: bool,
    entries: Vec<CachedInstance>,
}

impl InstanceCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            policy: KeepAlivePolicy::new(config.keep_alive_apps.clone()),
            enabled: config.enabled,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &KeepAlivePolicy {
        &self.policy
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn should_park(&self, instance: &AppInstance) -> bool {
        self.policy.should_park(instance, self.enabled)
    }

    /// Park `entry`, replacing any entry for the same instance.
    pub fn park(&mut self, entry: CachedInstance) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.instance == entry.instance)
        {
            debug!(instance = %entry.instance, "re-parking cached instance");
            *existing = entry;
            return;
        }
        debug!(instance = %entry.instance, app_id = %entry.app_id, "instance parked");
        self.entries.push(entry);
    }

    /// Remove without destroying (thaw).
    pub fn evict(&mut self, instance: InstanceId) -> Option<CachedInstance> {
        let pos = self.entries.iter().position(|e| e.instance == instance)?;
        Some(self.entries.remove(pos))
    }

    #[must_use]
    pub fn contains(&self, instance: InstanceId) -> bool {
        self.entries.iter().any(|e| e.instance == instance)
    }

    /// Empty the cache; the caller destroys what is returned.
    pub fn flush_all(&mut self) -> Vec<CachedInstance> {
        let flushed = std::mem::take(&mut self.entries);
        if !flushed.is_empty() {
            info!(count = flushed.len(), "instance cache flushed");
        }
        flushed
    }

    /// Toggle caching. Disabling flushes.
    pub fn set_enabled(&mut self, enabled: bool) -> Vec<CachedInstance> {
        self.enabled = enabled;
        if enabled {
            Vec::new()
        } else {
            self.flush_all()
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &CachedInstance> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> InstanceCache {
        InstanceCache::new(&CacheConfig {
            enabled: true,
            keep_alive_apps: ["com.example.phone".to_string()].into_iter().collect(),
        })
    }

    fn instance(app_id: &str) -> AppInstance {
        AppInstance {
            id: InstanceId(1),
            app_id: app_id.into(),
            pid: ProcessId(100),
            connection: None,
            top_level: true,
            loaded: true,
            shutting_down: false,
            headless: false,
            created_at_ms: 0,
            dependent_windows: 0,
        }
    }

    fn entry(id: u64) -> CachedInstance {
        CachedInstance {
            instance: InstanceId(id),
            app_id: format!("app.{id}"),
            parked_at_ms: id,
        }
    }

    #[test]
    fn park_requires_every_condition() {
        let c = cache();
        assert!(c.should_park(&instance("com.example.phone")));
        assert!(!c.should_park(&instance("com.example.mail")));

        let mut child = instance("com.example.phone");
        child.top_level = false;
        assert!(!c.should_park(&child));

        let mut loading = instance("com.example.phone");
        loading.loaded = false;
        assert!(!c.should_park(&loading));

        let mut closing = instance("com.example.phone");
        closing.shutting_down = true;
        assert!(!c.should_park(&closing));
    }

    #[test]
    fn disabled_cache_never_parks() {
        let mut c = cache();
        c.park(entry(1));
        assert_eq!(c.set_enabled(false).len(), 1);
        assert!(c.is_empty());
        assert!(!c.should_park(&instance("com.example.phone")));
        assert!(c.set_enabled(true).is_empty());
    }

    #[test]
    fn park_coalesces_same_identity() {
        let mut c = cache();
        c.park(entry(1));
        c.park(CachedInstance {
            parked_at_ms: 99,
            ..entry(1)
        });
        assert_eq!(c.len(), 1);
        assert_eq!(c.entries().next().unwrap().parked_at_ms, 99);
    }

    #[test]
    fn flush_then_park_leaves_one() {
        let mut c = cache();
        c.park(entry(1));
        c.park(entry(2));
        assert_eq!(c.flush_all().len(), 2);
        c.park(entry(3));
        let ids: Vec<_> = c.entries().map(|e| e.instance).collect();
        assert_eq!(ids, vec![InstanceId(3)]);
    }

    #[test]
    fn evict_thaws_without_touching_others() {
        let mut c = cache();
        c.park(entry(1));
        c.park(entry(2));
        assert_eq!(c.evict(InstanceId(1)).unwrap().instance, InstanceId(1));
        assert!(c.evict(InstanceId(1)).is_none());
        assert!(c.contains(InstanceId(2)));
    }

    #[test]
    fn table_lookups() {
        let mut table = InstanceTable::new();
        let a = table.create("com.example.mail", ProcessId(5), Some(ConnectionId(2)), 10);
        let b = table.create("com.example.maps", ProcessId(6), None, 20);
        assert_ne!(a, b);
        assert_eq!(table.by_connection(ConnectionId(2)), Some(a));
        assert_eq!(table.by_pid(ProcessId(6)), vec![b]);
        assert_eq!(table.by_app_id("com.example.maps"), Some(b));
        let inst = table.get(a).unwrap();
        assert!(inst.headless);
        assert!(!inst.loaded);
        assert!(table.remove(a).is_some());
        assert_eq!(table.len(), 1);
    }
}
