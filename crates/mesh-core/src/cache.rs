//! Cache: in-process memoization of app metadata. A
//! `tokio::sync::RwLock<Inner>`-behind-a-facade shape holding
//! derived/compiled artifacts (settings, schemas, transitions, symbol
//! tables, hook rules, subscriptions) rather than job state.

use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Clone, Debug, Default)]
pub struct CachedApp {
    pub version: String,
    pub active: bool,
    pub schemas: BTreeMap<String, String>,
    pub subscriptions: BTreeMap<String, String>,
    pub transitions: BTreeMap<String, String>,
    pub hook_rules: BTreeMap<String, String>,
    pub symbols: BTreeMap<String, BTreeMap<String, String>>,
    pub symbol_values: BTreeMap<String, String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CacheMode {
    Cache,
    /// Suspended until the locally observed app version reaches
    /// `until_version`.
    NoCache,
}

#[derive(Default)]
struct Inner {
    apps: BTreeMap<String, CachedApp>,
    active_task_queue: Option<String>,
    mode: BTreeMap<String, (CacheMode, Option<String>)>,
}

/// Keyed by `(appId, version?)`; version is folded into the `CachedApp` it
/// guards rather than doubling the map key, since exactly one version is
/// ever active for an app at a time.
pub struct Cache {
    inner: RwLock<Inner>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn get(&self, app_id: &str) -> Option<CachedApp> {
        let guard = self.inner.read().await;
        if self.is_nocache(&guard, app_id) {
            return None;
        }
        guard.apps.get(app_id).cloned()
    }

    pub async fn put(&self, app_id: &str, app: CachedApp) {
        let mut guard = self.inner.write().await;
        guard.apps.insert(app_id.to_string(), app);
    }

    pub async fn invalidate(&self, app_id: &str) {
        let mut guard = self.inner.write().await;
        guard.apps.remove(app_id);
    }

    /// `setCacheMode('nocache', untilVersion)`: suspend caching for `app_id`
    /// until a `put` observes `until_version`.
    pub async fn set_nocache_until(&self, app_id: &str, until_version: String) {
        let mut guard = self.inner.write().await;
        guard
            .mode
            .insert(app_id.to_string(), (CacheMode::NoCache, Some(until_version)));
    }

    fn is_nocache(&self, guard: &Inner, app_id: &str) -> bool {
        matches!(guard.mode.get(app_id), Some((CacheMode::NoCache, _)))
    }

    /// Called after every `put`: if the stored version matches the pending
    /// `until_version`, resume caching.
    pub async fn observe_version(&self, app_id: &str, version: &str) {
        let mut guard = self.inner.write().await;
        if let Some((CacheMode::NoCache, Some(until))) = guard.mode.get(app_id) {
            if until == version {
                guard.mode.insert(app_id.to_string(), (CacheMode::Cache, None));
            }
        }
    }

    pub async fn get_active_task_queue(&self) -> Option<String> {
        self.inner.read().await.active_task_queue.clone()
    }

    pub async fn set_active_task_queue(&self, key: Option<String>) {
        self.inner.write().await.active_task_queue = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = Cache::new();
        cache
            .put(
                "app1",
                CachedApp {
                    version: "1".into(),
                    active: true,
                    ..Default::default()
                },
            )
            .await;
        let got = cache.get("app1").await.unwrap();
        assert_eq!(got.version, "1");
    }

    #[tokio::test]
    async fn nocache_suppresses_reads_until_version_observed() {
        let cache = Cache::new();
        cache
            .put(
                "app1",
                CachedApp {
                    version: "1".into(),
                    ..Default::default()
                },
            )
            .await;
        cache.set_nocache_until("app1", "2".to_string()).await;
        assert!(cache.get("app1").await.is_none());

        cache
            .put(
                "app1",
                CachedApp {
                    version: "2".into(),
                    ..Default::default()
                },
            )
            .await;
        cache.observe_version("app1", "2").await;
        assert!(cache.get("app1").await.is_some());
    }
}
