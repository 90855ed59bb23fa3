//! Registry cache: flat records in a key-value medium plus a last-fetch stamp.
//!
//! Best-effort throughout. Write failures are logged and swallowed, read failures
//! and stale data both look like "no cache". The stored layout has no optional
//! type: absent strings are `""` and absent round-trip times are `-1`.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::aggregate::RelayAggregate;
use crate::capability::Capability;
use crate::registry::Registry;

/// Storage namespace for everything this module writes.
pub const CACHE_NAMESPACE: &str = "relay_discovery";
const RELAYS_KEY: &str = "relays";
const LAST_FETCH_KEY: &str = "last_fetch_ms";

/// Default freshness window: 6 hours.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(6 * 3600);

/// Synchronous string key-value medium.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;
    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
    fn remove(&self, namespace: &str, key: &str) -> Result<()>;
}

/// One JSON file per key under `<root>/<namespace>/`. Writes go through a temp file
/// and a rename so readers never see a half-written value.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let path = self.path(namespace, key);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let path = self.path(namespace, key);
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let path = self.path(namespace, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}

/// In-process store, mostly for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.inner
            .lock()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

/// Flat persisted form of `RelayAggregate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CachedRelay {
    pub key: String,
    pub capabilities: Vec<String>,
    pub feature_ids: Vec<u32>,
    pub requirements: Vec<String>,
    pub network: String,
    pub avg_open_ms: i64,
    pub avg_read_ms: i64,
    pub avg_write_ms: i64,
    pub topics: Vec<String>,
    pub last_seen_at: u64,
    pub software: String,
    pub version: String,
    pub display_name: String,
    pub description: String,
    pub icon_url: String,
    pub banner_url: String,
    pub payment_required: bool,
    pub auth_required: bool,
    pub restricted_writes: bool,
    pub has_embedded_metadata: bool,
    pub operator_id: String,
    pub country_code: String,
    pub isp: String,
    pub geohash: String,
    pub as_number: String,
    pub as_name: String,
    pub reporter_ids: Vec<String>,
}

fn str_out(v: &Option<String>) -> String {
    v.clone().unwrap_or_default()
}

fn str_in(v: String) -> Option<String> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn ms_out(v: Option<u64>) -> i64 {
    v.and_then(|v| i64::try_from(v).ok()).unwrap_or(-1)
}

fn ms_in(v: i64) -> Option<u64> {
    u64::try_from(v).ok()
}

impl From<&RelayAggregate> for CachedRelay {
    fn from(r: &RelayAggregate) -> Self {
        Self {
            key: r.key.clone(),
            capabilities: r.capabilities.iter().map(|c| c.as_str().to_string()).collect(),
            feature_ids: r.feature_ids.iter().copied().collect(),
            requirements: r.requirements.iter().cloned().collect(),
            network: str_out(&r.network),
            avg_open_ms: ms_out(r.avg_open_ms),
            avg_read_ms: ms_out(r.avg_read_ms),
            avg_write_ms: ms_out(r.avg_write_ms),
            topics: r.topics.iter().cloned().collect(),
            last_seen_at: r.last_seen_at,
            software: str_out(&r.software),
            version: str_out(&r.version),
            display_name: str_out(&r.display_name),
            description: str_out(&r.description),
            icon_url: str_out(&r.icon_url),
            banner_url: str_out(&r.banner_url),
            payment_required: r.payment_required,
            auth_required: r.auth_required,
            restricted_writes: r.restricted_writes,
            has_embedded_metadata: r.has_embedded_metadata,
            operator_id: str_out(&r.operator_id),
            country_code: str_out(&r.country_code),
            isp: str_out(&r.isp),
            geohash: str_out(&r.geohash),
            as_number: str_out(&r.as_number),
            as_name: str_out(&r.as_name),
            reporter_ids: r.reporter_ids.iter().cloned().collect(),
        }
    }
}

impl CachedRelay {
    /// `None` when the mandatory key is blank. The stored key was normalized when the
    /// aggregate was built and is kept as is.
    pub fn into_aggregate(self) -> Option<RelayAggregate> {
        let key = self.key.trim().to_string();
        if key.is_empty() {
            return None;
        }
        let reporter_ids: BTreeSet<String> = self.reporter_ids.into_iter().collect();
        Some(RelayAggregate {
            key,
            capabilities: self
                .capabilities
                .iter()
                .filter_map(|c| Capability::parse(c))
                .collect(),
            feature_ids: self.feature_ids.into_iter().collect(),
            requirements: self.requirements.into_iter().collect(),
            network: str_in(self.network),
            avg_open_ms: ms_in(self.avg_open_ms),
            avg_read_ms: ms_in(self.avg_read_ms),
            avg_write_ms: ms_in(self.avg_write_ms),
            topics: self.topics.into_iter().collect(),
            reporter_count: reporter_ids.len(),
            last_seen_at: self.last_seen_at,
            software: str_in(self.software),
            version: str_in(self.version),
            display_name: str_in(self.display_name),
            description: str_in(self.description),
            icon_url: str_in(self.icon_url),
            banner_url: str_in(self.banner_url),
            payment_required: self.payment_required,
            auth_required: self.auth_required,
            restricted_writes: self.restricted_writes,
            has_embedded_metadata: self.has_embedded_metadata,
            operator_id: str_in(self.operator_id),
            country_code: str_in(self.country_code),
            isp: str_in(self.isp),
            geohash: str_in(self.geohash),
            as_number: str_in(self.as_number),
            as_name: str_in(self.as_name),
            reporter_ids,
        })
    }
}

/// Unix milliseconds, wall clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// File-backed cache rooted at `dir` with the default TTL.
    pub fn on_disk<P: Into<PathBuf>>(dir: P) -> Self {
        Self::new(Arc::new(FileStore::new(dir)), DEFAULT_CACHE_TTL)
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), DEFAULT_CACHE_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn save(&self, registry: &Registry) {
        self.save_at(registry, now_millis());
    }

    /// Persist `registry` stamped with `now_ms`. Failures are logged only.
    pub fn save_at(&self, registry: &Registry, now_ms: i64) {
        if let Err(e) = self.try_save(registry, now_ms) {
            metrics::counter!("discovery_cache_write_errors_total").increment(1);
            tracing::warn!(target: "discovery", error = ?e, "cache save failed");
        }
    }

    fn try_save(&self, registry: &Registry, now_ms: i64) -> Result<()> {
        let mut rows: Vec<CachedRelay> = registry.values().map(CachedRelay::from).collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        let body = serde_json::to_string(&rows).context("serializing cached relays")?;
        self.store.put(CACHE_NAMESPACE, RELAYS_KEY, &body)?;
        self.store
            .put(CACHE_NAMESPACE, LAST_FETCH_KEY, &now_ms.to_string())?;
        Ok(())
    }

    /// Stored last-fetch stamp (unix ms), if readable.
    pub fn last_fetch_ms(&self) -> Option<i64> {
        match self.store.get(CACHE_NAMESPACE, LAST_FETCH_KEY) {
            Ok(v) => v.and_then(|s| s.trim().parse::<i64>().ok()),
            Err(e) => {
                tracing::warn!(target: "discovery", error = ?e, "cache stamp unreadable");
                None
            }
        }
    }

    /// Fresh while `now - last_fetch <= ttl`.
    pub fn is_fresh_at(&self, now_ms: i64) -> bool {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        self.last_fetch_ms()
            .is_some_and(|last| now_ms.saturating_sub(last) <= ttl_ms)
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(now_millis())
    }

    pub fn load(&self) -> Registry {
        self.load_at(now_millis())
    }

    /// Restore the registry if fresh at `now_ms`; otherwise an empty one.
    /// Stale data is left in place for the next save to overwrite.
    pub fn load_at(&self, now_ms: i64) -> Registry {
        if !self.is_fresh_at(now_ms) {
            return Registry::default();
        }
        let body = match self.store.get(CACHE_NAMESPACE, RELAYS_KEY) {
            Ok(Some(b)) => b,
            Ok(None) => return Registry::default(),
            Err(e) => {
                tracing::warn!(target: "discovery", error = ?e, "cache load failed");
                return Registry::default();
            }
        };
        let rows: Vec<CachedRelay> = match serde_json::from_str(&body) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(target: "discovery", error = %e, "cache payload corrupt");
                return Registry::default();
            }
        };
        let relays: HashMap<String, RelayAggregate> = rows
            .into_iter()
            .filter_map(CachedRelay::into_aggregate)
            .map(|r| (r.key.clone(), r))
            .collect();
        Registry::new(relays)
    }

    /// Drop both the records and the stamp.
    pub fn clear(&self) {
        for key in [RELAYS_KEY, LAST_FETCH_KEY] {
            if let Err(e) = self.store.remove(CACHE_NAMESPACE, key) {
                tracing::warn!(target: "discovery", error = ?e, key, "cache clear failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    fn sample() -> Registry {
        let agg = RelayAggregate {
            key: "wss://a.example".into(),
            capabilities: BTreeSet::from([Capability::Search]),
            feature_ids: BTreeSet::from([1, 50]),
            avg_open_ms: Some(0),
            reporter_ids: BTreeSet::from(["m1".to_string()]),
            reporter_count: 1,
            ..Default::default()
        };
        Registry::new(HashMap::from([(agg.key.clone(), agg)]))
    }

    #[test]
    fn ttl_boundary_is_inclusive() {
        let cache = CacheStore::in_memory();
        let t = 1_700_000_000_000;
        cache.save_at(&sample(), t);
        let ttl = 6 * HOUR_MS;
        assert!(cache.is_fresh_at(t + ttl - 1_000));
        assert!(cache.is_fresh_at(t + ttl));
        assert!(!cache.is_fresh_at(t + ttl + 1_000));
    }

    #[test]
    fn stale_load_is_empty_but_keeps_data() {
        let cache = CacheStore::in_memory();
        let t = 1_000;
        cache.save_at(&sample(), t);
        assert!(cache.load_at(t + 7 * HOUR_MS).is_empty());
        // still there for a fresh reader
        assert_eq!(cache.load_at(t + 1).len(), 1);
    }

    #[test]
    fn zero_rtt_survives_but_sentinel_means_absent() {
        let cache = CacheStore::in_memory();
        cache.save_at(&sample(), 10);
        let reg = cache.load_at(11);
        let r = reg.get("wss://a.example").unwrap();
        assert_eq!(r.avg_open_ms, Some(0));
        assert_eq!(r.avg_read_ms, None);
        assert_eq!(r.network, None);
    }

    #[test]
    fn records_without_key_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(
                CACHE_NAMESPACE,
                RELAYS_KEY,
                r#"[{"key":""},{"key":"wss://ok","avg_open_ms":-1}]"#,
            )
            .unwrap();
        store.put(CACHE_NAMESPACE, LAST_FETCH_KEY, "100").unwrap();
        let cache = CacheStore::new(store, DEFAULT_CACHE_TTL);
        let reg = cache.load_at(200);
        assert_eq!(reg.len(), 1);
        assert!(reg.get("wss://ok").is_some());
    }

    #[test]
    fn corrupt_payload_reads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        store.put(CACHE_NAMESPACE, RELAYS_KEY, "{{{").unwrap();
        store.put(CACHE_NAMESPACE, LAST_FETCH_KEY, "100").unwrap();
        let cache = CacheStore::new(store, DEFAULT_CACHE_TTL);
        assert!(cache.load_at(101).is_empty());
    }

    #[test]
    fn file_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::on_disk(dir.path());
        cache.save_at(&sample(), 5);
        assert!(dir.path().join(CACHE_NAMESPACE).join("relays.json").exists());
        assert_eq!(cache.load_at(6).len(), 1);
        cache.clear();
        assert!(cache.last_fetch_ms().is_none());
        assert!(cache.load_at(6).is_empty());
    }
}
