//! # Discovery Engine
//! Owns the published registry, the monitor list and the collection cycles that
//! refresh them.
//!
//! A cycle moves `Idle → Collecting → Aggregating → Idle`. Collecting opens one
//! subscription and buffers whatever arrives until the window closes; cancelling
//! while collecting abandons the buffer. Once aggregation starts `cancel` no longer
//! reaches the cycle. At most one cycle per kind is live: starting a new one cancels
//! the old.
//!
//! `clear` bumps an epoch. A cycle that started before the bump drops its result
//! instead of saving or publishing it; the save and the publish both run under the
//! epoch lock, so a cleared engine never ends up with a fresh cache behind it.
//!
//! Readers get `Registry` snapshots (an `Arc` swap on publish), so a running cycle
//! never blocks or tears a read. Nothing here returns an error to the caller; failures
//! land in `EngineStatus::last_error`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{aggregate, normalize_key, RelayAggregate};
use crate::cache::CacheStore;
use crate::capability::{Capability, InferenceRules};
use crate::parser::{
    dedup_monitors, parse_discovery_report, parse_monitor_announcement, DiscoveryReport,
    MonitorAnnouncement,
};
use crate::record::{RawRecord, RecordFilter, MONITOR_ANNOUNCEMENT_KIND, RELAY_DISCOVERY_KIND};
use crate::registry::Registry;
use crate::transport::{RecordSink, Transport};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("discovery_records_total", "Raw records delivered by subscriptions.");
        describe_counter!(
            "discovery_records_malformed_total",
            "Records dropped by the parser."
        );
        describe_counter!("discovery_cycles_total", "Collection cycles that published.");
        describe_counter!("discovery_cycle_errors_total", "Collection cycles that failed.");
        describe_counter!(
            "discovery_cycles_cancelled_total",
            "Collection cycles abandoned before aggregation."
        );
        describe_counter!(
            "discovery_cache_write_errors_total",
            "Registry cache writes that failed."
        );
        describe_histogram!("discovery_aggregate_ms", "Aggregation time in milliseconds.");
        describe_gauge!("discovery_registry_size", "Relays in the published registry.");
        describe_gauge!("discovery_monitors_size", "Monitors in the published list.");
        describe_gauge!(
            "discovery_last_cycle_ts",
            "Unix ts when a discovery cycle last published."
        );
    });
}

/// Coordinator state visible to consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    /// A relay discovery cycle is collecting or aggregating.
    pub fetching: bool,
    /// A monitor announcement cycle is collecting.
    pub monitor_fetching: bool,
    /// At least one discovery cycle finished (successfully or not), or a fresh
    /// cache was restored.
    pub completed_once: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Cache still fresh; nothing was opened.
    SkippedFresh,
    Published { records: usize, entries: usize },
    Cancelled,
    /// `clear` ran while the cycle was in flight; its result was dropped.
    Cleared,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub discovery_window: Duration,
    pub monitor_window: Duration,
    pub rules: InferenceRules,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            discovery_window: Duration::from_secs(15),
            monitor_window: Duration::from_secs(8),
            rules: InferenceRules::default_seed(),
        }
    }
}

struct ActiveCycle {
    id: u64,
    token: CancellationToken,
}

/// The single live cycle of one kind.
#[derive(Default)]
struct CycleSlot {
    active: Mutex<Option<ActiveCycle>>,
    /// Claimed cycles that have not finished publishing yet.
    claimed: AtomicUsize,
}

/// Held by a cycle between claiming its slot and finishing its publish.
struct Claim<'a> {
    slot: &'a CycleSlot,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.slot.claimed.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CycleSlot {
    /// Install cycle `id`, cancelling whatever was running.
    fn begin(&self, id: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let prev = self.active.lock().replace(ActiveCycle {
            id,
            token: token.clone(),
        });
        if let Some(prev) = prev {
            prev.token.cancel();
        }
        token
    }

    /// Claim cycle `id` for aggregation. After this, cancel has no effect on it.
    fn claim(&self, id: u64) -> Option<Claim<'_>> {
        let mut guard = self.active.lock();
        match guard.as_ref() {
            Some(a) if a.id == id && !a.token.is_cancelled() => {
                *guard = None;
                self.claimed.fetch_add(1, Ordering::SeqCst);
                Some(Claim { slot: self })
            }
            _ => None,
        }
    }

    fn release(&self, id: u64) {
        let mut guard = self.active.lock();
        if guard.as_ref().is_some_and(|a| a.id == id) {
            *guard = None;
        }
    }

    fn cancel(&self) -> bool {
        match self.active.lock().take() {
            Some(a) => {
                a.token.cancel();
                true
            }
            None => false,
        }
    }

    /// A cycle of this kind is collecting, aggregating or publishing.
    fn is_busy(&self) -> bool {
        self.active.lock().is_some() || self.claimed.load(Ordering::SeqCst) > 0
    }
}

pub struct DiscoveryEngine {
    transport: Arc<dyn Transport>,
    cache: CacheStore,
    options: EngineOptions,
    registry_tx: watch::Sender<Registry>,
    monitors_tx: watch::Sender<Arc<Vec<MonitorAnnouncement>>>,
    status_tx: watch::Sender<EngineStatus>,
    discovery_slot: CycleSlot,
    monitor_slot: CycleSlot,
    next_cycle_id: AtomicU64,
    /// Bumped by `clear`; shared with the blocking cache save.
    epoch: Arc<Mutex<u64>>,
}

impl DiscoveryEngine {
    /// Build an engine and restore the registry from `cache` when it is still fresh.
    pub fn new(transport: Arc<dyn Transport>, cache: CacheStore, options: EngineOptions) -> Self {
        ensure_metrics_described();

        let restored = cache.load();
        let restored_fresh = cache.is_fresh();
        if restored_fresh {
            tracing::info!(target: "discovery", relays = restored.len(), "registry restored from cache");
        }
        gauge!("discovery_registry_size").set(restored.len() as f64);

        let (registry_tx, _) = watch::channel(restored);
        let (monitors_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (status_tx, _) = watch::channel(EngineStatus {
            completed_once: restored_fresh,
            ..Default::default()
        });

        Self {
            transport,
            cache,
            options,
            registry_tx,
            monitors_tx,
            status_tx,
            discovery_slot: CycleSlot::default(),
            monitor_slot: CycleSlot::default(),
            next_cycle_id: AtomicU64::new(1),
            epoch: Arc::new(Mutex::new(0)),
        }
    }

    // ---- read side ----

    /// Current registry snapshot.
    pub fn registry(&self) -> Registry {
        self.registry_tx.borrow().clone()
    }

    pub fn get(&self, key: &str) -> Option<RelayAggregate> {
        self.registry().get(key).cloned()
    }

    pub fn capabilities_of(&self, key: &str) -> BTreeSet<Capability> {
        self.registry().capabilities_of(key)
    }

    pub fn has_capability(&self, key: &str, cap: Capability) -> bool {
        self.registry().has_capability(key, cap)
    }

    pub fn by_capability(&self, cap: Capability) -> Vec<RelayAggregate> {
        self.registry().by_capability(cap)
    }

    pub fn monitors(&self) -> Arc<Vec<MonitorAnnouncement>> {
        self.monitors_tx.borrow().clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_registry(&self) -> watch::Receiver<Registry> {
        self.registry_tx.subscribe()
    }

    pub fn subscribe_monitors(&self) -> watch::Receiver<Arc<Vec<MonitorAnnouncement>>> {
        self.monitors_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    // ---- cycles ----

    /// Run one relay discovery cycle against `sources`, unless the cache is still
    /// fresh. A non-empty `trusted` restricts which monitors are believed.
    pub async fn trigger_fetch(&self, sources: &[String], trusted: &[String]) -> CycleOutcome {
        if self.cache.is_fresh() {
            tracing::debug!(target: "discovery", "cache fresh, skipping discovery cycle");
            return CycleOutcome::SkippedFresh;
        }

        let epoch = *self.epoch.lock();
        self.status_tx.send_modify(|s| s.fetching = true);
        let filter = RecordFilter::kinds(&[RELAY_DISCOVERY_KIND]).with_authors(trusted);
        let window = self.options.discovery_window;

        let (records, claim) = match self.collect(&self.discovery_slot, sources, filter, window).await {
            Ok(Some(collected)) => collected,
            Ok(None) => {
                counter!("discovery_cycles_cancelled_total").increment(1);
                self.status_tx
                    .send_modify(|s| s.fetching = self.discovery_slot.is_busy());
                tracing::info!(target: "discovery", "discovery cycle cancelled");
                return CycleOutcome::Cancelled;
            }
            Err(e) => return self.fail_discovery(e, epoch),
        };

        let t0 = Instant::now();
        let n_records = records.len();
        let reports = latest_per_reporter(parse_reports(&records, trusted));
        let relays = aggregate(&reports, &self.options.rules);
        histogram!("discovery_aggregate_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        let registry = Registry::new(relays);
        let entries = registry.len();

        // Persist first, so a fresh cache always has its registry published.
        let save = {
            let cache = self.cache.clone();
            let current = self.epoch.clone();
            let snapshot = registry.clone();
            tokio::task::spawn_blocking(move || {
                let guard = current.lock();
                if *guard == epoch {
                    cache.save(&snapshot);
                }
            })
        };
        if let Err(e) = save.await {
            tracing::warn!(target: "discovery", error = ?e, "cache save task failed");
        }

        drop(claim);
        let published = {
            let guard = self.epoch.lock();
            let current = *guard == epoch;
            if current {
                self.registry_tx.send_replace(registry);
                self.status_tx.send_modify(|s| {
                    s.fetching = self.discovery_slot.is_busy();
                    s.completed_once = true;
                    s.last_error = None;
                });
            }
            current
        };
        if !published {
            self.status_tx
                .send_modify(|s| s.fetching = self.discovery_slot.is_busy());
            tracing::info!(target: "discovery", records = n_records, "engine cleared mid-cycle, result dropped");
            return CycleOutcome::Cleared;
        }

        counter!("discovery_cycles_total").increment(1);
        gauge!("discovery_registry_size").set(entries as f64);
        gauge!("discovery_last_cycle_ts").set(chrono::Utc::now().timestamp() as f64);
        tracing::info!(
            target: "discovery",
            records = n_records,
            reports = reports.len(),
            relays = entries,
            "discovery cycle published"
        );

        CycleOutcome::Published {
            records: n_records,
            entries,
        }
    }

    /// Run one monitor announcement cycle. Not cache-guarded.
    pub async fn trigger_monitor_fetch(&self, sources: &[String]) -> CycleOutcome {
        let epoch = *self.epoch.lock();
        self.status_tx.send_modify(|s| s.monitor_fetching = true);
        let filter = RecordFilter::kinds(&[MONITOR_ANNOUNCEMENT_KIND]);
        let window = self.options.monitor_window;

        let (records, claim) = match self.collect(&self.monitor_slot, sources, filter, window).await {
            Ok(Some(collected)) => collected,
            Ok(None) => {
                counter!("discovery_cycles_cancelled_total").increment(1);
                self.status_tx
                    .send_modify(|s| s.monitor_fetching = self.monitor_slot.is_busy());
                return CycleOutcome::Cancelled;
            }
            Err(e) => {
                let msg = format!("{e:#}");
                counter!("discovery_cycle_errors_total").increment(1);
                tracing::warn!(target: "discovery", error = %msg, "monitor cycle failed");
                let guard = self.epoch.lock();
                self.status_tx.send_modify(|s| {
                    s.monitor_fetching = self.monitor_slot.is_busy();
                    if *guard == epoch {
                        s.last_error = Some(msg.clone());
                    }
                });
                return CycleOutcome::Failed(msg);
            }
        };

        let n_records = records.len();
        let anns: Vec<MonitorAnnouncement> = records
            .iter()
            .filter_map(|r| {
                let parsed = parse_monitor_announcement(r);
                if parsed.is_none() {
                    counter!("discovery_records_malformed_total").increment(1);
                }
                parsed
            })
            .collect();
        let monitors = dedup_monitors(anns);
        let entries = monitors.len();

        drop(claim);
        let published = {
            let guard = self.epoch.lock();
            let current = *guard == epoch;
            if current {
                self.monitors_tx.send_replace(Arc::new(monitors));
            }
            self.status_tx
                .send_modify(|s| s.monitor_fetching = self.monitor_slot.is_busy());
            current
        };
        if !published {
            return CycleOutcome::Cleared;
        }

        gauge!("discovery_monitors_size").set(entries as f64);
        tracing::info!(target: "discovery", records = n_records, monitors = entries, "monitor cycle published");

        CycleOutcome::Published {
            records: n_records,
            entries,
        }
    }

    /// Cancel any collecting cycles. Published state is untouched.
    pub fn cancel(&self) {
        let d = self.discovery_slot.cancel();
        let m = self.monitor_slot.cancel();
        if d || m {
            tracing::debug!(target: "discovery", discovery = d, monitors = m, "cycles cancelled");
        }
        // claimed cycles still finish, so they stay visible
        self.status_tx.send_modify(|s| {
            s.fetching = self.discovery_slot.is_busy();
            s.monitor_fetching = self.monitor_slot.is_busy();
        });
    }

    /// Cancel everything, forget all published state and drop the persisted cache.
    /// Waits for a cache save that is already running, then discards its result.
    pub fn clear(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.discovery_slot.cancel();
        self.monitor_slot.cancel();
        self.registry_tx.send_replace(Registry::default());
        self.monitors_tx.send_replace(Arc::new(Vec::new()));
        self.cache.clear();
        self.status_tx.send_replace(EngineStatus {
            fetching: self.discovery_slot.is_busy(),
            monitor_fetching: self.monitor_slot.is_busy(),
            ..Default::default()
        });
        drop(epoch);
        gauge!("discovery_registry_size").set(0.0);
        gauge!("discovery_monitors_size").set(0.0);
        tracing::info!(target: "discovery", "registry cleared");
    }

    fn fail_discovery(&self, e: anyhow::Error, epoch: u64) -> CycleOutcome {
        let msg = format!("{e:#}");
        counter!("discovery_cycle_errors_total").increment(1);
        tracing::warn!(target: "discovery", error = %msg, "discovery cycle failed");
        let guard = self.epoch.lock();
        // Mark completed so callers do not spin; the old registry stays published.
        self.status_tx.send_modify(|s| {
            s.fetching = self.discovery_slot.is_busy();
            if *guard == epoch {
                s.completed_once = true;
                s.last_error = Some(msg.clone());
            }
        });
        CycleOutcome::Failed(msg)
    }

    /// Open a subscription and buffer records until `window` elapses, then claim the
    /// slot. `Ok(None)` when the cycle was cancelled or superseded before the deadline.
    async fn collect<'a>(
        &self,
        slot: &'a CycleSlot,
        sources: &[String],
        filter: RecordFilter,
        window: Duration,
    ) -> anyhow::Result<Option<(Vec<RawRecord>, Claim<'a>)>> {
        let id = self.next_cycle_id.fetch_add(1, Ordering::SeqCst);
        let token = slot.begin(id);

        let buffer: Arc<Mutex<Vec<RawRecord>>> = Arc::default();
        let sink: RecordSink = {
            let buffer = buffer.clone();
            Arc::new(move |rec| {
                counter!("discovery_records_total").increment(1);
                buffer.lock().push(rec);
            })
        };

        let handle = match self.transport.open_subscription(sources, filter, sink).await {
            Ok(h) => h,
            Err(e) => {
                slot.release(id);
                return Err(e.context(format!("opening {} subscription", self.transport.name())));
            }
        };

        let cancelled = tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(window) => false,
        };
        handle.cancel();

        if cancelled {
            return Ok(None);
        }
        let Some(claim) = slot.claim(id) else {
            return Ok(None);
        };
        let snapshot = std::mem::take(&mut *buffer.lock());
        Ok(Some((snapshot, claim)))
    }
}

/// Parse discovery records, keeping only trusted reporters when a list is given.
fn parse_reports(records: &[RawRecord], trusted: &[String]) -> Vec<DiscoveryReport> {
    let trusted: HashSet<&str> = trusted.iter().map(String::as_str).collect();
    records
        .iter()
        .filter_map(|r| {
            let parsed = parse_discovery_report(r);
            if parsed.is_none() {
                counter!("discovery_records_malformed_total").increment(1);
            }
            parsed
        })
        .filter(|r| trusted.is_empty() || trusted.contains(r.reporter_id.as_str()))
        .collect()
}

/// A monitor's report about a relay replaces its earlier ones: keep the newest per
/// (reporter, relay), at the position of its first occurrence. Ties keep the earlier.
pub fn latest_per_reporter(reports: Vec<DiscoveryReport>) -> Vec<DiscoveryReport> {
    let mut slot_of: HashMap<(String, String), usize> = HashMap::new();
    let mut out: Vec<DiscoveryReport> = Vec::with_capacity(reports.len());
    for rep in reports {
        let id = (rep.reporter_id.clone(), normalize_key(&rep.resource_key));
        match slot_of.get(&id) {
            Some(&i) => {
                if rep.observed_at > out[i].observed_at {
                    out[i] = rep;
                }
            }
            None => {
                slot_of.insert(id, out.len());
                out.push(rep);
            }
        }
    }
    out
}
