// tests/engine_cycles.rs
//
// Collection cycle behavior against the in-memory fixture transport.
//
// Covered:
// - fresh cache skips the second fetch (no subscription opened)
// - cancel while collecting publishes nothing
// - a newer fetch supersedes a running one
// - open failure keeps the old registry and records the error
// - zero records is a valid, published outcome
// - trusted monitor filter, duplicate delivery, monitor cycle, clear()
// - cancel after the window closed still publishes
// - clear() while the cache save runs leaves no fresh cache behind

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use relay_discovery::cache::{CacheStore, KeyValueStore, MemoryStore, DEFAULT_CACHE_TTL};
use relay_discovery::capability::{Capability, InferenceRules};
use relay_discovery::engine::{CycleOutcome, DiscoveryEngine, EngineOptions, EngineStatus};
use relay_discovery::record::{
    RawRecord, RecordFilter, Tag, MONITOR_ANNOUNCEMENT_KIND, RELAY_DISCOVERY_KIND,
};
use relay_discovery::registry::Registry;
use relay_discovery::transport::{FixtureTransport, RecordSink, SubscriptionHandle, Transport};

fn quick() -> EngineOptions {
    EngineOptions {
        discovery_window: Duration::from_millis(60),
        monitor_window: Duration::from_millis(40),
        rules: InferenceRules::default_seed(),
    }
}

fn discovery(pubkey: &str, d: &str, at: u64, extra: &[&[&str]]) -> RawRecord {
    let mut tags = vec![Tag::new(["d", d])];
    tags.extend(extra.iter().map(|t| Tag::new(t.iter().copied())));
    RawRecord {
        kind: RELAY_DISCOVERY_KIND,
        pubkey: pubkey.into(),
        created_at: at,
        tags,
        content: String::new(),
    }
}

fn announcement(pubkey: &str, at: u64, freq: &str) -> RawRecord {
    RawRecord {
        kind: MONITOR_ANNOUNCEMENT_KIND,
        pubkey: pubkey.into(),
        created_at: at,
        tags: vec![Tag::new(["frequency", freq])],
        content: String::new(),
    }
}

fn sources() -> Vec<String> {
    vec!["wss://boot-1".into(), "wss://boot-2".into()]
}

fn engine_with(transport: Arc<dyn Transport>, cache: CacheStore) -> Arc<DiscoveryEngine> {
    Arc::new(DiscoveryEngine::new(transport, cache, quick()))
}

/// Succeeds on the first open, fails afterwards.
struct FlakyTransport {
    inner: FixtureTransport,
    opens: AtomicUsize,
}

#[async_trait::async_trait]
impl Transport for FlakyTransport {
    async fn open_subscription(
        &self,
        sources: &[String],
        filter: RecordFilter,
        on_record: RecordSink,
    ) -> anyhow::Result<Box<dyn SubscriptionHandle>> {
        if self.opens.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(anyhow!("connection reset"));
        }
        self.inner.open_subscription(sources, filter, on_record).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Memory store whose writes take a while.
struct SlowStore {
    inner: MemoryStore,
    put_delay: Duration,
}

impl SlowStore {
    fn cache(put_delay: Duration) -> CacheStore {
        CacheStore::new(
            Arc::new(SlowStore {
                inner: MemoryStore::new(),
                put_delay,
            }),
            DEFAULT_CACHE_TTL,
        )
    }
}

impl KeyValueStore for SlowStore {
    fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.get(namespace, key)
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        std::thread::sleep(self.put_delay);
        self.inner.put(namespace, key, value)
    }

    fn remove(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        self.inner.remove(namespace, key)
    }
}

#[tokio::test]
async fn second_fetch_within_ttl_opens_nothing() {
    let transport = Arc::new(FixtureTransport::new(vec![discovery(
        "m1",
        "wss://a",
        1,
        &[&["N", "50"]],
    )]));
    let engine = engine_with(transport.clone(), CacheStore::in_memory());

    let first = engine.trigger_fetch(&sources(), &[]).await;
    assert!(matches!(first, CycleOutcome::Published { entries: 1, .. }));
    assert_eq!(transport.open_count(), 1);

    let second = engine.trigger_fetch(&sources(), &[]).await;
    assert_eq!(second, CycleOutcome::SkippedFresh);
    assert_eq!(transport.open_count(), 1);
    assert!(engine.has_capability("WSS://A/", Capability::Search));
}

#[tokio::test]
async fn fresh_cache_is_restored_at_construction() {
    let cache = CacheStore::in_memory();
    let warm = engine_with(
        Arc::new(FixtureTransport::new(vec![discovery("m1", "wss://a", 1, &[])])),
        cache.clone(),
    );
    warm.trigger_fetch(&sources(), &[]).await;

    let transport = Arc::new(FixtureTransport::default());
    let engine = engine_with(transport.clone(), cache);
    assert_eq!(engine.registry().len(), 1);
    assert!(engine.status().completed_once);
    assert_eq!(engine.trigger_fetch(&sources(), &[]).await, CycleOutcome::SkippedFresh);
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test]
async fn cancel_while_collecting_publishes_nothing() {
    let transport = Arc::new(FixtureTransport::new(vec![discovery("m1", "wss://a", 1, &[])]));
    let engine = Arc::new(DiscoveryEngine::new(
        transport.clone(),
        CacheStore::in_memory(),
        EngineOptions {
            discovery_window: Duration::from_secs(1),
            ..quick()
        },
    ));

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.trigger_fetch(&sources(), &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.status().fetching);
    engine.cancel();

    let outcome = running.await.unwrap();
    assert_eq!(outcome, CycleOutcome::Cancelled);
    assert!(engine.registry().is_empty());
    let status = engine.status();
    assert!(!status.fetching);
    assert!(!status.completed_once);

    // nothing was cached, so the next trigger collects again
    let again = engine.trigger_fetch(&sources(), &[]).await;
    assert!(matches!(again, CycleOutcome::Published { .. }));
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn newer_fetch_supersedes_running_one() {
    let transport = Arc::new(FixtureTransport::new(vec![discovery("m1", "wss://a", 1, &[])]));
    let engine = Arc::new(DiscoveryEngine::new(
        transport,
        CacheStore::in_memory(),
        EngineOptions {
            discovery_window: Duration::from_millis(300),
            ..quick()
        },
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.trigger_fetch(&sources(), &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = engine.trigger_fetch(&sources(), &[]).await;
    assert_eq!(first.await.unwrap(), CycleOutcome::Cancelled);
    assert!(matches!(second, CycleOutcome::Published { entries: 1, .. }));
    assert!(!engine.status().fetching);
}

#[tokio::test]
async fn open_failure_keeps_previous_registry() {
    let transport = Arc::new(FlakyTransport {
        inner: FixtureTransport::new(vec![discovery("m1", "wss://a", 1, &[])]),
        opens: AtomicUsize::new(0),
    });
    // zero TTL: every later trigger is past freshness
    let cache = CacheStore::new(Arc::new(MemoryStore::new()), Duration::ZERO);
    let engine = engine_with(transport, cache);

    engine.trigger_fetch(&sources(), &[]).await;
    let before = engine.registry();
    assert_eq!(before.len(), 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let outcome = engine.trigger_fetch(&sources(), &[]).await;
    let CycleOutcome::Failed(msg) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(msg.contains("connection reset"));

    let status = engine.status();
    assert!(status.completed_once);
    assert!(!status.fetching);
    assert_eq!(status.last_error.as_deref(), Some(msg.as_str()));
    assert!(engine.registry().same_snapshot(&before));
}

#[tokio::test]
async fn failing_transport_still_marks_completed() {
    let engine = engine_with(
        Arc::new(FixtureTransport::failing("offline")),
        CacheStore::in_memory(),
    );
    let outcome = engine.trigger_fetch(&sources(), &[]).await;
    assert!(matches!(outcome, CycleOutcome::Failed(_)));
    assert!(engine.status().completed_once);
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn zero_records_is_a_published_cycle() {
    let engine = engine_with(Arc::new(FixtureTransport::default()), CacheStore::in_memory());
    let mut rx = engine.subscribe_status();

    let outcome = engine.trigger_fetch(&sources(), &[]).await;
    assert_eq!(
        outcome,
        CycleOutcome::Published {
            records: 0,
            entries: 0
        }
    );
    assert!(rx.has_changed().unwrap());
    let status = rx.borrow_and_update().clone();
    assert!(status.completed_once);
    assert_eq!(status.last_error, None);
}

#[tokio::test]
async fn duplicate_delivery_counts_each_monitor_once() {
    // both bootstrap sources serve the same two records
    let transport = Arc::new(FixtureTransport::new(vec![
        discovery("m1", "wss://a", 10, &[&["rtt-open", "100"]]),
        discovery("m2", "wss://a/", 10, &[&["rtt-open", "300"]]),
    ]));
    let engine = engine_with(transport, CacheStore::in_memory());
    let mut rx = engine.subscribe_registry();

    engine.trigger_fetch(&sources(), &[]).await;
    assert!(rx.has_changed().unwrap());
    let reg: Registry = rx.borrow_and_update().clone();
    let a = reg.get("wss://a").unwrap();
    assert_eq!(a.reporter_count, 2);
    assert_eq!(a.avg_open_ms, Some(200));
}

#[tokio::test]
async fn newest_report_per_monitor_wins() {
    let transport = Arc::new(FixtureTransport::new(vec![
        discovery("m1", "wss://a", 10, &[&["rtt-open", "900"]]),
        discovery("m1", "wss://a", 20, &[&["rtt-open", "100"]]),
    ]));
    let engine = engine_with(transport, CacheStore::in_memory());
    engine.trigger_fetch(&["wss://boot".to_string()], &[]).await;
    let a = engine.get("wss://a").unwrap();
    assert_eq!(a.avg_open_ms, Some(100));
    assert_eq!(a.last_seen_at, 20);
}

#[tokio::test]
async fn trusted_monitors_filter_reports() {
    let transport = Arc::new(FixtureTransport::new(vec![
        discovery("good", "wss://a", 1, &[&["T", "Search"]]),
        discovery("evil", "wss://a", 1, &[&["T", "PayToRelay"]]),
        discovery("evil", "wss://spam", 1, &[]),
    ]));
    let engine = engine_with(transport, CacheStore::in_memory());

    engine
        .trigger_fetch(&sources(), &["good".to_string()])
        .await;
    let reg = engine.registry();
    assert_eq!(reg.len(), 1);
    let a = reg.get("wss://a").unwrap();
    assert_eq!(a.reporter_ids, BTreeSet::from(["good".to_string()]));
    assert_eq!(engine.capabilities_of("wss://a"), BTreeSet::from([Capability::Search]));
    assert!(engine.by_capability(Capability::PayToRelay).is_empty());
}

#[tokio::test]
async fn monitor_cycle_keeps_newest_announcement() {
    let transport = Arc::new(FixtureTransport::new(vec![
        announcement("m1", 10, "600"),
        announcement("m1", 20, "1200"),
        announcement("m2", 5, "garbage"),
        discovery("m1", "wss://a", 1, &[]),
    ]));
    let engine = engine_with(transport.clone(), CacheStore::in_memory());

    let outcome = engine.trigger_monitor_fetch(&sources()).await;
    assert!(matches!(outcome, CycleOutcome::Published { entries: 2, .. }));
    let mons = engine.monitors();
    assert_eq!(mons.len(), 2);
    assert_eq!(mons[0].reporter_id, "m1");
    assert_eq!(mons[0].interval_seconds, 1200);
    assert_eq!(mons[1].interval_seconds, 3600);
    assert!(!engine.status().monitor_fetching);
    // monitor records never touch the relay registry
    assert!(engine.registry().is_empty());

    // not cache-guarded
    engine.trigger_monitor_fetch(&sources()).await;
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn clear_forgets_everything() {
    let cache = CacheStore::in_memory();
    let transport = Arc::new(FixtureTransport::new(vec![
        discovery("m1", "wss://a", 1, &[]),
        announcement("m1", 1, "60"),
    ]));
    let engine = engine_with(transport.clone(), cache.clone());
    engine.trigger_fetch(&sources(), &[]).await;
    engine.trigger_monitor_fetch(&sources()).await;
    assert!(cache.is_fresh());

    engine.clear();
    assert!(engine.registry().is_empty());
    assert!(engine.monitors().is_empty());
    assert!(!cache.is_fresh());
    assert_eq!(engine.status(), EngineStatus::default());

    // cache gone: the next trigger collects again
    let again = engine.trigger_fetch(&sources(), &[]).await;
    assert!(matches!(again, CycleOutcome::Published { entries: 1, .. }));
    assert_eq!(transport.open_count(), 3);
}

#[tokio::test]
async fn cancel_after_window_closed_still_publishes() {
    let cache = SlowStore::cache(Duration::from_millis(150));
    let transport = Arc::new(FixtureTransport::new(vec![discovery("m1", "wss://a", 1, &[])]));
    let engine = Arc::new(DiscoveryEngine::new(
        transport,
        cache.clone(),
        EngineOptions {
            discovery_window: Duration::from_millis(30),
            ..quick()
        },
    ));

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.trigger_fetch(&sources(), &[]).await })
    };
    // window closed, cache save in progress
    tokio::time::sleep(Duration::from_millis(80)).await;
    engine.cancel();
    assert!(engine.status().fetching, "claimed cycle is still running");

    let outcome = running.await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Published { entries: 1, .. }));
    assert_eq!(engine.registry().len(), 1);
    assert!(cache.is_fresh());
    let status = engine.status();
    assert!(!status.fetching);
    assert!(status.completed_once);
}

#[tokio::test]
async fn clear_during_cache_save_drops_the_cycle() {
    let cache = SlowStore::cache(Duration::from_millis(200));
    let transport = Arc::new(FixtureTransport::new(vec![discovery("m1", "wss://a", 1, &[])]));
    let engine = Arc::new(DiscoveryEngine::new(
        transport.clone(),
        cache.clone(),
        EngineOptions {
            discovery_window: Duration::from_millis(50),
            ..quick()
        },
    ));

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.trigger_fetch(&sources(), &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    engine.clear();

    assert_eq!(running.await.unwrap(), CycleOutcome::Cleared);
    assert!(engine.registry().is_empty());
    assert!(!cache.is_fresh(), "cleared engine must not sit on a fresh cache");
    assert_eq!(engine.status(), EngineStatus::default());

    // nothing stale blocks the next cycle
    let again = engine.trigger_fetch(&sources(), &[]).await;
    assert!(matches!(again, CycleOutcome::Published { entries: 1, .. }));
    assert_eq!(transport.open_count(), 2);
    assert_eq!(engine.registry().len(), 1);
}
