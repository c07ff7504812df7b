//! Coalescing, expiry and usage events of the result cache.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tollgate::infrastructure::mocks::{MockCaptureLayer, MockClock};
use tollgate::{
    BoxError, CacheConfig, CacheEvent, CacheEventKind, ReasonCode, ResultCache,
    ResultCacheBuilder,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fifty_concurrent_callers_one_computation() {
    let clock = MockClock::new(Instant::now());
    let cache: ResultCache<String> =
        ResultCache::new(CacheConfig::new(Duration::from_secs(60), 100), Arc::new(clock)).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                cache
                    .get_or_compute("vision:sha256:abc", move || async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, BoxError>(format!("computed #{n}"))
                    })
                    .await
            })
        })
        .collect();

    let mut results = HashSet::new();
    for caller in callers {
        results.insert(caller.await.unwrap().unwrap());
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 1);
    assert!(results.contains("computed #1"));
}

#[tokio::test]
async fn test_expired_entry_is_recomputed() {
    let clock = MockClock::new(Instant::now());
    let cache: ResultCache<u32> = ResultCache::new(
        CacheConfig::new(Duration::from_millis(500), 100),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let compute = |counter: Arc<AtomicUsize>| {
        move || async move { Ok::<_, BoxError>(counter.fetch_add(1, Ordering::SeqCst) as u32) }
    };

    assert_eq!(cache.get_or_compute("k", compute(Arc::clone(&counter))).await.unwrap(), 0);
    clock.advance(Duration::from_millis(499));
    assert_eq!(cache.get_or_compute("k", compute(Arc::clone(&counter))).await.unwrap(), 0);

    clock.advance(Duration::from_millis(1));
    assert_eq!(cache.get("k"), None);
    assert_eq!(cache.get_or_compute("k", compute(Arc::clone(&counter))).await.unwrap(), 1);

    let stats = cache.stats();
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.sets, 2);
}

#[tokio::test]
async fn test_waiters_see_the_same_error() {
    let clock = MockClock::new(Instant::now());
    let cache: ResultCache<String> =
        ResultCache::new(CacheConfig::new(Duration::from_secs(60), 100), Arc::new(clock)).unwrap();
    let (release, gate) = tokio::sync::oneshot::channel::<()>();

    let leader = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute("k", || async move {
                    let _ = gate.await;
                    Err::<String, _>("quota exceeded at provider")
                })
                .await
        })
    };
    while cache.stats().misses < 1 {
        tokio::task::yield_now().await;
    }

    let followers: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("k", || async { Ok::<_, BoxError>("not me".to_string()) })
                    .await
            })
        })
        .collect();
    while cache.stats().coalesced < 5 {
        tokio::task::yield_now().await;
    }
    release.send(()).unwrap();

    let expected = leader.await.unwrap().unwrap_err();
    assert_eq!(expected.reason(), ReasonCode::ComputationFailed);
    for follower in followers {
        assert_eq!(follower.await.unwrap().unwrap_err(), expected);
    }
    assert_eq!(cache.stats().coalesced, 5);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_purges_unread_entries() {
    let clock = MockClock::new(Instant::now());
    let cache: ResultCache<String> = ResultCache::new(
        CacheConfig::new(Duration::from_secs(10), 100).with_sweep_interval(Duration::from_secs(5)),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let sweeper = cache.start_sweeper().unwrap();

    cache.set("rarely-read", "v".to_string());
    clock.advance(Duration::from_secs(11));
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(cache.len(), 0);
    assert_eq!(cache.stats().expirations, 1);
    sweeper.shutdown().await.unwrap();
}

#[test]
fn test_listener_sees_every_usage_event() {
    let clock = MockClock::new(Instant::now());
    let capture = MockCaptureLayer::new();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));
    let events: Arc<Mutex<Vec<(CacheEventKind, String)>>> = Arc::default();
    let sink = Arc::clone(&events);
    let cache: ResultCache<u8> = ResultCacheBuilder::new(
        CacheConfig::new(Duration::from_secs(1), 2),
        Arc::new(clock.clone()),
    )
    .listener(Arc::new(move |event: &CacheEvent<'_>| {
        sink.lock().push((event.kind, event.key.to_string()));
    }))
    .build()
    .unwrap();

    cache.set("a", 1);
    clock.advance(Duration::from_millis(1));
    cache.set("b", 2);
    clock.advance(Duration::from_millis(1));
    cache.set("c", 3);
    clock.advance(Duration::from_secs(2));
    cache.purge_expired();

    let events = events.lock();
    let evicted: Vec<_> = events
        .iter()
        .filter(|(kind, _)| *kind == CacheEventKind::Evicted)
        .map(|(_, key)| key.as_str())
        .collect();
    assert_eq!(evicted, vec!["a"]);
    assert_eq!(
        events
            .iter()
            .filter(|(kind, _)| *kind == CacheEventKind::Expired)
            .count(),
        2
    );

    // The same events are logged for subscribers without a listener
    let logged_evictions: Vec<_> = capture
        .for_target("tollgate::cache")
        .into_iter()
        .filter(|e| e.field("event") == Some("evicted"))
        .collect();
    assert_eq!(logged_evictions.len(), 1);
    assert_eq!(logged_evictions[0].field("key"), Some("a"));
}
