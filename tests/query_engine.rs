use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future;
use icebreak::cache::{
    CacheKey, CachePolicy, CacheStatus, ChangeKind, FetchError, KeyPattern, ManualClock, Mutation,
    MutationOptions, PolicyPreset, QueryClient, QueryState, StoreEvent, Subscription,
};
use icebreak::cache_key;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;

fn ttl(ms: u64) -> CachePolicy {
    CachePolicy::with_ttl(Duration::from_millis(ms))
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn counted<T: Clone + Send + 'static>(
    calls: &Arc<AtomicUsize>,
    value: T,
) -> impl FnOnce() -> future::Ready<Result<T, FetchError>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok(value))
    }
}

type Recorded = Arc<Mutex<Vec<StoreEvent>>>;

fn recorder(client: &QueryClient, key: &CacheKey) -> (Recorded, Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = client.subscribe(key, move |event| {
        sink.lock().expect("events").push(event.clone());
    });
    (events, subscription)
}

#[test]
fn structurally_equal_keys_share_an_entry() {
    let client = QueryClient::new();
    let written = cache_key!["events", { "page": 2, "filter": { "city": "Oslo", "tag": "rust" } }];
    let read = cache_key!["events", { "filter": { "tag": "rust", "city": "Oslo" }, "page": 2 }];

    assert_eq!(written.canonical(), read.canonical());
    client.store().set(&written, String::from("page two"), ttl(1_000));
    assert_eq!(client.store().get::<String>(&read).as_deref(), Some("page two"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_reads_invoke_fetcher_once() {
    let client = QueryClient::new();
    let key = cache_key!["quiz", 12];
    let calls = counter();

    let readers = (0..8).map(|_| {
        let calls = Arc::clone(&calls);
        client.fetch_query(
            &key,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, FetchError>(vec!["q1".to_string(), "q2".to_string()])
            },
            ttl(60_000),
        )
    });
    let results = future::join_all(readers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.expect("quiz").len(), 2);
    }
    assert!(!client.is_fetching(&key));
}

#[tokio::test]
async fn ttl_boundary_decides_refetch() {
    let clock = ManualClock::new(0);
    let client = QueryClient::with_clock(Arc::new(clock.clone()));
    let key = cache_key!["profile", 7];
    let calls = counter();
    client.store().set(&key, String::from("v1"), ttl(10_000));

    clock.set(9_999);
    let state = client.query(&key, counted(&calls, String::from("v2")), ttl(10_000));
    assert_eq!(state.ready().map(String::as_str), Some("v1"));

    clock.set(10_000);
    assert!(client.query(&key, counted(&calls, String::from("v2")), ttl(10_000)).is_ready());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    clock.set(10_001);
    let QueryState::Pending(suspension) =
        client.query(&key, counted(&calls, String::from("v2")), ttl(10_000))
    else {
        panic!("expired entry without SWR should suspend");
    };
    assert_eq!(client.store().entry(&key).map(|entry| entry.status), Some(CacheStatus::Fetching));
    assert_eq!(suspension.await.expect("refetched"), "v2");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.store().entry(&key).map(|entry| entry.status), Some(CacheStatus::Fresh));
}

#[tokio::test]
async fn stale_while_revalidate_notifies_when_refreshed() {
    let clock = ManualClock::new(0);
    let client = QueryClient::with_clock(Arc::new(clock.clone()));
    let key = cache_key!["profile", "me"];
    let policy = PolicyPreset::Personal.policy();
    client.store().set(&key, String::from("old bio"), policy);

    clock.advance(Duration::from_secs(6 * 60));
    let mut watch = client.watch_key(&key);
    let state = client.query(
        &key,
        || async { Ok::<_, FetchError>(String::from("new bio")) },
        policy,
    );
    assert_eq!(state.ready().map(String::as_str), Some("old bio"));

    let refreshed = timeout(Duration::from_secs(5), async {
        while watch.changed().await {
            if watch.last_event().map(|event| event.kind) == Some(ChangeKind::Set) {
                return true;
            }
        }
        false
    })
    .await
    .expect("refresh within timeout");
    assert!(refreshed);
    assert_eq!(client.store().get::<String>(&key).as_deref(), Some("new bio"));
}

#[tokio::test]
async fn invalidating_absent_key_notifies_once() {
    let client = QueryClient::new();
    let key = cache_key!["never", "stored"];
    let (events, _subscription) = recorder(&client, &key);

    assert_eq!(client.invalidate(&key), 0);

    let events = events.lock().expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Invalidated);
}

#[tokio::test]
async fn errors_persist_until_invalidated() {
    let clock = ManualClock::new(0);
    let client = QueryClient::with_clock(Arc::new(clock.clone()));
    let key = cache_key!["tally", 3];
    client.store().set(&key, 10u32, ttl(1_000));

    clock.set(5_000);
    let first = client
        .fetch_query(&key, || future::ready(Err::<u32, _>("backend down")), ttl(1_000))
        .await
        .expect_err("fetch fails");

    let calls = counter();
    for _ in 0..3 {
        let QueryState::Failed(error) = client.query(&key, counted(&calls, 11u32), ttl(1_000)) else {
            panic!("cached failure expected");
        };
        assert!(
            error
                .fetch_error()
                .zip(first.fetch_error())
                .is_some_and(|(a, b)| a.same_as(b))
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.invalidate(&key);
    let value = client
        .fetch_query(&key, counted(&calls, 11u32), ttl(1_000))
        .await
        .expect("retry after invalidation");
    assert_eq!(value, 11);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn predicate_invalidation_selects_event_keys() {
    let client = QueryClient::new();
    let store = client.store();
    for key in [
        cache_key!["events", "list", 1],
        cache_key!["events", "detail", { "id": 4 }],
        cache_key!["events"],
        cache_key!["quizzes", "events"],
    ] {
        store.set(&key, 0u8, CachePolicy::default());
    }
    store.set(&"events".into(), 0u8, CachePolicy::default());

    let removed = client.invalidate(KeyPattern::predicate(|decoded: &Value| {
        decoded
            .as_array()
            .and_then(|segments| segments.first())
            .is_some_and(|first| first == "events")
    }));

    assert_eq!(removed, 3);
    assert_eq!(store.keys(), vec![r#"["quizzes","events"]"#.to_string(), "events".to_string()]);
}

#[tokio::test]
async fn mutation_invalidation_triggers_fresh_fetch() {
    let client = QueryClient::new();
    let list = cache_key!["events", "list"];
    let backend = Arc::new(Mutex::new(vec!["meetup".to_string()]));

    let read_list = |backend: &Arc<Mutex<Vec<String>>>, calls: &Arc<AtomicUsize>| {
        let backend = Arc::clone(backend);
        let calls = Arc::clone(calls);
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, FetchError>(backend.lock().expect("backend").clone())
        }
    };
    let calls = counter();

    let before = client
        .fetch_query(&list, read_list(&backend, &calls), ttl(60_000))
        .await
        .expect("list");
    assert_eq!(before, vec!["meetup".to_string()]);

    let writer = Arc::clone(&backend);
    let create = Mutation::new(
        client.clone(),
        move |name: String| {
            let writer = Arc::clone(&writer);
            async move {
                writer.lock().expect("backend").push(name.clone());
                Ok::<_, FetchError>(name)
            }
        },
        MutationOptions::new().invalidate(KeyPattern::prefix(vec![json!("events")])),
    );
    create.mutate("hackathon".to_string()).await.expect("created");
    assert!(!client.store().contains(&list));

    let after = client
        .fetch_query(&list, read_list(&backend, &calls), ttl(60_000))
        .await
        .expect("list");
    assert_eq!(after, vec!["meetup".to_string(), "hackathon".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidated_fetch_does_not_overwrite_newer_data() {
    let client = QueryClient::new();
    let key = cache_key!["profile", "me"];
    let (release, gate) = oneshot::channel::<()>();

    let stale_read = client.fetch_query(
        &key,
        move || async move {
            let _ = gate.await;
            Ok::<_, FetchError>(String::from("before edit"))
        },
        ttl(60_000),
    );

    client.invalidate(&key);
    client.store().set(&key, String::from("after edit"), ttl(60_000));

    release.send(()).expect("fetch waiting");
    assert_eq!(stale_read.await.expect("waiter resolves"), "before edit");
    assert_eq!(client.store().get::<String>(&key).as_deref(), Some("after edit"));
}

#[tokio::test]
async fn fetch_completes_when_every_reader_gives_up() {
    let client = QueryClient::new();
    let key = cache_key!["abandoned"];
    let (release, gate) = oneshot::channel::<()>();

    let state = client.query(
        &key,
        move || async move {
            let _ = gate.await;
            Ok::<_, FetchError>(42u64)
        },
        ttl(60_000),
    );
    drop(state);

    let mut watch = client.watch_key(&key);
    release.send(()).expect("fetch waiting");
    timeout(Duration::from_secs(5), watch.changed())
        .await
        .expect("commit within timeout");
    assert_eq!(client.store().get::<u64>(&key), Some(42));
}

#[tokio::test]
async fn prefetch_swallows_failures() {
    let client = QueryClient::new();
    let key = cache_key!["quiz", "someone"];

    let started = client
        .prefetch(&key, || future::ready(Err::<String, _>("not yet published")), ttl(60_000))
        .await;
    assert!(started);
    assert!(client.store().entry(&key).is_none());

    let calls = counter();
    let state = client.query(&key, counted(&calls, String::from("published")), ttl(60_000));
    assert!(state.is_pending());
}

#[tokio::test]
async fn clear_and_reset_isolate_tests() {
    let client = QueryClient::new();
    let key = cache_key!["a"];
    client.store().set(&key, 1u8, CachePolicy::default());
    let (events, subscription) = recorder(&client, &key);

    client.clear();
    assert!(client.store().is_empty());
    assert_eq!(events.lock().expect("events").len(), 1);

    client.reset();
    assert_eq!(client.store().subscribed_key_count(), 0);
    drop(subscription);
}

#[tokio::test]
async fn background_refresh_failure_never_reaches_readers() {
    let clock = ManualClock::new(0);
    let client = QueryClient::with_clock(Arc::new(clock.clone()));
    let key = cache_key!["profile", "host"];
    let policy = PolicyPreset::Personal.policy();
    client.store().set(&key, String::from("cached bio"), policy);
    clock.advance(Duration::from_secs(6 * 60));

    let mut watch = client.watch_key(&key);
    let state = client.query(
        &key,
        || future::ready(Err::<String, _>("profile service down")),
        policy,
    );
    assert_eq!(state.ready().map(String::as_str), Some("cached bio"));

    timeout(Duration::from_secs(5), async {
        while watch.changed().await {
            if watch.last_event().map(|event| event.kind) == Some(ChangeKind::Error) {
                break;
            }
        }
    })
    .await
    .expect("failure recorded within timeout");

    let entry = client.store().entry(&key).expect("stale entry kept");
    assert_eq!(entry.status, CacheStatus::Error);
    assert_eq!(entry.data::<String>().map(String::as_str), Some("cached bio"));

    let calls = counter();
    let value = client
        .fetch_query(&key, counted(&calls, String::from("fresh bio")), policy)
        .await
        .expect("stale data still served");
    assert_eq!(value, "cached bio");

    timeout(Duration::from_secs(5), async {
        while client.store().get::<String>(&key).as_deref() != Some("fresh bio") {
            if !watch.changed().await {
                break;
            }
        }
    })
    .await
    .expect("retry commits within timeout");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blocking_read_shares_prefetch_fetch() {
    let client = QueryClient::new();
    let key = cache_key!["quiz", "guest"];
    let (release, gate) = oneshot::channel::<()>();
    let calls = counter();

    let prefetch_calls = Arc::clone(&calls);
    let prefetch = client.prefetch(
        &key,
        move || async move {
            prefetch_calls.fetch_add(1, Ordering::SeqCst);
            let _ = gate.await;
            Ok::<_, FetchError>(String::from("warm"))
        },
        ttl(60_000),
    );
    let read = async {
        let value = client.fetch_query(&key, counted(&calls, String::from("cold")), ttl(60_000));
        let _ = release.send(());
        value.await
    };

    let (started, value) = futures::join!(prefetch, read);
    assert!(started);
    assert_eq!(value.expect("shared value"), "warm");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
