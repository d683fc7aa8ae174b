//! End-to-end tests for the work manager, driven by scripted transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::*;
use crate::cache::MemoryCacheProvider;
use crate::core::error::TransportErrorKind;
use crate::core::request::{fingerprint, normalize_uri};

type Responder =
    Box<dyn Fn(&TransportCall, usize) -> Result<TransportResponse, TransportError> + Send + Sync>;

/// Transport double: counts wire calls, records every call it sees, and
/// answers from a scripted closure of (call, call index).
struct ScriptedTransport {
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<TransportCall>>,
    respond: Responder,
}

impl ScriptedTransport {
    fn new(
        respond: impl Fn(&TransportCall, usize) -> Result<TransportResponse, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Self::with_delay(Duration::ZERO, respond)
    }

    fn with_delay(
        delay: Duration,
        respond: impl Fn(&TransportCall, usize) -> Result<TransportResponse, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen_uris(&self) -> Vec<String> {
        self.seen.lock().iter().map(|c| c.uri.clone()).collect()
    }

    fn seen(&self) -> Vec<TransportCall> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, call: TransportCall) -> Result<TransportResponse, TransportError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(call.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(&call, index)
    }
}

fn wire(status: u16, headers: &[(&str, &str)], body: &str) -> TransportResponse {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    TransportResponse {
        status,
        headers: map,
        body: Bytes::copy_from_slice(body.as_bytes()),
        elapsed_ms: 1,
    }
}

fn config_with_concurrency(max_concurrency: usize) -> EngineConfig {
    EngineConfig {
        max_concurrency,
        ..EngineConfig::default()
    }
}

fn build_manager(
    transport: Arc<ScriptedTransport>,
    cache: Option<Arc<dyn CacheProvider>>,
    config: EngineConfig,
) -> CommsManager {
    let mut builder = CommsManager::builder()
        .config(config)
        .transport(transport)
        .retry_policy(Arc::new(DefaultRetryPolicy::with_delays(5, 5)));
    if let Some(cache) = cache {
        builder = builder.cache(cache);
    }
    builder.build().unwrap()
}

fn memory_cache() -> Arc<dyn CacheProvider> {
    Arc::new(MemoryCacheProvider::new("test", 64))
}

fn id_of(uri: &str) -> u32 {
    fingerprint(&normalize_uri(uri).unwrap(), None).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_submissions_share_one_network_call() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(50), |_, _| Ok(wire(200, &[], "ok")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let first = manager.enqueue(Submission::get("http://x/a?p=1&q=2")).unwrap();
    let second = manager.enqueue(Submission::get("http://x/a?q=2&p=1")).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.id(), second.id());

    let a = first.wait().await.unwrap().unwrap();
    let b = second.wait().await.unwrap().unwrap();
    assert_eq!(a.status(), 200);
    assert_eq!(b.status(), 200);
    assert_eq!(a.body(), b.body());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_response_written_back_and_served_from_cache() {
    let transport = ScriptedTransport::new(|_, _| {
        Ok(wire(200, &[("Cache-Control", "max-age=60")], "payload"))
    });
    let cache = memory_cache();
    let manager = build_manager(transport.clone(), Some(cache.clone()), config_with_concurrency(2));

    let first = manager.enqueue(Submission::get("http://x/data")).unwrap();
    let response = first.wait().await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert!(!response.from_cache());

    // The entry exists immediately after completion, keyed by request id.
    let key = id_of("http://x/data").to_string();
    assert!(cache.contains(&key, false).unwrap());

    let second = manager.enqueue(Submission::get("http://x/data")).unwrap();
    assert!(second.is_done());
    let cached = second.wait().await.unwrap().unwrap();
    assert!(cached.from_cache());
    assert_eq!(cached.body().as_ref(), b"payload");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn do_not_cache_behavior_skips_writeback() {
    let transport = ScriptedTransport::new(|_, _| {
        Ok(wire(200, &[("Cache-Control", "max-age=60")], "payload"))
    });
    let cache = memory_cache();
    let manager = build_manager(transport.clone(), Some(cache.clone()), config_with_concurrency(2));

    let work = manager
        .enqueue(Submission::get("http://x/private").cache_behavior(CacheBehavior::DoNotCache))
        .unwrap();
    work.wait().await.unwrap();

    assert_eq!(cache.size(true).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_cache_directive_suppresses_writeback() {
    let transport = ScriptedTransport::new(|_, _| {
        Ok(wire(200, &[("Cache-Control", "no-cache, max-age=60")], "x"))
    });
    let cache = memory_cache();
    let manager = build_manager(transport, Some(cache.clone()), config_with_concurrency(2));

    let work = manager.enqueue(Submission::get("http://x/volatile")).unwrap();
    work.wait().await.unwrap();

    assert_eq!(cache.size(true).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_directed_cache_requires_ttl() {
    let transport = ScriptedTransport::new(|call, _| {
        if call.uri.contains("granted") {
            Ok(wire(200, &[("Cache-Control", "max-age=60")], "keep"))
        } else {
            Ok(wire(200, &[], "skip"))
        }
    });
    let cache = memory_cache();
    let manager = build_manager(transport, Some(cache.clone()), config_with_concurrency(2));

    let skipped = manager
        .enqueue(
            Submission::get("http://x/plain").cache_behavior(CacheBehavior::ServerDirectedCache),
        )
        .unwrap();
    skipped.wait().await.unwrap();
    assert_eq!(cache.size(true).unwrap(), 0);

    let kept = manager
        .enqueue(
            Submission::get("http://x/granted").cache_behavior(CacheBehavior::ServerDirectedCache),
        )
        .unwrap();
    kept.wait().await.unwrap();
    assert_eq!(cache.size(true).unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_only_miss_completes_with_null_result() {
    let transport = ScriptedTransport::new(|_, _| Ok(wire(200, &[], "never")));
    let cache = memory_cache();
    let manager = build_manager(transport.clone(), Some(cache), config_with_concurrency(2));

    let work = manager
        .enqueue(
            Submission::get("http://x/missing").cache_behavior(CacheBehavior::GetOnlyFromCache),
        )
        .unwrap();
    assert!(work.is_done());
    assert!(work.wait().await.unwrap().is_none());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_entry_served_within_stale_window() {
    let transport = ScriptedTransport::new(|_, _| Ok(wire(200, &[], "fresh")));
    let cache = memory_cache();

    // Plant an entry that expires immediately but grants a wide stale-use
    // window.
    let key = id_of("http://x/stale").to_string();
    let body = Response::new(200, HashMap::new(), Bytes::from_static(b"aged"), 0, 1)
        .serialize()
        .unwrap();
    cache
        .add(
            &key,
            crate::cache::CacheValue::Bytes(body),
            Some(0),
            Some(60_000),
            None,
            Some("http://x/stale"),
            CachePriority::Normal,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let manager = build_manager(transport.clone(), Some(cache), config_with_concurrency(2));
    let work = manager.enqueue(Submission::get("http://x/stale")).unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert!(response.from_cache());
    assert_eq!(response.body().as_ref(), b"aged");
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relative_redirect_followed_once() {
    let transport = ScriptedTransport::new(|_, index| {
        if index == 0 {
            Ok(wire(302, &[("Location", "/get")], ""))
        } else {
            Ok(wire(200, &[], "landed"))
        }
    });
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager
        .enqueue(Submission::get("http://host/response-headers?Location=%2Fget"))
        .unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(work.redirect_count(), 1);
    assert_eq!(
        transport.seen_uris(),
        vec![
            "http://host/response-headers?Location=%2Fget".to_string(),
            "http://host/get?Location=%2Fget".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_cycle_refused_and_terminal() {
    let transport = ScriptedTransport::new(|_, _| Ok(wire(302, &[("Location", "/start")], "")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager.enqueue(Submission::get("http://host/start")).unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(work.redirect_count(), 0);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_limit_bounds_the_chain() {
    let transport = ScriptedTransport::new(|_, index| {
        let location = format!("/hop{index}");
        Ok(wire(302, &[("Location", location.as_str())], ""))
    });
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager.enqueue(Submission::get("http://host/hops")).unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(work.redirect_count(), 3);
    assert_eq!(transport.calls(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_unavailable_retried_to_exhaustion() {
    let transport = ScriptedTransport::new(|_, _| Ok(wire(503, &[], "busy")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager.enqueue(Submission::get("http://x/busy")).unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(work.retry_count_response(), 5);
    assert_eq!(transport.calls(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_error_retried_then_succeeds() {
    let transport = ScriptedTransport::new(|_, index| {
        if index == 0 {
            Err(TransportError::new(TransportErrorKind::Timeout, "slow"))
        } else {
            Ok(wire(200, &[], "recovered"))
        }
    });
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager.enqueue(Submission::get("http://x/flaky")).unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(work.retry_count_failure(), 1);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_error_retries_surface_the_error() {
    let transport = ScriptedTransport::new(|_, _| {
        Err(TransportError::new(TransportErrorKind::Connect, "refused"))
    });
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager.enqueue(Submission::get("http://x/down")).unwrap();
    let outcome = work.wait().await;

    assert!(matches!(
        outcome,
        Err(CommsError::Transport(ref e)) if e.kind == TransportErrorKind::Connect
    ));
    assert_eq!(work.retry_count_failure(), 5);
    assert_eq!(transport.calls(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_idempotent_submission_not_retried_on_error() {
    let transport = ScriptedTransport::new(|_, _| {
        Err(TransportError::new(
            TransportErrorKind::ConnectionRefused,
            "refused",
        ))
    });
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager
        .enqueue(Submission::post("http://x/submit", &b"data"[..]))
        .unwrap();
    let outcome = work.wait().await;

    assert!(outcome.is_err());
    assert_eq!(work.retry_count_failure(), 0);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_work_cancelled_before_dispatch() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(100), |_, _| Ok(wire(200, &[], "ok")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(1));

    let blocker = manager.enqueue(Submission::get("http://x/blocker")).unwrap();
    let queued = manager.enqueue(Submission::get("http://x/queued")).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(manager.cancel(&queued, false));
    assert!(queued.is_cancelled());
    assert!(queued.is_done());
    assert!(queued.wait().await.unwrap().is_none());

    blocker.wait().await.unwrap();
    assert!(!transport.seen_uris().contains(&"http://x/queued".to_string()));

    // A second cancel of a terminal work reports false.
    assert!(!manager.cancel(&queued, false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_work_interrupted_on_cancel() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(500), |_, _| Ok(wire(200, &[], "ok")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(1));

    let work = manager.enqueue(Submission::get("http://x/slow")).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.calls(), 1);

    assert!(manager.cancel(&work, true));
    assert!(work.is_cancelled());
    assert!(work.wait().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependent_work_runs_after_dependency() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(80), |_, _| Ok(wire(200, &[], "ok")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(1));

    let dep = manager.enqueue(Submission::get("http://x/first")).unwrap();
    let dependent = manager.enqueue(Submission::get("http://x/second")).unwrap();

    let listener_called = Arc::new(AtomicBool::new(false));
    let flag = listener_called.clone();
    manager
        .set_dependent(
            &dependent,
            &dep,
            Box::new(move |d, _| {
                flag.store(true, Ordering::SeqCst);
                d.is_done()
            }),
        )
        .unwrap();

    dependent.wait().await.unwrap();
    assert!(dep.is_done());
    assert!(listener_called.load(Ordering::SeqCst));
    assert_eq!(
        transport.seen_uris(),
        vec!["http://x/first".to_string(), "http://x/second".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependent_work_vetoed_by_listener_is_cancelled() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(80), |_, _| Ok(wire(200, &[], "ok")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(1));

    let dep = manager.enqueue(Submission::get("http://x/first")).unwrap();
    let dependent = manager.enqueue(Submission::get("http://x/second")).unwrap();

    manager
        .set_dependent(&dependent, &dep, Box::new(|_, _| false))
        .unwrap();

    assert!(dependent.wait().await.unwrap().is_none());
    assert!(dependent.is_cancelled());
    assert!(!transport.seen_uris().contains(&"http://x/second".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependency_cycles_rejected() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(200), |_, _| Ok(wire(200, &[], "ok")));
    let manager = build_manager(transport, None, config_with_concurrency(1));

    // The blocker pins the single executor slot so a and b stay queued.
    let _blocker = manager.enqueue(Submission::get("http://x/blocker")).unwrap();
    let a = manager.enqueue(Submission::get("http://x/a")).unwrap();
    let b = manager.enqueue(Submission::get("http://x/b")).unwrap();

    assert!(manager.set_dependent(&a, &b, Box::new(|_, _| true)).is_ok());
    assert!(manager.set_dependent(&b, &a, Box::new(|_, _| true)).is_err());
    assert!(manager.set_dependent(&a, &a, Box::new(|_, _| true)).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_stale_entry_revalidated_with_if_none_match() {
    let transport = ScriptedTransport::new(|_, index| {
        if index == 0 {
            Ok(wire(
                200,
                &[("Cache-Control", "max-age=0"), ("ETag", "\"v1\"")],
                "original",
            ))
        } else {
            Ok(wire(304, &[], ""))
        }
    });
    let cache = memory_cache();
    let manager = build_manager(transport.clone(), Some(cache.clone()), config_with_concurrency(2));

    let first = manager.enqueue(Submission::get("http://x/versioned")).unwrap();
    let response = first.wait().await.unwrap().unwrap();
    assert_eq!(response.status(), 200);

    // Entry expires immediately and grants no stale use, so the next
    // submission revalidates with the stored etag.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = manager.enqueue(Submission::get("http://x/versioned")).unwrap();
    let revalidated = second.wait().await.unwrap().unwrap();

    assert_eq!(transport.calls(), 2);
    let revalidation_call = &transport.seen()[1];
    assert_eq!(
        revalidation_call.headers.get("If-None-Match").map(String::as_str),
        Some("\"v1\"")
    );
    assert_eq!(revalidated.status(), 200);
    assert!(revalidated.from_cache());
    assert_eq!(revalidated.body().as_ref(), b"original");

    // The refresh bumped modified_at while keeping the entry.
    let key = id_of("http://x/versioned").to_string();
    let entry = cache.get(&key, true).unwrap().unwrap();
    assert!(entry.modified_at >= entry.created_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn higher_priority_work_dispatches_first() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(60), |_, _| Ok(wire(200, &[], "ok")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(1));

    let blocker = manager.enqueue(Submission::get("http://x/blocker")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let low = manager
        .enqueue(Submission::get("http://x/low").start_priority(StartingPriority::Low))
        .unwrap();
    let high = manager
        .enqueue(Submission::get("http://x/high").start_priority(StartingPriority::High))
        .unwrap();

    blocker.wait().await.unwrap();
    low.wait().await.unwrap();
    high.wait().await.unwrap();

    assert_eq!(
        transport.seen_uris(),
        vec![
            "http://x/blocker".to_string(),
            "http://x/high".to_string(),
            "http://x/low".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_expose_queue_depths() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(150), |_, _| Ok(wire(200, &[], "ok")));
    let manager = build_manager(transport, None, config_with_concurrency(1));

    let works: Vec<Work> = (0..3)
        .map(|i| {
            manager
                .enqueue(Submission::get(format!("http://x/q{i}")))
                .unwrap()
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(40)).await;
    let stats = manager.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.waiting, 2);
    assert_eq!(stats.retrying, 0);

    for work in works {
        work.wait().await.unwrap();
    }
    let drained = manager.stats();
    assert_eq!(drained.active + drained.waiting + drained.retrying, 0);
}

/// Test policy that promotes straight to the floor, exposing the
/// age-based tie break.
struct ImmediatePromotion;

impl PromotionPolicy for ImmediatePromotion {
    fn promote(&self, priority: &mut crate::core::Priority, now: u64) {
        while priority.current() > 1 {
            priority.raise(now);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn promotion_converges_to_fifo_within_a_level() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(60), |_, _| Ok(wire(200, &[], "ok")));
    let manager = CommsManager::builder()
        .config(config_with_concurrency(1))
        .transport(transport.clone())
        .retry_policy(Arc::new(DefaultRetryPolicy::with_delays(5, 5)))
        .promotion_policy(Arc::new(ImmediatePromotion))
        .build()
        .unwrap();

    let blocker = manager.enqueue(Submission::get("http://x/blocker")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Both fully promoted to current = 1; the older LOW submission wins
    // the tie against the later HIGH one.
    let low = manager
        .enqueue(Submission::get("http://x/low").start_priority(StartingPriority::Low))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let high = manager
        .enqueue(Submission::get("http://x/high").start_priority(StartingPriority::High))
        .unwrap();

    blocker.wait().await.unwrap();
    low.wait().await.unwrap();
    high.wait().await.unwrap();

    assert_eq!(
        transport.seen_uris(),
        vec![
            "http://x/blocker".to_string(),
            "http://x/low".to_string(),
            "http://x/high".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn native_redirects_bypass_scheduler_orchestration() {
    let transport = ScriptedTransport::new(|_, _| Ok(wire(302, &[("Location", "/next")], "")));
    let config = EngineConfig {
        use_native_redirects: true,
        ..config_with_concurrency(2)
    };
    let manager = build_manager(transport.clone(), None, config);

    // With native redirects the transport owns the hop; the scheduler
    // treats whatever comes back as terminal.
    let work = manager.enqueue(Submission::get("http://host/native")).unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(work.redirect_count(), 0);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_after_zero_drives_immediate_retries() {
    let transport = ScriptedTransport::new(|_, index| {
        if index < 2 {
            Ok(wire(503, &[("Retry-After", "0")], "busy"))
        } else {
            Ok(wire(200, &[], "finally"))
        }
    });
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager.enqueue(Submission::get("http://x/eventually")).unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(work.retry_count_response(), 2);
    assert_eq!(transport.calls(), 3);
}

/// Provider whose read/write paths always fail; the engine must degrade
/// to plain network fetches.
struct FailingCache;

impl CacheProvider for FailingCache {
    fn add(
        &self,
        _key: &str,
        _value: CacheValue,
        _ttl: Option<u64>,
        _max_stale: Option<u64>,
        _etag: Option<&str>,
        _source_uri: Option<&str>,
        _priority: CachePriority,
    ) -> CommsResult<()> {
        Err(CommsError::Cache("store offline".to_string()))
    }

    fn get(&self, _key: &str, _allow_expired: bool) -> CommsResult<Option<crate::cache::CacheEntry>> {
        Err(CommsError::Cache("store offline".to_string()))
    }

    fn size(&self, _allow_expired: bool) -> CommsResult<usize> {
        Err(CommsError::Cache("store offline".to_string()))
    }

    fn contains(&self, _key: &str, _allow_expired: bool) -> CommsResult<bool> {
        Err(CommsError::Cache("store offline".to_string()))
    }

    fn remove(&self, _key: &str) -> CommsResult<bool> {
        Err(CommsError::Cache("store offline".to_string()))
    }

    fn remove_all(&self) -> CommsResult<()> {
        Err(CommsError::Cache("store offline".to_string()))
    }

    fn invalidate(&self, _key: &str) -> CommsResult<bool> {
        Err(CommsError::Cache("store offline".to_string()))
    }

    fn trim_lru(&self) -> CommsResult<()> {
        Err(CommsError::Cache("store offline".to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_cache_never_fails_a_submission() {
    let transport = ScriptedTransport::new(|_, _| {
        Ok(wire(200, &[("Cache-Control", "max-age=60")], "served"))
    });
    let manager = build_manager(
        transport.clone(),
        Some(Arc::new(FailingCache)),
        config_with_concurrency(2),
    );

    let work = manager.enqueue(Submission::get("http://x/degraded")).unwrap();
    let response = work.wait().await.unwrap().unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.body().as_ref(), b"served");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_body_and_headers_reach_the_transport() {
    let transport = ScriptedTransport::new(|_, _| Ok(wire(201, &[], "created")));
    let manager = build_manager(transport.clone(), None, config_with_concurrency(2));

    let work = manager
        .enqueue(
            Submission::post("http://x/things", &b"{\"name\":\"one\"}"[..])
                .header("Content-Type", "application/json"),
        )
        .unwrap();
    let response = work.wait().await.unwrap().unwrap();
    assert_eq!(response.status(), 201);

    let call = &transport.seen()[0];
    assert_eq!(call.method, http::Method::POST);
    assert_eq!(
        call.body.as_ref().map(|b| b.as_ref()),
        Some(&b"{\"name\":\"one\"}"[..])
    );
    assert_eq!(
        call.headers.get("Content-Type").map(String::as_str),
        Some("application/json")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidate_forces_refetch_and_purge_clears() {
    let transport = ScriptedTransport::new(|_, _| {
        Ok(wire(200, &[("Cache-Control", "max-age=60")], "payload"))
    });
    let cache = memory_cache();
    let manager = build_manager(transport.clone(), Some(cache.clone()), config_with_concurrency(2));

    let uri = "http://x/refetch";
    manager.enqueue(Submission::get(uri)).unwrap().wait().await.unwrap();
    assert_eq!(transport.calls(), 1);

    let id = id_of(uri);
    assert!(manager.invalidate_cache(id).unwrap());

    // Invalidated entry is expired with no stale grant, so the next
    // submission goes back to the network.
    manager.enqueue(Submission::get(uri)).unwrap().wait().await.unwrap();
    assert_eq!(transport.calls(), 2);

    manager.purge_cache(None).unwrap();
    assert_eq!(cache.size(true).unwrap(), 0);
}
