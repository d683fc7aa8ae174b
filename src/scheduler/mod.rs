//! The work manager: queue discipline, dedup, concurrency gating, retry
//! scheduling, redirect orchestration, and cache read/writeback.
//!
//! One scheduler task drives the queue state machine; wire attempts run on
//! spawned tasks bounded by `max_concurrency`. All queue state lives behind
//! a single lock that is never held across I/O or an await point.

pub mod retry;
pub mod work;

#[cfg(test)]
mod tests;

pub use retry::DefaultRetryPolicy;
pub use work::{Work, WorkOutcome, WorkState};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use validator::Validate;

use crate::cache::{CachePriority, CacheProvider, CacheValue, ResponseDirectives};
use crate::config::EngineConfig;
use crate::core::error::{CommsError, CommsResult, TransportError};
use crate::core::priority::{IntervalPromotionPolicy, Priority, StartingPriority};
use crate::core::request::Request;
use crate::core::response::Response;
use crate::core::traits::{PromotionPolicy, RetryPolicy, Transport, TransportCall, TransportResponse};
use crate::transport::HttpExecutor;
use work::WorkShared;

/// Floor for the scheduler's timed wait so a burst of near-term retry
/// deadlines cannot spin the loop.
const MIN_WAKE_MS: u64 = 20;

/// Per-submission cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBehavior {
    /// Consult the cache before the network and write successful
    /// responses back.
    Normal,
    /// Bypass the cache entirely.
    DoNotCache,
    /// Answer from the cache or complete with a null result; never touch
    /// the network.
    GetOnlyFromCache,
    /// Cache only when the server grants a TTL.
    ServerDirectedCache,
}

impl CacheBehavior {
    fn consults_cache(self) -> bool {
        matches!(
            self,
            CacheBehavior::Normal | CacheBehavior::GetOnlyFromCache | CacheBehavior::ServerDirectedCache
        )
    }
}

/// Callback invoked when a work another work depends on reaches a terminal
/// state. Arguments are `(dependency, dependent)`; returning false cancels
/// the dependent with a null result.
pub type DependentListener = Box<dyn Fn(&Work, &Work) -> bool + Send + Sync>;

/// A submission being built for [`CommsManager::enqueue`].
#[derive(Debug, Clone)]
pub struct Submission {
    uri: String,
    method: Method,
    body: Option<Bytes>,
    headers: BTreeMap<String, String>,
    idempotent: bool,
    start_priority: StartingPriority,
    cache_priority: CachePriority,
    cache_behavior: CacheBehavior,
}

impl Submission {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: Method::GET,
            body: None,
            headers: BTreeMap::new(),
            idempotent: true,
            start_priority: StartingPriority::Medium,
            cache_priority: CachePriority::Normal,
            cache_behavior: CacheBehavior::Normal,
        }
    }

    pub fn post(uri: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            uri: uri.into(),
            method: Method::POST,
            body: Some(body.into()),
            headers: BTreeMap::new(),
            idempotent: false,
            start_priority: StartingPriority::Medium,
            cache_priority: CachePriority::Normal,
            cache_behavior: CacheBehavior::Normal,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn start_priority(mut self, priority: StartingPriority) -> Self {
        self.start_priority = priority;
        self
    }

    pub fn cache_priority(mut self, priority: CachePriority) -> Self {
        self.cache_priority = priority;
        self
    }

    pub fn cache_behavior(mut self, behavior: CacheBehavior) -> Self {
        self.cache_behavior = behavior;
        self
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub waiting: usize,
    pub active: usize,
    pub retrying: usize,
}

struct WorkEntry {
    request: Request,
    priority: Priority,
    cache_priority: CachePriority,
    cache_behavior: CacheBehavior,
    /// Absolute deadline after which a retried/redirected work re-enters
    /// the waiting queue.
    retry_at: Option<u64>,
    /// Attempt generation; completions carrying an older generation are
    /// ignored (cancel bumps it implicitly by removing the entry).
    attempt: u32,
    attempt_handle: Option<JoinHandle<()>>,
    gated_by: Option<u32>,
    dependents: Vec<u32>,
    on_dependency_done: Option<DependentListener>,
    newest_response: Option<Response>,
    shared: Arc<WorkShared>,
}

impl WorkEntry {
    fn set_state(&self, state: WorkState) {
        self.shared.set_state(state);
    }

    fn sync_counts(&self) {
        self.shared.record_counts(
            self.request.redirect_count(),
            self.request.retry_count_failure(),
            self.request.retry_count_response(),
        );
    }
}

/// Invariant: a queued work id appears in exactly one of the three queues,
/// and `works` holds an entry for every queued id.
#[derive(Default)]
struct Queues {
    waiting: Vec<u32>,
    active: Vec<u32>,
    retry: Vec<u32>,
    works: HashMap<u32, WorkEntry>,
}

impl Queues {
    fn remove_everywhere(&mut self, id: u32) {
        self.waiting.retain(|w| *w != id);
        self.active.retain(|w| *w != id);
        self.retry.retain(|w| *w != id);
    }
}

enum CacheLookup {
    /// Usable entry; the synthesized response is served without a network
    /// attempt.
    Hit(Response),
    /// Entry past its stale-use window but carrying a validator.
    DeadWithEtag(String),
    Miss,
}

/// Result of the in-lock half of attempt completion.
enum AttemptPhase {
    /// Retry or redirect scheduled; nothing more to do outside the lock.
    Requeued,
    /// Terminal failure.
    Fail(CommsError),
    /// Terminal response; cache writeback still pending.
    Terminal {
        response: Response,
        behavior: CacheBehavior,
        cache_priority: CachePriority,
        original_uri: String,
    },
}

struct ManagerInner {
    config: EngineConfig,
    cache: Option<Arc<dyn CacheProvider>>,
    retry_policy: Arc<dyn RetryPolicy>,
    promotion: Arc<dyn PromotionPolicy>,
    transport: Arc<dyn Transport>,
    queues: Mutex<Queues>,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// The request-dispatch scheduler.
///
/// Build one with [`CommsManager::builder`]; dropping the manager stops
/// its scheduler task. Submissions may come from any thread or task.
pub struct CommsManager {
    inner: Arc<ManagerInner>,
}

impl CommsManager {
    pub fn builder() -> CommsManagerBuilder {
        CommsManagerBuilder::new()
    }

    /// Submit a unit of work.
    ///
    /// A submission whose fingerprint matches a queued work returns the
    /// existing work (without raising its priority). Cache-satisfiable
    /// submissions return an already-completed work.
    pub fn enqueue(&self, submission: Submission) -> CommsResult<Work> {
        let Submission {
            uri,
            method,
            body,
            headers,
            idempotent,
            start_priority,
            cache_priority,
            cache_behavior,
        } = submission;
        let mut request = Request::new(method, &uri, body, headers, idempotent)?;
        let id = request.id();

        let mut queues = self.inner.queues.lock();

        // Dedup across waiting, active, and retry. The existing work keeps
        // its current priority.
        if let Some(existing) = queues.works.get(&id) {
            log::debug!(
                "Deduplicated submission {id:#010x} for {}",
                request.original_uri()
            );
            return Ok(Work::from_shared(id, existing.shared.clone()));
        }

        if cache_behavior.consults_cache() {
            if let Some(cache) = &self.inner.cache {
                match lookup_cached(cache.as_ref(), id) {
                    CacheLookup::Hit(response) => {
                        log::debug!("Serving {id:#010x} from cache");
                        return Ok(Work::new_completed(id, Ok(Some(response))));
                    }
                    CacheLookup::DeadWithEtag(etag) => {
                        if cache_behavior != CacheBehavior::GetOnlyFromCache {
                            request.set_header("If-None-Match", etag);
                        }
                    }
                    CacheLookup::Miss => {}
                }
            }
        }

        if cache_behavior == CacheBehavior::GetOnlyFromCache {
            return Ok(Work::new_completed(id, Ok(None)));
        }

        let work = Work::new_queued(id);
        let entry = WorkEntry {
            request,
            priority: Priority::new(start_priority),
            cache_priority,
            cache_behavior,
            retry_at: None,
            attempt: 0,
            attempt_handle: None,
            gated_by: None,
            dependents: Vec::new(),
            on_dependency_done: None,
            newest_response: None,
            shared: work.shared(),
        };
        entry.set_state(WorkState::Waiting);
        queues.works.insert(id, entry);
        queues.waiting.push(id);
        drop(queues);

        self.inner.notify.notify_one();
        Ok(work)
    }

    /// Cancel a work. Queued work is removed and terminal immediately; an
    /// in-flight attempt is aborted only when `interrupt` is set (its
    /// result is discarded either way). Returns false when the work was
    /// already terminal or unknown.
    pub fn cancel(&self, work: &Work, interrupt: bool) -> bool {
        self.inner.cancel_by_id(work.id(), interrupt)
    }

    pub fn cancel_by_id(&self, work_id: u32, interrupt: bool) -> bool {
        self.inner.cancel_by_id(work_id, interrupt)
    }

    /// Make `work` run only after `dep` reaches a terminal state. The
    /// listener is invoked on the manager's completion path; returning
    /// false cancels `work` with a null result. Cycles are rejected.
    pub fn set_dependent(
        &self,
        work: &Work,
        dep: &Work,
        listener: DependentListener,
    ) -> CommsResult<()> {
        if work.id() == dep.id() {
            return Err(CommsError::Internal(
                "work cannot depend on itself".to_string(),
            ));
        }

        {
            let mut queues = self.inner.queues.lock();

            // Walk the dependency chain from `dep`; reaching `work` again
            // means the new edge would close a cycle.
            let mut cursor = queues.works.get(&dep.id()).and_then(|e| e.gated_by);
            while let Some(current) = cursor {
                if current == work.id() {
                    return Err(CommsError::Internal("dependency cycle detected".to_string()));
                }
                cursor = queues.works.get(&current).and_then(|e| e.gated_by);
            }

            if queues.active.contains(&work.id()) {
                return Err(CommsError::Internal(
                    "work is already running; dependency cannot be honored".to_string(),
                ));
            }
            if !queues.works.contains_key(&work.id()) {
                return Err(CommsError::Internal(
                    "work is no longer schedulable".to_string(),
                ));
            }

            if queues.works.contains_key(&dep.id()) {
                {
                    let entry = queues.works.get_mut(&work.id()).expect("checked above");
                    entry.gated_by = Some(dep.id());
                    entry.on_dependency_done = Some(listener);
                }
                queues
                    .works
                    .get_mut(&dep.id())
                    .expect("checked above")
                    .dependents
                    .push(work.id());
                return Ok(());
            }
        }

        // The dependency is already terminal; consult the listener now.
        if listener(dep, work) {
            Ok(())
        } else {
            self.inner.cancel_by_id(work.id(), false);
            Ok(())
        }
    }

    /// Force the cache entry for `work_id` to read as expired.
    pub fn invalidate_cache(&self, work_id: u32) -> CommsResult<bool> {
        match &self.inner.cache {
            Some(cache) => cache.invalidate(&cache_key(work_id)),
            None => Ok(false),
        }
    }

    /// Drop one cached entry, or every entry when `work_id` is `None`.
    pub fn purge_cache(&self, work_id: Option<u32>) -> CommsResult<()> {
        let Some(cache) = &self.inner.cache else {
            return Ok(());
        };
        match work_id {
            Some(id) => {
                cache.remove(&cache_key(id))?;
                Ok(())
            }
            None => cache.remove_all(),
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let queues = self.inner.queues.lock();
        ManagerStats {
            waiting: queues.waiting.len(),
            active: queues.active.len(),
            retrying: queues.retry.len(),
        }
    }

    /// Stop the scheduler task. Queued work stays queued and will not be
    /// dispatched again; in-flight attempts run to completion.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.notify.notify_one();
    }
}

impl Drop for CommsManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn cache_key(id: u32) -> String {
    id.to_string()
}

fn lookup_cached(cache: &dyn CacheProvider, id: u32) -> CacheLookup {
    let key = cache_key(id);
    let entry = match cache.get(&key, true) {
        Ok(Some(entry)) => entry,
        Ok(None) => return CacheLookup::Miss,
        Err(e) => {
            log::warn!("Cache lookup failed for {key}: {e}; falling through to network");
            return CacheLookup::Miss;
        }
    };

    let now = crate::core::epoch_ms();
    if entry.is_usable(now) {
        match Response::deserialize(entry.value.as_bytes()) {
            Ok(mut response) => {
                response.mark_from_cache();
                return CacheLookup::Hit(response);
            }
            Err(e) => {
                log::warn!("Dropping undecodable cache entry {key}: {e}");
                let _ = cache.remove(&key);
                return CacheLookup::Miss;
            }
        }
    }

    match entry.etag {
        Some(etag) => CacheLookup::DeadWithEtag(etag),
        None => CacheLookup::Miss,
    }
}

impl ManagerInner {
    async fn worker_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::debug!("Scheduler task started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.scheduler_pass() {
                Some(delay) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        log::debug!("Scheduler task stopped");
    }

    /// One pass of the queue state machine. Returns how long to sleep
    /// until the next retry deadline, or `None` to wait for notification.
    fn scheduler_pass(self: &Arc<Self>) -> Option<Duration> {
        let now = crate::core::epoch_ms();
        let mut guard = self.queues.lock();
        let queues = &mut *guard;

        // Retries whose deadline passed re-enter the waiting queue.
        let due: Vec<u32> = queues
            .retry
            .iter()
            .copied()
            .filter(|id| {
                queues
                    .works
                    .get(id)
                    .map(|e| e.retry_at.unwrap_or(0) <= now)
                    .unwrap_or(true)
            })
            .collect();
        for id in due {
            queues.retry.retain(|w| *w != id);
            if let Some(entry) = queues.works.get_mut(&id) {
                entry.retry_at = None;
                entry.set_state(WorkState::Waiting);
                queues.waiting.push(id);
            }
        }

        // Promote ageing works, then order the queue.
        for id in queues.waiting.clone() {
            if let Some(entry) = queues.works.get_mut(&id) {
                self.promotion.promote(&mut entry.priority, now);
            }
        }
        let mut waiting = std::mem::take(&mut queues.waiting);
        waiting.sort_by(|a, b| match (queues.works.get(a), queues.works.get(b)) {
            (Some(ea), Some(eb)) => ea.priority.compare(&eb.priority),
            _ => std::cmp::Ordering::Equal,
        });
        queues.waiting = waiting;

        // Dispatch up to the concurrency cap, skipping gated works.
        while queues.active.len() < self.config.max_concurrency {
            let Some(pos) = queues.waiting.iter().position(|id| {
                queues
                    .works
                    .get(id)
                    .map(|e| e.gated_by.is_none())
                    .unwrap_or(false)
            }) else {
                break;
            };
            let id = queues.waiting.remove(pos);
            let Some(entry) = queues.works.get_mut(&id) else {
                continue;
            };
            entry.attempt += 1;
            let attempt = entry.attempt;
            entry.set_state(WorkState::Running);
            let call = TransportCall {
                method: entry.request.method().clone(),
                uri: entry.request.current_uri().to_string(),
                headers: entry.request.headers().clone(),
                body: entry.request.body().cloned(),
                connect_timeout_ms: self.config.connect_timeout_ms,
                read_timeout_ms: self.config.read_timeout_ms,
            };
            queues.active.push(id);
            log::debug!("Dispatching {id:#010x} attempt {attempt} to {}", call.uri);

            let manager = Arc::clone(self);
            let transport = Arc::clone(&self.transport);
            let handle = tokio::spawn(async move {
                let result = transport.execute(call).await;
                manager.complete_attempt(id, attempt, result);
            });
            if let Some(entry) = queues.works.get_mut(&id) {
                entry.attempt_handle = Some(handle);
            }
        }

        // Sleep until the earliest pending retry, floored so bursts of
        // deadlines cannot spin the loop.
        queues
            .retry
            .iter()
            .filter_map(|id| queues.works.get(id).and_then(|e| e.retry_at))
            .min()
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now).max(MIN_WAKE_MS)))
    }

    /// Completion callback for one wire attempt. Decisions that need queue
    /// state run under the lock; cache writeback and waiter release run
    /// after it is dropped.
    fn complete_attempt(
        self: &Arc<Self>,
        id: u32,
        attempt: u32,
        result: Result<TransportResponse, TransportError>,
    ) {
        let now = crate::core::epoch_ms();
        let phase = {
            let mut guard = self.queues.lock();
            let queues = &mut *guard;
            let Some(entry) = queues.works.get_mut(&id) else {
                log::debug!("Attempt result for unknown work {id:#010x} dropped");
                return;
            };
            if entry.attempt != attempt {
                log::debug!("Stale attempt {attempt} for {id:#010x} ignored");
                return;
            }
            entry.attempt_handle = None;

            match result {
                Err(error) => {
                    let decision = self.retry_policy.on_error(&entry.request, &error);
                    if decision.retry {
                        entry.request.record_failure_retry();
                        entry.sync_counts();
                        log::info!(
                            "Retrying {id:#010x} in {} ms after {error}",
                            decision.delay_ms
                        );
                        entry.retry_at = Some(now.saturating_add(decision.delay_ms));
                        entry.set_state(WorkState::Retrying);
                        queues.active.retain(|w| *w != id);
                        queues.retry.push(id);
                        AttemptPhase::Requeued
                    } else {
                        log::warn!("Work {id:#010x} failed terminally: {error}");
                        AttemptPhase::Fail(error.into())
                    }
                }
                Ok(wire) => {
                    let response =
                        Response::new(wire.status, wire.headers, wire.body, id, wire.elapsed_ms);
                    let newer = entry
                        .newest_response
                        .as_ref()
                        .map(|r| response.created_at() >= r.created_at())
                        .unwrap_or(true);
                    if newer {
                        entry.newest_response = Some(response.clone());
                    }

                    let decision = self.retry_policy.on_response(&entry.request, &response);
                    if decision.retry {
                        entry.request.record_response_retry();
                        entry.sync_counts();
                        log::info!(
                            "Retrying {id:#010x} in {} ms after status {}",
                            decision.delay_ms,
                            response.status()
                        );
                        entry.retry_at = Some(now.saturating_add(decision.delay_ms));
                        entry.set_state(WorkState::Retrying);
                        queues.active.retain(|w| *w != id);
                        queues.retry.push(id);
                        AttemptPhase::Requeued
                    } else if response.is_redirect()
                        && !self.config.use_native_redirects
                        && entry.request.redirect_count() < self.config.redirect_limit
                        && self.retry_policy.should_redirect(&entry.request, &response)
                    {
                        let directives = ResponseDirectives::parse(&response);
                        let accepted = directives
                            .resolve_location(entry.request.current_uri())
                            .map(|target| entry.request.redirect(&target))
                            .unwrap_or(false);
                        if accepted {
                            entry.sync_counts();
                            log::info!(
                                "Redirecting {id:#010x} to {}",
                                entry.request.current_uri()
                            );
                            entry.retry_at = Some(now);
                            entry.set_state(WorkState::Redirecting);
                            queues.active.retain(|w| *w != id);
                            queues.retry.push(id);
                            AttemptPhase::Requeued
                        } else {
                            // Missing Location or a cycle: the 3xx response
                            // is the terminal result.
                            AttemptPhase::Terminal {
                                behavior: entry.cache_behavior,
                                cache_priority: entry.cache_priority,
                                original_uri: entry.request.original_uri().to_string(),
                                response,
                            }
                        }
                    } else {
                        AttemptPhase::Terminal {
                            behavior: entry.cache_behavior,
                            cache_priority: entry.cache_priority,
                            original_uri: entry.request.original_uri().to_string(),
                            response,
                        }
                    }
                }
            }
        };

        match phase {
            AttemptPhase::Requeued => self.notify.notify_one(),
            AttemptPhase::Fail(error) => {
                self.finalize(id, Err(error), WorkState::Completed);
            }
            AttemptPhase::Terminal {
                response,
                behavior,
                cache_priority,
                original_uri,
            } => {
                let final_response =
                    self.apply_writeback(id, behavior, cache_priority, &original_uri, response);
                self.finalize(id, Ok(Some(final_response)), WorkState::Completed);
            }
        }
    }

    /// Evaluate the writeback rules for a terminal response and return the
    /// response waiters should observe (the cached body for a 304).
    fn apply_writeback(
        &self,
        id: u32,
        behavior: CacheBehavior,
        cache_priority: CachePriority,
        original_uri: &str,
        response: Response,
    ) -> Response {
        let Some(cache) = &self.cache else {
            return response;
        };
        if behavior == CacheBehavior::DoNotCache {
            return response;
        }
        let key = cache_key(id);

        if response.status() == 304 {
            return refresh_not_modified(cache.as_ref(), &key, response);
        }

        let directives = ResponseDirectives::parse(&response);
        if directives.no_cache {
            log::debug!("Response for {key} carries no-cache; skipping writeback");
            return response;
        }
        if behavior == CacheBehavior::ServerDirectedCache && directives.ttl_ms.is_none() {
            log::debug!("Server granted no TTL for {key}; skipping writeback");
            return response;
        }
        if !response.is_cacheable_status() {
            return response;
        }

        match response.serialize() {
            Ok(bytes) => {
                if let Err(e) = cache.add(
                    &key,
                    CacheValue::Bytes(bytes),
                    directives.ttl_ms,
                    directives.max_stale_ms,
                    directives.etag.as_deref(),
                    Some(original_uri),
                    cache_priority,
                ) {
                    log::warn!("Cache writeback failed for {key}: {e}");
                } else if let Err(e) = cache.trim_lru() {
                    log::warn!("Cache trim failed: {e}");
                }
            }
            Err(e) => log::warn!("Response for {key} not serializable, skipping cache: {e}"),
        }
        response
    }

    /// Remove the work from the arena, publish the outcome, and release
    /// dependents. Listener callbacks run with the queue lock dropped.
    fn finalize(self: &Arc<Self>, id: u32, outcome: WorkOutcome, state: WorkState) {
        let released = {
            let mut queues = self.queues.lock();
            let Some(mut entry) = queues.works.remove(&id) else {
                return;
            };
            queues.remove_everywhere(id);
            entry.sync_counts();
            let dependents = std::mem::take(&mut entry.dependents);
            entry.shared.finish(outcome, state);
            (entry.shared, dependents)
        };

        let (shared, dependents) = released;
        let dep_work = Work::from_shared(id, shared);
        for dependent_id in dependents {
            self.release_dependent(&dep_work, dependent_id);
        }
        self.notify.notify_one();
    }

    fn release_dependent(self: &Arc<Self>, dep: &Work, dependent_id: u32) {
        let Some((listener, shared)) = ({
            let mut queues = self.queues.lock();
            queues.works.get_mut(&dependent_id).map(|entry| {
                entry.gated_by = None;
                (entry.on_dependency_done.take(), entry.shared.clone())
            })
        }) else {
            return;
        };

        let proceed = match listener {
            Some(listener) => listener(dep, &Work::from_shared(dependent_id, shared)),
            None => true,
        };
        if proceed {
            self.notify.notify_one();
        } else {
            log::debug!("Dependent work {dependent_id:#010x} vetoed by listener, cancelling");
            self.cancel_by_id(dependent_id, false);
        }
    }

    fn cancel_by_id(self: &Arc<Self>, id: u32, interrupt: bool) -> bool {
        let (shared, dependents, handle) = {
            let mut queues = self.queues.lock();
            let Some(mut entry) = queues.works.remove(&id) else {
                return false;
            };
            queues.remove_everywhere(id);
            let handle = entry.attempt_handle.take();
            entry.sync_counts();
            let dependents = std::mem::take(&mut entry.dependents);
            let newest = entry.newest_response.take();
            entry.shared.finish(Ok(newest), WorkState::Cancelled);
            (entry.shared, dependents, handle)
        };

        if interrupt {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        log::info!("Cancelled work {id:#010x}");

        let dep_work = Work::from_shared(id, shared);
        for dependent_id in dependents {
            self.release_dependent(&dep_work, dependent_id);
        }
        self.notify.notify_one();
        true
    }
}

fn refresh_not_modified(cache: &dyn CacheProvider, key: &str, response: Response) -> Response {
    let entry = match cache.get(key, true) {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            log::debug!("304 for {key} without a cached entry");
            return response;
        }
        Err(e) => {
            log::warn!("Cache read failed for {key} on 304: {e}");
            return response;
        }
    };

    let directives = ResponseDirectives::parse(&response);
    if let Err(e) = cache.add(
        key,
        entry.value.clone(),
        directives.ttl_ms.or(entry.ttl),
        directives.max_stale_ms.or(entry.max_stale),
        directives.etag.as_deref().or(entry.etag.as_deref()),
        entry.source_uri.as_deref(),
        entry.priority,
    ) {
        log::warn!("Cache refresh failed for {key} on 304: {e}");
    }

    match Response::deserialize(entry.value.as_bytes()) {
        Ok(mut cached) => {
            cached.mark_from_cache();
            cached
        }
        Err(e) => {
            log::warn!("Cached body for {key} undecodable on 304: {e}");
            response
        }
    }
}

/// Wires a [`CommsManager`]: configuration, cache provider, policies, and
/// transport. Unset collaborators fall back to the engine defaults.
pub struct CommsManagerBuilder {
    config: EngineConfig,
    cache: Option<Arc<dyn CacheProvider>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    promotion: Option<Arc<dyn PromotionPolicy>>,
    transport: Option<Arc<dyn Transport>>,
}

impl Default for CommsManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommsManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            cache: None,
            retry_policy: None,
            promotion: None,
            transport: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn promotion_policy(mut self, policy: Arc<dyn PromotionPolicy>) -> Self {
        self.promotion = Some(policy);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validate the configuration and start the scheduler task. Must be
    /// called from within a tokio runtime.
    pub fn build(self) -> CommsResult<CommsManager> {
        self.config
            .validate()
            .map_err(|e| CommsError::Configuration(format!("invalid engine config: {e}")))?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpExecutor::new(&self.config)?),
        };
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| Arc::new(DefaultRetryPolicy::new()));
        let promotion = self.promotion.unwrap_or_else(|| {
            Arc::new(IntervalPromotionPolicy::new(self.config.promotion_interval_ms))
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(ManagerInner {
            config: self.config,
            cache: self.cache,
            retry_policy,
            promotion,
            transport,
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            shutdown_tx,
        });
        tokio::spawn(Arc::clone(&inner).worker_loop(shutdown_rx));
        Ok(CommsManager { inner })
    }
}
