use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::auth::Auth;
use crate::error::{AuthNotFound, CallError, Cancelled};
use crate::events::{Event, EventHub, QuarantineReason};
use crate::executor::{Options, ProviderExecutor, Request, StreamReceiver};
use crate::index::scope_key;
use crate::selector::StickySelector;

const RATE_LIMIT_FALLBACK_SECS: u64 = 30;
const SHORT_COOLDOWN_SECS: u64 = 10;

/// Owns the live credential set and drives calls through it.
///
/// For each call the manager walks the candidate providers in order, lets the
/// sticky selector pick an auth among that provider's selectable credentials,
/// and dispatches to the provider's executor. Retriable failures quarantine
/// the auth, purge its sticky bindings for the scope, and move on to the next
/// candidate; terminal failures surface unchanged.
pub struct AuthManager {
    auths: Arc<RwLock<AuthSet>>,
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
    selector: StickySelector,
    events: EventHub,
    queue: Arc<RecoveryQueue>,
}

#[derive(Default)]
pub(crate) struct AuthSet {
    by_id: HashMap<String, Auth>,
    /// Per-provider id list in insertion order; selection depends on a
    /// stable candidate order for round-robin fairness.
    order: HashMap<String, Vec<String>>,
}

impl AuthSet {
    fn insert(&mut self, auth: Auth) {
        let ids = self.order.entry(auth.provider.clone()).or_default();
        if !ids.contains(&auth.id) {
            ids.push(auth.id.clone());
        }
        self.by_id.insert(auth.id.clone(), auth);
    }

    fn selectable(&self, provider: &str, now: Instant) -> Vec<Auth> {
        let Some(ids) = self.order.get(provider) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|auth| auth.is_selectable(now))
            .cloned()
            .collect()
    }
}

impl AuthManager {
    /// Must be constructed inside a tokio runtime: the quarantine recovery
    /// task starts immediately.
    pub fn new(
        executors: HashMap<String, Arc<dyn ProviderExecutor>>,
        selector: StickySelector,
        events: EventHub,
    ) -> Arc<Self> {
        let auths = Arc::new(RwLock::new(AuthSet::default()));
        let queue = Arc::new(RecoveryQueue::new());
        queue
            .clone()
            .spawn_recover_task(auths.clone(), events.clone());
        Arc::new(Self {
            auths,
            executors,
            selector,
            events,
            queue,
        })
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub async fn upsert_auth(&self, auth: Auth) {
        self.auths.write().await.insert(auth);
    }

    /// Replaces the whole credential set, e.g. on config reload.
    pub async fn replace_all(&self, auths: Vec<Auth>) {
        let mut set = self.auths.write().await;
        *set = AuthSet::default();
        for auth in auths {
            set.insert(auth);
        }
    }

    pub async fn get_by_id(&self, auth_id: &str) -> Option<Auth> {
        self.auths.read().await.by_id.get(auth_id).cloned()
    }

    /// Disables the auth and purges its sticky bindings in every scope the
    /// selector has served for its provider, so future requests stop
    /// sticking to a dead credential.
    pub async fn disable_and_invalidate(&self, auth_id: &str, cause: &str) -> usize {
        let provider = {
            let mut set = self.auths.write().await;
            let Some(auth) = set.by_id.get_mut(auth_id) else {
                return 0;
            };
            auth.disabled = true;
            auth.provider.clone()
        };
        self.events.emit(Event::AuthDisabled {
            auth_id: auth_id.to_string(),
            cause: cause.to_string(),
        });
        let removed = self
            .selector
            .invalidate_auth_everywhere(&provider, auth_id)
            .await;
        if removed > 0 {
            self.events.emit(Event::BindingsInvalidated {
                scope: format!("{provider}|*"),
                auth_id: auth_id.to_string(),
                removed,
            });
        }
        removed
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        providers: &[String],
        req: &Request,
        opts: &Options,
    ) -> Result<Bytes, CallError> {
        self.run(cancel, providers, req, opts, |executor, auth| async move {
            executor.call(cancel, &auth, req, opts).await
        })
        .await
    }

    pub async fn execute_count(
        &self,
        cancel: &CancellationToken,
        providers: &[String],
        req: &Request,
        opts: &Options,
    ) -> Result<Bytes, CallError> {
        self.run(cancel, providers, req, opts, |executor, auth| async move {
            executor.call_count(cancel, &auth, req, opts).await
        })
        .await
    }

    /// Retries only while establishing the stream; once a chunk channel is
    /// handed out, mid-stream failures belong to the stream itself.
    pub async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        providers: &[String],
        req: &Request,
        opts: &Options,
    ) -> Result<StreamReceiver, CallError> {
        self.run(cancel, providers, req, opts, |executor, auth| async move {
            executor.call_stream(cancel, &auth, req, opts).await
        })
        .await
    }

    async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        providers: &[String],
        req: &Request,
        opts: &Options,
        mut attempt: F,
    ) -> Result<T, CallError>
    where
        F: FnMut(Arc<dyn ProviderExecutor>, Auth) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut last_err: Option<CallError> = None;
        for provider in providers {
            let Some(executor) = self.executors.get(provider.as_str()) else {
                continue;
            };
            loop {
                if cancel.is_cancelled() {
                    return Err(Cancelled.into());
                }
                let candidates = {
                    let set = self.auths.read().await;
                    set.selectable(provider, Instant::now())
                };
                if candidates.is_empty() {
                    break;
                }
                let auth = match self
                    .selector
                    .pick(provider, &req.model, opts, &candidates)
                    .await
                {
                    Ok(auth) => auth,
                    Err(_) => break,
                };

                match attempt(executor.clone(), auth.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        if cancel.is_cancelled() {
                            return Err(Cancelled.into());
                        }
                        if !is_retriable(&err) {
                            return Err(err);
                        }
                        let (window, reason) = quarantine_window(&err);
                        warn!(
                            auth_id = %auth.id,
                            provider = %provider,
                            model = %req.model,
                            error = %err,
                            cooldown_secs = window.as_secs(),
                            "upstream call failed; quarantining auth"
                        );
                        self.quarantine(&auth, &req.model, window, reason).await;
                        last_err = Some(err);
                    }
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Err(AuthNotFound.into()),
        }
    }

    async fn quarantine(
        &self,
        auth: &Auth,
        model: &str,
        window: Duration,
        reason: QuarantineReason,
    ) {
        let until = Instant::now() + window;
        {
            let mut set = self.auths.write().await;
            if let Some(entry) = set.by_id.get_mut(&auth.id) {
                entry.quarantined_until = Some(until);
            }
        }
        self.queue.push(until, auth.id.clone()).await;
        self.events.emit(Event::QuarantineStart {
            auth_id: auth.id.clone(),
            provider: auth.provider.clone(),
            reason,
            until: SystemTime::now()
                .checked_add(window)
                .unwrap_or_else(SystemTime::now),
        });

        let scope = scope_key(&auth.provider, model);
        let removed = self.selector.invalidate_auth(&scope, &auth.id).await;
        if removed > 0 {
            self.events.emit(Event::BindingsInvalidated {
                scope,
                auth_id: auth.id.clone(),
                removed,
            });
        }
    }
}

/// Network errors and 408/425/429/5xx may succeed on another credential;
/// other 4xx statuses will fail identically everywhere.
fn is_retriable(err: &CallError) -> bool {
    match err.status_code() {
        None => true,
        Some(status) => {
            matches!(status.as_u16(), 408 | 425 | 429) || status.is_server_error()
        }
    }
}

fn quarantine_window(err: &CallError) -> (Duration, QuarantineReason) {
    match err.status_code() {
        Some(status) if status.as_u16() == 429 => {
            let window = err
                .headers()
                .and_then(parse_retry_after)
                .filter(|window| !window.is_zero())
                .unwrap_or(Duration::from_secs(RATE_LIMIT_FALLBACK_SECS));
            (window, QuarantineReason::RateLimit)
        }
        Some(status) if status.is_server_error() => (
            Duration::from_secs(SHORT_COOLDOWN_SECS),
            QuarantineReason::Upstream5xx,
        ),
        _ => (
            Duration::from_secs(SHORT_COOLDOWN_SECS),
            QuarantineReason::Network,
        ),
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Min-heap of quarantine deadlines with a single waiter task that flips
/// credentials back to selectable and publishes the recovery event.
///
/// Selection does not depend on this task's timing: `is_selectable` treats an
/// elapsed deadline as available on its own.
struct RecoveryQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    notify: Notify,
}

impl RecoveryQueue {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    async fn push(&self, until: Instant, auth_id: String) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((until, auth_id)));
        }
        // Always notify: the task re-computes the next deadline.
        self.notify.notify_one();
    }

    fn spawn_recover_task(self: Arc<Self>, auths: Arc<RwLock<AuthSet>>, events: EventHub) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((deadline, _))| *deadline)
                };
                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some(deadline) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {}
                            _ = self.notify.notified() => continue,
                        }
                    }
                }

                let now = Instant::now();
                let mut due: Vec<String> = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((deadline, _))) = heap.peek() {
                        if *deadline > now {
                            break;
                        }
                        if let Some(Reverse((_, auth_id))) = heap.pop() {
                            due.push(auth_id);
                        }
                    }
                }
                if due.is_empty() {
                    continue;
                }

                // Guard against stale entries: a later quarantine may have
                // extended the deadline past this one.
                let mut set = auths.write().await;
                for auth_id in due {
                    let Some(auth) = set.by_id.get_mut(&auth_id) else {
                        continue;
                    };
                    if matches!(auth.quarantined_until, Some(until) if until <= now) {
                        auth.quarantined_until = None;
                        events.emit(Event::QuarantineEnd { auth_id });
                    }
                }
            }
        });
    }
}
