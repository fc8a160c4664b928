//! Controller runtime: drives a [`Reconciler`] over every record of a kind.
//!
//! Keys are record names within the configured namespace. A key is
//! scheduled by store change events, by a periodic resync, by the webhook
//! route through a [`QueueHandle`], and by the reconciler's own [`Action`].
//! At most one reconcile per key runs at a time; a key that becomes due
//! while in flight runs again once the current pass finishes. Different keys
//! run in parallel up to the worker limit.

pub mod environment;
pub mod instance;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex, Notify, Semaphore};
use tokio::time::Instant;

use crate::config::timings;
use crate::error::Error;
use crate::models::{Labels, Resource};
use crate::store::{Api, ObjectStore};

/// What the controller does with a key after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Requeue(Duration),
    /// Nothing to do until the record changes or the next resync.
    AwaitChange,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Action::Requeue(after)
    }

    pub fn await_change() -> Self {
        Action::AwaitChange
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Object: Resource;

    /// Controller name used in logs and metrics.
    const NAME: &'static str;

    async fn reconcile(&self, object: Self::Object) -> Result<Action, Error>;

    /// Retry policy for errors the reconciler did not handle itself.
    fn error_policy(&self, _object: &Self::Object, error: &Error) -> Action {
        default_error_policy(error)
    }
}

/// Not-found is done, a lost race retries quickly, anything else after the
/// stage retry interval.
pub fn default_error_policy(error: &Error) -> Action {
    if error.is_not_found() {
        Action::await_change()
    } else if error.is_conflict() {
        Action::requeue(timings::CONFLICT_RETRY)
    } else {
        Action::requeue(timings::STAGE_RETRY)
    }
}

// ── Work queue ──

#[derive(Default)]
struct QueueState {
    /// Scheduled keys and when they become due.
    pending: HashMap<String, Instant>,
    in_flight: HashSet<String>,
}

impl QueueState {
    /// Keep the earliest due time for a key.
    fn schedule(&mut self, key: &str, due: Instant) {
        self.pending
            .entry(key.to_string())
            .and_modify(|existing| {
                if due < *existing {
                    *existing = due;
                }
            })
            .or_insert(due);
    }

    /// Claim the next due key that is not already running.
    fn claim_due(&mut self, now: Instant) -> Option<String> {
        let key = self
            .pending
            .iter()
            .filter(|(key, due)| **due <= now && !self.in_flight.contains(*key))
            .min_by_key(|(_, due)| **due)
            .map(|(key, _)| key.clone())?;
        self.pending.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Earliest due time among keys that could be claimed.
    fn next_due(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter(|(key, _)| !self.in_flight.contains(*key))
            .map(|(_, due)| *due)
            .min()
    }
}

/// Schedules keys on a running controller.
#[derive(Clone)]
pub struct QueueHandle {
    state: Arc<Mutex<QueueState>>,
    wake: Arc<Notify>,
}

impl QueueHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Reconcile `name` as soon as possible.
    pub async fn enqueue(&self, name: &str) {
        self.state.lock().await.schedule(name, Instant::now());
        self.wake.notify_one();
    }

    async fn finish(&self, name: &str, action: Action) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(name);
        if let Action::Requeue(after) = action {
            state.schedule(name, Instant::now() + after);
        }
        drop(state);
        self.wake.notify_one();
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

// ── Controller ──

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    api: Api<R::Object>,
    store: Arc<dyn ObjectStore>,
    queue: QueueHandle,
    workers: usize,
    resync: Duration,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: Arc<R>,
        store: Arc<dyn ObjectStore>,
        namespace: &str,
        workers: usize,
        resync: Duration,
    ) -> Self {
        Self {
            reconciler,
            api: Api::namespaced(store.clone(), namespace),
            store,
            queue: QueueHandle::new(),
            workers: workers.max(1),
            resync,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.queue.clone()
    }

    /// Run until `shutdown` flips to true, then wait for in-flight passes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            controller = R::NAME,
            workers = self.workers,
            resync_secs = self.resync.as_secs(),
            "Controller started"
        );

        let watcher = tokio::spawn(watch_changes::<R::Object>(
            self.store.subscribe(),
            self.api.clone(),
            self.queue.clone(),
        ));
        let resyncer = tokio::spawn(resync_loop(
            self.api.clone(),
            self.queue.clone(),
            self.resync,
        ));

        let semaphore = Arc::new(Semaphore::new(self.workers));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = self.queue.state.lock().await.claim_due(Instant::now());
            if let Some(key) = claimed {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let reconciler = self.reconciler.clone();
                let api = self.api.clone();
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    let action = process(reconciler.as_ref(), &api, &key).await;
                    queue.finish(&key, action).await;
                    drop(permit);
                });
                continue;
            }

            let (next_due, depth) = {
                let state = self.queue.state.lock().await;
                (state.next_due(), state.pending.len())
            };
            crate::metrics::queue_depth(R::NAME, depth);
            let sleep_until = next_due.unwrap_or_else(|| Instant::now() + self.resync);

            tokio::select! {
                _ = tokio::time::sleep_until(sleep_until) => {}
                _ = self.queue.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        watcher.abort();
        resyncer.abort();
        // every permit back means every in-flight pass finished
        let _ = semaphore.acquire_many(self.workers as u32).await;
        tracing::info!(controller = R::NAME, "Controller stopped");
    }
}

/// One reconcile pass for `key`.
async fn process<R: Reconciler>(reconciler: &R, api: &Api<R::Object>, key: &str) -> Action {
    let object = match api.get_opt(key).await {
        Ok(Some(object)) => object,
        Ok(None) => {
            tracing::debug!(controller = R::NAME, key, "Record gone, dropping key");
            return Action::await_change();
        }
        Err(e) => {
            tracing::warn!(controller = R::NAME, key, error = %e, "Fetching record failed");
            crate::metrics::reconcile_finished(R::NAME, "error");
            return Action::requeue(timings::STAGE_RETRY);
        }
    };

    match reconciler.reconcile(object.clone()).await {
        Ok(action) => {
            crate::metrics::reconcile_finished(R::NAME, "ok");
            action
        }
        Err(e) => {
            let action = reconciler.error_policy(&object, &e);
            if e.is_not_found() || e.is_conflict() {
                tracing::debug!(controller = R::NAME, key, error = %e, ?action, "Reconcile raced");
            } else {
                tracing::error!(controller = R::NAME, key, error = %e, ?action, "Reconcile failed");
            }
            crate::metrics::reconcile_finished(R::NAME, "error");
            action
        }
    }
}

async fn watch_changes<K: Resource>(
    mut events: broadcast::Receiver<crate::store::ObjectRef>,
    api: Api<K>,
    queue: QueueHandle,
) {
    loop {
        match events.recv().await {
            Ok(changed) => {
                if changed.kind == K::KIND && changed.namespace == api.namespace() {
                    queue.enqueue(&changed.name).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(kind = %K::KIND, missed, "Change stream lagged, resyncing");
                enqueue_all(&api, &queue).await;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn resync_loop<K: Resource>(api: Api<K>, queue: QueueHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        enqueue_all(&api, &queue).await;
    }
}

async fn enqueue_all<K: Resource>(api: &Api<K>, queue: &QueueHandle) {
    match api.list(&Labels::new()).await {
        Ok(objects) => {
            for object in objects {
                queue.enqueue(object.name()).await;
            }
        }
        Err(e) => tracing::warn!(kind = %K::KIND, error = %e, "Resync listing failed"),
    }
}
