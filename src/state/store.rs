//! The state store: one job at a time, middleware around every commit.

use crate::error::{panic_message, Result, SwitchboardError};
use crate::types::{SnapshotId, SubscriptionHandle, SubscriptionId};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use super::action::{action_types, StateAction};
use super::document::{json_kind, StateDocument};
use super::history::{History, HistoryEntry};
use super::middleware::{Middleware, PersistenceMiddleware};
use super::reducer::{Reducer, SliceReducer};
use super::snapshot::{Snapshot, SnapshotRegistry};

tokio::task_local! {
    /// Address of the store whose queue the current task is draining.
    static DRAINING_STORE: usize;
}

/// Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// History entries kept, including the current one.
    /// Default: 50
    pub max_history: usize,

    /// Named snapshots kept.
    /// Default: 20
    pub max_snapshots: usize,

    /// Reject patches that address a slice the document does not have.
    /// Default: false
    pub strict_slices: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_history: 50,
            max_snapshots: 20,
            strict_slices: false,
        }
    }
}

/// Name and state of a registered middleware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiddlewareInfo {
    pub name: String,
    pub enabled: bool,
}

type Listener = Arc<dyn Fn(Arc<StateDocument>) + Send + Sync>;

struct ListenerEntry {
    id: SubscriptionId,
    callback: Listener,
    active: AtomicBool,
}

struct MiddlewareSlot {
    middleware: Arc<dyn Middleware>,
    enabled: bool,
}

enum Job {
    Dispatch(StateAction),
    Record(StateAction),
    SetState(Map<String, Value>),
    Undo,
    Redo,
    Restore(SnapshotId),
}

impl Job {
    fn label(&self) -> &str {
        match self {
            Job::Dispatch(action) | Job::Record(action) => &action.action_type,
            Job::SetState(_) => action_types::SET_STATE,
            Job::Undo => action_types::UNDO,
            Job::Redo => action_types::REDO,
            Job::Restore(_) => action_types::RESTORE_SNAPSHOT,
        }
    }
}

/// Result of one job: the state afterwards and whether it moved.
struct JobOutcome {
    state: Arc<StateDocument>,
    changed: bool,
}

struct QueuedJob {
    job: Job,
    reply: oneshot::Sender<Result<JobOutcome>>,
}

struct StoreInner {
    config: StoreConfig,
    reducer: Box<dyn Reducer>,
    current: RwLock<Arc<StateDocument>>,
    history: Mutex<History>,
    snapshots: Mutex<SnapshotRegistry>,
    middleware: RwLock<Vec<MiddlewareSlot>>,
    listeners: RwLock<Vec<Arc<ListenerEntry>>>,
    queue: Mutex<VecDeque<QueuedJob>>,
    /// Set while a drain task owns the queue.
    draining: AtomicBool,
    next_id: AtomicU64,
}

impl StoreInner {
    fn current(&self) -> Arc<StateDocument> {
        Arc::clone(&self.current.read())
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// True on the drain task of this store, where waiting on another job
    /// of the same queue would never resolve.
    fn in_own_job(&self) -> bool {
        DRAINING_STORE
            .try_with(|draining| *draining == self.address())
            .unwrap_or(false)
    }

    fn submit(self: &Arc<Self>, job: Job) -> oneshot::Receiver<Result<JobOutcome>> {
        let (reply, receiver) = oneshot::channel();
        self.queue.lock().push_back(QueuedJob { job, reply });
        self.kick();
        receiver
    }

    /// Start a drain task unless one is already running.
    fn kick(self: &Arc<Self>) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(DRAINING_STORE.scope(self.address(), Arc::clone(self).drain()));
            }
            Err(_) => {
                // Left queued; the next submission from inside a runtime drains it.
                self.draining.store(false, Ordering::SeqCst);
                tracing::warn!("No Tokio runtime; state job stays queued");
            }
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.pop_front() {
                    Some(job) => job,
                    None => {
                        // Cleared under the queue lock so a concurrent submit
                        // either sees the flag down or its job gets popped here.
                        self.draining.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            };

            let label = next.job.label().to_string();
            let outcome = match AssertUnwindSafe(self.run(next.job)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(SwitchboardError::InvalidAction(format!(
                    "{label}: {}",
                    panic_message(panic)
                ))),
            };
            if let Err(e) = &outcome {
                tracing::debug!(action = %label, error = %e, "State job failed");
            }
            // The caller may have stopped waiting.
            let _ = next.reply.send(outcome);
        }
    }

    async fn run(&self, job: Job) -> Result<JobOutcome> {
        match job {
            Job::Dispatch(action) => {
                let (next, action, _) = self.reduce(action).await?;
                self.commit(next, action).await
            }
            Job::Record(action) => {
                let (next, action, patches) = self.reduce(action).await?;
                self.history.lock().rebase(&patches, &next);
                *self.current.write() = Arc::clone(&next);
                tracing::debug!(action = %action.action_type, "State recorded outside history");

                self.publish(&next, &action).await;
                Ok(JobOutcome {
                    state: next,
                    changed: true,
                })
            }
            Job::SetState(partial) => {
                let state = self.current();
                self.check_slices(&state, &partial)?;
                let next = Arc::new(state.apply_patches(&partial));
                let action = StateAction::new(action_types::SET_STATE, Value::Object(partial));
                self.commit(next, action).await
            }
            Job::Undo => {
                let moved = self.history.lock().undo();
                self.move_to(moved, action_types::UNDO).await
            }
            Job::Redo => {
                let moved = self.history.lock().redo();
                self.move_to(moved, action_types::REDO).await
            }
            Job::Restore(id) => {
                let snapshot = self
                    .snapshots
                    .lock()
                    .get(id)
                    .cloned()
                    .ok_or(SwitchboardError::SnapshotNotFound(id))?;
                let action = StateAction::new(
                    action_types::RESTORE_SNAPSHOT,
                    json!({ "id": snapshot.id.0, "label": snapshot.label }),
                );
                self.commit(snapshot.state, action).await
            }
        }
    }

    /// `before` hooks and the reducer. Nothing is committed.
    async fn reduce(
        &self,
        action: StateAction,
    ) -> Result<(Arc<StateDocument>, StateAction, Map<String, Value>)> {
        let state = self.current();
        let chain = self.enabled_middleware();

        let mut action = action;
        for middleware in &chain {
            let name = middleware.name().to_string();
            action = match AssertUnwindSafe(middleware.before(action, &state))
                .catch_unwind()
                .await
            {
                Ok(Ok(action)) => action,
                Ok(Err(e)) => {
                    tracing::debug!(middleware = %name, error = %e, "Action stopped by middleware");
                    return Err(e.into_store_error(&name));
                }
                Err(panic) => {
                    return Err(SwitchboardError::Middleware {
                        middleware: name,
                        message: panic_message(panic),
                    })
                }
            };
        }

        let patches = self.reducer.reduce(&state, &action)?;
        self.check_slices(&state, &patches)?;

        Ok((Arc::new(state.apply_patches(&patches)), action, patches))
    }

    fn check_slices(&self, state: &StateDocument, patches: &Map<String, Value>) -> Result<()> {
        if !self.config.strict_slices {
            return Ok(());
        }
        match patches.keys().find(|name| !state.has_slice(name)) {
            Some(name) => Err(SwitchboardError::UnknownSlice(name.clone())),
            None => Ok(()),
        }
    }

    async fn commit(&self, next: Arc<StateDocument>, action: StateAction) -> Result<JobOutcome> {
        *self.current.write() = Arc::clone(&next);
        self.history.lock().commit(Arc::clone(&next), action.clone());
        tracing::debug!(action = %action.action_type, "State committed");

        self.publish(&next, &action).await;
        Ok(JobOutcome {
            state: next,
            changed: true,
        })
    }

    /// Move to a history position without recording a new entry.
    async fn move_to(&self, target: Option<Arc<StateDocument>>, label: &str) -> Result<JobOutcome> {
        let Some(next) = target else {
            return Ok(JobOutcome {
                state: self.current(),
                changed: false,
            });
        };
        *self.current.write() = Arc::clone(&next);

        let action = StateAction::new(label, Value::Null);
        self.publish(&next, &action).await;
        Ok(JobOutcome {
            state: next,
            changed: true,
        })
    }

    /// Run `after` hooks, then notify listeners.
    async fn publish(&self, state: &Arc<StateDocument>, action: &StateAction) {
        for middleware in self.enabled_middleware() {
            let outcome = AssertUnwindSafe(middleware.after(state, action))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic),
            };
            tracing::warn!(
                middleware = %middleware.name(),
                action = %action.action_type,
                error = %error,
                "Middleware after-hook failed; state kept"
            );
        }

        let listeners: Vec<Arc<ListenerEntry>> = self.listeners.read().clone();
        for entry in listeners {
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }
            let callback = Arc::clone(&entry.callback);
            let state = Arc::clone(state);
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(move || callback(state))) {
                tracing::warn!(
                    subscription = %entry.id,
                    action = %action.action_type,
                    error = %panic_message(panic),
                    "State subscriber failed"
                );
            }
        }
    }

    fn enabled_middleware(&self) -> Vec<Arc<dyn Middleware>> {
        self.middleware
            .read()
            .iter()
            .filter(|slot| slot.enabled)
            .map(|slot| Arc::clone(&slot.middleware))
            .collect()
    }

    fn remove_listener(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.iter().position(|l| l.id == id) {
            Some(pos) => {
                let entry = listeners.remove(pos);
                entry.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// A queued dispatch.
///
/// The job runs whether or not this future is awaited; awaiting it yields
/// the committed document or the error that stopped the action.
#[must_use = "the dispatch runs regardless; await to observe its outcome"]
pub struct PendingDispatch {
    receiver: oneshot::Receiver<Result<JobOutcome>>,
    label: String,
    store: usize,
}

impl Future for PendingDispatch {
    type Output = Result<Arc<StateDocument>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let store = self.store;
        if DRAINING_STORE
            .try_with(|draining| *draining == store)
            .unwrap_or(false)
        {
            // Still queued; it runs once the current job finishes.
            return Poll::Ready(Err(SwitchboardError::ReentrantDispatch(
                std::mem::take(&mut self.label),
            )));
        }
        Pin::new(&mut self.receiver).poll(cx).map(|reply| match reply {
            Ok(outcome) => outcome.map(|o| o.state),
            Err(_) => Err(SwitchboardError::DispatchCancelled),
        })
    }
}

impl std::fmt::Debug for PendingDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDispatch").finish_non_exhaustive()
    }
}

/// Central store for state shared between fragments.
///
/// Every change goes through a FIFO job queue, so dispatches never
/// interleave: middleware, reducer, commit, `after` hooks and subscriber
/// notification of one action all finish before the next action starts.
///
/// Cloning is cheap; every clone shares the same state.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Store over `initial` with the standard slice routes.
    pub fn new(initial: StateDocument) -> Self {
        Self::with_config(initial, StoreConfig::default())
    }

    pub fn with_config(initial: StateDocument, config: StoreConfig) -> Self {
        Self::with_reducer(initial, config, SliceReducer::standard())
    }

    /// Store with a custom reducer.
    pub fn with_reducer(
        initial: StateDocument,
        config: StoreConfig,
        reducer: impl Reducer + 'static,
    ) -> Self {
        let initial = Arc::new(initial);
        Self {
            inner: Arc::new(StoreInner {
                history: Mutex::new(History::new(Arc::clone(&initial), config.max_history)),
                snapshots: Mutex::new(SnapshotRegistry::new(config.max_snapshots)),
                current: RwLock::new(initial),
                config,
                reducer: Box::new(reducer),
                middleware: RwLock::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The current document.
    pub fn get_state(&self) -> Arc<StateDocument> {
        self.inner.current()
    }

    /// Apply a selector to the current document.
    pub fn select<T>(&self, selector: impl FnOnce(&StateDocument) -> T) -> T {
        selector(&self.inner.current())
    }

    /// Dispatch an action and wait for it to commit.
    ///
    /// From inside a middleware hook of this store the action is not queued
    /// and `ReentrantDispatch` is returned; hooks use [`StateStore::enqueue`].
    pub async fn dispatch(&self, action: impl Into<StateAction>) -> Result<Arc<StateDocument>> {
        let action = action.into();
        if self.inner.in_own_job() {
            return Err(SwitchboardError::ReentrantDispatch(action.action_type));
        }
        self.enqueue(action).await
    }

    /// Queue an action without waiting.
    ///
    /// Safe to call from a subscriber or a middleware hook: the action runs
    /// after the current job has finished. Awaiting the returned future from
    /// inside that job yields `ReentrantDispatch` at once; the action still
    /// runs.
    pub fn enqueue(&self, action: impl Into<StateAction>) -> PendingDispatch {
        let action = action.into();
        PendingDispatch {
            label: action.action_type.clone(),
            store: self.inner.address(),
            receiver: self.inner.submit(Job::Dispatch(action)),
        }
    }

    /// Apply an action to the current document and to every history entry,
    /// without adding an entry of its own.
    ///
    /// For bookkeeping that undo and redo must not revert, such as fragment
    /// status. Middleware, the reducer and listeners run as for `dispatch`.
    /// Snapshots are left as they were taken.
    pub async fn record(&self, action: impl Into<StateAction>) -> Result<Arc<StateDocument>> {
        self.run(Job::Record(action.into())).await.map(|o| o.state)
    }

    /// Merge a partial document directly, bypassing `before` hooks and the
    /// reducer. Still recorded in history and still notifies.
    pub async fn set_state(&self, partial: Value) -> Result<Arc<StateDocument>> {
        let partial = match partial {
            Value::Object(map) => map,
            other => {
                return Err(SwitchboardError::InvalidAction(format!(
                    "set_state expects an object keyed by slice, got {}",
                    json_kind(&other)
                )))
            }
        };
        self.run(Job::SetState(partial)).await.map(|o| o.state)
    }

    /// Step back one history entry. `false` at the oldest entry.
    pub async fn undo(&self) -> Result<bool> {
        self.run(Job::Undo).await.map(|o| o.changed)
    }

    /// Step forward one history entry. `false` at the newest entry.
    pub async fn redo(&self) -> Result<bool> {
        self.run(Job::Redo).await.map(|o| o.changed)
    }

    pub fn can_undo(&self) -> bool {
        self.inner.history.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.inner.history.lock().can_redo()
    }

    /// All history entries, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.lock().entries()
    }

    /// Index of the current entry in [`StateStore::history`].
    pub fn history_position(&self) -> usize {
        self.inner.history.lock().cursor()
    }

    /// Forget every entry except the current one.
    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    /// Label the current document.
    pub fn create_snapshot(&self, label: impl Into<String>) -> Snapshot {
        let state = self.inner.current();
        let snapshot = self.inner.snapshots.lock().create(label.into(), state);
        tracing::debug!(snapshot = %snapshot.id, label = %snapshot.label, "Snapshot created");
        snapshot
    }

    /// Make a snapshot's document current. Recorded in history, so it can
    /// be undone.
    pub async fn restore_snapshot(&self, id: SnapshotId) -> Result<Arc<StateDocument>> {
        self.run(Job::Restore(id)).await.map(|o| o.state)
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.inner.snapshots.lock().list()
    }

    pub fn delete_snapshot(&self, id: SnapshotId) -> bool {
        self.inner.snapshots.lock().remove(id)
    }

    /// Append a middleware, enabled.
    pub fn use_middleware(&self, middleware: impl Middleware + 'static) {
        tracing::debug!(middleware = %middleware.name(), "Middleware added");
        self.inner.middleware.write().push(MiddlewareSlot {
            middleware: Arc::new(middleware),
            enabled: true,
        });
    }

    /// Enable or disable every middleware with this name.
    /// Returns false if none matched.
    pub fn toggle_middleware(&self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for slot in self.inner.middleware.write().iter_mut() {
            if slot.middleware.name() == name {
                slot.enabled = enabled;
                found = true;
            }
        }
        found
    }

    /// Registered middleware, in order.
    pub fn middleware(&self) -> Vec<MiddlewareInfo> {
        self.inner
            .middleware
            .read()
            .iter()
            .map(|slot| MiddlewareInfo {
                name: slot.middleware.name().to_string(),
                enabled: slot.enabled,
            })
            .collect()
    }

    /// Register a listener for every committed document.
    ///
    /// Listeners run in registration order after the `after` hooks. A panic
    /// is logged and does not reach other listeners. To dispatch from a
    /// listener use [`StateStore::enqueue`].
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(Arc<StateDocument>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.write().push(Arc::new(ListenerEntry {
            id,
            callback: Arc::new(listener),
            active: AtomicBool::new(true),
        }));

        let inner = Arc::downgrade(&self.inner);
        SubscriptionHandle::new(id, move |id| {
            inner
                .upgrade()
                .map(|inner| inner.remove_listener(id))
                .unwrap_or(false)
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove_listener(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Restore a persisted document and make it the base of the history.
    ///
    /// Returns false when nothing usable was persisted.
    pub async fn hydrate(&self, persistence: &PersistenceMiddleware) -> Result<bool> {
        let Some(saved) = persistence.load() else {
            return Ok(false);
        };
        self.set_state(saved.to_value()).await?;
        self.clear_history();
        tracing::debug!(key = %persistence.key(), "Hydrated state from storage");
        Ok(true)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    async fn run(&self, job: Job) -> Result<JobOutcome> {
        if self.inner.in_own_job() {
            return Err(SwitchboardError::ReentrantDispatch(job.label().to_string()));
        }
        match self.inner.submit(job).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SwitchboardError::DispatchCancelled),
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(StateDocument::standard())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("slices", &self.inner.current().len())
            .field("subscribers", &self.subscriber_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MiddlewareError;
    use crate::state::{KnownAction, LoggingMiddleware};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn theme(name: &str) -> StateAction {
        KnownAction::SetTheme(name.to_string()).into()
    }

    struct Reject;

    #[async_trait]
    impl Middleware for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        async fn before(
            &self,
            _action: StateAction,
            _state: &StateDocument,
        ) -> std::result::Result<StateAction, MiddlewareError> {
            Err(MiddlewareError::Rejected("not today".to_string()))
        }
    }

    struct FailingAfter;

    #[async_trait]
    impl Middleware for FailingAfter {
        fn name(&self) -> &str {
            "failing-after"
        }

        async fn after(
            &self,
            _state: &StateDocument,
            _action: &StateAction,
        ) -> std::result::Result<(), MiddlewareError> {
            Err(MiddlewareError::Failed("disk full".to_string()))
        }
    }

    /// Upper-cases theme names on the way in.
    struct Shout;

    #[async_trait]
    impl Middleware for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        async fn before(
            &self,
            mut action: StateAction,
            _state: &StateDocument,
        ) -> std::result::Result<StateAction, MiddlewareError> {
            if let Some(theme) = action.payload["current"].as_str() {
                action.payload["current"] = json!(theme.to_uppercase());
            }
            Ok(action)
        }
    }

    #[tokio::test]
    async fn test_dispatch_replaces_only_addressed_slice() {
        let store = StateStore::default();
        let before = store.get_state();

        let after = store.dispatch(theme("dark")).await.unwrap();

        assert_eq!(after.get("theme/current"), Some(&json!("dark")));
        assert!(Arc::ptr_eq(
            before.slice("user").unwrap(),
            after.slice("user").unwrap()
        ));
        assert!(Arc::ptr_eq(&store.get_state(), &after));
        // Old document is untouched
        assert_eq!(before.get("theme/current"), Some(&json!("light")));
    }

    #[tokio::test]
    async fn test_before_rejection_leaves_everything_untouched() {
        let store = StateStore::default();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let _sub = store.subscribe(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });
        store.use_middleware(Reject);
        let before = store.get_state();

        let err = store.dispatch(theme("dark")).await.unwrap_err();

        assert!(matches!(err, SwitchboardError::ActionRejected { ref middleware, .. } if middleware == "reject"));
        assert!(Arc::ptr_eq(&before, &store.get_state()));
        assert_eq!(store.history().len(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_after_failure_still_commits() {
        let store = StateStore::default();
        store.use_middleware(FailingAfter);

        store.dispatch(theme("dark")).await.unwrap();
        assert_eq!(store.get_state().get("theme/current"), Some(&json!("dark")));
    }

    #[tokio::test]
    async fn test_middleware_transforms_and_toggles() {
        let store = StateStore::default();
        store.use_middleware(LoggingMiddleware::new());
        store.use_middleware(Shout);

        store.dispatch(theme("dark")).await.unwrap();
        assert_eq!(store.get_state().get("theme/current"), Some(&json!("DARK")));

        assert!(store.toggle_middleware("shout", false));
        assert!(!store.toggle_middleware("missing", false));
        store.dispatch(theme("light")).await.unwrap();
        assert_eq!(store.get_state().get("theme/current"), Some(&json!("light")));

        assert_eq!(
            store.middleware(),
            vec![
                MiddlewareInfo { name: "logging".to_string(), enabled: true },
                MiddlewareInfo { name: "shout".to_string(), enabled: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_undo_redo_and_truncation() {
        let store = StateStore::default();
        store.dispatch(theme("dark")).await.unwrap();
        store.dispatch(theme("blue")).await.unwrap();

        assert!(store.undo().await.unwrap());
        assert_eq!(store.get_state().get("theme/current"), Some(&json!("dark")));
        assert!(store.undo().await.unwrap());
        assert!(!store.undo().await.unwrap());
        assert_eq!(store.get_state().get("theme/current"), Some(&json!("light")));

        assert!(store.redo().await.unwrap());
        store.dispatch(theme("green")).await.unwrap();
        assert!(!store.can_redo());
        assert!(!store.redo().await.unwrap());
        assert_eq!(store.history().len(), 3);
    }

    #[tokio::test]
    async fn test_undo_at_start_does_not_notify() {
        let store = StateStore::default();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let _sub = store.subscribe(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!store.undo().await.unwrap());
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_restore_is_undoable() {
        let store = StateStore::default();
        store.dispatch(theme("dark")).await.unwrap();
        let snapshot = store.create_snapshot("dark-mode");
        store.dispatch(theme("blue")).await.unwrap();

        let restored = store.restore_snapshot(snapshot.id).await.unwrap();
        assert!(Arc::ptr_eq(&restored, &snapshot.state));
        assert_eq!(
            store.history().last().unwrap().action.action_type,
            action_types::RESTORE_SNAPSHOT
        );

        store.undo().await.unwrap();
        assert_eq!(store.get_state().get("theme/current"), Some(&json!("blue")));

        assert!(store.delete_snapshot(snapshot.id));
        assert!(matches!(
            store.restore_snapshot(snapshot.id).await,
            Err(SwitchboardError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_state_bypasses_before_hooks() {
        let store = StateStore::default();
        store.use_middleware(Reject);

        store
            .set_state(json!({"locale": {"current": "fr"}}))
            .await
            .unwrap();
        assert_eq!(store.get_state().get("locale/current"), Some(&json!("fr")));
        assert_eq!(
            store.history().last().unwrap().action.action_type,
            action_types::SET_STATE
        );
        assert!(store.set_state(json!("nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_strict_slices() {
        let store = StateStore::with_config(
            StateDocument::standard(),
            StoreConfig {
                strict_slices: true,
                ..Default::default()
            },
        );
        let err = store
            .dispatch(StateAction::new(
                action_types::MERGE_STATE,
                json!({"cart": {"items": []}}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::UnknownSlice(ref s) if s == "cart"));

        // Lenient stores create the slice
        let lenient = StateStore::default();
        lenient
            .dispatch(StateAction::new(
                action_types::MERGE_STATE,
                json!({"cart": {"items": []}}),
            ))
            .await
            .unwrap();
        assert!(lenient.get_state().has_slice("cart"));
    }

    #[tokio::test]
    async fn test_subscriber_panic_is_isolated() {
        let store = StateStore::default();
        let _bad = store.subscribe(|_| panic!("listener blew up"));
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let _good = store.subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        store.dispatch(theme("dark")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reentrant_enqueue_runs_after_current_job() {
        let store = StateStore::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let s = store.clone();
        let o = order.clone();
        let _sub = store.subscribe(move |state| {
            let current = state.get("theme/current").cloned().unwrap_or(Value::Null);
            o.lock().push(current.clone());
            let locale_set = state.get("locale/current") == Some(&json!("de"));
            if current == json!("dark") && !locale_set {
                // Fire and forget
                let _ = s.enqueue(KnownAction::SetLocale("de".to_string()));
            }
        });

        store.dispatch(theme("dark")).await.unwrap();
        // The queued follow-up commits before this one
        store.dispatch(theme("blue")).await.unwrap();

        let actions: Vec<_> = store
            .history()
            .into_iter()
            .map(|e| e.action.action_type)
            .collect();
        assert_eq!(actions, vec!["@@INIT", "SET_THEME", "SET_LOCALE", "SET_THEME"]);
        assert_eq!(order.lock().len(), 3);
    }

    /// Awaits the store it is installed on from inside its own hooks.
    struct Echo {
        store: StateStore,
        outcomes: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn before(
            &self,
            action: StateAction,
            _state: &StateDocument,
        ) -> std::result::Result<StateAction, MiddlewareError> {
            if action.action_type == action_types::SET_LOCALE {
                let outcome = match self.store.undo().await {
                    Ok(moved) => format!("undo: {moved}"),
                    Err(e) => e.to_string(),
                };
                self.outcomes.lock().push(outcome);
            }
            Ok(action)
        }

        async fn after(
            &self,
            _state: &StateDocument,
            action: &StateAction,
        ) -> std::result::Result<(), MiddlewareError> {
            if action.action_type == action_types::SET_THEME {
                let waited = self.store.dispatch(KnownAction::SetLocale("de".into())).await;
                self.outcomes.lock().push(format!("{:?}", waited.err()));
                let queued = self.store.enqueue(KnownAction::SetLocale("fr".into())).await;
                self.outcomes.lock().push(format!("{:?}", queued.err()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_awaiting_own_store_do_not_wedge_queue() {
        let store = StateStore::default();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        store.use_middleware(Echo {
            store: store.clone(),
            outcomes: outcomes.clone(),
        });

        let committed = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            store.dispatch(theme("dark")),
        )
        .await
        .expect("dispatch finished")
        .unwrap();
        assert_eq!(committed.get("theme/current"), Some(&json!("dark")));

        // The enqueued follow-up still runs, after the outer job
        let later = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            store.dispatch(KnownAction::SetUser(json!({"id": 7}))),
        )
        .await
        .expect("queue still drains")
        .unwrap();
        assert_eq!(later.get("locale/current"), Some(&json!("fr")));

        let outcomes = outcomes.lock().clone();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].contains("ReentrantDispatch(\"SET_LOCALE\")"));
        assert!(outcomes[1].contains("ReentrantDispatch(\"SET_LOCALE\")"));
        // The queued SET_LOCALE ran its before hook, which tried to undo
        assert!(outcomes[2].contains("@@UNDO"));

        let actions: Vec<_> = store
            .history()
            .into_iter()
            .map(|e| e.action.action_type)
            .collect();
        assert_eq!(actions, vec!["@@INIT", "SET_THEME", "SET_LOCALE", "SET_USER"]);
    }

    #[tokio::test]
    async fn test_listeners_added_or_removed_mid_round() {
        let store = StateStore::default();
        let calls = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let victim: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let added = Arc::new(AtomicBool::new(false));
        let (s, c, v, a) = (store.clone(), calls.clone(), victim.clone(), added.clone());
        let _first = store.subscribe(move |_| {
            c.lock().push("a");
            // Remove the sibling that has not run yet
            if let Some(handle) = v.lock().take() {
                handle.unsubscribe();
            }
            if !a.swap(true, Ordering::SeqCst) {
                let c = c.clone();
                // Dropping the handle keeps the listener
                let _ = s.subscribe(move |_| c.lock().push("late"));
            }
        });
        let c = calls.clone();
        *victim.lock() = Some(store.subscribe(move |_| c.lock().push("b")));

        store.dispatch(theme("dark")).await.unwrap();
        assert_eq!(*calls.lock(), vec!["a"]);

        store.dispatch(theme("light")).await.unwrap();
        assert_eq!(*calls.lock(), vec!["a", "a", "late"]);
    }

    #[tokio::test]
    async fn test_record_rebases_history() {
        let store = StateStore::default();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let _sub = store.subscribe(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        store.dispatch(theme("dark")).await.unwrap();
        store.dispatch(theme("blue")).await.unwrap();
        store.undo().await.unwrap();

        let recorded = store
            .record(KnownAction::SetLocale("de".into()))
            .await
            .unwrap();
        assert_eq!(recorded.get("theme/current"), Some(&json!("dark")));
        assert_eq!(notified.load(Ordering::SeqCst), 4);

        // No new entry, and the redo branch survives
        assert_eq!(store.history().len(), 3);
        assert!(store.can_redo());
        for entry in store.history() {
            assert_eq!(entry.state.get("locale/current"), Some(&json!("de")));
        }
        assert!(Arc::ptr_eq(&store.history()[1].state, &store.get_state()));

        store.redo().await.unwrap();
        let state = store.get_state();
        assert_eq!(state.get("theme/current"), Some(&json!("blue")));
        assert_eq!(state.get("locale/current"), Some(&json!("de")));
    }

    #[tokio::test]
    async fn test_bounded_history() {
        let store = StateStore::with_config(
            StateDocument::standard(),
            StoreConfig {
                max_history: 3,
                ..Default::default()
            },
        );
        for name in ["a", "b", "c", "d"] {
            store.dispatch(theme(name)).await.unwrap();
        }
        assert_eq!(store.history().len(), 3);
        assert_eq!(store.history_position(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let store = StateStore::default();
        let handle = store.subscribe(|_| {});
        let id = handle.id();
        assert_eq!(store.subscriber_count(), 1);
        assert!(handle.unsubscribe());
        assert!(!store.unsubscribe(id));
    }
}
