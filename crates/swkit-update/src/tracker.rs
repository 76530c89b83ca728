//! Registration and update tracking.
//!
//! One [`UpdateTracker`] per page. It registers the worker, records every
//! newly detected candidate worker, and drives a candidate through
//! activation up to the controller hand-over.
//!
//! ```text
//! register ──► registration ──► updatefound ──┐
//!                   │                          ├─► track_candidate ──► update signal
//! check_for_update ─┴─► update() ─► installing ┘        (dedup by WorkerId)
//!
//! activate_update: installed ─ skipWaiting ─► activating ─► activated
//!                                                            │
//!                               controllerchange ◄───────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use hashbrown::HashSet;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use swkit_channel::{send_message, Message};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::host::{
    Container, PageReload, RegistrationOptions, RegistrationRef, WorkerHandle, WorkerId,
    WorkerState,
};
use crate::signal::{ListenerId, Signal};
use crate::UpdateError;

type SharedRegistration = Shared<BoxFuture<'static, Option<RegistrationRef>>>;
type Callback = Box<dyn FnOnce() + Send>;

// ==================== Options ====================

/// Callbacks invoked while an update is activated.
#[derive(Default)]
pub struct ActivateOptions {
    on_activating: Option<Callback>,
    on_activated: Option<Callback>,
    on_becomes_controller: Option<Callback>,
}

impl fmt::Debug for ActivateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivateOptions")
            .field("on_activating", &self.on_activating.is_some())
            .field("on_activated", &self.on_activated.is_some())
            .field("on_becomes_controller", &self.on_becomes_controller.is_some())
            .finish()
    }
}

impl ActivateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_activating(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_activating = Some(Box::new(callback));
        self
    }

    pub fn on_activated(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_activated = Some(Box::new(callback));
        self
    }

    pub fn on_becomes_controller(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_becomes_controller = Some(Box::new(callback));
        self
    }
}

fn run(callback: Option<Callback>) {
    if let Some(callback) = callback {
        callback();
    }
}

// ==================== Update ====================

/// A candidate worker that is not active yet.
#[derive(Debug, Clone)]
pub struct Update {
    pub worker: WorkerHandle,
    /// The page is controlled, so activation hands control to the candidate.
    pub will_become_controller: bool,
    /// Activation will reload the page.
    pub navigator_will_reload: bool,
}

impl Update {
    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }
}

// ==================== Tracker ====================

#[derive(Default)]
struct TrackerState {
    registration: Option<SharedRegistration>,
    unregister_tx: Option<Arc<watch::Sender<bool>>>,
    /// Worker current when the registration resolved.
    worker: Option<WorkerHandle>,
    /// Candidate worker.
    update: Option<WorkerHandle>,
    /// Every candidate reported so far.
    seen: HashSet<WorkerId>,
}

struct Inner {
    container: Option<Arc<dyn Container>>,
    reload: Arc<dyn PageReload>,
    state: Mutex<TrackerState>,
    update_signal: Signal,
    refreshing: AtomicBool,
    auto_reload: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.auto_reload.get_mut().take() {
            task.abort();
        }
    }
}

impl Inner {
    /// Record `worker` as the candidate. Returns whether it is a candidate
    /// at all, that is, not the worker current at registration.
    fn track_candidate(self: &Arc<Self>, worker: WorkerHandle) -> bool {
        let id = worker.id();
        {
            let mut state = self.state.lock();
            if state.worker.as_ref().is_some_and(|current| current.id() == id) {
                debug!(worker = ?id, "Worker current at registration is not an update");
                return false;
            }
            if !state.seen.insert(id) {
                debug!(worker = ?id, "Update already known");
                return true;
            }
            info!(worker = ?id, state = %worker.state(), "Found a worker update");
            state.update = Some(worker.clone());
        }

        self.forget_when_settled(&worker);
        self.update_signal.emit();
        true
    }

    /// Drop the candidate once it is active or superseded.
    fn forget_when_settled(self: &Arc<Self>, worker: &WorkerHandle) {
        let id = worker.id();
        let mut states = worker.subscribe_state();
        let tracker = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                if matches!(state, WorkerState::Activated | WorkerState::Redundant) {
                    if let Some(inner) = tracker.upgrade() {
                        if inner.clear_update(id) {
                            debug!(worker = ?id, %state, "Update settled");
                        }
                    }
                    return;
                }
                if states.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    fn clear_update(&self, id: WorkerId) -> bool {
        let mut state = self.state.lock();
        if state.update.as_ref().is_some_and(|w| w.id() == id) {
            state.update = None;
            true
        } else {
            false
        }
    }

    fn auto_reload_enabled(&self) -> bool {
        self.auto_reload.lock().is_some()
    }
}

/// Page-side registration and update tracker.
///
/// Must be created inside a Tokio runtime: registration and browser
/// notifications are followed by background tasks.
#[derive(Clone)]
pub struct UpdateTracker {
    inner: Arc<Inner>,
}

impl fmt::Debug for UpdateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("UpdateTracker")
            .field("can_use_service_worker", &self.inner.container.is_some())
            .field("registered", &state.registration.is_some())
            .field("worker", &state.worker.as_ref().map(|w| w.id()))
            .field("update", &state.update.as_ref().map(|w| w.id()))
            .finish()
    }
}

impl UpdateTracker {
    /// Track workers of `container`, reloading the page through `reload`
    /// when a new worker takes control.
    pub fn new(container: Arc<dyn Container>, reload: Arc<dyn PageReload>) -> Self {
        Self::build(Some(container), reload)
    }

    /// Tracker for a page without service worker support. Every operation
    /// degrades to a no-op.
    pub fn unsupported() -> Self {
        Self::build(None, Arc::new(|| {}))
    }

    fn build(container: Option<Arc<dyn Container>>, reload: Arc<dyn PageReload>) -> Self {
        let inner = Arc::new(Inner {
            container,
            reload,
            state: Mutex::new(TrackerState::default()),
            update_signal: Signal::new(),
            refreshing: AtomicBool::new(false),
            auto_reload: Mutex::new(None),
        });

        if let Some(ref container) = inner.container {
            let task = spawn_auto_reload(&inner, container.as_ref());
            *inner.auto_reload.lock() = Some(task);
        }

        Self { inner }
    }

    // ==================== Registration ====================

    pub fn can_use_service_worker(&self) -> bool {
        self.inner.container.is_some()
    }

    /// Whether `register` was called (and not undone).
    pub fn service_worker_is_available(&self) -> bool {
        self.inner.state.lock().registration.is_some()
    }

    /// Register the worker script.
    ///
    /// Registration completes in the background; failures are logged and
    /// leave the tracker without a worker. Calling `register` again while a
    /// registration exists returns a handle on that registration.
    pub fn register(&self, script_url: &str, options: RegistrationOptions) -> RegistrationHandle {
        let Some(container) = self.inner.container.clone() else {
            warn!("Service workers are not available, register does nothing");
            return RegistrationHandle::default();
        };

        let mut state = self.inner.state.lock();
        if let (Some(_), Some(tx)) = (&state.registration, &state.unregister_tx) {
            debug!(%script_url, "Worker already registered");
            return RegistrationHandle {
                tracker: Arc::downgrade(&self.inner),
                unregister_tx: Some(tx.clone()),
            };
        }

        info!(%script_url, scope = ?options.scope, "Registering service worker");
        let script_url = script_url.to_string();
        let tracker = Arc::downgrade(&self.inner);
        let registration: SharedRegistration = async move {
            match container.register(&script_url, &options).await {
                Ok(registration) => {
                    // Recorded before any awaiter resumes.
                    if let Some(inner) = tracker.upgrade() {
                        let current = registration
                            .installing()
                            .or_else(|| registration.waiting())
                            .or_else(|| registration.active());
                        debug!(worker = ?current.as_ref().map(|w| w.id()), "Registration ready");
                        let mut state = inner.state.lock();
                        if state.registration.is_some() {
                            state.worker = current;
                        }
                    }
                    Some(registration)
                }
                Err(err) => {
                    warn!(%script_url, error = %err, "Service worker registration failed");
                    None
                }
            }
        }
        .boxed()
        .shared();

        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        state.registration = Some(registration.clone());
        state.unregister_tx = Some(tx.clone());
        drop(state);

        tokio::spawn(follow_registration(
            Arc::downgrade(&self.inner),
            registration,
            rx,
        ));

        RegistrationHandle {
            tracker: Arc::downgrade(&self.inner),
            unregister_tx: Some(tx),
        }
    }

    /// The registration, once it resolved. `None` when `register` was not
    /// called or failed.
    pub async fn registration(&self) -> Option<RegistrationRef> {
        let registration = self.inner.state.lock().registration.clone()?;
        registration.await
    }

    // ==================== Updates ====================

    /// Ask the browser to revalidate the worker script.
    ///
    /// Returns whether an installing or waiting candidate exists afterwards.
    /// The worker current at registration is not a candidate.
    pub async fn check_for_update(&self) -> Result<bool, UpdateError> {
        if self.inner.container.is_none() {
            warn!("Service workers are not available, check_for_update does nothing");
            return Ok(false);
        }
        let Some(registration) = self.inner.state.lock().registration.clone() else {
            warn!("register must be called before check_for_update");
            return Err(UpdateError::NotRegistered);
        };
        let Some(registration) = registration.await else {
            return Ok(false);
        };

        registration.update().await?;

        if let Some(installing) = registration.installing() {
            debug!("Installing worker found after update");
            if self.inner.track_candidate(installing) {
                return Ok(true);
            }
        }
        if let Some(waiting) = registration.waiting() {
            debug!("Waiting worker found after update");
            if self.inner.track_candidate(waiting) {
                return Ok(true);
            }
        }

        debug!("No worker found after update");
        Ok(false)
    }

    pub fn get_update(&self) -> Option<Update> {
        let worker = self.inner.state.lock().update.clone()?;
        let will_become_controller = self
            .inner
            .container
            .as_ref()
            .is_some_and(|c| c.controller().is_some());

        Some(Update {
            worker,
            will_become_controller,
            navigator_will_reload: will_become_controller && self.inner.auto_reload_enabled(),
        })
    }

    pub fn is_update_available(&self) -> bool {
        self.inner.state.lock().update.is_some()
    }

    /// Call `callback` once per newly detected candidate worker.
    pub fn listen_for_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.update_signal.listen(callback)
    }

    pub fn remove_update_listener(&self, id: ListenerId) -> bool {
        self.inner.update_signal.remove(id)
    }

    /// Activate the candidate worker and wait until it controls the page.
    ///
    /// An installed candidate is told to skip waiting. A candidate still
    /// installing is waited on first; it is never told to skip waiting
    /// before reaching `installed`.
    pub async fn activate_update(&self, options: ActivateOptions) -> Result<(), UpdateError> {
        let Some(worker) = self.inner.state.lock().update.clone() else {
            return Err(UpdateError::NoUpdate);
        };
        let ActivateOptions {
            mut on_activating,
            on_activated,
            on_becomes_controller,
        } = options;

        let id = worker.id();
        let container = self.inner.container.clone();
        let previous_controller = container
            .as_ref()
            .and_then(|c| c.controller())
            .map(|c| c.id());
        let mut controller_change = container.as_ref().map(|c| c.subscribe_controller_change());
        let mut states = worker.subscribe_state();

        let mut state = *states.borrow_and_update();
        if matches!(state, WorkerState::Parsed | WorkerState::Installing) {
            warn!(worker = ?id, %state, "Update is still installing, waiting before skipWaiting");
            match wait_until_installed(&mut states).await {
                Ok(installed) => state = installed,
                Err(err) => {
                    self.inner.clear_update(id);
                    return Err(err);
                }
            }
        }

        let outcome = match state {
            WorkerState::Installed => {
                info!(worker = ?id, "Sending skipWaiting to update");
                let skip_waiting = send_message(worker.as_ref(), Message::new("skipWaiting"));
                let activated = wait_until_activated(&mut states, &mut on_activating);
                tokio::pin!(skip_waiting, activated);

                let mut replied = false;
                loop {
                    tokio::select! {
                        reply = &mut skip_waiting, if !replied => {
                            replied = true;
                            if let Err(err) = reply {
                                warn!(worker = ?id, error = %err, "skipWaiting failed");
                                break Err(UpdateError::from(err));
                            }
                        }
                        result = &mut activated => break result,
                    }
                }
            }
            WorkerState::Activating => {
                run(on_activating.take());
                wait_until_activated(&mut states, &mut on_activating).await
            }
            WorkerState::Activated => Ok(()),
            WorkerState::Parsed | WorkerState::Installing | WorkerState::Redundant => {
                debug!(worker = ?id, %state, "Update needs no activation");
                run(on_activated);
                self.inner.clear_update(id);
                return Ok(());
            }
        };

        if let Err(err) = outcome {
            self.inner.clear_update(id);
            return Err(err);
        }
        run(on_activated);

        if let (Some(container), Some(previous)) = (&container, previous_controller) {
            if previous != id {
                if let Some(ref mut controller_change) = controller_change {
                    loop {
                        if container.controller().is_some_and(|c| c.id() == id) {
                            break;
                        }
                        match controller_change.recv().await {
                            Ok(()) | Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
        }

        if container
            .as_ref()
            .and_then(|c| c.controller())
            .is_some_and(|c| c.id() == id)
        {
            info!(worker = ?id, "Update controls the page");
            run(on_becomes_controller);
        }

        self.inner.clear_update(id);
        Ok(())
    }

    // ==================== Messaging ====================

    /// Send a message to the worker current at registration.
    pub async fn send_message_to_worker(&self, message: Message) -> Result<JsonValue, UpdateError> {
        let Some(worker) = self.inner.state.lock().worker.clone() else {
            warn!("No service worker to send message to");
            return Err(UpdateError::NoWorker);
        };
        Ok(send_message(worker.as_ref(), message).await?)
    }

    /// Send a message to the candidate worker.
    pub async fn send_message_to_update(&self, message: Message) -> Result<JsonValue, UpdateError> {
        let Some(worker) = self.inner.state.lock().update.clone() else {
            warn!("No service worker update to send message to");
            return Err(UpdateError::NoUpdate);
        };
        Ok(send_message(worker.as_ref(), message).await?)
    }

    // ==================== Controller ====================

    /// Call `callback` with the current controller now and after every
    /// controller change.
    pub fn listen_controller<F>(&self, callback: F) -> ControllerListener
    where
        F: Fn(Option<WorkerHandle>) + Send + Sync + 'static,
    {
        let Some(container) = self.inner.container.clone() else {
            return ControllerListener { task: None };
        };

        let mut controller_change = container.subscribe_controller_change();
        callback(container.controller());

        let task = tokio::spawn(async move {
            loop {
                match controller_change.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => callback(container.controller()),
                    Err(RecvError::Closed) => return,
                }
            }
        });
        ControllerListener { task: Some(task) }
    }

    pub fn auto_reload_after_update_is_enabled(&self) -> bool {
        self.inner.auto_reload_enabled()
    }

    /// Stop reloading the page when a new worker takes control.
    pub fn disable_auto_reload_after_update(&self) {
        if let Some(task) = self.inner.auto_reload.lock().take() {
            debug!("Auto reload after update disabled");
            task.abort();
        }
    }
}

fn spawn_auto_reload(inner: &Arc<Inner>, container: &dyn Container) -> JoinHandle<()> {
    let mut controller_change = container.subscribe_controller_change();
    let tracker = Arc::downgrade(inner);

    tokio::spawn(async move {
        loop {
            if let Err(RecvError::Closed) = controller_change.recv().await {
                return;
            }
            let Some(inner) = tracker.upgrade() else {
                return;
            };
            if inner.refreshing.swap(true, Ordering::SeqCst) {
                debug!("Page reload already triggered");
                continue;
            }
            info!("Controller changed, reloading page");
            inner.reload.reload();
        }
    })
}

async fn follow_registration(
    tracker: Weak<Inner>,
    registration: SharedRegistration,
    mut unregistered: watch::Receiver<bool>,
) {
    let Some(registration) = registration.await else {
        return;
    };
    if *unregistered.borrow_and_update() {
        unregister(&registration).await;
        return;
    }

    let mut update_found = registration.subscribe_update_found();

    loop {
        tokio::select! {
            event = update_found.recv() => {
                if let Err(RecvError::Closed) = event {
                    return;
                }
                let Some(inner) = tracker.upgrade() else {
                    return;
                };
                debug!("Browser reports a worker installing");
                if let Some(installing) = registration.installing() {
                    inner.track_candidate(installing);
                }
            }
            changed = unregistered.changed() => {
                if changed.is_err() {
                    return;
                }
                if *unregistered.borrow_and_update() {
                    unregister(&registration).await;
                    return;
                }
            }
        }
    }
}

async fn unregister(registration: &RegistrationRef) {
    match registration.unregister().await {
        Ok(true) => info!(scope = %registration.scope(), "Service worker unregistered"),
        Ok(false) => debug!(scope = %registration.scope(), "Service worker was not registered"),
        Err(err) => warn!(scope = %registration.scope(), error = %err, "Unregister failed"),
    }
}

async fn wait_until_installed(
    states: &mut watch::Receiver<WorkerState>,
) -> Result<WorkerState, UpdateError> {
    loop {
        states.changed().await.map_err(|_| UpdateError::WorkerGone)?;
        match *states.borrow_and_update() {
            WorkerState::Parsed | WorkerState::Installing => {}
            WorkerState::Redundant => return Err(UpdateError::Redundant),
            state => return Ok(state),
        }
    }
}

async fn wait_until_activated(
    states: &mut watch::Receiver<WorkerState>,
    on_activating: &mut Option<Callback>,
) -> Result<(), UpdateError> {
    loop {
        states.changed().await.map_err(|_| UpdateError::WorkerGone)?;
        let state = *states.borrow_and_update();
        match state {
            WorkerState::Activating => run(on_activating.take()),
            WorkerState::Activated => {
                // Activating may have been coalesced away.
                run(on_activating.take());
                return Ok(());
            }
            WorkerState::Redundant => return Err(UpdateError::Redundant),
            WorkerState::Parsed | WorkerState::Installing | WorkerState::Installed => {}
        }
    }
}

// ==================== Handles ====================

/// Returned by [`UpdateTracker::register`].
#[derive(Debug, Clone, Default)]
pub struct RegistrationHandle {
    tracker: Weak<Inner>,
    unregister_tx: Option<Arc<watch::Sender<bool>>>,
}

impl RegistrationHandle {
    /// Whether registration was skipped because service workers are not
    /// available.
    pub fn is_noop(&self) -> bool {
        self.unregister_tx.is_none()
    }

    /// Unregister the worker, right away or as soon as registration
    /// resolves, and reset the tracker.
    pub fn unregister(&self) {
        let Some(ref tx) = self.unregister_tx else {
            return;
        };
        tx.send_replace(true);

        if let Some(inner) = self.tracker.upgrade() {
            let mut state = inner.state.lock();
            if state
                .unregister_tx
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, tx))
            {
                *state = TrackerState::default();
            }
        }
    }
}

/// Returned by [`UpdateTracker::listen_controller`].
#[derive(Debug)]
pub struct ControllerListener {
    task: Option<JoinHandle<()>>,
}

impl ControllerListener {
    pub fn remove(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}
