//! In-memory browser.
//!
//! Implements [`Container`], [`Registration`] and [`ServiceWorker`] without a
//! real browser. Lifecycle steps that a browser performs on its own
//! (finishing an install, deploying a new script to the network, claiming
//! clients) are explicit methods so callers decide when they happen.
//!
//! Messages posted to a [`MemoryWorker`] are recorded. They are forwarded to
//! the worker's message target when one is attached; otherwise the worker
//! answers `skipWaiting` itself and ignores everything else.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use swkit_channel::{ChannelError, Message, MessagePort, MessageTarget, Reply};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use url::Url;

use crate::host::{
    Container, Registration, RegistrationOptions, RegistrationRef, ServiceWorker, WorkerHandle,
    WorkerId, WorkerState,
};
use crate::HostError;

const EVENT_CAPACITY: usize = 16;

// ==================== Worker ====================

/// A worker instance living in a [`MemoryBrowser`].
pub struct MemoryWorker {
    id: WorkerId,
    script_url: Url,
    state_tx: watch::Sender<WorkerState>,
    registration: Weak<MemoryRegistration>,
    target: Mutex<Option<Arc<dyn MessageTarget>>>,
    received: Mutex<Vec<JsonValue>>,
    skip_waiting_requested: Mutex<bool>,
}

impl fmt::Debug for MemoryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MemoryWorker {
    fn new(script_url: Url, registration: Weak<MemoryRegistration>) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Parsed);
        Self {
            id: WorkerId::new(),
            script_url,
            state_tx,
            registration,
            target: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            skip_waiting_requested: Mutex::new(false),
        }
    }

    fn set_state(&self, state: WorkerState) {
        debug!(worker = ?self.id, %state, "Worker state change");
        self.state_tx.send_replace(state);
    }

    /// Route messages to `target` instead of the built-in responder.
    pub fn set_message_target(&self, target: Arc<dyn MessageTarget>) {
        *self.target.lock() = Some(target);
    }

    /// Every message posted to this worker, in order.
    pub fn received_messages(&self) -> Vec<JsonValue> {
        self.received.lock().clone()
    }

    /// Number of received messages whose action is `action`.
    pub fn received_count(&self, action: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|data| data.get("action").and_then(JsonValue::as_str) == Some(action))
            .count()
    }

    /// Worker-side `self.skipWaiting()`.
    ///
    /// A waiting worker activates right away. An installing worker activates
    /// as soon as its install finishes.
    pub fn skip_waiting(&self) {
        let Some(registration) = self.registration.upgrade() else {
            return;
        };
        match self.state() {
            WorkerState::Installed => registration.activate_waiting(),
            WorkerState::Parsed | WorkerState::Installing => {
                *self.skip_waiting_requested.lock() = true;
            }
            WorkerState::Activating | WorkerState::Activated | WorkerState::Redundant => {}
        }
    }

    fn respond_natively(
        &self,
        data: &JsonValue,
        reply_port: MessagePort,
    ) -> Result<(), ChannelError> {
        match Message::from_value(data) {
            Some(message) if message.action == "skipWaiting" => {
                self.skip_waiting();
                reply_port.post_message(Reply::resolved(JsonValue::Null).to_value())
            }
            Some(message) if message.action == "ping" => {
                reply_port.post_message(Reply::resolved(json!("pong")).to_value())
            }
            _ => Ok(()),
        }
    }
}

impl MessageTarget for MemoryWorker {
    fn post_message(&self, data: JsonValue, reply_port: MessagePort) -> Result<(), ChannelError> {
        if self.state() == WorkerState::Redundant {
            return Err(ChannelError::Closed);
        }
        self.received.lock().push(data.clone());

        let target = self.target.lock().clone();
        match target {
            Some(target) => target.post_message(data, reply_port),
            None => self.respond_natively(&data, reply_port),
        }
    }
}

impl ServiceWorker for MemoryWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn script_url(&self) -> &Url {
        &self.script_url
    }

    fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }
}

// ==================== Registration ====================

#[derive(Debug, Default)]
struct Slots {
    installing: Option<Arc<MemoryWorker>>,
    waiting: Option<Arc<MemoryWorker>>,
    active: Option<Arc<MemoryWorker>>,
    /// Previous active worker while the new one is activating.
    retiring: Option<Arc<MemoryWorker>>,
    /// Script version the newest worker was created from.
    version: u64,
}

/// A registration living in a [`MemoryBrowser`].
#[derive(Debug)]
pub struct MemoryRegistration {
    scope: Url,
    script_url: Mutex<Url>,
    slots: Mutex<Slots>,
    update_found: broadcast::Sender<()>,
    browser: Weak<BrowserInner>,
}

impl MemoryRegistration {
    pub fn installing_worker(&self) -> Option<Arc<MemoryWorker>> {
        self.slots.lock().installing.clone()
    }

    pub fn waiting_worker(&self) -> Option<Arc<MemoryWorker>> {
        self.slots.lock().waiting.clone()
    }

    pub fn active_worker(&self) -> Option<Arc<MemoryWorker>> {
        self.slots.lock().active.clone()
    }

    /// Start installing a new worker from the current script.
    fn start_install(self: &Arc<Self>, version: u64) -> Arc<MemoryWorker> {
        let worker = Arc::new(MemoryWorker::new(
            self.script_url.lock().clone(),
            Arc::downgrade(self),
        ));
        worker.set_state(WorkerState::Installing);

        let replaced = {
            let mut slots = self.slots.lock();
            slots.version = version;
            slots.installing.replace(worker.clone())
        };
        if let Some(replaced) = replaced {
            replaced.set_state(WorkerState::Redundant);
        }

        info!(scope = %self.scope, worker = ?worker.id, "Update found");
        let _ = self.update_found.send(());
        worker
    }

    /// Install event completed: installing → installed.
    ///
    /// Activates immediately when nothing is active yet or the worker asked
    /// to skip waiting.
    pub fn finish_install(&self) {
        let (worker, replaced, activate_now) = {
            let mut slots = self.slots.lock();
            let Some(worker) = slots.installing.take() else {
                return;
            };
            let replaced = slots.waiting.replace(worker.clone());
            let activate_now = slots.active.is_none() || *worker.skip_waiting_requested.lock();
            (worker, replaced, activate_now)
        };

        if let Some(replaced) = replaced {
            replaced.set_state(WorkerState::Redundant);
        }
        worker.set_state(WorkerState::Installed);

        if activate_now {
            self.activate_waiting();
        }
    }

    /// Install event failed: the installing worker becomes redundant.
    pub fn fail_install(&self) {
        let worker = self.slots.lock().installing.take();
        if let Some(worker) = worker {
            worker.set_state(WorkerState::Redundant);
        }
    }

    /// Promote the waiting worker: waiting → activating → activated.
    ///
    /// The previous active worker becomes redundant. Pages it controlled are
    /// handed to the new worker, which raises `controllerchange`.
    pub fn activate_waiting(&self) {
        if self.begin_activation() {
            self.finish_activation();
        }
    }

    /// Activate event started: the waiting worker becomes the active one in
    /// state `activating`. Returns whether a worker was waiting.
    pub fn begin_activation(&self) -> bool {
        let worker = {
            let mut slots = self.slots.lock();
            let Some(worker) = slots.waiting.take() else {
                return false;
            };
            slots.retiring = slots.active.replace(worker.clone());
            worker
        };
        worker.set_state(WorkerState::Activating);
        true
    }

    /// Activate event completed: activating → activated, then hand-over.
    pub fn finish_activation(&self) {
        let (worker, previous) = {
            let mut slots = self.slots.lock();
            let Some(worker) = slots
                .active
                .clone()
                .filter(|w| w.state() == WorkerState::Activating)
            else {
                return;
            };
            (worker, slots.retiring.take())
        };

        if let Some(ref previous) = previous {
            previous.set_state(WorkerState::Redundant);
        }
        worker.set_state(WorkerState::Activated);

        if let (Some(browser), Some(previous)) = (self.browser.upgrade(), previous) {
            browser.hand_over(previous.id, &worker);
        }
    }
}

#[async_trait]
impl Registration for MemoryRegistration {
    fn scope(&self) -> &Url {
        &self.scope
    }

    fn installing(&self) -> Option<WorkerHandle> {
        self.installing_worker().map(|w| w as WorkerHandle)
    }

    fn waiting(&self) -> Option<WorkerHandle> {
        self.waiting_worker().map(|w| w as WorkerHandle)
    }

    fn active(&self) -> Option<WorkerHandle> {
        self.active_worker().map(|w| w as WorkerHandle)
    }

    async fn update(&self) -> Result<(), HostError> {
        let browser = self.browser.upgrade().ok_or(HostError::Unavailable)?;
        let registration = browser.registration_arc(&self.scope).ok_or_else(|| {
            HostError::InvalidState(format!("{} is not registered", self.scope))
        })?;

        let script_url = self.script_url.lock().clone();
        let deployed = browser.deployed_version(&script_url);
        let (installed, installing) = {
            let slots = self.slots.lock();
            (slots.version, slots.installing.is_some())
        };

        if deployed > installed && !installing {
            registration.start_install(deployed);
        }
        Ok(())
    }

    async fn unregister(&self) -> Result<bool, HostError> {
        let Some(browser) = self.browser.upgrade() else {
            return Ok(false);
        };
        if browser.registrations.lock().remove(self.scope.as_str()).is_none() {
            return Ok(false);
        }

        let workers = {
            let mut slots = self.slots.lock();
            [slots.installing.take(), slots.waiting.take(), slots.active.take()]
        };
        for worker in workers.into_iter().flatten() {
            worker.set_state(WorkerState::Redundant);
        }
        Ok(true)
    }

    fn subscribe_update_found(&self) -> broadcast::Receiver<()> {
        self.update_found.subscribe()
    }
}

// ==================== Browser ====================

#[derive(Debug)]
struct BrowserInner {
    secure: bool,
    registrations: Mutex<HashMap<String, Arc<MemoryRegistration>>>,
    controller: Mutex<Option<Arc<MemoryWorker>>>,
    controller_change: broadcast::Sender<()>,
    /// Script version currently served by the network, by script URL.
    deployed: Mutex<HashMap<String, u64>>,
}

impl BrowserInner {
    fn registration_arc(&self, scope: &Url) -> Option<Arc<MemoryRegistration>> {
        self.registrations.lock().get(scope.as_str()).cloned()
    }

    fn deployed_version(&self, script_url: &Url) -> u64 {
        *self
            .deployed
            .lock()
            .entry(script_url.to_string())
            .or_insert(1)
    }

    fn hand_over(&self, previous: WorkerId, next: &Arc<MemoryWorker>) {
        let changed = {
            let mut controller = self.controller.lock();
            match controller.as_ref() {
                Some(current) if current.id == previous => {
                    *controller = Some(next.clone());
                    true
                }
                _ => false,
            }
        };
        if changed {
            info!(worker = ?next.id, "Controller change");
            let _ = self.controller_change.send(());
        }
    }
}

/// An in-memory `navigator.serviceWorker`.
#[derive(Debug, Clone)]
pub struct MemoryBrowser {
    inner: Arc<BrowserInner>,
}

impl Default for MemoryBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBrowser {
    /// A browser on a secure origin.
    pub fn new() -> Self {
        Self::with_security(true)
    }

    /// A browser on an insecure origin; registration always fails.
    pub fn insecure() -> Self {
        Self::with_security(false)
    }

    fn with_security(secure: bool) -> Self {
        let (controller_change, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(BrowserInner {
                secure,
                registrations: Mutex::new(HashMap::new()),
                controller: Mutex::new(None),
                controller_change,
                deployed: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registration for `scope`, if any.
    pub fn registration(&self, scope: &str) -> Option<Arc<MemoryRegistration>> {
        self.inner.registrations.lock().get(scope).cloned()
    }

    /// Serve a new version of `script_url`. The next `update()` installs it.
    pub fn deploy(&self, script_url: &str) {
        let mut deployed = self.inner.deployed.lock();
        *deployed.entry(script_url.to_string()).or_insert(1) += 1;
    }

    /// Let the active worker of `scope` take control of the page
    /// (`clients.claim()`).
    pub fn claim(&self, scope: &str) -> bool {
        let Some(active) = self.registration(scope).and_then(|r| r.active_worker()) else {
            return false;
        };
        {
            let mut controller = self.inner.controller.lock();
            if controller.as_ref().is_some_and(|c| c.id == active.id) {
                return false;
            }
            *controller = Some(active);
        }
        let _ = self.inner.controller_change.send(());
        true
    }

    /// Raise `controllerchange` without changing the controller, as
    /// browsers sometimes do more than once per hand-over.
    pub fn emit_controller_change(&self) {
        let _ = self.inner.controller_change.send(());
    }

    pub fn controller_worker(&self) -> Option<Arc<MemoryWorker>> {
        self.inner.controller.lock().clone()
    }
}

#[async_trait]
impl Container for MemoryBrowser {
    async fn register(
        &self,
        script_url: &str,
        options: &RegistrationOptions,
    ) -> Result<RegistrationRef, HostError> {
        if !self.inner.secure {
            return Err(HostError::Security(
                "service workers require a secure origin".to_string(),
            ));
        }

        let script_url = Url::parse(script_url).map_err(|source| HostError::InvalidUrl {
            url: script_url.to_string(),
            source,
        })?;
        let scope_input = options.scope.as_deref().unwrap_or("./");
        let scope = swkit_common::resolve_url(&script_url, scope_input).map_err(|source| {
            HostError::InvalidUrl {
                url: scope_input.to_string(),
                source,
            }
        })?;

        let deployed = self.inner.deployed_version(&script_url);
        let (registration, created) = {
            let mut registrations = self.inner.registrations.lock();
            match registrations.get(scope.as_str()) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let (update_found, _) = broadcast::channel(EVENT_CAPACITY);
                    let registration = Arc::new(MemoryRegistration {
                        scope: scope.clone(),
                        script_url: Mutex::new(script_url.clone()),
                        slots: Mutex::new(Slots::default()),
                        update_found,
                        browser: Arc::downgrade(&self.inner),
                    });
                    registrations.insert(scope.to_string(), registration.clone());
                    (registration, true)
                }
            }
        };

        let script_changed = {
            let mut current = registration.script_url.lock();
            let changed = *current != script_url;
            *current = script_url;
            changed
        };
        if created || script_changed {
            registration.start_install(deployed);
        }

        Ok(registration as RegistrationRef)
    }

    fn controller(&self) -> Option<WorkerHandle> {
        self.controller_worker().map(|w| w as WorkerHandle)
    }

    fn subscribe_controller_change(&self) -> broadcast::Receiver<()> {
        self.inner.controller_change.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "https://example.com/sw.js";
    const SCOPE: &str = "https://example.com/";

    #[tokio::test]
    async fn test_register_installs_first_worker() {
        let browser = MemoryBrowser::new();
        let registration = browser
            .register(SCRIPT, &RegistrationOptions::default())
            .await
            .unwrap();

        assert_eq!(registration.scope().as_str(), SCOPE);
        let installing = registration.installing().unwrap();
        assert_eq!(installing.state(), WorkerState::Installing);
        assert!(registration.active().is_none());
    }

    #[tokio::test]
    async fn test_register_insecure_origin() {
        let browser = MemoryBrowser::insecure();
        let result = browser.register(SCRIPT, &RegistrationOptions::default()).await;
        assert!(matches!(result, Err(HostError::Security(_))));
    }

    #[tokio::test]
    async fn test_register_twice_reuses_registration() {
        let browser = MemoryBrowser::new();
        browser.register(SCRIPT, &RegistrationOptions::default()).await.unwrap();
        let first = browser.registration(SCOPE).unwrap().installing_worker().unwrap();

        browser.register(SCRIPT, &RegistrationOptions::default()).await.unwrap();
        let again = browser.registration(SCOPE).unwrap().installing_worker().unwrap();
        assert_eq!(first.id(), again.id());
    }

    #[tokio::test]
    async fn test_registration_lifecycle() {
        let browser = MemoryBrowser::new();
        browser.register(SCRIPT, &RegistrationOptions::default()).await.unwrap();
        let registration = browser.registration(SCOPE).unwrap();

        // installing -> activated, nothing was active before
        registration.finish_install();
        let first = registration.active_worker().unwrap();
        assert_eq!(first.state(), WorkerState::Activated);
        assert!(browser.claim(SCOPE));

        // a new version waits while the first one controls the page
        browser.deploy(SCRIPT);
        registration.update().await.unwrap();
        registration.finish_install();
        let second = registration.waiting_worker().unwrap();
        assert_eq!(second.state(), WorkerState::Installed);

        let mut controller_change = browser.subscribe_controller_change();
        second.skip_waiting();
        assert_eq!(second.state(), WorkerState::Activated);
        assert_eq!(first.state(), WorkerState::Redundant);
        assert_eq!(browser.controller().unwrap().id(), second.id());
        assert!(controller_change.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_activation_in_two_steps() {
        let browser = MemoryBrowser::new();
        browser.register(SCRIPT, &RegistrationOptions::default()).await.unwrap();
        let registration = browser.registration(SCOPE).unwrap();
        registration.finish_install();
        let first = registration.active_worker().unwrap();
        assert!(browser.claim(SCOPE));

        browser.deploy(SCRIPT);
        registration.update().await.unwrap();
        registration.finish_install();
        let second = registration.waiting_worker().unwrap();

        assert!(registration.begin_activation());
        assert_eq!(second.state(), WorkerState::Activating);
        assert_eq!(registration.active_worker().unwrap().id(), second.id());
        assert!(registration.waiting_worker().is_none());
        // the old worker keeps the page until activation completes
        assert_eq!(first.state(), WorkerState::Activated);
        assert_eq!(browser.controller().unwrap().id(), first.id());

        registration.finish_activation();
        assert_eq!(second.state(), WorkerState::Activated);
        assert_eq!(first.state(), WorkerState::Redundant);
        assert_eq!(browser.controller().unwrap().id(), second.id());

        // nothing left to activate
        assert!(!registration.begin_activation());
        registration.finish_activation();
        assert_eq!(second.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_update_without_new_script() {
        let browser = MemoryBrowser::new();
        browser.register(SCRIPT, &RegistrationOptions::default()).await.unwrap();
        let registration = browser.registration(SCOPE).unwrap();
        registration.finish_install();

        let mut update_found = registration.subscribe_update_found();
        registration.update().await.unwrap();
        assert!(registration.installing().is_none());
        assert!(update_found.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_native_skip_waiting_reply() {
        let browser = MemoryBrowser::new();
        browser.register(SCRIPT, &RegistrationOptions::default()).await.unwrap();
        let registration = browser.registration(SCOPE).unwrap();
        registration.finish_install();
        browser.deploy(SCRIPT);
        registration.update().await.unwrap();
        registration.finish_install();

        let waiting = registration.waiting_worker().unwrap();
        let value = swkit_channel::send_message(waiting.as_ref(), Message::new("skipWaiting"))
            .await
            .unwrap();
        assert_eq!(value, JsonValue::Null);
        assert_eq!(waiting.received_count("skipWaiting"), 1);
        assert_eq!(waiting.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_unregister() {
        let browser = MemoryBrowser::new();
        browser.register(SCRIPT, &RegistrationOptions::default()).await.unwrap();
        let registration = browser.registration(SCOPE).unwrap();
        let installing = registration.installing_worker().unwrap();

        assert!(registration.unregister().await.unwrap());
        assert!(!registration.unregister().await.unwrap());
        assert_eq!(installing.state(), WorkerState::Redundant);
        assert!(browser.registration(SCOPE).is_none());
    }
}
