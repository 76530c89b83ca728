//! Registration, update detection and activation against the in-memory
//! browser.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use swkit_channel::Message;
use swkit_update::{
    ActivateOptions, MemoryBrowser, RegistrationOptions, ServiceWorker, UpdateError,
    UpdateTracker, WorkerId, WorkerState,
};

use common::{controlled_page, settle, Page, SCOPE, SCRIPT};

fn flag() -> (Arc<AtomicBool>, impl FnOnce() + Send + 'static) {
    let flag = Arc::new(AtomicBool::new(false));
    let setter = flag.clone();
    (flag, move || setter.store(true, Ordering::SeqCst))
}

#[tokio::test]
async fn test_activate_update_sends_skip_waiting_once() {
    let page = controlled_page().await;
    let first = page.registration().active_worker().unwrap();

    page.deploy_update().await;
    let update = page.tracker.get_update().unwrap();
    assert_eq!(update.state(), WorkerState::Installing);
    assert!(update.will_become_controller);
    assert!(update.navigator_will_reload);

    page.registration().finish_install();
    assert_eq!(update.state(), WorkerState::Installed);
    let candidate = page.registration().waiting_worker().unwrap();
    assert_eq!(candidate.id(), update.worker.id());

    let (activating, on_activating) = flag();
    let (activated, on_activated) = flag();
    let (controlling, on_becomes_controller) = flag();
    page.tracker
        .activate_update(
            ActivateOptions::new()
                .on_activating(on_activating)
                .on_activated(on_activated)
                .on_becomes_controller(on_becomes_controller),
        )
        .await
        .unwrap();

    assert_eq!(candidate.received_count("skipWaiting"), 1);
    assert_eq!(candidate.state(), WorkerState::Activated);
    assert_eq!(first.state(), WorkerState::Redundant);
    assert!(activating.load(Ordering::SeqCst));
    assert!(activated.load(Ordering::SeqCst));
    assert!(controlling.load(Ordering::SeqCst));
    assert!(!page.tracker.is_update_available());

    settle().await;
    assert_eq!(page.reloads(), 1);
}

#[tokio::test]
async fn test_double_controller_change_reloads_once() {
    let page = controlled_page().await;

    page.browser.emit_controller_change();
    page.browser.emit_controller_change();
    settle().await;

    assert_eq!(page.reloads(), 1);
}

#[tokio::test]
async fn test_no_skip_waiting_while_installing() {
    let page = controlled_page().await;
    page.deploy_update().await;
    let candidate = page.registration().installing_worker().unwrap();

    let tracker = page.tracker.clone();
    let activation = tokio::spawn(async move {
        tracker.activate_update(ActivateOptions::default()).await
    });
    settle().await;

    assert_eq!(candidate.received_count("skipWaiting"), 0);
    assert_eq!(candidate.state(), WorkerState::Installing);
    assert!(!activation.is_finished());

    page.registration().finish_install();
    activation.await.unwrap().unwrap();

    assert_eq!(candidate.received_count("skipWaiting"), 1);
    assert_eq!(candidate.state(), WorkerState::Activated);
    assert_eq!(page.browser.controller_worker().unwrap().id(), candidate.id());
}

#[tokio::test]
async fn test_first_worker_is_not_an_update() {
    let page = {
        let mut page = Page::open(MemoryBrowser::new());
        page.handle = page.tracker.register(SCRIPT, RegistrationOptions::default());
        page
    };
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    page.tracker.listen_for_update(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(page.tracker.registration().await.is_some());
    settle().await;
    page.registration().finish_install();
    settle().await;

    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert!(page.tracker.get_update().is_none());
    assert!(!page.tracker.check_for_update().await.unwrap());
    assert_eq!(page.reloads(), 0);
}

#[tokio::test]
async fn test_check_right_after_register_ignores_first_worker() {
    let mut page = Page::open(MemoryBrowser::new());
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    page.tracker.listen_for_update(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    page.handle = page.tracker.register(SCRIPT, RegistrationOptions::default());
    // no settle: the background watcher has not run yet
    assert_eq!(page.tracker.check_for_update().await, Ok(false));
    assert!(page.tracker.get_update().is_none());

    settle().await;
    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert!(!page.tracker.is_update_available());
}

#[tokio::test]
async fn test_concurrent_check_for_update() {
    let page = controlled_page().await;
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    page.tracker.listen_for_update(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    page.browser.deploy(SCRIPT);
    let (a, b) = tokio::join!(
        page.tracker.check_for_update(),
        page.tracker.check_for_update()
    );
    assert_eq!(a, Ok(true));
    assert_eq!(b, Ok(true));

    settle().await;
    assert_eq!(updates.load(Ordering::SeqCst), 1);
    let installing = page.registration().installing_worker().unwrap();
    assert_eq!(page.tracker.get_update().unwrap().worker.id(), installing.id());
}

#[tokio::test]
async fn test_listen_for_update_once_per_candidate() {
    let page = controlled_page().await;
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let listener = page.tracker.listen_for_update(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    page.deploy_update().await;
    // the same installing worker again
    assert!(page.tracker.check_for_update().await.unwrap());
    settle().await;
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    page.registration().finish_install();
    page.deploy_update().await;
    assert_eq!(updates.load(Ordering::SeqCst), 2);
    let newest = page.registration().installing_worker().unwrap();
    assert_eq!(page.tracker.get_update().unwrap().worker.id(), newest.id());

    assert!(page.tracker.remove_update_listener(listener));
    page.registration().finish_install();
    page.deploy_update().await;
    assert_eq!(updates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_check_for_update_without_new_script() {
    let page = controlled_page().await;
    assert!(!page.tracker.check_for_update().await.unwrap());
    assert!(!page.tracker.is_update_available());
}

#[tokio::test]
async fn test_check_for_update_before_register() {
    let page = Page::open(MemoryBrowser::new());
    assert_eq!(
        page.tracker.check_for_update().await,
        Err(UpdateError::NotRegistered)
    );
}

#[tokio::test]
async fn test_redundant_update_is_forgotten() {
    let page = controlled_page().await;
    page.deploy_update().await;
    assert!(page.tracker.is_update_available());

    page.registration().fail_install();
    settle().await;

    assert!(!page.tracker.is_update_available());
    assert_eq!(
        page.tracker.activate_update(ActivateOptions::default()).await,
        Err(UpdateError::NoUpdate)
    );
}

#[tokio::test]
async fn test_update_activated_elsewhere_is_forgotten() {
    let page = controlled_page().await;
    page.deploy_update().await;
    page.registration().finish_install();
    let candidate = page.registration().waiting_worker().unwrap();

    // another tab activates the candidate
    candidate.skip_waiting();
    settle().await;

    assert_eq!(candidate.state(), WorkerState::Activated);
    assert!(!page.tracker.is_update_available());
    assert!(page.tracker.get_update().is_none());
}

#[tokio::test]
async fn test_activate_update_while_activating() {
    let page = controlled_page().await;
    page.deploy_update().await;
    page.registration().finish_install();
    let candidate = page.registration().waiting_worker().unwrap();
    assert!(page.registration().begin_activation());

    let (activating, on_activating) = flag();
    let (activated, on_activated) = flag();
    let (controlling, on_becomes_controller) = flag();
    let tracker = page.tracker.clone();
    let activation = tokio::spawn(async move {
        tracker
            .activate_update(
                ActivateOptions::new()
                    .on_activating(on_activating)
                    .on_activated(on_activated)
                    .on_becomes_controller(on_becomes_controller),
            )
            .await
    });
    settle().await;

    assert!(activating.load(Ordering::SeqCst));
    assert!(!activated.load(Ordering::SeqCst));
    assert_eq!(candidate.received_count("skipWaiting"), 0);
    assert!(!activation.is_finished());

    page.registration().finish_activation();
    activation.await.unwrap().unwrap();

    assert!(activated.load(Ordering::SeqCst));
    assert!(controlling.load(Ordering::SeqCst));
    assert_eq!(candidate.received_count("skipWaiting"), 0);
    assert_eq!(page.browser.controller_worker().unwrap().id(), candidate.id());
}

#[tokio::test]
async fn test_activate_update_already_activated() {
    let page = controlled_page().await;
    page.deploy_update().await;
    page.registration().finish_install();
    let candidate = page.registration().waiting_worker().unwrap();

    // activated before the tracker's watcher noticed
    candidate.skip_waiting();
    let (activated, on_activated) = flag();
    let (controlling, on_becomes_controller) = flag();
    page.tracker
        .activate_update(
            ActivateOptions::new()
                .on_activated(on_activated)
                .on_becomes_controller(on_becomes_controller),
        )
        .await
        .unwrap();

    assert!(activated.load(Ordering::SeqCst));
    assert!(controlling.load(Ordering::SeqCst));
    assert_eq!(candidate.received_count("skipWaiting"), 0);
    assert!(!page.tracker.is_update_available());
}

#[tokio::test]
async fn test_activate_update_already_redundant() {
    let page = controlled_page().await;
    page.deploy_update().await;
    let candidate = page.registration().installing_worker().unwrap();

    // install failed before the tracker's watcher noticed
    page.registration().fail_install();
    let (activated, on_activated) = flag();
    page.tracker
        .activate_update(ActivateOptions::new().on_activated(on_activated))
        .await
        .unwrap();

    assert!(activated.load(Ordering::SeqCst));
    assert_eq!(candidate.state(), WorkerState::Redundant);
    assert_eq!(candidate.received_count("skipWaiting"), 0);
    assert!(!page.tracker.is_update_available());
}

#[tokio::test]
async fn test_disable_auto_reload() {
    let page = controlled_page().await;
    assert!(page.tracker.auto_reload_after_update_is_enabled());

    page.tracker.disable_auto_reload_after_update();
    page.tracker.disable_auto_reload_after_update();
    assert!(!page.tracker.auto_reload_after_update_is_enabled());

    page.deploy_update().await;
    page.registration().finish_install();
    let update = page.tracker.get_update().unwrap();
    assert!(update.will_become_controller);
    assert!(!update.navigator_will_reload);

    page.tracker
        .activate_update(ActivateOptions::default())
        .await
        .unwrap();
    settle().await;
    assert_eq!(page.reloads(), 0);
}

#[tokio::test]
async fn test_listen_controller() {
    let page = controlled_page().await;
    let first = page.registration().active_worker().unwrap();

    let seen: Arc<Mutex<Vec<Option<WorkerId>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = page
        .tracker
        .listen_controller(move |controller| sink.lock().push(controller.map(|c| c.id())));
    assert_eq!(*seen.lock(), vec![Some(first.id())]);

    page.deploy_update().await;
    page.registration().finish_install();
    page.tracker
        .activate_update(ActivateOptions::default())
        .await
        .unwrap();
    settle().await;

    let second = page.registration().active_worker().unwrap();
    assert_eq!(*seen.lock(), vec![Some(first.id()), Some(second.id())]);
    listener.remove();
}

#[tokio::test]
async fn test_send_message_to_worker() {
    let page = controlled_page().await;
    let reply = page
        .tracker
        .send_message_to_worker(Message::with_payload("ping", json!(null)))
        .await
        .unwrap();
    assert_eq!(reply, json!("pong"));

    assert_eq!(
        page.tracker.send_message_to_update(Message::new("ping")).await,
        Err(UpdateError::NoUpdate)
    );
}

#[tokio::test]
async fn test_unregister_resets_tracker() {
    let page = controlled_page().await;
    assert!(page.tracker.service_worker_is_available());

    page.handle.unregister();
    settle().await;

    assert!(!page.tracker.service_worker_is_available());
    assert!(page.browser.registration(SCOPE).is_none());
    assert_eq!(
        page.tracker.check_for_update().await,
        Err(UpdateError::NotRegistered)
    );
}

#[tokio::test]
async fn test_register_twice_keeps_registration() {
    let mut page = controlled_page().await;
    let again = page.tracker.register(SCRIPT, RegistrationOptions::default());
    assert!(!again.is_noop());
    page.handle = again;
    settle().await;
    assert!(page.tracker.service_worker_is_available());
    assert!(page.tracker.get_update().is_none());
}

#[tokio::test]
async fn test_insecure_origin_degrades() {
    let page = Page::open(MemoryBrowser::insecure());
    let handle = page.tracker.register(SCRIPT, RegistrationOptions::default());
    assert!(!handle.is_noop());

    assert!(page.tracker.registration().await.is_none());
    assert_eq!(page.tracker.check_for_update().await, Ok(false));
    assert!(page.tracker.get_update().is_none());
}

#[tokio::test]
async fn test_unsupported_tracker() {
    let tracker = UpdateTracker::unsupported();
    assert!(!tracker.can_use_service_worker());

    let handle = tracker.register(SCRIPT, RegistrationOptions::default());
    assert!(handle.is_noop());
    handle.unregister();

    assert!(!tracker.service_worker_is_available());
    assert!(!tracker.auto_reload_after_update_is_enabled());
    assert_eq!(tracker.check_for_update().await, Ok(false));
    assert_eq!(
        tracker.activate_update(ActivateOptions::default()).await,
        Err(UpdateError::NoUpdate)
    );

    let called = Arc::new(AtomicBool::new(false));
    let sink = called.clone();
    tracker
        .listen_controller(move |_| sink.store(true, Ordering::SeqCst))
        .remove();
    assert!(!called.load(Ordering::SeqCst));
}
