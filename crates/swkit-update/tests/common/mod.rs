//! Shared page setup for tracker tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use swkit_update::{
    Container, MemoryBrowser, MemoryRegistration, RegistrationHandle, RegistrationOptions,
    UpdateTracker,
};
use tracing_subscriber::EnvFilter;

pub const SCRIPT: &str = "https://example.com/sw.js";
pub const SCOPE: &str = "https://example.com/";

pub struct Page {
    pub browser: MemoryBrowser,
    pub tracker: UpdateTracker,
    pub handle: RegistrationHandle,
    pub reloads: Arc<AtomicUsize>,
}

impl Page {
    /// A page loaded in `browser`, not registered yet.
    pub fn open(browser: MemoryBrowser) -> Self {
        init_tracing();
        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = reloads.clone();
        let tracker = UpdateTracker::new(
            Arc::new(browser.clone()),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Self {
            browser,
            tracker,
            handle: RegistrationHandle::default(),
            reloads,
        }
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn registration(&self) -> Arc<MemoryRegistration> {
        self.browser
            .registration(SCOPE)
            .expect("registration should exist")
    }

    /// Deploy a new script and let the tracker detect it.
    pub async fn deploy_update(&self) {
        self.browser.deploy(SCRIPT);
        assert!(self.tracker.check_for_update().await.unwrap());
        settle().await;
    }
}

/// A page already controlled by an activated worker, with the tracker
/// registered on it.
pub async fn controlled_page() -> Page {
    let browser = MemoryBrowser::new();
    browser
        .register(SCRIPT, &RegistrationOptions::default())
        .await
        .unwrap();
    let registration = browser.registration(SCOPE).unwrap();
    registration.finish_install();
    assert!(browser.claim(SCOPE));

    let mut page = Page::open(browser);
    page.handle = page
        .tracker
        .register(SCRIPT, RegistrationOptions::default());
    assert!(page.tracker.registration().await.is_some());
    settle().await;
    page
}

/// Route tracker logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let background tasks run.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
