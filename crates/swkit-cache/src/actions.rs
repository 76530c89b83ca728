//! Commands the page can send to the worker.
//!
//! Built-in actions are `skipWaiting`, `refreshCacheKey`, `addCacheKey` and
//! `removeCacheKey`. Actions registered on [`WorkerConfig`] take precedence
//! over built-ins of the same name.
//!
//! [`WorkerConfig`]: crate::WorkerConfig

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{json, Value as JsonValue};
use swkit_channel::{ChannelError, Message, MessagePort, MessageTarget, Reply};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::CacheEngine;
use crate::request::{CacheMode, Request};
use crate::{CacheError, NetworkError, ScopeError};

/// Context handed to every action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    /// Name of the cache owned by the running worker.
    pub cache_name: String,
}

/// Failure of an action. Reported to the caller as a rejected reply.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// Rejection value chosen by the action itself.
    #[error("rejected with {0}")]
    Rejected(JsonValue),

    #[error("action panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    /// Value carried by the rejected reply.
    pub fn to_value(&self) -> JsonValue {
        match self {
            ActionError::Rejected(value) => value.clone(),
            other => JsonValue::String(other.to_string()),
        }
    }
}

/// A named command handler.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, payload: JsonValue, ctx: &ActionContext) -> Result<JsonValue, ActionError>;
}

#[async_trait]
impl<F> Action for F
where
    F: Fn(JsonValue, &ActionContext) -> Result<JsonValue, ActionError> + Send + Sync,
{
    async fn run(&self, payload: JsonValue, ctx: &ActionContext) -> Result<JsonValue, ActionError> {
        self(payload, ctx)
    }
}

/// Replies `"pong"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

#[async_trait]
impl Action for Ping {
    async fn run(
        &self,
        _payload: JsonValue,
        _ctx: &ActionContext,
    ) -> Result<JsonValue, ActionError> {
        Ok(json!("pong"))
    }
}

/// Built-in actions backed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinAction {
    SkipWaiting,
    RefreshCacheKey,
    AddCacheKey,
    RemoveCacheKey,
}

impl BuiltinAction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "skipWaiting" => Some(BuiltinAction::SkipWaiting),
            "refreshCacheKey" => Some(BuiltinAction::RefreshCacheKey),
            "addCacheKey" => Some(BuiltinAction::AddCacheKey),
            "removeCacheKey" => Some(BuiltinAction::RemoveCacheKey),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinAction::SkipWaiting => "skipWaiting",
            BuiltinAction::RefreshCacheKey => "refreshCacheKey",
            BuiltinAction::AddCacheKey => "addCacheKey",
            BuiltinAction::RemoveCacheKey => "removeCacheKey",
        }
    }
}

impl CacheEngine {
    /// Run a built-in action.
    pub async fn run_builtin(
        &self,
        action: BuiltinAction,
        payload: &JsonValue,
    ) -> Result<JsonValue, ActionError> {
        match action {
            BuiltinAction::SkipWaiting => {
                self.scope().skip_waiting().await?;
                Ok(JsonValue::Null)
            }
            BuiltinAction::RefreshCacheKey => {
                let request =
                    Request::get(self.resolve_payload_url(payload)?).cache(CacheMode::Reload);
                let fetched = self.fetch_and_cache(&request).await?;
                Ok(json!(fetched.response.status.as_u16()))
            }
            BuiltinAction::AddCacheKey => {
                let request = Request::get(self.resolve_payload_url(payload)?);
                let fetched = self.fetch_and_cache(&request).await?;
                Ok(json!(fetched.response.status.as_u16()))
            }
            BuiltinAction::RemoveCacheKey => {
                let url = self.resolve_payload_url(payload)?;
                let deleted = self
                    .storage()
                    .delete_entry(self.cache_name(), url.as_str())
                    .await?;
                Ok(JsonValue::Bool(deleted))
            }
        }
    }

    fn resolve_payload_url(&self, payload: &JsonValue) -> Result<url::Url, ActionError> {
        let input = payload.as_str().ok_or_else(|| {
            ActionError::InvalidPayload(format!("expected a url string, got {payload}"))
        })?;
        swkit_common::resolve_url(self.scope().location(), input)
            .map_err(|e| ActionError::InvalidPayload(format!("{input}: {e}")))
    }

    /// Dispatch one incoming message and reply on `reply_port`.
    ///
    /// Data that is not an `{action, payload}` object and unknown actions
    /// are ignored. The port is dropped without a reply, which the sender
    /// observes as [`ChannelError::Disconnected`].
    pub async fn handle_message(&self, data: JsonValue, reply_port: MessagePort) {
        let Some(message) = Message::from_value(&data) else {
            debug!(%data, "Ignoring message that is not a command");
            return;
        };

        let ctx = ActionContext {
            cache_name: self.cache_name().to_string(),
        };

        let outcome = if let Some(action) = self.config().actions.get(&message.action) {
            AssertUnwindSafe(action.run(message.payload, &ctx))
                .catch_unwind()
                .await
        } else if let Some(builtin) = BuiltinAction::from_name(&message.action) {
            AssertUnwindSafe(self.run_builtin(builtin, &message.payload))
                .catch_unwind()
                .await
        } else {
            debug!(action = %message.action, "Ignoring unknown action");
            return;
        };

        let reply = match outcome {
            Ok(Ok(value)) => Reply::resolved(value),
            Ok(Err(err)) => {
                self.logger()
                    .warn(format_args!("action {} rejected: {err}", message.action));
                Reply::rejected(err.to_value())
            }
            Err(panic) => {
                let err = ActionError::Panicked(panic_message(panic.as_ref()));
                self.logger()
                    .error(format_args!("action {} failed: {err}", message.action));
                Reply::rejected(err.to_value())
            }
        };

        if let Err(err) = reply_port.post_message(reply.to_value()) {
            warn!(action = %message.action, error = %err, "Reply could not be delivered");
        }
    }

    /// Handle every message of `messages` concurrently until the stream ends.
    pub async fn serve_messages<S>(&self, messages: S)
    where
        S: Stream<Item = (JsonValue, MessagePort)>,
    {
        messages
            .for_each_concurrent(None, |(data, port)| self.handle_message(data, port))
            .await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Sending half of a worker's message queue.
///
/// Posting never blocks; messages are handled by whoever drains the paired
/// [`MessageQueue`], usually [`CacheEngine::serve_messages`].
#[derive(Debug, Clone)]
pub struct MessageInbox {
    tx: mpsc::UnboundedSender<(JsonValue, MessagePort)>,
}

/// Receiving half of a worker's message queue.
pub type MessageQueue = mpsc::UnboundedReceiver<(JsonValue, MessagePort)>;

impl MessageInbox {
    pub fn new() -> (Self, MessageQueue) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }
}

impl MessageTarget for MessageInbox {
    fn post_message(&self, data: JsonValue, reply_port: MessagePort) -> Result<(), ChannelError> {
        self.tx
            .unbounded_send((data, reply_port))
            .map_err(|_| ChannelError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::network::Network;
    use crate::request::Response;
    use crate::scope::WorkerScope;
    use crate::storage::{CacheStorage, MemoryCacheStorage};
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use swkit_channel::send_message;
    use url::Url;

    #[derive(Default)]
    struct CountingScope {
        skip_waiting_calls: AtomicUsize,
    }

    #[async_trait]
    impl WorkerScope for CountingScope {
        fn location(&self) -> &Url {
            static LOCATION: std::sync::OnceLock<Url> = std::sync::OnceLock::new();
            LOCATION.get_or_init(|| Url::parse("https://example.com/sw.js").unwrap())
        }

        async fn skip_waiting(&self) -> Result<(), ScopeError> {
            self.skip_waiting_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct OkNetwork {
        modes: Mutex<Vec<CacheMode>>,
    }

    #[async_trait]
    impl Network for OkNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
            self.modes.lock().unwrap().push(request.cache);
            Ok(Response::new(request.url.clone(), StatusCode::OK))
        }
    }

    struct Setup {
        engine: CacheEngine,
        scope: Arc<CountingScope>,
        storage: Arc<MemoryCacheStorage>,
        network: Arc<OkNetwork>,
    }

    fn setup(config: WorkerConfig) -> Setup {
        let scope = Arc::new(CountingScope::default());
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(OkNetwork::default());
        let engine = CacheEngine::new(config, scope.clone(), storage.clone(), network.clone())
            .unwrap()
            .with_cache_name("jsenv-test");
        Setup {
            engine,
            scope,
            storage,
            network,
        }
    }

    /// Send one message and serve it until the inbox is dropped.
    async fn call(engine: &CacheEngine, message: JsonValue) -> Result<JsonValue, ChannelError> {
        let (inbox, queue) = MessageInbox::new();
        let client = async move {
            let (mut port1, port2) = MessagePort::create_pair();
            inbox.post_message(message, port2)?;
            drop(inbox);
            let data = port1.recv().await.ok_or(ChannelError::Disconnected)?;
            Reply::from_value(data)?.into_result()
        };
        let ((), result) = tokio::join!(engine.serve_messages(queue), client);
        result
    }

    #[tokio::test]
    async fn test_ping() {
        let Setup { engine, .. } = setup(WorkerConfig::default());
        let (inbox, queue) = MessageInbox::new();

        let client = async move {
            let result = send_message(&inbox, Message::new("ping")).await;
            drop(inbox);
            result
        };
        let ((), result) = tokio::join!(engine.serve_messages(queue), client);
        assert_eq!(result.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_remove_cache_key() {
        let Setup {
            engine, storage, ..
        } = setup(WorkerConfig::default());
        let url = "https://example.com/style.css";
        storage
            .put(
                "jsenv-test",
                url,
                Response::new(Url::parse(url).unwrap(), StatusCode::OK),
            )
            .await
            .unwrap();

        let message = json!({"action": "removeCacheKey", "payload": "/style.css"});
        assert_eq!(call(&engine, message.clone()).await.unwrap(), json!(true));
        assert!(storage.match_in("jsenv-test", url).await.unwrap().is_none());
        assert_eq!(call(&engine, message).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn test_add_and_refresh_cache_key() {
        let Setup {
            engine,
            storage,
            network,
            ..
        } = setup(WorkerConfig::default());

        let added = call(&engine, json!({"action": "addCacheKey", "payload": "/app.js"})).await;
        assert_eq!(added.unwrap(), json!(200));
        assert!(storage
            .match_in("jsenv-test", "https://example.com/app.js")
            .await
            .unwrap()
            .is_some());

        let refreshed = call(
            &engine,
            json!({"action": "refreshCacheKey", "payload": "/app.js"}),
        )
        .await;
        assert_eq!(refreshed.unwrap(), json!(200));
        assert_eq!(
            network.modes.lock().unwrap().as_slice(),
            &[CacheMode::Default, CacheMode::Reload]
        );
    }

    #[tokio::test]
    async fn test_skip_waiting() {
        let Setup { engine, scope, .. } = setup(WorkerConfig::default());
        let reply = call(&engine, json!({"action": "skipWaiting"})).await;
        assert_eq!(reply.unwrap(), JsonValue::Null);
        assert_eq!(scope.skip_waiting_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_action_overrides_builtin() {
        let config = WorkerConfig::default().with_action(
            "skipWaiting",
            |_payload: JsonValue, ctx: &ActionContext| -> Result<JsonValue, ActionError> {
                Ok(json!(ctx.cache_name))
            },
        );
        let Setup { engine, scope, .. } = setup(config);

        let reply = call(&engine, json!({"action": "skipWaiting"})).await;
        assert_eq!(reply.unwrap(), json!("jsenv-test"));
        assert_eq!(scope.skip_waiting_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_become_rejections() {
        let config = WorkerConfig::default()
            .with_action(
                "fail",
                |payload: JsonValue, _ctx: &ActionContext| -> Result<JsonValue, ActionError> {
                    Err(ActionError::Rejected(payload))
                },
            )
            .with_action(
                "explode",
                |_payload: JsonValue, _ctx: &ActionContext| -> Result<JsonValue, ActionError> {
                    panic!("boom")
                },
            );
        let Setup { engine, .. } = setup(config);

        let failed = call(&engine, json!({"action": "fail", "payload": {"code": 7}})).await;
        assert_eq!(failed, Err(ChannelError::Rejected(json!({"code": 7}))));

        let exploded = call(&engine, json!({"action": "explode"})).await;
        assert_eq!(
            exploded,
            Err(ChannelError::Rejected(json!("action panicked: boom")))
        );

        let invalid = call(&engine, json!({"action": "addCacheKey", "payload": 3})).await;
        assert!(matches!(invalid, Err(ChannelError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_non_commands_get_no_reply() {
        let Setup { engine, .. } = setup(WorkerConfig::default());

        for data in [json!("skipWaiting"), json!({"payload": 1}), json!({"action": "nope"})] {
            assert_eq!(call(&engine, data).await, Err(ChannelError::Disconnected));
        }
    }

    #[test]
    fn test_builtin_names() {
        for name in ["skipWaiting", "refreshCacheKey", "addCacheKey", "removeCacheKey"] {
            assert_eq!(BuiltinAction::from_name(name).map(|a| a.name()), Some(name));
        }
        assert!(BuiltinAction::from_name("ping").is_none());
    }
}
