//! # swkit Channel
//!
//! Turns one-shot `postMessage` delivery into a correlated call.
//!
//! ## Architecture
//!
//! ```text
//! send_message(target, {action, payload})
//!     │
//!     ├── MessageChannel::new() ── port1 kept by the caller
//!     │                        └── port2 transferred with the message
//!     │
//!     └── target ── handles action ── port2.post_message({status, value})
//!                                          │
//!           port1.recv() ◄─────────────────┘
//! ```
//!
//! Exactly one reply is expected per call. There is no retry and no
//! timeout; wrap the future in `tokio::time::timeout` when needed.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, trace};

pub mod port;
pub mod protocol;

pub use port::{MessageChannel, MessagePort};
pub use protocol::{Message, Reply, ReplyStatus};

/// Errors raised while exchanging messages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Port is closed")]
    Closed,

    #[error("Peer went away before replying")]
    Disconnected,

    #[error("Action rejected: {0}")]
    Rejected(JsonValue),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),
}

/// Anything that accepts a message together with a reply port, such as a
/// worker handle.
pub trait MessageTarget: Send + Sync {
    fn post_message(&self, data: JsonValue, reply_port: MessagePort) -> Result<(), ChannelError>;
}

/// Send `message` to `target` and wait for its single reply.
pub async fn send_message<T>(target: &T, message: Message) -> Result<JsonValue, ChannelError>
where
    T: MessageTarget + ?Sized,
{
    let MessageChannel {
        port1: mut reply_rx,
        port2,
    } = MessageChannel::new();

    debug!(action = %message.action, "Sending message");
    target.post_message(message.to_value(), port2)?;

    let data = reply_rx.recv().await.ok_or(ChannelError::Disconnected)?;
    reply_rx.close();
    trace!(reply = %data, "Reply received");

    Reply::from_value(data)?.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replies inline, like a worker whose listener runs synchronously.
    struct EchoTarget;

    impl MessageTarget for EchoTarget {
        fn post_message(
            &self,
            data: JsonValue,
            reply_port: MessagePort,
        ) -> Result<(), ChannelError> {
            let message = Message::from_value(&data).unwrap();
            let reply = match message.action.as_str() {
                "echo" => Reply::resolved(message.payload),
                _ => Reply::rejected(format!("unknown action {}", message.action)),
            };
            reply_port.post_message(reply.to_value())
        }
    }

    /// Keeps reply ports so the test decides when to answer.
    #[derive(Default)]
    struct DeferredTarget {
        pending: Mutex<Vec<MessagePort>>,
    }

    impl MessageTarget for DeferredTarget {
        fn post_message(
            &self,
            _data: JsonValue,
            reply_port: MessagePort,
        ) -> Result<(), ChannelError> {
            self.pending.lock().unwrap().push(reply_port);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_resolved() {
        let value = send_message(&EchoTarget, Message::with_payload("echo", json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(value, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_send_rejected() {
        let err = send_message(&EchoTarget, Message::new("nope"))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Rejected(json!("unknown action nope")));
    }

    #[tokio::test]
    async fn test_send_deferred_reply() {
        let target = std::sync::Arc::new(DeferredTarget::default());

        let call = {
            let target = target.clone();
            tokio::spawn(async move { send_message(&*target, Message::new("ping")).await })
        };

        tokio::task::yield_now().await;
        let port = loop {
            if let Some(port) = target.pending.lock().unwrap().pop() {
                break port;
            }
            tokio::task::yield_now().await;
        };
        port.post_message(Reply::resolved("pong").to_value()).unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_send_without_reply() {
        let target = std::sync::Arc::new(DeferredTarget::default());

        let call = {
            let target = target.clone();
            tokio::spawn(async move { send_message(&*target, Message::new("ping")).await })
        };

        while target.pending.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        target.pending.lock().unwrap().clear();

        assert_eq!(call.await.unwrap().unwrap_err(), ChannelError::Disconnected);
    }
}
