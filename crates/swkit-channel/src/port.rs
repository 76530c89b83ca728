//! Reply ports.

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::ChannelError;

/// One end of a [`MessageChannel`].
///
/// Data posted on a port is delivered to its peer. Closing a port drops its
/// queue, so the peer's later posts fail with [`ChannelError::Disconnected`].
#[derive(Debug)]
pub struct MessagePort {
    tx: mpsc::UnboundedSender<JsonValue>,
    rx: Option<mpsc::UnboundedReceiver<JsonValue>>,
}

impl MessagePort {
    pub fn create_pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        (
            Self {
                tx: tx2,
                rx: Some(rx1),
            },
            Self {
                tx: tx1,
                rx: Some(rx2),
            },
        )
    }

    /// Post data to the peer.
    pub fn post_message(&self, data: JsonValue) -> Result<(), ChannelError> {
        if self.rx.is_none() {
            return Err(ChannelError::Closed);
        }
        self.tx.send(data).map_err(|_| ChannelError::Disconnected)
    }

    /// Wait for the next message. Returns `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<JsonValue> {
        self.rx.as_mut()?.recv().await
    }

    pub fn close(&mut self) {
        self.rx = None;
    }
}

/// A message channel with two ports.
#[derive(Debug)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (port1, port2) = MessagePort::create_pair();
        Self { port1, port2 }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}
