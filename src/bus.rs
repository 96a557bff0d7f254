//! The receive bus: the internal emitter on which decoded Whiteflag
//! messages are produced.
//!
//! Listeners publish every Whiteflag-bearing transaction here exactly once
//! per observation; subscribers consume at their own pace. Delivery is
//! fan-out: each subscriber sees every event published after it subscribed.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::message::WfMessage;

const BUS_CAPACITY: usize = 1024;

/// Events produced by the relay core.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A Whiteflag message was observed on-chain and decoded.
    MessageReceived(Arc<WfMessage>),
}

/// Handle to the receive bus. Cheap to clone; all clones publish to and
/// subscribe from the same channel.
#[derive(Debug, Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<RelayEvent>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        MessageBus { sender }
    }

    /// Emits a `messageReceived` event. A bus with no subscribers drops the
    /// event; the message count is returned for tracing.
    pub fn emit_message_received(&self, message: WfMessage) -> usize {
        self.sender
            .send(RelayEvent::MessageReceived(Arc::new(message)))
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MetaHeader;

    fn message(block: u64) -> WfMessage {
        WfMessage::from_meta_header(MetaHeader {
            blockchain: "test".to_owned(),
            block_number: block,
            transaction_hash: "ab".repeat(32),
            transaction_time: None,
            originator_address: "cd".repeat(20),
            originator_pub_key: format!("04{}", "ef".repeat(64)),
            encoded_message: "5746".to_owned(),
        })
    }

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe();
        bus.emit_message_received(message(1));
        bus.emit_message_received(message(2));
        let RelayEvent::MessageReceived(first) = rx.recv().await.unwrap();
        let RelayEvent::MessageReceived(second) = rx.recv().await.unwrap();
        assert_eq!(first.meta_header.block_number, 1);
        assert_eq!(second.meta_header.block_number, 2);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_not_an_error() {
        let bus = MessageBus::new();
        assert_eq!(bus.emit_message_received(message(1)), 0);
    }
}
