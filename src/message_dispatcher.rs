use crate::delivery_queue::{DeliveryQueue, ReceivedMessage};
use crate::metrics::TransportMetrics;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;

/// Where completed inbound messages go. This is the seam between the protocol
///  machinery and the application-facing delivery queue, introduced to make the
///  receive path testable without a live consumer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender: SocketAddr, message: Vec<u8>);
}

/// The production dispatcher: hands messages to the bounded delivery queue and
///  keeps the delivery counters up to date.
pub struct QueueDispatcher {
    queue: Arc<DeliveryQueue>,
    metrics: Arc<TransportMetrics>,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<DeliveryQueue>, metrics: Arc<TransportMetrics>) -> QueueDispatcher {
        QueueDispatcher { queue, metrics }
    }
}

#[async_trait]
impl MessageDispatcher for QueueDispatcher {
    async fn on_message(&self, sender: SocketAddr, message: Vec<u8>) {
        self.metrics.incr_messages_delivered();
        if self.queue.push(ReceivedMessage { sender, payload: message }).is_some() {
            self.metrics.incr_delivery_overflow_drops();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_dispatcher_delivers_and_counts() {
        let queue = Arc::new(DeliveryQueue::new(1));
        let metrics = Arc::new(TransportMetrics::default());
        let dispatcher = QueueDispatcher::new(queue.clone(), metrics.clone());

        let sender = SocketAddr::from(([127, 0, 0, 1], 9));
        dispatcher.on_message(sender, vec![1]).await;
        dispatcher.on_message(sender, vec![2]).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_delivered, 2);
        assert_eq!(snapshot.delivery_overflow_drops, 1);
        assert_eq!(queue.recv().await.unwrap().payload, vec![2]);
    }
}
