use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// A message that completed reassembly (and, in the ordered profile, passed the
///  release gate) and is waiting to be consumed by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: SocketAddr,
    pub payload: Vec<u8>,
}

struct QueueInner {
    queue: VecDeque<ReceivedMessage>,
    closed: bool,
}

/// Bounded inbound queue between the socket read loop and the application.
///
/// A slow consumer must not block the read loop: when the queue is full, the
///  oldest undelivered message is dropped to make room for the new one, trading
///  completeness for liveness.
pub struct DeliveryQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> DeliveryQueue {
        DeliveryQueue {
            capacity,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues a message, returning the message that had to be dropped to make
    ///  room (if any). Messages pushed after `close` are discarded.
    pub fn push(&self, message: ReceivedMessage) -> Option<ReceivedMessage> {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return None;
            }
            let dropped = if inner.queue.len() == self.capacity {
                debug!("delivery queue is full - dropping the oldest undelivered message");
                inner.queue.pop_front()
            } else {
                None
            };
            inner.queue.push_back(message);
            dropped
        };

        self.notify.notify_one();
        dropped
    }

    /// Waits for the next message. Returns `None` once the queue is closed and
    ///  drained - buffered messages are still handed out after `close`.
    pub async fn recv(&self) -> Option<ReceivedMessage> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(message) = inner.queue.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&self) -> Option<ReceivedMessage> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Unblocks all pending and future `recv` calls. Idempotent.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}
