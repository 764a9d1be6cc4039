use crate::error::SendError;
use crate::metrics::TransportMetrics;
use crate::send_pipeline::SendPipeline;
use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

/// The asynchronous outcome of a registered send. `send_to` hands fragments to
///  the socket and returns; whether every fragment was acknowledged is only
///  known later and is reported through this handle.
#[derive(Debug)]
pub struct SendHandle {
    inner: SendHandleInner,
}

#[derive(Debug)]
enum SendHandleInner {
    Immediate(Result<(), SendError>),
    Pending(oneshot::Receiver<Result<(), SendError>>),
}

impl SendHandle {
    pub(crate) fn ready(result: Result<(), SendError>) -> SendHandle {
        SendHandle {
            inner: SendHandleInner::Immediate(result),
        }
    }

    pub(crate) fn pending(rx: oneshot::Receiver<Result<(), SendError>>) -> SendHandle {
        SendHandle {
            inner: SendHandleInner::Pending(rx),
        }
    }

    /// Resolves once the message is fully acknowledged (or immediately under the
    ///  fire-and-forget profile), fails with `DeliveryTimeout` when the retry
    ///  budget is exhausted and with `TransportStopped` on shutdown.
    pub async fn completion(self) -> Result<(), SendError> {
        match self.inner {
            SendHandleInner::Immediate(result) => result,
            SendHandleInner::Pending(rx) => {
                rx.await.unwrap_or(Err(SendError::TransportStopped))
            }
        }
    }
}

/// (destination, message id, fragment index) - the coordinates an ACK echoes.
type FragmentKey = (SocketAddr, u64, u32);

struct OutstandingSend {
    datagram: Bytes,
    to: SocketAddr,
    retries_remaining: u32,
    next_retry_at: Instant,
    sent_at: Instant,
    transmissions: u32,
    retransmitted: bool,
}

struct MessageSendState {
    remaining_fragments: u32,
    completion: Option<oneshot::Sender<Result<(), SendError>>>,
}

/// Tracks every transmitted-but-unacknowledged data packet, retransmits on
///  timeout up to the retry limit, and samples round-trip times from ack
///  latency.
///
/// Retransmission is driven by a periodic scan over the outstanding table
///  rather than one timer per packet - a small fixed polling overhead in
///  exchange for bounded resource use and predictable lock behavior.
pub struct ReliabilityManager {
    retry_limit: u32,
    retry_interval: Duration,
    pipeline: Arc<SendPipeline>,
    metrics: Arc<TransportMetrics>,
    outstanding: Mutex<FxHashMap<FragmentKey, OutstandingSend>>,
    messages: Mutex<FxHashMap<u64, MessageSendState>>,
}

impl ReliabilityManager {
    pub fn new(
        retry_limit: u32,
        retry_interval: Duration,
        pipeline: Arc<SendPipeline>,
        metrics: Arc<TransportMetrics>,
    ) -> ReliabilityManager {
        ReliabilityManager {
            retry_limit,
            retry_interval,
            pipeline,
            metrics,
            outstanding: Default::default(),
            messages: Default::default(),
        }
    }

    /// Registers a message whose fragments are about to be transmitted. The
    ///  returned handle resolves once all of them are acknowledged.
    pub async fn register_message(&self, message_id: u64, fragment_count: u32) -> SendHandle {
        let (tx, rx) = oneshot::channel();
        self.messages.lock().await.insert(
            message_id,
            MessageSendState {
                remaining_fragments: fragment_count,
                completion: Some(tx),
            },
        );
        SendHandle::pending(rx)
    }

    /// Registers one fragment before its initial transmission.
    pub async fn register_fragment(
        &self,
        to: SocketAddr,
        message_id: u64,
        fragment_index: u32,
        datagram: Bytes,
        now: Instant,
    ) {
        self.outstanding.lock().await.insert(
            (to, message_id, fragment_index),
            OutstandingSend {
                datagram,
                to,
                retries_remaining: self.retry_limit,
                next_retry_at: now + self.retry_interval + self.jitter(),
                sent_at: now,
                transmissions: 1,
                retransmitted: false,
            },
        );
    }

    pub async fn on_ack(
        &self,
        from: SocketAddr,
        message_id: u64,
        fragment_index: u32,
        now: Instant,
    ) {
        let entry = self
            .outstanding
            .lock()
            .await
            .remove(&(from, message_id, fragment_index));

        let Some(entry) = entry else {
            trace!("ack from {:?} for message {} fragment {} matches no outstanding send - late or duplicate ack", from, message_id, fragment_index);
            return;
        };

        // Karn's rule: a retransmitted packet's ack cannot be attributed to one
        //  particular transmission, so it contributes no RTT sample
        if !entry.retransmitted {
            self.metrics.record_rtt_sample(now.duration_since(entry.sent_at));
        }

        let mut messages = self.messages.lock().await;
        if let Some(state) = messages.get_mut(&message_id) {
            state.remaining_fragments -= 1;
            if state.remaining_fragments == 0 {
                trace!("message {} fully acknowledged", message_id);
                if let Some(tx) = messages
                    .remove(&message_id)
                    .and_then(|mut state| state.completion.take())
                {
                    let _ = tx.send(Ok(()));
                }
            }
        }
    }

    /// One pass of the retransmission scan: packets whose retry deadline passed
    ///  are re-sent; packets whose budget is exhausted fail their whole message
    ///  with a delivery timeout.
    pub async fn sweep(&self, now: Instant) {
        let mut resend: Vec<(SocketAddr, Bytes)> = Vec::new();
        let mut failed: Vec<(u64, u32)> = Vec::new();

        {
            let mut outstanding = self.outstanding.lock().await;
            for ((_, message_id, _), entry) in outstanding.iter_mut() {
                if entry.next_retry_at > now {
                    continue;
                }
                if entry.retries_remaining == 0 {
                    if !failed.iter().any(|(id, _)| id == message_id) {
                        failed.push((*message_id, entry.transmissions));
                    }
                    continue;
                }
                entry.retries_remaining -= 1;
                entry.transmissions += 1;
                entry.retransmitted = true;
                entry.sent_at = now;
                entry.next_retry_at = now + self.retry_interval + self.jitter();
                resend.push((entry.to, entry.datagram.clone()));
            }

            // a message with one exhausted fragment is lost as a whole: stop
            //  retransmitting its siblings
            if !failed.is_empty() {
                outstanding.retain(|(_, message_id, _), _| {
                    !failed.iter().any(|(id, _)| id == message_id)
                });
            }
        }

        if !failed.is_empty() {
            let mut messages = self.messages.lock().await;
            for (message_id, transmissions) in failed {
                debug!("message {} exhausted its retry budget after {} transmissions - giving up", message_id, transmissions);
                self.metrics.incr_send_timeouts();
                if let Some(tx) = messages
                    .remove(&message_id)
                    .and_then(|mut state| state.completion.take())
                {
                    let _ = tx.send(Err(SendError::DeliveryTimeout { transmissions }));
                }
            }
        }

        for (to, datagram) in resend {
            trace!("retransmitting an unacknowledged packet to {:?}", to);
            self.metrics.incr_packets_retransmitted();
            self.metrics.incr_packets_sent();
            self.pipeline.do_send_packet(to, &datagram).await;
        }
    }

    /// Discards all in-flight state, failing every pending send with the given
    ///  error. Used on transport shutdown.
    pub async fn fail_all(&self, error: SendError) {
        self.outstanding.lock().await.clear();
        for (_, mut state) in self.messages.lock().await.drain() {
            if let Some(tx) = state.completion.take() {
                let _ = tx.send(Err(error));
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max_micros = self.retry_interval.as_micros() as u64 / 10;
        if max_micros == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=max_micros))
    }

    #[cfg(test)]
    async fn outstanding_len(&self) -> usize {
        self.outstanding.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_pipeline::MockSendSocket;

    const INTERVAL: Duration = Duration::from_millis(100);
    // beyond the base interval plus the maximum jitter of a tenth
    const SAFE_STEP: Duration = Duration::from_millis(200);

    fn manager_with(retry_limit: u32, socket: MockSendSocket) -> ReliabilityManager {
        ReliabilityManager::new(
            retry_limit,
            INTERVAL,
            Arc::new(SendPipeline::new(Arc::new(socket), None)),
            Arc::new(TransportMetrics::default()),
        )
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    #[tokio::test]
    async fn test_ack_of_all_fragments_completes_message() {
        let manager = manager_with(3, MockSendSocket::new());
        let now = Instant::now();

        let handle = manager.register_message(1, 2).await;
        manager.register_fragment(peer(), 1, 0, Bytes::from_static(b"a"), now).await;
        manager.register_fragment(peer(), 1, 1, Bytes::from_static(b"b"), now).await;

        manager.on_ack(peer(), 1, 0, now).await;
        assert_eq!(manager.outstanding_len().await, 1);
        manager.on_ack(peer(), 1, 1, now).await;
        assert_eq!(manager.outstanding_len().await, 0);

        assert_eq!(handle.completion().await, Ok(()));
    }

    #[tokio::test]
    async fn test_duplicate_ack_does_not_double_count() {
        let manager = manager_with(3, MockSendSocket::new());
        let now = Instant::now();

        let _handle = manager.register_message(1, 2).await;
        manager.register_fragment(peer(), 1, 0, Bytes::from_static(b"a"), now).await;
        manager.register_fragment(peer(), 1, 1, Bytes::from_static(b"b"), now).await;

        manager.on_ack(peer(), 1, 0, now).await;
        manager.on_ack(peer(), 1, 0, now).await;

        assert_eq!(manager.messages.lock().await.get(&1).unwrap().remaining_fragments, 1);
    }

    #[tokio::test]
    async fn test_sweep_retransmits_due_packets() {
        let mut socket = MockSendSocket::new();
        socket
            .expect_do_send_packet()
            .once()
            .withf(|to, buf| to == &SocketAddr::from(([127, 0, 0, 1], 9)) && buf == b"payload")
            .returning(|_, _| ());

        let manager = manager_with(3, socket);
        let t0 = Instant::now();

        let _handle = manager.register_message(1, 1).await;
        manager.register_fragment(peer(), 1, 0, Bytes::from_static(b"payload"), t0).await;

        // not yet due
        manager.sweep(t0 + Duration::from_millis(10)).await;
        // due now
        manager.sweep(t0 + SAFE_STEP).await;

        assert_eq!(manager.metrics.snapshot().packets_retransmitted, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_with_delivery_timeout() {
        let mut socket = MockSendSocket::new();
        // exactly the 3 retransmissions of the retry budget; the initial
        //  transmission happens outside the manager
        socket.expect_do_send_packet().times(3).returning(|_, _| ());

        let manager = manager_with(3, socket);
        let t0 = Instant::now();

        let handle = manager.register_message(1, 1).await;
        manager.register_fragment(peer(), 1, 0, Bytes::from_static(b"x"), t0).await;

        let mut now = t0;
        for _ in 0..4 {
            now += SAFE_STEP;
            manager.sweep(now).await;
        }

        assert_eq!(
            handle.completion().await,
            Err(SendError::DeliveryTimeout { transmissions: 4 })
        );
        assert_eq!(manager.outstanding_len().await, 0);
        assert_eq!(manager.metrics.snapshot().send_timeouts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_fragment_fails_siblings_too() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().returning(|_, _| ());

        let manager = manager_with(1, socket);
        let t0 = Instant::now();

        let handle = manager.register_message(1, 2).await;
        manager.register_fragment(peer(), 1, 0, Bytes::from_static(b"a"), t0).await;
        manager.register_fragment(peer(), 1, 1, Bytes::from_static(b"b"), t0).await;

        // fragment 1 is acknowledged, fragment 0 never is
        manager.on_ack(peer(), 1, 1, t0).await;

        let mut now = t0;
        for _ in 0..3 {
            now += SAFE_STEP;
            manager.sweep(now).await;
        }

        assert!(matches!(
            handle.completion().await,
            Err(SendError::DeliveryTimeout { .. })
        ));
        assert_eq!(manager.outstanding_len().await, 0);
    }

    #[tokio::test]
    async fn test_rtt_sampled_only_for_unretransmitted_packets() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().returning(|_, _| ());

        let manager = manager_with(3, socket);
        let t0 = Instant::now();

        let _handle = manager.register_message(1, 2).await;
        manager.register_fragment(peer(), 1, 0, Bytes::from_static(b"a"), t0).await;
        manager.register_fragment(peer(), 1, 1, Bytes::from_static(b"b"), t0).await;

        // fragment 0 is acked before any retransmission: sampled
        manager.on_ack(peer(), 1, 0, t0 + Duration::from_millis(40)).await;
        let srtt = manager.metrics.snapshot().smoothed_rtt.unwrap();
        assert_eq!(srtt, Duration::from_millis(40));

        // fragment 1 gets retransmitted before its ack: not sampled
        manager.sweep(t0 + SAFE_STEP).await;
        manager.on_ack(peer(), 1, 1, t0 + Duration::from_secs(30)).await;
        assert_eq!(manager.metrics.snapshot().smoothed_rtt, Some(srtt));
    }

    #[tokio::test]
    async fn test_fail_all_reports_transport_stopped() {
        let manager = manager_with(3, MockSendSocket::new());
        let now = Instant::now();

        let handle = manager.register_message(1, 1).await;
        manager.register_fragment(peer(), 1, 0, Bytes::from_static(b"x"), now).await;

        manager.fail_all(SendError::TransportStopped).await;

        assert_eq!(handle.completion().await, Err(SendError::TransportStopped));
        assert_eq!(manager.outstanding_len().await, 0);
    }

    #[tokio::test]
    async fn test_handle_ready_resolves_immediately() {
        assert_eq!(SendHandle::ready(Ok(())).completion().await, Ok(()));
    }
}
