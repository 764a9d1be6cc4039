use crate::buffer_pool::SendBufferPool;
use crate::config::TransportConfig;
use crate::delivery_queue::{DeliveryQueue, ReceivedMessage};
use crate::error::SendError;
use crate::fragment::{fragment_count_for, fragment_message};
use crate::message_dispatcher::{MessageDispatcher, QueueDispatcher};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::packet_header::{PacketHeader, PacketKind};
use crate::peer::PeerState;
use crate::reliability::{ReliabilityManager, SendHandle};
use crate::send_pipeline::SendPipeline;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// UdpTransport is the place where all other parts of the protocol come
///  together: it owns the datagram socket, runs the receive and sweep loops,
///  and has the API application code uses to send messages and consume inbound
///  ones.
///
/// One instance serves arbitrarily many peers through a single socket;
///  per-peer delivery state is created lazily on first contact.
pub struct UdpTransport {
    config: Arc<TransportConfig>,
    socket: Arc<UdpSocket>,
    pipeline: Arc<SendPipeline>,
    reliability: Arc<ReliabilityManager>,
    metrics: Arc<TransportMetrics>,
    delivery_queue: Arc<DeliveryQueue>,
    dispatcher: Arc<dyn MessageDispatcher>,
    buffer_pool: Arc<SendBufferPool>,
    peers: Mutex<FxHashMap<SocketAddr, Arc<PeerState>>>,
    next_message_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    task_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl UdpTransport {
    /// Validates the configuration and binds the socket. The transport is inert
    ///  until [`start`](Self::start) is called.
    pub async fn bind(config: TransportConfig) -> anyhow::Result<UdpTransport> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("bound transport socket to {:?}", socket.local_addr()?);

        let metrics = Arc::new(TransportMetrics::default());
        let delivery_queue = Arc::new(DeliveryQueue::new(config.delivery_queue_capacity));
        let dispatcher = Arc::new(QueueDispatcher::new(delivery_queue.clone(), metrics.clone()));
        let pipeline = Arc::new(SendPipeline::new(
            Arc::new(socket.clone()),
            config.write_timeout,
        ));
        let reliability = Arc::new(ReliabilityManager::new(
            config.retry_limit,
            config.retry_interval,
            pipeline.clone(),
            metrics.clone(),
        ));
        let buffer_pool = Arc::new(SendBufferPool::new(
            config.max_packet_size,
            config.write_buffer_size,
        ));
        let (stop_tx, _) = watch::channel(false);

        Ok(UdpTransport {
            config: Arc::new(config),
            socket,
            pipeline,
            reliability,
            metrics,
            delivery_queue,
            dispatcher,
            buffer_pool,
            peers: Default::default(),
            next_message_id: AtomicU64::new(0),
            stop_tx,
            started: AtomicBool::new(false),
            task_handles: Default::default(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the receive loop and the retransmission / expiry sweep.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("transport loops already started");
            return;
        }

        let mut handles = self.task_handles.lock().unwrap();
        let me = self.clone();
        handles.push(tokio::spawn(async move { me.recv_loop().await }));
        let me = self.clone();
        handles.push(tokio::spawn(async move { me.sweep_loop().await }));
    }

    /// Terminates both loops, unblocks pending [`recv`](Self::recv) calls and
    ///  fails all in-flight sends with `TransportStopped`. Idempotent.
    pub async fn stop(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        info!("stopping transport on {:?}", self.socket.local_addr().ok());
        self.delivery_queue.close();
        self.reliability.fail_all(SendError::TransportStopped).await;
    }

    /// Fragments the message, registers the fragments for acknowledgment
    ///  tracking (under the acknowledging profiles) and hands them to the
    ///  socket. Returns once the fragments are written - end-to-end delivery is
    ///  reported asynchronously through the returned handle.
    pub async fn send_to(&self, to: SocketAddr, message: &[u8]) -> anyhow::Result<SendHandle> {
        if *self.stop_tx.borrow() {
            return Err(SendError::TransportStopped.into());
        }
        if message.len() > self.config.max_message_size {
            return Err(SendError::MessageTooLarge {
                len: message.len(),
                max: self.config.max_message_size,
            }
            .into());
        }

        let requires_acks = self.config.reliability.requires_acks();
        let peer = self.get_or_create_peer(to).await;

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let payload_capacity = self.config.payload_capacity();
        let fragment_count = fragment_count_for(message.len(), payload_capacity);
        let base_sequence = peer.reserve_sequences(fragment_count);

        debug!("sending message {} of {} bytes to {:?} as {} fragment(s)", message_id, message.len(), to, fragment_count);

        let handle = if requires_acks {
            self.reliability.register_message(message_id, fragment_count).await
        } else {
            SendHandle::ready(Ok(()))
        };

        let now = Instant::now();
        for (header, payload) in fragment_message(message_id, base_sequence, message, payload_capacity) {
            let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
            header.ser(&mut buf);
            buf.extend_from_slice(&payload);
            let datagram = buf.freeze();

            if requires_acks {
                self.reliability
                    .register_fragment(to, message_id, header.fragment_index, datagram.clone(), now)
                    .await;
            }
            self.metrics.incr_packets_sent();
            self.pipeline.do_send_packet(to, &datagram).await;
        }

        Ok(handle)
    }

    /// Sends a message to every known peer. One peer's failure does not keep
    ///  the message from the others; per-peer handles report individual
    ///  outcomes.
    pub async fn broadcast(&self, message: &[u8]) -> Vec<(SocketAddr, SendHandle)> {
        let addrs: Vec<SocketAddr> = self.peers.lock().await.keys().cloned().collect();

        let mut handles = Vec::with_capacity(addrs.len());
        for addr in addrs {
            match self.send_to(addr, message).await {
                Ok(handle) => handles.push((addr, handle)),
                Err(e) => warn!("broadcast to {:?} failed: {}", addr, e),
            }
        }
        handles
    }

    /// Waits for the next inbound message. Returns `None` once the transport is
    ///  stopped and the queue is drained.
    pub async fn recv(&self) -> Option<ReceivedMessage> {
        self.delivery_queue.recv().await
    }

    pub fn try_recv(&self) -> Option<ReceivedMessage> {
        self.delivery_queue.try_recv()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn recv_loop(&self) {
        info!("starting receive loop");
        let mut stop_rx = self.stop_tx.subscribe();
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        debug!("receive loop stopping");
                        return;
                    }
                }
                received = Self::recv_datagram(&self.socket, self.config.read_timeout, &mut buf) => {
                    match received {
                        Ok(Some((num_read, from))) => {
                            let datagram = buf[..num_read].to_vec();
                            self.handle_datagram(from, &datagram).await;
                        }
                        Ok(None) => {} // idle read deadline, nothing to do
                        Err(e) => {
                            error!("fatal socket error in receive loop: {} - shutting down", e);
                            self.stop().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One receive attempt. `Ok(None)` means the configured read deadline
    ///  passed without traffic. Connection-level ICMP noise (port unreachable
    ///  from an earlier send) is not fatal on a connectionless socket.
    async fn recv_datagram(
        socket: &UdpSocket,
        read_timeout: Option<std::time::Duration>,
        buf: &mut [u8],
    ) -> std::io::Result<Option<(usize, SocketAddr)>> {
        let received = match read_timeout {
            None => socket.recv_from(buf).await,
            Some(deadline) => match timeout(deadline, socket.recv_from(buf)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("no inbound datagram within the read deadline of {:?}", deadline);
                    return Ok(None);
                }
            },
        };

        match received {
            Ok((num_read, from)) => Ok(Some((num_read, from))),
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                debug!("ignoring connection-level ICMP error on UDP socket: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        self.metrics.incr_packets_received();
        trace!("received datagram of {} bytes from {:?}", datagram.len(), from);

        let mut parse_buf = datagram;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(_) => {
                debug!("received packet with unparsable header from {:?}, dropping", from);
                return;
            }
        };

        match header.kind {
            PacketKind::Ack => {
                self.reliability
                    .on_ack(from, header.message_id, header.fragment_index, Instant::now())
                    .await;
            }
            PacketKind::Data => {
                if datagram.len() > self.config.max_packet_size {
                    warn!("data packet of {} bytes from {:?} exceeds the configured maximum packet size - dropping", datagram.len(), from);
                    return;
                }

                let peer = self.get_or_create_peer(from).await;
                let outcome = peer.on_data_packet(&header, parse_buf, Instant::now());

                // even a duplicate gets an ACK - the original ACK may itself
                //  have been lost
                if self.config.reliability.requires_acks() {
                    self.send_ack(from, &header).await;
                }
                if outcome.duplicate {
                    self.metrics.incr_duplicate_drops();
                }
                for message in outcome.released {
                    self.dispatcher.on_message(from, message).await;
                }
            }
        }
    }

    async fn send_ack(&self, to: SocketAddr, data_header: &PacketHeader) {
        let mut buf = self.buffer_pool.get_from_pool();
        PacketHeader::ack_for(data_header).ser(&mut buf);

        self.metrics.incr_packets_sent();
        self.pipeline.do_send_packet(to, &buf).await;
        self.buffer_pool.return_to_pool(buf);
    }

    async fn sweep_loop(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = interval(self.config.sweep_interval);

        loop {
            select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        debug!("sweep loop stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.do_sweep(Instant::now()).await;
                }
            }
        }
    }

    async fn do_sweep(&self, now: Instant) {
        self.reliability.sweep(now).await;

        let peers: Vec<Arc<PeerState>> = self.peers.lock().await.values().cloned().collect();
        for peer in peers {
            let outcome = peer.expire(now);
            if outcome.expired_reassemblies > 0 {
                self.metrics.incr_reassemblies_expired(outcome.expired_reassemblies as u64);
            }
            for message in outcome.released {
                self.dispatcher.on_message(peer.addr(), message).await;
            }
        }
    }

    async fn get_or_create_peer(&self, addr: SocketAddr) -> Arc<PeerState> {
        match self.peers.lock().await.entry(addr) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                debug!("first contact with peer {:?} - initializing per-peer state", addr);
                e.insert(Arc::new(PeerState::new(addr, &self.config))).clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReliabilityLevel;
    use bytes::BytesMut;
    use std::time::Duration;

    fn test_config(reliability: ReliabilityLevel) -> TransportConfig {
        let mut config = TransportConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.reliability = reliability;
        config.max_packet_size = 256;
        // generous enough that the loopback tests never retransmit
        config.retry_interval = Duration::from_secs(2);
        config.sweep_interval = Duration::from_millis(10);
        config
    }

    async fn bound(reliability: ReliabilityLevel) -> Arc<UdpTransport> {
        let transport = Arc::new(UdpTransport::bind(test_config(reliability)).await.unwrap());
        transport.start();
        transport
    }

    #[tokio::test]
    async fn test_full_profile_large_message_round_trip() {
        let sender = bound(ReliabilityLevel::Full).await;
        let receiver = bound(ReliabilityLevel::Full).await;

        let message: Vec<u8> = (0..10_000usize).map(|i| (i % 251) as u8).collect();
        let handle = sender
            .send_to(receiver.local_addr().unwrap(), &message)
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, message);
        assert_eq!(received.sender, sender.local_addr().unwrap());

        timeout(Duration::from_secs(5), handle.completion())
            .await
            .unwrap()
            .unwrap();

        // ceil(10_000 / (256 - 25)) data packets, no retransmissions
        assert_eq!(sender.metrics().packets_sent, 44);
        assert_eq!(sender.metrics().packets_retransmitted, 0);
        // the receiver sent nothing but one ACK per data packet
        assert_eq!(receiver.metrics().packets_sent, 44);
        assert_eq!(receiver.metrics().messages_delivered, 1);

        // no second delivery
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_none_profile_emits_no_acks() {
        let sender = bound(ReliabilityLevel::None).await;
        let receiver = bound(ReliabilityLevel::None).await;

        let handle = sender
            .send_to(receiver.local_addr().unwrap(), b"fire and forget")
            .await
            .unwrap();
        // resolved without waiting for any acknowledgment
        assert_eq!(handle.completion().await, Ok(()));

        let received = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, b"fire and forget");

        // give a hypothetical ack time to be sent back
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(receiver.metrics().packets_sent, 0);
        assert_eq!(sender.metrics().packets_retransmitted, 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_times_out_after_retry_budget() {
        let mut config = test_config(ReliabilityLevel::Basic);
        config.retry_limit = 3;
        config.retry_interval = Duration::from_millis(50);
        let sender = Arc::new(UdpTransport::bind(config).await.unwrap());
        sender.start();

        // nothing is listening there
        let blackhole: SocketAddr = SocketAddr::from(([127, 0, 0, 1], 9));
        let handle = sender.send_to(blackhole, b"into the void").await.unwrap();

        let result = timeout(Duration::from_secs(5), handle.completion())
            .await
            .unwrap();
        assert_eq!(result, Err(SendError::DeliveryTimeout { transmissions: 4 }));
        assert_eq!(sender.metrics().packets_retransmitted, 3);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped_silently() {
        let receiver = bound(ReliabilityLevel::Basic).await;

        let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        noise
            .send_to(&[0xde, 0xad, 0xbe, 0xef], receiver.local_addr().unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(receiver.metrics().packets_received, 1);
        assert_eq!(receiver.metrics().messages_delivered, 0);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_data_is_acked_but_delivered_once() {
        let receiver = bound(ReliabilityLevel::Basic).await;

        let header = PacketHeader {
            kind: PacketKind::Data,
            message_id: 1,
            fragment_index: 0,
            fragment_count: 1,
            sequence_number: 0,
        };
        let mut datagram = BytesMut::new();
        header.ser(&mut datagram);
        datagram.extend_from_slice(b"only once");

        let from = SocketAddr::from(([127, 0, 0, 1], 4999));
        receiver.handle_datagram(from, &datagram).await;
        receiver.handle_datagram(from, &datagram).await;

        let snapshot = receiver.metrics();
        assert_eq!(snapshot.messages_delivered, 1);
        assert_eq!(snapshot.duplicate_drops, 1);
        // both copies were acknowledged
        assert_eq!(snapshot.packets_sent, 2);

        assert_eq!(receiver.try_recv().unwrap().payload, b"only once");
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stop_unblocks_recv_and_fails_pending_sends() {
        let mut config = test_config(ReliabilityLevel::Basic);
        config.retry_interval = Duration::from_secs(60);
        let transport = Arc::new(UdpTransport::bind(config).await.unwrap());
        transport.start();

        let handle = transport
            .send_to(SocketAddr::from(([127, 0, 0, 1], 9)), b"pending forever")
            .await
            .unwrap();

        let receiver = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.stop().await;

        assert_eq!(receiver.await.unwrap(), None);
        assert_eq!(handle.completion().await, Err(SendError::TransportStopped));

        // sending after stop is rejected outright
        let rejected = transport
            .send_to(SocketAddr::from(([127, 0, 0, 1], 9)), b"nope")
            .await;
        assert_eq!(
            rejected.unwrap_err().downcast_ref::<SendError>(),
            Some(&SendError::TransportStopped)
        );
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let mut config = test_config(ReliabilityLevel::Basic);
        config.max_message_size = 10;
        let transport = Arc::new(UdpTransport::bind(config).await.unwrap());

        let rejected = transport
            .send_to(SocketAddr::from(([127, 0, 0, 1], 9)), &[0u8; 11])
            .await;
        assert_eq!(
            rejected.unwrap_err().downcast_ref::<SendError>(),
            Some(&SendError::MessageTooLarge { len: 11, max: 10 })
        );
    }

    /// Forwards datagrams between two transports, dropping the first copy of
    ///  every distinct datagram - each data packet and each ack has to be
    ///  earned through a retransmission.
    async fn lossy_relay(receiver_addr: SocketAddr) -> SocketAddr {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        tokio::spawn(async move {
            let mut seen: std::collections::HashSet<Vec<u8>> = Default::default();
            let mut sender_addr: Option<SocketAddr> = None;
            let mut buf = vec![0u8; 64 * 1024];

            loop {
                let Ok((num_read, from)) = relay.recv_from(&mut buf).await else {
                    return;
                };
                let datagram = buf[..num_read].to_vec();

                if from != receiver_addr {
                    sender_addr = Some(from);
                }
                if seen.insert(datagram.clone()) {
                    continue; // first sighting: lost in transit
                }

                let forward_to = if from == receiver_addr {
                    sender_addr
                } else {
                    Some(receiver_addr)
                };
                if let Some(to) = forward_to {
                    relay.send_to(&datagram, to).await.ok();
                }
            }
        });

        relay_addr
    }

    #[tokio::test]
    async fn test_loss_is_recovered_by_retransmission() {
        let mut config = test_config(ReliabilityLevel::Basic);
        config.retry_interval = Duration::from_millis(50);
        config.retry_limit = 10;
        let sender = Arc::new(UdpTransport::bind(config).await.unwrap());
        sender.start();

        let receiver = bound(ReliabilityLevel::Basic).await;
        let relay_addr = lossy_relay(receiver.local_addr().unwrap()).await;

        let message: Vec<u8> = (0..1000usize).map(|i| (i % 251) as u8).collect();
        let handle = sender.send_to(relay_addr, &message).await.unwrap();

        let received = timeout(Duration::from_secs(10), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, message);

        timeout(Duration::from_secs(10), handle.completion())
            .await
            .unwrap()
            .unwrap();

        // every packet needed at least a second transmission
        assert!(sender.metrics().packets_retransmitted >= 5);
        // but the application saw the message exactly once
        assert_eq!(receiver.metrics().messages_delivered, 1);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_known_peers() {
        let sender = bound(ReliabilityLevel::Basic).await;
        let receiver_a = bound(ReliabilityLevel::Basic).await;
        let receiver_b = bound(ReliabilityLevel::Basic).await;

        // make both peers known
        sender
            .send_to(receiver_a.local_addr().unwrap(), b"hello a")
            .await
            .unwrap();
        sender
            .send_to(receiver_b.local_addr().unwrap(), b"hello b")
            .await
            .unwrap();

        let handles = sender.broadcast(b"to everyone").await;
        assert_eq!(handles.len(), 2);
        for (_, handle) in handles {
            timeout(Duration::from_secs(5), handle.completion())
                .await
                .unwrap()
                .unwrap();
        }

        for receiver in [&receiver_a, &receiver_b] {
            let mut payloads = Vec::new();
            for _ in 0..2 {
                payloads.push(
                    timeout(Duration::from_secs(5), receiver.recv())
                        .await
                        .unwrap()
                        .unwrap()
                        .payload,
                );
            }
            assert!(payloads.contains(&b"to everyone".to_vec()));
        }
    }
}
