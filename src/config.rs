use crate::packet_header::PacketHeader;
use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

/// The delivery guarantee a transport instance provides. Both ends of a
///  deployment are expected to run the same level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityLevel {
    /// Fire-and-forget: no acks, no retransmission, no ordering.
    None,
    /// At-least-once: every data packet is acknowledged and retransmitted on
    ///  timeout. No ordering guarantee across messages.
    Basic,
    /// At-least-once and ordered: like `Basic`, plus completed messages are
    ///  released to the application in per-peer sequence order.
    Full,
}

impl ReliabilityLevel {
    pub fn requires_acks(&self) -> bool {
        !matches!(self, ReliabilityLevel::None)
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, ReliabilityLevel::Full)
    }
}

pub struct TransportConfig {
    pub bind_addr: SocketAddr,

    pub reliability: ReliabilityLevel,

    /// Maximum bytes per datagram, header included. This must be supported by all
    ///  network paths between nodes - the transport never sends a larger datagram,
    ///  so IP-level fragmentation is avoided as long as this fits the path MTU.
    ///
    /// With full Ethernet frames and no optional IP headers the usable UDP payload
    ///  is `1500 - 20 - 8 = 1472` for IPV4. There may be surprising network
    ///  hardware on (some of) the routes, so the responsibility for choosing this
    ///  value stays with the application rather than being guessed here.
    pub max_packet_size: usize,

    /// Upper bound on the size of a single logical message, fragmented or not.
    pub max_message_size: usize,

    /// Retransmission attempts per packet after the initial send. When the budget
    ///  is exhausted the whole message send fails with a delivery timeout.
    pub retry_limit: u32,

    /// Base delay before an unacknowledged packet is retransmitted. A small
    ///  random jitter (up to a tenth of this value) is added per attempt so that
    ///  peers don't synchronize into retransmission bursts.
    pub retry_interval: Duration,

    /// Maximum age of an incomplete reassembly entry. Also bounds how long the
    ///  ordered profile waits on a sequence gap before skipping it.
    pub fragment_ttl: Duration,

    /// How often the retransmission / expiry sweep runs. Retry timing is only as
    ///  granular as this interval.
    pub sweep_interval: Duration,

    /// Per-peer count of recently accepted sequence numbers remembered for
    ///  duplicate suppression. Must comfortably exceed the number of packets a
    ///  peer can have in flight within the retry horizon.
    pub dedup_window: usize,

    /// Capacity of the inbound delivery queue. When a slow consumer lets it fill
    ///  up, the oldest undelivered message is dropped.
    pub delivery_queue_capacity: usize,

    /// Size of the buffer the read loop hands to `recv_from`. Datagrams longer
    ///  than this are truncated by the OS and subsequently dropped, so it should
    ///  be at least `max_packet_size`.
    pub read_buffer_size: usize,

    /// Number of send buffers kept pooled; buffers returned beyond this are
    ///  discarded.
    pub write_buffer_size: usize,

    /// If set, a receive that stays idle longer than this is logged as a stall.
    pub read_timeout: Option<Duration>,

    /// If set, a socket write exceeding this deadline is abandoned and logged.
    pub write_timeout: Option<Duration>,
}

impl TransportConfig {
    pub fn default_for(bind_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            bind_addr,
            reliability: ReliabilityLevel::Basic,
            max_packet_size: 1472,
            max_message_size: 16 * 1024 * 1024,
            retry_limit: 5,
            retry_interval: Duration::from_millis(200),
            fragment_ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(50),
            dedup_window: 1024,
            delivery_queue_capacity: 1024,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 256,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Payload bytes available per data packet once the header is accounted for.
    pub fn payload_capacity(&self) -> usize {
        self.max_packet_size - PacketHeader::SERIALIZED_LEN
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size <= PacketHeader::SERIALIZED_LEN {
            bail!("max packet size {} does not leave room for payload after the {} byte header",
                self.max_packet_size, PacketHeader::SERIALIZED_LEN);
        }
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.retry_interval.is_zero() {
            bail!("retry interval must be positive");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if self.fragment_ttl.is_zero() {
            bail!("fragment TTL must be positive");
        }
        if self.dedup_window == 0 {
            bail!("dedup window must be positive");
        }
        if self.delivery_queue_capacity == 0 {
            bail!("delivery queue capacity must be positive");
        }
        if self.read_buffer_size < self.max_packet_size {
            bail!("read buffer of {} bytes cannot hold a full packet of {} bytes",
                self.read_buffer_size, self.max_packet_size);
        }
        Ok(())
    }
}
