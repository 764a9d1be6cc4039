use crate::config::TransportConfig;
use crate::dedup::DuplicateFilter;
use crate::fragment::ReassemblyBuffer;
use crate::packet_header::PacketHeader;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What happened to an inbound data packet.
pub struct DataPacketOutcome {
    /// The packet's sequence number was seen before; it was not handed to the
    ///  reassembler. Under the acknowledging profiles the caller still replies
    ///  with an ACK, because the original ACK may itself have been lost.
    pub duplicate: bool,
    /// Messages that are ready for the application in delivery order.
    pub released: Vec<Vec<u8>>,
}

/// Result of one expiry pass over a peer's buffers.
pub struct ExpiryOutcome {
    pub expired_reassemblies: usize,
    /// Messages unblocked by skipping a timed-out sequence gap.
    pub released: Vec<Vec<u8>>,
}

/// A message that completed reassembly but is held back until the sequence gap
///  below it is filled (or given up on).
struct HeldMessage {
    last_sequence: u64,
    payload: Vec<u8>,
    held_since: Instant,
}

struct PeerInbound {
    dedup: DuplicateFilter,
    reassembly: ReassemblyBuffer,
    /// Completed messages keyed by the sequence number of their first fragment.
    ordering_buffer: BTreeMap<u64, HeldMessage>,
    /// The sequence number the next in-order message must start at.
    next_expected_sequence: u64,
}

impl PeerInbound {
    /// Drains the ordering buffer as far as it is contiguous from the release
    ///  cursor.
    fn release_in_order(&mut self, released: &mut Vec<Vec<u8>>) {
        while let Some(entry) = self.ordering_buffer.first_entry() {
            if *entry.key() != self.next_expected_sequence {
                break;
            }
            let held = entry.remove();
            self.next_expected_sequence = held.last_sequence + 1;
            released.push(held.payload);
        }
    }
}

/// All transport state tied to one remote address. Created lazily on first
///  contact and never shared across addresses, so reordering or duplication
///  from one peer cannot disturb another's state.
pub struct PeerState {
    addr: SocketAddr,
    ordered: bool,
    ordering_ttl: Duration,
    inbound: Mutex<PeerInbound>,
    /// Sequence allocator for packets *to* this peer. Per-peer rather than
    ///  per-transport so every peer observes a gap-free monotonic stream.
    outbound_sequence: AtomicU64,
}

impl PeerState {
    pub fn new(addr: SocketAddr, config: &TransportConfig) -> PeerState {
        PeerState {
            addr,
            ordered: config.reliability.is_ordered(),
            ordering_ttl: config.fragment_ttl,
            inbound: Mutex::new(PeerInbound {
                dedup: DuplicateFilter::new(config.dedup_window),
                reassembly: ReassemblyBuffer::new(config.fragment_ttl, config.max_message_size),
                ordering_buffer: BTreeMap::new(),
                next_expected_sequence: 0,
            }),
            outbound_sequence: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Reserves a contiguous range of `count` outbound sequence numbers and
    ///  returns the first.
    pub fn reserve_sequences(&self, count: u32) -> u64 {
        self.outbound_sequence.fetch_add(count as u64, Ordering::Relaxed)
    }

    pub fn on_data_packet(
        &self,
        header: &PacketHeader,
        payload: &[u8],
        now: Instant,
    ) -> DataPacketOutcome {
        let mut inbound = self.inbound.lock().unwrap();

        if inbound.dedup.check_and_insert(header.sequence_number) {
            debug!("dropping duplicate packet #{} from {:?}", header.sequence_number, self.addr);
            return DataPacketOutcome {
                duplicate: true,
                released: Vec::new(),
            };
        }

        let Some(message) = inbound.reassembly.accept_fragment(header, payload, now) else {
            return DataPacketOutcome {
                duplicate: false,
                released: Vec::new(),
            };
        };

        if !self.ordered {
            return DataPacketOutcome {
                duplicate: false,
                released: vec![message],
            };
        }

        // fragments of a message occupy a contiguous sequence range, so any one
        //  fragment locates the whole message in the stream
        let first_sequence = header.sequence_number - header.fragment_index as u64;
        let last_sequence = first_sequence + (header.fragment_count - 1) as u64;

        if first_sequence < inbound.next_expected_sequence {
            // the message was given up on when its gap timed out, but it is
            //  acknowledged as received - better late than dropped
            debug!("message {} from {:?} completed after its sequence gap was skipped - releasing late", header.message_id, self.addr);
            return DataPacketOutcome {
                duplicate: false,
                released: vec![message],
            };
        }

        inbound.ordering_buffer.insert(
            first_sequence,
            HeldMessage {
                last_sequence,
                payload: message,
                held_since: now,
            },
        );

        let mut released = Vec::new();
        inbound.release_in_order(&mut released);
        DataPacketOutcome {
            duplicate: false,
            released,
        }
    }

    /// Periodic housekeeping: purges timed-out reassembly entries and, in the
    ///  ordered profile, gives up on sequence gaps that have stalled the release
    ///  cursor longer than the TTL. A skipped gap is treated as permanently
    ///  lost; delivery resumes at the next buffered message.
    pub fn expire(&self, now: Instant) -> ExpiryOutcome {
        let mut inbound = self.inbound.lock().unwrap();

        let expired_reassemblies = inbound.reassembly.expire(now);

        let mut released = Vec::new();
        if self.ordered {
            loop {
                inbound.release_in_order(&mut released);

                let Some((&first_sequence, held)) = inbound.ordering_buffer.first_key_value() else {
                    break;
                };
                if now.duration_since(held.held_since) < self.ordering_ttl {
                    break;
                }
                warn!("giving up on sequence gap #{}..#{} from {:?} after TTL - resuming delivery", inbound.next_expected_sequence, first_sequence, self.addr);
                inbound.next_expected_sequence = first_sequence;
            }
        }

        ExpiryOutcome {
            expired_reassemblies,
            released,
        }
    }
}
