use crate::packet_header::{PacketHeader, PacketKind};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Splits a message into data packets of at most `payload_capacity` payload bytes
///  each. A message that fits in one packet (or is empty) still gets a single
///  fragment with `fragment_count == 1` for protocol uniformity.
///
/// Fragments are assigned ascending indices from 0 and consecutive sequence
///  numbers starting at `base_sequence` - the receive side relies on a message
///  occupying a contiguous sequence range.
pub fn fragment_message(
    message_id: u64,
    base_sequence: u64,
    payload: &[u8],
    payload_capacity: usize,
) -> Vec<(PacketHeader, Bytes)> {
    let fragment_count = fragment_count_for(payload.len(), payload_capacity);
    let payload = Bytes::copy_from_slice(payload);

    let mut packets = Vec::with_capacity(fragment_count as usize);
    for index in 0..fragment_count {
        let start = index as usize * payload_capacity;
        let end = (start + payload_capacity).min(payload.len());
        let header = PacketHeader {
            kind: PacketKind::Data,
            message_id,
            fragment_index: index,
            fragment_count,
            sequence_number: base_sequence + index as u64,
        };
        packets.push((header, payload.slice(start..end)));
    }
    packets
}

pub fn fragment_count_for(payload_len: usize, payload_capacity: usize) -> u32 {
    payload_len
        .div_ceil(payload_capacity)
        .max(1)
        .try_into()
        .expect("this is a bug: the configured maximum message size should have bounded the fragment count")
}

struct PendingReassembly {
    expected_count: u32,
    fragments: FxHashMap<u32, Vec<u8>>,
    received_bytes: usize,
    created_at: Instant,
}

/// Collects inbound fragments per message id until a message is complete.
///  Incomplete entries older than the TTL are purged, and a fragment arriving for
///  a purged id opens a new, empty entry - stale partial state is never
///  resurrected.
pub struct ReassemblyBuffer {
    ttl: Duration,
    max_message_size: usize,
    pending: FxHashMap<u64, PendingReassembly>,
}

impl ReassemblyBuffer {
    pub fn new(ttl: Duration, max_message_size: usize) -> ReassemblyBuffer {
        ReassemblyBuffer {
            ttl,
            max_message_size,
            pending: FxHashMap::default(),
        }
    }

    /// Returns the concatenated message payload once all fragments are present,
    ///  `None` while the message is still accumulating or the fragment was
    ///  discarded.
    pub fn accept_fragment(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        now: Instant,
    ) -> Option<Vec<u8>> {
        if let Some(entry) = self.pending.get(&header.message_id) {
            if now.duration_since(entry.created_at) >= self.ttl {
                debug!("reassembly of message {} expired before completion - discarding partial state", header.message_id);
                self.pending.remove(&header.message_id);
            }
        }

        let entry = self
            .pending
            .entry(header.message_id)
            .or_insert_with(|| PendingReassembly {
                expected_count: header.fragment_count,
                fragments: FxHashMap::default(),
                received_bytes: 0,
                created_at: now,
            });

        if entry.expected_count != header.fragment_count {
            warn!("fragment for message {} declares count {} but the message was opened with count {} - dropping",
                header.message_id, header.fragment_count, entry.expected_count);
            return None;
        }

        // a re-sent fragment index overwrites instead of double-counting
        if let Some(previous) = entry.fragments.insert(header.fragment_index, payload.to_vec()) {
            entry.received_bytes -= previous.len();
        }
        entry.received_bytes += payload.len();

        if entry.received_bytes > self.max_message_size {
            warn!("message {} exceeds the maximum message size of {} during reassembly - this is a bug on the sender side and may be a DoS attack",
                header.message_id, self.max_message_size);
            self.pending.remove(&header.message_id);
            return None;
        }

        if entry.fragments.len() as u32 == entry.expected_count {
            let mut entry = self
                .pending
                .remove(&header.message_id)
                .expect("entry was just accessed");

            let mut message = Vec::with_capacity(entry.received_bytes);
            for index in 0..entry.expected_count {
                let fragment = entry
                    .fragments
                    .remove(&index)
                    .expect("all fragment indices below the count are present on completion");
                message.extend_from_slice(&fragment);
            }
            return Some(message);
        }

        None
    }

    /// Discards incomplete entries older than the TTL; returns how many were
    ///  purged.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let ttl = self.ttl;
        self.pending
            .retain(|message_id, entry| {
                let keep = now.duration_since(entry.created_at) < ttl;
                if !keep {
                    debug!("discarding incomplete reassembly of message {} after TTL", message_id);
                }
                keep
            });
        before - self.pending.len()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
