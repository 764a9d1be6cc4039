//! Reliable-datagram carrier for a JSON-RPC client/server transport family.
//!
//! Most carriers in that family are thin bridges onto existing client libraries
//!  and share a uniform contract: hand a byte message to `send`, consume inbound
//!  byte messages from a queue. This crate is the one carrier built from
//!  scratch: a delivery layer directly on top of unreliable, unordered,
//!  size-limited datagrams (UDP), providing configurable guarantees entirely in
//!  user code.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of
//!   data as opposed to streams of bytes)
//! * One listening UDP socket serves arbitrarily many peers; per-peer state is
//!   created lazily on first contact and is fully independent across peers
//! * Three reliability profiles selected per transport instance:
//!   * `None` - fire-and-forget, raw datagram semantics
//!   * `Basic` - at-least-once: positive ACK per data packet, retransmission on
//!     timeout, failure after a configured retry budget
//!   * `Full` - at-least-once and ordered: completed messages are released to
//!     the application in per-peer send order; a sequence gap stalls release
//!     until it is filled or its TTL expires, at which point the gap is skipped
//!     in favor of forward progress
//! * Big messages are sent without IP-level fragmentation - this protocol takes
//!   care of chunking, buffering and re-assembling against a configured maximum
//!   packet size, since MTU discovery does not work reliably
//! * Duplicates created by retransmission are filtered before they reach the
//!   application, so delivery is effectively exactly-once under loss rates the
//!   retry budget can absorb
//! * A slow consumer must not stall the socket: the inbound queue is bounded and
//!   drops its oldest entry under pressure
//! * No congestion control beyond the fixed retry interval (plus jitter), no
//!   encryption, no NAT traversal - those are out of scope for this layer
//!
//! ## Wire format
//!
//! Every datagram starts with the same fixed-order header, all integers in
//!  network byte order (BE):
//!
//! ```ascii
//! 0:  flags (u8): 0x01 DATA, 0x02 ACK
//! 1:  message id (u64) - shared by all fragments of one logical message,
//!      unique per sender per transport lifetime
//! 9:  fragment index (u32) - position of this fragment, starting at 0
//! 13: fragment count (u32) - total fragments of the message, >= 1
//! 17: sequence number (u64) - monotonically increasing per (sender, peer);
//!      fragments of one message occupy a contiguous sequence range
//! 25: payload
//! ```
//!
//! `DATA` packets carry up to `max_packet_size - 25` payload bytes. `ACK`
//!  packets carry no payload: their header echoes the message id, fragment index
//!  and sequence number of the acknowledged `DATA` packet. A datagram whose
//!  header does not decode is dropped silently - on an uncontrolled network path
//!  that is expected noise, not an application error.
//!
//! ## Delivery pipeline
//!
//! Outbound: [`UdpTransport::send_to`] fragments the message, registers every
//!  fragment with the reliability manager (under the acknowledging profiles) and
//!  writes the fragments to the socket. The call returns once the fragments are
//!  handed off; acknowledgment and retry happen asynchronously, and the eventual
//!  outcome is reported through the returned [`SendHandle`].
//!
//! Inbound: a dedicated read task decodes each datagram and routes ACKs to the
//!  reliability manager and data packets through duplicate filter, reassembly
//!  and (under `Full`) the ordering gate into the bounded delivery queue
//!  consumed via [`UdpTransport::recv`]. A second periodic task drives
//!  retransmission and the expiry of stale reassembly / ordering state.

pub mod buffer_pool;
pub mod config;
pub mod dedup;
pub mod delivery_queue;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod message_dispatcher;
pub mod metrics;
pub mod packet_header;
pub mod peer;
pub mod reliability;
pub mod send_pipeline;

pub use config::{ReliabilityLevel, TransportConfig};
pub use delivery_queue::ReceivedMessage;
pub use endpoint::UdpTransport;
pub use error::SendError;
pub use metrics::MetricsSnapshot;
pub use reliability::SendHandle;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
