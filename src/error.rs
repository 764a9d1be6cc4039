use thiserror::Error;

/// The ways a registered send can fail after `send_to` has returned. Surfaced
///  through the message's [`SendHandle`](crate::reliability::SendHandle) rather
///  than the `send_to` call itself, since acknowledgment and retry happen
///  asynchronously.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The retry budget was exhausted without an ACK for every fragment.
    ///  `transmissions` counts all attempts for the packet that gave up,
    ///  including the initial send.
    #[error("delivery timed out after {transmissions} transmissions")]
    DeliveryTimeout { transmissions: u32 },

    /// The transport was stopped while the message was still in flight.
    #[error("transport stopped")]
    TransportStopped,

    /// The message does not fit the configured maximum message size.
    #[error("message of {len} bytes exceeds the configured maximum of {max}")]
    MessageTooLarge { len: usize, max: usize },
}
