use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{error, trace, warn};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The one place all outbound packets go through. Applies the configured write
///  deadline; a send error or deadline overrun is logged and the packet is left
///  to the retransmission machinery (or lost, under the fire-and-forget
///  profile).
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    write_timeout: Option<Duration>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, write_timeout: Option<Duration>) -> SendPipeline {
        SendPipeline {
            socket,
            write_timeout,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        match self.write_timeout {
            None => self.socket.do_send_packet(to, packet_buf).await,
            Some(deadline) => {
                if timeout(deadline, self.socket.do_send_packet(to, packet_buf))
                    .await
                    .is_err()
                {
                    warn!("sending a packet to {:?} exceeded the write deadline of {:?} - abandoning the write", to, deadline);
                }
            }
        }
    }
}
