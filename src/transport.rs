use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::constants::SOCKET_BUFFER_BYTES;

/// Non-blocking datagram socket connected to a single upstream server.
///
/// The pool talks to sockets through this trait so tests can substitute an
/// in-memory transport for the real UDP stack.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::peer_addr(self)
    }
}

/// Opens connected sockets for the pool.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self, server: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// Default factory: binds an ephemeral local port, connects to the server,
/// and requests large kernel buffers so bursts of responses are not dropped.
#[derive(Debug, Clone)]
pub struct UdpSocketFactory {
    buffer_bytes: usize,
}

impl UdpSocketFactory {
    pub fn new(buffer_bytes: usize) -> Self {
        Self { buffer_bytes }
    }
}

impl Default for UdpSocketFactory {
    fn default() -> Self {
        Self::new(SOCKET_BUFFER_BYTES)
    }
}

#[async_trait]
impl SocketFactory for UdpSocketFactory {
    async fn connect(&self, server: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        let domain = if server.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;

        // Best effort; the kernel may clamp these below the request.
        if let Err(e) = socket.set_recv_buffer_size(self.buffer_bytes) {
            debug!(error = %e, "could not set receive buffer size");
        }
        if let Err(e) = socket.set_send_buffer_size(self.buffer_bytes) {
            debug!(error = %e, "could not set send buffer size");
        }

        let bind_addr: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&bind_addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(server).await?;
        debug!(local = %socket.local_addr()?, server = %server, "opened upstream socket");

        Ok(Arc::new(socket))
    }
}
