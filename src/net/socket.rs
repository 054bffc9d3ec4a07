//! Non-blocking UDP socket wrapper over mio.

use std::io::{self, ErrorKind};
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking UDP socket.
///
/// Wraps a mio UDP socket; readiness comes from the poller the socket is
/// registered with, and the would-block cases are folded into the return
/// values so the event loops never see `ErrorKind::WouldBlock`.
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Joins an IPv4 multicast group on the default interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be joined.
    pub fn join_multicast_v4(&self, group: Ipv4Addr) -> io::Result<()> {
        self.inner.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
    }

    /// Sends a datagram, returning the number of bytes transmitted.
    ///
    /// A socket that is not ready to write reports `Ok(0)`; the caller
    /// decides whether a short or zero-length send is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        match self.inner.send_to(buf, dest.into()) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive one datagram, returning `Ok(None)` when no data
    /// is available.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio does not expose socket options, so go through rustix.
        rustix::net::sockopt::set_socket_send_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for UdpSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_local_addr() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(
            addr.ip(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        );
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn send_recv_loopback() {
        let sender = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let msg = b"hello";
        assert_eq!(sender.send_to(msg, receiver_addr).unwrap(), msg.len());

        // Non-blocking receive needs a retry loop even on loopback.
        let mut buf = [0u8; 64];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            if let Some((n, from)) = receiver.try_recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..n], msg);
                assert_eq!(from, sender.local_addr().unwrap());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "datagram never arrived");
        }
    }

    #[test]
    fn try_recv_empty_returns_none() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn buffer_size_options() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        socket.set_send_buffer_size(1024 * 1024).unwrap();
        socket.set_recv_buffer_size(1024 * 1024).unwrap();
    }
}
