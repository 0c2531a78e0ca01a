//! Datagram transports: a non-blocking UDP socket for real sessions and an
//! in-memory loopback pair for tests and the embedded server.

use crate::protocol::MAX_PACKET_LEN;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Mutex;
use tracing::trace;

/// An unreliable, unordered datagram pipe. Receives are polled once per
/// tick and never block.
pub trait PacketTransport {
    /// Send one datagram.
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Poll for one datagram; `Ok(None)` when nothing is pending.
    fn recv(&self) -> io::Result<Option<Vec<u8>>>;
}

/// UDP transport connected to a single remote address.
pub struct UdpTransport {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect to `remote`.
    pub fn connect<A: ToSocketAddrs>(remote: A) -> io::Result<Self> {
        let remote = remote
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(remote)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, remote })
    }

    /// The remote address this transport is connected to.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }
}

impl PacketTransport for UdpTransport {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send(data)?;
        Ok(())
    }

    fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = [0u8; MAX_PACKET_LEN * 2];
        match self.socket.recv(&mut buf) {
            Ok(len) => {
                trace!("received {} byte datagram", len);
                Ok(Some(buf[..len].to_vec()))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// One end of an in-memory loopback transport.
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

/// Create a connected loopback pair. Delivery is in order and lossless,
/// which keeps transport-level tests deterministic; loss and reordering are
/// exercised by feeding packets to the netchannel directly.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        LoopbackTransport {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        LoopbackTransport {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}

impl PacketTransport for LoopbackTransport {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "peer endpoint dropped"))
    }

    fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        let rx = self.rx.lock().expect("loopback receiver poisoned");
        match rx.try_recv() {
            Ok(data) => Ok(Some(data)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "peer endpoint dropped",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_delivers_in_order() {
        let (a, b) = loopback_pair();
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();
        assert_eq!(b.recv().unwrap().unwrap(), b"one");
        assert_eq!(b.recv().unwrap().unwrap(), b"two");
        assert!(b.recv().unwrap().is_none());
    }

    #[test]
    fn test_loopback_both_directions() {
        let (a, b) = loopback_pair();
        a.send(b"ping").unwrap();
        b.send(b"pong").unwrap();
        assert_eq!(b.recv().unwrap().unwrap(), b"ping");
        assert_eq!(a.recv().unwrap().unwrap(), b"pong");
    }

    #[test]
    fn test_loopback_dropped_peer_errors() {
        let (a, b) = loopback_pair();
        drop(b);
        assert!(a.send(b"x").is_err());
    }

    #[test]
    fn test_udp_nonblocking_roundtrip() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();
        let transport = UdpTransport::connect(addr).unwrap();
        assert_eq!(transport.remote_address(), addr);

        // Nothing pending yet.
        assert!(transport.recv().unwrap().is_none());

        transport.send(b"hello").unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");

        receiver.send_to(b"world", from).unwrap();
        // Give the kernel a moment to loop the packet back.
        let mut got = None;
        for _ in 0..100 {
            if let Some(data) = transport.recv().unwrap() {
                got = Some(data);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(got.unwrap(), b"world");
    }
}
