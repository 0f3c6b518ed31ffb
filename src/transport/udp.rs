use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use super::{ResourceList, Transport, TransportError};

/// Default endpoint of the bench-side ASCII responder.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:5024";

/// UDP datagrams to a single `ip:port` peer.
pub struct UdpLink {
    sock: UdpSocket,
    peer: SocketAddr,
}

impl UdpLink {
    pub fn open(peer: SocketAddr) -> Result<Self, TransportError> {
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let sock = UdpSocket::bind(local)
            .map_err(|e| TransportError::Connection(format!("bind for {peer}: {e}")))?;
        sock.connect(peer)
            .map_err(|e| TransportError::Connection(format!("connect {peer}: {e}")))?;
        log::info!("[udp] peer {}", peer);
        Ok(Self { sock, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn list_resources() -> ResourceList {
        let mut out = ResourceList::new();
        out.insert(DEFAULT_ENDPOINT.to_string(), DEFAULT_ENDPOINT.to_string());
        out
    }
}

impl Transport for UdpLink {
    fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.sock.send(buf)?;
        Ok(())
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        // zero would mean "block forever" to set_read_timeout
        let timeout = timeout.max(Duration::from_millis(1));
        self.sock.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; max_len];
        match self.sock.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(TransportError::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        log::info!("[udp] closing {}", self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_datagram_and_timeout() {
        let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = echo.local_addr().unwrap();
        let mut link = UdpLink::open(addr).unwrap();

        link.send(b":ANAR 0x0008").unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = echo.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b":ANAR 0x0008");
        echo.send_to(b"0x1234", from).unwrap();

        let got = link.recv(2048, Duration::from_secs(1)).unwrap();
        assert_eq!(got, b"0x1234");

        let err = link.recv(2048, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, TransportError::TimedOut));
    }
}
