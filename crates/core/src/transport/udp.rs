use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use super::PacketSink;
use crate::error::{Result, StreamError};

/// UDP sink for outbound RTP packets.
///
/// Binds one ephemeral socket of the destination's address family and
/// sends every packet to that single destination. A sink only exists after
/// a one-byte probe datagram went out in full.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpSink {
    /// Validate `dest`, bind an ephemeral socket and probe the destination.
    pub fn connect(dest: SocketAddr) -> Result<Self> {
        if dest.ip().is_unspecified() {
            return Err(StreamError::InvalidDestination(format!(
                "{dest}: unspecified address"
            )));
        }
        if dest.port() == 0 {
            return Err(StreamError::InvalidDestination(format!("{dest}: port 0")));
        }

        let bind: SocketAddr = match dest {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)?;

        let sent = socket.send_to(&[0u8], dest).map_err(|e| {
            tracing::warn!(%dest, error = %e, "reachability probe failed");
            StreamError::ProbeFailed { addr: dest, sent: 0 }
        })?;
        if sent != 1 {
            return Err(StreamError::ProbeFailed { addr: dest, sent });
        }

        tracing::info!(%dest, local = ?socket.local_addr().ok(), "UDP sink ready");
        Ok(Self { socket, dest })
    }

    pub fn destination(&self) -> SocketAddr {
        self.dest
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl PacketSink for UdpSink {
    fn send_packet(&mut self, packet: &[u8]) -> Result<usize> {
        let sent = self.socket.send_to(packet, self.dest)?;
        if sent != packet.len() {
            return Err(StreamError::ShortWrite {
                sent,
                expected: packet.len(),
            });
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rejects_unusable_destinations() {
        let unspecified: SocketAddr = "0.0.0.0:1234".parse().unwrap();
        assert!(matches!(
            UdpSink::connect(unspecified),
            Err(StreamError::InvalidDestination(_))
        ));
        let no_port: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            UdpSink::connect(no_port),
            Err(StreamError::InvalidDestination(_))
        ));
    }

    #[test]
    fn probes_then_sends_packets() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();

        let mut sink = UdpSink::connect(dest).unwrap();
        assert_eq!(sink.destination(), dest);

        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0]);
        assert_eq!(from.port(), sink.local_addr().unwrap().port());

        assert_eq!(sink.send_packet(&[0x80, 96, 0, 1]).unwrap(), 4);
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x80, 96, 0, 1]);
    }
}
