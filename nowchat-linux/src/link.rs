//! Radio link emulated with UDP broadcast on the LAN.
//!
//! Each datagram is `dst(6) || src(6) || frame`. Stations drop datagrams addressed to
//! somebody else before the core sees them, the way a radio filters by address.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use nowchat_core::{LinkAddress, RadioLink, ReceiveHandle};
use tokio::net::UdpSocket;

const HEADER_LEN: usize = 12;

/// Datagram larger than any frame, so oversized input still reaches the length check.
const RECV_BUF: usize = 2048;

pub async fn bind(port: u16) -> std::io::Result<Arc<UdpSocket>> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    Ok(Arc::new(UdpSocket::from_std(std_sock)?))
}

pub fn encode_datagram(dst: &LinkAddress, src: &LinkAddress, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + frame.len());
    out.extend_from_slice(dst.as_bytes());
    out.extend_from_slice(src.as_bytes());
    out.extend_from_slice(frame);
    out
}

/// Split a datagram into (dst, src, frame). None if shorter than the header.
pub fn decode_datagram(datagram: &[u8]) -> Option<(LinkAddress, LinkAddress, &[u8])> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&datagram[..6]);
    src.copy_from_slice(&datagram[6..HEADER_LEN]);
    Some((LinkAddress(dst), LinkAddress(src), &datagram[HEADER_LEN..]))
}

/// Send side, owned by the engine.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    local: LinkAddress,
    dest: SocketAddr,
}

impl UdpLink {
    /// Link that broadcasts every datagram to `port` on the local segment.
    pub fn broadcast(socket: Arc<UdpSocket>, local: LinkAddress, port: u16) -> Self {
        Self::with_destination(socket, local, SocketAddr::from((Ipv4Addr::BROADCAST, port)))
    }

    pub fn with_destination(socket: Arc<UdpSocket>, local: LinkAddress, dest: SocketAddr) -> Self {
        Self {
            socket,
            local,
            dest,
        }
    }
}

impl RadioLink for UdpLink {
    fn send(&mut self, address: &LinkAddress, frame: &[u8]) -> bool {
        let datagram = encode_datagram(address, &self.local, frame);
        match self.socket.try_send_to(&datagram, self.dest) {
            Ok(n) => n == datagram.len(),
            Err(e) => {
                tracing::debug!(error = %e, "udp send failed");
                false
            }
        }
    }
}

/// Receive loop: the only thing it does with a datagram is hand it to `handle`.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    local: LinkAddress,
    handle: ReceiveHandle,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; RECV_BUF];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some((dst, src, frame)) = decode_datagram(&buf[..n]) else {
            tracing::debug!(%from, "runt datagram");
            continue;
        };
        if dst != local && !dst.is_broadcast() {
            continue;
        }
        handle.on_receive(src, None, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: LinkAddress = LinkAddress([2, 0, 0, 0, 0, 0xA]);
    const B: LinkAddress = LinkAddress([2, 0, 0, 0, 0, 0xB]);

    #[test]
    fn datagram_header_layout() {
        let d = encode_datagram(&LinkAddress::BROADCAST, &A, b"frame");
        assert_eq!(&d[..6], &[0xFF; 6]);
        assert_eq!(&d[6..12], A.as_bytes());
        let (dst, src, frame) = decode_datagram(&d).unwrap();
        assert!(dst.is_broadcast());
        assert_eq!(src, A);
        assert_eq!(frame, b"frame");
        assert!(decode_datagram(&d[..11]).is_none());
    }

    #[tokio::test]
    async fn link_sends_addressed_datagram() {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut link = UdpLink::with_destination(tx, A, rx.local_addr().unwrap());

        assert!(link.send(&B, &[7u8; 250]));
        let mut buf = [0u8; RECV_BUF];
        let (n, _) = rx.recv_from(&mut buf).await.unwrap();
        let (dst, src, frame) = decode_datagram(&buf[..n]).unwrap();
        assert_eq!(dst, B);
        assert_eq!(src, A);
        assert_eq!(frame.len(), 250);
    }
}
