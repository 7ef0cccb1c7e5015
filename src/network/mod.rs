//! UDP ingest for the transport stream under analysis

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::metrics::monotonic_ticks;
use crate::ring_buffer::RingBuffer;

/// Creates and configures a UDP socket for TS frame reception.
/// Handles both unicast and multicast addresses.
pub fn create_udp_socket(addr: &SocketAddr) -> anyhow::Result<Socket> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        _ => anyhow::bail!("only IPv4 is supported"),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;

    if ip.is_multicast() {
        let iface = Ipv4Addr::UNSPECIFIED; // default interface
        socket.join_multicast_v4(&ip, &iface)?;
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Receives datagrams and queues them for analysis, timestamping each frame
/// on arrival. A full (or closed) buffer drops the frame, which `on_drop`
/// records; the loop itself only ends on a socket error or cancellation.
pub async fn receive_loop(
    sock: UdpSocket,
    ring: Arc<RingBuffer>,
    on_drop: impl Fn(),
) -> anyhow::Result<()> {
    let mut buf = [0u8; 2048];
    loop {
        let n = sock.recv(&mut buf).await?;
        if n == 0 {
            continue;
        }

        let timestamp = monotonic_ticks();
        if ring.enqueue(Bytes::copy_from_slice(&buf[..n]), timestamp).is_err() {
            on_drop();
        }
    }
}
