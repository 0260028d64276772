use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use super::RtpTransport;

/// Default multicast TTL.
pub const DEFAULT_TTL: u32 = 64;

/// Resolve an `(rtp, rtcp)` port pair.
///
/// RTP must be even, so an odd port is moved down to the even one below it.
/// RTCP defaults to RTP + 1.
pub fn destination_ports(rtp: u16, rtcp: Option<u16>) -> (u16, u16) {
    let rtp = if rtp % 2 == 1 { rtp - 1 } else { rtp };
    let rtcp = rtcp.unwrap_or(rtp.wrapping_add(1));
    (rtp, rtcp)
}

/// UDP transport for one stream's outbound RTP and RTCP.
///
/// Binds a single ephemeral socket and sends to a fixed destination pair.
pub struct UdpTransport {
    socket: UdpSocket,
    rtp_addr: SocketAddr,
    rtcp_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral socket of the destination's address family.
    pub fn bind(destination: IpAddr, rtp_port: u16, rtcp_port: Option<u16>) -> io::Result<Self> {
        let (rtp_port, rtcp_port) = destination_ports(rtp_port, rtcp_port);
        let local: IpAddr = match destination {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((local, 0))?;
        let transport = Self {
            socket,
            rtp_addr: SocketAddr::new(destination, rtp_port),
            rtcp_addr: SocketAddr::new(destination, rtcp_port),
        };
        tracing::debug!(
            local = %transport.socket.local_addr()?,
            rtp = %transport.rtp_addr,
            rtcp = %transport.rtcp_addr,
            "UDP transport bound"
        );
        Ok(transport)
    }

    /// Set the IPv4 TTL, applied to multicast destinations as well.
    pub fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        match self.rtp_addr.ip() {
            IpAddr::V4(ip) => {
                if ip.is_multicast() {
                    self.socket.set_multicast_ttl_v4(ttl)?;
                }
                self.socket.set_ttl(ttl)
            }
            IpAddr::V6(_) => {
                tracing::debug!(ttl, "TTL not applied to IPv6 destination");
                Ok(())
            }
        }
    }

    pub fn rtp_addr(&self) -> SocketAddr {
        self.rtp_addr
    }

    pub fn rtcp_addr(&self) -> SocketAddr {
        self.rtcp_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn send(&self, payload: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket.send_to(payload, addr) {
            Ok(_) => Ok(()),
            // ICMP port unreachable from a previous datagram; the receiver
            // may simply not be listening yet.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::warn!(%addr, "destination refused datagram");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl RtpTransport for UdpTransport {
    fn send_rtp(&self, packet: &[u8]) -> io::Result<()> {
        self.send(packet, self.rtp_addr)
    }

    fn send_rtcp(&self, packet: &[u8]) -> io::Result<()> {
        self.send(packet, self.rtcp_addr)
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.rtp_addr)
    }
}
