use std::fmt;
use std::net::{IpAddr, SocketAddr};

use hickory_proto::op::Message;
use hickory_proto::rr::Name;
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;

/// Address family a filter operates on.
///
/// Queue numbers are family-agnostic; the family only determines how queued
/// payloads are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("udp"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

/// Canonical 5-tuple fingerprint pairing a DNS query with its reply.
///
/// Always built in outbound orientation: decoding an inbound packet swaps
/// the endpoints, so a query and its reply yield identical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub transport: Transport,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.transport, self.src, self.dst)
    }
}

/// A fully decoded DNS-bearing packet.
pub struct DnsPacket {
    pub message: Message,
    pub connection: ConnectionId,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload does not contain a valid IP header")]
    Ip,
    #[error("payload does not contain a valid UDP header")]
    Udp,
    #[error("payload does not contain a valid TCP header")]
    Tcp,
    #[error("unsupported transport protocol {0}")]
    UnknownTransport(u8),
    #[error("DNS-over-TCP payload is missing its length prefix")]
    TruncatedTcpDns,
    #[error("invalid DNS message: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),
}

/// Decode a raw L3 payload expected to carry DNS.
///
/// All three layers (IP, UDP or TCP, DNS) must decode; partial packets fail.
/// With `inbound` set, the endpoints are swapped before the [`ConnectionId`]
/// is recorded so the reply maps onto its query.
pub fn decode_dns(payload: &[u8], family: Family, inbound: bool) -> Result<DnsPacket, DecodeError> {
    let (src_ip, dst_ip, protocol, segment) = ip_layer(payload, family)?;

    let (transport, src_port, dst_port, dns_bytes) = match protocol {
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(segment).ok_or(DecodeError::Udp)?;
            let header_len = UdpPacket::minimum_packet_size();
            (
                Transport::Udp,
                udp.get_source(),
                udp.get_destination(),
                &segment[header_len..],
            )
        }
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(segment).ok_or(DecodeError::Tcp)?;
            let header_len = usize::from(tcp.get_data_offset()) * 4;
            if header_len < TcpPacket::minimum_packet_size() || segment.len() < header_len {
                return Err(DecodeError::Tcp);
            }
            let stream = &segment[header_len..];
            // DNS over TCP is length-prefixed (RFC 1035 §4.2.2).
            if stream.len() < 2 {
                return Err(DecodeError::TruncatedTcpDns);
            }
            (
                Transport::Tcp,
                tcp.get_source(),
                tcp.get_destination(),
                &stream[2..],
            )
        }
        other => return Err(DecodeError::UnknownTransport(other.0)),
    };

    let message = Message::from_vec(dns_bytes)?;

    let (src, dst) = if inbound {
        (
            SocketAddr::new(dst_ip, dst_port),
            SocketAddr::new(src_ip, src_port),
        )
    } else {
        (
            SocketAddr::new(src_ip, src_port),
            SocketAddr::new(dst_ip, dst_port),
        )
    };

    Ok(DnsPacket {
        message,
        connection: ConnectionId {
            transport,
            src,
            dst,
        },
    })
}

/// Decode only the IP layer of a raw L3 payload, yielding `(src, dst)`.
///
/// Upper layers are not inspected.
pub fn decode_endpoints(payload: &[u8], family: Family) -> Result<(IpAddr, IpAddr), DecodeError> {
    let (src, dst, _, _) = ip_layer(payload, family)?;
    Ok((src, dst))
}

fn ip_layer(
    payload: &[u8],
    family: Family,
) -> Result<(IpAddr, IpAddr, IpNextHeaderProtocol, &[u8]), DecodeError> {
    match family {
        Family::Ipv4 => {
            let ip = Ipv4Packet::new(payload).ok_or(DecodeError::Ip)?;
            let header_len = usize::from(ip.get_header_length()) * 4;
            if header_len < Ipv4Packet::minimum_packet_size() || payload.len() < header_len {
                return Err(DecodeError::Ip);
            }
            Ok((
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                ip.get_next_level_protocol(),
                &payload[header_len..],
            ))
        }
        Family::Ipv6 => {
            let ip = Ipv6Packet::new(payload).ok_or(DecodeError::Ip)?;
            Ok((
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                ip.get_next_header(),
                &payload[Ipv6Packet::minimum_packet_size()..],
            ))
        }
    }
}

/// Canonical comparison form of a DNS name: lowercase ASCII without the
/// trailing root dot.
pub(crate) fn normalize_hostname(name: &Name) -> String {
    let mut hostname = name.to_lowercase().to_ascii();
    if hostname.ends_with('.') {
        hostname.pop();
    }
    hostname
}
