//! ICMP echo probing, used to answer "is this machine up".

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{self, MutableEchoRequestPacket};
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes};
use pnet::packet::Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::status::Prober;

/// Payload carried after the eight-byte ICMP header.
const ECHO_PAYLOAD: &[u8] = b"wolctl-probe";

/// Probes hosts with a single ICMP echo request each.
pub struct IcmpProber {
    timeout: Duration,
    privileged: bool,
}

impl IcmpProber {
    pub fn new(timeout: Duration, privileged: bool) -> Self {
        Self {
            timeout,
            privileged,
        }
    }

    // Raw sockets need CAP_NET_RAW; the datagram variant works for any
    // user covered by net.ipv4.ping_group_range.
    fn open_socket(&self) -> io::Result<Socket> {
        let ty = if self.privileged {
            Type::RAW
        } else {
            Type::DGRAM
        };
        Socket::new(Domain::IPV4, ty, Some(Protocol::ICMPV4))
    }
}

impl Prober for IcmpProber {
    fn probe(&self, host: &str) -> io::Result<bool> {
        let ip = resolve_ipv4(host)?;
        let mut socket = self.open_socket()?;
        let addr = SockAddr::from(SocketAddr::new(IpAddr::V4(ip), 0));
        socket.connect(&addr)?;

        let ident = rand::random::<u16>();
        socket.send(&build_echo_request(ident))?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 1500];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            socket.set_read_timeout(Some(deadline - now))?;
            match socket.read(&mut buf) {
                Ok(len) if is_echo_reply(&buf[..len], ident, self.privileged) => return Ok(true),
                Ok(_) => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(false)
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn build_echo_request(ident: u16) -> Vec<u8> {
    let len = MutableEchoRequestPacket::minimum_packet_size() + ECHO_PAYLOAD.len();
    let mut buf = vec![0u8; len];
    {
        let mut request =
            MutableEchoRequestPacket::new(&mut buf).expect("buffer sized for an echo request");
        request.set_icmp_type(IcmpTypes::EchoRequest);
        request.set_icmp_code(echo_request::IcmpCodes::NoCode);
        request.set_identifier(ident);
        request.set_sequence_number(1);
        request.set_payload(ECHO_PAYLOAD);
        let checksum = icmp::checksum(
            &IcmpPacket::new(request.packet()).expect("echo request is a valid icmp packet"),
        );
        request.set_checksum(checksum);
    }
    buf
}

fn is_echo_reply(data: &[u8], ident: u16, privileged: bool) -> bool {
    // Raw sockets hand us the IPv4 header; datagram sockets strip it.
    let offset = if privileged {
        match data.first() {
            Some(byte) => usize::from(byte & 0x0f) * 4,
            None => return false,
        }
    } else {
        0
    };
    let reply = match data.get(offset..).and_then(EchoReplyPacket::new) {
        Some(reply) => reply,
        None => return false,
    };
    if reply.get_icmp_type() != IcmpTypes::EchoReply {
        return false;
    }
    // The kernel rewrites identifiers on datagram sockets, so only the
    // privileged path can match on ours.
    !privileged || reply.get_identifier() == ident
}

fn resolve_ipv4(host: &str) -> io::Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    (host, 0)
        .to_socket_addrs()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address for {}", host),
            )
        })
}

#[cfg(test)]
mod tests {
    use crate::ping::*;
    use pnet::packet::icmp::echo_reply::MutableEchoReplyPacket;
    use pnet::packet::icmp::echo_request::EchoRequestPacket;

    #[test]
    fn test_echo_request_fields() {
        let request = build_echo_request(0x1234);
        let packet = EchoRequestPacket::new(&request).unwrap();
        assert_eq!(packet.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_eq!(packet.get_identifier(), 0x1234);
        assert_eq!(packet.get_sequence_number(), 1);
        assert_eq!(packet.payload(), ECHO_PAYLOAD);
    }

    #[test]
    fn test_echo_request_checksum_verifies() {
        let request = build_echo_request(7);
        let packet = IcmpPacket::new(&request).unwrap();
        assert_eq!(packet.get_checksum(), icmp::checksum(&packet));
    }

    fn echo_reply(ident: u16) -> Vec<u8> {
        let mut buf = vec![0u8; MutableEchoReplyPacket::minimum_packet_size()];
        let mut reply = MutableEchoReplyPacket::new(&mut buf).unwrap();
        reply.set_icmp_type(IcmpTypes::EchoReply);
        reply.set_identifier(ident);
        drop(reply);
        buf
    }

    #[test]
    fn test_reply_matching_unprivileged() {
        let reply = echo_reply(99);
        // Identifiers are kernel-assigned on datagram sockets, so any
        // echo reply counts.
        assert!(is_echo_reply(&reply, 99, false));
        assert!(is_echo_reply(&reply, 1, false));
    }

    #[test]
    fn test_reply_matching_privileged_skips_ip_header() {
        let mut raw = vec![0u8; 20];
        raw[0] = 0x45;
        raw.extend_from_slice(&echo_reply(99));
        assert!(is_echo_reply(&raw, 99, true));
        assert!(!is_echo_reply(&raw, 1, true));
    }

    #[test]
    fn test_reply_rejects_other_icmp_types() {
        let request = build_echo_request(5);
        assert!(!is_echo_reply(&request, 5, false));
    }

    #[test]
    fn test_resolve_ipv4_literal() {
        assert_eq!(
            resolve_ipv4("192.168.1.7").unwrap(),
            Ipv4Addr::new(192, 168, 1, 7)
        );
    }
}
