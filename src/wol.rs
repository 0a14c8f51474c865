use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::str::FromStr;

use log::warn;
use nix::ifaddrs;
use nix::net::if_::InterfaceFlags;
use thiserror::Error;

const SYNCHRONIZATION_SCHEME: [u8; 6] = [0xff; 6];

/// UDP port magic packets are conventionally sent to.
pub const WOL_PORT: u16 = 9;

/// Wire size of a magic packet: the synchronization scheme plus the
/// hardware address repeated sixteen times.
pub const MAGIC_PACKET_LEN: usize = 102;

/// A six-byte hardware (MAC) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareAddr([u8; 6]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseHardwareAddrError {
    #[error("expected six octets separated by ':' or '-', got {0} groups")]
    WrongGroupCount(usize),
    #[error("invalid octet {0:?}")]
    InvalidOctet(String),
}

impl HardwareAddr {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for HardwareAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl FromStr for HardwareAddr {
    type Err = ParseHardwareAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains(':') { ':' } else { '-' };
        let groups: Vec<&str> = s.split(separator).collect();
        if groups.len() != 6 {
            return Err(ParseHardwareAddrError::WrongGroupCount(groups.len()));
        }
        let mut bytes = [0u8; 6];
        for (i, group) in groups.iter().enumerate() {
            if group.len() != 2 {
                return Err(ParseHardwareAddrError::InvalidOctet(group.to_string()));
            }
            bytes[i] = u8::from_str_radix(group, 16)
                .map_err(|_| ParseHardwareAddrError::InvalidOctet(group.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Errors from delivering a magic packet.
#[derive(Debug, Error)]
pub enum WolError {
    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[from] nix::Error),
    #[error("failed to send magic packet: {0}")]
    Send(#[from] io::Error),
}

/// A wake-on-LAN packet for one hardware address.
pub struct MagicPacket {
    mac: HardwareAddr,
}

impl MagicPacket {
    pub fn new(mac: HardwareAddr) -> Self {
        Self { mac }
    }

    /// The wire form of the packet.
    pub fn bytes(&self) -> [u8; MAGIC_PACKET_LEN] {
        let mut packet = [0u8; MAGIC_PACKET_LEN];
        packet[..6].copy_from_slice(&SYNCHRONIZATION_SCHEME);
        for i in 1..=16 {
            packet[i * 6..(i + 1) * 6].copy_from_slice(self.mac.as_bytes());
        }
        packet
    }

    /// Sends the packet to the directed broadcast address of every usable
    /// interface, querying the interface list fresh on each call.
    ///
    /// One delivered send is a success; the extra copies on multi-homed
    /// hosts are harmless. With zero delivered sends the global broadcast
    /// address gets a single fallback attempt.
    pub fn broadcast(&self) -> Result<(), WolError> {
        let packet = self.bytes();
        let mut sent = false;

        for entry in ifaddrs::getifaddrs()? {
            if !wants_broadcast(entry.flags) {
                continue;
            }
            let ip = match entry.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                Some(sin) => Ipv4Addr::from(sin.ip()),
                None => continue,
            };
            let mask = match entry.netmask.as_ref().and_then(|m| m.as_sockaddr_in()) {
                Some(sin) => Ipv4Addr::from(sin.ip()),
                None => continue,
            };
            let target = SocketAddrV4::new(broadcast_addr(ip, mask), WOL_PORT);
            match send_packet(&packet, SocketAddr::V4(target)) {
                Ok(()) => sent = true,
                Err(err) => warn!(
                    "send to {} on {} failed: {}",
                    target, entry.interface_name, err
                ),
            }
        }

        if sent {
            return Ok(());
        }
        send_packet(
            &packet,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, WOL_PORT)),
        )
        .map_err(WolError::Send)
    }

    /// Sends the packet once to an explicit `host:port` target (wake over
    /// WAN). No fallback; the caller sees the write error verbatim.
    pub fn send<A: ToSocketAddrs>(&self, target: A) -> io::Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.send_to(&self.bytes(), target)?;
        Ok(())
    }
}

fn wants_broadcast(flags: InterfaceFlags) -> bool {
    flags.contains(InterfaceFlags::IFF_UP)
        && flags.contains(InterfaceFlags::IFF_BROADCAST)
        && !flags.contains(InterfaceFlags::IFF_LOOPBACK)
}

/// Directed broadcast address: host address OR complement of the netmask.
fn broadcast_addr(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let ip = ip.octets();
    let mask = mask.octets();
    Ipv4Addr::new(
        ip[0] | !mask[0],
        ip[1] | !mask[1],
        ip[2] | !mask[2],
        ip[3] | !mask[3],
    )
}

// One socket per target; dropping it releases the descriptor before the
// next attempt, whether the send worked or not.
fn send_packet(packet: &[u8], target: SocketAddr) -> io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_broadcast(true)?;
    socket.send_to(packet, target)?;
    Ok(())
}
