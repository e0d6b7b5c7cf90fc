//! Interface descriptors and selection
//!
//! The discovery plane needs to know which IPv4 interface it lives on:
//! address, netmask, broadcast, medium and speed. Candidates normally come
//! from the embedding application (which has OS-specific enumeration at
//! hand); `default_interface` builds a workable descriptor from a
//! connected-UDP probe when nothing better is available.

use std::net::{Ipv4Addr, UdpSocket};

use crate::config::InterfaceFilter;

use super::HardwareKind;

/// One IPv4 interface candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub mac: Option<[u8; 6]>,
    pub kind: HardwareKind,
    pub speed_mbits: u32,
}

impl NetInterface {
    /// Directed broadcast address of the subnet
    pub fn broadcast(&self) -> Ipv4Addr {
        let ip = u32::from(self.ip);
        let mask = u32::from(self.mask);
        Ipv4Addr::from(ip | !mask)
    }

    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }

    /// Loopback descriptor, used by tests and single-host setups
    pub fn loopback() -> Self {
        Self {
            name: "lo".to_string(),
            ip: Ipv4Addr::LOCALHOST,
            mask: Ipv4Addr::new(255, 0, 0, 0),
            gateway: None,
            mac: None,
            kind: HardwareKind::Loopback,
            speed_mbits: 10_000,
        }
    }
}

/// RFC 1918 check used by the `local_only` filter
fn is_private(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10 || (o[0] == 172 && (16..32).contains(&o[1])) || (o[0] == 192 && o[1] == 168)
}

/// Learn the outbound IPv4 address by connecting a throwaway UDP socket.
/// No packet is sent; the kernel just picks the route.
pub fn probe_local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

/// Best-effort descriptor when the application supplied no candidates:
/// probed address with an assumed /24, or loopback as the last resort.
pub fn default_interface() -> NetInterface {
    match probe_local_ipv4() {
        Some(ip) if !ip.is_loopback() => NetInterface {
            name: "auto".to_string(),
            ip,
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            mac: None,
            kind: HardwareKind::Unknown,
            speed_mbits: 1000,
        },
        _ => NetInterface::loopback(),
    }
}

/// Apply the configured filter and ranking to interface candidates.
///
/// `mac_order` is the explicit MAC-address preference list; when given it
/// dominates the ranking (a former process-global, now a plain parameter).
pub fn select_interface(
    candidates: &[NetInterface],
    filter: &InterfaceFilter,
    mac_order: Option<&[String]>,
) -> Option<NetInterface> {
    let mut viable: Vec<&NetInterface> = candidates
        .iter()
        .filter(|c| !c.ip.is_unspecified())
        .filter(|c| !filter.ethernet_only || c.kind == HardwareKind::Ethernet)
        .filter(|c| !filter.local_only || is_private(c.ip))
        .filter(|c| !filter.require_broadcast || c.broadcast() != c.ip)
        .collect();
    if viable.is_empty() {
        return None;
    }
    viable.sort_by_key(|c| {
        let mac_rank = mac_order
            .and_then(|order| {
                let mac = c.mac?;
                let text = mac_text(&mac);
                order.iter().position(|m| m.eq_ignore_ascii_case(&text))
            })
            .unwrap_or(usize::MAX);
        let kind_rank = if filter.ignore_kind { 0 } else { c.kind.preference_rank() };
        let speed_rank = if filter.ignore_speed { 0 } else { u32::MAX - c.speed_mbits };
        let gateway_rank = if filter.ignore_gateway || c.gateway.is_some() { 0 } else { 1u8 };
        (mac_rank, kind_rank, gateway_rank, speed_rank)
    });
    Some(viable[0].clone())
}

fn mac_text(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}
