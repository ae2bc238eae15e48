//! Local network resolution.
//!
//! Finds the IPv4 interface and prefix the host sits on. Reading interface
//! addresses needs no privileges; the engine resolves once per cycle and
//! hands the result to the subnet hook and to every scanner.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use pnet::datalink::{self, NetworkInterface};
use pnet::ipnetwork::IpNetwork;

use crate::error::{DiscoverError, Result};

/// The local interface address together with its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNetwork {
    pub interface: String,
    /// Host address with the interface's prefix length, e.g. `10.0.0.7/24`.
    pub addr: Ipv4Net,
}

impl LocalNetwork {
    pub fn new(interface: impl Into<String>, addr: Ipv4Net) -> Self {
        Self {
            interface: interface.into(),
            addr,
        }
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.addr.addr()
    }

    pub fn prefix_len(&self) -> u8 {
        self.addr.prefix_len()
    }

    /// The network itself, e.g. `10.0.0.0/24`.
    pub fn subnet(&self) -> Ipv4Net {
        self.addr.trunc()
    }
}

impl fmt::Display for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.addr, self.interface)
    }
}

/// Source of the local network for a scan cycle.
pub trait NetworkResolver: Send + Sync {
    fn resolve(&self) -> Result<LocalNetwork>;
}

/// A fixed network, for pinned setups and tests.
impl NetworkResolver for LocalNetwork {
    fn resolve(&self) -> Result<LocalNetwork> {
        Ok(self.clone())
    }
}

/// Resolves the network from the operating system's interface list.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver {
    preferred: Option<String>,
}

impl SystemResolver {
    /// Prefer the interface called `name` when it is usable.
    pub fn with_interface(name: impl Into<String>) -> Self {
        Self {
            preferred: Some(name.into()),
        }
    }
}

impl NetworkResolver for SystemResolver {
    fn resolve(&self) -> Result<LocalNetwork> {
        select_network(&datalink::interfaces(), self.preferred.as_deref())
    }
}

fn select_network(interfaces: &[NetworkInterface], preferred: Option<&str>) -> Result<LocalNetwork> {
    let mut candidates: Vec<(&NetworkInterface, Ipv4Net)> = interfaces
        .iter()
        .filter(|i| i.is_up() && !i.is_loopback() && !i.is_point_to_point())
        .filter_map(|i| ipv4_net(i).map(|net| (i, net)))
        .collect();

    // Preferred name first, then broadcast-capable links with a MAC (real LANs).
    candidates.sort_by_key(|(i, _)| {
        (
            preferred != Some(i.name.as_str()),
            !(i.is_broadcast() && i.mac.is_some()),
        )
    });

    let (interface, addr) = candidates
        .into_iter()
        .next()
        .ok_or(DiscoverError::NoIpv4Interface)?;

    tracing::debug!(interface = %interface.name, addr = %addr, "Resolved local network");

    Ok(LocalNetwork::new(interface.name.clone(), addr))
}

fn ipv4_net(interface: &NetworkInterface) -> Option<Ipv4Net> {
    interface.ips.iter().find_map(|net| match net {
        IpNetwork::V4(v4) if !v4.ip().is_loopback() && !v4.ip().is_link_local() => {
            Ipv4Net::new(v4.ip(), v4.prefix()).ok()
        }
        _ => None,
    })
}
