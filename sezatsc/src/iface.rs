//! Local interface enumeration for link-local appliance discovery.
//!
//! Appliances self-assign 169.254.0.0/16 addresses, so discovery only makes
//! sense on interfaces that carry a link-local IPv4 address with the exact
//! /16 netmask.

use std::net::Ipv4Addr;

use log::debug;
use nix::ifaddrs::getifaddrs;

use crate::error::{Error, Result};

/// An interface eligible for appliance discovery.
#[derive(Debug, Clone)]
pub struct LinkLocalIf {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl LinkLocalIf {
    /// Directed broadcast address for this interface.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.netmask))
    }
}

/// True when `addr`/`netmask` is a link-local /16 assignment.
pub fn is_link_local(addr: Ipv4Addr, netmask: Ipv4Addr) -> bool {
    u32::from(addr) & 0xffff_0000 == 0xa9fe_0000 && u32::from(netmask) == 0xffff_0000
}

/// Enumerate interfaces carrying a link-local IPv4 address.
pub fn link_local_interfaces() -> Result<Vec<LinkLocalIf>> {
    let mut found = Vec::new();
    for ifa in getifaddrs()? {
        let Some(addr) = ifa
            .address
            .as_ref()
            .and_then(|sa| sa.as_sockaddr_in())
            .map(|sin| sin.ip())
        else {
            continue;
        };
        let Some(netmask) = ifa
            .netmask
            .as_ref()
            .and_then(|sa| sa.as_sockaddr_in())
            .map(|sin| sin.ip())
        else {
            continue;
        };
        if !is_link_local(addr, netmask) {
            debug!("{}: {addr} is not 169.254/16, skipping", ifa.interface_name);
            continue;
        }
        found.push(LinkLocalIf {
            name: ifa.interface_name,
            addr,
            netmask,
        });
    }
    Ok(found)
}

/// Hardware address of the named interface.
pub fn hw_addr(name: &str) -> Result<[u8; 6]> {
    for ifa in getifaddrs()? {
        if ifa.interface_name != name {
            continue;
        }
        if let Some(mac) = ifa
            .address
            .as_ref()
            .and_then(|sa| sa.as_link_addr())
            .and_then(|link| link.addr())
        {
            return Ok(mac);
        }
    }
    Err(Error::InvalidArgument(format!(
        "no hardware address found for interface {name}"
    )))
}
