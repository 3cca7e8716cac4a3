//! Loopback device-name derivation and address diffing.
//!
//! A VIP is represented on the loopback interface by a device name that
//! encodes the address: IPv4 VIPs as an address label (`lo:hal` plus eight
//! hex digits, within the kernel's 15-character label limit), IPv6 VIPs as
//! a synthetic `hal6-` key over the `/128` set (v6 addresses carry no
//! labels). Derivation is deterministic and injective, so diffing device
//! names is equivalent to diffing VIP sets.

use crate::types::{AddressFamily, ClusterConfig};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Label prefix for managed IPv4 addresses on the loopback.
pub const V4_PREFIX: &str = "lo:hal";

/// Name prefix for managed IPv6 addresses.
pub const V6_PREFIX: &str = "hal6-";

/// Derive the managed device name for a VIP string.
///
/// Returns `None` when the string does not parse as an address of the
/// requested family; such VIPs are silently dropped from the desired set.
pub fn device_name(vip: &str, family: AddressFamily) -> Option<String> {
    match family {
        AddressFamily::V4 => {
            let addr: Ipv4Addr = vip.trim().parse().ok()?;
            Some(format!("{V4_PREFIX}{:08x}", u32::from(addr)))
        }
        AddressFamily::V6 => {
            let addr: Ipv6Addr = vip.trim().parse().ok()?;
            Some(format!("{V6_PREFIX}{:032x}", u128::from(addr)))
        }
    }
}

/// Recover the VIP encoded in a managed device name.
pub fn device_address(device: &str) -> Option<IpAddr> {
    if let Some(hex) = device.strip_prefix(V4_PREFIX) {
        let raw = u32::from_str_radix(hex, 16).ok()?;
        return Some(IpAddr::V4(Ipv4Addr::from(raw)));
    }
    if let Some(hex) = device.strip_prefix(V6_PREFIX) {
        let raw = u128::from_str_radix(hex, 16).ok()?;
        return Some(IpAddr::V6(Ipv6Addr::from(raw)));
    }
    None
}

/// Desired device names for one family, with the name-to-VIP mapping used
/// when issuing additions.
pub fn desired_devices(
    config: &ClusterConfig,
    family: AddressFamily,
) -> (Vec<String>, HashMap<String, String>) {
    let mut names = Vec::new();
    let mut to_addr = HashMap::new();
    for vip in config.vips(family).keys() {
        if let Some(name) = device_name(vip, family) {
            names.push(name.clone());
            to_addr.insert(name, vip.clone());
        }
    }
    names.sort();
    (names, to_addr)
}

/// Set difference between observed and desired device names.
///
/// Returns `(to_remove, to_add)`, each sorted. Order of the inputs is
/// irrelevant and the total operation count equals the size of the
/// symmetric difference.
pub fn diff(observed: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let mut to_remove: Vec<String> = observed
        .iter()
        .filter(|d| !desired.contains(d))
        .cloned()
        .collect();
    let mut to_add: Vec<String> = desired
        .iter()
        .filter(|d| !observed.contains(d))
        .cloned()
        .collect();
    to_remove.sort();
    to_remove.dedup();
    to_add.sort();
    to_add.dedup();
    (to_remove, to_add)
}
