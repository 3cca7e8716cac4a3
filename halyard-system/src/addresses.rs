//! Loopback VIP addresses through the iproute2 surface.
//!
//! IPv4 VIPs are `/32` addresses carrying a managed label; IPv6 VIPs are
//! `/128` addresses identified by their synthetic device name. Observation
//! parses `ip -json addr show` so no screen-scraping format drifts under
//! us.

use crate::exec::run;
use async_trait::async_trait;
use halyard_core::device;
use halyard_core::error::{Error, Result};
use halyard_core::traits::AddressBackend;
use halyard_core::types::{AddressFamily, ObservedAddresses};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct LinkEntry {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
    #[serde(default)]
    mtu: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
    #[serde(default)]
    label: Option<String>,
}

/// Derive the managed device-name lists from `ip -json addr show` output.
///
/// The kernel's own loopback addresses (127.0.0.1/8, ::1/128) never carry
/// the managed shape and are excluded, so cleanup and drift removal stay
/// scoped to what this process manages.
fn parse_observed(json: &str) -> Result<ObservedAddresses> {
    let links: Vec<LinkEntry> = serde_json::from_str(json).map_err(|e| Error::Parse {
        what: "ip addr json",
        detail: e.to_string(),
    })?;
    let mut observed = ObservedAddresses::default();
    for info in links.iter().flat_map(|l| l.addr_info.iter()) {
        match info.family.as_str() {
            "inet" if info.prefixlen == 32 => {
                if let Some(label) = &info.label {
                    if label.starts_with(device::V4_PREFIX) {
                        observed.v4.push(label.clone());
                    }
                }
            }
            "inet6" if info.prefixlen == 128 => {
                let Ok(addr) = info.local.parse::<Ipv6Addr>() else {
                    continue;
                };
                if addr.is_loopback() {
                    continue;
                }
                if let Some(name) = device::device_name(&info.local, AddressFamily::V6) {
                    observed.v6.push(name);
                }
            }
            _ => {}
        }
    }
    observed.v4.sort();
    observed.v6.sort();
    Ok(observed)
}

fn parse_link_mtu(json: &str) -> Result<Option<u32>> {
    let links: Vec<LinkEntry> = serde_json::from_str(json).map_err(|e| Error::Parse {
        what: "ip link json",
        detail: e.to_string(),
    })?;
    Ok(links.first().and_then(|l| l.mtu))
}

/// The smallest configured override; the hosting link must fit every VIP.
fn effective_mtu(mtus: &HashMap<String, u32>) -> Option<u32> {
    mtus.values().copied().min()
}

/// Address backend driving the `ip` binary against one interface.
pub struct LoopbackAddresses {
    device: String,
    ip_bin: String,
}

impl LoopbackAddresses {
    /// Manage VIP addresses on `device` (normally `lo`).
    pub fn new(device: impl Into<String>) -> Self {
        LoopbackAddresses {
            device: device.into(),
            ip_bin: "ip".to_string(),
        }
    }
}

#[async_trait]
impl AddressBackend for LoopbackAddresses {
    async fn observe(&self) -> Result<ObservedAddresses> {
        let out = run(
            &self.ip_bin,
            ["-json", "addr", "show", "dev", self.device.as_str()],
        )
        .await?;
        parse_observed(&out)
    }

    async fn add(&self, vip: &str, family: AddressFamily) -> Result<()> {
        let name = device::device_name(vip, family).ok_or_else(|| {
            Error::InvalidConfig(format!("vip {vip:?} is not representable for {family}"))
        })?;
        match family {
            AddressFamily::V4 => {
                let cidr = format!("{vip}/32");
                run(
                    &self.ip_bin,
                    [
                        "addr",
                        "add",
                        cidr.as_str(),
                        "dev",
                        self.device.as_str(),
                        "label",
                        name.as_str(),
                    ],
                )
                .await?;
            }
            AddressFamily::V6 => {
                let cidr = format!("{vip}/128");
                run(
                    &self.ip_bin,
                    ["-6", "addr", "add", cidr.as_str(), "dev", self.device.as_str()],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn remove(&self, dev: &str, family: AddressFamily) -> Result<()> {
        let addr = device::device_address(dev).ok_or_else(|| Error::Parse {
            what: "managed device name",
            detail: dev.to_string(),
        })?;
        debug!(device = %dev, addr = %addr, "removing loopback address");
        match (family, addr) {
            (AddressFamily::V4, IpAddr::V4(v4)) => {
                let cidr = format!("{v4}/32");
                run(
                    &self.ip_bin,
                    ["addr", "del", cidr.as_str(), "dev", self.device.as_str()],
                )
                .await?;
            }
            (AddressFamily::V6, IpAddr::V6(v6)) => {
                let cidr = format!("{v6}/128");
                run(
                    &self.ip_bin,
                    ["-6", "addr", "del", cidr.as_str(), "dev", self.device.as_str()],
                )
                .await?;
            }
            _ => {
                return Err(Error::Parse {
                    what: "managed device name",
                    detail: format!("{dev} does not match family {family}"),
                })
            }
        }
        Ok(())
    }

    /// VIP labels share the hosting link, so the override applied is the
    /// smallest one configured; nothing is issued when the link already
    /// matches.
    async fn set_mtu(&self, mtus: &HashMap<String, u32>, _family: AddressFamily) -> Result<()> {
        let Some(target) = effective_mtu(mtus) else {
            return Ok(());
        };
        let out = run(
            &self.ip_bin,
            ["-json", "link", "show", "dev", self.device.as_str()],
        )
        .await?;
        if parse_link_mtu(&out)? == Some(target) {
            return Ok(());
        }
        info!(device = %self.device, mtu = target, "setting link mtu");
        let mtu = target.to_string();
        run(
            &self.ip_bin,
            ["link", "set", "dev", self.device.as_str(), "mtu", mtu.as_str()],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "ifindex": 1,
            "ifname": "lo",
            "mtu": 65536,
            "addr_info": [
                {"family": "inet", "local": "127.0.0.1", "prefixlen": 8, "label": "lo"},
                {"family": "inet", "local": "10.54.213.148", "prefixlen": 32, "label": "lo:hal0a36d594"},
                {"family": "inet", "local": "192.0.2.7", "prefixlen": 32, "label": "lo:other"},
                {"family": "inet6", "local": "::1", "prefixlen": 128},
                {"family": "inet6", "local": "2001:db8::1", "prefixlen": 128}
            ]
        }
    ]"#;

    #[test]
    fn observe_parses_managed_addresses_only() {
        let observed = parse_observed(SAMPLE).unwrap();
        assert_eq!(observed.v4, vec!["lo:hal0a36d594".to_string()]);
        assert_eq!(
            observed.v6,
            vec![format!("hal6-{:032x}", u128::from("2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap()))]
        );
    }

    #[test]
    fn observe_skips_kernel_loopback_addresses() {
        let observed = parse_observed(SAMPLE).unwrap();
        assert!(!observed.v4.iter().any(|d| d.contains("127")));
        assert!(observed.v6.len() == 1);
    }

    #[test]
    fn link_mtu_parses() {
        assert_eq!(parse_link_mtu(SAMPLE).unwrap(), Some(65536));
    }

    #[test]
    fn effective_mtu_is_the_minimum_override() {
        let mut mtus = HashMap::new();
        assert_eq!(effective_mtu(&mtus), None);
        mtus.insert("10.0.0.1".to_string(), 1500);
        mtus.insert("10.0.0.2".to_string(), 1380);
        assert_eq!(effective_mtu(&mtus), Some(1380));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            parse_observed("not json"),
            Err(Error::Parse { .. })
        ));
    }
}
