//! Derivation of the managed nat-chain rule set.
//!
//! Rules are rendered in iptables-save normal form so the desired set can
//! be compared verbatim against `iptables-save` output for the managed
//! chain.

use crate::config::Config;
use crate::types::{AddressFamily, ClusterConfig, Protocol, ServicesIndex};
use std::net::Ipv4Addr;

/// Compute the desired rule set for the managed chain.
///
/// One masquerade rule per `(VIP, port, protocol)` when per-VIP masquerade
/// is enabled, preceded by the pod-CIDR masquerade rule when one is
/// configured. Output is sorted for deterministic comparison.
pub fn desired_rules(config: &ClusterConfig, services: &ServicesIndex, cfg: &Config) -> Vec<String> {
    let mut rules = Vec::new();

    if let Some(cidr) = &cfg.pod_cidr_masq {
        rules.push(format!("-s {cidr} -j MASQUERADE"));
    }

    if cfg.iptables_masq {
        for (vip, ports) in config.vips(AddressFamily::V4) {
            if vip.parse::<Ipv4Addr>().is_err() {
                continue;
            }
            for (port_str, def) in ports {
                let Ok(port) = port_str.parse::<u16>() else {
                    continue;
                };
                let protocol = services
                    .resolve(&def.identity())
                    .map(|a| a.protocol)
                    .unwrap_or(Protocol::Tcp);
                let proto = protocol.as_str();
                rules.push(format!(
                    "-d {vip}/32 -p {proto} -m {proto} --dport {port} -j MASQUERADE"
                ));
            }
        }
    }

    rules.sort();
    rules.dedup();
    rules
}

/// Rules to delete and to append, by set difference against the observed
/// chain contents.
pub fn diff_rules(observed: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let mut to_delete: Vec<String> = observed
        .iter()
        .filter(|r| !desired.contains(r))
        .cloned()
        .collect();
    let mut to_append: Vec<String> = desired
        .iter()
        .filter(|r| !observed.contains(r))
        .cloned()
        .collect();
    to_delete.sort();
    to_append.sort();
    (to_delete, to_append)
}
