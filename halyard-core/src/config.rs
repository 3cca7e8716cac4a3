//! Runtime configuration for either role.
//!
//! Command-line flags flow into the engine only through this struct.

use crate::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

/// Everything the director and real-server roles need to run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the node this process runs on.
    pub node_name: String,
    /// Path to a kubeconfig; in-cluster configuration when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Namespace of the cluster ConfigMap.
    pub configmap_namespace: String,
    /// Name of the cluster ConfigMap.
    pub configmap_name: String,
    /// Key within the ConfigMap holding the serialized cluster config.
    pub config_key: String,

    /// Primary IP of this node.
    pub primary_ip: String,
    /// Primary network interface.
    pub interface: String,
    /// Interface carrying the VIPs.
    pub local_interface: String,

    /// TCP ports the director listens on for liveness; the real server
    /// probes the first.
    pub coordinator_ports: Vec<u16>,
    /// Consecutive down-probes required before the real server takes over.
    pub failover_timeout: u32,

    /// Global destination weight override.
    pub weight_override: Option<u32>,
    /// Treat cordoned nodes as schedulable when computing weights.
    pub ignore_cordon: bool,

    /// BGP community strings attached to every announcement.
    pub communities: Vec<String>,

    /// Name of the managed iptables chain in the nat table.
    pub iptables_chain: String,
    /// Whether to install per-VIP masquerade rules.
    pub iptables_masq: bool,
    /// Pod CIDR to masquerade, when the CNI needs it.
    pub pod_cidr_masq: Option<String>,

    /// Whether the unconditional 30-second reconcile runs.
    pub forced_reconcile: bool,

    /// `net.ipv4.vs.*` sysctls written at director startup, `key=value`.
    pub ipvs_sysctl: Vec<String>,

    /// `arp_announce` written for the VIP-carrying interface at startup.
    pub arp_announce: u8,
    /// `arp_ignore` written for the VIP-carrying interface at startup.
    pub arp_ignore: u8,

    /// Port of the plain TCP health listener.
    pub health_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            kubeconfig: None,
            configmap_namespace: "platform-load-balancer".to_string(),
            configmap_name: "halyard-config".to_string(),
            config_key: "config".to_string(),
            primary_ip: String::new(),
            interface: "eth0".to_string(),
            local_interface: "lo".to_string(),
            coordinator_ports: vec![1337],
            failover_timeout: 3,
            weight_override: None,
            ignore_cordon: false,
            communities: Vec::new(),
            iptables_chain: "HALYARD".to_string(),
            iptables_masq: true,
            pod_cidr_masq: None,
            forced_reconcile: true,
            ipvs_sysctl: Vec::new(),
            arp_announce: 0,
            arp_ignore: 0,
            health_port: 10201,
        }
    }
}

impl Config {
    /// Validate the assembled configuration.
    ///
    /// Returns a single [`Error::InvalidConfig`] naming the first problem;
    /// startup aborts with a nonzero exit on failure.
    pub fn validate(&self) -> Result<(), Error> {
        if self.node_name.is_empty() {
            return Err(Error::InvalidConfig("node name must be set".into()));
        }
        if self.primary_ip.parse::<IpAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "primary ip {:?} is not an address",
                self.primary_ip
            )));
        }
        if self.coordinator_ports.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one coordinator port is required".into(),
            ));
        }
        if self.failover_timeout == 0 {
            return Err(Error::InvalidConfig(
                "failover timeout must be at least 1".into(),
            ));
        }
        if self.iptables_chain.is_empty() {
            return Err(Error::InvalidConfig("iptables chain must be named".into()));
        }
        if let Some(cidr) = &self.pod_cidr_masq {
            if !cidr.contains('/') {
                return Err(Error::InvalidConfig(format!(
                    "pod cidr {cidr:?} is not CIDR notation"
                )));
            }
        }
        for entry in &self.ipvs_sysctl {
            if !entry.contains('=') {
                return Err(Error::InvalidConfig(format!(
                    "ipvs sysctl {entry:?} is not key=value"
                )));
            }
        }
        Ok(())
    }
}
