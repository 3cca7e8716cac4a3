//! Role subcommands.

pub mod director;
pub mod realserver;

use clap::Args;
use halyard_core::Config;
use std::path::PathBuf;

/// Flags shared by both roles. Everything flows into the engine through
/// [`Config`].
#[derive(Args, Debug)]
pub struct RoleArgs {
    /// Name of the node this process runs on
    #[arg(long, env = "HALYARD_NODE_NAME")]
    node_name: String,

    /// Path to a kubeconfig; in-cluster configuration when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Namespace of the cluster ConfigMap
    #[arg(long, default_value = "platform-load-balancer")]
    configmap_namespace: String,

    /// Name of the cluster ConfigMap
    #[arg(long, default_value = "halyard-config")]
    configmap_name: String,

    /// Key within the ConfigMap holding the serialized cluster config
    #[arg(long, default_value = "config")]
    config_key: String,

    /// Primary IP of this node
    #[arg(long, env = "HALYARD_PRIMARY_IP")]
    primary_ip: String,

    /// Primary network interface
    #[arg(long, default_value = "eth0")]
    interface: String,

    /// Interface carrying the VIPs
    #[arg(long, default_value = "lo")]
    local_interface: String,

    /// Coordination TCP ports; the director listens on all of them and a
    /// real server probes the first
    #[arg(long = "coordinator-port", default_value = "1337")]
    coordinator_ports: Vec<u16>,

    /// Consecutive down-probes before a real server takes over
    #[arg(long, default_value_t = 3)]
    failover_timeout: u32,

    /// Global destination weight override
    #[arg(long)]
    weight_override: Option<u32>,

    /// Keep cordoned nodes weighted
    #[arg(long)]
    ignore_cordon: bool,

    /// BGP community attached to every announcement; repeatable
    #[arg(long = "community")]
    communities: Vec<String>,

    /// Managed iptables chain in the nat table
    #[arg(long, default_value = "HALYARD")]
    iptables_chain: String,

    /// Skip per-VIP masquerade rules
    #[arg(long)]
    no_masq: bool,

    /// Pod CIDR to masquerade
    #[arg(long)]
    pod_cidr_masq: Option<String>,

    /// Disable the unconditional 30-second reconcile
    #[arg(long)]
    no_forced_reconcile: bool,

    /// net.ipv4.vs sysctl as key=value; repeatable
    #[arg(long = "ipvs-sysctl")]
    ipvs_sysctl: Vec<String>,

    /// arp_announce value written for the VIP interface at startup
    #[arg(long, default_value_t = 0)]
    arp_announce: u8,

    /// arp_ignore value written for the VIP interface at startup
    #[arg(long, default_value_t = 0)]
    arp_ignore: u8,

    /// Health listener port (defaults to 10201 for the director, 10200
    /// for a real server)
    #[arg(long)]
    health_port: Option<u16>,
}

impl RoleArgs {
    /// Assemble the engine config, filling the role-specific health port.
    pub fn into_config(self, default_health_port: u16) -> Config {
        Config {
            node_name: self.node_name,
            kubeconfig: self.kubeconfig,
            configmap_namespace: self.configmap_namespace,
            configmap_name: self.configmap_name,
            config_key: self.config_key,
            primary_ip: self.primary_ip,
            interface: self.interface,
            local_interface: self.local_interface,
            coordinator_ports: self.coordinator_ports,
            failover_timeout: self.failover_timeout,
            weight_override: self.weight_override,
            ignore_cordon: self.ignore_cordon,
            communities: self.communities,
            iptables_chain: self.iptables_chain,
            iptables_masq: !self.no_masq,
            pod_cidr_masq: self.pod_cidr_masq,
            forced_reconcile: !self.no_forced_reconcile,
            ipvs_sysctl: self.ipvs_sysctl,
            arp_announce: self.arp_announce,
            arp_ignore: self.arp_ignore,
            health_port: self.health_port.unwrap_or(default_health_port),
        }
    }
}
