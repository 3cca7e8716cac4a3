//! Cluster configuration and node types.
//!
//! [`ClusterConfig`] is the desired state delivered wholesale by the
//! ConfigMap watch; [`Node`] and its endpoint types are rebuilt from the
//! nodes and endpoints watches. Both are overwritten on every delivery, so
//! everything here is cheap to clone and carries no behavior beyond
//! accessors and the semantic equality used to drop no-op node updates.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address family selector used throughout the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4 (`/32` VIPs).
    V4,
    /// IPv6 (`/128` VIPs).
    V6,
}

impl AddressFamily {
    /// Metric label value for this family.
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ipv4",
            AddressFamily::V6 => "ipv6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Parse from the Kubernetes service port protocol field.
    pub fn parse(s: &str) -> Protocol {
        if s.eq_ignore_ascii_case("udp") {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    /// Lowercase name, as used in iptables rules.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Packet forwarding method for an IPVS destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForwardingMethod {
    /// Direct routing (`-g`).
    #[default]
    Gatewaying,
    /// IP-in-IP tunneling (`-i`).
    Tunneling,
    /// NAT (`-m`).
    Masquerading,
}

impl ForwardingMethod {
    /// Parse the single-letter form carried in the config ("g", "i", "m").
    /// Anything unrecognized falls back to direct routing.
    pub fn parse(s: &str) -> ForwardingMethod {
        match s {
            "i" => ForwardingMethod::Tunneling,
            "m" => ForwardingMethod::Masquerading,
            _ => ForwardingMethod::Gatewaying,
        }
    }

    /// The ipvsadm flag for this method.
    pub fn flag(&self) -> &'static str {
        match self {
            ForwardingMethod::Gatewaying => "-g",
            ForwardingMethod::Tunneling => "-i",
            ForwardingMethod::Masquerading => "-m",
        }
    }
}

/// Per-service IPVS tuning carried in the ConfigMap payload.
///
/// Raw string fields preserve whatever the config carried; accessors apply
/// the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpvsOptions {
    /// Scheduler name ("wrr", "mh", ...). Empty means the default.
    #[serde(rename = "scheduler")]
    pub raw_scheduler: String,
    /// Scheduler flags, e.g. "flag-1,flag-2" for maglev variants.
    pub flags: Option<String>,
    /// Forwarding method letter ("g", "i", "m"). Empty means direct routing.
    #[serde(rename = "forwardingMethod")]
    pub raw_forwarding_method: String,
    /// Persistence timeout in seconds, when session affinity is wanted.
    pub persistence_timeout: Option<u32>,
}

impl IpvsOptions {
    /// Effective scheduler, defaulting to weighted round-robin.
    pub fn scheduler(&self) -> &str {
        if self.raw_scheduler.is_empty() {
            "wrr"
        } else {
            &self.raw_scheduler
        }
    }

    /// Effective forwarding method.
    pub fn forwarding_method(&self) -> ForwardingMethod {
        ForwardingMethod::parse(&self.raw_forwarding_method)
    }
}

/// One service exposed behind a VIP port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDef {
    /// Kubernetes namespace of the backing service.
    pub namespace: String,
    /// Service name.
    pub service: String,
    /// Named port on the service; resolved to a numeric port and protocol
    /// through the services index at reconcile time.
    pub port_name: String,
    /// IPVS tuning for this listener.
    #[serde(default)]
    pub ipvs_options: IpvsOptions,
}

impl ServiceDef {
    /// The `namespace/service:portName` identity used by the services index.
    pub fn identity(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.service, self.port_name)
    }
}

/// Port (canonical decimal string) to service definition.
pub type PortMap = HashMap<String, ServiceDef>;

/// The desired state, delivered wholesale on every ConfigMap change.
///
/// VIP keys are address strings as the ConfigMap carried them; entries that
/// fail to parse as an address of the right family are skipped where they
/// are used. Absence of a VIP means "not desired".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// IPv4 VIP to port map.
    pub config: HashMap<String, PortMap>,
    /// IPv6 VIP to port map.
    pub config6: HashMap<String, PortMap>,
    /// IPv4 VIP to MTU override.
    pub mtu_config: HashMap<String, u32>,
    /// IPv6 VIP to MTU override.
    pub mtu_config6: HashMap<String, u32>,
}

impl ClusterConfig {
    /// The VIP map for one family.
    pub fn vips(&self, family: AddressFamily) -> &HashMap<String, PortMap> {
        match family {
            AddressFamily::V4 => &self.config,
            AddressFamily::V6 => &self.config6,
        }
    }

    /// The MTU override map for one family.
    pub fn mtus(&self, family: AddressFamily) -> &HashMap<String, u32> {
        match family {
            AddressFamily::V4 => &self.mtu_config,
            AddressFamily::V6 => &self.mtu_config6,
        }
    }

    /// Whether a VIP is configured in either family.
    pub fn contains_vip(&self, vip: &str) -> bool {
        self.config.contains_key(vip) || self.config6.contains_key(vip)
    }
}

/// A pool of pod addresses backing one service from one node.
#[derive(Debug, Clone, Default)]
pub struct Subset {
    /// Ready pod addresses on this node.
    pub addresses: Vec<String>,
    /// Ports exposed by the subset.
    pub ports: Vec<SubsetPort>,
}

/// A port entry within an endpoints subset.
#[derive(Debug, Clone)]
pub struct SubsetPort {
    /// Port name, possibly empty.
    pub name: String,
    /// Numeric port.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

/// Endpoints for one service hosted (in part) on one node.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    /// Service namespace.
    pub namespace: String,
    /// Service name.
    pub service: String,
    /// Ready subsets, restricted to this node's pods.
    pub subsets: Vec<Subset>,
}

/// A cluster node together with the endpoints it hosts.
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Node name.
    pub name: String,
    /// Node addresses, internal address first.
    pub addresses: Vec<String>,
    /// Whether the node is cordoned.
    pub unschedulable: bool,
    /// Endpoints hosted on this node.
    pub endpoints: Vec<NodeEndpoint>,
}

impl Node {
    /// First node address of the requested family, if any.
    pub fn primary_address(&self, family: AddressFamily) -> Option<&str> {
        self.addresses.iter().map(String::as_str).find(|a| match family {
            AddressFamily::V4 => a.parse::<Ipv4Addr>().is_ok(),
            AddressFamily::V6 => a.parse::<Ipv6Addr>().is_ok(),
        })
    }

    /// Number of ready pod addresses backing `namespace/service` on this node.
    pub fn pods_for(&self, namespace: &str, service: &str) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.namespace == namespace && e.service == service)
            .flat_map(|e| e.subsets.iter())
            .map(|s| s.addresses.len())
            .sum()
    }

    /// Whether at least one ready subset backs `namespace/service` here.
    pub fn has_endpoints_for(&self, namespace: &str, service: &str) -> bool {
        self.pods_for(namespace, service) > 0
    }
}

/// Ordered sequence of nodes as delivered by the watch.
pub type NodesList = Vec<Node>;

/// Semantic equality of two node lists.
///
/// Equal iff both hold the same set of nodes by name, each with the same
/// schedulability and the same per-service ready-endpoint multiset.
/// Insertion order of nodes and endpoints is irrelevant.
pub fn nodes_equal(a: &[Node], b: &[Node]) -> bool {
    fn signature(nodes: &[Node]) -> BTreeMap<&str, (bool, BTreeMap<(&str, &str), usize>)> {
        let mut out = BTreeMap::new();
        for node in nodes {
            let mut endpoints: BTreeMap<(&str, &str), usize> = BTreeMap::new();
            for ep in &node.endpoints {
                let ready: usize = ep.subsets.iter().map(|s| s.addresses.len()).sum();
                *endpoints
                    .entry((ep.namespace.as_str(), ep.service.as_str()))
                    .or_default() += ready;
            }
            out.insert(node.name.as_str(), (node.unschedulable, endpoints));
        }
        out
    }

    if a.len() != b.len() {
        return false;
    }
    signature(a) == signature(b)
}

/// Resolved cluster address for one service port identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddr {
    /// Cluster IP of the service.
    pub cluster_ip: String,
    /// Numeric port behind the named port.
    pub port: u16,
    /// Protocol of the port.
    pub protocol: Protocol,
}

/// `namespace/service:portName` to resolved cluster address.
///
/// Rebuilt on every services watch delivery and carried inside the store
/// snapshot, so resolution at reconcile time is a plain map lookup.
#[derive(Debug, Clone, Default)]
pub struct ServicesIndex {
    entries: HashMap<String, ServiceAddr>,
}

impl ServicesIndex {
    /// Record a resolved identity.
    pub fn insert(&mut self, identity: String, addr: ServiceAddr) {
        self.entries.insert(identity, addr);
    }

    /// Resolve an identity, if the services watch has seen it.
    pub fn resolve(&self, identity: &str) -> Option<&ServiceAddr> {
        self.entries.get(identity)
    }

    /// Number of resolvable identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Device names observed on the loopback interface, one list per family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedAddresses {
    /// Managed IPv4 device names.
    pub v4: Vec<String>,
    /// Managed IPv6 device names.
    pub v6: Vec<String>,
}

impl ObservedAddresses {
    /// The list for one family.
    pub fn family(&self, family: AddressFamily) -> &[String] {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }
}
