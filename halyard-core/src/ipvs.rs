//! IPVS desired-state derivation and minimal action planning.
//!
//! Derivation is a pure function over a snapshot, so the parity checker and
//! the apply path compute the identical rule set. Planning compares a
//! desired set against the observed kernel state and emits only the
//! operations whose absence would leave drift behind.

use crate::config::Config;
use crate::types::{
    AddressFamily, ClusterConfig, ForwardingMethod, Node, Protocol, ServicesIndex,
};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

/// Identity of a virtual service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    /// Virtual IP.
    pub vip: String,
    /// Service port.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl ServiceKey {
    /// `vip:port` with IPv6 addresses bracketed, as ipvsadm renders it.
    pub fn endpoint(&self) -> String {
        format_endpoint(&self.vip, self.port)
    }
}

/// A real-server destination behind a virtual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpvsDestination {
    /// Real server address.
    pub address: String,
    /// Real server port.
    pub port: u16,
    /// Destination weight.
    pub weight: u32,
    /// Forwarding method.
    pub forwarding_method: ForwardingMethod,
}

impl IpvsDestination {
    /// `address:port` with IPv6 addresses bracketed.
    pub fn endpoint(&self) -> String {
        format_endpoint(&self.address, self.port)
    }
}

/// A virtual service with its destination set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpvsService {
    /// Service identity.
    pub key: ServiceKey,
    /// Scheduler name.
    pub scheduler: String,
    /// Scheduler flags, when the scheduler takes any.
    pub sched_flags: Option<String>,
    /// Persistence timeout in seconds.
    pub persistence_timeout: Option<u32>,
    /// Destinations, sorted by `(address, port)`.
    pub destinations: Vec<IpvsDestination>,
}

impl IpvsService {
    fn same_service_params(&self, other: &IpvsService) -> bool {
        self.scheduler == other.scheduler
            && self.sched_flags == other.sched_flags
            && self.persistence_timeout == other.persistence_timeout
    }
}

/// One mutating IPVS operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpvsAction {
    /// Add a virtual service (destinations are added separately).
    AddService(IpvsService),
    /// Update scheduler/flags/persistence of an existing virtual service.
    EditService(IpvsService),
    /// Remove a virtual service and everything behind it.
    DeleteService(ServiceKey),
    /// Add a destination to a virtual service.
    AddDestination(ServiceKey, IpvsDestination),
    /// Update weight/forwarding of an existing destination.
    EditDestination(ServiceKey, IpvsDestination),
    /// Remove a destination.
    DeleteDestination(ServiceKey, IpvsDestination),
}

/// Format `host:port`, bracketing IPv6 hosts.
pub fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Destination weight for one node backing one service.
///
/// The weight is the ready pod count on the node unless a global override
/// is configured. A cordoned node contributes zero unless cordons are
/// ignored.
pub fn weight_for(node: &Node, namespace: &str, service: &str, cfg: &Config) -> u32 {
    if node.unschedulable && !cfg.ignore_cordon {
        return 0;
    }
    match cfg.weight_override {
        Some(w) => w,
        None => node.pods_for(namespace, service) as u32,
    }
}

/// Derive the desired virtual-service set for one address family.
///
/// Services whose named port does not resolve through the index are skipped
/// with a warning; a resolvable service with no endpoint-carrying nodes is
/// still emitted with an empty destination set so announcements stay
/// consistent.
pub fn desired_ipvs(
    family: AddressFamily,
    nodes: &[Node],
    config: &ClusterConfig,
    services: &ServicesIndex,
    cfg: &Config,
) -> Vec<IpvsService> {
    let mut out = Vec::new();
    for (vip, ports) in config.vips(family) {
        let valid = match family {
            AddressFamily::V4 => vip.parse::<Ipv4Addr>().is_ok(),
            AddressFamily::V6 => vip.parse::<Ipv6Addr>().is_ok(),
        };
        if !valid {
            warn!(vip = %vip, family = %family, "skipping VIP that does not parse for its family");
            continue;
        }
        for (port_str, def) in ports {
            let port: u16 = match port_str.parse() {
                Ok(p) => p,
                Err(_) => {
                    warn!(vip = %vip, port = %port_str, "skipping non-numeric port");
                    continue;
                }
            };
            let identity = def.identity();
            let resolved = match services.resolve(&identity) {
                Some(addr) => addr,
                None => {
                    warn!(identity = %identity, "cluster address not found, skipping service");
                    continue;
                }
            };

            let mut destinations = Vec::new();
            for node in nodes {
                if !node.has_endpoints_for(&def.namespace, &def.service) {
                    continue;
                }
                let Some(address) = node.primary_address(family) else {
                    debug!(node = %node.name, family = %family, "node has no address for family");
                    continue;
                };
                destinations.push(IpvsDestination {
                    address: address.to_string(),
                    port: resolved.port,
                    weight: weight_for(node, &def.namespace, &def.service, cfg),
                    forwarding_method: def.ipvs_options.forwarding_method(),
                });
            }
            destinations.sort_by(|a, b| (&a.address, a.port).cmp(&(&b.address, b.port)));

            out.push(IpvsService {
                key: ServiceKey {
                    vip: vip.clone(),
                    port,
                    protocol: resolved.protocol,
                },
                scheduler: def.ipvs_options.scheduler().to_string(),
                sched_flags: def.ipvs_options.flags.clone(),
                persistence_timeout: def.ipvs_options.persistence_timeout,
                destinations,
            });
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Compute the minimal action set converging `observed` toward `desired`.
///
/// An observed service absent from `desired` is deleted only when its VIP
/// is no longer configured at all; otherwise it belongs to the other
/// family's pass (or is converged through destination edits) and is left
/// alone here.
pub fn plan_actions(
    desired: &[IpvsService],
    observed: &[IpvsService],
    config: &ClusterConfig,
) -> Vec<IpvsAction> {
    let desired_by_key: HashMap<&ServiceKey, &IpvsService> =
        desired.iter().map(|s| (&s.key, s)).collect();
    let observed_by_key: HashMap<&ServiceKey, &IpvsService> =
        observed.iter().map(|s| (&s.key, s)).collect();

    let mut actions = Vec::new();

    for svc in observed {
        if !desired_by_key.contains_key(&svc.key) && !config.contains_vip(&svc.key.vip) {
            actions.push(IpvsAction::DeleteService(svc.key.clone()));
        }
    }

    for svc in desired {
        match observed_by_key.get(&svc.key) {
            None => {
                actions.push(IpvsAction::AddService(svc.clone()));
                for dest in &svc.destinations {
                    actions.push(IpvsAction::AddDestination(svc.key.clone(), dest.clone()));
                }
            }
            Some(current) => {
                if !svc.same_service_params(current) {
                    actions.push(IpvsAction::EditService(svc.clone()));
                }
                plan_destinations(svc, current, &mut actions);
            }
        }
    }
    actions
}

fn plan_destinations(desired: &IpvsService, observed: &IpvsService, actions: &mut Vec<IpvsAction>) {
    let desired_eps: HashSet<String> =
        desired.destinations.iter().map(|d| d.endpoint()).collect();
    let observed_by_ep: HashMap<String, &IpvsDestination> = observed
        .destinations
        .iter()
        .map(|d| (d.endpoint(), d))
        .collect();

    for dest in &observed.destinations {
        if !desired_eps.contains(&dest.endpoint()) {
            actions.push(IpvsAction::DeleteDestination(
                desired.key.clone(),
                dest.clone(),
            ));
        }
    }
    for dest in &desired.destinations {
        match observed_by_ep.get(&dest.endpoint()) {
            None => actions.push(IpvsAction::AddDestination(desired.key.clone(), dest.clone())),
            Some(current) => {
                if dest.weight != current.weight
                    || dest.forwarding_method != current.forwarding_method
                {
                    actions.push(IpvsAction::EditDestination(
                        desired.key.clone(),
                        dest.clone(),
                    ));
                }
            }
        }
    }
}

/// Set equality of two virtual-service sets, comparing service parameters
/// and destination weight/forwarding.
pub fn ipvs_equal(a: &[IpvsService], b: &[IpvsService]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let by_key: HashMap<&ServiceKey, &IpvsService> = b.iter().map(|s| (&s.key, s)).collect();
    a.iter().all(|svc| match by_key.get(&svc.key) {
        None => false,
        Some(other) => {
            svc.same_service_params(other)
                && destinations_equal(&svc.destinations, &other.destinations)
        }
    })
}

fn destinations_equal(a: &[IpvsDestination], b: &[IpvsDestination]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    let by_endpoint = |d: &IpvsDestination| (d.address.clone(), d.port);
    a.sort_by_key(by_endpoint);
    b.sort_by_key(by_endpoint);
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IpvsOptions, NodeEndpoint, PortMap, ServiceAddr, ServiceDef, Subset};

    fn test_cfg() -> Config {
        Config::default()
    }

    fn backend_node(name: &str, addr: &str, pods: usize) -> Node {
        Node {
            name: name.into(),
            addresses: vec![addr.into()],
            unschedulable: false,
            endpoints: vec![NodeEndpoint {
                namespace: "web".into(),
                service: "frontend".into(),
                subsets: vec![Subset {
                    addresses: (0..pods).map(|i| format!("10.244.1.{i}")).collect(),
                    ports: vec![],
                }],
            }],
        }
    }

    fn one_vip_config(vip: &str, port: &str) -> ClusterConfig {
        let mut ports = PortMap::new();
        ports.insert(
            port.into(),
            ServiceDef {
                namespace: "web".into(),
                service: "frontend".into(),
                port_name: "http".into(),
                ipvs_options: IpvsOptions::default(),
            },
        );
        let mut config = ClusterConfig::default();
        config.config.insert(vip.into(), ports);
        config
    }

    fn index() -> ServicesIndex {
        let mut idx = ServicesIndex::default();
        idx.insert(
            "web/frontend:http".into(),
            ServiceAddr {
                cluster_ip: "10.96.0.20".into(),
                port: 8080,
                protocol: Protocol::Tcp,
            },
        );
        idx
    }

    #[test]
    fn desired_emits_sorted_destinations() {
        let nodes = vec![
            backend_node("n2", "10.0.0.2", 1),
            backend_node("n1", "10.0.0.1", 1),
        ];
        let desired = desired_ipvs(
            AddressFamily::V4,
            &nodes,
            &one_vip_config("10.54.0.1", "80"),
            &index(),
            &test_cfg(),
        );
        assert_eq!(desired.len(), 1);
        let dests: Vec<&str> = desired[0]
            .destinations
            .iter()
            .map(|d| d.address.as_str())
            .collect();
        assert_eq!(dests, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(desired[0].destinations[0].port, 8080);
        assert_eq!(desired[0].key.port, 80);
    }

    #[test]
    fn desired_keeps_service_with_no_backends() {
        let nodes: Vec<Node> = vec![];
        let desired = desired_ipvs(
            AddressFamily::V4,
            &nodes,
            &one_vip_config("10.54.0.1", "80"),
            &index(),
            &test_cfg(),
        );
        assert_eq!(desired.len(), 1);
        assert!(desired[0].destinations.is_empty());
    }

    #[test]
    fn desired_skips_unresolved_identity() {
        let desired = desired_ipvs(
            AddressFamily::V4,
            &[backend_node("n1", "10.0.0.1", 1)],
            &one_vip_config("10.54.0.1", "80"),
            &ServicesIndex::default(),
            &test_cfg(),
        );
        assert!(desired.is_empty());
    }

    #[test]
    fn cordoned_node_gets_weight_zero() {
        let mut node = backend_node("n1", "10.0.0.1", 3);
        node.unschedulable = true;
        assert_eq!(weight_for(&node, "web", "frontend", &test_cfg()), 0);

        let mut cfg = test_cfg();
        cfg.ignore_cordon = true;
        assert_eq!(weight_for(&node, "web", "frontend", &cfg), 3);
    }

    #[test]
    fn weight_override_wins() {
        let node = backend_node("n1", "10.0.0.1", 3);
        let mut cfg = test_cfg();
        cfg.weight_override = Some(7);
        assert_eq!(weight_for(&node, "web", "frontend", &cfg), 7);
    }

    #[test]
    fn total_weight_tracks_backend_membership() {
        let cfg = test_cfg();
        let config = one_vip_config("10.54.0.1", "80");
        let total = |nodes: &[Node]| -> u32 {
            desired_ipvs(AddressFamily::V4, nodes, &config, &index(), &cfg)
                .iter()
                .flat_map(|s| s.destinations.iter())
                .map(|d| d.weight)
                .sum()
        };
        let two = vec![
            backend_node("n1", "10.0.0.1", 2),
            backend_node("n2", "10.0.0.2", 1),
        ];
        let three = {
            let mut n = two.clone();
            n.push(backend_node("n3", "10.0.0.3", 2));
            n
        };
        assert!(total(&three) >= total(&two));
        assert!(total(&two) >= total(&two[..1].to_vec()));
    }

    #[test]
    fn plan_is_empty_when_converged() {
        let desired = desired_ipvs(
            AddressFamily::V4,
            &[backend_node("n1", "10.0.0.1", 1)],
            &one_vip_config("10.54.0.1", "80"),
            &index(),
            &test_cfg(),
        );
        let actions = plan_actions(&desired, &desired, &one_vip_config("10.54.0.1", "80"));
        assert!(actions.is_empty());
    }

    #[test]
    fn plan_adds_missing_service_with_destinations() {
        let desired = desired_ipvs(
            AddressFamily::V4,
            &[backend_node("n1", "10.0.0.1", 1)],
            &one_vip_config("10.54.0.1", "80"),
            &index(),
            &test_cfg(),
        );
        let actions = plan_actions(&desired, &[], &one_vip_config("10.54.0.1", "80"));
        assert!(matches!(actions[0], IpvsAction::AddService(_)));
        assert!(matches!(actions[1], IpvsAction::AddDestination(_, _)));
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn plan_keeps_drifted_service_for_still_configured_vip() {
        // The VIP is configured but the observed service carries a stale
        // destination; the plan must edit destinations, not delete the
        // service.
        let config = one_vip_config("10.54.0.1", "80");
        let desired = desired_ipvs(
            AddressFamily::V4,
            &[backend_node("n1", "10.0.0.1", 2)],
            &config,
            &index(),
            &test_cfg(),
        );
        let mut observed = desired.clone();
        observed[0].destinations[0].weight = 9;
        observed[0].destinations.push(IpvsDestination {
            address: "10.0.0.9".into(),
            port: 8080,
            weight: 1,
            forwarding_method: ForwardingMethod::Gatewaying,
        });
        let actions = plan_actions(&desired, &observed, &config);
        assert!(actions.iter().any(|a| matches!(a, IpvsAction::DeleteDestination(_, d) if d.address == "10.0.0.9")));
        assert!(actions.iter().any(|a| matches!(a, IpvsAction::EditDestination(_, d) if d.weight == 2)));
        assert!(!actions.iter().any(|a| matches!(a, IpvsAction::DeleteService(_))));
    }

    #[test]
    fn plan_deletes_service_for_dropped_vip() {
        let config = ClusterConfig::default();
        let observed = desired_ipvs(
            AddressFamily::V4,
            &[backend_node("n1", "10.0.0.1", 1)],
            &one_vip_config("10.54.0.1", "80"),
            &index(),
            &test_cfg(),
        );
        let actions = plan_actions(&[], &observed, &config);
        assert_eq!(
            actions,
            vec![IpvsAction::DeleteService(observed[0].key.clone())]
        );
    }

    #[test]
    fn ipvs_equal_ignores_destination_order() {
        let mut a = desired_ipvs(
            AddressFamily::V4,
            &[
                backend_node("n1", "10.0.0.1", 1),
                backend_node("n2", "10.0.0.2", 1),
            ],
            &one_vip_config("10.54.0.1", "80"),
            &index(),
            &test_cfg(),
        );
        let b = a.clone();
        a[0].destinations.reverse();
        assert!(ipvs_equal(&a, &b));
        a[0].destinations[0].weight += 1;
        assert!(!ipvs_equal(&a, &b));
    }
}
