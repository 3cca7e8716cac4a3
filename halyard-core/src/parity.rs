//! Parity between desired configuration and observed kernel state.
//!
//! The predicate is pure: observation happens in the reconciler, and the
//! forced-reconcile flag is consulted separately through
//! `Store::should_force_reconcile`. A false return means drift; a true
//! return means the fast tick has nothing to do.

use crate::config::Config;
use crate::device;
use crate::ipvs::{desired_ipvs, ipvs_equal, IpvsService};
use crate::store::Snapshot;
use crate::types::{AddressFamily, ObservedAddresses};
use tracing::debug;

/// Whether observed state matches the snapshot's desired state.
///
/// Address parity compares managed device-name sets per family, sorted so
/// list order never matters. When `observed_ipvs` is provided (director
/// plan), virtual services and destinations are compared as sets with
/// weight and forwarding equality; the real-server plan passes `None` and
/// checks the address surface only.
pub fn same_config(
    snapshot: &Snapshot,
    cfg: &Config,
    observed_addresses: &ObservedAddresses,
    observed_ipvs: Option<&[IpvsService]>,
) -> bool {
    for family in [AddressFamily::V4, AddressFamily::V6] {
        let (desired, _) = device::desired_devices(&snapshot.config, family);
        let mut observed = observed_addresses.family(family).to_vec();
        observed.sort();
        observed.dedup();
        if desired != observed {
            debug!(
                family = %family,
                desired = desired.len(),
                observed = observed.len(),
                "address parity mismatch"
            );
            return false;
        }
    }

    if let Some(observed) = observed_ipvs {
        let mut desired = desired_ipvs(
            AddressFamily::V4,
            &snapshot.nodes,
            &snapshot.config,
            &snapshot.services,
            cfg,
        );
        desired.extend(desired_ipvs(
            AddressFamily::V6,
            &snapshot.nodes,
            &snapshot.config,
            &snapshot.services,
            cfg,
        ));
        if !ipvs_equal(&desired, observed) {
            debug!(
                desired = desired.len(),
                observed = observed.len(),
                "ipvs parity mismatch"
            );
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::{
        ClusterConfig, IpvsOptions, Node, NodeEndpoint, PortMap, Protocol, ServiceAddr,
        ServiceDef, ServicesIndex, Subset,
    };

    fn snapshot_with(vip: &str) -> Snapshot {
        let mut ports = PortMap::new();
        ports.insert(
            "80".into(),
            ServiceDef {
                namespace: "web".into(),
                service: "frontend".into(),
                port_name: "http".into(),
                ipvs_options: IpvsOptions::default(),
            },
        );
        let mut config = ClusterConfig::default();
        config.config.insert(vip.into(), ports);

        let mut services = ServicesIndex::default();
        services.insert(
            "web/frontend:http".into(),
            ServiceAddr {
                cluster_ip: "10.96.0.20".into(),
                port: 8080,
                protocol: Protocol::Tcp,
            },
        );

        let store = Store::new();
        store.apply_config(config);
        store.apply_services(services);
        store.apply_nodes(vec![Node {
            name: "n1".into(),
            addresses: vec!["10.0.0.1".into()],
            unschedulable: false,
            endpoints: vec![NodeEndpoint {
                namespace: "web".into(),
                service: "frontend".into(),
                subsets: vec![Subset {
                    addresses: vec!["10.244.0.5".into()],
                    ports: vec![],
                }],
            }],
        }]);
        store.snapshot()
    }

    fn converged_state(snap: &Snapshot, cfg: &Config) -> (ObservedAddresses, Vec<IpvsService>) {
        let (v4, _) = device::desired_devices(&snap.config, AddressFamily::V4);
        let (v6, _) = device::desired_devices(&snap.config, AddressFamily::V6);
        let ipvs = desired_ipvs(
            AddressFamily::V4,
            &snap.nodes,
            &snap.config,
            &snap.services,
            cfg,
        );
        (ObservedAddresses { v4, v6 }, ipvs)
    }

    #[test]
    fn parity_holds_when_converged() {
        let cfg = Config::default();
        let snap = snapshot_with("10.54.0.1");
        let (addrs, ipvs) = converged_state(&snap, &cfg);
        assert!(same_config(&snap, &cfg, &addrs, Some(&ipvs)));
    }

    #[test]
    fn parity_ignores_observed_order() {
        let cfg = Config::default();
        let snap = snapshot_with("10.54.0.1");
        let (mut addrs, ipvs) = converged_state(&snap, &cfg);
        addrs.v4.push(addrs.v4[0].clone());
        addrs.v4.reverse();
        // duplicates and ordering in the observed list do not break parity
        assert!(same_config(&snap, &cfg, &addrs, Some(&ipvs)));
    }

    #[test]
    fn missing_address_is_drift() {
        let cfg = Config::default();
        let snap = snapshot_with("10.54.0.1");
        let (_, ipvs) = converged_state(&snap, &cfg);
        let empty = ObservedAddresses::default();
        assert!(!same_config(&snap, &cfg, &empty, Some(&ipvs)));
    }

    #[test]
    fn stale_ipvs_weight_is_drift() {
        let cfg = Config::default();
        let snap = snapshot_with("10.54.0.1");
        let (addrs, mut ipvs) = converged_state(&snap, &cfg);
        ipvs[0].destinations[0].weight += 1;
        assert!(!same_config(&snap, &cfg, &addrs, Some(&ipvs)));
    }

    #[test]
    fn realserver_plan_checks_addresses_only() {
        let cfg = Config::default();
        let snap = snapshot_with("10.54.0.1");
        let (addrs, _) = converged_state(&snap, &cfg);
        assert!(same_config(&snap, &cfg, &addrs, None));
    }

    #[test]
    fn unknown_observed_address_is_drift() {
        let cfg = Config::default();
        let snap = snapshot_with("10.54.0.1");
        let (mut addrs, ipvs) = converged_state(&snap, &cfg);
        addrs.v4.push("lo:hal00000063".into());
        assert!(!same_config(&snap, &cfg, &addrs, Some(&ipvs)));
    }
}
