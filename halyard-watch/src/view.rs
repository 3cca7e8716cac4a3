//! Local fold of the watched cluster objects.
//!
//! The view keeps the raw Kubernetes objects keyed for cheap upserts and
//! rebuilds the engine-facing snapshots on demand: a node list joined with
//! the endpoints hosted per node, and the services index resolving
//! `namespace/service:portName` identities.

use halyard_core::types::{
    Node as CoreNode, NodeEndpoint, NodesList, Protocol, ServiceAddr, ServicesIndex, Subset,
    SubsetPort,
};
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::ResourceExt;
use std::collections::BTreeMap;

#[derive(Default)]
pub(crate) struct ClusterView {
    nodes: BTreeMap<String, Node>,
    endpoints: BTreeMap<(String, String), Endpoints>,
    services: BTreeMap<(String, String), Service>,
}

impl ClusterView {
    pub(crate) fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.name_any(), node);
    }

    pub(crate) fn remove_node(&mut self, name: &str) {
        self.nodes.remove(name);
    }

    pub(crate) fn upsert_endpoints(&mut self, ep: Endpoints) {
        let key = (ep.namespace().unwrap_or_default(), ep.name_any());
        self.endpoints.insert(key, ep);
    }

    pub(crate) fn remove_endpoints(&mut self, namespace: &str, name: &str) {
        self.endpoints
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub(crate) fn upsert_service(&mut self, svc: Service) {
        let key = (svc.namespace().unwrap_or_default(), svc.name_any());
        self.services.insert(key, svc);
    }

    pub(crate) fn remove_service(&mut self, namespace: &str, name: &str) {
        self.services
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Join nodes with the endpoints hosted on each.
    pub(crate) fn build_nodes(&self) -> NodesList {
        self.nodes
            .values()
            .map(|node| {
                let name = node.name_any();
                CoreNode {
                    addresses: node_addresses(node),
                    unschedulable: node
                        .spec
                        .as_ref()
                        .and_then(|s| s.unschedulable)
                        .unwrap_or(false),
                    endpoints: self.endpoints_on(&name),
                    name,
                }
            })
            .collect()
    }

    fn endpoints_on(&self, node_name: &str) -> Vec<NodeEndpoint> {
        let mut out = Vec::new();
        for ((namespace, service), ep) in &self.endpoints {
            let mut subsets = Vec::new();
            for subset in ep.subsets.iter().flatten() {
                let addresses: Vec<String> = subset
                    .addresses
                    .iter()
                    .flatten()
                    .filter(|a| a.node_name.as_deref() == Some(node_name))
                    .map(|a| a.ip.clone())
                    .collect();
                if addresses.is_empty() {
                    continue;
                }
                let ports = subset
                    .ports
                    .iter()
                    .flatten()
                    .map(|p| SubsetPort {
                        name: p.name.clone().unwrap_or_default(),
                        port: p.port as u16,
                        protocol: Protocol::parse(p.protocol.as_deref().unwrap_or("TCP")),
                    })
                    .collect();
                subsets.push(Subset { addresses, ports });
            }
            if !subsets.is_empty() {
                out.push(NodeEndpoint {
                    namespace: namespace.clone(),
                    service: service.clone(),
                    subsets,
                });
            }
        }
        out
    }

    /// Resolve every service port into the identity index.
    pub(crate) fn build_services_index(&self) -> ServicesIndex {
        let mut index = ServicesIndex::default();
        for ((namespace, name), svc) in &self.services {
            let Some(spec) = &svc.spec else { continue };
            let Some(cluster_ip) = spec.cluster_ip.as_deref() else {
                continue;
            };
            if cluster_ip.is_empty() || cluster_ip == "None" {
                continue;
            }
            for port in spec.ports.iter().flatten() {
                let port_name = port.name.clone().unwrap_or_default();
                index.insert(
                    format!("{namespace}/{name}:{port_name}"),
                    ServiceAddr {
                        cluster_ip: cluster_ip.to_string(),
                        port: port.port as u16,
                        protocol: Protocol::parse(port.protocol.as_deref().unwrap_or("TCP")),
                    },
                );
            }
        }
        index
    }
}

fn node_addresses(node: &Node) -> Vec<String> {
    let mut out = Vec::new();
    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    // internal addresses first; the engine picks the first per family
    for kind in ["InternalIP", "ExternalIP"] {
        for addr in addresses.iter().filter(|a| a.type_ == kind) {
            out.push(addr.address.clone());
        }
    }
    out
}
