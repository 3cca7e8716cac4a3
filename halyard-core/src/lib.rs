//! Reconciliation engine for the halyard load-balancer control plane.
//!
//! The engine consumes a stream of cluster configuration and node/endpoint
//! updates, diffs observed kernel state against desired state, and issues
//! the minimal set of mutating operations needed to converge: loopback VIP
//! addresses, IPVS virtual services and destinations, the managed iptables
//! chain, and BGP route-set updates through an external speaker.
//!
//! Two roles share the engine:
//!
//! - the **director** announces VIPs over BGP and programs IPVS,
//! - the **real server** configures loopback VIPs and iptables on backend
//!   nodes, gated by a TCP liveness probe against the director.
//!
//! Kernel and speaker access goes through the backend traits in
//! [`traits`]; the real implementations live in the `halyard-system` and
//! `halyard-bgp` crates.

pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod iptables;
pub mod ipvs;
pub mod metrics;
pub mod parity;
pub mod reconciler;
pub mod store;
pub mod traits;
pub mod types;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use reconciler::{Backends, ReconcilePlan, Reconciler};
pub use store::{NodeUpdate, Snapshot, Store};
pub use worker::{watch_channels, WatchReceivers, WatchSenders, Worker};
