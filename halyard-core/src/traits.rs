//! Backend seams between the reconciler and the machinery it programs.
//!
//! The engine mutates the kernel and the BGP speaker only through these
//! traits; the real implementations live in `halyard-system` and
//! `halyard-bgp`, and tests substitute in-memory fakes.

use crate::error::Result;
use crate::ipvs::{IpvsAction, IpvsService};
use crate::types::{AddressFamily, ObservedAddresses};
use async_trait::async_trait;
use std::collections::HashMap;

/// Loopback VIP address surface.
#[async_trait]
pub trait AddressBackend: Send + Sync {
    /// Managed device names currently present, per family.
    async fn observe(&self) -> Result<ObservedAddresses>;

    /// Add a VIP to the loopback.
    async fn add(&self, vip: &str, family: AddressFamily) -> Result<()>;

    /// Remove the address encoded by a managed device name.
    async fn remove(&self, device: &str, family: AddressFamily) -> Result<()>;

    /// Apply MTU overrides, issuing only changes.
    async fn set_mtu(&self, mtus: &HashMap<String, u32>, family: AddressFamily) -> Result<()>;
}

/// IPVS virtual-server table.
#[async_trait]
pub trait IpvsBackend: Send + Sync {
    /// Virtual services and destinations currently programmed.
    async fn observe(&self) -> Result<Vec<IpvsService>>;

    /// Execute a planned action sequence, stopping at the first failure.
    async fn apply(&self, actions: &[IpvsAction]) -> Result<()>;
}

/// The managed nat-table chain.
#[async_trait]
pub trait IptablesBackend: Send + Sync {
    /// Rules currently in the managed chain, normalized to save format.
    async fn observe(&self) -> Result<Vec<String>>;

    /// Create the chain and its jump rule if missing.
    async fn ensure_chain(&self) -> Result<()>;

    /// Append a rule to the chain.
    async fn append(&self, rule: &str) -> Result<()>;

    /// Delete a rule from the chain.
    async fn delete(&self, rule: &str) -> Result<()>;

    /// Flush every rule from the chain.
    async fn flush(&self) -> Result<()>;
}

/// Narrow façade over the external BGP speaker.
///
/// The speaker holds the real state; every operation here must be
/// idempotent, so repeating a call with identical arguments is observably
/// equivalent to making it once.
#[async_trait]
pub trait BgpSpeaker: Send + Sync {
    /// Currently announced IPv4 addresses.
    async fn get(&self) -> Result<Vec<String>>;

    /// Converge the announced IPv4 set toward `v4`: announce `v4 - prev`,
    /// withdraw `prev - v4`. Callers wanting a purely additive pass include
    /// the previously announced set in `v4`.
    async fn set(&self, v4: &[String], prev: &[String], communities: &[String]) -> Result<()>;

    /// Announce IPv6 addresses. Additive only.
    async fn set_v6(&self, v6: &[String], communities: &[String]) -> Result<()>;
}

/// Start/stop control over the role's worker, as driven by the coordinator.
#[async_trait]
pub trait WorkerControl: Send {
    /// Begin reconciling.
    async fn start(&mut self) -> Result<()>;

    /// Stop reconciling and clean up.
    async fn stop(&mut self) -> Result<()>;
}
