//! Kernel surface backends for the halyard engine.
//!
//! Implements the `halyard-core` backend traits by driving the standard
//! userspace tools: `ip` for loopback VIP addresses and MTU, `ipvsadm` for
//! the virtual-server table, `iptables` for the managed nat chain, plus
//! the startup sysctls both roles need.

mod exec;

pub mod addresses;
pub mod iptables;
pub mod ipvs;
pub mod sysctl;

pub use addresses::LoopbackAddresses;
pub use iptables::IptablesChain;
pub use ipvs::IpvsRules;
