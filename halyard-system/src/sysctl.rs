//! Startup sysctls: ARP behavior for the VIP-carrying interfaces and the
//! `net.ipv4.vs.*` tunables.
//!
//! These run once before the worker starts; a refusal here means the
//! process lacks the privileges to manage the node at all, so every
//! failure is fatal.

use halyard_core::error::{Error, Result};
use std::path::PathBuf;
use tracing::debug;

/// Filesystem path for a dotted sysctl key.
fn sysctl_path(key: &str) -> PathBuf {
    let mut path = PathBuf::from("/proc/sys");
    for part in key.split('.') {
        path.push(part);
    }
    path
}

/// Write one sysctl value.
pub async fn set(key: &str, value: &str) -> Result<()> {
    let path = sysctl_path(key);
    debug!(key, value, "writing sysctl");
    tokio::fs::write(&path, value)
        .await
        .map_err(|e| Error::Fatal(format!("unable to write sysctl {key}: {e}")))
}

/// Configure ARP announce/ignore for one interface.
pub async fn set_arp(interface: &str, announce: u8, ignore: u8) -> Result<()> {
    set(
        &format!("net.ipv4.conf.{interface}.arp_announce"),
        &announce.to_string(),
    )
    .await?;
    set(
        &format!("net.ipv4.conf.{interface}.arp_ignore"),
        &ignore.to_string(),
    )
    .await
}

/// Apply `key=value` entries under `net.ipv4.vs`.
pub async fn set_ipvs(entries: &[String]) -> Result<()> {
    for entry in entries {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            Error::InvalidConfig(format!("ipvs sysctl {entry:?} is not key=value"))
        })?;
        set(&format!("net.ipv4.vs.{}", key.trim()), value.trim()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_keys_map_to_proc_paths() {
        assert_eq!(
            sysctl_path("net.ipv4.vs.conntrack"),
            PathBuf::from("/proc/sys/net/ipv4/vs/conntrack")
        );
        assert_eq!(
            sysctl_path("net.ipv4.conf.lo.arp_ignore"),
            PathBuf::from("/proc/sys/net/ipv4/conf/lo/arp_ignore")
        );
    }

    #[tokio::test]
    async fn malformed_ipvs_entry_is_rejected() {
        let err = set_ipvs(&["conntrack 0".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
