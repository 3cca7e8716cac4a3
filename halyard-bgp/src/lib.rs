//! BGP controller adapter.
//!
//! A stateless façade over the external gobgp speaker: VIPs are announced
//! and withdrawn as host routes in the global RIB, with the configured
//! communities attached to every announcement. The speaker owns the
//! peering state machine; this adapter only edits the route set.
//! Operations are idempotent: `set` diffs against what the caller says is
//! already announced, and re-adding an identical route is a no-op in the
//! speaker.

use async_trait::async_trait;
use halyard_core::error::{Error, Result};
use halyard_core::traits::BgpSpeaker;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{debug, info};

/// gobgp-backed speaker adapter.
pub struct GobgpController {
    bin: String,
}

impl GobgpController {
    /// New adapter using `gobgp` from the path.
    pub fn new() -> Self {
        GobgpController {
            bin: "gobgp".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "gobgp");
        let output = Command::new(&self.bin).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::Command {
                program: self.bin.clone(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn rib(&self, family: &str, op: &str, prefix: &str, communities: &[String]) -> Result<()> {
        let mut args = vec!["global", "rib"];
        if family == "ipv6" {
            args.extend(["-a", "ipv6"]);
        }
        args.push(op);
        args.push(prefix);
        let joined;
        if op == "add" && !communities.is_empty() {
            joined = communities.join(",");
            args.extend(["community", joined.as_str()]);
        }
        self.run(&args).await?;
        Ok(())
    }
}

impl Default for GobgpController {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefixes in `gobgp global rib -j` output, with the host-route length
/// stripped back to the bare address.
fn parse_rib_json(json: &str) -> Result<Vec<String>> {
    let rib: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(json).map_err(|e| Error::Parse {
            what: "gobgp rib json",
            detail: e.to_string(),
        })?;
    Ok(rib
        .keys()
        .map(|prefix| prefix.trim_end_matches("/32").to_string())
        .collect())
}

#[async_trait]
impl BgpSpeaker for GobgpController {
    async fn get(&self) -> Result<Vec<String>> {
        let out = self.run(&["global", "rib", "-j"]).await?;
        parse_rib_json(&out)
    }

    async fn set(&self, v4: &[String], prev: &[String], communities: &[String]) -> Result<()> {
        for addr in v4 {
            if prev.contains(addr) {
                continue;
            }
            info!(vip = %addr, "announcing");
            self.rib("ipv4", "add", &format!("{addr}/32"), communities)
                .await?;
        }
        for addr in prev {
            if v4.contains(addr) {
                continue;
            }
            info!(vip = %addr, "withdrawing");
            self.rib("ipv4", "del", &format!("{addr}/32"), communities)
                .await?;
        }
        Ok(())
    }

    async fn set_v6(&self, v6: &[String], communities: &[String]) -> Result<()> {
        for addr in v6 {
            self.rib("ipv6", "add", &format!("{addr}/128"), communities)
                .await?;
        }
        Ok(())
    }
}
