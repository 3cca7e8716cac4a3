//! The managed nat-table chain through iptables.
//!
//! Observation reads `iptables-save -t nat` filtered to the managed chain;
//! rules are compared verbatim in save format, so renderers on the core
//! side and this parser must agree on normalization.

use crate::exec::run;
use async_trait::async_trait;
use halyard_core::error::{Error, Result};
use halyard_core::traits::IptablesBackend;
use tracing::{debug, info};

/// Iptables backend maintaining one chain in the nat table.
pub struct IptablesChain {
    chain: String,
    bin: String,
    save_bin: String,
}

impl IptablesChain {
    /// Manage the named chain.
    pub fn new(chain: impl Into<String>) -> Self {
        IptablesChain {
            chain: chain.into(),
            bin: "iptables".to_string(),
            save_bin: "iptables-save".to_string(),
        }
    }
}

/// Extract the managed chain's rules from `iptables-save -t nat` output,
/// stripped to the part after the chain name.
pub fn parse_chain_rules(out: &str, chain: &str) -> Vec<String> {
    let prefix = format!("-A {chain} ");
    out.lines()
        .filter_map(|line| line.trim().strip_prefix(&prefix))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl IptablesBackend for IptablesChain {
    async fn observe(&self) -> Result<Vec<String>> {
        let out = run(&self.save_bin, ["-t", "nat"]).await?;
        Ok(parse_chain_rules(&out, &self.chain))
    }

    async fn ensure_chain(&self) -> Result<()> {
        match run(&self.bin, ["-t", "nat", "-N", self.chain.as_str()]).await {
            Ok(_) => info!(chain = %self.chain, "created chain"),
            Err(Error::Command { stderr, .. }) if stderr.contains("exists") => {}
            Err(e) => return Err(e),
        }
        // jump from POSTROUTING; -C exits nonzero when the rule is absent
        let check = run(
            &self.bin,
            ["-t", "nat", "-C", "POSTROUTING", "-j", self.chain.as_str()],
        )
        .await;
        if check.is_err() {
            info!(chain = %self.chain, "installing POSTROUTING jump");
            run(
                &self.bin,
                ["-t", "nat", "-A", "POSTROUTING", "-j", self.chain.as_str()],
            )
            .await?;
        }
        Ok(())
    }

    async fn append(&self, rule: &str) -> Result<()> {
        debug!(chain = %self.chain, rule, "appending rule");
        let mut args = vec!["-t", "nat", "-A", self.chain.as_str()];
        args.extend(rule.split_whitespace());
        run(&self.bin, args).await?;
        Ok(())
    }

    async fn delete(&self, rule: &str) -> Result<()> {
        debug!(chain = %self.chain, rule, "deleting rule");
        let mut args = vec!["-t", "nat", "-D", self.chain.as_str()];
        args.extend(rule.split_whitespace());
        run(&self.bin, args).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        run(&self.bin, ["-t", "nat", "-F", self.chain.as_str()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAVE: &str = "\
# Generated by iptables-save
*nat
:PREROUTING ACCEPT [0:0]
:HALYARD - [0:0]
-A POSTROUTING -j HALYARD
-A HALYARD -d 10.54.213.148/32 -p tcp -m tcp --dport 80 -j MASQUERADE
-A HALYARD -s 10.244.0.0/16 -j MASQUERADE
-A KUBE-SERVICES -d 10.96.0.1/32 -p tcp -j KUBE-SVC-X
COMMIT
";

    #[test]
    fn chain_rules_are_extracted_and_stripped() {
        let rules = parse_chain_rules(SAVE, "HALYARD");
        assert_eq!(
            rules,
            vec![
                "-d 10.54.213.148/32 -p tcp -m tcp --dport 80 -j MASQUERADE".to_string(),
                "-s 10.244.0.0/16 -j MASQUERADE".to_string(),
            ]
        );
    }

    #[test]
    fn other_chains_are_ignored() {
        let rules = parse_chain_rules(SAVE, "HALYARD");
        assert!(!rules.iter().any(|r| r.contains("KUBE")));
        assert!(parse_chain_rules(SAVE, "MISSING").is_empty());
    }
}
