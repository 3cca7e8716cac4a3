//! The reconcile loop.
//!
//! One reconciler task exists per running role and is the sole mutator of
//! kernel networking state. It multiplexes a fast parity-gated tick, an
//! unconditional forced tick and a queue-depth tick under a cooperative
//! select, and drains through a done channel on cancellation.

use crate::config::Config;
use crate::device;
use crate::error::{Error, Result};
use crate::ipvs::{desired_ipvs, plan_actions};
use crate::iptables;
use crate::metrics::{outcome, Metrics};
use crate::parity;
use crate::store::{Snapshot, Store};
use crate::traits::{AddressBackend, BgpSpeaker, IptablesBackend, IpvsBackend};
use crate::types::{AddressFamily, ClusterConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant as TickInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Parity-gated tick period.
const FAST_TICK: Duration = Duration::from_secs(2);
/// Unconditional reconvergence period.
const FORCED_TICK: Duration = Duration::from_secs(30);
/// Queue-depth gauge period.
const QUEUE_DEPTH_TICK: Duration = Duration::from_secs(60);

/// Which surfaces a role reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePlan {
    /// Addresses, BGP announcements and IPVS rules.
    Director,
    /// Loopback addresses and the managed iptables chain.
    RealServer,
}

impl ReconcilePlan {
    /// Metric label for the plan.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcilePlan::Director => "director",
            ReconcilePlan::RealServer => "realserver",
        }
    }
}

/// The backends a reconciler drives. Only the surfaces the plan touches
/// need to be populated.
pub struct Backends {
    /// Loopback address surface. Both plans use it.
    pub addresses: Arc<dyn AddressBackend>,
    /// IPVS surface (director plan).
    pub ipvs: Option<Arc<dyn IpvsBackend>>,
    /// BGP speaker (director plan).
    pub bgp: Option<Arc<dyn BgpSpeaker>>,
    /// Managed nat chain (real-server plan).
    pub iptables: Option<Arc<dyn IptablesBackend>>,
}

/// Periodic reconciler for one role.
pub struct Reconciler {
    plan: ReconcilePlan,
    store: Arc<Store>,
    cfg: Arc<Config>,
    metrics: Arc<Metrics>,
    backends: Backends,
    /// Sender side of the config watch channel, observed for queue depth.
    config_feed: Option<mpsc::Sender<ClusterConfig>>,
}

impl Reconciler {
    /// Assemble a reconciler. No I/O happens until [`Reconciler::run`].
    pub fn new(
        plan: ReconcilePlan,
        store: Arc<Store>,
        cfg: Arc<Config>,
        metrics: Arc<Metrics>,
        backends: Backends,
        config_feed: Option<mpsc::Sender<ClusterConfig>>,
    ) -> Self {
        Reconciler {
            plan,
            store,
            cfg,
            metrics,
            backends,
            config_feed,
        }
    }

    /// Run until cancelled, acknowledging cancellation on `done_tx`.
    ///
    /// Per-tick errors are logged and counted; only fatal errors terminate
    /// the loop.
    pub async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        done_tx: oneshot::Sender<()>,
    ) -> Result<()> {
        info!(plan = self.plan.as_str(), "starting reconcile loop");
        let mut fast = interval_at(TickInstant::now() + FAST_TICK, FAST_TICK);
        fast.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut forced = interval_at(TickInstant::now() + FORCED_TICK, FORCED_TICK);
        forced.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut depth = interval_at(TickInstant::now() + QUEUE_DEPTH_TICK, QUEUE_DEPTH_TICK);
        depth.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // biased: when the fast and forced ticks land in the same
            // window, the fast tick is drained first and the forced pass
            // runs second, staying authoritative
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(plan = self.plan.as_str(), "reconcile loop cancelled, draining");
                    let _ = done_tx.send(());
                    return Ok(());
                }
                _ = fast.tick() => {
                    if let Err(e) = self.fast_tick().await {
                        return Err(e);
                    }
                }
                _ = forced.tick() => {
                    if self.cfg.forced_reconcile {
                        debug!("mandatory periodic reconcile");
                        if let Err(e) = self.reconcile_all(true).await {
                            return Err(e);
                        }
                    }
                }
                _ = depth.tick() => self.record_queue_depth(),
            }
        }
    }

    /// One parity-gated pass.
    async fn fast_tick(&self) -> Result<()> {
        if self.store.no_updates_ready() {
            trace!("no updates ready");
            return Ok(());
        }
        let start = Instant::now();
        let force = self.store.should_force_reconcile();
        if !force {
            match self.check_parity().await {
                Ok(true) => {
                    trace!("parity holds");
                    self.metrics.observe_reconcile(outcome::NOOP, start.elapsed());
                    return Ok(());
                }
                Ok(false) => debug!("parity differs, reconfiguring"),
                Err(e) => {
                    self.metrics.observe_reconcile(outcome::ERROR, start.elapsed());
                    error!(error = %e, "unable to compare configurations");
                    return if e.is_fatal() { Err(e) } else { Ok(()) };
                }
            }
        }
        self.reconcile_all(false).await
    }

    /// Reconcile both families, v4 first.
    async fn reconcile_all(&self, forced: bool) -> Result<()> {
        let start = Instant::now();
        for family in [AddressFamily::V4, AddressFamily::V6] {
            if let Err(e) = self.reconcile(family, forced).await {
                self.metrics
                    .observe_reconcile(outcome::CRITICAL, start.elapsed());
                error!(family = %family, error = %e, "unable to apply configuration");
                return if e.is_fatal() { Err(e) } else { Ok(()) };
            }
        }
        self.store.stamp_reconcile();
        self.metrics
            .observe_reconcile(outcome::COMPLETE, start.elapsed());
        Ok(())
    }

    /// Converge one family: addresses, then announcements, then rules.
    /// A VIP must exist on the loopback before IPVS binds it, and
    /// announcements may follow the binding.
    pub async fn reconcile(&self, family: AddressFamily, forced: bool) -> Result<()> {
        let snapshot = self.store.snapshot();
        self.set_addresses(&snapshot, family).await?;
        match self.plan {
            ReconcilePlan::Director => {
                self.set_bgp(&snapshot, family, forced).await?;
                self.set_ipvs(&snapshot, family).await?;
            }
            ReconcilePlan::RealServer => {
                if family == AddressFamily::V4 {
                    self.set_iptables(&snapshot).await?;
                }
            }
        }
        Ok(())
    }

    /// Remove-before-add address convergence, then MTU overrides.
    async fn set_addresses(&self, snapshot: &Snapshot, family: AddressFamily) -> Result<()> {
        let observed = self.backends.addresses.observe().await?;
        let (desired, to_addr) = device::desired_devices(&snapshot.config, family);
        let (removals, additions) = device::diff(observed.family(family), &desired);
        debug!(family = %family, additions = ?additions, removals = ?removals, "address diff");

        let label = &[family.as_str()];
        self.metrics
            .loopback_desired
            .with_label_values(label)
            .set(desired.len() as i64);
        self.metrics
            .loopback_removals
            .with_label_values(label)
            .inc_by(removals.len() as u64);
        self.metrics
            .loopback_additions
            .with_label_values(label)
            .inc_by(additions.len() as u64);

        for dev in &removals {
            if let Err(e) = self.backends.addresses.remove(dev, family).await {
                self.metrics
                    .loopback_removal_errors
                    .with_label_values(label)
                    .inc();
                self.metrics
                    .loopback_config_healthy
                    .with_label_values(label)
                    .set(0);
                return Err(e);
            }
        }
        for dev in &additions {
            // names come out of desired_devices, so the lookup is total
            let Some(addr) = to_addr.get(dev) else {
                continue;
            };
            info!(device = %dev, addr = %addr, "adding loopback address");
            if let Err(e) = self.backends.addresses.add(addr, family).await {
                self.metrics
                    .loopback_addition_errors
                    .with_label_values(label)
                    .inc();
                self.metrics
                    .loopback_config_healthy
                    .with_label_values(label)
                    .set(0);
                return Err(e);
            }
        }
        self.metrics
            .loopback_config_healthy
            .with_label_values(label)
            .set(1);

        self.backends
            .addresses
            .set_mtu(snapshot.config.mtus(family), family)
            .await
    }

    /// Announce the VIP set. The steady path passes the union of desired
    /// and already-announced addresses so it only ever adds; the forced
    /// path passes the bare desired set, which is where withdrawals of
    /// dropped VIPs converge.
    async fn set_bgp(&self, snapshot: &Snapshot, family: AddressFamily, forced: bool) -> Result<()> {
        let Some(bgp) = &self.backends.bgp else {
            return Ok(());
        };
        match family {
            AddressFamily::V4 => {
                let announced = bgp.get().await?;
                let mut target: Vec<String> = snapshot.config.config.keys().cloned().collect();
                if !forced {
                    for addr in &announced {
                        if !target.contains(addr) {
                            target.push(addr.clone());
                        }
                    }
                }
                target.sort();
                bgp.set(&target, &announced, &self.cfg.communities).await
            }
            AddressFamily::V6 => {
                let mut target: Vec<String> = snapshot.config.config6.keys().cloned().collect();
                target.sort();
                bgp.set_v6(&target, &self.cfg.communities).await
            }
        }
    }

    /// Converge the IPVS table for one family with the minimal action set.
    async fn set_ipvs(&self, snapshot: &Snapshot, family: AddressFamily) -> Result<()> {
        let Some(ipvs) = &self.backends.ipvs else {
            return Ok(());
        };
        let observed = ipvs.observe().await?;
        let desired = desired_ipvs(
            family,
            &snapshot.nodes,
            &snapshot.config,
            &snapshot.services,
            &self.cfg,
        );
        let actions = plan_actions(&desired, &observed, &snapshot.config);
        if actions.is_empty() {
            return Ok(());
        }
        debug!(family = %family, actions = actions.len(), "applying ipvs actions");
        ipvs.apply(&actions).await
    }

    /// Converge the managed nat chain.
    async fn set_iptables(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(ipt) = &self.backends.iptables else {
            return Ok(());
        };
        ipt.ensure_chain().await?;
        let observed = ipt.observe().await?;
        let desired = iptables::desired_rules(&snapshot.config, &snapshot.services, &self.cfg);
        let (to_delete, to_append) = iptables::diff_rules(&observed, &desired);
        for rule in &to_delete {
            ipt.delete(rule).await?;
        }
        for rule in &to_append {
            ipt.append(rule).await?;
        }
        Ok(())
    }

    /// Observe and compare without mutating anything.
    async fn check_parity(&self) -> Result<bool> {
        let snapshot = self.store.snapshot();
        let observed = self.backends.addresses.observe().await?;
        let observed_ipvs = match (&self.plan, &self.backends.ipvs) {
            (ReconcilePlan::Director, Some(ipvs)) => Some(ipvs.observe().await?),
            _ => None,
        };
        Ok(parity::same_config(
            &snapshot,
            &self.cfg,
            &observed,
            observed_ipvs.as_deref(),
        ))
    }

    fn record_queue_depth(&self) {
        if let Some(feed) = &self.config_feed {
            let depth = (feed.max_capacity() - feed.capacity()) as i64;
            self.metrics.config_queue_depth.set(depth);
        }
    }

    /// Best-effort removal of managed state on shutdown.
    ///
    /// Scoped to the managed device names derived from the last snapshot's
    /// desired set; addresses some other process placed are never touched.
    /// Errors are aggregated, not retried.
    pub async fn cleanup(&self) -> Result<()> {
        let snapshot = self.store.snapshot();
        let mut errors = Vec::new();
        for family in [AddressFamily::V4, AddressFamily::V6] {
            let (devices, _) = device::desired_devices(&snapshot.config, family);
            for device in devices {
                if let Err(e) = self.backends.addresses.remove(&device, family).await {
                    errors.push(format!("failed to remove {device}: {e}"));
                }
            }
        }
        if self.plan == ReconcilePlan::RealServer {
            if let Some(ipt) = &self.backends.iptables {
                if let Err(e) = ipt.flush().await {
                    errors.push(format!("failed to flush chain: {e}"));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            warn!(errors = errors.len(), "cleanup finished with errors");
            Err(Error::Cleanup(errors))
        }
    }
}
