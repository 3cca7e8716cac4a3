//! Real-server role: loopback VIPs and iptables on a backend node, gated
//! by director liveness.

use super::RoleArgs;
use crate::health;
use anyhow::Result;
use halyard_core::{
    coordinator, watch_channels, Backends, Metrics, ReconcilePlan, Store, Worker,
};
use halyard_system::{IptablesChain, LoopbackAddresses};
use halyard_watch::Watcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(args: RoleArgs) -> Result<()> {
    let config = Arc::new(args.into_config(10200));
    config.validate()?;
    info!(node = %config.node_name, "starting in real server mode");

    let metrics = Arc::new(Metrics::new("realserver"));
    let store = Arc::new(Store::new());
    let root = CancellationToken::new();

    tokio::spawn(health::listen(config.health_port, root.child_token()));

    let (senders, receivers) = watch_channels();
    let client = halyard_watch::client(config.kubeconfig.as_deref()).await?;
    Watcher::new(
        client,
        config.configmap_namespace.as_str(),
        config.configmap_name.as_str(),
        config.config_key.as_str(),
        senders.clone(),
    )
    .spawn(root.child_token());

    let backends = Backends {
        addresses: Arc::new(LoopbackAddresses::new(config.local_interface.as_str())),
        ipvs: None,
        bgp: None,
        iptables: Some(Arc::new(IptablesChain::new(config.iptables_chain.as_str()))),
    };
    let mut worker = Worker::new(
        ReconcilePlan::RealServer,
        store,
        Arc::clone(&config),
        Arc::clone(&metrics),
        backends,
        &senders,
        receivers,
        root.clone(),
    );

    let probe_port = config.coordinator_ports[0];
    info!(port = probe_port, "starting continuous poll to find director");
    let mut probes = coordinator::spawn_prober(probe_port, root.child_token());

    tokio::select! {
        result = coordinator::gate(
            &mut worker,
            &mut probes,
            config.failover_timeout,
            Arc::clone(&metrics),
            root.child_token(),
        ) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            root.cancel();
            worker.stop().await?;
        }
    }

    info!("real server exiting");
    Ok(())
}
