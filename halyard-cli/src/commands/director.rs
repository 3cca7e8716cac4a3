//! Director role: announce VIPs over BGP and program IPVS.

use super::RoleArgs;
use crate::health;
use anyhow::Result;
use halyard_bgp::GobgpController;
use halyard_core::{
    coordinator, watch_channels, Backends, Metrics, ReconcilePlan, Store, Worker,
};
use halyard_system::{sysctl, IpvsRules, LoopbackAddresses};
use halyard_watch::Watcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub async fn run(args: RoleArgs) -> Result<()> {
    let config = Arc::new(args.into_config(10201));
    config.validate()?;
    info!(node = %config.node_name, "starting in director mode");

    // node preparation: ARP behavior for the VIP interface, IPVS tunables
    sysctl::set_arp(
        &config.local_interface,
        config.arp_announce,
        config.arp_ignore,
    )
    .await?;
    sysctl::set_ipvs(&config.ipvs_sysctl).await?;

    let metrics = Arc::new(Metrics::new("director"));
    let store = Arc::new(Store::new());
    let root = CancellationToken::new();

    info!(ports = ?config.coordinator_ports, "starting coordination listeners");
    for port in &config.coordinator_ports {
        let listener = coordinator::bind(*port).await?;
        tokio::spawn(coordinator::serve(listener, root.child_token()));
    }
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
        ipvs: Some(Arc::new(IpvsRules::new())),
        bgp: Some(Arc::new(GobgpController::new())),
        iptables: None,
    };
    let mut worker = Worker::new(
        ReconcilePlan::Director,
        store,
        Arc::clone(&config),
        Arc::clone(&metrics),
        backends,
        &senders,
        receivers,
        root.clone(),
    );
    worker.start().await?;
    info!("director started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        err = worker.failed() => {
            error!(error = %err, "reconciler failed");
            root.cancel();
            let _ = worker.stop().await;
            return Err(err.into());
        }
    }

    root.cancel();
    worker.stop().await?;
    info!("director exiting");
    Ok(())
}
