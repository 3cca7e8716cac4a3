//! Worker lifecycle for one role.
//!
//! A worker owns the watch-consumption task and the reconciler task. The
//! coordinator (or the director main, which runs unconditionally) starts
//! and stops it; stop drains the reconciler through its done channel and
//! then runs best-effort cleanup under a bounded deadline.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::reconciler::{Backends, ReconcilePlan, Reconciler};
use crate::store::{NodeUpdate, Store};
use crate::traits::WorkerControl;
use crate::types::{ClusterConfig, NodesList, ServicesIndex};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long stop waits for the reconciler's done signal, and separately
/// for cleanup.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Sender half of the watch delivery channels, owned by the watcher.
#[derive(Clone)]
pub struct WatchSenders {
    /// Complete cluster-config snapshots.
    pub config: mpsc::Sender<ClusterConfig>,
    /// Complete node lists.
    pub nodes: mpsc::Sender<NodesList>,
    /// Rebuilt services indexes.
    pub services: mpsc::Sender<ServicesIndex>,
}

/// Receiver half, reclaimed across worker start/stop cycles.
#[derive(Clone)]
pub struct WatchReceivers {
    config: Arc<Mutex<mpsc::Receiver<ClusterConfig>>>,
    nodes: Arc<Mutex<mpsc::Receiver<NodesList>>>,
    services: Arc<Mutex<mpsc::Receiver<ServicesIndex>>>,
}

/// Create the watch delivery channels. Capacity one: the watcher blocks on
/// a full channel until the worker's watch loop drains it, so at most one
/// delivery is ever pending.
pub fn watch_channels() -> (WatchSenders, WatchReceivers) {
    let (config_tx, config_rx) = mpsc::channel(1);
    let (nodes_tx, nodes_rx) = mpsc::channel(1);
    let (services_tx, services_rx) = mpsc::channel(1);
    (
        WatchSenders {
            config: config_tx,
            nodes: nodes_tx,
            services: services_tx,
        },
        WatchReceivers {
            config: Arc::new(Mutex::new(config_rx)),
            nodes: Arc::new(Mutex::new(nodes_rx)),
            services: Arc::new(Mutex::new(services_rx)),
        },
    )
}

/// Apply watch deliveries to the store until cancelled.
///
/// Node lists semantically equal to the held one are dropped before the
/// store mutex is taken, surfacing only as the no-op metric.
async fn watch_loop(
    store: Arc<Store>,
    receivers: WatchReceivers,
    metrics: Arc<Metrics>,
    token: CancellationToken,
) {
    let mut config_rx = receivers.config.lock().await;
    let mut nodes_rx = receivers.nodes.lock().await;
    let mut services_rx = receivers.services.lock().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("watch loop cancelled");
                return;
            }
            Some(config) = config_rx.recv() => {
                debug!("received cluster config");
                store.apply_config(config);
                metrics.config_updates.inc();
            }
            Some(nodes) = nodes_rx.recv() => {
                let result = match store.apply_nodes(nodes) {
                    NodeUpdate::Noop => "noop",
                    NodeUpdate::Updated => "updated",
                };
                metrics.node_updates.with_label_values(&[result]).inc();
            }
            Some(services) = services_rx.recv() => {
                store.apply_services(services);
            }
        }
    }
}

struct Running {
    token: CancellationToken,
    done_rx: oneshot::Receiver<()>,
    watch_handle: JoinHandle<()>,
    reconcile_handle: JoinHandle<Result<()>>,
}

/// One role's reconciling worker.
pub struct Worker {
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    reconciler: Arc<Reconciler>,
    receivers: WatchReceivers,
    root: CancellationToken,
    running: Option<Running>,
}

impl Worker {
    /// Assemble a worker for the given plan. Nothing runs until `start`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan: ReconcilePlan,
        store: Arc<Store>,
        cfg: Arc<Config>,
        metrics: Arc<Metrics>,
        backends: Backends,
        senders: &WatchSenders,
        receivers: WatchReceivers,
        root: CancellationToken,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            plan,
            Arc::clone(&store),
            cfg,
            Arc::clone(&metrics),
            backends,
            Some(senders.config.clone()),
        ));
        Worker {
            store,
            metrics,
            reconciler,
            receivers,
            root,
            running: None,
        }
    }

    /// Spawn the watch loop and the reconcile loop under a child token.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            warn!("worker already running");
            return Ok(());
        }
        info!("starting worker");
        let token = self.root.child_token();
        let (done_tx, done_rx) = oneshot::channel();

        let watch_handle = tokio::spawn(watch_loop(
            Arc::clone(&self.store),
            self.receivers.clone(),
            Arc::clone(&self.metrics),
            token.clone(),
        ));
        let reconcile_handle =
            tokio::spawn(Arc::clone(&self.reconciler).run(token.clone(), done_tx));

        self.running = Some(Running {
            token,
            done_rx,
            watch_handle,
            reconcile_handle,
        });
        self.metrics.worker_running.set(1);
        Ok(())
    }

    /// Cancel, drain, and clean up. Stopping an idle worker is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        info!("stopping worker, blocking until periodic tasks complete");
        running.token.cancel();
        self.metrics.worker_running.set(0);

        if timeout(STOP_DEADLINE, running.done_rx).await.is_err() {
            warn!("reconciler did not acknowledge cancellation in time");
        }
        running.watch_handle.abort();
        running.reconcile_handle.abort();

        info!("starting cleanup");
        let result = match timeout(STOP_DEADLINE, self.reconciler.cleanup()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Cleanup(vec!["cleanup deadline exceeded".into()])),
        };
        info!("cleanup completed");
        result
    }

    /// Resolve if the reconciler task fails fatally. Pends forever while
    /// the worker is idle or healthy.
    pub async fn failed(&mut self) -> Error {
        match &mut self.running {
            Some(running) => match (&mut running.reconcile_handle).await {
                Ok(Err(e)) => e,
                _ => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl WorkerControl for Worker {
    async fn start(&mut self) -> Result<()> {
        Worker::start(self).await
    }

    async fn stop(&mut self) -> Result<()> {
        Worker::stop(self).await
    }
}
