//! Kubernetes watch consumption.
//!
//! Four watcher streams — nodes, endpoints, services and the cluster
//! ConfigMap — fold into a local [`ClusterView`]; after every event the
//! affected snapshot is rebuilt in full and delivered over the engine's
//! watch channels. Deliveries are complete snapshots, never deltas, and
//! watch errors are retried with the watcher's default backoff without
//! ever touching the kernel.

mod error;
mod view;

pub use error::{Result, WatchError};

use futures::StreamExt;
use halyard_core::types::ClusterConfig;
use halyard_core::WatchSenders;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Service};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use view::ClusterView;

/// Build a client from an explicit kubeconfig path, or infer the
/// environment (in-cluster service account, then local kubeconfig).
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// The watcher task set for one role.
pub struct Watcher {
    client: Client,
    configmap_namespace: String,
    configmap_name: String,
    config_key: String,
    senders: WatchSenders,
}

impl Watcher {
    /// Assemble a watcher delivering into the engine's channels.
    pub fn new(
        client: Client,
        configmap_namespace: impl Into<String>,
        configmap_name: impl Into<String>,
        config_key: impl Into<String>,
        senders: WatchSenders,
    ) -> Self {
        Watcher {
            client,
            configmap_namespace: configmap_namespace.into(),
            configmap_name: configmap_name.into(),
            config_key: config_key.into(),
            senders,
        }
    }

    /// Spawn the four watch tasks. They run until the token is cancelled;
    /// stream errors are logged and retried with backoff.
    pub fn spawn(self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let view = Arc::new(RwLock::new(ClusterView::default()));
        info!(
            namespace = %self.configmap_namespace,
            configmap = %self.configmap_name,
            key = %self.config_key,
            "starting cluster watches"
        );
        vec![
            tokio::spawn(watch_nodes(
                self.client.clone(),
                Arc::clone(&view),
                self.senders.clone(),
                token.clone(),
            )),
            tokio::spawn(watch_endpoints(
                self.client.clone(),
                Arc::clone(&view),
                self.senders.clone(),
                token.clone(),
            )),
            tokio::spawn(watch_services(
                self.client.clone(),
                Arc::clone(&view),
                self.senders.clone(),
                token.clone(),
            )),
            tokio::spawn(watch_configmap(
                self.client,
                self.configmap_namespace,
                self.configmap_name,
                self.config_key,
                self.senders,
                token,
            )),
        ]
    }
}

async fn watch_nodes(
    client: Client,
    view: Arc<RwLock<ClusterView>>,
    senders: WatchSenders,
    token: CancellationToken,
) {
    let api: Api<Node> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else { return };
        match event {
            Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                view.write().await.upsert_node(node);
            }
            Ok(watcher::Event::Delete(node)) => {
                view.write().await.remove_node(&node.name_any());
            }
            Ok(watcher::Event::Init) => {
                debug!("node watch (re)initializing");
                continue;
            }
            Ok(watcher::Event::InitDone) => {
                debug!("node watch initialized");
            }
            Err(e) => {
                error!(error = %e, "node watch error");
                continue;
            }
        }
        let nodes = view.read().await.build_nodes();
        if senders.nodes.send(nodes).await.is_err() {
            return;
        }
    }
}

async fn watch_endpoints(
    client: Client,
    view: Arc<RwLock<ClusterView>>,
    senders: WatchSenders,
    token: CancellationToken,
) {
    let api: Api<Endpoints> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else { return };
        match event {
            Ok(watcher::Event::Apply(ep)) | Ok(watcher::Event::InitApply(ep)) => {
                view.write().await.upsert_endpoints(ep);
            }
            Ok(watcher::Event::Delete(ep)) => {
                view.write()
                    .await
                    .remove_endpoints(&ep.namespace().unwrap_or_default(), &ep.name_any());
            }
            Ok(watcher::Event::Init) => continue,
            Ok(watcher::Event::InitDone) => {
                debug!("endpoints watch initialized");
            }
            Err(e) => {
                error!(error = %e, "endpoints watch error");
                continue;
            }
        }
        let nodes = view.read().await.build_nodes();
        if senders.nodes.send(nodes).await.is_err() {
            return;
        }
    }
}

async fn watch_services(
    client: Client,
    view: Arc<RwLock<ClusterView>>,
    senders: WatchSenders,
    token: CancellationToken,
) {
    let api: Api<Service> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else { return };
        match event {
            Ok(watcher::Event::Apply(svc)) | Ok(watcher::Event::InitApply(svc)) => {
                view.write().await.upsert_service(svc);
            }
            Ok(watcher::Event::Delete(svc)) => {
                view.write()
                    .await
                    .remove_service(&svc.namespace().unwrap_or_default(), &svc.name_any());
            }
            Ok(watcher::Event::Init) => continue,
            Ok(watcher::Event::InitDone) => {
                debug!("service watch initialized");
            }
            Err(e) => {
                error!(error = %e, "service watch error");
                continue;
            }
        }
        let index = view.read().await.build_services_index();
        if senders.services.send(index).await.is_err() {
            return;
        }
    }
}

async fn watch_configmap(
    client: Client,
    namespace: String,
    name: String,
    key: String,
    senders: WatchSenders,
    token: CancellationToken,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api, config).default_backoff().boxed();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else { return };
        let cm = match event {
            Ok(watcher::Event::Apply(cm)) | Ok(watcher::Event::InitApply(cm)) => cm,
            Ok(watcher::Event::Delete(_)) => {
                warn!(configmap = %name, "cluster configmap deleted, keeping last config");
                continue;
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => continue,
            Err(e) => {
                error!(error = %e, "configmap watch error");
                continue;
            }
        };
        match parse_config(&cm, &key) {
            Ok(config) => {
                debug!(configmap = %name, "delivering cluster config");
                if senders.config.send(config).await.is_err() {
                    return;
                }
            }
            Err(e) => error!(error = %e, "ignoring undecodable cluster config"),
        }
    }
}

/// Decode the cluster config payload from the ConfigMap.
fn parse_config(cm: &ConfigMap, key: &str) -> Result<ClusterConfig> {
    let payload = cm
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| WatchError::Payload {
            key: key.to_string(),
            detail: "key missing".to_string(),
        })?;
    serde_json::from_str(payload).map_err(|e| WatchError::Payload {
        key: key.to_string(),
        detail: e.to_string(),
    })
}
