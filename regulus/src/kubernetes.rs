use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, ResourceExt};
use tracing::{info, trace};

use crate::daemon::watcher::{ContainerEvent, ContainerInfo, ContainerRuntime};
use crate::{Error, Result};

const POD_RUNNING: &str = "Running";

/// Pods scheduled to this node, reported as containers keyed by pod UID.
/// Host network pods are never reported.
#[derive(Clone)]
pub struct PodRuntime {
    pods: Api<Pod>,
    node_name: String,
}

impl PodRuntime {
    pub async fn try_new(node_name: String) -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client, node_name))
    }

    pub fn new(client: kube::Client, node_name: String) -> Self {
        Self {
            pods: Api::all(client),
            node_name,
        }
    }

    fn field_selector(&self) -> String {
        format!("spec.nodeName={}", self.node_name)
    }
}

impl ContainerRuntime for PodRuntime {
    fn events(&self) -> BoxStream<'static, Result<ContainerEvent>> {
        info!(node = self.node_name, "started pod watch");
        let config = watcher::Config::default().fields(&self.field_selector());
        watcher(self.pods.clone(), config)
            .default_backoff()
            .filter_map(|res| async move {
                match res {
                    Ok(event) => pod_event(event).map(Ok),
                    Err(e) => Some(Err(Error::from(e))),
                }
            })
            .boxed()
    }

    fn list_running(&self) -> BoxFuture<'_, Result<Vec<ContainerInfo>>> {
        Box::pin(async move {
            let params = ListParams::default().fields(&self.field_selector());
            let pods = self.pods.list(&params).await?;
            Ok(pods
                .items
                .iter()
                .filter_map(|pod| match pod_change(pod) {
                    Some(ContainerEvent::Start(info)) => Some(info),
                    _ => None,
                })
                .collect())
        })
    }
}

fn pod_event(event: watcher::Event<Pod>) -> Option<ContainerEvent> {
    match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => pod_change(&pod),
        watcher::Event::Delete(pod) => {
            if pod_is_host_network(&pod) {
                return None;
            }
            pod.uid().map(ContainerEvent::Die)
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

fn pod_change(pod: &Pod) -> Option<ContainerEvent> {
    if pod_is_host_network(pod) {
        return None;
    }
    let uid = pod.uid()?;
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if pod.metadata.deletion_timestamp.is_some() || matches!(phase, Some("Succeeded" | "Failed")) {
        return Some(ContainerEvent::Die(uid));
    }
    if phase != Some(POD_RUNNING) {
        trace!(pod = pod.name_any(), ?phase, "pod not running yet");
        return None;
    }
    Some(ContainerEvent::Start(ContainerInfo {
        id: uid,
        plugin_endpoint_id: None,
        labels: pod.labels().to_owned(),
    }))
}

fn pod_is_host_network(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.host_network.unwrap_or_default()
}
