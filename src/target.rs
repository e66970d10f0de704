// Third Party
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{api::Api, Client};
use tracing::debug;

// Local
use crate::{
    error::{api_error_code, TraceError, TraceResult},
    request::TargetSpec,
    utils::HOSTNAME_LABEL_KEY,
};

/// Pod and container a trace is correlated with. Used for display and passed to the runner, never
/// for scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodCorrelation {
    pub uid: String,
    pub container: String,
}

/// A target reduced to the node it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Value of the node's `kubernetes.io/hostname` label.
    pub hostname: String,
    pub pod: Option<PodCorrelation>,
}

impl ResolvedTarget {
    pub fn node(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            pod: None,
        }
    }

    pub fn pod(hostname: &str, uid: &str, container: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            pod: Some(PodCorrelation {
                uid: uid.to_string(),
                container: container.to_string(),
            }),
        }
    }
}

#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, target: &TargetSpec, namespace: &str) -> TraceResult<ResolvedTarget>;
}

/// Resolves targets by reading nodes and pods from the API server.
#[derive(Clone)]
pub struct KubeTargetResolver {
    client: Client,
}

impl KubeTargetResolver {
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.clone(),
        }
    }

    async fn get_node(&self, name: &str) -> TraceResult<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes.get(name).await.map_err(|error| match api_error_code(&error) {
            Some(404) => TraceError::Target(format!("node {} not found", name)),
            _ => TraceError::api(format!("failed to get node {}", name), error),
        })
    }
}

#[async_trait]
impl TargetResolver for KubeTargetResolver {
    async fn resolve(&self, target: &TargetSpec, namespace: &str) -> TraceResult<ResolvedTarget> {
        match target {
            TargetSpec::Node { name } => {
                let node = self.get_node(name).await?;
                Ok(ResolvedTarget::node(&node_hostname(&node)?))
            }
            TargetSpec::PodContainer { pod, container } => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let pod = pods.get(pod).await.map_err(|error| match api_error_code(&error) {
                    Some(404) => TraceError::Target(format!(
                        "pod {} not found in namespace {}",
                        pod, namespace
                    )),
                    _ => TraceError::api(format!("failed to get pod {}", pod), error),
                })?;
                let (node_name, uid, container) = pod_placement(&pod, container.as_deref())?;
                debug!(
                    "Pod {} (container {}) is scheduled on node {}",
                    uid, container, node_name
                );
                let node = self.get_node(&node_name).await?;
                Ok(ResolvedTarget::pod(&node_hostname(&node)?, &uid, &container))
            }
        }
    }
}

/// The node's hostname label, which is what the workload gets pinned to.
pub fn node_hostname(node: &Node) -> TraceResult<String> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(HOSTNAME_LABEL_KEY))
        .cloned()
        .ok_or_else(|| {
            TraceError::Target(format!("label {} not found in node", HOSTNAME_LABEL_KEY))
        })
}

/// Returns `(node name, pod uid, container)` for a scheduled pod. Without an explicit container
/// the first one is picked.
pub fn pod_placement(pod: &Pod, container: Option<&str>) -> TraceResult<(String, String, String)> {
    let spec = pod.spec.as_ref();
    let node_name = spec
        .and_then(|spec| spec.node_name.clone())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            TraceError::Target(
                "cannot attach a trace program to a pod that is not currently scheduled on a node"
                    .to_string(),
            )
        })?;
    let containers = spec.map(|spec| spec.containers.as_slice()).unwrap_or_default();
    let found = match container {
        Some(wanted) => containers.iter().find(|c| c.name == wanted),
        None => containers.first(),
    };
    let container = found.map(|c| c.name.clone()).ok_or_else(|| {
        TraceError::Target(
            "no containers found for the provided pod/container combination".to_string(),
        )
    })?;
    let uid = pod.metadata.uid.clone().unwrap_or_default();
    Ok((node_name, uid, container))
}
