// System
use std::sync::Arc;

// Third Party
use k8s_openapi::api::core::v1::Pod;
use rand::Rng;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// Local
use crate::{
    cluster::TraceCluster,
    config::LocatorConfig,
    error::{TraceError, TraceResult},
    identity::TraceId,
    signals::cancellable,
    utils::TRACE_ID_LABEL_KEY,
};

/// Upper bound of the random jitter added to every backoff delay, in milliseconds.
const MAX_JITTER_MILLIS: u64 = 250;

/// The pod backing a trace, observed in the running phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedPod {
    pub name: String,
    pub uid: String,
    pub node_name: Option<String>,
}

impl From<&Pod> for LocatedPod {
    fn from(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            node_name: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
        }
    }
}

enum LocatorState {
    Searching,
    Found(Pod),
    Running(LocatedPod),
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("Unknown")
}

/// Waits for the single pod of a trace to start running. Read-only, so it can be run again for
/// every attach.
#[derive(Clone)]
pub struct PodLocator {
    cluster: Arc<dyn TraceCluster>,
    config: LocatorConfig,
}

impl PodLocator {
    pub fn new(cluster: Arc<dyn TraceCluster>, config: LocatorConfig) -> Self {
        Self { cluster, config }
    }

    /// Sleep before the next poll with exponential backoff and jitter, failing with `Timeout`
    /// once the wait budget is used up.
    async fn backoff(
        &self,
        start: Instant,
        delay: &mut Duration,
        token: &CancellationToken,
    ) -> TraceResult<()> {
        let budget = self.config.wait_budget;
        let elapsed = start.elapsed();
        if elapsed >= budget {
            return Err(TraceError::Timeout { waited: elapsed });
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..MAX_JITTER_MILLIS));
        let wait = std::cmp::min(*delay + jitter, budget - elapsed);
        debug!("Polling again for the trace pod in {:?}...", wait);
        cancellable(token, time::sleep(wait)).await?;
        // Increase the delay for next retry
        *delay = std::cmp::min(self.config.max_delay, *delay * 2);

        let elapsed = start.elapsed();
        if elapsed >= budget {
            return Err(TraceError::Timeout { waited: elapsed });
        }
        Ok(())
    }

    /// State machine loop that polls until exactly one pod of the trace is running.
    pub async fn locate(
        &self,
        id: &TraceId,
        namespace: &str,
        token: &CancellationToken,
    ) -> TraceResult<LocatedPod> {
        let selector = format!("{}={}", TRACE_ID_LABEL_KEY, id);
        let start = Instant::now();
        let mut delay = self.config.initial_delay;
        let mut state = LocatorState::Searching;
        loop {
            state = match state {
                LocatorState::Searching => {
                    debug!("State: Searching");
                    let pods = cancellable(token, self.cluster.list_pods(namespace, &selector))
                        .await?
                        .map_err(|e| {
                            TraceError::api(format!("failed to list pods of trace {}", id), e)
                        })?;
                    match pods.len() {
                        0 => {
                            debug!("No pod for trace {} yet", id);
                            self.backoff(start, &mut delay, token).await?;
                            LocatorState::Searching
                        }
                        1 => LocatorState::Found(pods.into_iter().next().unwrap_or_default()),
                        count => {
                            return Err(TraceError::MultiplePods {
                                id: id.to_string(),
                                count,
                            })
                        }
                    }
                }
                LocatorState::Found(pod) => {
                    debug!("State: Found");
                    match pod_phase(&pod) {
                        "Running" => LocatorState::Running(LocatedPod::from(&pod)),
                        phase @ ("Succeeded" | "Failed") => {
                            return Err(TraceError::PodNeverRan {
                                pod: pod.metadata.name.clone().unwrap_or_default(),
                                phase: phase.to_string(),
                            })
                        }
                        phase => {
                            debug!(
                                "Pod {} is {}, waiting for it to run...",
                                pod.metadata.name.as_deref().unwrap_or_default(),
                                phase
                            );
                            self.backoff(start, &mut delay, token).await?;
                            LocatorState::Searching
                        }
                    }
                }
                LocatorState::Running(pod) => {
                    debug!("State: Running");
                    return Ok(pod);
                }
            }
        }
    }
}
