// System
use std::sync::Arc;

// Third Party
use futures::AsyncReadExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Local
use crate::{
    cluster::TraceCluster,
    config::LocatorConfig,
    error::{TraceError, TraceResult},
    identity::TraceId,
    locator::PodLocator,
    signals::cancellable,
    utils::TRACER_CONTAINER_NAME,
};

const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Streams the output of a running trace to a local sink.
///
/// Attaching is observational: cancellation detaches and leaves the job running until it ends
/// or hits its deadline. Removing the job is a separate, explicit operation.
#[derive(Clone)]
pub struct Attacher {
    cluster: Arc<dyn TraceCluster>,
    locator: PodLocator,
}

impl Attacher {
    pub fn new(cluster: Arc<dyn TraceCluster>, locator_config: LocatorConfig) -> Self {
        Self {
            locator: PodLocator::new(cluster.clone(), locator_config),
            cluster,
        }
    }

    /// Wait for the trace pod to run, then copy its output to `out` until the container exits
    /// (`Ok`), `token` is cancelled (`Cancelled`) or the stream breaks (`StreamInterrupted`).
    /// There is no reconnect; call again to re-attach.
    pub async fn attach_job<W>(
        &self,
        id: &TraceId,
        namespace: &str,
        token: &CancellationToken,
        out: &mut W,
    ) -> TraceResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let pod = self.locator.locate(id, namespace, token).await?;
        info!("Attaching to trace {} (pod {})", id, pod.name);

        let mut reader = cancellable(
            token,
            self.cluster
                .log_stream(namespace, &pod.name, TRACER_CONTAINER_NAME),
        )
        .await?
        .map_err(|e| TraceError::api(format!("failed to open output of pod {}", pod.name), e))?;

        let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Detached from trace {}, it keeps running", id);
                    return Err(TraceError::Cancelled);
                }
                read = reader.read(&mut buffer) => read,
            };
            match read {
                Ok(0) => {
                    debug!("Output of trace {} ended", id);
                    return Ok(());
                }
                Ok(count) => {
                    out.write_all(&buffer[..count])
                        .await
                        .map_err(TraceError::StreamInterrupted)?;
                    out.flush().await.map_err(TraceError::StreamInterrupted)?;
                }
                Err(error) => return Err(TraceError::StreamInterrupted(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // System
    use std::time::Duration;

    // Local
    use super::*;
    use crate::cluster::fake::{pod, Call, FakeCluster, FakeLogs};

    fn attacher(cluster: &Arc<FakeCluster>) -> Attacher {
        Attacher::new(
            cluster.clone(),
            LocatorConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                wait_budget: Duration::from_secs(5),
            },
        )
    }

    fn running_trace() -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        cluster.push_pods(vec![pod("kubectl-trace-abc-x1", "Running")]);
        cluster
    }

    #[tokio::test]
    async fn relays_output_until_the_container_exits() {
        let cluster = running_trace();
        cluster.set_logs(FakeLogs::Chunks(vec![
            "Attaching 1 probe...\n",
            "@[bash]: 3\n",
            "@[sshd]: 12\n",
        ]));
        let mut out = Vec::new();

        attacher(&cluster)
            .attach_job(
                &TraceId::generate(),
                "default",
                &CancellationToken::new(),
                &mut out,
            )
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Attaching 1 probe...\n@[bash]: 3\n@[sshd]: 12\n"
        );
        assert!(cluster
            .calls()
            .contains(&Call::LogStream("kubectl-trace-abc-x1".to_string())));
    }

    #[tokio::test]
    async fn broken_stream_is_interrupted() {
        let cluster = running_trace();
        cluster.set_logs(FakeLogs::FailAfter(vec!["Attaching 1 probe...\n"]));
        let mut out = Vec::new();

        let result = attacher(&cluster)
            .attach_job(
                &TraceId::generate(),
                "default",
                &CancellationToken::new(),
                &mut out,
            )
            .await;
        assert!(matches!(result, Err(TraceError::StreamInterrupted(_))));
        assert_eq!(out, b"Attaching 1 probe...\n");
    }

    #[tokio::test]
    async fn cancelling_a_blocked_read_detaches_without_deleting() {
        let cluster = running_trace();
        cluster.set_logs(FakeLogs::Pending);
        let token = CancellationToken::new();

        let attaching = {
            let attacher = attacher(&cluster);
            let token = token.clone();
            tokio::spawn(async move {
                let mut out = Vec::new();
                attacher
                    .attach_job(&TraceId::generate(), "default", &token, &mut out)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!attaching.is_finished());
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), attaching)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TraceError::Cancelled)));
        assert!(!cluster
            .calls()
            .iter()
            .any(|call| matches!(call, Call::DeleteJob(_))));
    }

    #[tokio::test]
    async fn already_cancelled_never_opens_a_stream() {
        let cluster = running_trace();
        let token = CancellationToken::new();
        token.cancel();
        let mut out = Vec::new();

        let result = attacher(&cluster)
            .attach_job(&TraceId::generate(), "default", &token, &mut out)
            .await;
        assert!(matches!(result, Err(TraceError::Cancelled)));
        assert!(!cluster
            .calls()
            .iter()
            .any(|call| matches!(call, Call::LogStream(_))));
    }

    #[tokio::test]
    async fn locator_errors_pass_through() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.push_pods(vec![pod("kubectl-trace-abc-x1", "Failed")]);
        let mut out = Vec::new();

        let result = attacher(&cluster)
            .attach_job(
                &TraceId::generate(),
                "default",
                &CancellationToken::new(),
                &mut out,
            )
            .await;
        assert!(matches!(result, Err(TraceError::PodNeverRan { .. })));
        assert!(out.is_empty());
    }
}
