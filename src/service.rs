// System
use std::sync::Arc;

// Third Party
use kube::Client;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Local
use crate::{
    attacher::Attacher,
    client::{JobHandle, TraceJobClient, TraceJobFilter, TraceJobSummary},
    cluster::{KubeCluster, TraceCluster},
    config::TraceConfig,
    error::TraceResult,
    identity::TraceId,
    request::TraceRequest,
    target::{KubeTargetResolver, TargetResolver},
    tracejob::JobSpecBuilder,
};

/// Entry point for front ends: submit, attach to, delete and list traces.
///
/// Holds no per-trace state, so one service can drive any number of concurrent traces over the
/// shared cluster client.
#[derive(Clone)]
pub struct TraceService {
    resolver: Arc<dyn TargetResolver>,
    builder: JobSpecBuilder,
    jobs: TraceJobClient,
    attacher: Attacher,
}

impl TraceService {
    pub fn new(
        cluster: Arc<dyn TraceCluster>,
        resolver: Arc<dyn TargetResolver>,
        config: TraceConfig,
    ) -> Self {
        Self {
            resolver,
            jobs: TraceJobClient::new(cluster.clone()),
            attacher: Attacher::new(cluster, config.locator.clone()),
            builder: JobSpecBuilder::new(config),
        }
    }

    /// A service talking to the cluster behind `client`.
    pub fn with_client(client: &Client, config: TraceConfig) -> Self {
        Self::new(
            Arc::new(KubeCluster::new(client)),
            Arc::new(KubeTargetResolver::new(client)),
            config,
        )
    }

    /// Resolve the target, mint a trace id and create the workload. Nothing is created when
    /// validation or resolution fails.
    pub async fn submit(&self, request: &TraceRequest, namespace: &str) -> TraceResult<JobHandle> {
        let target = self.resolver.resolve(&request.target, namespace).await?;
        debug!("Resolved {:?} to node {}", request.target, target.hostname);
        let trace_job = self
            .builder
            .trace_job(TraceId::generate(), namespace, request, target)?;
        self.jobs.create_job(&trace_job).await
    }

    /// Stream the output of a trace to `out`. See `Attacher::attach_job`.
    pub async fn attach<W>(
        &self,
        id: &TraceId,
        namespace: &str,
        token: &CancellationToken,
        out: &mut W,
    ) -> TraceResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.attacher.attach_job(id, namespace, token, out).await
    }

    pub async fn delete(&self, id: &TraceId, namespace: &str) -> TraceResult<()> {
        self.jobs.delete_job(namespace, id).await
    }

    pub async fn list(
        &self,
        namespace: &str,
        filter: &TraceJobFilter,
    ) -> TraceResult<Vec<TraceJobSummary>> {
        let summaries: Vec<TraceJobSummary> = self
            .jobs
            .list_jobs(namespace, filter)
            .await?
            .iter()
            .map(JobHandle::summary)
            .collect();
        info!("Found {} traces in {}", summaries.len(), namespace);
        Ok(summaries)
    }
}
