// System
use std::{fmt, sync::Arc};

// Third Party
use k8s_openapi::{
    api::batch::v1::Job,
    chrono::{DateTime, Utc},
};
use tracing::{debug, info, warn};

// Local
use crate::{
    cluster::TraceCluster,
    error::{api_error_code, TraceError, TraceResult},
    identity::TraceId,
    tracejob::{JobSpecBuilder, TraceJob, TraceJobSpec},
    utils::{
        CONTAINER_ANNOTATION_KEY, HOSTNAME_ANNOTATION_KEY, POD_UID_ANNOTATION_KEY,
        TRACE_ID_LABEL_KEY, TRACE_LABEL_KEY, TRACE_LABEL_VALUE,
    },
};

/// A workload that exists in the cluster.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: TraceId,
    pub name: String,
    pub namespace: String,
    pub job: Job,
}

impl JobHandle {
    /// `None` for jobs that carry no parseable trace id label.
    fn from_job(job: Job) -> Option<Self> {
        let id = job
            .metadata
            .labels
            .as_ref()?
            .get(TRACE_ID_LABEL_KEY)?
            .parse()
            .ok()?;
        Some(Self {
            id,
            name: job.metadata.name.clone().unwrap_or_default(),
            namespace: job.metadata.namespace.clone().unwrap_or_default(),
            job,
        })
    }

    pub fn summary(&self) -> TraceJobSummary {
        let annotations = self.job.metadata.annotations.clone().unwrap_or_default();
        let hostname = annotations
            .get(HOSTNAME_ANNOTATION_KEY)
            .cloned()
            .unwrap_or_default();
        let target = match (
            annotations.get(POD_UID_ANNOTATION_KEY),
            annotations.get(CONTAINER_ANNOTATION_KEY),
        ) {
            (Some(uid), Some(container)) => {
                format!("pod/{} container/{} node/{}", uid, container, hostname)
            }
            _ => format!("node/{}", hostname),
        };
        TraceJobSummary {
            id: self.id,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            target,
            start_time: self
                .job
                .status
                .as_ref()
                .and_then(|status| status.start_time.as_ref())
                .map(|time| time.0),
            phase: JobPhase::of(&self.job),
        }
    }
}

/// Coarse state of a trace workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Suspended,
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn of(job: &Job) -> Self {
        let status = job.status.clone().unwrap_or_default();
        let condition = |kind: &str| {
            status
                .conditions
                .iter()
                .flatten()
                .any(|c| c.type_ == kind && c.status == "True")
        };
        if condition("Failed") || status.failed.unwrap_or(0) > 0 {
            JobPhase::Failed
        } else if condition("Complete") || status.succeeded.unwrap_or(0) > 0 {
            JobPhase::Completed
        } else if status.active.unwrap_or(0) > 0 {
            JobPhase::Running
        } else if job.spec.as_ref().and_then(|spec| spec.suspend) == Some(true) {
            JobPhase::Suspended
        } else {
            JobPhase::Pending
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            JobPhase::Suspended => "Suspended",
            JobPhase::Pending => "Pending",
            JobPhase::Running => "Running",
            JobPhase::Completed => "Completed",
            JobPhase::Failed => "Failed",
        };
        f.write_str(phase)
    }
}

/// One row of `list` output.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceJobSummary {
    pub id: TraceId,
    pub name: String,
    pub namespace: String,
    pub target: String,
    pub start_time: Option<DateTime<Utc>>,
    pub phase: JobPhase,
}

/// Which traces `list_jobs` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceJobFilter {
    pub id: Option<TraceId>,
}

impl TraceJobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn id(id: TraceId) -> Self {
        Self { id: Some(id) }
    }

    pub fn label_selector(&self) -> String {
        let mut selector = format!("{}={}", TRACE_LABEL_KEY, TRACE_LABEL_VALUE);
        if let Some(id) = &self.id {
            selector.push_str(&format!(",{}={}", TRACE_ID_LABEL_KEY, id));
        }
        selector
    }
}

fn create_error(error: kube::Error, name: &str, what: &str) -> TraceError {
    match api_error_code(&error) {
        // 409 Conflict
        Some(409) => TraceError::AlreadyExists {
            name: name.to_string(),
        },
        _ => TraceError::api(format!("failed to create {} {}", what, name), error),
    }
}

/// Creates, lists and deletes trace workloads. Never retries; retry policy belongs to the caller.
#[derive(Clone)]
pub struct TraceJobClient {
    cluster: Arc<dyn TraceCluster>,
}

impl TraceJobClient {
    pub fn new(cluster: Arc<dyn TraceCluster>) -> Self {
        Self { cluster }
    }

    /// Submit the object graph of a trace.
    ///
    /// The job is created suspended, then the config map is created with the job as its owner,
    /// then the job is resumed. No pod can start before the config map exists and the config map
    /// is never unowned. If anything after the job creation fails the job is deleted again, which
    /// takes an already created config map with it.
    ///
    /// Calling this twice for the same trace job fails with `AlreadyExists`.
    pub async fn create_job(&self, trace_job: &TraceJob) -> TraceResult<JobHandle> {
        let spec = JobSpecBuilder::build(trace_job);
        let namespace = trace_job.namespace.as_str();
        let name = trace_job.name.as_str();

        debug!("Creating suspended job {}/{}...", namespace, name);
        let created = self
            .cluster
            .create_job(namespace, &spec.job)
            .await
            .map_err(|e| create_error(e, name, "job"))?;

        let resumed = match self.finish_create(trace_job, &spec, &created).await {
            Ok(resumed) => resumed,
            Err(error) => {
                self.rollback(namespace, name).await;
                return Err(error);
            }
        };

        info!(
            "Created trace {} on node {}",
            trace_job.id, trace_job.target.hostname
        );
        Ok(JobHandle {
            id: trace_job.id,
            name: name.to_string(),
            namespace: namespace.to_string(),
            job: resumed,
        })
    }

    async fn finish_create(
        &self,
        trace_job: &TraceJob,
        spec: &TraceJobSpec,
        created: &Job,
    ) -> TraceResult<Job> {
        let namespace = trace_job.namespace.as_str();
        let name = trace_job.name.as_str();

        let config_map = spec.owned_config_map(created)?;
        debug!("Creating config map {}/{}...", namespace, name);
        self.cluster
            .create_config_map(namespace, &config_map)
            .await
            .map_err(|e| create_error(e, name, "config map"))?;

        debug!("Resuming job {}/{}...", namespace, name);
        self.cluster
            .set_job_suspended(namespace, name, false)
            .await
            .map_err(|e| TraceError::api(format!("failed to resume job {}", name), e))
    }

    async fn rollback(&self, namespace: &str, name: &str) {
        warn!("Rolling back partially created trace {}/{}", namespace, name);
        if let Err(error) = self.cluster.delete_job(namespace, name).await {
            warn!("Failed to roll back job {}/{}: {}", namespace, name, error);
        }
    }

    pub async fn list_jobs(
        &self,
        namespace: &str,
        filter: &TraceJobFilter,
    ) -> TraceResult<Vec<JobHandle>> {
        let jobs = self
            .cluster
            .list_jobs(namespace, &filter.label_selector())
            .await
            .map_err(|e| {
                TraceError::api(format!("failed to list trace jobs in {}", namespace), e)
            })?;
        Ok(jobs.into_iter().filter_map(JobHandle::from_job).collect())
    }

    /// Delete the workload of a trace. The config map goes with it through its owner reference;
    /// this does not wait for that to happen.
    pub async fn delete_job(&self, namespace: &str, id: &TraceId) -> TraceResult<()> {
        let name = id.object_name();
        match self.cluster.delete_job(namespace, &name).await {
            Ok(()) => {
                info!("Deleted trace {}", id);
                Ok(())
            }
            // 404 Not found
            Err(error) if api_error_code(&error) == Some(404) => Err(TraceError::JobNotFound {
                id: id.to_string(),
            }),
            Err(error) => Err(TraceError::api(format!("failed to delete job {}", name), error)),
        }
    }
}
