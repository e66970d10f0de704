// System
use std::collections::BTreeMap;

// Third Party
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Affinity, ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource,
            HostPathVolumeSource, KeyToPath, NodeAffinity, NodeSelector, NodeSelectorRequirement,
            NodeSelectorTerm, PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext,
            Toleration, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{api::ObjectMeta, Resource};

// Local
use crate::{
    config::TraceConfig,
    error::{TraceError, TraceResult},
    identity::TraceId,
    request::{Program, TraceRequest},
    target::ResolvedTarget,
    utils::{
        program_digest, CONTAINER_ANNOTATION_KEY, HOSTNAME_ANNOTATION_KEY, HOSTNAME_LABEL_KEY,
        INIT_CONTAINER_NAME, POD_UID_ANNOTATION_KEY, PROGRAM_DIGEST_ANNOTATION_KEY, PROGRAM_KEY,
        PROGRAM_MOUNT_PATH, PROGRAM_VOLUME_NAME, TRACER_CONTAINER_NAME, TRACE_ID_LABEL_KEY,
        TRACE_LABEL_KEY, TRACE_LABEL_VALUE,
    },
};

const MODULES_VOLUME_NAME: &str = "modules";
const SYS_VOLUME_NAME: &str = "sys";
const USR_SRC_VOLUME_NAME: &str = "usr-src";
const GENERATED_HEADERS_VOLUME_NAME: &str = "linux-headers-generated";
const USR_SRC_HOST_MOUNT_PATH: &str = "/usr/src-host";

/// Everything needed to run one trace. Built once by `JobSpecBuilder::trace_job` and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceJob {
    pub id: TraceId,
    /// `OBJECT_NAME_PREFIX` followed by the id.
    pub name: String,
    pub namespace: String,
    pub target: ResolvedTarget,
    pub program: Program,
    pub fetch_headers: bool,
    pub image: String,
    pub init_image: String,
    pub service_account: String,
    pub deadline: i64,
    pub deadline_grace_period: i64,
}

impl TraceJob {
    /// Total time budget of the workload: the program deadline plus the time reserved for the
    /// final output to flush.
    pub fn active_deadline_seconds(&self) -> i64 {
        self.deadline + self.deadline_grace_period
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        trace_labels(&self.id)
    }
}

/// Labels put on every object of a trace, pods included.
pub fn trace_labels(id: &TraceId) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(TRACE_LABEL_KEY.to_string(), TRACE_LABEL_VALUE.to_string());
    labels.insert(TRACE_ID_LABEL_KEY.to_string(), id.to_string());
    labels
}

/// The object graph of a trace, not yet submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceJobSpec {
    /// Holds the program text. Carries no owner until `owned_config_map` is given the created job.
    pub config_map: ConfigMap,
    /// Created suspended; resumed once the config map exists.
    pub job: Job,
}

impl TraceJobSpec {
    /// The config map with the created job set as its controlling owner, so deleting the job
    /// garbage collects the program.
    pub fn owned_config_map(&self, owner: &Job) -> TraceResult<ConfigMap> {
        let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
            TraceError::InvalidSpec(format!(
                "job {} has no name or uid to own its config map",
                owner.metadata.name.clone().unwrap_or_default()
            ))
        })?;
        let mut config_map = self.config_map.clone();
        config_map.metadata.owner_references = Some(vec![owner_ref]);
        Ok(config_map)
    }
}

/// Turns trace requests into trace jobs and trace jobs into cluster objects. Performs no I/O.
#[derive(Debug, Clone, Default)]
pub struct JobSpecBuilder {
    config: TraceConfig,
}

impl JobSpecBuilder {
    pub fn new(config: TraceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Validate a request against a resolved target and fill in the configured defaults.
    pub fn trace_job(
        &self,
        id: TraceId,
        namespace: &str,
        request: &TraceRequest,
        target: ResolvedTarget,
    ) -> TraceResult<TraceJob> {
        if namespace.is_empty() {
            return Err(TraceError::InvalidSpec("namespace cannot be empty".to_string()));
        }
        if target.hostname.is_empty() {
            return Err(TraceError::InvalidSpec(
                "could not determine on which node to run the trace program".to_string(),
            ));
        }
        if request.program.payload().is_empty() {
            return Err(TraceError::InvalidSpec(
                "the trace program cannot be empty".to_string(),
            ));
        }

        let deadline = request.deadline.unwrap_or(self.config.deadline);
        let deadline_grace_period = request
            .deadline_grace_period
            .unwrap_or(self.config.deadline_grace_period);
        if deadline <= 0 {
            return Err(TraceError::InvalidSpec(format!(
                "deadline must be positive, got {}",
                deadline
            )));
        }
        if deadline_grace_period < 0 {
            return Err(TraceError::InvalidSpec(format!(
                "deadline grace period cannot be negative, got {}",
                deadline_grace_period
            )));
        }
        if deadline.checked_add(deadline_grace_period).is_none() {
            return Err(TraceError::InvalidSpec(
                "deadline plus grace period is out of range".to_string(),
            ));
        }

        let image = non_empty(request.image.as_ref(), &self.config.image, "image")?;
        let init_image = non_empty(
            request.init_image.as_ref(),
            &self.config.init_image,
            "init image",
        )?;
        let service_account = non_empty(
            request.service_account.as_ref(),
            &self.config.service_account,
            "service account",
        )?;

        Ok(TraceJob {
            id,
            name: id.object_name(),
            namespace: namespace.to_string(),
            target,
            program: request.program.clone(),
            fetch_headers: request.fetch_headers,
            image,
            init_image,
            service_account,
            deadline,
            deadline_grace_period,
        })
    }

    /// Build the config map and the workload for a trace job.
    pub fn build(job: &TraceJob) -> TraceJobSpec {
        TraceJobSpec {
            config_map: config_map(job),
            job: workload(job),
        }
    }
}

fn non_empty(value: Option<&String>, default: &str, what: &str) -> TraceResult<String> {
    let value = value.map(String::as_str).unwrap_or(default);
    if value.is_empty() {
        return Err(TraceError::InvalidSpec(format!("{} cannot be empty", what)));
    }
    Ok(value.to_string())
}

fn config_map(job: &TraceJob) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(PROGRAM_KEY.to_string(), job.program.payload().to_string());
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(job.name.clone()),
            namespace: Some(job.namespace.clone()),
            labels: Some(job.labels()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

fn annotations(job: &TraceJob) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        HOSTNAME_ANNOTATION_KEY.to_string(),
        job.target.hostname.clone(),
    );
    if let Some(pod) = &job.target.pod {
        annotations.insert(POD_UID_ANNOTATION_KEY.to_string(), pod.uid.clone());
        annotations.insert(CONTAINER_ANNOTATION_KEY.to_string(), pod.container.clone());
    }
    annotations.insert(
        PROGRAM_DIGEST_ANNOTATION_KEY.to_string(),
        program_digest(job.program.payload()),
    );
    annotations
}

/// Command line of the tracer container. The program itself is only referenced by path.
pub fn tracer_command(job: &TraceJob) -> Vec<String> {
    let mut command = vec![
        "/bin/timeout".to_string(),
        "--preserve-status".to_string(),
        "--signal".to_string(),
        "INT".to_string(),
        job.deadline.to_string(),
        "/bin/trace-runner".to_string(),
        format!("--program-kind={}", job.program.kind()),
        format!("--program={}/{}", PROGRAM_MOUNT_PATH, PROGRAM_KEY),
    ];
    if let Some(pod) = &job.target.pod {
        command.push("--inpod".to_string());
        command.push(format!("--container={}", pod.container));
        command.push(format!("--poduid={}", pod.uid));
    }
    if let Program::Toolkit { args, .. } = &job.program {
        if !args.is_empty() {
            command.push("--".to_string());
            command.extend(args.iter().cloned());
        }
    }
    command
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut quantities = BTreeMap::new();
    quantities.insert("cpu".to_string(), Quantity(cpu.to_string()));
    quantities.insert("memory".to_string(), Quantity(memory.to_string()));
    quantities
}

fn volumes(job: &TraceJob) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: PROGRAM_VOLUME_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: job.name.clone(),
                items: Some(vec![KeyToPath {
                    key: PROGRAM_KEY.to_string(),
                    path: PROGRAM_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        host_path_volume(MODULES_VOLUME_NAME, "/lib/modules"),
        host_path_volume(SYS_VOLUME_NAME, "/sys"),
        host_path_volume(USR_SRC_VOLUME_NAME, "/usr/src"),
    ];
    if job.fetch_headers {
        volumes.push(Volume {
            name: GENERATED_HEADERS_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }
    volumes
}

fn tracer_container(job: &TraceJob) -> Container {
    let mut volume_mounts = vec![
        mount(PROGRAM_VOLUME_NAME, PROGRAM_MOUNT_PATH, true),
        mount(MODULES_VOLUME_NAME, "/lib/modules", true),
        mount(SYS_VOLUME_NAME, "/sys", false),
    ];
    if job.fetch_headers {
        volume_mounts.push(mount(GENERATED_HEADERS_VOLUME_NAME, "/usr/src", true));
        volume_mounts.push(mount(USR_SRC_VOLUME_NAME, USR_SRC_HOST_MOUNT_PATH, true));
    } else {
        volume_mounts.push(mount(USR_SRC_VOLUME_NAME, "/usr/src", true));
    }

    Container {
        name: TRACER_CONTAINER_NAME.to_string(),
        image: Some(job.image.clone()),
        command: Some(tracer_command(job)),
        volume_mounts: Some(volume_mounts),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            requests: Some(quantities("100m", "100Mi")),
            limits: Some(quantities("1", "1Gi")),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Fills the generated headers volume before the tracer starts.
fn init_container(job: &TraceJob) -> Container {
    Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(job.init_image.clone()),
        volume_mounts: Some(vec![
            mount(MODULES_VOLUME_NAME, "/lib/modules", true),
            mount(USR_SRC_VOLUME_NAME, USR_SRC_HOST_MOUNT_PATH, true),
            mount(GENERATED_HEADERS_VOLUME_NAME, "/usr/src", false),
        ]),
        ..Default::default()
    }
}

fn node_affinity(hostname: &str) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: HOSTNAME_LABEL_KEY.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![hostname.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn workload(job: &TraceJob) -> Job {
    let init_containers = if job.fetch_headers {
        Some(vec![init_container(job)])
    } else {
        None
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job.name.clone()),
            namespace: Some(job.namespace.clone()),
            labels: Some(job.labels()),
            annotations: Some(annotations(job)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            parallelism: Some(1),
            completions: Some(1),
            // Failed trace programs are not retried.
            backoff_limit: Some(0),
            active_deadline_seconds: Some(job.active_deadline_seconds()),
            suspend: Some(true),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(job.name.clone()),
                    labels: Some(job.labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    host_pid: Some(true),
                    service_account_name: Some(job.service_account.clone()),
                    affinity: Some(node_affinity(&job.target.hostname)),
                    // Tainted nodes can be traced too.
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    termination_grace_period_seconds: Some(job.deadline_grace_period),
                    volumes: Some(volumes(job)),
                    init_containers,
                    containers: vec![tracer_container(job)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
