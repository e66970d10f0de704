// System
use std::pin::Pin;

// Third Party
use async_trait::async_trait;
use futures::{io::AsyncBufRead, AsyncReadExt, TryStreamExt};
use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{ConfigMap, Pod},
};
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
    Client,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const LOG_CHANNEL_SIZE: usize = 16;
const LOG_CHUNK_SIZE: usize = 8 * 1024;

/// Live output of a container. Reads return 0 once the container has exited.
pub type LogReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// The slice of the cluster API the trace lifecycle needs. Every call is scoped to a namespace.
///
/// Errors are returned as the raw `kube::Error` so callers can tell conflicts and missing objects
/// apart before wrapping them.
#[async_trait]
pub trait TraceCluster: Send + Sync {
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, kube::Error>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, kube::Error>;

    async fn set_job_suspended(
        &self,
        namespace: &str,
        name: &str,
        suspend: bool,
    ) -> Result<Job, kube::Error>;

    async fn list_jobs(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<Job>, kube::Error>;

    /// Deletes with background propagation so owned objects are garbage collected.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn list_pods(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<Pod>, kube::Error>;

    /// Follow the output of one container of a pod.
    async fn log_stream(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogReader, kube::Error>;
}

/// `TraceCluster` backed by a real API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.clone(),
        }
    }
}

#[async_trait]
impl TraceCluster for KubeCluster {
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, kube::Error> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        config_maps.create(&PostParams::default(), config_map).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.create(&PostParams::default(), job).await
    }

    async fn set_job_suspended(
        &self,
        namespace: &str,
        name: &str,
        suspend: bool,
    ) -> Result<Job, kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "spec": { "suspend": suspend } })),
        )
        .await
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Job>, kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let list = jobs
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.delete(name, &DeleteParams::background()).await?;
        debug!("Requested deletion of job {}/{}", namespace, name);
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn log_stream(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogReader, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            follow: true,
            container: Some(container.to_string()),
            ..Default::default()
        };
        debug!("Following output of {}/{} container {}", namespace, pod, container);
        let pod = pod.to_string();
        let (opened_tx, opened_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(LOG_CHANNEL_SIZE);

        // The reader borrows `pods`, so both live in the relay task.
        tokio::spawn(async move {
            relay_output(pods.log_stream(&pod, &params).await, opened_tx, chunk_tx).await
        });
        output_reader(opened_rx, chunk_rx).await
    }
}

type Chunk = std::io::Result<Vec<u8>>;

/// Report how opening went on `opened`, then copy `opening`'s reader into `chunks` until the
/// reader ends, fails or the receiving side is dropped. A read error is forwarded as the last chunk.
async fn relay_output<R>(
    opening: Result<R, kube::Error>,
    opened: oneshot::Sender<Result<(), kube::Error>>,
    chunks: mpsc::Sender<Chunk>,
) where
    R: AsyncBufRead + Send,
{
    let reader = match opening {
        Ok(reader) => {
            let _ = opened.send(Ok(()));
            reader
        }
        Err(error) => {
            let _ = opened.send(Err(error));
            return;
        }
    };
    futures::pin_mut!(reader);
    let mut buffer = vec![0u8; LOG_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = chunks.closed() => {
                debug!("Output reader dropped, stopping relay");
                return;
            }
            read = reader.read(&mut buffer) => read,
        };
        let chunk = match read {
            Ok(0) => return,
            Ok(count) => Ok(buffer[..count].to_vec()),
            Err(error) => Err(error),
        };
        let failed = chunk.is_err();
        if chunks.send(chunk).await.is_err() || failed {
            return;
        }
    }
}

/// The reading side of `relay_output`. Fails with the open error, if any.
async fn output_reader(
    opened: oneshot::Receiver<Result<(), kube::Error>>,
    mut chunks: mpsc::Receiver<Chunk>,
) -> Result<LogReader, kube::Error> {
    match opened.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => return Err(error),
        Err(_) => {
            return Err(kube::Error::Service(
                "log stream task ended before opening the stream".into(),
            ))
        }
    }
    let chunks = futures::stream::poll_fn(move |cx| chunks.poll_recv(cx));
    Ok(Box::pin(chunks.into_async_read()))
}

/// In-memory cluster used by unit tests. Records every call in order.
#[cfg(test)]
pub(crate) mod fake {
    // System
    use std::{
        collections::{BTreeMap, VecDeque},
        sync::Mutex,
    };

    // Third Party
    use async_trait::async_trait;
    use futures::{stream, TryStreamExt};
    use k8s_openapi::api::{
        batch::v1::Job,
        core::v1::{ConfigMap, Pod, PodStatus},
    };
    use kube::api::ObjectMeta;

    // Local
    use super::{LogReader, TraceCluster};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        CreateConfigMap(String),
        CreateJob(String),
        SetJobSuspended(String, bool),
        ListJobs(String),
        DeleteJob(String),
        ListPods(String),
        LogStream(String),
    }

    /// What `log_stream` hands back.
    pub enum FakeLogs {
        /// Deliver the chunks, then end the stream.
        Chunks(Vec<&'static str>),
        /// Never produce anything.
        Pending,
        /// Deliver the chunks, then fail mid-stream.
        FailAfter(Vec<&'static str>),
    }

    struct FakeState {
        config_maps: BTreeMap<String, ConfigMap>,
        jobs: BTreeMap<String, Job>,
        pod_lists: VecDeque<Vec<Pod>>,
        logs: FakeLogs,
        fail_config_map_create: Option<u16>,
        calls: Vec<Call>,
        next_uid: u64,
    }

    pub struct FakeCluster {
        state: Mutex<FakeState>,
    }

    impl Default for FakeCluster {
        fn default() -> Self {
            Self {
                state: Mutex::new(FakeState {
                    config_maps: BTreeMap::new(),
                    jobs: BTreeMap::new(),
                    pod_lists: VecDeque::new(),
                    logs: FakeLogs::Chunks(vec![]),
                    fail_config_map_create: None,
                    calls: Vec::new(),
                    next_uid: 1,
                }),
            }
        }
    }

    pub fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("fake {}", reason),
            reason: reason.to_string(),
            code,
        })
    }

    pub fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("{}-uid", name)),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
        let labels = meta.labels.clone().unwrap_or_default();
        selector
            .split(',')
            .filter(|term| !term.is_empty())
            .all(|term| match term.split_once('=') {
                Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
                None => labels.contains_key(term),
            })
    }

    impl FakeCluster {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the result of the next `list_pods` call. The last queued list keeps being
        /// returned once the queue drains to it.
        pub fn push_pods(&self, pods: Vec<Pod>) {
            self.state.lock().unwrap().pod_lists.push_back(pods);
        }

        pub fn set_logs(&self, logs: FakeLogs) {
            self.state.lock().unwrap().logs = logs;
        }

        pub fn fail_config_map_create(&self, code: u16) {
            self.state.lock().unwrap().fail_config_map_create = Some(code);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn config_maps(&self) -> Vec<ConfigMap> {
            self.state
                .lock()
                .unwrap()
                .config_maps
                .values()
                .cloned()
                .collect()
        }

        pub fn jobs(&self) -> Vec<Job> {
            self.state.lock().unwrap().jobs.values().cloned().collect()
        }
    }

    #[async_trait]
    impl TraceCluster for FakeCluster {
        async fn create_config_map(
            &self,
            _namespace: &str,
            config_map: &ConfigMap,
        ) -> Result<ConfigMap, kube::Error> {
            let mut state = self.state.lock().unwrap();
            let name = config_map.metadata.name.clone().unwrap_or_default();
            state.calls.push(Call::CreateConfigMap(name.clone()));
            if let Some(code) = state.fail_config_map_create.take() {
                return Err(api_error(code, "Injected"));
            }
            if state.config_maps.contains_key(&name) {
                return Err(api_error(409, "AlreadyExists"));
            }
            state.config_maps.insert(name, config_map.clone());
            Ok(config_map.clone())
        }

        async fn create_job(&self, _namespace: &str, job: &Job) -> Result<Job, kube::Error> {
            let mut state = self.state.lock().unwrap();
            let name = job.metadata.name.clone().unwrap_or_default();
            state.calls.push(Call::CreateJob(name.clone()));
            if state.jobs.contains_key(&name) {
                return Err(api_error(409, "AlreadyExists"));
            }
            let mut created = job.clone();
            created.metadata.uid = Some(format!("job-uid-{}", state.next_uid));
            state.next_uid += 1;
            state.jobs.insert(name, created.clone());
            Ok(created)
        }

        async fn set_job_suspended(
            &self,
            _namespace: &str,
            name: &str,
            suspend: bool,
        ) -> Result<Job, kube::Error> {
            let mut state = self.state.lock().unwrap();
            state
                .calls
                .push(Call::SetJobSuspended(name.to_string(), suspend));
            let job = state
                .jobs
                .get_mut(name)
                .ok_or_else(|| api_error(404, "NotFound"))?;
            if let Some(spec) = job.spec.as_mut() {
                spec.suspend = Some(suspend);
            }
            Ok(job.clone())
        }

        async fn list_jobs(
            &self,
            _namespace: &str,
            label_selector: &str,
        ) -> Result<Vec<Job>, kube::Error> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::ListJobs(label_selector.to_string()));
            Ok(state
                .jobs
                .values()
                .filter(|job| matches_selector(&job.metadata, label_selector))
                .cloned()
                .collect())
        }

        async fn delete_job(&self, _namespace: &str, name: &str) -> Result<(), kube::Error> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::DeleteJob(name.to_string()));
            let job = state
                .jobs
                .remove(name)
                .ok_or_else(|| api_error(404, "NotFound"))?;
            // Stand-in for the garbage collector.
            let uid = job.metadata.uid.unwrap_or_default();
            state.config_maps.retain(|_, cm| {
                !cm.metadata
                    .owner_references
                    .iter()
                    .flatten()
                    .any(|owner| owner.uid == uid)
            });
            Ok(())
        }

        async fn list_pods(
            &self,
            _namespace: &str,
            label_selector: &str,
        ) -> Result<Vec<Pod>, kube::Error> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::ListPods(label_selector.to_string()));
            let pods = if state.pod_lists.len() > 1 {
                state.pod_lists.pop_front().unwrap_or_default()
            } else {
                state.pod_lists.front().cloned().unwrap_or_default()
            };
            Ok(pods)
        }

        async fn log_stream(
            &self,
            _namespace: &str,
            pod: &str,
            _container: &str,
        ) -> Result<LogReader, kube::Error> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::LogStream(pod.to_string()));
            let reader: LogReader = match &state.logs {
                FakeLogs::Chunks(chunks) => {
                    let items: Vec<std::io::Result<Vec<u8>>> =
                        chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
                    Box::pin(stream::iter(items).into_async_read())
                }
                FakeLogs::Pending => {
                    Box::pin(stream::pending::<std::io::Result<Vec<u8>>>().into_async_read())
                }
                FakeLogs::FailAfter(chunks) => {
                    let mut items: Vec<std::io::Result<Vec<u8>>> =
                        chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
                    items.push(Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    )));
                    Box::pin(stream::iter(items).into_async_read())
                }
            };
            Ok(reader)
        }
    }
}
