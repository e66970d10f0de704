//! Run bpftrace programs and bcc tools on Kubernetes nodes.
//!
//! A trace request is resolved to a node, turned into a suspended batch job plus a config map
//! holding the program, and released once the config map (owned by the job) exists. The output
//! of the trace pod can then be streamed until the program exits or the caller detaches.

pub mod attacher;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod identity;
pub mod locator;
pub mod request;
pub mod service;
pub mod signals;
pub mod target;
pub mod tracejob;
pub mod utils;

pub use attacher::Attacher;
pub use client::{JobHandle, JobPhase, TraceJobClient, TraceJobFilter, TraceJobSummary};
pub use cluster::{KubeCluster, TraceCluster};
pub use config::{LocatorConfig, TraceConfig};
pub use error::{TraceError, TraceResult};
pub use identity::TraceId;
pub use locator::{LocatedPod, PodLocator};
pub use request::{Program, ProgramSource, TargetSpec, TraceRequest};
pub use service::TraceService;
pub use target::{KubeTargetResolver, ResolvedTarget, TargetResolver};
pub use tracejob::{JobSpecBuilder, TraceJob, TraceJobSpec};
