// System
use std::time::Duration;

/// Default tracerunner image.
pub const DEFAULT_IMAGE: &str = "quay.io/iovisor/kubectl-trace-bpftrace:latest";
/// Default image of the init container that fetches and prepares linux headers.
pub const DEFAULT_INIT_IMAGE: &str = "quay.io/iovisor/kubectl-trace-init:latest";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";
/// Maximum time a trace program is allowed to run, in seconds.
pub const DEFAULT_DEADLINE: i64 = 3600;
/// Time left after the deadline for maps and histograms to be printed, in seconds. It also has to
/// cover pod startup since the job deadline counts from job start.
pub const DEFAULT_DEADLINE_GRACE_PERIOD: i64 = 30;

/// Defaults applied to every trace request that does not override them.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceConfig {
    pub image: String,
    pub init_image: String,
    pub service_account: String,
    pub deadline: i64,
    pub deadline_grace_period: i64,
    pub locator: LocatorConfig,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            init_image: DEFAULT_INIT_IMAGE.to_string(),
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
            deadline: DEFAULT_DEADLINE,
            deadline_grace_period: DEFAULT_DEADLINE_GRACE_PERIOD,
            locator: LocatorConfig::default(),
        }
    }
}

/// Polling policy for the pod locator. `wait_budget` is a local bound and deliberately unrelated
/// to the trace deadline, which only starts once the pod is scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatorConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub wait_budget: Duration,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            wait_budget: Duration::from_secs(120),
        }
    }
}
