// System
use std::sync::{atomic::AtomicBool, Arc};

// Third Party
use sha2::{Digest, Sha256};
use signal_hook::{
    consts::signal::{SIGINT, SIGTERM},
    flag,
};
use tracing_subscriber::EnvFilter;

/// Every object created for a trace is named `<OBJECT_NAME_PREFIX><TRACE_ID>`.
pub const OBJECT_NAME_PREFIX: &str = "kubectl-trace-";

/// Present on every object (and pod) created for any trace.
pub const TRACE_LABEL_KEY: &str = "kube-trace.io/trace";
pub const TRACE_LABEL_VALUE: &str = "kubectl-trace";
/// Carries the trace identifier so pods and jobs can be found by label selector.
pub const TRACE_ID_LABEL_KEY: &str = "kube-trace.io/trace-id";

pub const HOSTNAME_ANNOTATION_KEY: &str = "kube-trace.io/hostname";
pub const POD_UID_ANNOTATION_KEY: &str = "kube-trace.io/pod-uid";
pub const CONTAINER_ANNOTATION_KEY: &str = "kube-trace.io/container";
pub const PROGRAM_DIGEST_ANNOTATION_KEY: &str = "kube-trace.io/program-sha256";

/// The node label the workload is pinned to.
pub const HOSTNAME_LABEL_KEY: &str = "kubernetes.io/hostname";

pub const TRACER_CONTAINER_NAME: &str = "kubectl-trace";
pub const INIT_CONTAINER_NAME: &str = "kubectl-trace-init";

pub const PROGRAM_VOLUME_NAME: &str = "program";
pub const PROGRAM_MOUNT_PATH: &str = "/programs";
pub const PROGRAM_KEY: &str = "program.bt";

/// Install a stderr tracing subscriber. `RUST_LOG` wins over the given crate level so stdout is
/// left to the trace output.
pub fn init_tracing(crate_name: &str, level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={}",
            crate_name,
            level.to_string().to_lowercase()
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The first SIGINT/SIGTERM is left to the async listeners. A second one exits the process
/// immediately.
pub fn setup_exit_hooks() -> Result<(), std::io::Error> {
    let term_now = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        // Order matters: the conditional shutdown only fires once the flag below was set by an
        // earlier delivery.
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&term_now))?;
        flag::register(signal, Arc::clone(&term_now))?;
    }
    Ok(())
}

/// Hex encoded SHA-256 of a trace program, recorded on the job for display.
pub fn program_digest(program: &str) -> String {
    hex::encode(Sha256::digest(program.as_bytes()))
}
