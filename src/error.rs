// System
use std::time::Duration;

// Third Party
use thiserror::Error;

pub type TraceResult<T> = Result<T, TraceError>;

/// Errors that can occur while submitting, locating, attaching to or removing a trace.
#[derive(Error, Debug)]
pub enum TraceError {
    /// The request was rejected before any remote call was made.
    #[error("invalid trace specification: {0}")]
    InvalidSpec(String),

    #[error("trace object {name} already exists")]
    AlreadyExists { name: String },

    #[error("trace {id} not found")]
    JobNotFound { id: String },

    /// The pod reached a terminal phase before it was ever observed running.
    #[error("pod {pod} reached phase {phase} before it started running")]
    PodNeverRan { pod: String, phase: String },

    #[error("timed out after {waited:?} waiting for the trace pod to start running")]
    Timeout { waited: Duration },

    #[error("found {count} pods for trace {id}, expected exactly one")]
    MultiplePods { id: String, count: usize },

    #[error("trace output stream interrupted: {0}")]
    StreamInterrupted(#[source] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Target(String),

    #[error("error opening program file {path}: {source}")]
    Program {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: kube::Error,
    },
}

impl TraceError {
    /// Wrap a cluster API error with a description of what was being attempted.
    pub fn api(context: impl Into<String>, source: kube::Error) -> Self {
        TraceError::Api {
            context: context.into(),
            source,
        }
    }

    /// Cancellation is caller-initiated and is not a failure for exit-status purposes.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TraceError::Cancelled)
    }
}

/// Returns the HTTP status code carried by a cluster API error response, if any.
pub fn api_error_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(kube::error::ErrorResponse { code, .. }) => Some(*code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    #[test]
    fn api_error_code_reads_status() {
        assert_eq!(api_error_code(&api_error(409)), Some(409));
        assert_eq!(api_error_code(&api_error(404)), Some(404));
    }

    #[test]
    fn only_cancelled_is_a_cancellation() {
        assert!(TraceError::Cancelled.is_cancellation());
        assert!(!TraceError::Timeout {
            waited: Duration::from_secs(1)
        }
        .is_cancellation());
        assert!(!TraceError::api("creating job", api_error(500)).is_cancellation());
    }

    #[test]
    fn api_errors_keep_context() {
        let error = TraceError::api("failed to create job kubectl-trace-x", api_error(403));
        assert!(error
            .to_string()
            .starts_with("failed to create job kubectl-trace-x: "));
    }
}
