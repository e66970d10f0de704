// System
use std::path::PathBuf;

// Local
use crate::error::{TraceError, TraceResult};

const USAGE: &str = "(POD | TYPE/NAME)";

/// What the user asked to trace, before it is resolved to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Node {
        name: String,
    },
    /// `container` defaults to the pod's first container when unset.
    PodContainer {
        pod: String,
        container: Option<String>,
    },
}

impl TargetSpec {
    /// Parse `node/NAME`, `pod/NAME` or a bare `NAME` (nodes are searched by default).
    ///
    /// In toolkit mode every extra positional argument is passed to the tool and returned. In
    /// script mode a single extra positional names the container of a pod target.
    pub fn parse(
        resource: &str,
        container: Option<String>,
        extra_args: &[String],
        toolkit: bool,
    ) -> TraceResult<(TargetSpec, Vec<String>)> {
        let (kind, name) = match resource.split_once('/') {
            Some((kind, name)) => (kind, name),
            None => ("node", resource),
        };
        if name.is_empty() {
            return Err(TraceError::InvalidSpec(format!(
                "{} is a required argument for the run command",
                USAGE
            )));
        }

        let mut container = container;
        let mut tool_args = Vec::new();
        if toolkit {
            tool_args = extra_args.to_vec();
        } else {
            match extra_args {
                [] => {}
                [positional] if container.is_none() => container = Some(positional.clone()),
                _ => {
                    return Err(TraceError::InvalidSpec(format!(
                        "unexpected arguments {:?}: only a bcc tool accepts extra arguments",
                        extra_args
                    )))
                }
            }
        }

        let target = match kind {
            "node" | "nodes" | "no" => {
                if let Some(container) = container {
                    return Err(TraceError::InvalidSpec(format!(
                        "container {} can only be selected for a pod target",
                        container
                    )));
                }
                TargetSpec::Node {
                    name: name.to_string(),
                }
            }
            "pod" | "pods" | "po" => TargetSpec::PodContainer {
                pod: name.to_string(),
                container,
            },
            _ => {
                return Err(TraceError::InvalidSpec(format!(
                    "first argument must be {}",
                    USAGE
                )))
            }
        };
        Ok((target, tool_args))
    }
}

/// Where the text of a script comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSource {
    Inline(String),
    File(PathBuf),
}

impl ProgramSource {
    pub fn load(&self) -> TraceResult<String> {
        match self {
            ProgramSource::Inline(text) => Ok(text.clone()),
            ProgramSource::File(path) => {
                std::fs::read_to_string(path).map_err(|source| TraceError::Program {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
    }
}

/// The program to run. Script and toolkit mode are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// A bpftrace script.
    Script(String),
    /// A tool shipped with the bcc toolkit, invoked with positional arguments.
    Toolkit { tool: String, args: Vec<String> },
}

impl Program {
    /// Build a program from the command line sources, enforcing that exactly one is given.
    pub fn from_sources(
        eval: Option<String>,
        filename: Option<PathBuf>,
        tool: Option<String>,
        tool_args: Vec<String>,
    ) -> TraceResult<Program> {
        let source = match (eval, filename) {
            (Some(_), Some(_)) => {
                return Err(TraceError::InvalidSpec(
                    "specify the bpftrace program either via an external file or via a literal string, not both".to_string(),
                ))
            }
            (Some(text), None) => Some(ProgramSource::Inline(text)),
            (None, Some(path)) => Some(ProgramSource::File(path)),
            (None, None) => None,
        };

        match (source, tool) {
            (None, None) => Err(TraceError::InvalidSpec(
                "you must specify either a bpftrace or a bcc program".to_string(),
            )),
            (Some(_), Some(_)) => Err(TraceError::InvalidSpec(
                "cannot specify both a bpftrace and bcc program".to_string(),
            )),
            (Some(source), None) => {
                if !tool_args.is_empty() {
                    return Err(TraceError::InvalidSpec(
                        "program arguments are only accepted by bcc tools".to_string(),
                    ));
                }
                let is_empty = match &source {
                    ProgramSource::Inline(text) => text.is_empty(),
                    ProgramSource::File(path) => path.as_os_str().is_empty(),
                };
                if is_empty {
                    return Err(TraceError::InvalidSpec(
                        "the bpftrace program cannot be empty".to_string(),
                    ));
                }
                Ok(Program::Script(source.load()?))
            }
            (None, Some(tool)) => {
                if tool.is_empty() {
                    return Err(TraceError::InvalidSpec(
                        "the bcc tool name cannot be empty".to_string(),
                    ));
                }
                Ok(Program::Toolkit {
                    tool,
                    args: tool_args,
                })
            }
        }
    }

    /// Value of the runner's `--program-kind` flag.
    pub fn kind(&self) -> &'static str {
        match self {
            Program::Script(_) => "bpftrace",
            Program::Toolkit { .. } => "bcc",
        }
    }

    /// Text stored in the config map: the script itself, or the tool name.
    pub fn payload(&self) -> &str {
        match self {
            Program::Script(text) => text,
            Program::Toolkit { tool, .. } => tool,
        }
    }

    pub fn args(&self) -> &[String] {
        match self {
            Program::Script(_) => &[],
            Program::Toolkit { args, .. } => args,
        }
    }
}

/// A request to run one program against one target. Unset optional fields fall back to the
/// `TraceConfig` of the builder that turns the request into a job.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRequest {
    pub target: TargetSpec,
    pub program: Program,
    pub fetch_headers: bool,
    pub image: Option<String>,
    pub init_image: Option<String>,
    pub service_account: Option<String>,
    pub deadline: Option<i64>,
    pub deadline_grace_period: Option<i64>,
}

impl TraceRequest {
    pub fn new(target: TargetSpec, program: Program) -> Self {
        Self {
            target,
            program,
            fetch_headers: false,
            image: None,
            init_image: None,
            service_account: None,
            deadline: None,
            deadline_grace_period: None,
        }
    }
}
