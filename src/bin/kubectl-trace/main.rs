// System
use std::path::PathBuf;

// Third Party
use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// Local
use kube_trace_rs::{
    config::{
        DEFAULT_DEADLINE, DEFAULT_DEADLINE_GRACE_PERIOD, DEFAULT_IMAGE, DEFAULT_INIT_IMAGE,
        DEFAULT_SERVICE_ACCOUNT,
    },
    signals::with_standard_signals,
    utils::{init_tracing, setup_exit_hooks},
    LocatorConfig, Program, TargetSpec, TraceConfig, TraceId, TraceJobFilter, TraceJobSummary,
    TraceRequest, TraceResult, TraceService,
};

#[derive(Debug, Parser)]
#[command(name = "kubectl-trace", about = "Schedule bpftrace programs on Kubernetes nodes")]
struct Cli {
    /// Namespace of the trace objects, defaults to the kubeconfig namespace
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a bpftrace program on resources
    Run(RunArgs),
    /// Attach to the output of a running trace
    Attach {
        /// Trace id or object name
        id: String,
    },
    /// Delete a trace and its program
    Delete {
        /// Trace id or object name
        id: String,
    },
    /// List traces
    Get {
        /// Only show this trace
        id: Option<String>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// node/NAME, pod/NAME or a node NAME
    resource: String,

    /// Container of a pod target, or the arguments of a bcc tool
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Specify the container
    #[arg(short, long)]
    container: Option<String>,

    /// Whether or not to attach to the trace program once it is created
    #[arg(short, long)]
    attach: bool,

    /// Literal string to be evaluated as a bpftrace program
    #[arg(short, long)]
    eval: Option<String>,

    /// File containing a bpftrace program
    #[arg(short, long)]
    filename: Option<PathBuf>,

    /// Name of tool that ships with BCC toolkit - e.g. 'memleak'
    #[arg(short, long)]
    bcc: Option<String>,

    /// Service account to use to set in the pod spec of the trace job
    #[arg(long, env = "KUBECTL_TRACE_SERVICE_ACCOUNT", default_value = DEFAULT_SERVICE_ACCOUNT)]
    serviceaccount: String,

    /// Custom image for the tracerunner
    #[arg(long, env = "KUBECTL_TRACE_IMAGE", default_value = DEFAULT_IMAGE)]
    imagename: String,

    /// Custom image for the init container responsible to fetch and prepare linux headers
    #[arg(long = "init-imagename", env = "KUBECTL_TRACE_INIT_IMAGE", default_value = DEFAULT_INIT_IMAGE)]
    init_imagename: String,

    /// Whether to fetch linux headers or not
    #[arg(long)]
    fetch_headers: bool,

    /// Maximum time to allow trace to run in seconds
    #[arg(long, env = "KUBECTL_TRACE_DEADLINE", default_value_t = DEFAULT_DEADLINE)]
    deadline: i64,

    /// Maximum wait time to print maps or histograms after deadline, in seconds
    #[arg(long, env = "KUBECTL_TRACE_DEADLINE_GRACE_PERIOD", default_value_t = DEFAULT_DEADLINE_GRACE_PERIOD)]
    deadline_grace_period: i64,
}

impl RunArgs {
    fn config(&self) -> TraceConfig {
        TraceConfig {
            image: self.imagename.clone(),
            init_image: self.init_imagename.clone(),
            service_account: self.serviceaccount.clone(),
            deadline: self.deadline,
            deadline_grace_period: self.deadline_grace_period,
            locator: LocatorConfig::default(),
        }
    }

    fn request(self) -> TraceResult<TraceRequest> {
        let (target, tool_args) = TargetSpec::parse(
            &self.resource,
            self.container,
            &self.args,
            self.bcc.is_some(),
        )?;
        let program = Program::from_sources(self.eval, self.filename, self.bcc, tool_args)?;
        let mut request = TraceRequest::new(target, program);
        request.fetch_headers = self.fetch_headers;
        Ok(request)
    }
}

/// Stream a trace to stdout until it ends or the first interrupt detaches.
async fn attach(
    service: &TraceService,
    id: &TraceId,
    namespace: &str,
) -> Result<(), anyhow::Error> {
    // First interrupt detaches, a second one exits.
    setup_exit_hooks()?;
    let (token, _listener) = with_standard_signals(&CancellationToken::new())?;
    let mut out = tokio::io::stdout();
    let result = service.attach(id, namespace, &token, &mut out).await;
    token.cancel();
    match result {
        Err(e) if e.is_cancellation() => {
            info!("Detached from trace {}", id);
            Ok(())
        }
        result => Ok(result?),
    }
}

fn print_traces(summaries: &[TraceJobSummary]) {
    println!("NAMESPACE\tNAME\tTARGET\tSTATUS\tSTARTED");
    for summary in summaries {
        let started = summary
            .start_time
            .map(|time| time.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}\t{}\t{}",
            summary.namespace, summary.name, summary.target, summary.phase, started
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing("kube_trace_rs", tracing::Level::INFO);
    let cli = Cli::parse();
    let client = Client::try_default().await?;
    let namespace = cli
        .namespace
        .unwrap_or_else(|| client.default_namespace().to_string());

    match cli.command {
        Command::Run(args) => {
            let service = TraceService::with_client(&client, args.config());
            let attach_after = args.attach;
            let request = args.request()?;
            let handle = service.submit(&request, &namespace).await?;
            println!("trace {} created", handle.id);

            if attach_after {
                // The trace keeps running whatever happens to the attachment.
                if let Err(e) = attach(&service, &handle.id, &namespace).await {
                    error!("Could not attach to trace {}: {}", handle.id, e);
                }
            }
        }
        Command::Attach { id } => {
            let service = TraceService::with_client(&client, TraceConfig::default());
            let id = TraceId::from_object_name(&id)?;
            attach(&service, &id, &namespace).await?;
        }
        Command::Delete { id } => {
            let service = TraceService::with_client(&client, TraceConfig::default());
            let id = TraceId::from_object_name(&id)?;
            service.delete(&id, &namespace).await?;
            println!("trace {} deleted", id);
        }
        Command::Get { id } => {
            let service = TraceService::with_client(&client, TraceConfig::default());
            let filter = match id {
                Some(id) => TraceJobFilter::id(TraceId::from_object_name(&id)?),
                None => TraceJobFilter::all(),
            };
            let summaries = service.list(&namespace, &filter).await?;
            print_traces(&summaries);
        }
    }

    Ok(())
}
