use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bootwait_status::{wait_until_pods_running, PhaseSnapshot, PostConverge, WaitConfig, WaitError};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bootwait", version, about = "Wait for bootstrap pods to reach Running")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,

    /// Namespace the pods run in
    #[arg(long = "ns", env = "BOOTWAIT_NAMESPACE", default_value = "kube-system")]
    namespace: String,

    /// Label selector for the pod watch
    #[arg(long = "selector", env = "BOOTWAIT_SELECTOR", default_value = "k8s-app")]
    selector: String,

    /// API server URL (default: kubeconfig / in-cluster)
    #[arg(long = "api-server", env = "BOOTWAIT_API_SERVER")]
    api_server: Option<String>,

    /// Give up after this many seconds
    #[arg(long = "timeout-secs", env = "BOOTWAIT_TIMEOUT_SECS", default_value_t = 1200)]
    timeout_secs: u64,

    /// Seconds between status checks
    #[arg(long = "interval-secs", env = "BOOTWAIT_INTERVAL_SECS", default_value_t = 5)]
    interval_secs: u64,

    /// Full relist period for the pod watch (0 disables)
    #[arg(long = "relist-secs", env = "BOOTWAIT_RELIST_SECS", default_value_t = 1800)]
    relist_secs: u64,

    /// Upper bound for watch reconnect backoff
    #[arg(long = "watch-backoff-max-secs", env = "BOOTWAIT_WATCH_BACKOFF_MAX_SECS", default_value_t = 30)]
    watch_backoff_max_secs: u64,

    /// Logical pod names, e.g. kube-apiserver kube-scheduler
    #[arg(required = true)]
    pods: Vec<String>,

    /// Command to run once all pods are running (after `--`)
    #[arg(last = true)]
    then: Vec<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

/// Status lines share stdout with humans; JSON keeps stdout for the document.
fn status_sink(output: Output, stdout: Box<dyn Write>, stderr: Box<dyn Write>) -> Box<dyn Write> {
    match output {
        Output::Human => stdout,
        Output::Json => stderr,
    }
}

/// Final result document for `-o json`.
fn json_report(outcome: &Result<PhaseSnapshot, WaitError>) -> Result<serde_json::Value> {
    Ok(match outcome {
        Ok(snapshot) => serde_json::json!({ "ready": true, "pods": snapshot }),
        Err(e) => {
            let last = match e {
                WaitError::Timeout { last, .. } => serde_json::to_value(last)?,
                _ => serde_json::Value::Null,
            };
            serde_json::json!({ "ready": false, "error": e.to_string(), "pods": last })
        }
    })
}

fn finish(outcome: Result<PhaseSnapshot, WaitError>, output: Output, stdout: &mut dyn Write) -> Result<()> {
    if output == Output::Json {
        writeln!(stdout, "{}", serde_json::to_string_pretty(&json_report(&outcome)?)?)?;
    }
    match outcome {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(error = %e, "wait failed");
            Err(anyhow!("error while checking pod status: {e}"))
        }
    }
}

impl Cli {
    fn wait_config(&self) -> WaitConfig {
        WaitConfig {
            targets: self.pods.clone(),
            namespace: self.namespace.clone(),
            label_selector: self.selector.clone(),
            api_server: self.api_server.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_secs(self.interval_secs.max(1)),
            relist_interval: (self.relist_secs > 0).then(|| Duration::from_secs(self.relist_secs)),
            watch_backoff_max: Duration::from_secs(self.watch_backoff_max_secs.max(1)),
        }
    }

    fn follow_up(&self) -> Option<ExecStep> {
        let (program, args) = self.then.split_first()?;
        Some(ExecStep { program: program.clone(), args: args.to_vec() })
    }
}

/// Runs an external command as the post-convergence step.
struct ExecStep {
    program: String,
    args: Vec<String>,
}

#[async_trait::async_trait]
impl PostConverge for ExecStep {
    fn name(&self) -> &str { &self.program }

    async fn run(&self) -> Result<()> {
        let status = tokio::process::Command::new(&self.program).args(&self.args).status().await?;
        if !status.success() {
            return Err(anyhow!("{} exited with {}", self.program, status));
        }
        Ok(())
    }
}

fn init_tracing() {
    let env = std::env::var("BOOTWAIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BOOTWAIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid BOOTWAIT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.wait_config();
    let step = cli.follow_up();
    info!(pods = ?cfg.targets, ns = %cfg.namespace, follow_up = ?step.as_ref().map(|s| s.program.as_str()), "bootwait invoked");

    let sink = status_sink(cli.output, Box::new(std::io::stdout()), Box::new(std::io::stderr()));
    let outcome = tokio::select! {
        r = wait_until_pods_running(&cfg, step.as_ref().map(|s| s as &dyn PostConverge), sink) => r,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C received; giving up");
            return Err(anyhow!("interrupted"));
        }
    };
    finish(outcome, cli.output, &mut std::io::stdout())
}
