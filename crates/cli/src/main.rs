use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reka_api::{
    ClusterClient, KubeClusterClient, Plan, ProvisionReport, Provisioner, ResourceIntent,
    DEFAULT_WORKERS,
};
use reka_cluster::{ClusterEndpoint, StaticTokenProvider};

#[derive(Parser, Debug)]
#[command(name = "rekactl", version, about = "Reka CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Concurrent plan entries in flight
    #[arg(long = "workers", global = true, env = "REKA_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the actions a batch of intents would take, without executing
    Plan {
        /// Intent files (YAML, multi-document)
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,
    },
    /// Reconcile a batch of intents against the cluster and execute the plan
    Apply {
        /// Intent files (YAML, multi-document)
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,
    },
    /// Delete every resource the intent files describe
    Destroy {
        /// Intent files (YAML, multi-document)
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("REKA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REKA_METRICS_ADDR; expected host:port");
        }
    }
}

/// Load intents from YAML files; `---`-separated documents are one intent
/// each, empty documents are skipped.
fn load_intents(files: &[PathBuf]) -> Result<Vec<ResourceIntent>> {
    let mut intents = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_json::Value::deserialize(doc)
                .with_context(|| format!("parsing YAML in {}", path.display()))?;
            if value.is_null() {
                continue;
            }
            let intent: ResourceIntent = serde_json::from_value(value)
                .with_context(|| format!("decoding intent in {}", path.display()))?;
            intents.push(intent);
        }
    }
    if intents.is_empty() {
        anyhow::bail!("no intents found in the given files");
    }
    Ok(intents)
}

/// Ambient kubeconfig by default; `REKA_SERVER` + `REKA_TOKEN` select a
/// token-authenticated endpoint instead (`REKA_INSECURE=1` skips TLS
/// verification).
async fn provisioner(workers: usize) -> Result<Provisioner> {
    let server = std::env::var("REKA_SERVER");
    let token = std::env::var("REKA_TOKEN");
    let cluster: Arc<dyn ClusterClient> = match (server, token) {
        (Ok(server), Ok(token)) => {
            let mut endpoint = ClusterEndpoint::new(server);
            if std::env::var("REKA_INSECURE").ok().as_deref() == Some("1") {
                endpoint = endpoint.insecure();
            }
            Arc::new(KubeClusterClient::with_token_provider(
                endpoint,
                Arc::new(StaticTokenProvider::fixed(token)),
            ))
        }
        _ => Arc::new(
            KubeClusterClient::try_default().await.context("connecting to cluster")?,
        ),
    };
    Ok(Provisioner::new(cluster).with_workers(workers))
}

fn print_plan(plan: &Plan) {
    println!("{:<8} {}", "ACTION", "RESOURCE");
    for entry in &plan.entries {
        println!("{:<8} {}", entry.action.as_str(), entry.id);
    }
    println!();
    println!("{} entries, {} mutating", plan.len(), plan.mutating_len());
}

fn print_report(report: &ProvisionReport) {
    println!("{:<8} {:<40} {:<8} {}", "ACTION", "RESOURCE", "OUTCOME", "DETAIL");
    for (entry, result) in report.plan.entries.iter().zip(&report.results) {
        let detail = result.error.as_deref().unwrap_or("");
        println!(
            "{:<8} {:<40} {:<8} {}",
            entry.action.as_str(),
            result.id.to_string(),
            result.outcome.to_string(),
            detail
        );
    }
    println!();
    println!(
        "{}: {} applied, {} skipped, {} failed",
        report.status(),
        report.summary.applied,
        report.summary.skipped,
        report.summary.failed
    );
}

async fn run(intents: Vec<ResourceIntent>, workers: usize, output: Output, verb: &str) -> Result<()> {
    let provisioner = provisioner(workers).await?;

    // First Ctrl-C stops scheduling new entries; in-flight attempts finish.
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; skipping entries that have not started");
            trigger.cancel();
        }
    });

    match provisioner.submit_intents_with_cancel(intents, &cancel).await {
        Ok(report) => {
            match output {
                Output::Human => print_report(&report),
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if report.summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!(error = %e, "{verb} failed");
            eprintln!("{verb} error: {e}");
            std::process::exit(1);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { files } => {
            let intents = load_intents(&files)?;
            info!(intents = intents.len(), "plan invoked");
            let provisioner = provisioner(cli.workers).await?;
            match provisioner.plan(intents).await {
                Ok(plan) => match cli.output {
                    Output::Human => print_plan(&plan),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
                },
                Err(e) => {
                    error!(error = %e, "plan failed");
                    eprintln!("plan error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Apply { files } => {
            let intents = load_intents(&files)?;
            info!(intents = intents.len(), workers = cli.workers, "apply invoked");
            run(intents, cli.workers, cli.output, "apply").await?;
        }
        Commands::Destroy { files } => {
            let intents = load_intents(&files)?;
            info!(intents = intents.len(), workers = cli.workers, "destroy invoked");
            let absent: Vec<ResourceIntent> =
                intents.into_iter().map(|i| ResourceIntent::absent(i.id)).collect();
            run(absent, cli.workers, cli.output, "destroy").await?;
        }
    }

    Ok(())
}
