use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::ResourceExt;
use porch_api::{InProcApi, Porch, PorchApi};
use porch_controller::ControllerConfig;
use porch_core::condition::{find_condition, READY};
use porch_core::{Condition, RevisionFilter};
use porch_kubehub::{ClusterSource, KubeClusterSource, MemoryClusterSource};
use porch_persist::{SqliteOpener, SqliteTable};
use porch_render::NoopRenderer;
use porch_repository::{MemoryOpener, RepositoryOpener};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod manifests;

use manifests::Manifest;

#[derive(Parser, Debug)]
#[command(name = "porchctl", version, about = "Porch package variant controllers")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load manifests and run the PackageVariant and PackageVariantSet controllers
    Run {
        /// Manifest files or directories (multi-document YAML)
        #[arg(short = 'f', long = "manifests", env = "PORCH_MANIFESTS", value_delimiter = ',')]
        manifests: Vec<PathBuf>,
        /// SQLite revision database; in-memory repositories when unset
        #[arg(long = "db", env = "PORCH_DB_PATH")]
        db: Option<String>,
        /// Read injection and object-selector sources from the live cluster
        #[arg(long = "kube", action = ArgAction::SetTrue)]
        kube: bool,
        /// Reconcile until nothing changes, print the result and exit
        #[arg(long = "once", action = ArgAction::SetTrue)]
        once: bool,
    },
    /// Check PackageVariant and PackageVariantSet manifests without running anything
    Validate {
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("PORCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PORCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PORCH_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { manifests, db, kube, once } => run(cli.output, &manifests, db.as_deref(), kube, once).await,
        Commands::Validate { manifests } => validate(cli.output, &manifests),
    }
}

async fn run(output: Output, paths: &[PathBuf], db: Option<&str>, kube: bool, once: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let opener: Arc<dyn RepositoryOpener> = match db {
        Some(path) => {
            info!(db = %path, "using sqlite revision table");
            Arc::new(SqliteOpener::new(SqliteTable::open(path)?))
        }
        None => Arc::new(MemoryOpener::new()),
    };
    let memory = Arc::new(MemoryClusterSource::new());
    let cluster: Arc<dyn ClusterSource> = if kube {
        Arc::new(KubeClusterSource::try_default(cancel.clone()).await.context("connecting to the cluster")?)
    } else {
        memory.clone()
    };
    let porch = Arc::new(Porch::new(opener, Arc::new(NoopRenderer), cluster, ControllerConfig::from_env()));
    let api = InProcApi::new(Arc::clone(&porch));

    let docs = manifests::load(paths)?;
    let applied = manifests::apply(&api, (!kube).then_some(&*memory), docs).await?;
    info!(
        repositories = applied.repositories,
        revisions = applied.revisions,
        variants = applied.variants,
        sets = applied.sets,
        cluster_objects = applied.cluster_objects,
        "manifests applied"
    );

    if once {
        let rounds = porch.settle().await;
        info!(rounds, "reconciled");
        return print_state(&api, output).await;
    }

    let handles = porch.run(cancel.clone())?;
    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();
    for h in handles {
        let _ = h.await;
    }
    Ok(())
}

fn validate(output: Output, paths: &[PathBuf]) -> Result<()> {
    let docs = manifests::load(paths)?;
    let mut report = Vec::new();
    for doc in &docs {
        let (kind, name, problems) = match doc {
            Manifest::Variant(pv) => ("PackageVariant", pv.name_any(), porch_variant::validate_spec(&pv.spec)),
            Manifest::VariantSet(pvs) => {
                let problems = match porch_variantset::validate(pvs) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![e.to_string()],
                };
                ("PackageVariantSet", pvs.name_any(), problems)
            }
            _ => continue,
        };
        report.push(serde_json::json!({"kind": kind, "name": name, "problems": problems}));
    }
    let invalid = report.iter().filter(|r| r["problems"].as_array().map(|p| !p.is_empty()).unwrap_or(false)).count();
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Output::Human => {
            for r in &report {
                let problems: Vec<&str> = r["problems"].as_array().map(|p| p.iter().filter_map(|v| v.as_str()).collect()).unwrap_or_default();
                if problems.is_empty() {
                    println!("{} {}: ok", r["kind"].as_str().unwrap_or(""), r["name"].as_str().unwrap_or(""));
                } else {
                    println!("{} {}:", r["kind"].as_str().unwrap_or(""), r["name"].as_str().unwrap_or(""));
                    for p in problems {
                        println!("  - {p}");
                    }
                }
            }
        }
    }
    if invalid > 0 {
        anyhow::bail!("{invalid} of {} manifests are invalid", report.len());
    }
    Ok(())
}

fn ready_column(conds: &[Condition]) -> (String, String) {
    match find_condition(conds, READY) {
        Some(c) => (c.status.as_str().to_string(), c.reason.clone()),
        None => ("-".to_string(), String::new()),
    }
}

async fn print_state(api: &dyn PorchApi, output: Output) -> Result<()> {
    let revisions = api.list_revisions(RevisionFilter::default()).await?;
    let variants = api.list_variants(None).await?;
    let sets = api.list_variant_sets(None).await?;
    match output {
        Output::Json => {
            let state = serde_json::json!({"revisions": revisions, "packageVariants": variants, "packageVariantSets": sets});
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Output::Human => {
            println!("{:<11} {:<44} {:<17} {:<9}", "NAMESPACE", "PACKAGEREVISION", "LIFECYCLE", "REVISION");
            for pr in &revisions {
                let rev = if pr.spec.revision.is_empty() { "-" } else { pr.spec.revision.as_str() };
                println!("{:<11} {:<44} {:<17} {:<9}", pr.namespace().unwrap_or_default(), pr.name_any(), pr.lifecycle().to_string(), rev);
            }
            println!();
            println!("{:<11} {:<32} {:<7} {:<22} {}", "NAMESPACE", "PACKAGEVARIANT", "READY", "REASON", "TARGETS");
            for pv in &variants {
                let (ready, reason) = ready_column(&pv.status.conditions);
                let targets: Vec<&str> = pv.status.downstream_targets.iter().map(|t| t.name.as_str()).collect();
                println!("{:<11} {:<32} {:<7} {:<22} {}", pv.namespace().unwrap_or_default(), pv.name_any(), ready, reason, targets.join(","));
            }
            if !sets.is_empty() {
                println!();
                println!("{:<11} {:<32} {:<7} {}", "NAMESPACE", "PACKAGEVARIANTSET", "READY", "REASON");
                for pvs in &sets {
                    let (ready, reason) = ready_column(&pvs.status.conditions);
                    println!("{:<11} {:<32} {:<7} {}", pvs.namespace().unwrap_or_default(), pvs.name_any(), ready, reason);
                }
            }
        }
    }
    Ok(())
}
