use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use tokio::signal;
use tracing::{error, info, warn};

use kubetemplater_apply::KubeObjectStore;
use kubetemplater_core::{KubeTemplate, KubeTemplatePolicy, DEFAULT_POLICY_NAMESPACE};
use kubetemplater_kubehub::{
    resync_loop, resync_period_from_env, watch_policies, watch_templates, GenerationTracker, KubeStatusSink, KubeTemplateSource, WatchContext,
};
use kubetemplater_policy::{default_engine, PolicyResolver, PolicyStats};
use kubetemplater_queue::{QueueConfig, QueueMetrics, WorkQueue};
use kubetemplater_reconcile::{run_worker, Reconciler, StatusSink, WorkerContext};

mod check;

#[derive(Parser, Debug)]
#[command(name = "kubetemplaterctl", version, about = "Policy-gated Kubernetes object templating")]
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
    /// Run the controller: watchers, resync and reconcile workers
    Run {
        #[arg(long, env = "KT_WORKERS", default_value_t = 4)]
        workers: usize,
        /// Namespace policies are read from
        #[arg(long = "policy-namespace", env = "KT_POLICY_NAMESPACE", default_value = DEFAULT_POLICY_NAMESPACE)]
        policy_namespace: String,
        #[arg(long = "max-retries", env = "KT_QUEUE_MAX_RETRIES")]
        max_retries: Option<u32>,
        #[arg(long = "initial-delay-ms", env = "KT_QUEUE_INITIAL_DELAY_MS")]
        initial_delay_ms: Option<u64>,
        #[arg(long = "max-delay-ms", env = "KT_QUEUE_MAX_DELAY_MS")]
        max_delay_ms: Option<u64>,
        /// Retry cycles before a template is paused (0 = never)
        #[arg(long = "max-cycles", env = "KT_QUEUE_MAX_CYCLES")]
        max_cycles: Option<u32>,
        /// Seconds between full resyncs (default from KT_RESYNC_SECS, else 300)
        #[arg(long = "resync-secs")]
        resync_secs: Option<u64>,
    },
    /// Validate templates against policies offline
    Check {
        /// File with one or more KubeTemplatePolicy documents
        #[arg(long)]
        policy: std::path::PathBuf,
        /// File with one or more KubeTemplate documents
        #[arg(long)]
        template: std::path::PathBuf,
        #[arg(long = "policy-namespace", env = "KT_POLICY_NAMESPACE", default_value = DEFAULT_POLICY_NAMESPACE)]
        policy_namespace: String,
    },
    /// Print the CustomResourceDefinitions as YAML
    Crds,
}

fn init_tracing() {
    let env = std::env::var("KT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KT_METRICS_ADDR; expected host:port");
        }
    }
}

struct RunArgs {
    workers: usize,
    policy_namespace: String,
    queue: QueueConfig,
    resync: Duration,
}

async fn run(args: RunArgs) -> Result<()> {
    let client = kubetemplater_kubehub::client().await?;
    let queue = Arc::new(WorkQueue::new(args.queue, Arc::new(QueueMetrics::new())));
    let resolver = Arc::new(PolicyResolver::new(args.policy_namespace, default_engine()));
    let stats = Arc::new(PolicyStats::new());
    let store = Arc::new(KubeObjectStore::new(client.clone()));
    if let Err(e) = store.refresh().await {
        warn!(error = %e, "initial discovery failed; resolving kinds lazily");
    }
    let sink: Arc<dyn StatusSink> = Arc::new(KubeStatusSink::new(client.clone()));

    let workers = Arc::new(WorkerContext {
        queue: Arc::clone(&queue),
        reconciler: Arc::new(Reconciler::new(store, Arc::clone(&resolver), Arc::clone(&stats))),
        source: Arc::new(KubeTemplateSource::new(client.clone())),
        sink: Arc::clone(&sink),
    });
    let hub = Arc::new(WatchContext {
        queue: Arc::clone(&queue),
        resolver: Arc::clone(&resolver),
        stats,
        tracker: Arc::new(GenerationTracker::new()),
        sink,
    });

    let policy_watch = tokio::spawn({
        let (client, hub) = (client.clone(), Arc::clone(&hub));
        async move {
            if let Err(e) = watch_policies(client, hub).await {
                error!(error = ?e, "policy watcher failed");
            }
        }
    });
    let template_watch = tokio::spawn({
        let (client, hub) = (client.clone(), Arc::clone(&hub));
        async move {
            if let Err(e) = watch_templates(client, hub).await {
                error!(error = ?e, "template watcher failed");
            }
        }
    });
    let resync = tokio::spawn(resync_loop(Arc::clone(&hub), args.resync));
    let handles: Vec<_> = (0..args.workers.max(1)).map(|id| tokio::spawn(run_worker(id, Arc::clone(&workers)))).collect();
    info!(workers = handles.len(), policy_namespace = %resolver.control_namespace(), resync_secs = args.resync.as_secs(), "controller running");

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    queue.shutdown();
    for h in handles {
        if let Err(e) = h.await {
            warn!(error = %e, "worker task ended abnormally");
        }
    }
    policy_watch.abort();
    template_watch.abort();
    resync.abort();
    Ok(())
}

fn print_verdicts(verdicts: &[check::Verdict], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for v in verdicts {
                let mark = if v.allowed { "ok  " } else { "FAIL" };
                let target = v.target.as_deref().unwrap_or("-");
                println!("{} {} [{}] {} • {}", mark, v.template, v.index, target, v.message);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(verdicts)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers, policy_namespace, max_retries, initial_delay_ms, max_delay_ms, max_cycles, resync_secs } => {
            let mut queue = QueueConfig::from_env();
            if let Some(v) = max_retries { queue.max_retries = v; }
            if let Some(v) = initial_delay_ms { queue.initial_delay = Duration::from_millis(v); }
            if let Some(v) = max_delay_ms { queue.max_delay = Duration::from_millis(v); }
            if let Some(v) = max_cycles { queue.max_cycles = v; }
            let resync = match resync_secs {
                Some(secs) => Duration::from_secs(secs.max(1)),
                None => resync_period_from_env(),
            };
            info!(?queue, "run invoked");
            run(RunArgs { workers, policy_namespace, queue, resync }).await?;
        }
        Commands::Check { policy, template, policy_namespace } => {
            let policy_yaml = std::fs::read_to_string(&policy).with_context(|| format!("reading {}", policy.display()))?;
            let template_yaml = std::fs::read_to_string(&template).with_context(|| format!("reading {}", template.display()))?;
            let verdicts = check::check(&policy_yaml, &template_yaml, &policy_namespace, default_engine())?;
            print_verdicts(&verdicts, cli.output)?;
            if verdicts.iter().any(|v| !v.allowed) {
                std::process::exit(1);
            }
        }
        Commands::Crds => {
            let crds = [KubeTemplate::crd(), KubeTemplatePolicy::crd()];
            for (i, crd) in crds.iter().enumerate() {
                if i > 0 {
                    println!("---");
                }
                print!("{}", serde_yaml::to_string(crd)?);
            }
        }
    }
    Ok(())
}
