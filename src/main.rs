//! Evalwatch - evaluation job orchestrator
//!
//! Runs evaluations end to end against a simulated cluster, printing every
//! notification as a JSON line on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evalwatch::app::App;
use evalwatch::cluster::{ClusterHandles, SimulatedCluster, SimulationProfile};
use evalwatch::config::OrchestratorConfig;
use evalwatch::notify::ChannelNotifier;
use evalwatch::store::{FileStateStore, StateStore};
use evalwatch::workflow::EvaluationRequest;

/// Orchestrate and monitor model-evaluation jobs.
#[derive(Parser)]
#[command(name = "evalwatch", version, about)]
struct Cli {
    /// JSON config file; flags and environment override its values.
    #[arg(long, global = true, env = "EVALWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding persisted monitor state.
    #[arg(long, global = true, env = "EVALWATCH_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Seconds between monitor ticks.
    #[arg(long, global = true, env = "EVALWATCH_POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Tick budget per monitoring run.
    #[arg(long, global = true, env = "EVALWATCH_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Seconds allowed for a single cluster call.
    #[arg(long, global = true, env = "EVALWATCH_CALL_TIMEOUT")]
    call_timeout: Option<u64>,

    /// Log filter, used when RUST_LOG is unset.
    #[arg(long, global = true, env = "EVALWATCH_LOG", default_value = "evalwatch=info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one evaluation end to end on the simulated cluster.
    Run {
        /// Evaluation ID (defaults to a timestamped one).
        #[arg(long)]
        eval_id: Option<String>,

        #[arg(long, default_value = "demo-model")]
        model: String,

        /// Comma-separated benchmark names.
        #[arg(long, value_delimiter = ',', default_value = "mmlu,hellaswag,arc_challenge")]
        benchmarks: Vec<String>,

        #[command(flatten)]
        simulation: SimulationArgs,
    },

    /// Re-drive every persisted monitoring run.
    Resume {
        #[command(flatten)]
        simulation: SimulationArgs,
    },

    /// Print persisted state for a run, or list persisted runs.
    Inspect {
        run_id: Option<String>,
    },
}

#[derive(clap::Args)]
struct SimulationArgs {
    /// Seed for a reproducible simulation.
    #[arg(long)]
    seed: Option<u64>,

    /// Probability that a simulated job fails.
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Simulate an unreachable cluster.
    #[arg(long)]
    offline: bool,
}

impl SimulationArgs {
    fn profile(&self) -> SimulationProfile {
        SimulationProfile {
            failure_rate: self.failure_rate,
            reachable: !self.offline,
            seed: self.seed,
            ..SimulationProfile::default()
        }
    }
}

impl Cli {
    fn load_config(&self) -> Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::from_file(path)
                .wrap_err_with(|| format!("failed to load {}", path.display()))?,
            None => OrchestratorConfig::default(),
        };
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_attempts = attempts;
        }
        if let Some(secs) = self.call_timeout {
            config.call_timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.load_config()?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(config.state_dir.clone()));

    match cli.command {
        Command::Run {
            eval_id,
            model,
            benchmarks,
            simulation,
        } => {
            let cluster = Arc::new(SimulatedCluster::new(simulation.profile()));
            let eval_id = eval_id
                .unwrap_or_else(|| format!("eval-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S")));
            let request = EvaluationRequest {
                eval_id,
                model,
                benchmarks,
                params: serde_json::Value::Null,
                poll_interval_secs: None,
                max_attempts: None,
            };

            let (notifier, printer) = spawn_printer();
            let app = App::new(config, ClusterHandles::from_shared(cluster), store, notifier)?;
            let outcome = app.evaluate(request, shutdown_token()).await?;
            drop(app);
            finish_printer(printer).await;

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.succeeded() {
                return Err(eyre!(
                    "evaluation {} failed at {}",
                    outcome.eval_id,
                    outcome.failed_stage.as_deref().unwrap_or("unknown stage")
                ));
            }
        }
        Command::Resume { simulation } => {
            let cluster = Arc::new(SimulatedCluster::new(simulation.profile()));
            for run_id in store.list().await? {
                if let Some(state) = store.load(&run_id).await? {
                    cluster.adopt(&state.remaining_jobs()).await;
                }
            }

            let (notifier, printer) = spawn_printer();
            let app = App::new(config, ClusterHandles::from_shared(cluster), store, notifier)?;
            let results = app.resume(shutdown_token()).await?;
            drop(app);
            finish_printer(printer).await;

            if results.is_empty() {
                info!("no persisted runs to resume");
            }
            for result in results {
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        Command::Inspect { run_id } => match run_id {
            Some(run_id) => match store
                .load(&run_id)
                .await
                .wrap_err_with(|| format!("cannot read persisted state for {}", run_id))?
            {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => return Err(eyre!("no persisted state for {}", run_id)),
            },
            None => {
                for run_id in store.list().await.wrap_err("cannot list persisted runs")? {
                    println!("{}", run_id);
                }
            }
        },
    }

    Ok(())
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next tick");
            trigger.cancel();
        }
    });
    token
}

/// Prints every notification as a JSON line until all senders are gone.
fn spawn_printer() -> (Arc<ChannelNotifier>, tokio::task::JoinHandle<()>) {
    let (notifier, receiver) = ChannelNotifier::new(256);
    let printer = tokio::spawn(async move {
        let mut notifications = ReceiverStream::new(receiver);
        while let Some(notification) = notifications.next().await {
            match serde_json::to_string(&notification) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "cannot encode notification"),
            }
        }
    });
    (Arc::new(notifier), printer)
}

async fn finish_printer(printer: tokio::task::JoinHandle<()>) {
    if let Err(e) = printer.await {
        warn!(error = %e, "notification printer stopped abnormally");
    }
}
