use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};

use dispatcher::config::DispatcherConfig;
use dispatcher::core::{apply_phases, BatchId, FailurePolicy, Task, TaskGraph};
use dispatcher::orchestration::{Dispatcher, Outlet};
use dispatcher::protocol::{BatchTrigger, Inbound};
use dispatcher::sim::{Script, Simulator};
use dispatcher::state::{
    parse_phases, parse_tasks, FileLedger, FileTaskSource, InlineTaskSource, MemoryLedger,
    PHASES_FILE,
};
use dispatcher::transport::{InboundReader, MemoryBus, StdioPublisher};
use dispatcher::{Error, Result};

/// Plan slug used for batches simulated from a tasks file.
const SIMULATION_SLUG: &str = "simulation";

const INBOUND_BUFFER: usize = 256;

/// Dependency-aware task dispatcher
#[derive(Parser, Debug)]
#[command(name = "dispatcher")]
#[command(version, about, long_about = None)]
#[command(after_help = concat!(
    "ENVIRONMENT:\n",
    "    DISPATCHER_DEBUG=1       Enable debug logging (alternative to --debug)\n",
    "    DISPATCHER_REPO_PATH     Repository root holding .semspec/changes\n",
    "    RUST_LOG                 Explicit log filter, overrides both",
))]
pub struct Cli {
    /// Enable debug logging (written to stderr)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.dispatcher/dispatcher.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Simulate a batch from a tasks file with in-process collaborators
    Run {
        /// Path to a tasks.json file
        tasks: PathBuf,

        /// Override batch.max_concurrent
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Override batch.failure_policy
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Task ids whose execution should fail
        #[arg(long = "fail", value_name = "TASK_ID")]
        fail: Vec<String>,

        /// Task ids whose context build should always fail
        #[arg(long = "fail-context", value_name = "TASK_ID")]
        fail_context: Vec<String>,

        /// Only print the aggregate result
        #[arg(long, short = 'q')]
        quiet: bool,
    },

    /// Check a tasks file for duplicate ids, unknown dependencies and cycles
    Validate {
        /// Path to a tasks.json file
        tasks: PathBuf,
    },

    /// Print tasks in dispatch order
    Order {
        /// Path to a tasks.json file
        tasks: PathBuf,
    },

    /// Read inbound messages from stdin and publish to stdout as JSON lines
    Serve,

    /// Show the effective configuration
    Config {
        /// Write the default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyArg {
    FailFast,
    AbortAll,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FailFast => FailurePolicy::FailFast,
            PolicyArg::AbortAll => FailurePolicy::AbortAll,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dispatcher::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => DispatcherConfig::load_from(path)?,
        None => DispatcherConfig::load()?,
    };

    match cli.command {
        Command::Run {
            tasks,
            max_concurrent,
            policy,
            fail,
            fail_context,
            quiet,
        } => {
            let mut config = config;
            if let Some(max) = max_concurrent {
                config.batch.max_concurrent = max;
            }
            if let Some(policy) = policy {
                config.batch.failure_policy = policy.into();
            }
            config.validate()?;
            run_simulation(&config, &tasks, &fail, &fail_context, quiet).await
        }
        Command::Validate { tasks } => run_validate(&tasks),
        Command::Order { tasks } => run_order(&tasks),
        Command::Serve => run_serve(&config).await,
        Command::Config { init } => run_config(&config, cli.config.as_deref(), init),
    }
}

/// Read a tasks file, ordered by the `phases.json` next to it if there is one.
fn read_plan(path: &Path) -> Result<Vec<Task>> {
    let tasks = parse_tasks(&std::fs::read(path)?)?;
    let phases_path = path.with_file_name(PHASES_FILE);
    if !phases_path.exists() {
        return Ok(tasks);
    }
    let phases = parse_phases(&std::fs::read(&phases_path)?)?;
    info!(path = %phases_path.display(), phases = phases.len(), "plan is phased");
    apply_phases(tasks, &phases)
}

fn read_graph(path: &Path) -> Result<TaskGraph> {
    TaskGraph::from_tasks(read_plan(path)?)
}

/// Run one batch against the simulator and print what was published.
async fn run_simulation(
    config: &DispatcherConfig,
    tasks_path: &Path,
    fail: &[String],
    fail_context: &[String],
    quiet: bool,
) -> Result<()> {
    let tasks = read_plan(tasks_path)?;
    info!(path = %tasks_path.display(), tasks = tasks.len(), "simulating batch");

    let bus = Arc::new(MemoryBus::new());
    let outlet = Outlet::new(bus.clone(), config.subjects.clone());
    let source = InlineTaskSource::new().with_plan(SIMULATION_SLUG, tasks);
    let dispatcher = Arc::new(Dispatcher::new(
        outlet,
        Arc::new(source),
        Arc::new(MemoryLedger::new()),
        config.batch.clone(),
    ));

    let mut script = Script::new();
    for id in fail {
        script = script.fail_execution(id, "simulated execution failure");
    }
    for id in fail_context {
        script = script.fail_context(id, u32::MAX);
    }
    let simulator = Simulator::new(dispatcher.clone(), script);
    simulator.spawn(&bus);

    let batch_id = BatchId::generate();
    let request_id = uuid::Uuid::new_v4().to_string();
    let trigger = BatchTrigger::new(&request_id, SIMULATION_SLUG, batch_id.clone());
    let accepted = dispatcher.handle(Inbound::BatchTrigger(trigger)).await;

    let result = match accepted {
        Ok(()) => dispatcher.wait_for(&batch_id).await,
        Err(_) => None,
    };
    dispatcher.shutdown().await;

    if !quiet {
        for envelope in bus.published() {
            println!("{}", serde_json::to_string(&envelope)?);
        }
    }
    accepted?;

    let result = result.ok_or(Error::Shutdown)?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let stats = dispatcher.stats().snapshot();
    let observed = simulator.observations();
    info!(
        dispatched = stats.tasks_dispatched,
        contexts = stats.contexts_built,
        discarded = stats.duplicates_discarded,
        max_active = observed.max_active,
        "simulation finished"
    );
    Ok(())
}

fn run_validate(path: &Path) -> Result<()> {
    let graph = read_graph(path)?;
    println!(
        "ok: {} tasks, {} dependencies",
        graph.len(),
        graph.dependency_count()
    );
    Ok(())
}

fn run_order(path: &Path) -> Result<()> {
    let graph = read_graph(path)?;
    for (position, task) in graph.topological_order().into_iter().enumerate() {
        if task.depends_on.is_empty() {
            println!("{:>3}. {}", position + 1, task.id);
        } else {
            let deps: Vec<&str> = task.depends_on.iter().map(|d| d.as_str()).collect();
            println!("{:>3}. {} (after {})", position + 1, task.id, deps.join(", "));
        }
    }
    Ok(())
}

/// Serve JSON lines: inbound on stdin, outbound on stdout.
///
/// Unfinished batches from the ledger are resumed first. When stdin closes
/// the dispatcher stops; batches still running stay in the ledger.
async fn run_serve(config: &DispatcherConfig) -> Result<()> {
    config.validate()?;
    let plans_dir = config.effective_plans_dir()?;
    let ledger_dir = config.effective_ledger_dir()?;

    let outlet = Outlet::new(Arc::new(StdioPublisher::stdout()), config.subjects.clone());
    let dispatcher = Dispatcher::new(
        outlet,
        Arc::new(FileTaskSource::new(&plans_dir)),
        Arc::new(FileLedger::new(&ledger_dir)),
        config.batch.clone(),
    );

    let resumed = dispatcher.recover().await?;
    info!(
        plans_dir = %plans_dir.display(),
        ledger_dir = %ledger_dir.display(),
        resumed,
        "dispatcher serving on stdin"
    );

    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
    let reader = tokio::spawn(async move {
        let mut reader = InboundReader::new(BufReader::new(tokio::io::stdin()));
        while let Some(message) = reader.next().await {
            match message {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "inbound message rejected"),
            }
        }
    });

    dispatcher.run(rx).await;
    reader.await.map_err(|e| Error::TaskJoin(e.to_string()))?;

    let stats = dispatcher.stats().snapshot();
    info!(
        batches = stats.batches_processed,
        dispatched = stats.tasks_dispatched,
        failed = stats.executions_failed,
        "input closed"
    );
    dispatcher.shutdown().await;
    Ok(())
}

fn run_config(config: &DispatcherConfig, explicit: Option<&Path>, init: bool) -> Result<()> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => DispatcherConfig::config_path()?,
    };
    if init {
        if path.exists() {
            println!("Config already exists: {}", path.display());
        } else {
            config.save_to(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
