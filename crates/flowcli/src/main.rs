// crates/flowcli/src/main.rs

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{DefinitionMode, ExecutionEvent, FlowGraph, FlowNodeKind, RunId, StepFailure, Value};
use flownodes::{semaphore, standard_registry, SemaphoreBoard};
use flowruntime::{Checkpoint, ExecutionPhase, FlowExecution, FlowRuntime, RuntimeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Durable flow engine CLI", long_about = None)]
struct Cli {
    /// Runtime configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding run checkpoints; overrides the configuration
    #[arg(short, long, global = true)]
    state_dir: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run from a definition file
    Run {
        file: PathBuf,

        /// Job the run belongs to; defaults to the definition name
        #[arg(short, long)]
        job: Option<String>,

        /// Run in restricted mode
        #[arg(long)]
        restricted: bool,

        /// Keep the process alive until the run finishes
        #[arg(short, long)]
        wait: bool,
    },

    /// Resume every suspended run in the state directory
    Resume {
        #[arg(short, long)]
        wait: bool,
    },

    /// List steps waiting for completion
    Pending {
        /// Only steps of this kind
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Complete a pending step
    Complete {
        step_id: String,

        /// Result as JSON
        #[arg(long, conflicts_with = "fail")]
        value: Option<String>,

        /// Fail the step with this message instead
        #[arg(long)]
        fail: Option<String>,
    },

    /// Release a waiting semaphore by key, e.g. `wait/1`
    Release {
        key: String,

        #[arg(long)]
        value: Option<String>,
    },

    /// Abort a run
    Abort {
        run_id: String,

        #[arg(short, long, default_value = "aborted by user")]
        reason: String,
    },

    /// Show the status of persisted runs
    Status {
        run_id: Option<String>,
    },

    /// Print the flow graph of a run
    Graph { run_id: String },

    /// Print the output of a run
    Log { run_id: String },

    /// Validate a definition file
    Validate {
        file: PathBuf,

        #[arg(long)]
        restricted: bool,
    },

    /// List available step kinds
    Steps,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path).with_context(|| format!("reading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.clone());
    }
    if config.state_dir.is_none() {
        config.state_dir = Some(PathBuf::from(".flow"));
    }
    tracing::debug!(state_dir = ?config.state_dir, policy = ?config.identity_policy, "configuration loaded");
    Ok(config)
}

fn mode(restricted: bool) -> DefinitionMode {
    if restricted {
        DefinitionMode::Restricted
    } else {
        DefinitionMode::Full
    }
}

fn parse_run_id(text: &str) -> Result<RunId> {
    RunId::parse_str(text).with_context(|| format!("'{text}' is not a run id"))
}

fn parse_value(text: Option<String>) -> Result<Value> {
    match text {
        Some(text) => {
            let json: serde_json::Value = serde_json::from_str(&text).context("value must be JSON")?;
            Ok(Value::from(json))
        }
        None => Ok(Value::Null),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(&cli)?;

    let board = Arc::new(SemaphoreBoard::new());
    let runtime = FlowRuntime::builder()
        .config(config)
        .registry(standard_registry(&board))
        .build();

    match cli.command {
        Commands::Run {
            file,
            job,
            restricted,
            wait,
        } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let definition = runtime.validate(&text, mode(restricted))?;
            let job = job.unwrap_or_else(|| definition.name.clone());
            run(&runtime, definition, &job, wait).await?;
        }

        Commands::Resume { wait } => {
            let report = runtime.resume_all().await?;
            for (run_id, reason) in &report.failed {
                println!("{run_id}: cannot resume: {reason}");
            }
            for execution in runtime.executions() {
                report_phase(&execution, wait).await?;
            }
            if report.resumed.is_empty() && report.failed.is_empty() {
                println!("Nothing to resume");
            }
        }

        Commands::Pending { kind } => {
            runtime.resume_all().await?;
            runtime.wait_until_settled().await;
            let pending = runtime.list_pending(kind.as_deref());
            if pending.is_empty() {
                println!("No pending steps");
            }
            for step in pending {
                println!(
                    "{}  run {}  {} (node {}){}  since {}",
                    step.step_id,
                    step.run_id,
                    step.kind,
                    step.node_id,
                    step.status.map(|s| format!(" [{s}]")).unwrap_or_default(),
                    step.since.to_rfc3339()
                );
            }
        }

        Commands::Complete { step_id, value, fail } => {
            let step_id = RunId::parse_str(&step_id).with_context(|| format!("'{step_id}' is not a step id"))?;
            let outcome = match fail {
                Some(message) => Err(StepFailure::new(message)),
                None => Ok(parse_value(value)?),
            };
            runtime.resume_all().await?;
            runtime.complete_pending(step_id, outcome).await?;
            for execution in runtime.executions() {
                report_phase(&execution, false).await?;
            }
        }

        Commands::Release { key, value } => {
            let value = parse_value(value)?;
            runtime.resume_all().await?;
            runtime.wait_until_settled().await;
            if !semaphore::release(&runtime, &key, value) {
                return Err(anyhow!("no semaphore is waiting under {key}"));
            }
            runtime.wait_until_settled().await;
            for execution in runtime.executions() {
                report_phase(&execution, false).await?;
            }
        }

        Commands::Abort { run_id, reason } => {
            let run_id = parse_run_id(&run_id)?;
            runtime.resume(run_id).await?;
            let status = runtime.abort(run_id, &reason).await?;
            println!("{run_id}: {status}");
        }

        Commands::Status { run_id } => {
            let store = runtime.store();
            let ids = match run_id {
                Some(id) => vec![parse_run_id(&id)?],
                None => store.list().await?,
            };
            for id in ids {
                let checkpoint = store.load(id).await?;
                print_status(&checkpoint);
            }
        }

        Commands::Graph { run_id } => {
            let checkpoint = runtime.store().load(parse_run_id(&run_id)?).await?;
            print_graph(&checkpoint.graph);
        }

        Commands::Log { run_id } => {
            let checkpoint = runtime.store().load(parse_run_id(&run_id)?).await?;
            for line in &checkpoint.log {
                println!("{}", line.text);
            }
        }

        Commands::Validate { file, restricted } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let definition = runtime.validate(&text, mode(restricted))?;
            println!("{} is valid ({:?} mode)", definition.name, definition.mode);
        }

        Commands::Steps => {
            let registry = runtime.registry();
            for name in registry.list_function_names() {
                match registry.get_metadata(&name) {
                    Some(metadata) => {
                        let kind = if metadata.asynchronous { "async" } else { "sync" };
                        println!("{name} ({}, {kind})", metadata.category);
                        println!("    {}", metadata.description);
                        for arg in &metadata.args {
                            let required = if arg.required { "required" } else { "optional" };
                            println!("    --{} ({required}): {}", arg.name, arg.description);
                        }
                    }
                    None => println!("{name}"),
                }
            }
        }
    }

    Ok(())
}

async fn run(runtime: &FlowRuntime, definition: flowcore::Definition, job: &str, wait: bool) -> Result<()> {
    let mut events = runtime.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ExecutionEvent::Output { line, .. } = event {
                println!("{}", line.text);
            }
        }
    });

    let execution = runtime.start_definition(definition, job)?;
    println!("Started run {}", execution.run_id());
    let result = report_phase(&execution, wait).await;

    // Let the printer drain output published just before settling
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    printer.abort();
    result
}

async fn report_phase(execution: &FlowExecution, wait: bool) -> Result<()> {
    let run_id = execution.run_id();
    if wait {
        let status = execution.wait_for_completion().await?;
        println!("{run_id}: {status}");
        return Ok(());
    }
    match execution.wait_until_settled().await {
        ExecutionPhase::Completed(status) => println!("{run_id}: {status}"),
        ExecutionPhase::Suspended { pending } => {
            println!("{run_id}: suspended with {pending} pending step(s)");
        }
        ExecutionPhase::Halted(reason) => return Err(anyhow!("{run_id} halted: {reason}")),
        ExecutionPhase::Running => {}
    }
    Ok(())
}

fn print_status(checkpoint: &Checkpoint) {
    let run = &checkpoint.run;
    let finished = run
        .finished_at
        .map(|at| format!(", finished {}", at.to_rfc3339()))
        .unwrap_or_default();
    println!(
        "{}  {}  job {} as {}  started {}{}",
        run.id,
        run.status,
        run.job,
        checkpoint.principal,
        run.started_at.to_rfc3339(),
        finished
    );
    for pending in &checkpoint.pending {
        println!("    waiting: {} ({}) at node {}", pending.id, pending.kind, pending.node);
    }
}

fn print_graph(graph: &FlowGraph) {
    for node in graph.nodes() {
        let parents: Vec<String> = node.parents.iter().map(u64::to_string).collect();
        let kind = match &node.kind {
            FlowNodeKind::Start => "start".to_string(),
            FlowNodeKind::End => "end".to_string(),
            FlowNodeKind::Atom { step } => format!("step {step}"),
            FlowNodeKind::BlockStart { block } => format!("{block} {{"),
            FlowNodeKind::BlockEnd { start } => format!("}} {start}"),
        };
        let error = node
            .error
            .as_ref()
            .map(|e| format!("  !! {}", e.message))
            .unwrap_or_default();
        println!("{:>4} <- [{}]  {kind}  {}{error}", node.id, parents.join(","), node.label);
    }
}
