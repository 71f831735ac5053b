use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use conductor_core::app::{
    RunOutcome, SchedulerBuilder, SprintLog, SprintStatus, TaskLifecycle, unresolved_conflicts,
};
use conductor_core::config::ConductorConfig;
use conductor_core::domain::{
    COMPLETION_NOTES_TEMPLATE, CompletionReport, ConductorError, FileChange, ProgressKind,
    SessionId, SprintDefinition, Task, TaskId, TaskStatus,
};
use conductor_core::graph::DependencyGraph;
use conductor_core::impls::command::{ENV_CHANNEL_DIR, ENV_SESSION_ID, ENV_TASK_ID};
use conductor_core::impls::{
    CommandLauncher, FileTaskStore, FsArtifactStore, FsProgressChannel, JsonlEventSink,
};
use conductor_core::ports::{
    CancelToken, Clock, ProgressChannel, SessionReporter, SystemClock, TaskStore, UlidGenerator,
};
use conductor_core::retry::RetryPolicy;

const SPRINT_LOG: &str = "sprint-log.jsonl";

#[derive(Debug, Parser)]
#[command(name = "conductor", version, about = "Run a sprint of interdependent tasks")]
struct Cli {
    /// Sprint definition file.
    #[arg(long, short = 'f', global = true, default_value = "sprint.yaml")]
    file: PathBuf,

    /// State directory (progress, signals, inputs, sprint log).
    /// Defaults to `.conductor/` next to the sprint file.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the sprint file: schema, dependencies, settings.
    Validate,
    /// Show execution waves, the critical path and the ready set.
    Plan {
        #[arg(long)]
        json: bool,
    },
    /// Show where the sprint stands.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Move a task to in_progress.
    Start { task_id: String },
    /// Mark a task completed with completion notes.
    Complete {
        task_id: String,
        #[command(flatten)]
        notes: NotesSource,
    },
    /// Defer a task in progress.
    Defer {
        task_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Print the completion notes template.
    Template,
    /// Schedule the sprint with the workers from the `roles` table.
    Run(RunArgs),
    /// Report from inside a worker started by `run`.
    #[command(subcommand)]
    Report(ReportCommand),
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct NotesSource {
    /// Notes in the template's YAML form.
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    notes_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    max_workers: Option<usize>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Progress {
        #[arg(long)]
        percent: u8,
        #[arg(long, default_value = "")]
        message: String,
    },
    Heartbeat,
    /// Publish a success signal.
    Done {
        #[arg(long)]
        summary: Option<String>,
        /// Changed file (repeatable).
        #[arg(long = "file-changed")]
        files_changed: Vec<String>,
        #[arg(long = "decision")]
        design_decisions: Vec<String>,
        #[arg(long = "next")]
        next_tasks: Vec<String>,
        #[arg(long)]
        testing: Option<String>,
        /// Full report as JSON, hunks included. Overrides the other flags.
        #[arg(long)]
        report_file: Option<PathBuf>,
    },
    /// Publish a failure signal.
    Fail {
        #[arg(long)]
        error: String,
    },
}

/// A command failure: either a core error with its structured report, or
/// a problem with the invocation itself.
enum Failure {
    Core(ConductorError),
    Usage(String),
}

impl From<ConductorError> for Failure {
    fn from(e: ConductorError) -> Self {
        Failure::Core(e)
    }
}

type CliResult<T = ()> = Result<T, Failure>;

fn core_error<E: Into<ConductorError>>(e: E) -> Failure {
    Failure::Core(e.into())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(Failure::Core(e)) => {
            let report = e.report();
            match serde_json::to_string_pretty(&report) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("error: {e}"),
            }
            ExitCode::FAILURE
        }
        Err(Failure::Usage(message)) => {
            eprintln!("error: {message}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> CliResult<ExitCode> {
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| workspace_of(&cli.file).join(".conductor"));

    match cli.command {
        Command::Validate => validate(&cli.file).await?,
        Command::Plan { json } => plan(&cli.file, json).await?,
        Command::Status { json } => status(&cli.file, &state_dir, json).await?,
        Command::Start { task_id } => {
            let task = lifecycle(&cli.file, &state_dir)
                .await?
                .start(&parse_task_id(&task_id)?)
                .await?;
            print_task(&task);
        }
        Command::Complete { task_id, notes } => {
            let notes = match (notes.notes, notes.notes_file) {
                (Some(text), _) => text,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| Failure::Usage(format!("read {}: {e}", path.display())))?,
                (None, None) => String::new(),
            };
            let task = lifecycle(&cli.file, &state_dir)
                .await?
                .complete(&parse_task_id(&task_id)?, &notes)
                .await?;
            print_task(&task);
        }
        Command::Defer { task_id, reason } => {
            let task = lifecycle(&cli.file, &state_dir)
                .await?
                .defer(&parse_task_id(&task_id)?, &reason)
                .await?;
            print_task(&task);
        }
        Command::Template => print!("{COMPLETION_NOTES_TEMPLATE}"),
        Command::Run(args) => return run(&cli.file, &state_dir, args).await,
        Command::Report(command) => report(command).await?,
    }
    Ok(ExitCode::SUCCESS)
}

/// Directory the sprint file lives in; artifact paths are relative to it.
fn workspace_of(file: &Path) -> PathBuf {
    match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn parse_task_id(raw: &str) -> CliResult<TaskId> {
    let id = TaskId::new(raw);
    if id.is_well_formed() {
        Ok(id)
    } else {
        Err(Failure::Usage(format!("'{raw}' is not a valid task id")))
    }
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    let json = serde_json::to_string_pretty(value).map_err(|e| Failure::Usage(e.to_string()))?;
    println!("{json}");
    Ok(())
}

fn print_task(task: &Task) {
    match task.status {
        TaskStatus::Deferred => println!(
            "{}: {} ({})",
            task.id,
            task.status,
            task.deferred_reason.as_deref().unwrap_or_default()
        ),
        _ => println!("{}: {}", task.id, task.status),
    }
}

struct Loaded {
    store: FileTaskStore,
    definition: SprintDefinition,
    config: ConductorConfig,
    graph: DependencyGraph,
}

async fn load(file: &Path) -> CliResult<Loaded> {
    let (store, definition) = FileTaskStore::open(file).await.map_err(core_error)?;
    let graph = DependencyGraph::build(&definition.tasks).map_err(core_error)?;
    let config = ConductorConfig::from_settings(definition.settings.as_ref()).map_err(core_error)?;
    Ok(Loaded {
        store,
        definition,
        config,
        graph,
    })
}

async fn validate(file: &Path) -> CliResult {
    let loaded = load(file).await?;
    let roles: Vec<String> = loaded
        .definition
        .tasks
        .iter()
        .map(|t| t.assigned_role.to_string())
        .filter(|role| !loaded.definition.roles.keys().any(|r| r.as_str() == role))
        .collect();
    println!(
        "{}: {} tasks, {} execution waves",
        loaded.definition.name,
        loaded.definition.tasks.len(),
        loaded.graph.waves().len()
    );
    if !roles.is_empty() {
        println!("note: no command for roles {roles:?}; `run` will defer their tasks");
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Plan {
    sprint: String,
    waves: Vec<Vec<TaskId>>,
    critical_path: conductor_core::graph::CriticalPath,
    ready: Vec<TaskId>,
}

async fn plan(file: &Path, json: bool) -> CliResult {
    let loaded = load(file).await?;
    let statuses: HashMap<TaskId, TaskStatus> = loaded
        .definition
        .tasks
        .iter()
        .map(|t| (t.id.clone(), t.status))
        .collect();
    let plan = Plan {
        sprint: loaded.definition.name.clone(),
        waves: loaded.graph.waves(),
        critical_path: loaded.graph.critical_path(
            loaded.config.default_effort,
            loaded.config.critical_path_tie_break,
        ),
        ready: loaded.graph.ready_set(&statuses),
    };
    if json {
        return print_json(&plan);
    }

    println!("sprint {}", plan.sprint);
    for (i, wave) in plan.waves.iter().enumerate() {
        println!("  wave {}: {}", i + 1, join(wave));
    }
    println!(
        "critical path ({} effort): {}",
        plan.critical_path.total_effort,
        plan.critical_path
            .path
            .iter()
            .map(TaskId::as_str)
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    println!("ready now: {}", join(&plan.ready));
    Ok(())
}

fn join(ids: &[TaskId]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", ")
}

async fn status(file: &Path, state_dir: &Path, json: bool) -> CliResult {
    let loaded = load(file).await?;
    let tasks = loaded.store.snapshot().await.map_err(core_error)?;
    let mut status = SprintStatus::collect(
        loaded.definition.name.clone(),
        &tasks,
        &loaded.graph,
        loaded.config.default_effort,
        loaded.config.critical_path_tie_break,
    );

    if state_dir.exists() {
        let channel = FsProgressChannel::open(state_dir, RetryPolicy::none())
            .await
            .map_err(core_error)?;
        for task in tasks.iter().filter(|t| t.status == TaskStatus::InProgress) {
            if let Some(entry) = channel.progress(&task.id).await.map_err(core_error)?.pop() {
                status = status.with_progress(entry);
            }
        }
        let events = JsonlEventSink::new(state_dir.join(SPRINT_LOG))
            .read_all()
            .await
            .map_err(core_error)?;
        status = status.with_conflicts(unresolved_conflicts(&events));
    }

    if json {
        return print_json(&status);
    }
    print_status(&status);
    Ok(())
}

fn print_status(status: &SprintStatus) {
    let c = &status.counts;
    println!(
        "sprint {}: {} pending, {} in progress, {} completed, {} deferred",
        status.sprint, c.pending, c.in_progress, c.completed, c.deferred
    );
    println!("ready: {}", join(&status.ready));
    println!("critical path: {}", join(&status.critical_path.path));
    for blocked in &status.blocked {
        let blockers: Vec<String> = blocked
            .blocked_by
            .iter()
            .map(|b| format!("{} ({})", b.task_id, b.status))
            .collect();
        println!("blocked: {} waits on {}", blocked.task_id, blockers.join(", "));
    }
    for deferred in &status.deferred {
        println!("deferred: {} ({})", deferred.task_id, deferred.reason);
    }
    for (task_id, entry) in &status.latest_progress {
        if let ProgressKind::Progress { percent, message } = &entry.kind {
            println!("progress: {task_id} {percent}% {message}");
        }
    }
    for conflict in &status.unresolved_conflicts {
        println!("CONFLICT: {conflict}");
    }
}

async fn lifecycle(file: &Path, state_dir: &Path) -> CliResult<TaskLifecycle> {
    let (store, _) = FileTaskStore::open(file).await.map_err(core_error)?;
    tokio::fs::create_dir_all(state_dir)
        .await
        .map_err(|e| Failure::Usage(format!("create {}: {e}", state_dir.display())))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let log = SprintLog::new(
        Arc::new(JsonlEventSink::new(state_dir.join(SPRINT_LOG))),
        Arc::clone(&clock),
    );
    let channel = FsProgressChannel::open(state_dir, RetryPolicy::default())
        .await
        .map_err(core_error)?;
    Ok(TaskLifecycle::new(Arc::new(store), clock, log).with_channel(Arc::new(channel)))
}

async fn run(file: &Path, state_dir: &Path, args: RunArgs) -> CliResult<ExitCode> {
    let loaded = load(file).await?;
    let mut config = loaded.config;
    if let Some(n) = args.max_workers {
        config.max_parallel_workers = n;
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }

    let workspace = workspace_of(file);
    let channel = FsProgressChannel::open(state_dir, config.ipc_retry_policy())
        .await
        .map_err(core_error)?;
    let mut builder = SchedulerBuilder::new(
        Arc::new(loaded.store),
        Arc::new(channel),
        Arc::new(FsArtifactStore::new(&workspace)),
        Arc::new(JsonlEventSink::new(state_dir.join(SPRINT_LOG))),
    )
    .sprint_name(loaded.definition.name.clone())
    .config(config);
    for (role, command) in &loaded.definition.roles {
        let launcher = CommandLauncher::new(command.clone(), state_dir).working_dir(&workspace);
        builder = builder
            .register(role.clone(), Arc::new(launcher))
            .map_err(|e| Failure::Usage(e.to_string()))?;
    }
    let mut scheduler = builder.build().await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping workers");
            let _ = stop_tx.send(true);
        }
    });

    let summary = scheduler.run(stop_rx).await?;
    print_json(&summary)?;

    let clean = summary.outcome == RunOutcome::Settled
        && summary.counts.deferred == 0
        && summary.unresolved_conflicts.is_empty();
    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Reporter for the session named by the worker's environment.
async fn session_reporter() -> CliResult<SessionReporter> {
    let var = |name: &str| {
        std::env::var(name).map_err(|_| Failure::Usage(format!("{name} is not set; run inside a worker")))
    };
    let task_id = parse_task_id(&var(ENV_TASK_ID)?)?;
    let session_id: SessionId = var(ENV_SESSION_ID)?
        .parse()
        .map_err(|e| Failure::Usage(format!("{ENV_SESSION_ID}: {e}")))?;
    let channel = FsProgressChannel::open(var(ENV_CHANNEL_DIR)?, RetryPolicy::default())
        .await
        .map_err(core_error)?;
    let channel: Arc<dyn ProgressChannel> = Arc::new(channel);
    Ok(SessionReporter::new(
        task_id,
        session_id,
        channel,
        Arc::new(SystemClock),
        Arc::new(UlidGenerator::new(SystemClock)),
        CancelToken::new(),
    ))
}

async fn report(command: ReportCommand) -> CliResult {
    let reporter = session_reporter().await?;
    match command {
        ReportCommand::Progress { percent, message } => {
            reporter.progress(percent, message).await.map_err(core_error)
        }
        ReportCommand::Heartbeat => reporter.heartbeat().await.map_err(core_error),
        ReportCommand::Done {
            summary,
            files_changed,
            design_decisions,
            next_tasks,
            testing,
            report_file,
        } => {
            let report = match report_file {
                Some(path) => {
                    let text = tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|e| Failure::Usage(format!("read {}: {e}", path.display())))?;
                    serde_json::from_str::<CompletionReport>(&text)
                        .map_err(|e| Failure::Usage(format!("{}: {e}", path.display())))?
                }
                None => CompletionReport {
                    summary: summary.unwrap_or_default(),
                    files_changed: files_changed.into_iter().map(FileChange::path_only).collect(),
                    design_decisions,
                    next_tasks,
                    testing,
                },
            };
            reporter.complete(report).await.map_err(core_error)
        }
        ReportCommand::Fail { error } => reporter.fail(error).await.map_err(core_error),
    }
}
