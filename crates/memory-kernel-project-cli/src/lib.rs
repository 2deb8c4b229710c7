//! Embedded `mk project` command surface.
//!
//! Hosts embed project memory through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_project_with_root`] for a `ProjectCommand` against a project root.
//! - [`run_project`] for execution against an open [`JsonProjectStore`].
//!
//! Every command prints one JSON document on stdout. Automatic lifecycle
//! notices go to stderr unless silent mode is on.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use memory_kernel_project_core::config::ConfigFile;
use memory_kernel_project_core::lifecycle::RotationEvent;
use memory_kernel_project_core::transfer::{
    ConflictPolicy, ExportOptions, ImportFormat, ImportOptions, EXPORT_VERSION,
};
use memory_kernel_project_core::{RecordKind, TaskStatus};
use memory_kernel_project_store_json::transfer::{read_import_file, write_export};
use memory_kernel_project_store_json::{open_project, JsonProjectStore, PatternInput, TaskInput};
use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "mk")]
#[command(about = "Memory Kernel Project CLI")]
pub struct Cli {
    /// Project root holding `.project-memory/` and `PROJECT_MEMORY.md`.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long)]
    silent: bool,

    #[arg(long)]
    no_auto_session: bool,

    #[arg(long)]
    no_auto_backup: bool,

    /// Render the summary without per-section caps.
    #[arg(long)]
    full_doc: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Flags that override the project's config file.
    #[must_use]
    pub fn overrides(&self) -> ConfigFile {
        ConfigFile {
            auto_session: self.no_auto_session.then_some(false),
            auto_backup: self.no_auto_backup.then_some(false),
            token_optimization: self.full_doc.then_some(false),
            silent_mode: self.silent.then_some(true),
            ..ConfigFile::default()
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Project {
        #[command(subcommand)]
        command: Box<ProjectCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProjectCommand {
    /// Create the state directory, config file and summary document.
    Init,
    Session {
        #[command(subcommand)]
        command: Box<SessionCommand>,
    },
    Decision {
        #[command(subcommand)]
        command: Box<DecisionCommand>,
    },
    Pattern {
        #[command(subcommand)]
        command: Box<PatternCommand>,
    },
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
    Knowledge {
        #[command(subcommand)]
        command: Box<KnowledgeCommand>,
    },
    Action {
        #[command(subcommand)]
        command: Box<ActionCommand>,
    },
    Search(SearchArgs),
    Stats,
    /// Regenerate the summary and the detail documents.
    Sync,
    Export(ExportArgs),
    Import(ImportArgs),
    Backup {
        #[command(subcommand)]
        command: Box<BackupCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    Start(SessionStartArgs),
    End(SessionEndArgs),
    Context(SessionContextArgs),
}

#[derive(Debug, Args)]
pub struct SessionStartArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long, default_value = "{}")]
    context_json: String,
}

#[derive(Debug, Args)]
pub struct SessionEndArgs {
    #[arg(long)]
    outcome: Option<String>,
}

#[derive(Debug, Args)]
pub struct SessionContextArgs {
    #[arg(long)]
    key: String,
    /// Parsed as JSON when possible, otherwise stored as a string.
    #[arg(long)]
    value: String,
}

#[derive(Debug, Subcommand)]
pub enum DecisionCommand {
    Add(DecisionAddArgs),
    Outcome(DecisionOutcomeArgs),
}

#[derive(Debug, Args)]
pub struct DecisionAddArgs {
    #[arg(long)]
    decision: String,
    #[arg(long)]
    reasoning: String,
    #[arg(long = "alternative")]
    alternatives: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DecisionOutcomeArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    outcome: String,
}

#[derive(Debug, Subcommand)]
pub enum PatternCommand {
    Record(PatternRecordArgs),
    Resolve(PatternResolveArgs),
}

#[derive(Debug, Args)]
pub struct PatternRecordArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    priority: Option<String>,
    #[arg(long)]
    effectiveness: Option<f64>,
    /// Occurrences to add to the pattern's frequency.
    #[arg(long)]
    count: Option<u64>,
}

#[derive(Debug, Args)]
pub struct PatternResolveArgs {
    /// Pattern id or name.
    #[arg(long)]
    pattern: String,
    #[arg(long)]
    solution: String,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    Add(TaskAddArgs),
    Update(TaskUpdateArgs),
}

#[derive(Debug, Args)]
pub struct TaskAddArgs {
    #[arg(long)]
    description: String,
    #[arg(long)]
    priority: Option<String>,
    #[arg(long)]
    assignee: Option<String>,
    #[arg(long)]
    due_date: Option<String>,
}

#[derive(Debug, Args)]
pub struct TaskUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    status: TaskStatusArg,
}

#[derive(Debug, Subcommand)]
pub enum KnowledgeCommand {
    Set(KnowledgeSetArgs),
}

#[derive(Debug, Args)]
pub struct KnowledgeSetArgs {
    #[arg(long)]
    category: String,
    #[arg(long)]
    key: String,
    #[arg(long)]
    value: String,
}

#[derive(Debug, Subcommand)]
pub enum ActionCommand {
    Log(ActionLogArgs),
}

#[derive(Debug, Args)]
pub struct ActionLogArgs {
    #[arg(long = "type")]
    action_type: String,
    #[arg(long, default_value = "{}")]
    details_json: String,
    #[arg(long)]
    result: Option<String>,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(long)]
    query: String,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Write to this file instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long = "kind")]
    kinds: Vec<RecordKindArg>,
    #[arg(long)]
    sanitize: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    format: Option<ImportFormatArg>,
    #[arg(long, default_value = "merge")]
    policy: PolicyArg,
    #[arg(long = "kind")]
    kinds: Vec<RecordKindArg>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub enum BackupCommand {
    Run,
    List,
    Prune,
    Restore(BackupRestoreArgs),
}

#[derive(Debug, Args)]
pub struct BackupRestoreArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TaskStatusArg {
    Open,
    InProgress,
    Completed,
}

impl From<TaskStatusArg> for TaskStatus {
    fn from(value: TaskStatusArg) -> Self {
        match value {
            TaskStatusArg::Open => Self::Open,
            TaskStatusArg::InProgress => Self::InProgress,
            TaskStatusArg::Completed => Self::Completed,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RecordKindArg {
    Sessions,
    Decisions,
    Patterns,
    Tasks,
    Knowledge,
    Actions,
}

impl From<RecordKindArg> for RecordKind {
    fn from(value: RecordKindArg) -> Self {
        match value {
            RecordKindArg::Sessions => Self::Sessions,
            RecordKindArg::Decisions => Self::Decisions,
            RecordKindArg::Patterns => Self::Patterns,
            RecordKindArg::Tasks => Self::Tasks,
            RecordKindArg::Knowledge => Self::Knowledge,
            RecordKindArg::Actions => Self::Actions,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ImportFormatArg {
    Json,
    Yaml,
}

impl From<ImportFormatArg> for ImportFormat {
    fn from(value: ImportFormatArg) -> Self {
        match value {
            ImportFormatArg::Json => Self::Json,
            ImportFormatArg::Yaml => Self::Yaml,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    Merge,
    Replace,
}

impl From<PolicyArg> for ConflictPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Merge => Self::Merge,
            PolicyArg::Replace => Self::Replace,
        }
    }
}

/// Executes a fully parsed CLI invocation.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let overrides = cli.overrides();
    match cli.command {
        Command::Project { command } => run_project_with_root(&cli.root, &overrides, *command),
    }
}

/// Opens the project under `root` and executes `command` against it.
///
/// # Errors
/// Returns an error when the configuration is invalid, the store cannot be
/// opened or the command fails.
pub fn run_project_with_root(
    root: &Path,
    overrides: &ConfigFile,
    command: ProjectCommand,
) -> Result<()> {
    let mut store = open_project(root, overrides)?;
    run_project(command, &mut store)
}

/// Executes a parsed project command against an open store.
///
/// # Errors
/// Returns an error when validation, persistence or output fails.
pub fn run_project(command: ProjectCommand, store: &mut JsonProjectStore) -> Result<()> {
    match command {
        ProjectCommand::Init => {
            let report = store.initialize()?;
            print_json(&json!({
                "root": store.paths().root,
                "storeFile": store.paths().store_file,
                "configFile": store.paths().config_file,
                "sync": report,
            }))
        }
        ProjectCommand::Session { command } => run_session(*command, store),
        ProjectCommand::Decision { command } => run_decision(*command, store),
        ProjectCommand::Pattern { command } => run_pattern(*command, store),
        ProjectCommand::Task { command } => run_task(*command, store),
        ProjectCommand::Knowledge { command } => match *command {
            KnowledgeCommand::Set(args) => {
                store.store_knowledge(&args.category, &args.key, &args.value)?;
                report_lifecycle(store);
                print_json(&json!({
                    "category": args.category,
                    "key": args.key,
                    "value": args.value,
                }))
            }
        },
        ProjectCommand::Action { command } => match *command {
            ActionCommand::Log(args) => {
                let details = parse_object_json("details-json", &args.details_json)?;
                let action_id = store.record_action(&args.action_type, details, args.result)?;
                report_lifecycle(store);
                print_json(&json!({ "actionId": action_id }))
            }
        },
        ProjectCommand::Search(args) => print_json(&store.search(&args.query)),
        ProjectCommand::Stats => print_json(&store.stats()),
        ProjectCommand::Sync => {
            let report = store.sync_document()?;
            report_lifecycle(store);
            print_json(&report)
        }
        ProjectCommand::Export(args) => {
            let options = ExportOptions {
                kinds: kinds_filter(&args.kinds),
                sanitize: args.sanitize,
            };
            let export = store.export(&options);
            match args.out {
                Some(path) => {
                    write_export(&path, &export)?;
                    print_json(&json!({
                        "exportVersion": EXPORT_VERSION,
                        "path": path,
                        "sanitized": export.sanitized,
                    }))
                }
                None => print_json(&export),
            }
        }
        ProjectCommand::Import(args) => {
            let document = read_import_file(&args.file, args.format.map(ImportFormat::from))?;
            let options = ImportOptions {
                policy: args.policy.into(),
                kinds: kinds_filter(&args.kinds),
                dry_run: args.dry_run,
                bare_kind: single_kind(&args.kinds),
            };
            let report = store.import(&document, &options)?;
            if !options.dry_run {
                report_lifecycle(store);
            }
            print_json(&report)
        }
        ProjectCommand::Backup { command } => run_backup(*command, store),
    }
}

fn run_session(command: SessionCommand, store: &mut JsonProjectStore) -> Result<()> {
    match command {
        SessionCommand::Start(args) => {
            let context = parse_object_json("context-json", &args.context_json)?;
            let session_id = store.start_session(args.name.as_deref(), context)?;
            report_lifecycle(store);
            print_json(&json!({ "sessionId": session_id }))
        }
        SessionCommand::End(args) => {
            let ended = store.end_session(args.outcome)?;
            print_json(&json!({ "ended": ended }))
        }
        SessionCommand::Context(args) => {
            let value = serde_json::from_str::<Value>(&args.value)
                .unwrap_or_else(|_| Value::String(args.value.clone()));
            let updated = store.set_session_context(&args.key, value)?;
            report_lifecycle(store);
            print_json(&json!({ "updated": updated }))
        }
    }
}

fn run_decision(command: DecisionCommand, store: &mut JsonProjectStore) -> Result<()> {
    match command {
        DecisionCommand::Add(args) => {
            let id = store.add_decision(&args.decision, &args.reasoning, args.alternatives)?;
            report_lifecycle(store);
            print_json(&json!({ "decisionId": id }))
        }
        DecisionCommand::Outcome(args) => {
            let updated = store.set_decision_outcome(&args.id, &args.outcome)?;
            report_lifecycle(store);
            print_json(&json!({ "updated": updated }))
        }
    }
}

fn run_pattern(command: PatternCommand, store: &mut JsonProjectStore) -> Result<()> {
    match command {
        PatternCommand::Record(args) => {
            let id = store.record_pattern(PatternInput {
                name: args.name,
                description: args.description,
                priority: args.priority,
                effectiveness: args.effectiveness,
                frequency: args.count,
            })?;
            report_lifecycle(store);
            let pattern = store
                .patterns()
                .iter()
                .find(|pattern| pattern.id == id)
                .ok_or_else(|| anyhow!("pattern {id} missing after record"))?;
            print_json(pattern)
        }
        PatternCommand::Resolve(args) => {
            let resolved = store.resolve_pattern(&args.pattern, &args.solution)?;
            report_lifecycle(store);
            print_json(&json!({ "resolved": resolved }))
        }
    }
}

fn run_task(command: TaskCommand, store: &mut JsonProjectStore) -> Result<()> {
    match command {
        TaskCommand::Add(args) => {
            let id = store.add_task(TaskInput {
                description: args.description,
                priority: args.priority,
                assignee: args.assignee,
                due_date: args.due_date,
            })?;
            report_lifecycle(store);
            let task = store
                .tasks()
                .iter()
                .find(|task| task.id == id)
                .ok_or_else(|| anyhow!("task {id} missing after add"))?;
            print_json(task)
        }
        TaskCommand::Update(args) => {
            let updated = store.update_task_status(&args.id, args.status.into())?;
            report_lifecycle(store);
            print_json(&json!({ "updated": updated }))
        }
    }
}

fn run_backup(command: BackupCommand, store: &mut JsonProjectStore) -> Result<()> {
    match command {
        BackupCommand::Run => print_json(&store.backup_now()?),
        BackupCommand::List => print_json(&store.list_backups()?),
        BackupCommand::Prune => print_json(&store.prune_backups()),
        BackupCommand::Restore(args) => {
            let restored = store.restore_backup(&args.name)?;
            print_json(&json!({ "restored": restored }))
        }
    }
}

fn kinds_filter(kinds: &[RecordKindArg]) -> Option<Vec<RecordKind>> {
    if kinds.is_empty() {
        None
    } else {
        Some(kinds.iter().copied().map(RecordKind::from).collect())
    }
}

fn single_kind(kinds: &[RecordKindArg]) -> Option<RecordKind> {
    match kinds {
        [kind] => Some((*kind).into()),
        _ => None,
    }
}

fn parse_object_json(flag: &str, raw: &str) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("--{flag} must be valid JSON"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("--{flag} must be a JSON object, got {other}")),
    }
}

fn report_lifecycle(store: &JsonProjectStore) {
    if store.config().silent_mode {
        return;
    }
    let report = store.last_lifecycle();
    for event in &report.rotations {
        match event {
            RotationEvent::Started { session_id, name } => {
                eprintln!("notice: started {name} ({session_id})");
            }
            RotationEvent::Rotated {
                ended_session_id,
                outcome,
                session_id,
                name,
            } => {
                eprintln!(
                    "notice: ended session {ended_session_id} ({outcome}); \
                     started {name} ({session_id})"
                );
            }
        }
    }
    if let Some(backup) = &report.backup {
        match (&backup.path, &backup.error) {
            (Some(path), _) => eprintln!("notice: backup written to {}", path.display()),
            (None, Some(error)) => eprintln!("notice: backup failed: {error}"),
            (None, None) => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
