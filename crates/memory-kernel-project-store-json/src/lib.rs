//! File-backed project memory store.
//!
//! [`JsonProjectStore`] owns the whole [`StoreSnapshot`] in memory and rewrites
//! `.project-memory/memory.json` atomically after every mutation. Each
//! mutation runs the same pipeline: session rotation, the change itself, one
//! appended action, backup bookkeeping, persistence, document regeneration
//! and finally the backup archive when one is due.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use memory_kernel_project_core::config::{ConfigFile, MemoryConfig};
use memory_kernel_project_core::lifecycle::{self, BackupReason, RotationEvent};
use memory_kernel_project_core::{
    ensure_non_empty, local_hour, new_unique_record_id, now_utc, Action, ActionKind, Decision,
    KnowledgeBase, KnowledgeEntry, Metadata, Pattern, PatternPriority, PatternStatus,
    ProjectError, RecordId, SearchResults, Session, StoreSnapshot, StoreStats, Task, TaskPriority,
    TaskStatus, BACKUPS_DIR_NAME, CONFIG_FILE_NAME, DOCS_DIR_NAME, DOC_BACKUPS_DIR_NAME,
    STATE_DIR_NAME, STORE_FILE_NAME, STORE_FORMAT_VERSION, SUMMARY_FILE_NAME,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

pub mod backup;
pub mod sync;
pub mod transfer;

use backup::{BackupManager, BackupRecord, PruneReport};
use sync::SyncReport;

pub const DEFAULT_PROJECT_NAME: &str = "project";

/// Source of the current instant and the local hour used for session names.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;

    fn local_hour(&self, at: OffsetDateTime) -> u8 {
        local_hour(at)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Every path the store touches under a project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub store_file: PathBuf,
    pub config_file: PathBuf,
    pub summary_file: PathBuf,
    pub docs_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub doc_backups_dir: PathBuf,
}

impl ProjectPaths {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join(STATE_DIR_NAME);
        Self {
            store_file: state_dir.join(STORE_FILE_NAME),
            config_file: state_dir.join(CONFIG_FILE_NAME),
            summary_file: root.join(SUMMARY_FILE_NAME),
            docs_dir: state_dir.join(DOCS_DIR_NAME),
            backups_dir: state_dir.join(BACKUPS_DIR_NAME),
            doc_backups_dir: state_dir.join(DOC_BACKUPS_DIR_NAME),
            state_dir,
            root,
        }
    }

    /// The root directory's name, used for stores created from scratch.
    #[must_use]
    pub fn project_name(&self) -> String {
        let named = |path: &Path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
        };
        named(&self.root)
            .or_else(|| fs::canonicalize(&self.root).ok().as_deref().and_then(named))
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternInput {
    pub name: String,
    pub description: String,
    /// Must name a pattern priority when present.
    pub priority: Option<String>,
    pub effectiveness: Option<f64>,
    /// Occurrences observed by this call. Defaults to one.
    pub frequency: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskInput {
    pub description: String,
    /// Unknown values fall back to medium.
    pub priority: Option<String>,
    pub assignee: Option<String>,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    #[serde(flatten)]
    pub reason: BackupReason,
    pub path: Option<PathBuf>,
    pub pruned: usize,
    pub error: Option<String>,
}

/// Automatic lifecycle work done by the most recent mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleReport {
    pub rotations: Vec<RotationEvent>,
    pub backup: Option<BackupOutcome>,
}

impl LifecycleReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rotations.is_empty() && self.backup.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct CommitOptions {
    rotate: bool,
    sync_document: bool,
}

const ROUTINE: CommitOptions = CommitOptions {
    rotate: true,
    sync_document: true,
};
const SESSION_CONTROL: CommitOptions = CommitOptions {
    rotate: false,
    sync_document: true,
};
const AUDIT: CommitOptions = CommitOptions {
    rotate: true,
    sync_document: false,
};

struct MutationContext {
    now: OffsetDateTime,
    session_id: Option<RecordId>,
}

struct Applied<T> {
    value: T,
    details: Map<String, Value>,
    result: Option<String>,
}

impl<T> Applied<T> {
    fn new(value: T, details: Map<String, Value>) -> Self {
        Self {
            value,
            details,
            result: None,
        }
    }
}

struct Committed<T> {
    value: T,
    action_id: RecordId,
    sync: Option<SyncReport>,
}

fn details(entries: Value) -> Map<String, Value> {
    match entries {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn fresh_id(snapshot: &StoreSnapshot, now: OffsetDateTime) -> RecordId {
    new_unique_record_id(now, |candidate| snapshot.contains_id(candidate))
}

pub struct JsonProjectStore {
    paths: ProjectPaths,
    config: MemoryConfig,
    snapshot: StoreSnapshot,
    pattern_index: HashMap<String, RecordId>,
    current_session: Option<RecordId>,
    existed_on_open: bool,
    clock: Box<dyn Clock>,
    lifecycle: LifecycleReport,
}

impl JsonProjectStore {
    /// Opens the store under `paths` with the system clock.
    ///
    /// # Errors
    /// Returns an error when `config` is invalid or a format-version rewrite
    /// fails.
    pub fn open(paths: ProjectPaths, config: MemoryConfig) -> Result<Self> {
        Self::open_with_clock(paths, config, Box::new(SystemClock))
    }

    /// Opens the store with an explicit clock.
    ///
    /// A missing or unreadable store file yields an empty store. A store
    /// written with another format version is rewritten immediately.
    ///
    /// # Errors
    /// Returns an error when `config` is invalid or a format-version rewrite
    /// fails.
    pub fn open_with_clock(
        paths: ProjectPaths,
        config: MemoryConfig,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let now = clock.now();
        let loaded = load_snapshot(&paths, now);

        let mut store = Self {
            paths,
            config,
            snapshot: loaded.snapshot,
            pattern_index: HashMap::new(),
            current_session: None,
            existed_on_open: loaded.existed,
            clock,
            lifecycle: LifecycleReport::default(),
        };
        store.reindex();

        if loaded.version_rewritten {
            store.persist()?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub fn snapshot(&self) -> &StoreSnapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn last_lifecycle(&self) -> &LifecycleReport {
        &self.lifecycle
    }

    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.snapshot.sessions
    }

    #[must_use]
    pub fn active_session(&self) -> Option<&Session> {
        self.snapshot.active_session()
    }

    #[must_use]
    pub fn current_session_id(&self) -> Option<&RecordId> {
        self.current_session.as_ref()
    }

    #[must_use]
    pub fn decisions(&self) -> &[Decision] {
        &self.snapshot.decisions
    }

    #[must_use]
    pub fn patterns(&self) -> &[Pattern] {
        &self.snapshot.patterns
    }

    #[must_use]
    pub fn patterns_with_status(&self, status: PatternStatus) -> Vec<&Pattern> {
        self.snapshot
            .patterns
            .iter()
            .filter(|pattern| pattern.status == status)
            .collect()
    }

    #[must_use]
    pub fn pattern_by_name(&self, name: &str) -> Option<&Pattern> {
        let id = self.pattern_index.get(name)?;
        self.snapshot.patterns.iter().find(|pattern| &pattern.id == id)
    }

    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.snapshot.tasks
    }

    #[must_use]
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.snapshot
            .tasks
            .iter()
            .filter(|task| task.status == status)
            .collect()
    }

    #[must_use]
    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.snapshot.knowledge
    }

    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.snapshot.actions
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.snapshot.metadata
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.snapshot.stats()
    }

    #[must_use]
    pub fn search(&self, query: &str) -> SearchResults {
        self.snapshot.search(query)
    }

    /// Writes the config file (when absent), the store file and the
    /// documents without recording an action.
    ///
    /// # Errors
    /// Returns an error when any file cannot be written.
    pub fn initialize(&mut self) -> Result<SyncReport> {
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!("failed to create {}", self.paths.state_dir.display())
        })?;
        if !self.paths.config_file.exists() {
            let body = serde_json::to_vec_pretty(&MemoryConfig::default())
                .context("failed to serialize default config")?;
            write_atomic(&self.paths.config_file, &body)?;
        }
        self.persist()?;
        let now = self.clock.now();
        self.sync_now(now)
    }

    /// Starts a session, ending the active one first.
    ///
    /// # Errors
    /// Returns an error for a blank name or when persistence fails.
    pub fn start_session(
        &mut self,
        name: Option<&str>,
        context: Map<String, Value>,
    ) -> Result<RecordId> {
        if let Some(name) = name {
            ensure_non_empty("session name", name)?;
        }
        let now = self.clock.now();
        let name = match name {
            Some(name) => name.to_string(),
            None => lifecycle::session_name_for_hour(self.clock.local_hour(now)).to_string(),
        };

        let committed = self.commit(
            now,
            ActionKind::SessionStarted.as_str(),
            SESSION_CONTROL,
            |snapshot, mutation| {
                let mut entries = details(json!({ "name": name }));
                if let Some(previous) = &mutation.session_id {
                    let outcome = format!(
                        "Completed {} actions",
                        snapshot.actions_for_session(previous)
                    );
                    lifecycle::end_session(snapshot, previous, Some(outcome), mutation.now);
                    entries.insert("endedSessionId".to_string(), json!(previous));
                }
                let id = lifecycle::start_session(snapshot, &name, context, mutation.now);
                Applied::new(id, entries)
            },
        )?;

        tracing::info!(session_id = %committed.value, "started session");
        Ok(committed.value)
    }

    /// Ends the active session. Returns `false` when none is active.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn end_session(&mut self, outcome: Option<String>) -> Result<bool> {
        let Some(active) = self.current_session.clone() else {
            return Ok(false);
        };
        let now = self.clock.now();

        self.commit(
            now,
            ActionKind::SessionEnded.as_str(),
            SESSION_CONTROL,
            |snapshot, mutation| {
                let outcome = outcome.unwrap_or_else(|| {
                    format!(
                        "Completed {} actions",
                        snapshot.actions_for_session(&active)
                    )
                });
                lifecycle::end_session(snapshot, &active, Some(outcome.clone()), mutation.now);
                Applied::new(
                    true,
                    details(json!({ "sessionId": active, "outcome": outcome })),
                )
            },
        )?;

        tracing::info!(session_id = %active, "ended session");
        Ok(true)
    }

    /// Sets one context entry on the active session. Returns `false` when
    /// none is active.
    ///
    /// # Errors
    /// Returns an error for a blank key or when persistence fails.
    pub fn set_session_context(&mut self, key: &str, value: Value) -> Result<bool> {
        ensure_non_empty("context key", key)?;
        if self.current_session.is_none() {
            return Ok(false);
        }
        let now = self.clock.now();

        let committed = self.commit(
            now,
            ActionKind::SessionContextUpdated.as_str(),
            ROUTINE,
            |snapshot, mutation| {
                let updated = mutation.session_id.as_ref().and_then(|id| {
                    snapshot
                        .sessions
                        .iter_mut()
                        .find(|session| &session.id == id)
                });
                let found = match updated {
                    Some(session) => {
                        session.context.insert(key.to_string(), value);
                        true
                    }
                    None => false,
                };
                Applied::new(found, details(json!({ "key": key })))
            },
        )?;
        Ok(committed.value)
    }

    /// Records a decision with a copy of the active session's context.
    ///
    /// # Errors
    /// Returns an error for blank text or when persistence fails.
    pub fn add_decision(
        &mut self,
        decision: &str,
        reasoning: &str,
        alternatives: Vec<String>,
    ) -> Result<RecordId> {
        ensure_non_empty("decision", decision)?;
        ensure_non_empty("reasoning", reasoning)?;
        let now = self.clock.now();

        let committed = self.commit(
            now,
            ActionKind::DecisionRecorded.as_str(),
            ROUTINE,
            |snapshot, mutation| {
                let context = mutation
                    .session_id
                    .as_ref()
                    .and_then(|id| snapshot.sessions.iter().find(|session| &session.id == id))
                    .map(|session| session.context.clone())
                    .unwrap_or_default();
                let id = fresh_id(snapshot, mutation.now);
                snapshot.decisions.push(Decision {
                    id: id.clone(),
                    session_id: mutation.session_id.clone(),
                    timestamp: mutation.now,
                    decision: decision.to_string(),
                    reasoning: reasoning.to_string(),
                    alternatives,
                    outcome: None,
                    context,
                });
                Applied::new(id.clone(), details(json!({ "decisionId": id })))
            },
        )?;
        Ok(committed.value)
    }

    /// Sets a decision's outcome. Returns `false` for an unknown id.
    ///
    /// # Errors
    /// Returns an error for a blank outcome or when persistence fails.
    pub fn set_decision_outcome(&mut self, id: &str, outcome: &str) -> Result<bool> {
        ensure_non_empty("outcome", outcome)?;
        if !self.snapshot.decisions.iter().any(|item| item.id.as_str() == id) {
            return Ok(false);
        }
        let now = self.clock.now();

        self.commit(
            now,
            ActionKind::DecisionOutcomeSet.as_str(),
            ROUTINE,
            |snapshot, _| {
                if let Some(decision) = snapshot
                    .decisions
                    .iter_mut()
                    .find(|item| item.id.as_str() == id)
                {
                    decision.outcome = Some(outcome.to_string());
                }
                Applied::new((), details(json!({ "decisionId": id })))
            },
        )?;
        Ok(true)
    }

    /// Records a new pattern or bumps the frequency of an existing one with
    /// the same name.
    ///
    /// # Errors
    /// Returns an error for a blank name, an unknown priority, an
    /// effectiveness outside `[0, 1]` or when persistence fails.
    pub fn record_pattern(&mut self, input: PatternInput) -> Result<RecordId> {
        ensure_non_empty("pattern", &input.name)?;
        let priority = match input.priority.as_deref() {
            Some(raw) => {
                let parsed = PatternPriority::parse(raw.trim().to_ascii_lowercase().as_str());
                Some(parsed.ok_or_else(|| {
                    ProjectError::Validation(format!(
                        "pattern priority MUST be one of critical, high, medium, low \
                         (got {raw:?})"
                    ))
                })?)
            }
            None => None,
        };
        if let Some(score) = input.effectiveness {
            if !(0.0..=1.0).contains(&score) {
                return Err(ProjectError::Validation(format!(
                    "effectiveness MUST be within [0, 1] (got {score})"
                ))
                .into());
            }
        }

        let amount = input.frequency.unwrap_or(1);
        if amount == 0 {
            return Err(
                ProjectError::Validation("pattern frequency MUST be at least 1".to_string()).into(),
            );
        }

        let existing = self.pattern_index.get(&input.name).cloned();
        let now = self.clock.now();

        let committed = self.commit(
            now,
            ActionKind::PatternRecorded.as_str(),
            ROUTINE,
            |snapshot, mutation| {
                let position = existing.and_then(|id| {
                    snapshot
                        .patterns
                        .iter()
                        .position(|pattern| pattern.id == id)
                });
                let (id, frequency) = if let Some(position) = position {
                    let pattern = &mut snapshot.patterns[position];
                    pattern.frequency = pattern.frequency.saturating_add(amount);
                    pattern.last_seen = mutation.now;
                    if let Some(priority) = priority {
                        pattern.priority = priority;
                    }
                    if input.effectiveness.is_some() {
                        pattern.effectiveness = input.effectiveness;
                    }
                    (pattern.id.clone(), pattern.frequency)
                } else {
                    let id = fresh_id(snapshot, mutation.now);
                    snapshot.patterns.push(Pattern {
                        id: id.clone(),
                        name: input.name.clone(),
                        description: input.description,
                        frequency: amount,
                        effectiveness: input.effectiveness,
                        priority: priority.unwrap_or(PatternPriority::Medium),
                        status: PatternStatus::Open,
                        first_seen: mutation.now,
                        last_seen: mutation.now,
                        solution: None,
                        resolved_at: None,
                    });
                    (id, amount)
                };
                Applied::new(
                    id.clone(),
                    details(json!({
                        "patternId": id,
                        "pattern": input.name,
                        "frequency": frequency,
                    })),
                )
            },
        )?;
        Ok(committed.value)
    }

    /// Resolves a pattern addressed by id or by name. Returns `false` when
    /// neither matches.
    ///
    /// # Errors
    /// Returns an error for a blank solution or when persistence fails.
    pub fn resolve_pattern(&mut self, id_or_name: &str, solution: &str) -> Result<bool> {
        ensure_non_empty("solution", solution)?;
        let target = self
            .snapshot
            .patterns
            .iter()
            .find(|pattern| pattern.id.as_str() == id_or_name)
            .map(|pattern| pattern.id.clone())
            .or_else(|| self.pattern_index.get(id_or_name).cloned());
        let Some(target) = target else {
            return Ok(false);
        };
        let now = self.clock.now();

        self.commit(
            now,
            ActionKind::PatternResolved.as_str(),
            ROUTINE,
            |snapshot, mutation| {
                if let Some(pattern) = snapshot
                    .patterns
                    .iter_mut()
                    .find(|pattern| pattern.id == target)
                {
                    pattern.status = PatternStatus::Resolved;
                    pattern.solution = Some(solution.to_string());
                    pattern.resolved_at = Some(mutation.now);
                }
                Applied::new((), details(json!({ "patternId": target })))
            },
        )?;
        Ok(true)
    }

    /// Adds an open task.
    ///
    /// # Errors
    /// Returns an error for a blank description or when persistence fails.
    pub fn add_task(&mut self, input: TaskInput) -> Result<RecordId> {
        ensure_non_empty("task description", &input.description)?;
        let priority = input
            .priority
            .as_deref()
            .map_or(TaskPriority::Medium, TaskPriority::coerce);
        let now = self.clock.now();

        let committed = self.commit(
            now,
            ActionKind::TaskCreated.as_str(),
            ROUTINE,
            |snapshot, mutation| {
                let id = fresh_id(snapshot, mutation.now);
                snapshot.tasks.push(Task {
                    id: id.clone(),
                    description: input.description,
                    priority,
                    status: TaskStatus::Open,
                    assignee: input.assignee,
                    due_date: input.due_date,
                    created_at: mutation.now,
                    completed_at: None,
                    session_id: mutation.session_id.clone(),
                });
                Applied::new(
                    id.clone(),
                    details(json!({ "taskId": id, "priority": priority.as_str() })),
                )
            },
        )?;
        Ok(committed.value)
    }

    /// Moves a task to `status`. Returns `false` for an unknown id.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn update_task_status(&mut self, id: &str, status: TaskStatus) -> Result<bool> {
        if !self.snapshot.tasks.iter().any(|task| task.id.as_str() == id) {
            return Ok(false);
        }
        let now = self.clock.now();

        self.commit(
            now,
            ActionKind::TaskUpdated.as_str(),
            ROUTINE,
            |snapshot, mutation| {
                if let Some(task) = snapshot.tasks.iter_mut().find(|task| task.id.as_str() == id) {
                    task.status = status;
                    task.completed_at =
                        (status == TaskStatus::Completed).then_some(mutation.now);
                }
                Applied::new(
                    (),
                    details(json!({ "taskId": id, "status": status.as_str() })),
                )
            },
        )?;
        Ok(true)
    }

    /// Stores a knowledge entry, replacing any previous value for the key.
    ///
    /// # Errors
    /// Returns an error for a blank category or key or when persistence fails.
    pub fn store_knowledge(&mut self, category: &str, key: &str, value: &str) -> Result<()> {
        ensure_non_empty("category", category)?;
        ensure_non_empty("key", key)?;
        let now = self.clock.now();

        self.commit(
            now,
            ActionKind::KnowledgeStored.as_str(),
            ROUTINE,
            |snapshot, mutation| {
                snapshot
                    .knowledge
                    .entry(category.to_string())
                    .or_default()
                    .insert(
                        key.to_string(),
                        KnowledgeEntry {
                            value: value.to_string(),
                            last_updated: mutation.now,
                            session_id: mutation.session_id.clone(),
                        },
                    );
                Applied::new((), details(json!({ "category": category, "key": key })))
            },
        )?;
        Ok(())
    }

    /// Appends a caller-supplied audit action. The summary document is not
    /// regenerated.
    ///
    /// # Errors
    /// Returns an error for a blank action type or when persistence fails.
    pub fn record_action(
        &mut self,
        action_type: &str,
        details: Map<String, Value>,
        result: Option<String>,
    ) -> Result<RecordId> {
        ensure_non_empty("action type", action_type)?;
        let now = self.clock.now();
        let committed = self.commit(now, action_type, AUDIT, |_, _| Applied {
            value: (),
            details,
            result,
        })?;
        Ok(committed.action_id)
    }

    /// Regenerates every document and records one `document_synced` action.
    ///
    /// # Errors
    /// Returns an error when the documents or the store cannot be written.
    pub fn sync_document(&mut self) -> Result<SyncReport> {
        let (_, scan) = sync::read_manual_sections(&self.paths.summary_file)?;
        let entries = details(json!({
            "manualSections": scan.sections.len(),
            "manualPreserved": !scan.sections.is_empty(),
            "issues": scan.issues.len(),
        }));
        let now = self.clock.now();

        let committed = self.commit(
            now,
            ActionKind::DocumentSynced.as_str(),
            ROUTINE,
            |_, _| Applied::new((), entries),
        )?;
        committed
            .sync
            .ok_or_else(|| anyhow!("document synchronization did not run"))
    }

    /// Archives the store and the summary now and resets the backup counter.
    ///
    /// # Errors
    /// Returns an error when the archive cannot be written; the backup
    /// metadata is restored first.
    pub fn backup_now(&mut self) -> Result<BackupOutcome> {
        let now = self.clock.now();
        let previous = self.mark_backed_up(now);
        if let Err(err) = self.persist() {
            let metadata = &mut self.snapshot.metadata;
            metadata.last_backup = previous.0;
            metadata.actions_since_backup = previous.1;
            return Err(err);
        }
        let outcome = self.archive(now, BackupReason::Manual, previous)?;
        if let Some(error) = &outcome.error {
            return Err(anyhow!("backup failed: {error}"));
        }
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error when the backups directory cannot be read.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        BackupManager::new(&self.paths).list()
    }

    #[must_use]
    pub fn prune_backups(&self) -> PruneReport {
        BackupManager::new(&self.paths).prune(self.clock.now(), self.config.max_backup_days)
    }

    /// Restores a named archive and reloads the store from it. Returns
    /// `false` when no archive has that name.
    ///
    /// # Errors
    /// Returns an error for an invalid name or when a copy fails.
    pub fn restore_backup(&mut self, name: &str) -> Result<bool> {
        if !BackupManager::new(&self.paths).restore(name)? {
            return Ok(false);
        }
        let loaded = load_snapshot(&self.paths, self.clock.now());
        self.snapshot = loaded.snapshot;
        self.existed_on_open = loaded.existed;
        self.reindex();
        if loaded.version_rewritten {
            self.persist()?;
        }
        Ok(true)
    }

    fn commit<T>(
        &mut self,
        now: OffsetDateTime,
        action_type: &str,
        options: CommitOptions,
        apply: impl FnOnce(&mut StoreSnapshot, &MutationContext) -> Applied<T>,
    ) -> Result<Committed<T>> {
        let rollback = self.snapshot.clone();
        let mut report = LifecycleReport::default();
        if options.rotate {
            let hour = self.clock.local_hour(now);
            report.rotations =
                lifecycle::rotate_sessions(&mut self.snapshot, &self.config, now, hour);
            for event in &report.rotations {
                log_rotation(event);
            }
        }

        let before = self.snapshot.active_session().map(|session| session.id.clone());
        let mutation = MutationContext {
            now,
            session_id: before.clone(),
        };
        let applied = apply(&mut self.snapshot, &mutation);
        let after = self.snapshot.active_session().map(|session| session.id.clone());

        let action_id = fresh_id(&self.snapshot, now);
        self.snapshot.actions.push(Action {
            id: action_id.clone(),
            session_id: after.or(before),
            timestamp: now,
            action_type: action_type.to_string(),
            details: applied.details,
            result: applied.result,
        });
        let metadata = &mut self.snapshot.metadata;
        metadata.actions_since_backup = metadata.actions_since_backup.saturating_add(1);
        metadata.last_updated = now;
        self.reindex();

        let due = lifecycle::backup_due(
            &self.snapshot.metadata,
            &self.config,
            now,
            self.existed_on_open,
        );
        let previous = due.map(|_| self.mark_backed_up(now));

        if let Err(err) = self.persist() {
            self.snapshot = rollback;
            self.reindex();
            return Err(err);
        }
        let sync = if options.sync_document {
            Some(self.sync_now(now)?)
        } else {
            None
        };

        if let (Some(reason), Some(previous)) = (due, previous) {
            report.backup = Some(self.archive(now, reason, previous)?);
        }
        self.lifecycle = report;

        Ok(Committed {
            value: applied.value,
            action_id,
            sync,
        })
    }

    /// Stamps the backup metadata and returns the values it replaced.
    fn mark_backed_up(&mut self, now: OffsetDateTime) -> (Option<OffsetDateTime>, u64) {
        let metadata = &mut self.snapshot.metadata;
        let previous = (metadata.last_backup, metadata.actions_since_backup);
        metadata.last_backup = Some(now);
        metadata.actions_since_backup = 0;
        previous
    }

    /// Writes the archive. A failure is logged, the previous backup
    /// metadata is restored and persisted, and the error is reported in the
    /// outcome instead of being raised.
    fn archive(
        &mut self,
        now: OffsetDateTime,
        reason: BackupReason,
        previous: (Option<OffsetDateTime>, u64),
    ) -> Result<BackupOutcome> {
        let manager = BackupManager::new(&self.paths);
        match manager.backup(now) {
            Ok(path) => {
                let pruned = manager.prune(now, self.config.max_backup_days);
                tracing::info!(
                    ?reason,
                    path = %path.display(),
                    pruned = pruned.removed,
                    "backup complete"
                );
                Ok(BackupOutcome {
                    reason,
                    path: Some(path),
                    pruned: pruned.removed,
                    error: None,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(
                    ?reason,
                    error = %message,
                    "backup failed; retrying on the next mutation"
                );
                let metadata = &mut self.snapshot.metadata;
                metadata.last_backup = previous.0;
                metadata.actions_since_backup = previous.1;
                self.persist()?;
                Ok(BackupOutcome {
                    reason,
                    path: None,
                    pruned: 0,
                    error: Some(message),
                })
            }
        }
    }

    fn sync_now(&self, now: OffsetDateTime) -> Result<SyncReport> {
        sync::sync_documents(
            &self.paths,
            &self.snapshot,
            self.config.token_optimization,
            now,
        )
    }

    fn persist(&self) -> Result<()> {
        let body =
            serde_json::to_vec_pretty(&self.snapshot).context("failed to serialize store")?;
        write_atomic(&self.paths.store_file, &body)?;
        tracing::debug!(
            path = %self.paths.store_file.display(),
            actions = self.snapshot.actions.len(),
            "persisted store"
        );
        Ok(())
    }

    fn reindex(&mut self) {
        self.pattern_index = self
            .snapshot
            .patterns
            .iter()
            .map(|pattern| (pattern.name.clone(), pattern.id.clone()))
            .collect();
        self.current_session = self
            .snapshot
            .active_session()
            .map(|session| session.id.clone());
    }
}

fn log_rotation(event: &RotationEvent) {
    match event {
        RotationEvent::Started { session_id, name } => {
            tracing::info!(%session_id, %name, "auto-started session");
        }
        RotationEvent::Rotated {
            ended_session_id,
            outcome,
            session_id,
            name,
        } => {
            tracing::info!(
                %ended_session_id,
                %outcome,
                %session_id,
                %name,
                "rotated stale session"
            );
        }
    }
}

struct LoadedSnapshot {
    snapshot: StoreSnapshot,
    existed: bool,
    version_rewritten: bool,
}

fn load_snapshot(paths: &ProjectPaths, now: OffsetDateTime) -> LoadedSnapshot {
    let empty = || LoadedSnapshot {
        snapshot: StoreSnapshot::empty(&paths.project_name(), now),
        existed: false,
        version_rewritten: false,
    };

    let body = match fs::read_to_string(&paths.store_file) {
        Ok(body) => body,
        Err(err) if err.kind() == ErrorKind::NotFound => return empty(),
        Err(err) => {
            tracing::warn!(
                path = %paths.store_file.display(),
                error = %err,
                "failed to read store; starting empty"
            );
            return empty();
        }
    };

    match serde_json::from_str::<StoreSnapshot>(&body) {
        Ok(mut snapshot) => {
            let version_rewritten = snapshot.metadata.version != STORE_FORMAT_VERSION;
            if version_rewritten {
                tracing::info!(
                    found = %snapshot.metadata.version,
                    current = STORE_FORMAT_VERSION,
                    "rewriting store with current format version"
                );
                snapshot.metadata.version = STORE_FORMAT_VERSION.to_string();
            }
            LoadedSnapshot {
                snapshot,
                existed: true,
                version_rewritten,
            }
        }
        Err(err) => {
            tracing::warn!(
                path = %paths.store_file.display(),
                error = %err,
                "failed to parse store; starting empty"
            );
            empty()
        }
    }
}

/// Reads a config file. Missing or invalid files yield an empty config.
#[must_use]
pub fn load_config(path: &Path) -> ConfigFile {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == ErrorKind::NotFound => return ConfigFile::default(),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read config; using defaults"
            );
            return ConfigFile::default();
        }
    };
    match ConfigFile::from_json_str(&body) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "invalid config; using defaults");
            ConfigFile::default()
        }
    }
}

/// Opens the project under `root`, layering `overrides` over its config file.
///
/// # Errors
/// Returns an error when the merged configuration is invalid or the store
/// cannot be opened.
pub fn open_project(root: impl AsRef<Path>, overrides: &ConfigFile) -> Result<JsonProjectStore> {
    let paths = ProjectPaths::new(root);
    let config = load_config(&paths.config_file).resolve(overrides)?;
    JsonProjectStore::open(paths, config)
}

/// Replaces `path` with `bytes` through a synced temporary sibling.
///
/// # Errors
/// Returns an error when any step of the write fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut tmp_name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .ok_or_else(|| anyhow!("invalid file path: {}", path.display()))?;
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    drop(file);

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            path.display()
        )
    })
}
