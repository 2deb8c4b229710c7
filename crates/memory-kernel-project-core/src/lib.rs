//! Domain model for the project memory kernel.
//!
//! Everything in this crate is pure: records and their enumerations, id and
//! timestamp helpers, configuration resolution, lifecycle planning, document
//! synthesis, manual-section merging and import validation. Persistence lives
//! in `memory-kernel-project-store-json`.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod config;
pub mod document;
pub mod lifecycle;
pub mod sections;
pub mod transfer;

pub const STORE_FORMAT_VERSION: &str = "1.0.0";
pub const RECORD_ID_LEN: usize = 8;

pub const STATE_DIR_NAME: &str = ".project-memory";
pub const STORE_FILE_NAME: &str = "memory.json";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const SUMMARY_FILE_NAME: &str = "PROJECT_MEMORY.md";
pub const DOCS_DIR_NAME: &str = "docs";
pub const BACKUPS_DIR_NAME: &str = "backups";
pub const DOC_BACKUPS_DIR_NAME: &str = "doc-backups";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProjectError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(
        "import rejected with {} violation(s): {}",
        .0.len(),
        transfer::describe_violations(.0)
    )]
    InvalidImport(Vec<transfer::ImportViolation>),
    #[error("format error: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl PatternPriority {
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Open,
    Resolved,
}

impl PatternStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Lenient parse used by interactive task creation: anything unknown is
    /// treated as medium.
    #[must_use]
    pub fn coerce(value: &str) -> Self {
        Self::parse(value.trim().to_ascii_lowercase().as_str()).unwrap_or(Self::Medium)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Completed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "in-progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Collections addressable by export filters and import documents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Sessions,
    Decisions,
    Patterns,
    Tasks,
    Knowledge,
    Actions,
}

impl RecordKind {
    pub const ALL: [Self; 6] = [
        Self::Sessions,
        Self::Decisions,
        Self::Patterns,
        Self::Tasks,
        Self::Knowledge,
        Self::Actions,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::Decisions => "decisions",
            Self::Patterns => "patterns",
            Self::Tasks => "tasks",
            Self::Knowledge => "knowledge",
            Self::Actions => "actions",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sessions" | "session" => Some(Self::Sessions),
            "decisions" | "decision" => Some(Self::Decisions),
            "patterns" | "pattern" => Some(Self::Patterns),
            "tasks" | "task" => Some(Self::Tasks),
            "knowledge" => Some(Self::Knowledge),
            "actions" | "action" => Some(Self::Actions),
            _ => None,
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tags the store writes into `Action::action_type`. Caller-logged actions
/// may carry any other tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ActionKind {
    SessionStarted,
    SessionEnded,
    SessionContextUpdated,
    DecisionRecorded,
    DecisionOutcomeSet,
    PatternRecorded,
    PatternResolved,
    TaskCreated,
    TaskUpdated,
    KnowledgeStored,
    DocumentSynced,
    Imported,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionEnded => "session_ended",
            Self::SessionContextUpdated => "session_context_updated",
            Self::DecisionRecorded => "decision_recorded",
            Self::DecisionOutcomeSet => "decision_outcome_set",
            Self::PatternRecorded => "pattern_recorded",
            Self::PatternResolved => "pattern_resolved",
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::KnowledgeStored => "knowledge_stored",
            Self::DocumentSynced => "document_synced",
            Self::Imported => "imported",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: RecordId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub status: SessionStatus,
    #[serde(default)]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: RecordId,
    #[serde(default)]
    pub session_id: Option<RecordId>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub decision: String,
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub id: RecordId,
    #[serde(rename = "pattern")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub frequency: u64,
    #[serde(default)]
    pub effectiveness: Option<f64>,
    pub priority: PatternPriority,
    pub status: PatternStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: RecordId,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub session_id: Option<RecordId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    #[serde(default)]
    pub session_id: Option<RecordId>,
}

/// `category -> key -> entry`. Ordered maps keep rendering deterministic.
pub type KnowledgeBase = BTreeMap<String, BTreeMap<String, KnowledgeEntry>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: RecordId,
    #[serde(default)]
    pub session_id: Option<RecordId>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub action_type: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    pub version: String,
    pub project_name: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_backup: Option<OffsetDateTime>,
    #[serde(default)]
    pub actions_since_backup: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl Metadata {
    #[must_use]
    pub fn fresh(project_name: &str, now: OffsetDateTime) -> Self {
        Self {
            created: now,
            version: STORE_FORMAT_VERSION.to_string(),
            project_name: project_name.to_string(),
            last_backup: None,
            actions_since_backup: 0,
            last_updated: now,
        }
    }
}

/// The complete persisted form of a project store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub knowledge: KnowledgeBase,
    #[serde(flatten)]
    pub metadata: Metadata,
}

impl StoreSnapshot {
    #[must_use]
    pub fn empty(project_name: &str, now: OffsetDateTime) -> Self {
        Self {
            sessions: Vec::new(),
            decisions: Vec::new(),
            patterns: Vec::new(),
            actions: Vec::new(),
            tasks: Vec::new(),
            knowledge: KnowledgeBase::new(),
            metadata: Metadata::fresh(project_name, now),
        }
    }

    #[must_use]
    pub fn active_session(&self) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|session| session.status == SessionStatus::Active)
    }

    #[must_use]
    pub fn contains_id(&self, id: &str) -> bool {
        self.sessions.iter().any(|item| item.id.as_str() == id)
            || self.decisions.iter().any(|item| item.id.as_str() == id)
            || self.patterns.iter().any(|item| item.id.as_str() == id)
            || self.tasks.iter().any(|item| item.id.as_str() == id)
            || self.actions.iter().any(|item| item.id.as_str() == id)
    }

    #[must_use]
    pub fn actions_for_session(&self, session_id: &RecordId) -> usize {
        self.actions
            .iter()
            .filter(|action| action.session_id.as_ref() == Some(session_id))
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            sessions: self.sessions.len(),
            active_sessions: self
                .sessions
                .iter()
                .filter(|session| session.status == SessionStatus::Active)
                .count(),
            decisions: self.decisions.len(),
            patterns: self.patterns.len(),
            open_patterns: self
                .patterns
                .iter()
                .filter(|pattern| pattern.status == PatternStatus::Open)
                .count(),
            tasks: self.tasks.len(),
            open_tasks: self
                .tasks
                .iter()
                .filter(|task| task.status != TaskStatus::Completed)
                .count(),
            knowledge_categories: self.knowledge.len(),
            knowledge_entries: self.knowledge.values().map(BTreeMap::len).sum(),
            actions: self.actions.len(),
            actions_since_backup: self.metadata.actions_since_backup,
        }
    }

    /// Case-insensitive substring search. The empty query matches everything.
    #[must_use]
    pub fn search(&self, query: &str) -> SearchResults {
        let needle = query.trim().to_lowercase();
        let hit = |text: &str| needle.is_empty() || text.to_lowercase().contains(&needle);

        SearchResults {
            query: query.to_string(),
            decisions: self
                .decisions
                .iter()
                .filter(|item| hit(&item.decision) || hit(&item.reasoning))
                .cloned()
                .collect(),
            patterns: self
                .patterns
                .iter()
                .filter(|item| hit(&item.name) || hit(&item.description))
                .cloned()
                .collect(),
            tasks: self
                .tasks
                .iter()
                .filter(|item| hit(&item.description) || item.assignee.as_deref().is_some_and(hit))
                .cloned()
                .collect(),
            knowledge: self
                .knowledge
                .iter()
                .flat_map(|(category, entries)| {
                    entries.iter().map(move |(key, entry)| KnowledgeHit {
                        category: category.clone(),
                        key: key.clone(),
                        entry: entry.clone(),
                    })
                })
                .filter(|item| hit(&item.key) || hit(&item.entry.value))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub sessions: usize,
    pub active_sessions: usize,
    pub decisions: usize,
    pub patterns: usize,
    pub open_patterns: usize,
    pub tasks: usize,
    pub open_tasks: usize,
    pub knowledge_categories: usize,
    pub knowledge_entries: usize,
    pub actions: usize,
    pub actions_since_backup: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeHit {
    pub category: String,
    pub key: String,
    pub entry: KnowledgeEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResults {
    pub query: String,
    pub decisions: Vec<Decision>,
    pub patterns: Vec<Pattern>,
    pub tasks: Vec<Task>,
    pub knowledge: Vec<KnowledgeHit>,
}

impl SearchResults {
    #[must_use]
    pub fn total(&self) -> usize {
        self.decisions.len() + self.patterns.len() + self.tasks.len() + self.knowledge.len()
    }
}

/// Derives a short record id from the creation instant and a random ULID.
#[must_use]
pub fn new_record_id(now: OffsetDateTime) -> RecordId {
    let mut hasher = Sha256::new();
    hasher.update(now.unix_timestamp_nanos().to_be_bytes());
    hasher.update(Ulid::new().to_bytes());
    let mut encoded = hex::encode(hasher.finalize());
    encoded.truncate(RECORD_ID_LEN);
    RecordId(encoded)
}

/// Generates ids until one is not reported as taken.
#[must_use]
pub fn new_unique_record_id(now: OffsetDateTime, taken: impl Fn(&str) -> bool) -> RecordId {
    loop {
        let candidate = new_record_id(now);
        if !taken(candidate.as_str()) {
            return candidate;
        }
    }
}

/// Ensures a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`ProjectError::Validation`] when the value is blank.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), ProjectError> {
    if value.trim().is_empty() {
        return Err(ProjectError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`ProjectError::Validation`] when parsing fails.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProjectError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| ProjectError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ProjectError::Format`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProjectError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ProjectError::Format(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Hour of day in the machine's local offset, falling back to UTC when the
/// offset cannot be determined.
#[must_use]
pub fn local_hour(value: OffsetDateTime) -> u8 {
    let offset = UtcOffset::local_offset_at(value).unwrap_or(UtcOffset::UTC);
    value.to_offset(offset).hour()
}
