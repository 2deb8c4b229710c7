//! Export snapshots and import validation.
//!
//! Import runs in two steps. [`plan_import`] reads an untyped document, checks
//! every record and either returns typed records or every violation found.
//! [`apply_import`] then folds a plan into a snapshot under a conflict policy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{
    new_unique_record_id, parse_rfc3339_utc, Action, Decision, KnowledgeBase, KnowledgeEntry,
    KnowledgeHit, Metadata, Pattern, PatternPriority, PatternStatus, ProjectError, RecordId,
    RecordKind, Session, SessionStatus, StoreSnapshot, Task, TaskPriority, TaskStatus,
};

pub const EXPORT_VERSION: &str = "v1";
pub const REDACTED: &str = "[REDACTED]";
pub const SENSITIVE_KEYS: [&str; 6] = ["user", "username", "author", "email", "assignee", "owner"];

/// Top-level keys of an export or store file that carry no records.
const ENVELOPE_KEYS: [&str; 10] = [
    "exportVersion",
    "exportedAt",
    "sanitized",
    "metadata",
    "created",
    "version",
    "projectName",
    "lastBackup",
    "actionsSinceBackup",
    "lastUpdated",
];

const MAX_REPORTED_VALUE_CHARS: usize = 80;
const MAX_DESCRIBED_VIOLATIONS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// `None` exports every kind.
    pub kinds: Option<Vec<RecordKind>>,
    pub sanitize: bool,
}

impl ExportOptions {
    #[must_use]
    pub fn includes(&self, kind: RecordKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSnapshot {
    pub export_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    pub sanitized: bool,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<Session>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decisions: Option<Vec<Decision>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<Pattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge: Option<KnowledgeBase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
}

#[must_use]
pub fn build_export(
    snapshot: &StoreSnapshot,
    options: &ExportOptions,
    now: OffsetDateTime,
) -> ExportSnapshot {
    let mut export = ExportSnapshot {
        export_version: EXPORT_VERSION.to_string(),
        exported_at: now,
        sanitized: options.sanitize,
        metadata: snapshot.metadata.clone(),
        sessions: options
            .includes(RecordKind::Sessions)
            .then(|| snapshot.sessions.clone()),
        decisions: options
            .includes(RecordKind::Decisions)
            .then(|| snapshot.decisions.clone()),
        patterns: options
            .includes(RecordKind::Patterns)
            .then(|| snapshot.patterns.clone()),
        tasks: options
            .includes(RecordKind::Tasks)
            .then(|| snapshot.tasks.clone()),
        knowledge: options
            .includes(RecordKind::Knowledge)
            .then(|| snapshot.knowledge.clone()),
        actions: options
            .includes(RecordKind::Actions)
            .then(|| snapshot.actions.clone()),
    };

    if options.sanitize {
        sanitize_export(&mut export);
    }
    export
}

fn sanitize_export(export: &mut ExportSnapshot) {
    for session in export.sessions.iter_mut().flatten() {
        redact_map(&mut session.context);
    }
    for decision in export.decisions.iter_mut().flatten() {
        redact_map(&mut decision.context);
    }
    for task in export.tasks.iter_mut().flatten() {
        if task.assignee.is_some() {
            task.assignee = Some(REDACTED.to_string());
        }
    }
    for action in export.actions.iter_mut().flatten() {
        redact_map(&mut action.details);
    }
}

fn is_sensitive(key: &str) -> bool {
    SENSITIVE_KEYS
        .iter()
        .any(|sensitive| sensitive.eq_ignore_ascii_case(key))
}

/// Replaces sensitive values at any depth.
pub fn redact_map(map: &mut Map<String, Value>) {
    for (key, value) in map.iter_mut() {
        if is_sensitive(key) {
            *value = Value::String(REDACTED.to_string());
        } else if let Value::Object(nested) = value {
            redact_map(nested);
        } else if let Value::Array(items) = value {
            for item in items {
                if let Value::Object(nested) = item {
                    redact_map(nested);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    Json,
    Yaml,
}

impl ImportFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|extension| extension.to_str())
            .and_then(Self::parse)
    }

    /// JSON documents start with a bracket; anything else is read as YAML.
    #[must_use]
    pub fn detect(body: &str) -> Self {
        match body.trim_start().chars().next() {
            Some('{' | '[') => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Decodes an import body into an untyped document.
///
/// # Errors
/// Returns [`ProjectError::Format`] when the body is not valid in `format`.
pub fn parse_import_document(body: &str, format: ImportFormat) -> Result<Value, ProjectError> {
    match format {
        ImportFormat::Json => serde_json::from_str(body)
            .map_err(|err| ProjectError::Format(format!("invalid JSON import document: {err}"))),
        ImportFormat::Yaml => serde_yaml::from_str(body)
            .map_err(|err| ProjectError::Format(format!("invalid YAML import document: {err}"))),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Merge,
    Replace,
}

impl ConflictPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "merge" => Some(Self::Merge),
            "replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    pub policy: ConflictPolicy,
    /// Restricts the import to these kinds. Under `Replace` the listed
    /// collections are discarded even when the input has no records for them.
    pub kinds: Option<Vec<RecordKind>>,
    pub dry_run: bool,
    /// Kind of the records when the document is a bare array.
    pub bare_kind: Option<RecordKind>,
}

impl ImportOptions {
    fn accepts(&self, kind: RecordKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportViolation {
    pub kind: Option<RecordKind>,
    pub index: Option<String>,
    pub field: Option<String>,
    pub value: Option<String>,
    pub message: String,
}

impl Display for ImportViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(kind) = self.kind {
            write!(f, "{kind}")?;
            if let Some(index) = &self.index {
                write!(f, "[{index}]")?;
            }
            if let Some(field) = &self.field {
                write!(f, ".{field}")?;
            }
            f.write_str(": ")?;
        }
        f.write_str(&self.message)?;
        if let Some(value) = &self.value {
            write!(f, " (got {value})")?;
        }
        Ok(())
    }
}

#[must_use]
pub fn describe_violations(violations: &[ImportViolation]) -> String {
    let mut parts: Vec<String> = violations
        .iter()
        .take(MAX_DESCRIBED_VIOLATIONS)
        .map(ToString::to_string)
        .collect();
    if violations.len() > MAX_DESCRIBED_VIOLATIONS {
        parts.push(format!(
            "and {} more",
            violations.len() - MAX_DESCRIBED_VIOLATIONS
        ));
    }
    parts.join("; ")
}

fn document_violation(message: impl Into<String>) -> ImportViolation {
    ImportViolation {
        kind: None,
        index: None,
        field: None,
        value: None,
        message: message.into(),
    }
}

fn render_value(value: &Value) -> String {
    crate::document::truncate(&value.to_string(), MAX_REPORTED_VALUE_CHARS)
}

/// Typed records ready to apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportPlan {
    pub sessions: Vec<Session>,
    pub decisions: Vec<Decision>,
    pub patterns: Vec<Pattern>,
    pub tasks: Vec<Task>,
    pub knowledge: Vec<KnowledgeHit>,
    pub actions: Vec<Action>,
    /// Kinds that appeared in the input and passed the kind filter.
    pub present: BTreeSet<RecordKind>,
}

impl ImportPlan {
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.sessions.len()
            + self.decisions.len()
            + self.patterns.len()
            + self.tasks.len()
            + self.knowledge.len()
            + self.actions.len()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindCounts {
    pub added: usize,
    pub skipped: usize,
    pub replaced: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub dry_run: bool,
    pub policy: ConflictPolicy,
    pub kinds: BTreeMap<RecordKind, KindCounts>,
}

impl ImportReport {
    #[must_use]
    pub fn added(&self) -> usize {
        self.kinds.values().map(|counts| counts.added).sum()
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.kinds.values().map(|counts| counts.skipped).sum()
    }

    #[must_use]
    pub fn replaced(&self) -> usize {
        self.kinds.values().map(|counts| counts.replaced).sum()
    }
}

struct PlanBuilder<'a> {
    existing: &'a StoreSnapshot,
    options: &'a ImportOptions,
    now: OffsetDateTime,
    plan: ImportPlan,
    violations: Vec<ImportViolation>,
    seen_ids: BTreeSet<String>,
}

struct Fields<'a, 'b> {
    kind: RecordKind,
    index: String,
    object: &'a Map<String, Value>,
    violations: &'b mut Vec<ImportViolation>,
}

impl<'a> Fields<'a, '_> {
    fn report(&mut self, field: &str, value: Option<&Value>, message: impl Into<String>) {
        self.violations.push(ImportViolation {
            kind: Some(self.kind),
            index: Some(self.index.clone()),
            field: Some(field.to_string()),
            value: value.map(render_value),
            message: message.into(),
        });
    }

    fn raw(&self, field: &str) -> Option<&'a Value> {
        self.object.get(field).filter(|value| !value.is_null())
    }

    fn required_text(&mut self, field: &str) -> Option<String> {
        match self.raw(field) {
            Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
            Some(other) if !other.is_string() => {
                self.report(field, Some(other), "must be a string");
                None
            }
            other => {
                self.report(field, other, "is required");
                None
            }
        }
    }

    fn optional_text(&mut self, field: &str) -> Option<String> {
        match self.raw(field) {
            None => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => {
                self.report(field, Some(other), "must be a string");
                None
            }
        }
    }

    fn timestamp(&mut self, field: &str) -> Option<OffsetDateTime> {
        let value = self.raw(field)?;
        let parsed = value.as_str().map(parse_rfc3339_utc);
        match parsed {
            Some(Ok(timestamp)) => Some(timestamp),
            _ => {
                self.report(field, Some(value), "must be an RFC 3339 timestamp");
                None
            }
        }
    }

    fn required_timestamp(&mut self, field: &str) -> Option<OffsetDateTime> {
        if self.raw(field).is_none() {
            self.report(field, None, "is required");
            return None;
        }
        self.timestamp(field)
    }

    fn enumeration<T: Copy>(
        &mut self,
        field: &str,
        default: T,
        allowed: &str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> T {
        let Some(value) = self.raw(field) else {
            return default;
        };
        match value.as_str().and_then(parse) {
            Some(parsed) => parsed,
            None => {
                self.report(field, Some(value), format!("must be one of {allowed}"));
                default
            }
        }
    }

    fn object(&mut self, field: &str) -> Map<String, Value> {
        match self.raw(field) {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                self.report(field, Some(other), "must be an object");
                Map::new()
            }
        }
    }

    fn text_list(&mut self, field: &str) -> Vec<String> {
        match self.raw(field) {
            None => Vec::new(),
            Some(Value::Array(items)) if items.iter().all(Value::is_string) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Some(other) => {
                self.report(field, Some(other), "must be an array of strings");
                Vec::new()
            }
        }
    }

    fn record_id(&mut self, field: &str) -> Option<RecordId> {
        self.optional_text(field)
            .filter(|id| !id.trim().is_empty())
            .map(RecordId)
    }
}

impl<'a> PlanBuilder<'a> {
    fn new(existing: &'a StoreSnapshot, options: &'a ImportOptions, now: OffsetDateTime) -> Self {
        Self {
            existing,
            options,
            now,
            plan: ImportPlan::default(),
            violations: Vec::new(),
            seen_ids: BTreeSet::new(),
        }
    }

    fn read_kind(&mut self, kind: RecordKind, value: &Value) {
        if !self.options.accepts(kind) {
            return;
        }
        self.plan.present.insert(kind);

        match (kind, value) {
            (_, Value::Null) => {}
            (RecordKind::Knowledge, Value::Object(categories)) => {
                self.read_nested_knowledge(categories);
            }
            (_, Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    self.read_record(kind, index.to_string(), item);
                }
            }
            (_, other) => self.violations.push(ImportViolation {
                kind: Some(kind),
                index: None,
                field: None,
                value: Some(render_value(other)),
                message: "must be an array of records".to_string(),
            }),
        }
    }

    fn read_record(&mut self, kind: RecordKind, index: String, item: &Value) {
        let Value::Object(object) = item else {
            self.violations.push(ImportViolation {
                kind: Some(kind),
                index: Some(index),
                field: None,
                value: Some(render_value(item)),
                message: "record must be an object".to_string(),
            });
            return;
        };

        let label = index.clone();
        let mut fields = Fields {
            kind,
            index,
            object,
            violations: &mut self.violations,
        };

        match kind {
            RecordKind::Sessions => {
                let id = fields.record_id("id");
                let name = fields.required_text("name");
                let start_time = fields.required_timestamp("startTime");
                let end_time = fields.timestamp("endTime");
                let status = fields.enumeration(
                    "status",
                    SessionStatus::Completed,
                    "active, completed",
                    SessionStatus::parse,
                );
                let context = fields.object("context");
                let outcome = fields.optional_text("outcome");
                if let (Some(name), Some(start_time)) = (name, start_time) {
                    let id = self.claim_id(kind, id, &label);
                    self.plan.sessions.push(Session {
                        id,
                        name,
                        start_time,
                        end_time,
                        context,
                        status,
                        outcome,
                    });
                }
            }
            RecordKind::Decisions => {
                let id = fields.record_id("id");
                let session_id = fields.record_id("sessionId");
                let timestamp = fields.timestamp("timestamp").unwrap_or(self.now);
                let decision = fields.required_text("decision");
                let reasoning = fields.required_text("reasoning");
                let alternatives = fields.text_list("alternatives");
                let outcome = fields.optional_text("outcome");
                let context = fields.object("context");
                if let (Some(decision), Some(reasoning)) = (decision, reasoning) {
                    let id = self.claim_id(kind, id, &label);
                    self.plan.decisions.push(Decision {
                        id,
                        session_id,
                        timestamp,
                        decision,
                        reasoning,
                        alternatives,
                        outcome,
                        context,
                    });
                }
            }
            RecordKind::Patterns => {
                let id = fields.record_id("id");
                let name = fields.required_text("pattern");
                let description = fields.optional_text("description").unwrap_or_default();
                let frequency = match fields.raw("frequency") {
                    None => 1,
                    Some(value) => match value.as_u64() {
                        Some(frequency) if frequency >= 1 => frequency,
                        _ => {
                            fields.report("frequency", Some(value), "must be a positive integer");
                            1
                        }
                    },
                };
                let effectiveness = match fields.raw("effectiveness") {
                    None => None,
                    Some(value) => match value.as_f64() {
                        Some(score) if (0.0..=1.0).contains(&score) => Some(score),
                        _ => {
                            fields.report("effectiveness", Some(value), "must be within [0, 1]");
                            None
                        }
                    },
                };
                let priority = fields.enumeration(
                    "priority",
                    PatternPriority::Medium,
                    "critical, high, medium, low",
                    PatternPriority::parse,
                );
                let status = fields.enumeration(
                    "status",
                    PatternStatus::Open,
                    "open, resolved",
                    PatternStatus::parse,
                );
                let first_seen = fields.timestamp("firstSeen").unwrap_or(self.now);
                let last_seen = fields.timestamp("lastSeen").unwrap_or(first_seen);
                let solution = fields.optional_text("solution");
                let resolved_at = fields.timestamp("resolvedAt");
                if let Some(name) = name {
                    if self.plan.patterns.iter().any(|pattern| pattern.name == name) {
                        self.violations.push(ImportViolation {
                            kind: Some(kind),
                            index: Some(label),
                            field: Some("pattern".to_string()),
                            value: Some(name),
                            message: "pattern names must be unique".to_string(),
                        });
                        return;
                    }
                    let id = self.claim_id(kind, id, &label);
                    self.plan.patterns.push(Pattern {
                        id,
                        name,
                        description,
                        frequency,
                        effectiveness,
                        priority,
                        status,
                        first_seen,
                        last_seen,
                        solution,
                        resolved_at,
                    });
                }
            }
            RecordKind::Tasks => {
                let id = fields.record_id("id");
                let description = fields.required_text("description");
                let priority = fields.enumeration(
                    "priority",
                    TaskPriority::Medium,
                    "high, medium, low",
                    TaskPriority::parse,
                );
                let status = fields.enumeration(
                    "status",
                    TaskStatus::Open,
                    "open, in-progress, completed",
                    TaskStatus::parse,
                );
                let assignee = fields.optional_text("assignee");
                let due_date = fields.optional_text("dueDate");
                let created_at = fields.timestamp("createdAt").unwrap_or(self.now);
                let completed_at = fields.timestamp("completedAt");
                let session_id = fields.record_id("sessionId");
                if let Some(description) = description {
                    let id = self.claim_id(kind, id, &label);
                    self.plan.tasks.push(Task {
                        id,
                        description,
                        priority,
                        status,
                        assignee,
                        due_date,
                        created_at,
                        completed_at,
                        session_id,
                    });
                }
            }
            RecordKind::Knowledge => {
                let category = fields.required_text("category");
                let key = fields.required_text("key");
                let value = fields.required_text("value");
                let last_updated = fields.timestamp("lastUpdated").unwrap_or(self.now);
                let session_id = fields.record_id("sessionId");
                if let (Some(category), Some(key), Some(value)) = (category, key, value) {
                    self.plan.knowledge.push(KnowledgeHit {
                        category,
                        key,
                        entry: KnowledgeEntry {
                            value,
                            last_updated,
                            session_id,
                        },
                    });
                }
            }
            RecordKind::Actions => {
                let id = fields.record_id("id");
                let session_id = fields.record_id("sessionId");
                let timestamp = fields.timestamp("timestamp").unwrap_or(self.now);
                let action_type = fields.required_text("actionType");
                let details = fields.object("details");
                let result = fields.optional_text("result");
                if let Some(action_type) = action_type {
                    let id = self.claim_id(kind, id, &label);
                    self.plan.actions.push(Action {
                        id,
                        session_id,
                        timestamp,
                        action_type,
                        details,
                        result,
                    });
                }
            }
        }
    }

    fn read_nested_knowledge(&mut self, categories: &Map<String, Value>) {
        for (category, keys) in categories {
            let Value::Object(keys) = keys else {
                self.violations.push(ImportViolation {
                    kind: Some(RecordKind::Knowledge),
                    index: Some(category.clone()),
                    field: None,
                    value: Some(render_value(keys)),
                    message: "category must map keys to entries".to_string(),
                });
                continue;
            };
            for (key, entry) in keys {
                let mut flat = Map::new();
                flat.insert("category".to_string(), Value::String(category.clone()));
                flat.insert("key".to_string(), Value::String(key.clone()));
                match entry {
                    Value::Object(fields) => {
                        for (field, value) in fields {
                            flat.insert(field.clone(), value.clone());
                        }
                    }
                    other => {
                        flat.insert("value".to_string(), other.clone());
                    }
                }
                self.read_record(
                    RecordKind::Knowledge,
                    format!("{category}/{key}"),
                    &Value::Object(flat),
                );
            }
        }
    }

    /// Returns the record's id, generating one when absent. A duplicate id
    /// within one kind is reported against the record.
    fn claim_id(&mut self, kind: RecordKind, id: Option<RecordId>, index: &str) -> RecordId {
        if let Some(id) = id {
            if !self.seen_ids.insert(format!("{kind}:{id}")) {
                self.violations.push(ImportViolation {
                    kind: Some(kind),
                    index: Some(index.to_string()),
                    field: Some("id".to_string()),
                    value: Some(id.to_string()),
                    message: "ids must be unique within a kind".to_string(),
                });
            }
            return id;
        }

        let existing = self.existing;
        let seen = &self.seen_ids;
        let generated = new_unique_record_id(self.now, |candidate| {
            existing.contains_id(candidate)
                || RecordKind::ALL
                    .iter()
                    .any(|kind| seen.contains(&format!("{kind}:{candidate}")))
        });
        self.seen_ids.insert(format!("{kind}:{generated}"));
        generated
    }

    fn check_active_sessions(&mut self) {
        let replacing_sessions = self.options.policy == ConflictPolicy::Replace
            && replace_targets(&self.plan, self.options).contains(&RecordKind::Sessions);
        let surviving = if replacing_sessions {
            0
        } else {
            self.existing
                .sessions
                .iter()
                .filter(|session| session.status == SessionStatus::Active)
                .count()
        };
        let incoming = self
            .plan
            .sessions
            .iter()
            .filter(|session| session.status == SessionStatus::Active)
            .filter(|session| {
                replacing_sessions
                    || !self
                        .existing
                        .sessions
                        .iter()
                        .any(|existing| existing.id == session.id)
            })
            .count();

        if surviving + incoming > 1 {
            self.violations.push(ImportViolation {
                kind: Some(RecordKind::Sessions),
                index: None,
                field: Some("status".to_string()),
                value: Some(format!("{} active", surviving + incoming)),
                message: "at most one session may be active".to_string(),
            });
        }
    }

    fn finish(mut self) -> Result<ImportPlan, ProjectError> {
        self.check_active_sessions();
        if self.violations.is_empty() {
            Ok(self.plan)
        } else {
            Err(ProjectError::InvalidImport(self.violations))
        }
    }
}

/// Validates a decoded document against the current snapshot.
///
/// # Errors
/// Returns [`ProjectError::InvalidImport`] carrying every violation found.
pub fn plan_import(
    document: &Value,
    existing: &StoreSnapshot,
    options: &ImportOptions,
    now: OffsetDateTime,
) -> Result<ImportPlan, ProjectError> {
    let mut builder = PlanBuilder::new(existing, options, now);

    match document {
        Value::Array(_) => match options.bare_kind {
            Some(kind) => builder.read_kind(kind, document),
            None => builder
                .violations
                .push(document_violation("a bare array needs an explicit record kind")),
        },
        Value::Object(entries) => {
            for (key, value) in entries {
                if ENVELOPE_KEYS.contains(&key.as_str()) {
                    continue;
                }
                match RecordKind::parse(key) {
                    Some(kind) => builder.read_kind(kind, value),
                    None => builder.violations.push(ImportViolation {
                        kind: None,
                        index: None,
                        field: Some(key.clone()),
                        value: None,
                        message: "unknown record kind".to_string(),
                    }),
                }
            }
        }
        other => builder.violations.push(ImportViolation {
            kind: None,
            index: None,
            field: None,
            value: Some(render_value(other)),
            message: "import document must be an object or an array".to_string(),
        }),
    }

    builder.finish()
}

fn replace_targets(plan: &ImportPlan, options: &ImportOptions) -> BTreeSet<RecordKind> {
    match &options.kinds {
        Some(kinds) => kinds.iter().copied().collect(),
        None => plan.present.clone(),
    }
}

/// Folds a validated plan into `snapshot`.
pub fn apply_import(
    snapshot: &mut StoreSnapshot,
    plan: ImportPlan,
    options: &ImportOptions,
) -> ImportReport {
    let mut kinds: BTreeMap<RecordKind, KindCounts> = BTreeMap::new();
    let replacing = if options.policy == ConflictPolicy::Replace {
        replace_targets(&plan, options)
    } else {
        BTreeSet::new()
    };

    for kind in &replacing {
        let counts = kinds.entry(*kind).or_default();
        counts.replaced = match kind {
            RecordKind::Sessions => std::mem::take(&mut snapshot.sessions).len(),
            RecordKind::Decisions => std::mem::take(&mut snapshot.decisions).len(),
            RecordKind::Patterns => std::mem::take(&mut snapshot.patterns).len(),
            RecordKind::Tasks => std::mem::take(&mut snapshot.tasks).len(),
            RecordKind::Knowledge => std::mem::take(&mut snapshot.knowledge)
                .values()
                .map(BTreeMap::len)
                .sum(),
            RecordKind::Actions => std::mem::take(&mut snapshot.actions).len(),
        };
    }
    for kind in &plan.present {
        kinds.entry(*kind).or_default();
    }

    for session in plan.sessions {
        let counts = kinds.entry(RecordKind::Sessions).or_default();
        if snapshot.sessions.iter().any(|item| item.id == session.id) {
            counts.skipped += 1;
        } else {
            snapshot.sessions.push(session);
            counts.added += 1;
        }
    }
    for decision in plan.decisions {
        let counts = kinds.entry(RecordKind::Decisions).or_default();
        if snapshot.decisions.iter().any(|item| item.id == decision.id) {
            counts.skipped += 1;
        } else {
            snapshot.decisions.push(decision);
            counts.added += 1;
        }
    }
    for pattern in plan.patterns {
        let counts = kinds.entry(RecordKind::Patterns).or_default();
        if snapshot
            .patterns
            .iter()
            .any(|item| item.id == pattern.id || item.name == pattern.name)
        {
            counts.skipped += 1;
        } else {
            snapshot.patterns.push(pattern);
            counts.added += 1;
        }
    }
    for task in plan.tasks {
        let counts = kinds.entry(RecordKind::Tasks).or_default();
        if snapshot.tasks.iter().any(|item| item.id == task.id) {
            counts.skipped += 1;
        } else {
            snapshot.tasks.push(task);
            counts.added += 1;
        }
    }
    for hit in plan.knowledge {
        let counts = kinds.entry(RecordKind::Knowledge).or_default();
        let entries = snapshot.knowledge.entry(hit.category).or_default();
        if entries.contains_key(&hit.key) {
            counts.skipped += 1;
        } else {
            entries.insert(hit.key, hit.entry);
            counts.added += 1;
        }
    }
    for action in plan.actions {
        let counts = kinds.entry(RecordKind::Actions).or_default();
        if snapshot.actions.iter().any(|item| item.id == action.id) {
            counts.skipped += 1;
        } else {
            snapshot.actions.push(action);
            counts.added += 1;
        }
    }

    ImportReport {
        dry_run: options.dry_run,
        policy: options.policy,
        kinds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn at(value: &str) -> OffsetDateTime {
        must(parse_rfc3339_utc(value))
    }

    fn fixture_snapshot() -> StoreSnapshot {
        let now = at("2026-02-07T08:00:00Z");
        let mut snapshot = StoreSnapshot::empty("demo", now);
        snapshot.tasks.push(Task {
            id: RecordId::from("aaaa0001"),
            description: "existing".to_string(),
            priority: TaskPriority::High,
            status: TaskStatus::Open,
            assignee: Some("alice".to_string()),
            due_date: None,
            created_at: now,
            completed_at: None,
            session_id: None,
        });
        let mut details = Map::new();
        details.insert("email".to_string(), json!("alice@example.com"));
        details.insert("nested".to_string(), json!({"Owner": "bob", "kept": 1}));
        snapshot.actions.push(Action {
            id: RecordId::from("bbbb0001"),
            session_id: None,
            timestamp: now,
            action_type: "task_created".to_string(),
            details,
            result: None,
        });
        snapshot
    }

    fn violations_of(result: Result<ImportPlan, ProjectError>) -> Vec<ImportViolation> {
        match result {
            Err(ProjectError::InvalidImport(violations)) => violations,
            Err(other) => panic!("expected import violations, got {other}"),
            Ok(plan) => panic!("expected import violations, got plan {plan:?}"),
        }
    }

    #[test]
    fn export_filters_kinds_and_redacts_sensitive_fields() {
        let snapshot = fixture_snapshot();
        let options = ExportOptions {
            kinds: Some(vec![RecordKind::Tasks, RecordKind::Actions]),
            sanitize: true,
        };
        let export = build_export(&snapshot, &options, at("2026-02-07T09:00:00Z"));

        assert!(export.sessions.is_none());
        assert!(export.knowledge.is_none());
        let tasks = export.tasks.clone().unwrap_or_default();
        assert_eq!(tasks[0].assignee.as_deref(), Some(REDACTED));
        let actions = export.actions.clone().unwrap_or_default();
        assert_eq!(actions[0].details["email"], json!(REDACTED));
        assert_eq!(actions[0].details["nested"]["Owner"], json!(REDACTED));
        assert_eq!(actions[0].details["nested"]["kept"], json!(1));

        let value = must(serde_json::to_value(&export));
        assert!(value.get("sessions").is_none());
        assert_eq!(value["exportVersion"], json!(EXPORT_VERSION));
    }

    #[test]
    fn unsanitized_export_keeps_values() {
        let snapshot = fixture_snapshot();
        let export = build_export(&snapshot, &ExportOptions::default(), snapshot.metadata.created);
        assert_eq!(
            export.tasks.unwrap_or_default()[0].assignee.as_deref(),
            Some("alice")
        );
        assert!(export.sessions.is_some());
    }

    #[test]
    fn format_detection_and_yaml_parsing() {
        assert_eq!(ImportFormat::detect("  {\"tasks\": []}"), ImportFormat::Json);
        assert_eq!(ImportFormat::detect("tasks:\n  - description: x\n"), ImportFormat::Yaml);
        assert_eq!(
            ImportFormat::from_extension(Path::new("dump.yml")),
            Some(ImportFormat::Yaml)
        );

        let value = must(parse_import_document(
            "tasks:\n  - description: write docs\n    priority: high\n",
            ImportFormat::Yaml,
        ));
        assert_eq!(value["tasks"][0]["priority"], json!("high"));
        assert!(matches!(
            parse_import_document("{not json", ImportFormat::Json),
            Err(ProjectError::Format(_))
        ));
    }

    #[test]
    fn merge_skips_existing_ids_and_adds_new_records() {
        let mut snapshot = fixture_snapshot();
        let document = json!({
            "tasks": [
                {"id": "aaaa0001", "description": "duplicate"},
                {"description": "fresh", "priority": "low"}
            ]
        });
        let options = ImportOptions::default();
        let plan = must(plan_import(&document, &snapshot, &options, at("2026-02-07T10:00:00Z")));
        let report = apply_import(&mut snapshot, plan, &options);

        assert_eq!(report.added(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(snapshot.tasks[0].description, "existing");
        assert_eq!(snapshot.tasks[1].priority, TaskPriority::Low);
        assert_eq!(snapshot.tasks[1].created_at, at("2026-02-07T10:00:00Z"));
        assert_eq!(snapshot.tasks[1].id.as_str().len(), crate::RECORD_ID_LEN);
    }

    #[test]
    fn every_violation_is_collected() {
        let snapshot = fixture_snapshot();
        let document = json!({
            "tasks": [{"priority": "urgent"}],
            "patterns": [
                {"pattern": "retry", "effectiveness": 1.5},
                {"pattern": "retry"}
            ],
            "decisions": [{"decision": "use sqlite", "timestamp": "last week"}],
            "widgets": []
        });

        let violations = violations_of(plan_import(
            &document,
            &snapshot,
            &ImportOptions::default(),
            at("2026-02-07T10:00:00Z"),
        ));
        let fields: Vec<_> = violations
            .iter()
            .map(|violation| (violation.kind, violation.field.clone().unwrap_or_default()))
            .collect();

        assert!(fields.contains(&(Some(RecordKind::Tasks), "description".to_string())));
        assert!(fields.contains(&(Some(RecordKind::Tasks), "priority".to_string())));
        assert!(fields.contains(&(Some(RecordKind::Patterns), "effectiveness".to_string())));
        assert!(fields.contains(&(Some(RecordKind::Patterns), "pattern".to_string())));
        assert!(fields.contains(&(Some(RecordKind::Decisions), "reasoning".to_string())));
        assert!(fields.contains(&(Some(RecordKind::Decisions), "timestamp".to_string())));
        assert!(fields.contains(&(None, "widgets".to_string())));
        assert_eq!(violations.len(), 7);
    }

    #[test]
    fn second_active_session_is_rejected() {
        let mut snapshot = fixture_snapshot();
        snapshot.sessions.push(Session {
            id: RecordId::from("cccc0001"),
            name: "Morning Session".to_string(),
            start_time: at("2026-02-07T08:00:00Z"),
            end_time: None,
            context: Map::new(),
            status: SessionStatus::Active,
            outcome: None,
        });
        let document = json!([
            {"name": "Imported", "startTime": "2026-02-06T08:00:00Z", "status": "active"}
        ]);
        let options = ImportOptions {
            bare_kind: Some(RecordKind::Sessions),
            ..ImportOptions::default()
        };
        let violations = violations_of(plan_import(
            &document,
            &snapshot,
            &options,
            at("2026-02-07T10:00:00Z"),
        ));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field.as_deref(), Some("status"));

        let replace = ImportOptions {
            policy: ConflictPolicy::Replace,
            ..options
        };
        let plan = must(plan_import(&document, &snapshot, &replace, at("2026-02-07T10:00:00Z")));
        let report = apply_import(&mut snapshot, plan, &replace);
        assert_eq!(report.kinds[&RecordKind::Sessions].replaced, 1);
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].name, "Imported");
    }

    #[test]
    fn bare_array_without_kind_is_rejected() {
        let violations = violations_of(plan_import(
            &json!([{"description": "x"}]),
            &fixture_snapshot(),
            &ImportOptions::default(),
            at("2026-02-07T10:00:00Z"),
        ));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].kind.is_none());
    }

    #[test]
    fn knowledge_accepts_flat_and_nested_shapes() {
        let mut snapshot = fixture_snapshot();
        let now = at("2026-02-07T10:00:00Z");
        let options = ImportOptions::default();

        let flat = json!({"knowledge": [{"category": "stack", "key": "db", "value": "postgres"}]});
        let plan = must(plan_import(&flat, &snapshot, &options, now));
        let report = apply_import(&mut snapshot, plan, &options);
        assert_eq!(report.added(), 1);

        let nested = json!({"knowledge": {"stack": {
            "db": {"value": "mysql", "lastUpdated": "2026-02-01T00:00:00Z"},
            "cache": "redis"
        }}});
        let plan = must(plan_import(&nested, &snapshot, &options, now));
        let report = apply_import(&mut snapshot, plan, &options);
        assert_eq!(report.kinds[&RecordKind::Knowledge].added, 1);
        assert_eq!(report.kinds[&RecordKind::Knowledge].skipped, 1);
        assert_eq!(snapshot.knowledge["stack"]["db"].value, "postgres");
        assert_eq!(snapshot.knowledge["stack"]["cache"].value, "redis");
    }

    #[test]
    fn export_round_trips_through_import_as_all_skips() {
        let mut snapshot = fixture_snapshot();
        let export = build_export(&snapshot, &ExportOptions::default(), snapshot.metadata.created);
        let document = must(serde_json::to_value(&export));
        let options = ImportOptions::default();
        let plan = must(plan_import(&document, &snapshot, &options, at("2026-02-07T10:00:00Z")));
        let report = apply_import(&mut snapshot, plan, &options);
        assert_eq!(report.added(), 0);
        assert_eq!(report.skipped(), 2);
    }

    #[test]
    fn kind_filter_limits_replace_targets() {
        let mut snapshot = fixture_snapshot();
        let document = json!({"tasks": [{"description": "new"}], "actions": []});
        let options = ImportOptions {
            policy: ConflictPolicy::Replace,
            kinds: Some(vec![RecordKind::Tasks]),
            ..ImportOptions::default()
        };
        let plan = must(plan_import(&document, &snapshot, &options, at("2026-02-07T10:00:00Z")));
        let report = apply_import(&mut snapshot, plan, &options);

        assert_eq!(report.kinds[&RecordKind::Tasks].replaced, 1);
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.tasks[0].description, "new");
        assert_eq!(snapshot.actions.len(), 1);
        assert!(!report.kinds.contains_key(&RecordKind::Actions));
    }

    #[test]
    fn violation_description_is_bounded() {
        let violations: Vec<_> = (0..8)
            .map(|index| ImportViolation {
                kind: Some(RecordKind::Tasks),
                index: Some(index.to_string()),
                field: Some("description".to_string()),
                value: None,
                message: "is required".to_string(),
            })
            .collect();
        let text = describe_violations(&violations);
        assert!(text.starts_with("tasks[0].description: is required"));
        assert!(text.ends_with("and 3 more"));
    }
}
