//! Markdown synthesis of the summary document and the side-detail documents.
//!
//! Rendering is a pure function of the snapshot: no clock reads, no I/O.
//! Regenerating from an unchanged snapshot yields identical bytes.

use std::cmp::Reverse;
use std::fmt::Write as _;

use serde_json::{Map, Value};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::sections::MARKER_PREFIX;
use crate::{
    Decision, Pattern, PatternPriority, PatternStatus, RecordKind, StoreSnapshot, Task,
    TaskStatus, DOCS_DIR_NAME, STATE_DIR_NAME, STORE_FILE_NAME,
};

pub const KNOWLEDGE_HEADING: &str = "## Knowledge Base";
pub const DETAIL_DOCUMENTS_HEADING: &str = "## Detail Documents";
pub const ELLIPSIS: char = '…';
/// Stored text never reaches the summary as a live manual marker.
pub const ESCAPED_MARKER_PREFIX: &str = "&lt;!-- MANUAL:";

/// Per-section caps. Critical open patterns are never capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLimits {
    pub decisions: usize,
    pub tasks_per_status: usize,
    pub completed_tasks: usize,
    pub knowledge_per_category: usize,
    pub patterns_per_priority: usize,
    pub resolved_patterns: usize,
    pub value_chars: usize,
}

impl RenderLimits {
    #[must_use]
    pub fn optimized() -> Self {
        Self {
            decisions: 5,
            tasks_per_status: 10,
            completed_tasks: 5,
            knowledge_per_category: 10,
            patterns_per_priority: 5,
            resolved_patterns: 3,
            value_chars: 100,
        }
    }

    #[must_use]
    pub fn full() -> Self {
        Self {
            decisions: 20,
            tasks_per_status: 50,
            completed_tasks: 20,
            knowledge_per_category: 100,
            patterns_per_priority: 50,
            resolved_patterns: 10,
            value_chars: 500,
        }
    }

    #[must_use]
    pub fn for_mode(optimize: bool) -> Self {
        if optimize {
            Self::optimized()
        } else {
            Self::full()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideDocument {
    pub kind: RecordKind,
    pub file_name: String,
    pub content: String,
}

#[must_use]
pub fn side_document_file_name(kind: RecordKind) -> String {
    format!("{}.md", kind.as_str())
}

/// Renders the summary document body (without manual regions).
#[must_use]
pub fn render_summary(snapshot: &StoreSnapshot, optimize: bool) -> String {
    let limits = RenderLimits::for_mode(optimize);
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# {} Project Memory",
        escape_markers(&snapshot.metadata.project_name)
    );
    out.push('\n');
    let _ = writeln!(
        out,
        "> Generated from `{STATE_DIR_NAME}/{STORE_FILE_NAME}`. Only text inside \
         `MANUAL:BEGIN <name>` / `MANUAL:END <name>` HTML comments survives regeneration."
    );
    let _ = writeln!(
        out,
        "> Last updated: {}",
        display_time(snapshot.metadata.last_updated)
    );
    out.push('\n');

    render_active_session(&mut out, snapshot, &limits);
    render_knowledge(&mut out, snapshot, &limits);
    render_open_patterns(&mut out, snapshot, &limits);
    render_resolved_patterns(&mut out, snapshot, &limits);
    render_tasks(&mut out, snapshot, &limits);
    render_decisions(&mut out, snapshot, &limits);
    render_commands_reference(&mut out);
    render_detail_pointers(&mut out);

    out
}

fn render_active_session(out: &mut String, snapshot: &StoreSnapshot, limits: &RenderLimits) {
    out.push_str("## Active Session\n\n");
    match snapshot.active_session() {
        Some(session) => {
            let _ = writeln!(
                out,
                "- **{}** (`{}`), started {}",
                inline(&session.name, limits.value_chars),
                session.id,
                display_time(session.start_time)
            );
            if !session.context.is_empty() {
                let _ = writeln!(
                    out,
                    "- Context: {}",
                    inline(&format_context(&session.context), limits.value_chars)
                );
            }
        }
        None => out.push_str("_No active session._\n"),
    }
    out.push('\n');
}

fn render_knowledge(out: &mut String, snapshot: &StoreSnapshot, limits: &RenderLimits) {
    let _ = writeln!(out, "{KNOWLEDGE_HEADING}\n");
    let populated: Vec<_> = snapshot
        .knowledge
        .iter()
        .filter(|(_, entries)| !entries.is_empty())
        .collect();
    if populated.is_empty() {
        out.push_str("_No knowledge stored yet._\n\n");
        return;
    }

    for (category, entries) in populated {
        let _ = writeln!(out, "### {}\n", escape_markers(category));
        for (key, entry) in entries.iter().take(limits.knowledge_per_category) {
            let _ = writeln!(
                out,
                "- **{}**: {}",
                escape_markers(key),
                inline(&entry.value, limits.value_chars)
            );
        }
        push_overflow(out, entries.len(), limits.knowledge_per_category);
        out.push('\n');
    }
}

fn render_open_patterns(out: &mut String, snapshot: &StoreSnapshot, limits: &RenderLimits) {
    out.push_str("## Open Patterns\n\n");
    let open: Vec<&Pattern> = snapshot
        .patterns
        .iter()
        .filter(|pattern| pattern.status == PatternStatus::Open)
        .collect();
    if open.is_empty() {
        out.push_str("_No open patterns._\n\n");
        return;
    }

    for priority in PatternPriority::ALL {
        let mut group: Vec<&Pattern> = open
            .iter()
            .copied()
            .filter(|pattern| pattern.priority == priority)
            .collect();
        if group.is_empty() {
            continue;
        }
        group.sort_by_key(|pattern| (Reverse(pattern.frequency), Reverse(pattern.last_seen)));

        let cap = if priority == PatternPriority::Critical {
            group.len()
        } else {
            limits.patterns_per_priority
        };

        let _ = writeln!(out, "### {}\n", title_case(priority.as_str()));
        for pattern in group.iter().take(cap) {
            let _ = write!(
                out,
                "- **{}** (seen {}x",
                inline(&pattern.name, limits.value_chars),
                pattern.frequency
            );
            if let Some(score) = pattern.effectiveness {
                let _ = write!(out, ", effectiveness {score:.2}");
            }
            out.push(')');
            if !pattern.description.trim().is_empty() {
                let _ = write!(out, ": {}", inline(&pattern.description, limits.value_chars));
            }
            out.push('\n');
        }
        push_overflow(out, group.len(), cap);
        out.push('\n');
    }
}

fn render_resolved_patterns(out: &mut String, snapshot: &StoreSnapshot, limits: &RenderLimits) {
    out.push_str("## Recently Resolved Patterns\n\n");
    let mut resolved: Vec<&Pattern> = snapshot
        .patterns
        .iter()
        .filter(|pattern| pattern.status == PatternStatus::Resolved)
        .collect();
    if resolved.is_empty() {
        out.push_str("_No resolved patterns._\n\n");
        return;
    }

    resolved.sort_by_key(|pattern| Reverse(pattern.resolved_at.unwrap_or(pattern.last_seen)));
    for pattern in resolved.iter().take(limits.resolved_patterns) {
        let _ = write!(out, "- **{}**", inline(&pattern.name, limits.value_chars));
        if let Some(solution) = &pattern.solution {
            let _ = write!(out, ": {}", inline(solution, limits.value_chars));
        }
        if let Some(resolved_at) = pattern.resolved_at {
            let _ = write!(out, " (resolved {})", display_date(resolved_at));
        }
        out.push('\n');
    }
    out.push('\n');
}

fn render_tasks(out: &mut String, snapshot: &StoreSnapshot, limits: &RenderLimits) {
    out.push_str("## Tasks\n\n");

    let in_progress = sorted_tasks(snapshot, TaskStatus::InProgress);
    let open = sorted_tasks(snapshot, TaskStatus::Open);
    let mut completed = sorted_tasks(snapshot, TaskStatus::Completed);
    completed.sort_by_key(|task| Reverse(task.completed_at.unwrap_or(task.created_at)));

    if in_progress.is_empty() && open.is_empty() {
        out.push_str("_No active tasks._\n\n");
    }

    for (title, marker, tasks) in [("In Progress", "[~]", &in_progress), ("Open", "[ ]", &open)] {
        if tasks.is_empty() {
            continue;
        }
        let _ = writeln!(out, "### {title}\n");
        for task in tasks.iter().take(limits.tasks_per_status) {
            push_task_line(out, marker, task, limits);
        }
        push_overflow(out, tasks.len(), limits.tasks_per_status);
        out.push('\n');
    }

    if !completed.is_empty() {
        out.push_str("### Recently Completed\n\n");
        for task in completed.iter().take(limits.completed_tasks) {
            push_task_line(out, "[x]", task, limits);
        }
        out.push('\n');
    }
}

fn sorted_tasks(snapshot: &StoreSnapshot, status: TaskStatus) -> Vec<&Task> {
    let mut tasks: Vec<&Task> = snapshot
        .tasks
        .iter()
        .filter(|task| task.status == status)
        .collect();
    tasks.sort_by_key(|task| (task.priority, task.created_at));
    tasks
}

fn push_task_line(out: &mut String, marker: &str, task: &Task, limits: &RenderLimits) {
    let _ = write!(
        out,
        "- {marker} {} (`{}`, {}",
        inline(&task.description, limits.value_chars),
        task.id,
        task.priority.as_str()
    );
    if let Some(assignee) = &task.assignee {
        let _ = write!(out, ", @{}", inline(assignee, limits.value_chars));
    }
    if let Some(due) = &task.due_date {
        let _ = write!(out, ", due {}", inline(due, limits.value_chars));
    }
    out.push_str(")\n");
}

fn render_decisions(out: &mut String, snapshot: &StoreSnapshot, limits: &RenderLimits) {
    out.push_str("## Recent Decisions\n\n");
    if snapshot.decisions.is_empty() {
        out.push_str("_No decisions recorded yet._\n\n");
        return;
    }

    let mut decisions: Vec<(usize, &Decision)> = snapshot.decisions.iter().enumerate().collect();
    decisions.sort_by_key(|(index, decision)| Reverse((decision.timestamp, *index)));
    for (_, decision) in decisions.iter().take(limits.decisions) {
        let _ = writeln!(
            out,
            "- **{}** ({}, `{}`)",
            inline(&decision.decision, limits.value_chars),
            display_date(decision.timestamp),
            decision.id
        );
        if !decision.reasoning.trim().is_empty() {
            let _ = writeln!(
                out,
                "  - Reasoning: {}",
                inline(&decision.reasoning, limits.value_chars)
            );
        }
        if !decision.alternatives.is_empty() {
            let _ = writeln!(
                out,
                "  - Alternatives: {}",
                inline(&decision.alternatives.join("; "), limits.value_chars)
            );
        }
        if let Some(outcome) = &decision.outcome {
            let _ = writeln!(out, "  - Outcome: {}", inline(outcome, limits.value_chars));
        }
    }
    push_overflow(out, decisions.len(), limits.decisions);
    out.push('\n');
}

fn render_commands_reference(out: &mut String) {
    out.push_str("## Commands Reference\n\n");
    for (command, purpose) in [
        ("mk project decision add --decision <text> --reasoning <text>", "record a decision"),
        ("mk project pattern record --name <name>", "record or bump a pattern"),
        ("mk project task add --description <text>", "add a task"),
        ("mk project task update --id <id> --status <status>", "move a task"),
        ("mk project knowledge set --category <c> --key <k> --value <v>", "store knowledge"),
        ("mk project search --query <text>", "search all records"),
        ("mk project sync", "regenerate this document"),
        ("mk project backup run", "archive the store now"),
    ] {
        let _ = writeln!(out, "- `{command}`: {purpose}");
    }
    out.push('\n');
}

fn render_detail_pointers(out: &mut String) {
    let _ = writeln!(out, "{DETAIL_DOCUMENTS_HEADING}\n");
    for kind in RecordKind::ALL {
        let _ = writeln!(
            out,
            "- {}: `{STATE_DIR_NAME}/{DOCS_DIR_NAME}/{}`",
            title_case(kind.as_str()),
            side_document_file_name(kind)
        );
    }
}

/// Renders one unabridged document per record kind.
#[must_use]
pub fn render_side_documents(snapshot: &StoreSnapshot) -> Vec<SideDocument> {
    RecordKind::ALL
        .into_iter()
        .map(|kind| SideDocument {
            kind,
            file_name: side_document_file_name(kind),
            content: render_side_document(snapshot, kind),
        })
        .collect()
}

fn render_side_document(snapshot: &StoreSnapshot, kind: RecordKind) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# {}: {}\n",
        snapshot.metadata.project_name,
        title_case(kind.as_str())
    );

    match kind {
        RecordKind::Sessions => {
            if snapshot.sessions.is_empty() {
                out.push_str("_No sessions recorded._\n");
            }
            for session in snapshot.sessions.iter().rev() {
                let _ = writeln!(out, "## {} (`{}`)\n", session.name, session.id);
                let _ = writeln!(out, "- Status: {}", session.status.as_str());
                let _ = writeln!(out, "- Started: {}", display_time(session.start_time));
                if let Some(end_time) = session.end_time {
                    let _ = writeln!(out, "- Ended: {}", display_time(end_time));
                }
                if let Some(outcome) = &session.outcome {
                    let _ = writeln!(out, "- Outcome: {outcome}");
                }
                if !session.context.is_empty() {
                    let _ = writeln!(out, "- Context: {}", format_context(&session.context));
                }
                out.push('\n');
            }
        }
        RecordKind::Decisions => {
            if snapshot.decisions.is_empty() {
                out.push_str("_No decisions recorded._\n");
            }
            for decision in snapshot.decisions.iter().rev() {
                let _ = writeln!(out, "## {} (`{}`)\n", decision.decision, decision.id);
                let _ = writeln!(out, "- Recorded: {}", display_time(decision.timestamp));
                if let Some(session_id) = &decision.session_id {
                    let _ = writeln!(out, "- Session: `{session_id}`");
                }
                let _ = writeln!(out, "- Reasoning: {}", decision.reasoning);
                for alternative in &decision.alternatives {
                    let _ = writeln!(out, "- Alternative: {alternative}");
                }
                if let Some(outcome) = &decision.outcome {
                    let _ = writeln!(out, "- Outcome: {outcome}");
                }
                if !decision.context.is_empty() {
                    let _ = writeln!(out, "- Context: {}", format_context(&decision.context));
                }
                out.push('\n');
            }
        }
        RecordKind::Patterns => {
            if snapshot.patterns.is_empty() {
                out.push_str("_No patterns recorded._\n");
            }
            for pattern in &snapshot.patterns {
                let _ = writeln!(out, "## {} (`{}`)\n", pattern.name, pattern.id);
                let _ = writeln!(
                    out,
                    "- Status: {}, priority {}, seen {}x",
                    pattern.status.as_str(),
                    pattern.priority.as_str(),
                    pattern.frequency
                );
                if let Some(score) = pattern.effectiveness {
                    let _ = writeln!(out, "- Effectiveness: {score:.2}");
                }
                let _ = writeln!(
                    out,
                    "- First seen: {}, last seen: {}",
                    display_time(pattern.first_seen),
                    display_time(pattern.last_seen)
                );
                if !pattern.description.is_empty() {
                    let _ = writeln!(out, "- Description: {}", pattern.description);
                }
                if let Some(solution) = &pattern.solution {
                    let _ = writeln!(out, "- Solution: {solution}");
                }
                out.push('\n');
            }
        }
        RecordKind::Tasks => {
            if snapshot.tasks.is_empty() {
                out.push_str("_No tasks recorded._\n");
            }
            for task in &snapshot.tasks {
                let _ = writeln!(out, "## {} (`{}`)\n", task.description, task.id);
                let _ = writeln!(
                    out,
                    "- Status: {}, priority {}",
                    task.status.as_str(),
                    task.priority.as_str()
                );
                if let Some(assignee) = &task.assignee {
                    let _ = writeln!(out, "- Assignee: {assignee}");
                }
                if let Some(due) = &task.due_date {
                    let _ = writeln!(out, "- Due: {due}");
                }
                let _ = writeln!(out, "- Created: {}", display_time(task.created_at));
                if let Some(completed_at) = task.completed_at {
                    let _ = writeln!(out, "- Completed: {}", display_time(completed_at));
                }
                out.push('\n');
            }
        }
        RecordKind::Knowledge => {
            if snapshot.knowledge.values().all(std::collections::BTreeMap::is_empty) {
                out.push_str("_No knowledge stored._\n");
            }
            for (category, entries) in &snapshot.knowledge {
                if entries.is_empty() {
                    continue;
                }
                let _ = writeln!(out, "## {category}\n");
                for (key, entry) in entries {
                    let _ = writeln!(
                        out,
                        "- **{key}** ({}): {}",
                        display_time(entry.last_updated),
                        entry.value
                    );
                }
                out.push('\n');
            }
        }
        RecordKind::Actions => {
            if snapshot.actions.is_empty() {
                out.push_str("_No actions recorded._\n");
            }
            for action in snapshot.actions.iter().rev() {
                let _ = write!(
                    out,
                    "- {} `{}` {}",
                    display_time(action.timestamp),
                    action.id,
                    action.action_type
                );
                if !action.details.is_empty() {
                    let _ = write!(out, " {}", format_context(&action.details));
                }
                if let Some(result) = &action.result {
                    let _ = write!(out, " -> {result}");
                }
                out.push('\n');
            }
        }
    }

    out
}

/// Collapses whitespace runs onto one line, caps the length and escapes
/// manual markers.
#[must_use]
pub fn inline(value: &str, max_chars: usize) -> String {
    let flattened = value.split_whitespace().collect::<Vec<_>>().join(" ");
    escape_markers(&truncate(&flattened, max_chars))
}

#[must_use]
pub fn escape_markers(value: &str) -> String {
    value.replace(MARKER_PREFIX, ESCAPED_MARKER_PREFIX)
}

#[must_use]
pub fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max_chars).collect();
    out.push(ELLIPSIS);
    out
}

fn push_overflow(out: &mut String, total: usize, shown: usize) {
    if total > shown {
        let _ = writeln!(out, "- _{} more not shown_", total - shown);
    }
}

fn format_context(context: &Map<String, Value>) -> String {
    context
        .iter()
        .map(|(key, value)| match value {
            Value::String(text) => format!("{key}={text}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn display_time(value: OffsetDateTime) -> String {
    value
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second] UTC"
        ))
        .unwrap_or_else(|_| value.to_string())
}

fn display_date(value: OffsetDateTime) -> String {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_rfc3339_utc, KnowledgeEntry, RecordId, TaskPriority};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn at(value: &str) -> OffsetDateTime {
        must(parse_rfc3339_utc(value))
    }

    fn fixture_pattern(id: &str, name: &str, priority: PatternPriority) -> Pattern {
        Pattern {
            id: RecordId::from(id),
            name: name.to_string(),
            description: format!("{name} description"),
            frequency: 1,
            effectiveness: None,
            priority,
            status: PatternStatus::Open,
            first_seen: at("2026-02-07T08:00:00Z"),
            last_seen: at("2026-02-07T08:00:00Z"),
            solution: None,
            resolved_at: None,
        }
    }

    fn fixture_task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: RecordId::from(id),
            description: format!("task {id}"),
            priority: TaskPriority::Medium,
            status,
            assignee: None,
            due_date: None,
            created_at: at("2026-02-07T08:00:00Z"),
            completed_at: None,
            session_id: None,
        }
    }

    #[test]
    fn empty_store_renders_placeholders() {
        let snapshot = StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"));
        let body = render_summary(&snapshot, true);

        assert!(body.starts_with("# demo Project Memory\n"));
        assert!(body.contains("_No active session._"));
        assert!(body.contains("_No knowledge stored yet._"));
        assert!(body.contains("_No open patterns._"));
        assert!(body.contains("_No active tasks._"));
        assert!(body.contains("_No decisions recorded yet._"));
        assert!(body.contains(KNOWLEDGE_HEADING));
        assert!(body.contains(DETAIL_DOCUMENTS_HEADING));
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut snapshot = StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"));
        snapshot
            .patterns
            .push(fixture_pattern("p0000001", "flaky test", PatternPriority::High));
        snapshot.tasks.push(fixture_task("t0000001", TaskStatus::Open));

        assert_eq!(render_summary(&snapshot, true), render_summary(&snapshot, true));
        assert_eq!(render_side_documents(&snapshot), render_side_documents(&snapshot));
    }

    #[test]
    fn optimized_mode_truncates_long_values() {
        let mut snapshot = StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"));
        let long_value = "x".repeat(300);
        snapshot.knowledge.entry("notes".to_string()).or_default().insert(
            "long".to_string(),
            KnowledgeEntry {
                value: long_value.clone(),
                last_updated: at("2026-02-07T08:00:00Z"),
                session_id: None,
            },
        );

        let optimized = render_summary(&snapshot, true);
        assert!(optimized.contains(&format!("{}{ELLIPSIS}", "x".repeat(100))));
        assert!(!optimized.contains(&"x".repeat(101)));

        let full = render_summary(&snapshot, false);
        assert!(full.contains(&long_value));
    }

    #[test]
    fn critical_patterns_are_never_capped() {
        let mut snapshot = StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"));
        for index in 0..8 {
            snapshot.patterns.push(fixture_pattern(
                &format!("c000000{index}"),
                &format!("critical-{index}"),
                PatternPriority::Critical,
            ));
            snapshot.patterns.push(fixture_pattern(
                &format!("l000000{index}"),
                &format!("low-{index}"),
                PatternPriority::Low,
            ));
        }

        let body = render_summary(&snapshot, true);
        for index in 0..8 {
            assert!(body.contains(&format!("critical-{index}")));
        }
        let low_shown = (0..8)
            .filter(|index| body.contains(&format!("**low-{index}**")))
            .count();
        assert_eq!(low_shown, 5);
        assert!(body.contains("3 more not shown"));
    }

    #[test]
    fn completed_tasks_alone_still_report_no_active_tasks() {
        let mut snapshot = StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"));
        let mut task = fixture_task("t0000001", TaskStatus::Completed);
        task.completed_at = Some(at("2026-02-07T09:00:00Z"));
        snapshot.tasks.push(task);

        let body = render_summary(&snapshot, true);
        assert!(body.contains("_No active tasks._"));
        assert!(body.contains("### Recently Completed"));
        assert!(body.contains("- [x] task t0000001"));
    }

    #[test]
    fn side_documents_cover_every_kind_without_truncation() {
        let mut snapshot = StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"));
        let mut pattern = fixture_pattern("p0000001", "long", PatternPriority::Low);
        pattern.description = "y".repeat(800);
        snapshot.patterns.push(pattern);

        let documents = render_side_documents(&snapshot);
        assert_eq!(documents.len(), RecordKind::ALL.len());
        let patterns = documents
            .iter()
            .find(|document| document.kind == RecordKind::Patterns);
        match patterns {
            Some(document) => {
                assert_eq!(document.file_name, "patterns.md");
                assert!(document.content.contains(&"y".repeat(800)));
            }
            None => panic!("missing patterns side document"),
        }
    }

    #[test]
    fn generated_summary_contains_no_manual_regions() {
        let snapshot = StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"));
        let scan = crate::sections::scan_manual_sections(&render_summary(&snapshot, true));
        assert!(scan.sections.is_empty());
        assert!(scan.issues.is_empty());
    }

    #[test]
    fn stored_text_cannot_open_a_manual_region() {
        let mut snapshot = StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"));
        let smuggled = "<!-- MANUAL:BEGIN X -->v<!-- MANUAL:END X -->";
        snapshot.knowledge.entry("notes".to_string()).or_default().insert(
            smuggled.to_string(),
            KnowledgeEntry {
                value: smuggled.to_string(),
                last_updated: at("2026-02-07T08:00:00Z"),
                session_id: None,
            },
        );
        let mut task = fixture_task("t0000001", TaskStatus::Open);
        task.description = smuggled.to_string();
        snapshot.tasks.push(task);
        snapshot
            .patterns
            .push(fixture_pattern("p0000001", smuggled, PatternPriority::Low));

        let body = render_summary(&snapshot, false);
        let scan = crate::sections::scan_manual_sections(&body);
        assert!(scan.sections.is_empty());
        assert!(scan.issues.is_empty());
        assert!(body.contains("&lt;!-- MANUAL:BEGIN X -->v&lt;!-- MANUAL:END X -->"));
    }

    #[test]
    fn inline_flattens_newlines() {
        assert_eq!(inline("a\n  b\tc", 10), "a b c");
        assert_eq!(truncate("abcdef", 3), format!("abc{ELLIPSIS}"));
    }
}
