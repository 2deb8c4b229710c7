//! Session rotation and backup policies.
//!
//! Planning functions only read state; `rotate_sessions` applies a plan to a
//! snapshot in memory. Neither appends actions: lifecycle changes ride along
//! with the caller's mutation.

use serde::{Deserialize, Serialize};
use serde_json::Map;
use time::{Duration, OffsetDateTime};

use crate::config::MemoryConfig;
use crate::{new_unique_record_id, Metadata, RecordId, Session, SessionStatus, StoreSnapshot};

/// Rotation resolves in one application; the second pass must plan `Keep`.
pub const MAX_ROTATION_PASSES: usize = 2;
pub const BACKUP_MAX_AGE: Duration = Duration::hours(24);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationPlan {
    Keep,
    Start {
        name: String,
    },
    Rotate {
        ended: RecordId,
        outcome: String,
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RotationEvent {
    Started {
        session_id: RecordId,
        name: String,
    },
    Rotated {
        ended_session_id: RecordId,
        outcome: String,
        session_id: RecordId,
        name: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BackupReason {
    Manual,
    NeverBackedUp,
    ActionInterval { actions_since_backup: u64 },
    Stale { hours_since_backup: i64 },
}

#[must_use]
pub fn session_name_for_hour(hour: u8) -> &'static str {
    match hour {
        5..=11 => "Morning Session",
        12..=16 => "Afternoon Session",
        17..=20 => "Evening Session",
        21..=23 => "Night Session",
        _ => "Late Night Session",
    }
}

#[must_use]
pub fn plan_rotation(
    snapshot: &StoreSnapshot,
    config: &MemoryConfig,
    now: OffsetDateTime,
    local_hour: u8,
) -> RotationPlan {
    if !config.auto_session {
        return RotationPlan::Keep;
    }

    let name = session_name_for_hour(local_hour).to_string();
    let Some(active) = snapshot.active_session() else {
        return RotationPlan::Start { name };
    };

    if now - active.start_time > config.session_max_age() {
        return RotationPlan::Rotate {
            ended: active.id.clone(),
            outcome: format!(
                "Completed {} actions",
                snapshot.actions_for_session(&active.id)
            ),
            name,
        };
    }

    RotationPlan::Keep
}

/// Applies rotation plans until the active session is fresh.
pub fn rotate_sessions(
    snapshot: &mut StoreSnapshot,
    config: &MemoryConfig,
    now: OffsetDateTime,
    local_hour: u8,
) -> Vec<RotationEvent> {
    let mut events = Vec::new();
    for _ in 0..MAX_ROTATION_PASSES {
        match plan_rotation(snapshot, config, now, local_hour) {
            RotationPlan::Keep => return events,
            RotationPlan::Start { name } => {
                let session_id = start_session(snapshot, &name, Map::new(), now);
                events.push(RotationEvent::Started { session_id, name });
            }
            RotationPlan::Rotate {
                ended,
                outcome,
                name,
            } => {
                end_session(snapshot, &ended, Some(outcome.clone()), now);
                let session_id = start_session(snapshot, &name, Map::new(), now);
                events.push(RotationEvent::Rotated {
                    ended_session_id: ended,
                    outcome,
                    session_id,
                    name,
                });
            }
        }
    }

    debug_assert_eq!(
        plan_rotation(snapshot, config, now, local_hour),
        RotationPlan::Keep,
        "a freshly started session can never be stale"
    );
    events
}

/// Appends a new active session. Callers end any active session first.
pub fn start_session(
    snapshot: &mut StoreSnapshot,
    name: &str,
    context: Map<String, serde_json::Value>,
    now: OffsetDateTime,
) -> RecordId {
    let id = new_unique_record_id(now, |candidate| snapshot.contains_id(candidate));
    snapshot.sessions.push(Session {
        id: id.clone(),
        name: name.to_string(),
        start_time: now,
        end_time: None,
        context,
        status: SessionStatus::Active,
        outcome: None,
    });
    id
}

/// Marks the session completed. Returns false when it is not active.
pub fn end_session(
    snapshot: &mut StoreSnapshot,
    session_id: &RecordId,
    outcome: Option<String>,
    now: OffsetDateTime,
) -> bool {
    let Some(session) = snapshot
        .sessions
        .iter_mut()
        .find(|session| &session.id == session_id && session.status == SessionStatus::Active)
    else {
        return false;
    };

    session.status = SessionStatus::Completed;
    session.end_time = Some(now);
    session.outcome = outcome;
    true
}

/// `existed_on_open` is false for a store created by this process: there is
/// no earlier state to archive, so only the interval and age rules apply.
///
/// A store created by one process and reopened by the next has existed on
/// open, so the reopening process archives it on its first mutation unless
/// a backup was already taken. Driving a fresh project through separate CLI
/// invocations therefore takes that archive one mutation later than an
/// interval count within one process would suggest.
#[must_use]
pub fn backup_due(
    metadata: &Metadata,
    config: &MemoryConfig,
    now: OffsetDateTime,
    existed_on_open: bool,
) -> Option<BackupReason> {
    if !config.auto_backup {
        return None;
    }

    if metadata.last_backup.is_none() && existed_on_open {
        return Some(BackupReason::NeverBackedUp);
    }

    if metadata.actions_since_backup >= config.backup_interval {
        return Some(BackupReason::ActionInterval {
            actions_since_backup: metadata.actions_since_backup,
        });
    }

    if let Some(last_backup) = metadata.last_backup {
        let elapsed = now - last_backup;
        if elapsed > BACKUP_MAX_AGE {
            return Some(BackupReason::Stale {
                hours_since_backup: elapsed.whole_hours(),
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_rfc3339_utc, Action};

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
        StoreSnapshot::empty("demo", at("2026-02-07T08:00:00Z"))
    }

    fn active_count(snapshot: &StoreSnapshot) -> usize {
        snapshot
            .sessions
            .iter()
            .filter(|session| session.status == SessionStatus::Active)
            .count()
    }

    #[test]
    fn session_names_cover_five_buckets() {
        assert_eq!(session_name_for_hour(6), "Morning Session");
        assert_eq!(session_name_for_hour(12), "Afternoon Session");
        assert_eq!(session_name_for_hour(18), "Evening Session");
        assert_eq!(session_name_for_hour(22), "Night Session");
        assert_eq!(session_name_for_hour(2), "Late Night Session");
    }

    #[test]
    fn missing_session_is_auto_started_once() {
        let mut snapshot = fixture_snapshot();
        let config = MemoryConfig::default();
        let now = at("2026-02-07T09:00:00Z");

        let events = rotate_sessions(&mut snapshot, &config, now, 9);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RotationEvent::Started { .. }));
        assert_eq!(active_count(&snapshot), 1);

        let again = rotate_sessions(&mut snapshot, &config, now, 9);
        assert!(again.is_empty());
        assert_eq!(snapshot.sessions.len(), 1);
    }

    #[test]
    fn stale_session_is_rotated_with_action_count_outcome() {
        let mut snapshot = fixture_snapshot();
        let config = MemoryConfig::default();
        let started = at("2026-02-07T08:00:00Z");
        let old = start_session(&mut snapshot, "Morning Session", Map::new(), started);
        snapshot.actions.push(Action {
            id: RecordId::from("act00001"),
            session_id: Some(old.clone()),
            timestamp: started,
            action_type: "decision_recorded".to_string(),
            details: Map::new(),
            result: None,
        });

        let now = at("2026-02-07T13:00:01Z");
        let events = rotate_sessions(&mut snapshot, &config, now, 13);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RotationEvent::Rotated {
                ended_session_id,
                outcome,
                name,
                ..
            } => {
                assert_eq!(ended_session_id, &old);
                assert_eq!(outcome, "Completed 1 actions");
                assert_eq!(name, "Afternoon Session");
            }
            other => panic!("expected rotation, got {other:?}"),
        }
        assert_eq!(active_count(&snapshot), 1);
        assert_eq!(snapshot.sessions[0].status, SessionStatus::Completed);
        assert_eq!(snapshot.sessions[0].end_time, Some(now));
    }

    #[test]
    fn zero_hour_threshold_rotates_any_aged_session_in_one_step() {
        let mut snapshot = fixture_snapshot();
        let config = MemoryConfig {
            auto_session_hours: 0.0,
            ..MemoryConfig::default()
        };
        let _ = start_session(
            &mut snapshot,
            "Morning Session",
            Map::new(),
            at("2026-02-07T08:00:00Z"),
        );

        let now = at("2026-02-07T08:00:00.001Z");
        let events = rotate_sessions(&mut snapshot, &config, now, 8);
        assert_eq!(events.len(), 1);
        assert_eq!(snapshot.sessions.len(), 2);
        assert_eq!(active_count(&snapshot), 1);
        assert_eq!(plan_rotation(&snapshot, &config, now, 8), RotationPlan::Keep);
    }

    #[test]
    fn disabled_auto_session_never_plans() {
        let snapshot = fixture_snapshot();
        let config = MemoryConfig {
            auto_session: false,
            ..MemoryConfig::default()
        };
        assert_eq!(
            plan_rotation(&snapshot, &config, at("2026-02-07T09:00:00Z"), 9),
            RotationPlan::Keep
        );
    }

    #[test]
    fn backup_rules_follow_interval_age_and_history() {
        let config = MemoryConfig {
            backup_interval: 3,
            ..MemoryConfig::default()
        };
        let now = at("2026-02-07T09:00:00Z");
        let mut metadata = Metadata::fresh("demo", at("2026-02-07T08:00:00Z"));

        assert_eq!(backup_due(&metadata, &config, now, false), None);
        assert_eq!(
            backup_due(&metadata, &config, now, true),
            Some(BackupReason::NeverBackedUp)
        );

        metadata.actions_since_backup = 3;
        assert_eq!(
            backup_due(&metadata, &config, now, false),
            Some(BackupReason::ActionInterval {
                actions_since_backup: 3
            })
        );

        metadata.actions_since_backup = 1;
        metadata.last_backup = Some(at("2026-02-06T08:00:00Z"));
        assert_eq!(
            backup_due(&metadata, &config, now, true),
            Some(BackupReason::Stale {
                hours_since_backup: 25
            })
        );

        metadata.last_backup = Some(now);
        metadata.actions_since_backup = 0;
        assert_eq!(backup_due(&metadata, &config, now, true), None);
    }

    #[test]
    fn disabled_auto_backup_is_never_due() {
        let config = MemoryConfig {
            auto_backup: false,
            ..MemoryConfig::default()
        };
        let mut metadata = Metadata::fresh("demo", at("2026-02-07T08:00:00Z"));
        metadata.actions_since_backup = 1_000;
        assert_eq!(
            backup_due(&metadata, &config, at("2026-02-09T08:00:00Z"), true),
            None
        );
    }
}
