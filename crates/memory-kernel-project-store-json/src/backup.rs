//! Timestamped archives of the store file and the summary document.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use memory_kernel_project_core::{STORE_FILE_NAME, SUMMARY_FILE_NAME};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

use crate::{write_atomic, ProjectPaths};

/// Upper bound on retention so the age arithmetic cannot overflow.
const MAX_RETENTION_DAYS: i64 = 36_600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub name: String,
    pub path: PathBuf,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub modified: Option<OffsetDateTime>,
    pub has_store: bool,
    pub has_summary: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
    pub failed: usize,
}

/// Filesystem-safe UTC label with millisecond precision, for example
/// `2026-10-19T08-30-12-123Z`.
#[must_use]
pub fn timestamp_label(now: OffsetDateTime) -> String {
    now.to_offset(time::UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]-[minute]-[second]-[subsecond digits:3]Z"
        ))
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    backups_dir: PathBuf,
    store_file: PathBuf,
    summary_file: PathBuf,
}

impl BackupManager {
    #[must_use]
    pub fn new(paths: &ProjectPaths) -> Self {
        Self {
            backups_dir: paths.backups_dir.clone(),
            store_file: paths.store_file.clone(),
            summary_file: paths.summary_file.clone(),
        }
    }

    #[must_use]
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Creates a fresh archive directory and copies the store file and the
    /// summary document into it when present.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created or a copy fails.
    pub fn backup(&self, now: OffsetDateTime) -> Result<PathBuf> {
        fs::create_dir_all(&self.backups_dir).with_context(|| {
            format!(
                "failed to create backups directory {}",
                self.backups_dir.display()
            )
        })?;

        let label = timestamp_label(now);
        let mut suffix = 0_u32;
        let target = loop {
            let name = if suffix == 0 {
                label.clone()
            } else {
                format!("{label}-{suffix}")
            };
            let candidate = self.backups_dir.join(name);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to create backup directory {}", candidate.display())
                    })
                }
            }
        };

        copy_if_present(&self.store_file, &target.join(STORE_FILE_NAME))?;
        copy_if_present(&self.summary_file, &target.join(SUMMARY_FILE_NAME))?;
        tracing::info!(path = %target.display(), "created backup");
        Ok(target)
    }

    /// Removes archives older than `max_age_days`. Failures are logged and
    /// counted; pruning never aborts.
    #[must_use]
    pub fn prune(&self, now: OffsetDateTime, max_age_days: u64) -> PruneReport {
        self.prune_with(now, max_age_days, remove_archive)
    }

    fn prune_with(
        &self,
        now: OffsetDateTime,
        max_age_days: u64,
        mut remove: impl FnMut(&Path) -> std::io::Result<()>,
    ) -> PruneReport {
        let mut report = PruneReport::default();
        let entries = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return report,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read backups directory");
                report.failed += 1;
                return report;
            }
        };

        let days = i64::try_from(max_age_days)
            .unwrap_or(MAX_RETENTION_DAYS)
            .min(MAX_RETENTION_DAYS);
        let max_age = Duration::days(days);

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read backup entry");
                    report.failed += 1;
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(modified) = modified_at(&path) else {
                tracing::warn!(path = %path.display(), "backup has no modification time");
                report.failed += 1;
                continue;
            };
            if now - modified <= max_age {
                continue;
            }
            match remove(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "pruned expired backup");
                    report.removed += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to prune backup"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Lists archives, newest first.
    ///
    /// # Errors
    /// Returns an error when the backups directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to read backups directory {}",
                        self.backups_dir.display()
                    )
                })
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            records.push(BackupRecord {
                name: name.to_string(),
                modified: modified_at(&path),
                has_store: path.join(STORE_FILE_NAME).is_file(),
                has_summary: path.join(SUMMARY_FILE_NAME).is_file(),
                path,
            });
        }

        records.sort_by(|left, right| {
            right
                .modified
                .cmp(&left.modified)
                .then_with(|| right.name.cmp(&left.name))
        });
        Ok(records)
    }

    /// Copies an archive's files back into place. Returns `false` when no
    /// archive has that name.
    ///
    /// # Errors
    /// Returns an error for names that are not plain directory names or when
    /// a copy fails.
    pub fn restore(&self, name: &str) -> Result<bool> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
        {
            return Err(anyhow!("invalid backup name: {name:?}"));
        }

        let source = self.backups_dir.join(name);
        if !source.is_dir() {
            return Ok(false);
        }

        for (file_name, destination) in [
            (STORE_FILE_NAME, &self.store_file),
            (SUMMARY_FILE_NAME, &self.summary_file),
        ] {
            let archived = source.join(file_name);
            if !archived.is_file() {
                continue;
            }
            let bytes = fs::read(&archived)
                .with_context(|| format!("failed to read {}", archived.display()))?;
            write_atomic(destination, &bytes)?;
        }

        tracing::info!(backup = name, "restored backup");
        Ok(true)
    }
}

fn copy_if_present(source: &Path, destination: &Path) -> Result<()> {
    match fs::copy(source, destination) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| {
            format!(
                "failed to copy {} to {}",
                source.display(),
                destination.display()
            )
        }),
    }
}

fn remove_archive(path: &Path) -> std::io::Result<()> {
    fs::remove_dir_all(path)
}

fn modified_at(path: &Path) -> Option<OffsetDateTime> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .map(OffsetDateTime::from)
}
