//! Regenerates the summary document and the side-detail documents.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memory_kernel_project_core::document::{render_side_documents, render_summary};
use memory_kernel_project_core::sections::{
    merge_manual_sections, scan_manual_sections, SectionIssue, SectionScan,
};
use memory_kernel_project_core::StoreSnapshot;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::backup::timestamp_label;
use crate::{write_atomic, ProjectPaths};

pub const DOC_BACKUP_RETENTION: usize = 5;
const MAX_ARCHIVE_SEQUENCE: u32 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub path: PathBuf,
    pub preserved: usize,
    pub dropped: Vec<String>,
    pub issues: Vec<SectionIssue>,
    pub archived: Option<PathBuf>,
    pub pruned_archives: usize,
    pub side_documents: usize,
}

/// Reads the current summary, if any, and scans its manual regions.
///
/// # Errors
/// Returns an error when the file exists but cannot be read.
pub fn read_manual_sections(summary_file: &Path) -> Result<(Option<String>, SectionScan)> {
    match fs::read_to_string(summary_file) {
        Ok(text) => {
            let scan = scan_manual_sections(&text);
            Ok((Some(text), scan))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok((None, SectionScan::default())),
        Err(err) => Err(err)
            .with_context(|| format!("failed to read {}", summary_file.display())),
    }
}

/// Archives the previous summary, renders a new one with its manual regions
/// spliced back in and rewrites every side document.
///
/// # Errors
/// Returns an error when the previous document cannot be read or archived,
/// or when a document write fails.
pub fn sync_documents(
    paths: &ProjectPaths,
    snapshot: &StoreSnapshot,
    optimize: bool,
    now: OffsetDateTime,
) -> Result<SyncReport> {
    let (previous, scan) = read_manual_sections(&paths.summary_file)?;
    for issue in &scan.issues {
        tracing::warn!(%issue, "manual section not preserved");
    }

    let archived = match &previous {
        Some(text) => Some(archive_document(&paths.doc_backups_dir, text, now)?),
        None => None,
    };
    let pruned_archives = prune_document_archives(&paths.doc_backups_dir, DOC_BACKUP_RETENTION);

    let generated = render_summary(snapshot, optimize);
    let merged = merge_manual_sections(&generated, &scan.sections);
    for name in &merged.dropped {
        tracing::warn!(section = %name, "manual section dropped: anchor heading missing");
    }
    write_atomic(&paths.summary_file, merged.document.as_bytes())?;

    let side_documents = render_side_documents(snapshot);
    for document in &side_documents {
        write_atomic(
            &paths.docs_dir.join(&document.file_name),
            document.content.as_bytes(),
        )?;
    }

    tracing::debug!(
        path = %paths.summary_file.display(),
        preserved = merged.preserved,
        "synchronized project documents"
    );

    Ok(SyncReport {
        path: paths.summary_file.clone(),
        preserved: merged.preserved,
        dropped: merged.dropped,
        issues: scan.issues,
        archived,
        pruned_archives,
        side_documents: side_documents.len(),
    })
}

/// Writes `text` to a new, never-reused file under `dir`.
fn archive_document(dir: &Path, text: &str, now: OffsetDateTime) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let label = timestamp_label(now);

    for sequence in 0..MAX_ARCHIVE_SEQUENCE {
        let candidate = dir.join(format!("{label}-{sequence:03}.md"));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut file) => {
                file.write_all(text.as_bytes())
                    .and_then(|()| file.sync_all())
                    .with_context(|| format!("failed to write {}", candidate.display()))?;
                return Ok(candidate);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create {}", candidate.display()))
            }
        }
    }

    anyhow::bail!(
        "no free document archive name for {label} in {}",
        dir.display()
    )
}

/// Keeps the `keep` newest archives by modification time, then name.
fn prune_document_archives(dir: &Path, keep: usize) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(error = %err, "failed to read document archives");
            }
            return 0;
        }
    };

    let mut archives: Vec<(Option<std::time::SystemTime>, PathBuf)> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|extension| extension == "md"))
        .map(|path| {
            let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok();
            (modified, path)
        })
        .collect();
    archives.sort_by(|left, right| right.cmp(left));

    let mut removed = 0;
    for (_, path) in archives.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to remove document archive"
                );
            }
        }
    }
    removed
}
