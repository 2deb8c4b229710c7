//! Export and import against the live store.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use memory_kernel_project_core::lifecycle;
use memory_kernel_project_core::transfer::{
    apply_import, build_export, parse_import_document, plan_import, ExportOptions, ExportSnapshot,
    ImportFormat, ImportOptions, ImportReport,
};
use memory_kernel_project_core::ActionKind;
use serde_json::{json, Value};

use crate::{details, write_atomic, Applied, JsonProjectStore, ROUTINE};

/// Reads an import file. The format comes from `format`, then the file
/// extension, then the first non-blank character.
///
/// # Errors
/// Returns an error when the file cannot be read or decoded.
pub fn read_import_file(path: &Path, format: Option<ImportFormat>) -> Result<Value> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let format = format
        .or_else(|| ImportFormat::from_extension(path))
        .unwrap_or_else(|| ImportFormat::detect(&body));
    let document = parse_import_document(&body, format)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(document)
}

/// # Errors
/// Returns an error when the export cannot be serialized or written.
pub fn write_export(path: &Path, export: &ExportSnapshot) -> Result<()> {
    let body = serde_json::to_vec_pretty(export).context("failed to serialize export")?;
    write_atomic(path, &body)
}

impl JsonProjectStore {
    #[must_use]
    pub fn export(&self, options: &ExportOptions) -> ExportSnapshot {
        build_export(&self.snapshot, options, self.clock.now())
    }

    /// Validates `document` in full before touching the store. Any
    /// violation aborts with [`ProjectError::InvalidImport`] and no change;
    /// a dry run reports the counts a real import would produce.
    ///
    /// [`ProjectError::InvalidImport`]: memory_kernel_project_core::ProjectError::InvalidImport
    ///
    /// # Errors
    /// Returns an error for an invalid document or when persistence fails.
    pub fn import(&mut self, document: &Value, options: &ImportOptions) -> Result<ImportReport> {
        let now = self.clock.now();
        let mut preview = self.snapshot.clone();
        let _ = lifecycle::rotate_sessions(
            &mut preview,
            &self.config,
            now,
            self.clock.local_hour(now),
        );
        let plan = plan_import(document, &preview, options, now)?;

        if options.dry_run {
            return Ok(apply_import(&mut preview, plan, options));
        }

        let committed = self.commit(
            now,
            ActionKind::Imported.as_str(),
            ROUTINE,
            |snapshot, _| {
                let report = apply_import(snapshot, plan, options);
                let entries = details(json!({
                    "policy": report.policy.as_str(),
                    "added": report.added(),
                    "skipped": report.skipped(),
                    "replaced": report.replaced(),
                }));
                Applied::new(report, entries)
            },
        )?;

        let report = committed.value;
        tracing::info!(
            added = report.added(),
            skipped = report.skipped(),
            replaced = report.replaced(),
            "imported records"
        );
        Ok(report)
    }
}
