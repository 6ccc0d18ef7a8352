//! Patch Engine
//!
//! Applies proposed edits to the working tree with per-file atomic rollback.
//! Before the first edit touches a file in a run, the file is copied
//! verbatim to `<original>.backup.<epoch-ms>` and a [`PatchRecord`] is
//! created; rollback restores from those copies and nothing else, so a
//! restored file is byte-identical to its pre-run content.
//!
//! Edits within one file are applied in received order; a later edit's line
//! numbers refer to the file as earlier edits left it.

use crate::backend::{Edit, EditAction};
use crate::util::{epoch_millis, resolve_repo_path};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct AppliedEdit {
    pub action: EditAction,
    pub line_start: usize,
    pub line_end: usize,
    /// Anchor was located by whole-file search after the stated line range
    /// proved stale
    pub fuzzy: bool,
}

/// Backup + metadata for one mutated file within one run. Exactly one per
/// distinct file; never shared across runs.
#[derive(Debug, Clone, Serialize)]
pub struct PatchRecord {
    /// Repo-relative path of the mutated file
    pub file: PathBuf,
    /// Verbatim pre-run copy; `None` only when backups are disabled
    pub backup_path: Option<PathBuf>,
    pub applied_edits: Vec<AppliedEdit>,
    pub applied_at: DateTime<Utc>,
}

pub struct PatchEngine {
    repo_root: PathBuf,
    dry_run: bool,
    backup_enabled: bool,
    records: Vec<PatchRecord>,
}

impl PatchEngine {
    pub fn new(repo_root: &Path, dry_run: bool, backup_enabled: bool) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            dry_run,
            backup_enabled,
            records: Vec::new(),
        }
    }

    /// Apply one edit. Fails loudly when the anchor cannot be located by
    /// either the stated range or a whole-file search; a failed edit leaves
    /// the file untouched and creates no backup.
    pub fn apply(&mut self, edit: &Edit) -> Result<AppliedEdit> {
        let resolved = resolve_repo_path(&self.repo_root, &edit.file)
            .map_err(|e| anyhow::anyhow!("Refusing edit: {}", e))?;

        let content = fs::read_to_string(&resolved.absolute)
            .with_context(|| format!("Failed to read {}", resolved.relative.display()))?;

        let (new_content, fuzzy) = apply_to_content(&content, edit)?;

        let applied = AppliedEdit {
            action: edit.action,
            line_start: edit.line_start,
            line_end: edit.end_line(),
            fuzzy,
        };

        if self.dry_run {
            println!(
                "  [dry-run] would {} {} in {}{}",
                edit.action.label(),
                edit.range_label(),
                resolved.relative.display(),
                if fuzzy { " (fuzzy match)" } else { "" }
            );
            return Ok(applied);
        }

        self.ensure_backup(&resolved.relative, &resolved.absolute)?;

        fs::write(&resolved.absolute, &new_content)
            .with_context(|| format!("Failed to write {}", resolved.relative.display()))?;

        if let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.file == resolved.relative)
        {
            record.applied_edits.push(applied.clone());
        }

        println!(
            "  Applied {} to {} ({}){}",
            edit.action.label(),
            resolved.relative.display(),
            edit.range_label(),
            if fuzzy { " via fuzzy match" } else { "" }
        );

        Ok(applied)
    }

    /// Copy the file aside and open its PatchRecord, once per file per run.
    fn ensure_backup(&mut self, relative: &Path, absolute: &Path) -> Result<()> {
        if self.records.iter().any(|r| r.file == relative) {
            return Ok(());
        }

        let backup_path = if self.backup_enabled {
            let file_name = absolute
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid file name: {}", relative.display()))?;
            let backup = absolute.with_file_name(format!("{}.backup.{}", file_name, epoch_millis()));
            fs::copy(absolute, &backup).with_context(|| {
                format!("Failed to back up {} before editing", relative.display())
            })?;
            Some(backup)
        } else {
            None
        };

        self.records.push(PatchRecord {
            file: relative.to_path_buf(),
            backup_path,
            applied_edits: Vec::new(),
            applied_at: Utc::now(),
        });
        Ok(())
    }

    /// Restore every touched file from its backup, then discard the backups.
    /// All-or-nothing per run: every file is attempted even when one restore
    /// fails, and failures are collected rather than raised.
    pub fn rollback(&mut self) -> Vec<(PathBuf, String)> {
        let mut failures = Vec::new();

        for record in &self.records {
            let Some(backup) = &record.backup_path else {
                failures.push((
                    record.file.clone(),
                    "no backup available (backups disabled)".to_string(),
                ));
                continue;
            };

            let absolute = self.repo_root.join(&record.file);
            match fs::copy(backup, &absolute) {
                Ok(_) => {
                    let _ = fs::remove_file(backup);
                    println!("  Restored {}", record.file.display());
                }
                Err(err) => {
                    // Keep the backup when the restore failed
                    failures.push((record.file.clone(), err.to_string()));
                }
            }
        }

        self.records.clear();
        failures
    }

    pub fn records(&self) -> &[PatchRecord] {
        &self.records
    }

    pub fn touched_file_count(&self) -> usize {
        self.records.len()
    }
}

/// Pure mutation step: returns the post-edit content and whether the anchor
/// was recovered by whole-file search.
fn apply_to_content(content: &str, edit: &Edit) -> Result<(String, bool)> {
    let had_trailing_newline = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let start = edit.line_start;
    let end = edit.end_line();
    let range_valid = start >= 1 && end <= lines.len();

    let rebuild = |new_lines: Vec<&str>| -> String {
        let mut rebuilt = new_lines.join("\n");
        if had_trailing_newline && !rebuilt.is_empty() {
            rebuilt.push('\n');
        }
        rebuilt
    };

    match edit.action {
        EditAction::Replace => {
            let new_code = edit.new_code.as_deref().unwrap_or("");
            let anchor = edit.old_code.as_deref().filter(|s| !s.is_empty());

            if let Some(old_code) = anchor {
                let anchored_in_range =
                    range_valid && lines[start - 1..end].join("\n").contains(old_code);

                if anchored_in_range {
                    let mut new_lines: Vec<&str> = Vec::with_capacity(lines.len());
                    new_lines.extend_from_slice(&lines[..start - 1]);
                    new_lines.extend(new_code.lines());
                    new_lines.extend_from_slice(&lines[end..]);
                    Ok((rebuild(new_lines), false))
                } else if let Some(pos) = content.find(old_code) {
                    // Stated line numbers are stale; the anchor text wins
                    let mut patched = String::with_capacity(content.len());
                    patched.push_str(&content[..pos]);
                    patched.push_str(new_code);
                    patched.push_str(&content[pos + old_code.len()..]);
                    Ok((patched, true))
                } else {
                    Err(anyhow::anyhow!(
                        "Anchor not found: oldCode is neither at {} nor anywhere in {} ({} lines)",
                        edit.range_label(),
                        edit.file.display(),
                        lines.len()
                    ))
                }
            } else {
                if !range_valid {
                    return Err(anyhow::anyhow!(
                        "Replace range {} is out of bounds for {} ({} lines) and no oldCode anchor was supplied",
                        edit.range_label(),
                        edit.file.display(),
                        lines.len()
                    ));
                }
                let mut new_lines: Vec<&str> = Vec::with_capacity(lines.len());
                new_lines.extend_from_slice(&lines[..start - 1]);
                new_lines.extend(new_code.lines());
                new_lines.extend_from_slice(&lines[end..]);
                Ok((rebuild(new_lines), false))
            }
        }
        EditAction::Insert => {
            let new_code = edit
                .new_code
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Insert edit carries no newCode"))?;
            // Insertion point may be one past the last line (append)
            if start < 1 || start > lines.len() + 1 {
                return Err(anyhow::anyhow!(
                    "Insert position line {} is out of bounds for {} ({} lines)",
                    start,
                    edit.file.display(),
                    lines.len()
                ));
            }
            let mut new_lines: Vec<&str> = Vec::with_capacity(lines.len() + 4);
            new_lines.extend_from_slice(&lines[..start - 1]);
            new_lines.extend(new_code.lines());
            new_lines.extend_from_slice(&lines[start - 1..]);
            Ok((rebuild(new_lines), false))
        }
        EditAction::Delete => {
            if !range_valid {
                return Err(anyhow::anyhow!(
                    "Delete range {} is out of bounds for {} ({} lines)",
                    edit.range_label(),
                    edit.file.display(),
                    lines.len()
                ));
            }
            let mut new_lines: Vec<&str> = Vec::with_capacity(lines.len());
            new_lines.extend_from_slice(&lines[..start - 1]);
            new_lines.extend_from_slice(&lines[end..]);
            Ok((rebuild(new_lines), false))
        }
    }
}
