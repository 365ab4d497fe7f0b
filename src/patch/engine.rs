use super::{ChangeKind, PatchChange, PatchError, PatchRequest};
use crate::util::resolve_in_base;
use crate::versions::{FileMetadata, VersionStore};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MAX_CHANGES_PER_PATCH: usize = 20;

/// Applies patches to files under one base directory and keeps the
/// [`VersionStore`] in step with what is on disk.
#[derive(Debug, Clone)]
pub struct PatchEngine {
    base_dir: PathBuf,
}

struct Target {
    key: String,
    path: PathBuf,
}

impl PatchEngine {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Validate and apply `request`. On any error the file is untouched and
    /// the store is unchanged.
    pub fn apply(
        &self,
        store: &mut VersionStore,
        request: &PatchRequest,
    ) -> Result<FileMetadata, PatchError> {
        let target = self.resolve(&request.file)?;
        validate(request)?;

        if let Some(meta) = store.metadata(&target.key) {
            if meta.version != request.from_version {
                warn!(
                    file = %target.key,
                    expected = request.from_version,
                    actual = meta.version,
                    "Patch was generated against a different version"
                );
            }
        }

        let original = fs::read_to_string(&target.path)
            .map_err(|e| io_error(&target.key, e))?;
        let lines: Vec<String> = original.lines().map(str::to_string).collect();
        let updated = apply_changes(&lines, &request.changes)?;
        let content = render(&original, &updated);

        write_atomic(&target.path, &content).map_err(|e| io_error(&target.key, e))?;

        store.get_or_create(&target.key, &original);
        store.save_to_history(&target.key, &original, "Before patch");
        let meta = store.update(&target.key, &content);
        store.save_to_history(&target.key, &content, &request.reason);

        info!(
            file = %target.key,
            changes = request.changes.len(),
            version = meta.version,
            "Applied patch"
        );
        Ok(meta)
    }

    /// Restore `file` to the content recorded in its history at `version`.
    pub fn rollback(
        &self,
        store: &mut VersionStore,
        file: &str,
        version: u64,
    ) -> Result<FileMetadata, PatchError> {
        let target = self.resolve_path(file)?;
        let entry = store
            .history_entry(&target.key, version)
            .cloned()
            .ok_or_else(|| PatchError::NoHistory {
                file: target.key.clone(),
                version,
            })?;

        if let Ok(current) = fs::read_to_string(&target.path) {
            store.save_to_history(&target.key, &current, "Before rollback");
        }
        write_atomic(&target.path, &entry.content).map_err(|e| io_error(&target.key, e))?;
        let meta = store.update(&target.key, &entry.content);

        info!(file = %target.key, restored = version, version = meta.version, "Rolled back file");
        Ok(meta)
    }

    fn resolve(&self, file: &str) -> Result<Target, PatchError> {
        let target = self.resolve_path(file)?;
        if !target.path.is_file() {
            return Err(PatchError::FileNotFound(target.key));
        }
        Ok(target)
    }

    fn resolve_path(&self, file: &str) -> Result<Target, PatchError> {
        let resolved =
            resolve_in_base(&self.base_dir, Path::new(file)).map_err(|reason| {
                PatchError::InvalidPath {
                    file: file.to_string(),
                    reason,
                }
            })?;
        Ok(Target {
            key: resolved.relative.to_string_lossy().replace('\\', "/"),
            path: resolved.absolute,
        })
    }
}

fn validate(request: &PatchRequest) -> Result<(), PatchError> {
    if request.changes.len() > MAX_CHANGES_PER_PATCH {
        return Err(PatchError::TooManyChanges {
            count: request.changes.len(),
            max: MAX_CHANGES_PER_PATCH,
        });
    }
    for (index, change) in request.changes.iter().enumerate() {
        if change.start_line == 0 || change.end_line == 0 {
            return Err(PatchError::InvalidChange {
                index,
                reason: "line numbers must be greater than 0".to_string(),
            });
        }
        if change.start_line > change.end_line {
            return Err(PatchError::InvalidChange {
                index,
                reason: format!(
                    "start line {} is after end line {}",
                    change.start_line, change.end_line
                ),
            });
        }
    }
    Ok(())
}

/// Apply `changes` to `lines` from the bottom of the file up, so earlier
/// edits never shift the line numbers of later ones. Submission order of
/// non-overlapping changes does not matter.
pub fn apply_changes(lines: &[String], changes: &[PatchChange]) -> Result<Vec<String>, PatchError> {
    let mut ordered: Vec<(usize, &PatchChange)> = changes.iter().enumerate().collect();
    ordered.sort_by(|(_, a), (_, b)| b.start_line.cmp(&a.start_line));

    let mut out = lines.to_vec();
    for (index, change) in ordered {
        apply_one(&mut out, index, change)?;
    }
    Ok(out)
}

fn apply_one(
    lines: &mut Vec<String>,
    index: usize,
    change: &PatchChange,
) -> Result<(), PatchError> {
    let line_count = lines.len();
    let out_of_bounds = || PatchError::OutOfBounds {
        index,
        kind: change.kind,
        start: change.start_line,
        end: change.end_line,
        line_count,
    };
    let start = change.start_line.checked_sub(1).ok_or_else(out_of_bounds)?;
    let end = change.end_line.checked_sub(1).ok_or_else(out_of_bounds)?;
    let replacement = split_content(&change.new_content);

    match change.kind {
        ChangeKind::Replace => {
            if start == line_count && change.old_content.trim().is_empty() {
                lines.extend(replacement);
                return Ok(());
            }
            if start > end || end >= line_count {
                return Err(out_of_bounds());
            }
            check_old_content(lines, start, end, change);
            lines.splice(start..=end, replacement);
        }
        ChangeKind::Insert => {
            if start > line_count {
                return Err(out_of_bounds());
            }
            lines.splice(start..start, replacement);
        }
        ChangeKind::Delete => {
            if start > end || end >= line_count {
                return Err(out_of_bounds());
            }
            lines.drain(start..=end);
        }
    }
    Ok(())
}

fn check_old_content(lines: &[String], start: usize, end: usize, change: &PatchChange) {
    if change.old_content.trim().is_empty() {
        return;
    }
    let current = lines[start..=end].join("\n");
    if current.trim() != change.old_content.trim() {
        debug!(
            start_line = change.start_line,
            end_line = change.end_line,
            "Old content does not match current lines; applying anyway"
        );
    }
}

/// Split replacement text into lines. Empty text is one empty line; a
/// trailing newline does not add an extra line.
fn split_content(content: &str) -> Vec<String> {
    let content = content.strip_suffix('\n').unwrap_or(content);
    content
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect()
}

fn render(original: &str, lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let newline = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut content = lines.join(newline);
    if original.is_empty() || original.ends_with('\n') {
        content.push_str(newline);
    }
    content
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn io_error(file: &str, err: std::io::Error) -> PatchError {
    PatchError::Io {
        file: file.to_string(),
        message: err.to_string(),
    }
}
