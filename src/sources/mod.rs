//! Where spec files come from and where they are written back.
//!
//! A local spec directory is used in place. A GitHub checkout is downloaded
//! into a scratch directory under the output directory that lives as long as
//! its [`SpecWorkspace`].

pub mod github;

pub use github::GitHubSource;

use crate::error::{Error, Result};
use crate::util::resolve_in_base;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const SPEC_EXTENSION: &str = "tsp";
const MAX_SANITIZED_DIR_LEN: usize = 50;

/// One spec file. `name` is what the agent sees; `path` is relative to the
/// spec directory with `/` separators and is the version store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecFile {
    pub name: String,
    pub path: String,
    pub content: String,
}

impl SpecFile {
    /// A file at the top of the spec directory.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            content: content.into(),
        }
    }
}

fn is_spec_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SPEC_EXTENSION)
}

/// Read every `*.tsp` under `dir`, recursively. Files are keyed by name;
/// when two share a name the one found last wins.
pub fn read_local_specs(dir: &Path) -> Result<Vec<SpecFile>> {
    if !dir.is_dir() {
        return Err(Error::InvalidInput(format!(
            "TypeSpec directory not found: {}",
            dir.display()
        )));
    }

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::Other(format!(
                "Failed to read TypeSpec files from directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        if !entry.file_type().is_file() || !is_spec_file(entry.path()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(entry.path())?;
        let file = SpecFile {
            name: name.clone(),
            path,
            content,
        };
        if files.insert(name.clone(), file).is_some() {
            warn!(file = %name, "Duplicate spec file name, keeping {}", entry.path().display());
        }
    }

    debug!(count = files.len(), dir = %dir.display(), "Read local spec files");
    Ok(files.into_values().collect())
}

/// Write `content` to `name` inside `dir`, creating parent directories.
/// Names that would land outside `dir` are refused.
pub fn write_spec_file(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("Spec file name is empty".to_string()));
    }
    let resolved = resolve_in_base(dir, Path::new(name)).map_err(|reason| {
        Error::InvalidInput(format!("Refusing to write '{}': {}", name, reason))
    })?;
    if let Some(parent) = resolved.absolute.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&resolved.absolute, content)?;
    Ok(resolved.absolute)
}

/// Turn a spec directory like `specification/widget/Widget.Management`
/// into one path segment.
pub fn sanitize_dir_name(dir: &str) -> String {
    let mapped: String = dir
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SANITIZED_DIR_LEN)
        .collect();
    let trimmed = mapped.trim_end_matches('_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Scratch directory holding downloaded spec files. Removed on drop.
#[derive(Debug)]
pub struct SpecWorkspace {
    path: PathBuf,
}

impl SpecWorkspace {
    /// Create `{output_dir}/temp/typespec/{sanitized}/{timestamp}_{id}`.
    pub fn create(output_dir: &Path, spec_dir: &str) -> Result<Self> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = output_dir
            .join("temp")
            .join("typespec")
            .join(sanitize_dir_name(spec_dir))
            .join(format!("{}_{}", timestamp, &id[..8]));
        fs::create_dir_all(&path)?;
        debug!(path = %path.display(), "Created spec workspace");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write downloaded files. Names that escape the workspace are skipped
    /// with a warning. Returns how many were written.
    pub fn write_files(&self, files: &[SpecFile]) -> Result<usize> {
        let mut written = 0;
        for file in files {
            match write_spec_file(&self.path, &file.name, &file.content) {
                Ok(_) => written += 1,
                Err(Error::InvalidInput(reason)) => {
                    warn!(file = %file.name, "Skipping spec file: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

impl Drop for SpecWorkspace {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed spec workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove spec workspace: {}", e),
        }
    }
}
