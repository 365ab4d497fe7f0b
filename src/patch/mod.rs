//! Line-range patches against spec files
//!
//! A [`PatchRequest`] is a batch of 1-based line edits for one file. Parsing
//! is forgiving about how a model spells the JSON; application in
//! [`engine`] is strict about bounds and all-or-nothing.

mod engine;

pub use engine::{apply_changes, PatchEngine, MAX_CHANGES_PER_PATCH};

use crate::parse::{extract_json_block, parse_lenient_object};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Replace,
    Insert,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Replace => "replace",
            ChangeKind::Insert => "insert",
            ChangeKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(ChangeKind::Replace),
            "insert" => Ok(ChangeKind::Insert),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(PatchError::Malformed(format!("unknown change type '{}'", other))),
        }
    }
}

/// One edit. Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub start_line: usize,
    pub end_line: usize,
    pub old_content: String,
    pub new_content: String,
}

impl PatchChange {
    pub fn replace(start_line: usize, end_line: usize, old: &str, new: &str) -> Self {
        Self {
            kind: ChangeKind::Replace,
            start_line,
            end_line,
            old_content: old.to_string(),
            new_content: new.to_string(),
        }
    }

    pub fn insert(at_line: usize, new: &str) -> Self {
        Self {
            kind: ChangeKind::Insert,
            start_line: at_line,
            end_line: at_line,
            old_content: String::new(),
            new_content: new.to_string(),
        }
    }

    pub fn delete(start_line: usize, end_line: usize) -> Self {
        Self {
            kind: ChangeKind::Delete,
            start_line,
            end_line,
            old_content: String::new(),
            new_content: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    pub file: String,
    pub from_version: u64,
    pub reason: String,
    pub changes: Vec<PatchChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("Invalid target path '{file}': {reason}")]
    InvalidPath { file: String, reason: String },

    #[error("Target file not found: {0}")]
    FileNotFound(String),

    #[error("Patch has {count} changes, maximum is {max}")]
    TooManyChanges { count: usize, max: usize },

    #[error("Change {index} is invalid: {reason}")]
    InvalidChange { index: usize, reason: String },

    #[error("Change {index} ({kind} {start}-{end}) is out of bounds for a file of {line_count} lines")]
    OutOfBounds {
        index: usize,
        kind: ChangeKind,
        start: usize,
        end: usize,
        line_count: usize,
    },

    #[error("No history entry for {file} at version {version}")]
    NoHistory { file: String, version: u64 },

    #[error("Malformed patch: {0}")]
    Malformed(String),

    #[error("I/O error on {file}: {message}")]
    Io { file: String, message: String },
}

#[derive(Deserialize)]
struct RawPatch {
    #[serde(default)]
    file: Option<String>,
    #[serde(default, rename = "fromversion")]
    from_version: Option<u64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    changes: Vec<RawChange>,
}

#[derive(Deserialize)]
struct RawChange {
    #[serde(rename = "type", alias = "kind")]
    kind: String,
    #[serde(rename = "startline")]
    start_line: i64,
    #[serde(default, rename = "endline")]
    end_line: Option<i64>,
    #[serde(default, rename = "oldcontent")]
    old_content: Option<String>,
    #[serde(default, rename = "newcontent")]
    new_content: Option<String>,
}

impl PatchRequest {
    /// Parse a patch out of a model response. Key spelling and casing are
    /// ignored, trailing commas and fences are tolerated. `default_file` is
    /// used when the patch does not name its target.
    pub fn parse(text: &str, default_file: &str) -> Result<Self, PatchError> {
        let value = parse_lenient_object(text)
            .ok_or_else(|| PatchError::Malformed("no JSON object found".to_string()))?;
        let raw: RawPatch =
            serde_json::from_value(value).map_err(|e| PatchError::Malformed(e.to_string()))?;

        let changes = raw
            .changes
            .into_iter()
            .map(|c| {
                let kind = c.kind.parse::<ChangeKind>()?;
                // Negative lines collapse to 0 and fail validation.
                let start_line = usize::try_from(c.start_line).unwrap_or(0);
                let end_line = c
                    .end_line
                    .map(|e| usize::try_from(e).unwrap_or(0))
                    .unwrap_or(start_line);
                Ok(PatchChange {
                    kind,
                    start_line,
                    end_line,
                    old_content: c.old_content.unwrap_or_default(),
                    new_content: c.new_content.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, PatchError>>()?;

        Ok(Self {
            file: raw
                .file
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| default_file.to_string()),
            from_version: raw.from_version.unwrap_or_default(),
            reason: raw
                .reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "Agent patch".to_string()),
            changes,
        })
    }

    /// A patch in a fenced ```json block of `response`, if there is one.
    pub fn from_response(response: &str, default_file: &str) -> Option<Result<Self, PatchError>> {
        let block = extract_json_block(response)?;
        let looks_like_patch = block.to_ascii_lowercase().contains("\"changes\"");
        looks_like_patch.then(|| Self::parse(block, default_file))
    }

    /// Replace the whole of `current` with `new_content`. An empty file gets
    /// an append instead.
    pub fn whole_file(
        file: &str,
        from_version: u64,
        current: &str,
        new_content: &str,
        reason: &str,
    ) -> Self {
        let line_count = crate::util::line_count(current);
        let change = if line_count == 0 {
            PatchChange::replace(1, 1, "", new_content)
        } else {
            PatchChange::replace(1, line_count, "", new_content)
        };
        Self {
            file: file.to_string(),
            from_version,
            reason: reason.to_string(),
            changes: vec![change],
        }
    }
}
