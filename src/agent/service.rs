//! The agent service seam: everything the conversation needs from a hosted
//! assistants-style API.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// What to create when the conversation first needs an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub model: String,
    pub instructions: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
    Incomplete,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Still worth polling.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::InProgress)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

impl AgentRun {
    pub fn error_detail(&self) -> Option<String> {
        let err = self.last_error.as_ref()?;
        match (&err.code, &err.message) {
            (Some(code), Some(message)) => Some(format!("{} ({})", message, code)),
            (None, Some(message)) => Some(message.clone()),
            (Some(code), None) => Some(code.clone()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploaded,
    Pending,
    Processed,
    Error,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileStatus::Uploaded => "uploaded",
            FileStatus::Pending => "pending",
            FileStatus::Processed => "processed",
            FileStatus::Error => "error",
            FileStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    #[serde(default, alias = "filename")]
    pub name: String,
    pub status: FileStatus,
    #[serde(default)]
    pub status_details: Option<String>,
}

/// Operations the conversation performs against the hosted agent API.
pub trait AgentService {
    fn create_agent(&self, spec: &AgentSpec) -> impl Future<Output = Result<AgentInfo>>;

    fn list_agents(&self) -> impl Future<Output = Result<Vec<AgentInfo>>>;

    fn delete_agent(&self, agent_id: &str) -> impl Future<Output = Result<()>>;

    /// Point the agent's file search at `vector_store_id`, replacing any
    /// previous index.
    fn update_agent_index(
        &self,
        agent_id: &str,
        vector_store_id: &str,
    ) -> impl Future<Output = Result<()>>;

    fn upload_file(&self, name: &str, content: &str) -> impl Future<Output = Result<UploadedFile>>;

    fn get_file(&self, file_id: &str) -> impl Future<Output = Result<UploadedFile>>;

    fn create_vector_store(
        &self,
        name: &str,
        file_ids: &[String],
    ) -> impl Future<Output = Result<String>>;

    fn create_thread(&self) -> impl Future<Output = Result<String>>;

    fn post_message(&self, thread_id: &str, content: &str) -> impl Future<Output = Result<()>>;

    fn create_run(&self, thread_id: &str, agent_id: &str) -> impl Future<Output = Result<AgentRun>>;

    fn get_run(&self, thread_id: &str, run_id: &str) -> impl Future<Output = Result<AgentRun>>;

    /// Text of the newest assistant message on the thread.
    fn latest_assistant_message(
        &self,
        thread_id: &str,
    ) -> impl Future<Output = Result<Option<String>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_wire_names() {
        let run: AgentRun =
            serde_json::from_str(r#"{"id": "run_1", "status": "in_progress"}"#).unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(run.status.is_active());

        let run: AgentRun =
            serde_json::from_str(r#"{"id": "run_1", "status": "something_new"}"#).unwrap();
        assert_eq!(run.status, RunStatus::Unknown);
        assert!(!run.status.is_active());
    }

    #[test]
    fn test_run_error_detail() {
        let run: AgentRun = serde_json::from_str(
            r#"{"id": "r", "status": "failed", "last_error": {"code": "rate_limit_exceeded", "message": "Slow down"}}"#,
        )
        .unwrap();
        assert_eq!(run.error_detail().as_deref(), Some("Slow down (rate_limit_exceeded)"));
    }

    #[test]
    fn test_uploaded_file_accepts_filename_alias() {
        let file: UploadedFile = serde_json::from_str(
            r#"{"id": "f1", "filename": "main.tsp", "status": "processed"}"#,
        )
        .unwrap();
        assert_eq!(file.name, "main.tsp");
        assert_eq!(file.status, FileStatus::Processed);
    }
}
