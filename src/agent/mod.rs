//! Agent conversation
//!
//! One agent is created lazily and reused for the whole run. Every
//! generation attempt uploads the current spec files, waits for them to be
//! indexed, attaches a fresh vector store to the agent and opens a new
//! thread. Fixes are then applied one at a time on that thread.

pub mod http;
pub mod prompts;
pub mod service;

pub use http::HttpAgentService;
pub use service::{
    AgentInfo, AgentRun, AgentService, AgentSpec, FileStatus, RunStatus, UploadedFile,
};

use crate::cancel::CancelSignal;
use crate::config::Settings;
use crate::diagnostics::{parse_ai_errors, AiErrorExtractor, Fix, StructuredError};
use crate::error::{Error, Result};
use crate::parse::extract_code_block;
use crate::patch::PatchRequest;
use crate::sources::SpecFile;
use futures::future::join_all;
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLifecycle {
    Uninitialized,
    Ready,
    Disposed,
}

/// Knobs for the conversation, usually taken from [`Settings`].
#[derive(Debug, Clone)]
pub struct ConversationOptions {
    pub agent_name: String,
    pub model: String,
    pub instructions: String,
    pub editable_file: String,
    pub max_concurrent_uploads: usize,
    pub indexing_status_batch_size: usize,
    pub max_pending_files_to_show: usize,
    pub indexing_max_wait: Duration,
    pub indexing_polling_interval: Duration,
    pub vector_store_ready_wait: Duration,
    pub run_polling_interval: Duration,
    pub run_max_wait: Duration,
}

impl ConversationOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            agent_name: settings.agent_name.clone(),
            model: settings.model.clone(),
            instructions: settings
                .agent_instructions
                .clone()
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| prompts::default_instructions(&settings.editable_file)),
            editable_file: settings.editable_file.clone(),
            max_concurrent_uploads: settings.max_concurrent_uploads.max(1),
            indexing_status_batch_size: settings.indexing_status_batch_size.max(1),
            max_pending_files_to_show: settings.max_pending_files_to_show_in_debug,
            indexing_max_wait: settings.indexing_max_wait(),
            indexing_polling_interval: settings.indexing_polling_interval(),
            vector_store_ready_wait: settings.vector_store_ready_wait(),
            run_polling_interval: settings.run_polling_interval(),
            run_max_wait: settings.run_max_wait(),
        }
    }
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// What a fix response asked us to do to the TypeSpec sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEdit {
    /// Line-range edits.
    Patch(PatchRequest),
    /// Full replacement content for the editable file.
    Content(String),
}

/// Pull an edit out of a response: a JSON patch block wins, then a fenced
/// spec code block. A malformed patch still falls back to a code block.
pub fn extract_edit(response: &str, editable_file: &str) -> Result<AgentEdit> {
    let patch = PatchRequest::from_response(response, editable_file);
    if let Some(Ok(patch)) = patch {
        return Ok(AgentEdit::Patch(patch));
    }
    if let Some(content) = extract_code_block(response) {
        return Ok(AgentEdit::Content(content));
    }
    match patch {
        Some(Err(e)) => Err(Error::Patch(e)),
        _ => Err(Error::MissingContent(
            "a TypeSpec code block or JSON patch".to_string(),
        )),
    }
}

enum PollState {
    Status(FileStatus),
    Unavailable,
}

pub struct AgentConversation<S> {
    service: S,
    options: ConversationOptions,
    agent: OnceCell<AgentInfo>,
    lifecycle: Mutex<AgentLifecycle>,
    permits: Arc<Semaphore>,
}

impl<S: AgentService> AgentConversation<S> {
    pub fn new(service: S, options: ConversationOptions) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            service,
            options,
            agent: OnceCell::new(),
            lifecycle: Mutex::new(AgentLifecycle::Uninitialized),
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn lifecycle(&self) -> AgentLifecycle {
        *self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_lifecycle(&self, state: AgentLifecycle) -> AgentLifecycle {
        let mut guard = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *guard, state)
    }

    /// The shared agent, created on first use.
    async fn agent(&self, cancel: &CancelSignal) -> Result<&AgentInfo> {
        if self.lifecycle() == AgentLifecycle::Disposed {
            return Err(Error::Other("Agent conversation has been disposed".to_string()));
        }
        let agent = self
            .agent
            .get_or_try_init(|| async {
                let spec = AgentSpec {
                    name: self.options.agent_name.clone(),
                    model: self.options.model.clone(),
                    instructions: self.options.instructions.clone(),
                };
                let agent = cancel.run(self.service.create_agent(&spec)).await?;
                info!(agent_id = %agent.id, model = %spec.model, "Created agent");
                Ok::<_, Error>(agent)
            })
            .await?;
        if self.lifecycle() == AgentLifecycle::Uninitialized {
            self.set_lifecycle(AgentLifecycle::Ready);
        }
        Ok(agent)
    }

    /// Upload `files`, wait for indexing, attach them to the agent and open
    /// a new thread. Returns the thread id.
    pub async fn initialize_environment(
        &self,
        files: &[SpecFile],
        cancel: &CancelSignal,
    ) -> Result<String> {
        cancel.check()?;
        if files.is_empty() {
            return Err(Error::InvalidInput("no spec files to upload".to_string()));
        }
        let agent_id = self.agent(cancel).await?.id.clone();

        let uploaded = self.upload_files(files, cancel).await?;
        let file_ids: Vec<String> = uploaded.iter().map(|f| f.id.clone()).collect();
        self.wait_for_indexing(&uploaded, cancel).await?;

        let store_name = format!("{}-{}", self.options.agent_name, uuid::Uuid::new_v4());
        let vector_store_id = cancel
            .run(self.service.create_vector_store(&store_name, &file_ids))
            .await?;
        debug!(%vector_store_id, files = file_ids.len(), "Created vector store");
        cancel.sleep(self.options.vector_store_ready_wait).await?;
        cancel
            .run(self.service.update_agent_index(&agent_id, &vector_store_id))
            .await?;

        let thread_id = cancel.run(self.service.create_thread()).await?;
        info!(%thread_id, files = files.len(), "Agent environment ready");
        Ok(thread_id)
    }

    async fn upload_files(
        &self,
        files: &[SpecFile],
        cancel: &CancelSignal,
    ) -> Result<Vec<UploadedFile>> {
        let uploads = stream::iter(files)
            .map(|file| async move {
                let uploaded = self.service.upload_file(&file.name, &file.content).await?;
                debug!(file = %file.name, file_id = %uploaded.id, "Uploaded file");
                Ok::<_, Error>(uploaded)
            })
            .buffer_unordered(self.options.max_concurrent_uploads.max(1))
            .try_collect::<Vec<_>>();
        let uploaded = cancel.run(uploads).await?;
        info!(count = uploaded.len(), "Uploaded spec files");
        Ok(uploaded)
    }

    /// Poll upload status until every file is processed. A file in `error`
    /// fails at once; running out of time fails with per-status counts.
    async fn wait_for_indexing(&self, files: &[UploadedFile], cancel: &CancelSignal) -> Result<()> {
        let started = Instant::now();
        let mut pending: Vec<&UploadedFile> = files
            .iter()
            .filter(|f| f.status != FileStatus::Processed)
            .collect();

        while !pending.is_empty() {
            if started.elapsed() >= self.options.indexing_max_wait {
                break;
            }
            cancel.sleep(self.options.indexing_polling_interval).await?;
            let states = self.poll_statuses(&pending, cancel).await?;
            pending = pending
                .into_iter()
                .zip(states)
                .filter(|(_, state)| !matches!(state, PollState::Status(FileStatus::Processed)))
                .map(|(file, _)| file)
                .collect();
            if !pending.is_empty() {
                let shown: Vec<&str> = pending
                    .iter()
                    .take(self.options.max_pending_files_to_show)
                    .map(|f| f.name.as_str())
                    .collect();
                debug!(pending = pending.len(), files = ?shown, "Waiting for file indexing");
            }
        }

        if pending.is_empty() {
            info!(files = files.len(), "All files indexed");
            return Ok(());
        }

        // One last sweep before giving up.
        let states = self.poll_statuses(&pending, cancel).await?;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for state in &states {
            let key = match state {
                PollState::Status(FileStatus::Processed) => continue,
                PollState::Status(status) => status.to_string(),
                PollState::Unavailable => "unavailable".to_string(),
            };
            *counts.entry(key).or_default() += 1;
        }
        if counts.is_empty() {
            return Ok(());
        }
        let summary: Vec<String> = counts.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        let remaining: usize = counts.values().sum();
        Err(Error::IndexingIncomplete(format!(
            "{} of {} files not processed after {}s ({})",
            remaining,
            files.len(),
            self.options.indexing_max_wait.as_secs(),
            summary.join(", ")
        )))
    }

    async fn poll_statuses(
        &self,
        files: &[&UploadedFile],
        cancel: &CancelSignal,
    ) -> Result<Vec<PollState>> {
        let mut states = Vec::with_capacity(files.len());
        for batch in files.chunks(self.options.indexing_status_batch_size.max(1)) {
            let lookups = join_all(batch.iter().map(|f| self.service.get_file(&f.id)));
            let results = cancel.run(async move { Ok(lookups.await) }).await?;
            for (file, result) in batch.iter().zip(results) {
                let state = match result {
                    Ok(status) if status.status == FileStatus::Error => {
                        return Err(Error::IndexingIncomplete(format!(
                            "File {} failed to index: {}",
                            file.name,
                            status.status_details.unwrap_or_else(|| "no details".to_string())
                        )));
                    }
                    Ok(status) => PollState::Status(status.status),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        debug!(file = %file.name, "Status check failed: {}", e);
                        PollState::Unavailable
                    }
                };
                states.push(state);
            }
        }
        Ok(states)
    }

    /// Apply `fixes` in order on `thread_id` and return the edits to apply,
    /// oldest first. Every response must carry an edit. Whole-file content
    /// supersedes everything before it; line patches accumulate. A malformed
    /// patch rejects that one response only.
    pub async fn apply_fixes(
        &self,
        fixes: &[Fix],
        thread_id: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<AgentEdit>> {
        if fixes.is_empty() {
            return Err(Error::InvalidInput("no fixes to apply".to_string()));
        }
        let _permit = cancel
            .run(async {
                Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Other("Fix session semaphore closed".to_string()))
            })
            .await?;
        let agent_id = self.agent(cancel).await?.id.clone();

        let mut edits = Vec::new();
        for (index, fix) in fixes.iter().enumerate() {
            info!(fix = %fix, "Applying fix {}/{}", index + 1, fixes.len());
            let prompt =
                prompts::render_fix(fix, &self.options.instructions, &self.options.editable_file);
            let response = self.ask(thread_id, &agent_id, &prompt, cancel).await?;
            match extract_edit(&response, &self.options.editable_file) {
                Ok(AgentEdit::Content(content)) => {
                    edits.clear();
                    edits.push(AgentEdit::Content(content));
                }
                Ok(patch) => edits.push(patch),
                Err(Error::Patch(e)) => warn!(fix = %fix, "Ignoring malformed patch: {}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(edits)
    }

    /// Post `prompt`, run the agent to completion and return its reply.
    async fn ask(
        &self,
        thread_id: &str,
        agent_id: &str,
        prompt: &str,
        cancel: &CancelSignal,
    ) -> Result<String> {
        cancel.run(self.service.post_message(thread_id, prompt)).await?;
        let run = cancel.run(self.service.create_run(thread_id, agent_id)).await?;
        let run = self.wait_for_run(thread_id, run, cancel).await?;
        if run.status != RunStatus::Completed {
            return Err(Error::run_failed(
                run.id.clone(),
                run.status.to_string(),
                run.error_detail().as_deref(),
            ));
        }
        cancel
            .run(self.service.latest_assistant_message(thread_id))
            .await?
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| Error::MissingContent("an assistant message".to_string()))
    }

    async fn wait_for_run(
        &self,
        thread_id: &str,
        mut run: AgentRun,
        cancel: &CancelSignal,
    ) -> Result<AgentRun> {
        let started = Instant::now();
        while run.status.is_active() {
            if started.elapsed() >= self.options.run_max_wait {
                return Err(Error::timeout(
                    format!("Agent run {}", run.id),
                    self.options.run_max_wait,
                ));
            }
            cancel.sleep(self.options.run_polling_interval).await?;
            run = cancel.run(self.service.get_run(thread_id, &run.id)).await?;
            debug!(run_id = %run.id, status = %run.status, "Polled run");
        }
        Ok(run)
    }

    /// Delete every agent the service lists. Failures are logged. Safe to
    /// call more than once.
    pub async fn dispose(&self) {
        let previous = self.set_lifecycle(AgentLifecycle::Disposed);
        if previous != AgentLifecycle::Ready {
            return;
        }
        match self.service.list_agents().await {
            Ok(agents) => {
                for agent in agents {
                    match self.service.delete_agent(&agent.id).await {
                        Ok(()) => info!(agent_id = %agent.id, "Deleted agent"),
                        Err(e) => warn!(agent_id = %agent.id, "Failed to delete agent: {}", e),
                    }
                }
            }
            Err(e) => warn!("Failed to list agents for cleanup: {}", e),
        }
    }
}

impl<S: AgentService> AiErrorExtractor for AgentConversation<S> {
    async fn extract_errors(
        &self,
        text: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<StructuredError>> {
        let agent_id = self.agent(cancel).await?.id.clone();
        let thread_id = cancel.run(self.service.create_thread()).await?;
        let response = self
            .ask(&thread_id, &agent_id, &prompts::error_analysis_prompt(text), cancel)
            .await?;
        parse_ai_errors(&response)
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeAgentService;
    use super::*;
    use crate::diagnostics::PromptFix;
    use crate::patch::PatchChange;

    fn fast_options() -> ConversationOptions {
        ConversationOptions {
            indexing_max_wait: Duration::from_millis(200),
            indexing_polling_interval: Duration::from_millis(5),
            vector_store_ready_wait: Duration::from_millis(1),
            run_polling_interval: Duration::from_millis(1),
            run_max_wait: Duration::from_millis(200),
            indexing_status_batch_size: 2,
            ..ConversationOptions::default()
        }
    }

    fn files() -> Vec<SpecFile> {
        vec![
            SpecFile::new("main.tsp", "namespace Widgets;"),
            SpecFile::new("client.tsp", "import \"./main.tsp\";"),
            SpecFile::new("models.tsp", "model Widget {}"),
        ]
    }

    fn fix(text: &str) -> Fix {
        Fix::Prompt(PromptFix::new(text, None).unwrap())
    }

    #[test]
    fn test_extract_edit_prefers_patch_json() {
        let response = "```json\n{\"changes\": [{\"type\": \"replace\", \"startLine\": 1, \"endLine\": 1, \"newContent\": \"x\"}]}\n```";
        match extract_edit(response, "client.tsp").unwrap() {
            AgentEdit::Patch(p) => {
                assert_eq!(p.file, "client.tsp");
                assert_eq!(p.changes, vec![PatchChange::replace(1, 1, "", "x")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_extract_edit_code_block_and_missing() {
        let edit = extract_edit("Here:\n```tsp\nmodel A {}\n```", "client.tsp").unwrap();
        assert_eq!(edit, AgentEdit::Content("model A {}\n".to_string()));

        let err = extract_edit("I changed the file.", "client.tsp").unwrap_err();
        assert!(matches!(err, Error::MissingContent(_)));
    }

    #[tokio::test]
    async fn test_initialize_environment_uploads_indexes_and_opens_thread() {
        let service = FakeAgentService {
            file_statuses: vec![FileStatus::Pending, FileStatus::Pending, FileStatus::Processed],
            ..FakeAgentService::new()
        };
        let conversation = AgentConversation::new(service, fast_options());

        let thread = conversation
            .initialize_environment(&files(), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(thread, "thread_1");
        assert_eq!(conversation.lifecycle(), AgentLifecycle::Ready);
        let state = conversation.service.state();
        assert_eq!(state.created_agents, 1);
        assert_eq!(state.uploads.len(), 3);
        assert_eq!(state.vector_stores[0].len(), 3);
        assert_eq!(state.attached_index.as_deref(), Some("vs_1"));
    }

    #[tokio::test]
    async fn test_agent_is_created_once_across_attempts() {
        let conversation = AgentConversation::new(FakeAgentService::new(), fast_options());
        let cancel = CancelSignal::never();
        conversation.initialize_environment(&files(), &cancel).await.unwrap();
        let second = conversation.initialize_environment(&files(), &cancel).await.unwrap();

        assert_eq!(second, "thread_2");
        let state = conversation.service.state();
        assert_eq!(state.created_agents, 1);
        assert_eq!(state.attached_index.as_deref(), Some("vs_2"));
    }

    #[tokio::test]
    async fn test_indexing_timeout_reports_counts() {
        let service = FakeAgentService {
            file_statuses: vec![FileStatus::Pending],
            ..FakeAgentService::new()
        };
        let conversation = AgentConversation::new(service, fast_options());

        let err = conversation
            .initialize_environment(&files(), &CancelSignal::never())
            .await
            .unwrap_err();

        match err {
            Error::IndexingIncomplete(msg) => {
                assert!(msg.contains("3 of 3 files"), "{}", msg);
                assert!(msg.contains("pending: 3"), "{}", msg);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_error_status_fails_immediately() {
        let service = FakeAgentService {
            file_statuses: vec![FileStatus::Error],
            ..FakeAgentService::new()
        };
        let conversation = AgentConversation::new(service, fast_options());
        let err = conversation
            .initialize_environment(&files(), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to index: bad encoding"));
        // Only the first status batch was polled.
        assert_eq!(conversation.service.state().status_polls, 2);
    }

    #[tokio::test]
    async fn test_file_lookup_errors_count_as_pending() {
        let service = FakeAgentService {
            file_lookup_failures: 4,
            ..FakeAgentService::new()
        };
        let conversation = AgentConversation::new(service, fast_options());

        let thread = conversation
            .initialize_environment(&files(), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(thread, "thread_1");
        // Three failed lookups, then one more plus two good ones, then the last.
        assert_eq!(conversation.service.state().status_polls, 7);
    }

    #[tokio::test]
    async fn test_whole_file_content_supersedes_earlier_edits() {
        let service = FakeAgentService::new().with_replies(&[
            "```typespec\nfirst\n```",
            "```typespec\nsecond\n```",
        ]);
        let conversation = AgentConversation::new(service, fast_options());

        let edits = conversation
            .apply_fixes(&[fix("Fix one"), fix("Fix two")], "thread_1", &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(edits, vec![AgentEdit::Content("second\n".to_string())]);
        let state = conversation.service.state();
        assert_eq!(state.messages.len(), 2);
        assert!(state.messages[0].contains("Fix one"));
        assert!(state.messages[1].contains("Fix two"));
    }

    #[tokio::test]
    async fn test_line_patches_from_every_fix_are_kept_in_order() {
        let service = FakeAgentService::new().with_replies(&[
            "```json\n{\"changes\": [{\"type\": \"insert\", \"startLine\": 2, \"newContent\": \"a\"}]}\n```",
            "```json\n{\"changes\": [{\"type\": \"insert\", \"startLine\": 3, \"newContent\": \"b\"}]}\n```",
        ]);
        let conversation = AgentConversation::new(service, fast_options());

        let edits = conversation
            .apply_fixes(&[fix("Fix one"), fix("Fix two")], "thread_1", &CancelSignal::never())
            .await
            .unwrap();

        let inserted: Vec<PatchChange> = edits
            .into_iter()
            .map(|edit| match edit {
                AgentEdit::Patch(p) => p.changes[0].clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(inserted, vec![PatchChange::insert(2, "a"), PatchChange::insert(3, "b")]);
    }

    #[tokio::test]
    async fn test_malformed_patch_rejects_only_its_response() {
        let service = FakeAgentService::new().with_replies(&[
            "```json\n{\"changes\": [{\"type\": \"move\", \"startLine\": 1}]}\n```",
            "```typespec\nmodel A {}\n```",
        ]);
        let conversation = AgentConversation::new(service, fast_options());

        let edits = conversation
            .apply_fixes(&[fix("Fix one"), fix("Fix two")], "thread_1", &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(edits, vec![AgentEdit::Content("model A {}\n".to_string())]);
        assert_eq!(conversation.service.state().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_fix_batches_wait_for_a_permit() {
        let service = FakeAgentService {
            run_statuses: vec![RunStatus::InProgress, RunStatus::InProgress, RunStatus::Completed],
            ..FakeAgentService::new()
        };
        let mut conversation = AgentConversation::new(service, fast_options());
        conversation.permits = Arc::new(Semaphore::new(1));
        let cancel = CancelSignal::never();

        let one = [fix("Fix one")];
        let two = [fix("Fix two")];
        let (first, second) = tokio::join!(
            conversation.apply_fixes(&one, "thread_1", &cancel),
            conversation.apply_fixes(&two, "thread_2", &cancel),
        );

        assert!(first.is_ok() && second.is_ok());
        let state = conversation.service.state();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.max_active_runs, 1);
    }

    #[tokio::test]
    async fn test_failed_run_is_fatal() {
        let service = FakeAgentService {
            run_statuses: vec![RunStatus::InProgress, RunStatus::Failed],
            ..FakeAgentService::new()
        };
        let conversation = AgentConversation::new(service, fast_options());
        let err = conversation
            .apply_fixes(&[fix("Fix one")], "thread_1", &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunFailed { ref status, .. } if status == "failed"));
    }

    #[tokio::test]
    async fn test_run_that_never_finishes_times_out() {
        let service = FakeAgentService {
            run_statuses: vec![RunStatus::InProgress],
            ..FakeAgentService::new()
        };
        let conversation = AgentConversation::new(service, fast_options());
        let err = conversation
            .apply_fixes(&[fix("Fix one")], "thread_1", &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_ai_extraction_parses_errors() {
        let service = FakeAgentService::new()
            .with_replies(&[r#"{"errors": [{"type": "X1", "message": "broken"}]}"#]);
        let conversation = AgentConversation::new(service, fast_options());
        let errors = conversation
            .extract_errors("garbled output", &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(errors, vec![StructuredError::new("X1", "broken")]);
        assert!(conversation.service.state().messages[0].contains("garbled output"));
    }

    #[tokio::test]
    async fn test_dispose_deletes_agents_once_and_blocks_reuse() {
        let conversation = AgentConversation::new(FakeAgentService::new(), fast_options());
        let cancel = CancelSignal::never();
        conversation.initialize_environment(&files(), &cancel).await.unwrap();

        conversation.dispose().await;
        conversation.dispose().await;

        assert_eq!(conversation.lifecycle(), AgentLifecycle::Disposed);
        assert_eq!(conversation.service.state().deleted_agents, vec!["asst_1".to_string()]);
        assert!(conversation.initialize_environment(&files(), &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_dispose_without_agent_is_a_no_op() {
        let conversation = AgentConversation::new(FakeAgentService::new(), fast_options());
        conversation.dispose().await;
        assert!(conversation.service.state().deleted_agents.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_upload() {
        let (handle, signal) = crate::cancel::cancel_pair();
        handle.cancel();
        let conversation = AgentConversation::new(FakeAgentService::new(), fast_options());
        let err = conversation.initialize_environment(&files(), &signal).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
