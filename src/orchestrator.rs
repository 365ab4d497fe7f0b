//! The build-fix loop
//!
//! ```text
//! install → ┌─ compile ─ok─ build ─ok─▶ done
//!           │     │fail       │fail
//!           │     └─────┬─────┘
//!           │        analyze → fixes → agent → patch
//!           └──────────────────────────────┘   (until max_iterations)
//! ```
//!
//! Compile and build failures drive the loop. Any other error ends the run.
//! The fix session is disposed on every exit path.

use crate::agent::{AgentConversation, AgentEdit, AgentService};
use crate::cancel::CancelSignal;
use crate::diagnostics::{AiErrorExtractor, ErrorAnalyzer, Fix};
use crate::error::{Error, Result};
use crate::patch::{PatchEngine, PatchRequest};
use crate::sources::{read_local_specs, SpecFile};
use crate::toolchain::{StepOutcome, Toolchain};
use crate::util::tail_chars;
use crate::versions::VersionStore;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Max chars of a failed install's output carried into the error.
const INSTALL_ERROR_TAIL_CHARS: usize = 2000;

/// Turns fixes into an edit of the TypeSpec sources.
pub trait FixSession: AiErrorExtractor {
    /// Make `files` available to the agent and open a thread for one
    /// generation attempt.
    fn initialize_environment(
        &self,
        files: &[SpecFile],
        cancel: &CancelSignal,
    ) -> impl Future<Output = Result<String>>;

    /// Edits to apply in order. May be empty when no response was usable.
    fn apply_fixes(
        &self,
        fixes: &[Fix],
        thread_id: &str,
        cancel: &CancelSignal,
    ) -> impl Future<Output = Result<Vec<AgentEdit>>>;

    /// Release remote resources. Never fails.
    fn dispose(&self) -> impl Future<Output = ()>;
}

impl<S: AgentService> FixSession for AgentConversation<S> {
    async fn initialize_environment(
        &self,
        files: &[SpecFile],
        cancel: &CancelSignal,
    ) -> Result<String> {
        AgentConversation::initialize_environment(self, files, cancel).await
    }

    async fn apply_fixes(
        &self,
        fixes: &[Fix],
        thread_id: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<AgentEdit>> {
        AgentConversation::apply_fixes(self, fixes, thread_id, cancel).await
    }

    async fn dispose(&self) {
        AgentConversation::dispose(self).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    /// Iteration that produced the clean build, 1-based.
    pub iterations: usize,
    pub patches_applied: usize,
    pub final_version: u64,
}

pub struct Orchestrator<T, F> {
    toolchain: T,
    session: F,
    analyzer: ErrorAnalyzer,
    patches: PatchEngine,
    versions: VersionStore,
    spec_dir: PathBuf,
    editable_file: String,
    max_iterations: usize,
}

impl<T: Toolchain, F: FixSession> Orchestrator<T, F> {
    pub fn new(
        toolchain: T,
        session: F,
        analyzer: ErrorAnalyzer,
        spec_dir: impl Into<PathBuf>,
        editable_file: impl Into<String>,
        max_iterations: usize,
    ) -> Self {
        let spec_dir = spec_dir.into();
        Self {
            toolchain,
            session,
            analyzer,
            patches: PatchEngine::new(&spec_dir),
            versions: VersionStore::new(),
            spec_dir,
            editable_file: editable_file.into(),
            max_iterations,
        }
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    /// Install, then compile/build/fix until clean or out of iterations.
    pub async fn run(&mut self, cancel: &CancelSignal) -> Result<GenerationReport> {
        let result = self.run_loop(cancel).await;
        self.session.dispose().await;
        match &result {
            Ok(report) => info!(
                iterations = report.iterations,
                patches = report.patches_applied,
                "Generation succeeded"
            ),
            Err(e) if e.is_cancelled() => info!("Generation cancelled"),
            Err(e) => warn!("Generation failed: {}", e),
        }
        result
    }

    async fn run_loop(&mut self, cancel: &CancelSignal) -> Result<GenerationReport> {
        if self.max_iterations == 0 {
            return Err(Error::InvalidInput("max iterations must be at least 1".to_string()));
        }
        self.ensure_editable_file()?;

        let install = self.toolchain.install(cancel).await?;
        if let StepOutcome::Failed(result) = install {
            return Err(Error::Other(format!(
                "Failed to install TypeSpec dependencies: {}",
                tail_chars(&result.combined_output(), INSTALL_ERROR_TAIL_CHARS)
            )));
        }

        let mut patches_applied = 0;
        for iteration in 1..=self.max_iterations {
            cancel.check()?;
            info!(iteration, max = self.max_iterations, "Starting iteration");

            let (step, failure) = match self.toolchain.compile(&self.spec_dir, cancel).await? {
                StepOutcome::Failed(result) => ("compile", result),
                StepOutcome::Succeeded(_) => match self.toolchain.build(cancel).await? {
                    StepOutcome::Succeeded(_) => {
                        return Ok(GenerationReport {
                            iterations: iteration,
                            patches_applied,
                            final_version: self.versions.current_version(),
                        });
                    }
                    StepOutcome::Failed(result) => ("build", result),
                },
            };
            info!(
                step,
                exit_code = ?failure.exit_code,
                timed_out = failure.timed_out,
                "Step failed"
            );

            let output = failure.combined_output();
            let errors = self
                .analyzer
                .analyze(&output, Some(&self.session), cancel)
                .await?;
            let fixes = self.analyzer.fixes_for(&errors);
            if fixes.is_empty() {
                return Err(Error::NoAddressableErrors {
                    step: step.to_string(),
                });
            }
            info!(errors = errors.len(), fixes = fixes.len(), "Generated fixes");

            let files = read_local_specs(&self.spec_dir)?;
            for file in &files {
                self.versions.get_or_create(&file.path, &file.content);
            }
            let thread_id = self.session.initialize_environment(&files, cancel).await?;
            let edits = self.session.apply_fixes(&fixes, &thread_id, cancel).await?;
            if edits.is_empty() {
                warn!(iteration, "Agent returned no usable edit, continuing");
            }

            for edit in edits {
                let request = self.patch_request(edit, iteration)?;
                match self.patches.apply(&mut self.versions, &request) {
                    Ok(meta) => {
                        patches_applied += 1;
                        info!(
                            file = %meta.path,
                            version = meta.version,
                            lines = meta.line_count,
                            "Spec updated"
                        );
                    }
                    Err(e) => warn!(file = %request.file, "Patch rejected, continuing: {}", e),
                }
            }
        }

        Err(Error::MaxIterationsReached(self.max_iterations))
    }

    fn editable_path(&self) -> PathBuf {
        self.spec_dir.join(&self.editable_file)
    }

    fn ensure_editable_file(&self) -> Result<()> {
        let path = self.editable_path();
        if !path.exists() {
            debug!(path = %path.display(), "Creating empty editable file");
            fs::write(&path, "")?;
        }
        Ok(())
    }

    fn patch_request(&self, edit: AgentEdit, iteration: usize) -> Result<PatchRequest> {
        match edit {
            AgentEdit::Patch(request) => Ok(request),
            AgentEdit::Content(content) => {
                let current = fs::read_to_string(self.editable_path())?;
                let from_version = self
                    .versions
                    .metadata(&self.editable_file)
                    .map(|m| m.version)
                    .unwrap_or_else(|| self.versions.current_version());
                Ok(PatchRequest::whole_file(
                    &self.editable_file,
                    from_version,
                    &current,
                    &content,
                    &format!("Agent fixes, iteration {}", iteration),
                ))
            }
        }
    }
}
