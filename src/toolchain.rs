//! Install, compile and build commands for a TypeSpec C# client.

use crate::cancel::CancelSignal;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::process::{CommandSpec, ProcessResult, ProcessRunner};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Result of one toolchain step. A failed step is not an error; its output
/// feeds error extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded(ProcessResult),
    Failed(ProcessResult),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded(_))
    }

    pub fn result(&self) -> &ProcessResult {
        match self {
            StepOutcome::Succeeded(r) | StepOutcome::Failed(r) => r,
        }
    }
}

impl From<ProcessResult> for StepOutcome {
    fn from(result: ProcessResult) -> Self {
        if result.succeeded {
            StepOutcome::Succeeded(result)
        } else {
            StepOutcome::Failed(result)
        }
    }
}

/// The three external steps the orchestrator drives.
pub trait Toolchain {
    fn install(&self, cancel: &CancelSignal) -> impl Future<Output = Result<StepOutcome>>;

    fn compile(
        &self,
        spec_dir: &Path,
        cancel: &CancelSignal,
    ) -> impl Future<Output = Result<StepOutcome>>;

    fn build(&self, cancel: &CancelSignal) -> impl Future<Output = Result<StepOutcome>>;
}

#[derive(Debug, Clone)]
pub struct TypeSpecToolchain {
    runner: ProcessRunner,
    output_dir: PathBuf,
    emitter: String,
    compiler: String,
    install_timeout: Duration,
    compile_timeout: Duration,
    build_timeout: Duration,
}

impl TypeSpecToolchain {
    pub fn new(settings: &Settings, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner: ProcessRunner::new(settings.allowed_commands.iter().cloned()),
            output_dir: output_dir.into(),
            emitter: settings.emitter_package.clone(),
            compiler: settings.compiler_package.clone(),
            install_timeout: Duration::from_secs(settings.install_timeout_secs),
            compile_timeout: Duration::from_secs(settings.compile_timeout_secs),
            build_timeout: Duration::from_secs(settings.build_timeout_secs),
        }
    }

    fn install_command(&self) -> CommandSpec {
        CommandSpec::new("npm", &self.output_dir)
            .args(["install", "--global", self.compiler.as_str(), self.emitter.as_str()])
            .timeout(self.install_timeout)
    }

    fn compile_command(&self, spec_dir: &Path) -> CommandSpec {
        let output_option = format!(
            "{}.emitter-output-dir={}",
            self.emitter,
            self.output_dir.display()
        );
        CommandSpec::new("tsp", spec_dir)
            .args([
                "compile",
                ".",
                "--emit",
                self.emitter.as_str(),
                "--option",
                output_option.as_str(),
            ])
            .timeout(self.compile_timeout)
    }

    fn build_command(&self, target: &Path) -> CommandSpec {
        CommandSpec::new("dotnet", &self.output_dir)
            .args(["build".to_string(), target.display().to_string()])
            .timeout(self.build_timeout)
    }

    async fn run_step(
        &self,
        step: &str,
        spec: CommandSpec,
        cancel: &CancelSignal,
    ) -> Result<StepOutcome> {
        info!(step, command = %spec.label(), "Running step");
        let result = self.runner.run(&spec, cancel).await?;
        if result.timed_out {
            warn!(step, duration_ms = result.duration_ms, "Step timed out");
        }
        Ok(result.into())
    }
}

impl Toolchain for TypeSpecToolchain {
    async fn install(&self, cancel: &CancelSignal) -> Result<StepOutcome> {
        self.run_step("install", self.install_command(), cancel).await
    }

    async fn compile(&self, spec_dir: &Path, cancel: &CancelSignal) -> Result<StepOutcome> {
        self.run_step("compile", self.compile_command(spec_dir), cancel).await
    }

    async fn build(&self, cancel: &CancelSignal) -> Result<StepOutcome> {
        let target = find_build_target(&self.output_dir)?;
        self.run_step("build", self.build_command(&target), cancel).await
    }
}

/// The first `.sln` directly in `dir`, else the first `.csproj` anywhere
/// below it. Both in file name order.
pub fn find_build_target(dir: &Path) -> Result<PathBuf> {
    let with_ext = |path: &Path, ext: &str| path.extension().and_then(|e| e.to_str()) == Some(ext);

    let solution = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && with_ext(e.path(), "sln"));
    if let Some(entry) = solution {
        return Ok(entry.into_path());
    }

    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && with_ext(e.path(), "csproj"))
        .map(|e| e.into_path())
        .ok_or_else(|| {
            Error::Other(format!(
                "No .sln or .csproj file found in {}",
                dir.display()
            ))
        })
}
