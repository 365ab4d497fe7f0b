use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tspfix::agent::{AgentConversation, ConversationOptions, HttpAgentService};
use tspfix::cancel::{cancel_pair, CancelSignal};
use tspfix::config::Settings;
use tspfix::diagnostics::{ErrorAnalyzer, FixCatalog, RuleCatalog};
use tspfix::orchestrator::Orchestrator;
use tspfix::sources::{GitHubSource, SpecWorkspace};
use tspfix::toolchain::TypeSpecToolchain;

#[derive(Parser, Debug)]
#[command(
    name = "tspfix",
    about = "Azure SDK Generator Agent: compile a TypeSpec project into a C# client and fix it until it builds",
    version
)]
struct Args {
    /// TypeSpec directory: a local path, or a path inside the spec repository with --commit-id
    #[arg(short, long)]
    typespec_dir: String,

    /// Commit of the spec repository to download from GitHub
    #[arg(short, long)]
    commit_id: Option<String>,

    /// Directory for the generated SDK (created if missing)
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tspfix={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn is_valid_commit_id(commit: &str) -> bool {
    (6..=40).contains(&commit.len()) && commit.chars().all(|c| c.is_ascii_hexdigit())
}

fn validate_args(args: &Args) -> Result<()> {
    if args.typespec_dir.trim().is_empty() {
        bail!("TypeSpec directory cannot be empty");
    }
    match &args.commit_id {
        Some(commit) if !is_valid_commit_id(commit) => {
            bail!("Commit ID must be 6-40 hexadecimal characters");
        }
        Some(_) => {}
        None => {
            if !Path::new(&args.typespec_dir).is_dir() {
                bail!("TypeSpec directory not found: {}", args.typespec_dir);
            }
        }
    }
    let parent = args
        .output_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !parent.is_dir() {
        bail!("Parent directory does not exist: {}", parent.display());
    }
    Ok(())
}

async fn run(args: Args, cancel: CancelSignal) -> tspfix::Result<()> {
    let settings = Settings::load(args.config.as_deref())?;
    settings.validate()?;

    std::fs::create_dir_all(&args.output_dir)?;
    let output_dir = args.output_dir.canonicalize()?;

    // The workspace is removed when dropped, after the run.
    let (spec_dir, workspace) = match &args.commit_id {
        Some(commit) => {
            let github = GitHubSource::from_settings(&settings)?;
            let files = github.fetch_specs(&args.typespec_dir, commit, &cancel).await?;
            let ws = SpecWorkspace::create(&output_dir, &args.typespec_dir)?;
            let written = ws.write_files(&files)?;
            info!(files = written, dir = %ws.path().display(), "Spec files ready");
            (ws.path().to_path_buf(), Some(ws))
        }
        None => (PathBuf::from(&args.typespec_dir).canonicalize()?, None),
    };

    let catalog: Arc<dyn FixCatalog> = Arc::new(RuleCatalog::new());
    let service = HttpAgentService::from_settings(&settings)?;
    let conversation =
        AgentConversation::new(service, ConversationOptions::from_settings(&settings));
    let toolchain = TypeSpecToolchain::new(&settings, &output_dir);

    let mut orchestrator = Orchestrator::new(
        toolchain,
        conversation,
        ErrorAnalyzer::new(catalog),
        spec_dir,
        settings.editable_file.clone(),
        settings.max_iterations,
    );
    let report = orchestrator.run(&cancel).await;
    drop(workspace);

    let report = report?;
    info!(
        iterations = report.iterations,
        patches = report.patches_applied,
        output = %output_dir.display(),
        "SDK generated and built successfully"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = validate_args(&args) {
        error!("{:#}", e);
        return ExitCode::FAILURE;
    }

    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            handle.cancel();
        }
    });

    match run(args, signal).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            info!("Operation cancelled, graceful shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(dir: &str, commit: Option<&str>, out: &Path) -> Args {
        Args {
            typespec_dir: dir.to_string(),
            commit_id: commit.map(str::to_string),
            output_dir: out.to_path_buf(),
            config: None,
            verbose: false,
        }
    }

    #[test]
    fn test_commit_id_format() {
        assert!(is_valid_commit_id("abc123"));
        assert!(is_valid_commit_id(&"a".repeat(40)));
        assert!(!is_valid_commit_id("abc12"));
        assert!(!is_valid_commit_id(&"a".repeat(41)));
        assert!(!is_valid_commit_id("xyz1234"));
    }

    #[test]
    fn test_validate_args() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("sdk");
        let dir = tmp.path().to_str().unwrap();

        assert!(validate_args(&args(dir, None, &out)).is_ok());
        assert!(validate_args(&args("spec/widget", Some("abc1234"), &out)).is_ok());

        let err = validate_args(&args("spec/widget", Some("nothex!"), &out)).unwrap_err();
        assert_eq!(err.to_string(), "Commit ID must be 6-40 hexadecimal characters");

        let err = validate_args(&args("/no/such/spec", None, &out)).unwrap_err();
        assert!(err.to_string().contains("TypeSpec directory not found"));

        let err = validate_args(&args(dir, None, &tmp.path().join("a/b/sdk"))).unwrap_err();
        assert!(err.to_string().contains("Parent directory does not exist"));

        assert!(validate_args(&args("  ", None, &out)).is_err());
    }
}
