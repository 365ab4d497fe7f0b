//! Configuration management for tspfix
//!
//! Settings live in a JSON file: an explicit `--config` path, else
//! ~/.config/tspfix/config.json, else built-in defaults. A handful of
//! environment variables override the file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const ENV_PROJECT_ENDPOINT: &str = "TSPFIX_PROJECT_ENDPOINT";
pub const ENV_API_KEY: &str = "TSPFIX_API_KEY";
pub const ENV_MODEL: &str = "TSPFIX_MODEL";
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Base URL of the agent project, e.g. `https://<name>.services.ai.azure.com/api/projects/<p>`
    pub project_endpoint: Option<String>,
    pub api_key: Option<String>,
    pub api_version: String,
    pub model: String,
    pub agent_name: String,
    pub agent_instructions: Option<String>,

    pub indexing_max_wait_secs: u64,
    pub indexing_polling_interval_secs: u64,
    pub vector_store_ready_wait_ms: u64,
    pub max_concurrent_uploads: usize,
    pub indexing_status_batch_size: usize,
    pub max_pending_files_to_show_in_debug: usize,
    pub run_polling_interval_secs: u64,
    pub run_max_wait_secs: u64,
    pub http_timeout_secs: u64,

    pub max_iterations: usize,
    /// The only spec file the agent is allowed to rewrite.
    pub editable_file: String,

    pub emitter_package: String,
    pub compiler_package: String,
    pub install_timeout_secs: u64,
    pub compile_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub allowed_commands: Vec<String>,

    pub spec_repository: String,
    pub github_api_base: String,
    pub github_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_endpoint: None,
            api_key: None,
            api_version: "2025-05-01".to_string(),
            model: "gpt-4o".to_string(),
            agent_name: "AZC Fixer".to_string(),
            agent_instructions: None,
            indexing_max_wait_secs: 180,
            indexing_polling_interval_secs: 5,
            vector_store_ready_wait_ms: 5000,
            max_concurrent_uploads: 10,
            indexing_status_batch_size: 10,
            max_pending_files_to_show_in_debug: 3,
            run_polling_interval_secs: 5,
            run_max_wait_secs: 300,
            http_timeout_secs: 120,
            max_iterations: 5,
            editable_file: "client.tsp".to_string(),
            emitter_package: "@typespec/http-client-csharp".to_string(),
            compiler_package: "@typespec/compiler".to_string(),
            install_timeout_secs: 600,
            compile_timeout_secs: 600,
            build_timeout_secs: 900,
            allowed_commands: crate::process::DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            spec_repository: "Azure/azure-rest-api-specs".to_string(),
            github_api_base: "https://api.github.com".to_string(),
            github_token: None,
        }
    }
}

impl Settings {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tspfix"))
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load settings from `explicit` (which must exist), else the default
    /// location, else defaults. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match explicit {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&content).map_err(|e| {
                    Error::Config(format!("Invalid config {}: {}", path.display(), e))
                })?
            }
            None => Self::default_path()
                .map(|path| Self::load_or_default(&path))
                .unwrap_or_default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Read `path`; a corrupted file is moved aside and defaults are used.
    pub fn load_or_default(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            debug!(path = %path.display(), "No config file, using defaults");
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    "Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                    err
                );
                Self::default()
            }
        }
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(endpoint) = non_empty(ENV_PROJECT_ENDPOINT) {
            self.project_endpoint = Some(endpoint);
        }
        if let Some(key) = non_empty(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(model) = non_empty(ENV_MODEL) {
            self.model = model;
        }
        if let Some(token) = non_empty(ENV_GITHUB_TOKEN) {
            self.github_token = Some(token);
        }
    }

    pub fn project_endpoint(&self) -> Result<&str> {
        required("ProjectEndpoint", self.project_endpoint.as_deref())
    }

    pub fn api_key(&self) -> Result<&str> {
        required("ApiKey", self.api_key.as_deref())
    }

    /// Check the values that would otherwise fail deep inside a run.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Config("maxIterations must be at least 1".to_string()));
        }
        if self.max_concurrent_uploads == 0 || self.indexing_status_batch_size == 0 {
            return Err(Error::Config(
                "maxConcurrentUploads and indexingStatusBatchSize must be at least 1".to_string(),
            ));
        }
        required("EditableFile", Some(self.editable_file.as_str()))?;
        required("EmitterPackage", Some(self.emitter_package.as_str()))?;
        Ok(())
    }

    pub fn indexing_max_wait(&self) -> Duration {
        Duration::from_secs(self.indexing_max_wait_secs)
    }

    pub fn indexing_polling_interval(&self) -> Duration {
        Duration::from_secs(self.indexing_polling_interval_secs)
    }

    pub fn vector_store_ready_wait(&self) -> Duration {
        Duration::from_millis(self.vector_store_ready_wait_ms)
    }

    pub fn run_polling_interval(&self) -> Duration {
        Duration::from_secs(self.run_polling_interval_secs)
    }

    pub fn run_max_wait(&self) -> Duration {
        Duration::from_secs(self.run_max_wait_secs)
    }
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Config(format!(
            "Required configuration setting '{}' is missing or empty",
            name
        ))),
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.model, "gpt-4o");
        assert_eq!(settings.agent_name, "AZC Fixer");
        assert_eq!(settings.indexing_max_wait(), Duration::from_secs(180));
        assert_eq!(settings.vector_store_ready_wait(), Duration::from_millis(5000));
        assert_eq!(settings.max_concurrent_uploads, 10);
        assert_eq!(settings.indexing_status_batch_size, 10);
        assert_eq!(settings.emitter_package, "@typespec/http-client-csharp");
        assert!(settings.allowed_commands.iter().any(|c| c == "tsp"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"model": "gpt-4.1", "maxIterations": 3}"#).unwrap();

        let settings = Settings::load_or_default(&path);
        assert_eq!(settings.model, "gpt-4.1");
        assert_eq!(settings.max_iterations, 3);
        assert_eq!(settings.editable_file, "client.tsp");
    }

    #[test]
    fn test_corrupt_file_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let settings = Settings::load_or_default(&path);
        assert_eq!(settings, Settings::default());
        assert!(!path.exists());
        let backup = dir.path().join("config.json.corrupt");
        assert_eq!(fs::read_to_string(backup).unwrap(), "{ not json");
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_PROJECT_ENDPOINT, "https://example.test/api/projects/p"),
            (ENV_API_KEY, "secret"),
            (ENV_MODEL, ""),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.project_endpoint().unwrap(), "https://example.test/api/projects/p");
        assert_eq!(settings.api_key().unwrap(), "secret");
        assert_eq!(settings.model, "gpt-4o");
    }

    #[test]
    fn test_missing_required_setting_message() {
        let settings = Settings::default();
        let err = settings.project_endpoint().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Required configuration setting 'ProjectEndpoint' is missing or empty"
        );
    }

    #[test]
    fn test_zero_iterations_is_rejected() {
        let settings = Settings {
            max_iterations: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
