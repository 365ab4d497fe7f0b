//! Spec files from a GitHub repository at a fixed commit, through the REST
//! contents API.

use super::SpecFile;
use crate::agent::http::create_http_client;
use crate::cancel::CancelSignal;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::util::truncate;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const MAX_CONCURRENT_DOWNLOADS: usize = 8;
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "tspfix";

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    download_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GitHubSource {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

impl GitHubSource {
    /// `repository` is `owner/repo`.
    pub fn new(
        repository: &str,
        api_base: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let (owner, repo) = repository
            .trim()
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
            .ok_or_else(|| {
                Error::Config(format!(
                    "Spec repository must look like 'owner/repo', got '{}'",
                    repository
                ))
            })?;
        Ok(Self {
            client: create_http_client(timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            &settings.spec_repository,
            &settings.github_api_base,
            settings.github_token.clone(),
            Duration::from_secs(settings.http_timeout_secs),
        )
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String> {
        let response = self.request(url).query(query).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(format!(
                "GitHub API request was rejected with {}. Check GITHUB_TOKEN.",
                status
            )),
            _ => Error::Other(format!(
                "GitHub API request failed: {} {}",
                status,
                truncate(body.trim(), 200)
            )),
        })
    }

    async fn list_dir(&self, dir: &str, commit: &str) -> Result<Vec<ContentEntry>> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            self.owner,
            self.repo,
            dir.trim_matches('/')
        );
        let body = self.get_text(&url, &[("ref", commit)]).await?;
        serde_json::from_str(&body).map_err(|e| {
            Error::Other(format!("Failed to deserialize GitHub API response: {}", e))
        })
    }

    /// Every `.tsp` file under `dir` at `commit`, subdirectories included.
    pub async fn fetch_specs(
        &self,
        dir: &str,
        commit: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<SpecFile>> {
        info!(
            repo = %format!("{}/{}", self.owner, self.repo),
            dir,
            commit,
            "Downloading TypeSpec files from GitHub"
        );

        let mut pending_dirs = vec![dir.to_string()];
        let mut downloads = Vec::new();
        while let Some(current) = pending_dirs.pop() {
            let entries = cancel.run(self.list_dir(&current, commit)).await?;
            for entry in entries {
                match entry.kind.as_str() {
                    "dir" => pending_dirs.push(entry.path),
                    "file" if entry.name.ends_with(".tsp") => match entry.download_url {
                        Some(url) => downloads.push((entry.name, url)),
                        None => debug!(file = %entry.path, "Skipping file without download URL"),
                    },
                    _ => {}
                }
            }
        }

        if downloads.is_empty() {
            return Err(Error::Other(format!(
                "No TypeSpec files found in GitHub repository under '{}' at {}",
                dir, commit
            )));
        }

        let fetches = stream::iter(downloads)
            .map(|(name, url)| async move {
                let content = self.get_text(&url, &[]).await.map_err(|e| {
                    Error::Other(format!("Failed to download file {}: {}", name, e))
                })?;
                Ok::<_, Error>(SpecFile::new(name, content))
            })
            .buffer_unordered(MAX_CONCURRENT_DOWNLOADS)
            .try_collect::<Vec<_>>();
        let mut files = cancel.run(fetches).await?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        info!(count = files.len(), "Downloaded TypeSpec files");
        Ok(files)
    }
}
