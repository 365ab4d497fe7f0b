//! REST implementation of [`AgentService`] for an assistants-style agents
//! API (agents, threads, messages, runs, files, vector stores).

use super::service::{AgentInfo, AgentRun, AgentService, AgentSpec, UploadedFile};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::util::truncate;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Retry configuration for rate limits, server errors and flaky networks
pub const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u32 = 2;
const MAX_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct HttpAgentService {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    api_version: String,
    timeout: Duration,
    initial_backoff: Duration,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Vec<WireContent>,
}

#[derive(Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<WireText>,
}

#[derive(Deserialize)]
struct WireText {
    value: String,
}

/// Create a configured HTTP client for agent requests
pub(crate) fn create_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

impl HttpAgentService {
    pub fn new(
        endpoint: &str,
        api_key: &str,
        api_version: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_string();
        Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("Invalid project endpoint '{}': {}", endpoint, e)))?;
        Ok(Self {
            client: create_http_client(timeout)?,
            endpoint,
            api_key: api_key.to_string(),
            api_version: api_version.to_string(),
            timeout,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.project_endpoint()?,
            settings.api_key()?,
            &settings.api_version,
            Duration::from_secs(settings.http_timeout_secs),
        )
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.saturating_pow(retry_count.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.endpoint, path))
            .map_err(|e| Error::Config(format!("Invalid request URL for {}: {}", path, e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("api-version", &self.api_version);
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        self.client
            .request(method, url.clone())
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
    }

    /// Send the request built by `build`, retrying network failures, 429s
    /// and 5xx responses with exponential backoff. Returns the body text.
    async fn send_with_retry<F>(&self, what: &str, build: F) -> Result<String>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retry_count = 0;

        loop {
            let response = match build().send().await {
                Ok(response) => response,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        debug!(what, retry_count, "Network error, retrying: {}", err);
                        tokio::time::sleep(self.backoff(retry_count)).await;
                        continue;
                    }
                    return Err(self.map_network_error(what, err));
                }
            };

            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)));
            let text = match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        tokio::time::sleep(self.backoff(retry_count)).await;
                        continue;
                    }
                    return Err(self.map_network_error(what, err));
                }
            };

            if status.is_success() {
                return Ok(text);
            }

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && retry_count < MAX_RETRIES {
                retry_count += 1;
                let wait = retry_after.unwrap_or_else(|| self.backoff(retry_count));
                warn!(what, %status, retry_count, "Request failed, retrying in {:?}", wait);
                tokio::time::sleep(wait).await;
                continue;
            }

            return Err(map_status_error(what, status, &text, retry_count));
        }
    }

    async fn send_json<T, F>(&self, what: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let text = self.send_with_retry(what, build).await?;
        serde_json::from_str(&text).map_err(|e| {
            Error::Other(format!(
                "Unexpected response to {}: {} ({})",
                what,
                e,
                truncate(&text, 200)
            ))
        })
    }

    fn map_network_error(&self, what: &str, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::timeout(what, self.timeout)
        } else {
            Error::Http(err)
        }
    }
}

fn map_status_error(what: &str, status: StatusCode, body: &str, retries: u32) -> Error {
    match status.as_u16() {
        401 | 403 => Error::Unauthorized(format!(
            "{} was rejected with {}. Check the API key and project endpoint.",
            what, status
        )),
        429 => Error::Other(format!("{} was rate limited after {} retries", what, retries)),
        _ => Error::Other(format!(
            "{} failed with {}: {}",
            what,
            status,
            truncate(body.trim(), 300)
        )),
    }
}

/// Joined text of the first assistant message in a newest-first list.
fn first_assistant_text(messages: Vec<WireMessage>) -> Option<String> {
    let message = messages.into_iter().find(|m| m.role == "assistant")?;
    let parts: Vec<String> = message
        .content
        .into_iter()
        .filter(|c| c.kind == "text")
        .filter_map(|c| c.text.map(|t| t.value))
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

impl AgentService for HttpAgentService {
    async fn create_agent(&self, spec: &AgentSpec) -> Result<AgentInfo> {
        let url = self.url("assistants", &[])?;
        let body = json!({
            "model": spec.model,
            "name": spec.name,
            "instructions": spec.instructions,
            "tools": [{"type": "file_search"}],
        });
        self.send_json("create agent", || self.request(Method::POST, &url).json(&body))
            .await
    }

    async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        let url = self.url("assistants", &[("limit", "100")])?;
        let list: ListResponse<AgentInfo> = self
            .send_json("list agents", || self.request(Method::GET, &url))
            .await?;
        Ok(list.data)
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let url = self.url(&format!("assistants/{}", agent_id), &[])?;
        self.send_with_retry("delete agent", || self.request(Method::DELETE, &url))
            .await
            .map(|_| ())
    }

    async fn update_agent_index(&self, agent_id: &str, vector_store_id: &str) -> Result<()> {
        let url = self.url(&format!("assistants/{}", agent_id), &[])?;
        let body = json!({
            "tool_resources": {"file_search": {"vector_store_ids": [vector_store_id]}},
        });
        self.send_with_retry("update agent index", || {
            self.request(Method::POST, &url).json(&body)
        })
        .await
        .map(|_| ())
    }

    async fn upload_file(&self, name: &str, content: &str) -> Result<UploadedFile> {
        let url = self.url("files", &[])?;
        // File search only indexes known text extensions.
        let upload_name = if name.ends_with(".txt") {
            name.to_string()
        } else {
            format!("{}.txt", name)
        };
        let mut file: UploadedFile = self
            .send_json("upload file", || {
                let part = reqwest::multipart::Part::text(content.to_string())
                    .file_name(upload_name.clone());
                let form = reqwest::multipart::Form::new()
                    .text("purpose", "assistants")
                    .part("file", part);
                self.request(Method::POST, &url).multipart(form)
            })
            .await?;
        if file.name.is_empty() {
            file.name = upload_name;
        }
        Ok(file)
    }

    async fn get_file(&self, file_id: &str) -> Result<UploadedFile> {
        let url = self.url(&format!("files/{}", file_id), &[])?;
        self.send_json("get file status", || self.request(Method::GET, &url))
            .await
    }

    async fn create_vector_store(&self, name: &str, file_ids: &[String]) -> Result<String> {
        let url = self.url("vector_stores", &[])?;
        let body = json!({"name": name, "file_ids": file_ids});
        let created: IdOnly = self
            .send_json("create vector store", || {
                self.request(Method::POST, &url).json(&body)
            })
            .await?;
        Ok(created.id)
    }

    async fn create_thread(&self) -> Result<String> {
        let url = self.url("threads", &[])?;
        let created: IdOnly = self
            .send_json("create thread", || self.request(Method::POST, &url).json(&json!({})))
            .await?;
        Ok(created.id)
    }

    async fn post_message(&self, thread_id: &str, content: &str) -> Result<()> {
        let url = self.url(&format!("threads/{}/messages", thread_id), &[])?;
        let body = json!({"role": "user", "content": content});
        self.send_with_retry("post message", || self.request(Method::POST, &url).json(&body))
            .await
            .map(|_| ())
    }

    async fn create_run(&self, thread_id: &str, agent_id: &str) -> Result<AgentRun> {
        let url = self.url(&format!("threads/{}/runs", thread_id), &[])?;
        let body = json!({"assistant_id": agent_id});
        self.send_json("create run", || self.request(Method::POST, &url).json(&body))
            .await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<AgentRun> {
        let url = self.url(&format!("threads/{}/runs/{}", thread_id, run_id), &[])?;
        self.send_json("get run", || self.request(Method::GET, &url))
            .await
    }

    async fn latest_assistant_message(&self, thread_id: &str) -> Result<Option<String>> {
        let url = self.url(
            &format!("threads/{}/messages", thread_id),
            &[("order", "desc"), ("limit", "20")],
        )?;
        let list: ListResponse<WireMessage> = self
            .send_json("list messages", || self.request(Method::GET, &url))
            .await?;
        Ok(first_assistant_text(list.data))
    }
}
