//! Session-authenticated Pulp 3 HTTP client.
//!
//! Wraps one reqwest client per (server, job) with the task pointer
//! pattern: mutating calls hand back a task href which `wait_task` polls to
//! a terminal state with bounded exponential backoff. Transient transport
//! errors and 5xx responses are retried up to a ceiling; 4xx responses are
//! surfaced with the server's error payload verbatim.

use crate::config::RemotesSection;
use crate::error::{AppError, Result};
use crate::pulp::resources::{PulpTask, TaskState};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Consecutive transient failures tolerated before a request is declared
/// unreachable.
const MAX_TRANSIENT_RETRIES: u32 = 5;

/// Floor and ceiling of the task poll backoff.
const POLL_BASE: Duration = Duration::from_secs(2);
const POLL_CEILING: Duration = Duration::from_secs(30);

/// Backoff before poll attempt `attempt` (0-based): `min(30, 2 * 2^attempt)`
/// seconds.
pub fn poll_backoff(attempt: u32) -> Duration {
    let secs = POLL_BASE
        .as_secs()
        .saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_secs(secs.min(POLL_CEILING.as_secs()))
}

/// HTTP client for one Pulp server session.
#[derive(Clone)]
pub struct PulpClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl PulpClient {
    /// Build a client for the given server. Connect/read timeouts come from
    /// the `remotes` config section.
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        remotes: &RemotesSection,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(remotes.sock_connect_timeout))
            .timeout(Duration::from_secs_f64(remotes.sock_read_timeout))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Issue a request, retrying transient failures (transport errors and
    /// 5xx) with backoff. A 4xx is permanent: the response body is captured
    /// verbatim into the error.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, String)]>,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        let mut attempt: u32 = 0;

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .basic_auth(&self.username, Some(&self.password));
            if let Some(query) = query {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let outcome = request.send().await;
            match outcome {
                Ok(response) if response.status().is_success() => {
                    if response.status() == StatusCode::NO_CONTENT {
                        return Ok(serde_json::Value::Null);
                    }
                    return response.json().await.map_err(|e| {
                        AppError::PulpUnreachable(format!("invalid JSON from {url}: {e}"))
                    });
                }
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status();
                    if attempt >= MAX_TRANSIENT_RETRIES {
                        return Err(AppError::PulpUnreachable(format!(
                            "{url} returned {status} after {attempt} retries"
                        )));
                    }
                    tracing::warn!(url = %url, status = %status, attempt, "Pulp 5xx, retrying");
                }
                Ok(response) => {
                    let status = response.status();
                    let payload: serde_json::Value = response
                        .json()
                        .await
                        .unwrap_or_else(|_| json!({"description": "<unreadable body>"}));
                    return Err(AppError::PulpTaskFailed(json!({
                        "status": status.as_u16(),
                        "url": url,
                        "response": payload,
                    })));
                }
                Err(e) => {
                    if attempt >= MAX_TRANSIENT_RETRIES {
                        return Err(AppError::PulpUnreachable(format!("{url}: {e}")));
                    }
                    tracing::warn!(url = %url, error = %e, attempt, "Pulp request failed, retrying");
                }
            }

            tokio::time::sleep(poll_backoff(attempt)).await;
            attempt += 1;
        }
    }

    /// GET a single resource.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.request(Method::GET, path, None, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// GET every page of a collection, following `next` cursors.
    pub async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let mut results = Vec::new();
        let mut page: crate::pulp::resources::Page<serde_json::Value> = serde_json::from_value(
            self.request(Method::GET, path, Some(query), None).await?,
        )?;

        loop {
            for item in page.results.drain(..) {
                results.push(serde_json::from_value(item)?);
            }
            match page.next.take() {
                Some(next) => {
                    page = serde_json::from_value(
                        self.request(Method::GET, &next, None, None).await?,
                    )?;
                }
                None => break,
            }
        }

        Ok(results)
    }

    /// POST a resource creation that returns the created object directly
    /// (repositories, remotes).
    pub async fn create<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let value = self.request(Method::POST, path, None, Some(body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// POST a mutating call that returns `{"task": href}`.
    pub async fn post_task(&self, path: &str, body: &serde_json::Value) -> Result<String> {
        let value = self.request(Method::POST, path, None, Some(body)).await?;
        task_href(&value)
    }

    /// PATCH a resource; returns the update task href.
    pub async fn patch_task(&self, href: &str, body: &serde_json::Value) -> Result<String> {
        let value = self.request(Method::PATCH, href, None, Some(body)).await?;
        task_href(&value)
    }

    /// DELETE a resource; returns the deletion task href.
    pub async fn delete_task(&self, href: &str) -> Result<String> {
        let value = self.request(Method::DELETE, href, None, None).await?;
        task_href(&value)
    }

    /// Ask Pulp to cancel a task. Best effort: a task that already reached a
    /// terminal state returns 409, which is fine.
    pub async fn cancel_task(&self, task_href: &str) {
        let body = json!({"state": "canceled"});
        if let Err(e) = self
            .request(Method::PATCH, task_href, None, Some(&body))
            .await
        {
            tracing::debug!(task = task_href, error = %e, "task cancel request not applied");
        }
    }

    /// Poll a task href until it reaches a terminal state.
    ///
    /// `deadline` bounds the wait; crossing it returns `Deadline` and leaves
    /// the task running on the server. Cancellation via `cancel` returns
    /// `Canceled` without touching the task; the caller decides whether to
    /// issue a Pulp-side cancel.
    pub async fn wait_task(
        &self,
        task_href: &str,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<PulpTask> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Canceled(format!(
                    "canceled while waiting on {task_href}"
                )));
            }

            let task: PulpTask = self.get(task_href).await?;
            match task.state {
                TaskState::Completed => return Ok(task),
                TaskState::Failed => {
                    let payload = task
                        .error
                        .unwrap_or_else(|| json!({"description": "task failed without detail"}));
                    return Err(AppError::PulpTaskFailed(payload));
                }
                TaskState::Canceled => {
                    return Err(AppError::Canceled(format!("task {task_href} was canceled")))
                }
                _ => {}
            }

            let wait = poll_backoff(attempt);
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(AppError::Deadline(format!(
                            "deadline expired waiting on {task_href}"
                        )));
                    }
                    wait.min(deadline - now)
                }
                None => wait,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::Canceled(format!(
                        "canceled while waiting on {task_href}"
                    )));
                }
                _ = tokio::time::sleep(wait) => {}
            }

            attempt += 1;
        }
    }
}

/// Pull the task href out of a `{"task": ...}` response.
fn task_href(value: &serde_json::Value) -> Result<String> {
    value
        .get("task")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::PulpUnreachable(format!("response did not contain a task href: {value}"))
        })
}
