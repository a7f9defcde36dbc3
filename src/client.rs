use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::{GenError, Result, StatusCheckError};
use crate::projector;
use crate::service::{ByteStream, GenerationService, StatusSource};
use crate::types::*;

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Async HTTP client for the remote generation service.
///
/// Submits generation requests, checks task status, and opens progress
/// streams. It never retries on its own; retry policy belongs to the caller.
///
/// # Example
/// ```no_run
/// use studio_gen::{GenerationRequest, MediaKind, StudioClient, SubmitOutcome};
///
/// # async fn example() -> studio_gen::Result<()> {
/// let client = StudioClient::new("https://studio.example.com");
/// let request = GenerationRequest::with_style("https://x/img.png", "clean-studio");
/// match client.submit_request(&request, MediaKind::Image).await? {
///     SubmitOutcome::Immediate(record) => println!("done: {}", record.url),
///     SubmitOutcome::Task(handle) => println!("queued: {}", handle.id),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StudioClient {
    http: Client,
    config: ClientConfig,
}

impl StudioClient {
    /// Create a client for the given endpoint with default routes and timeouts.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(endpoint))
    }

    pub fn from_config(mut config: ClientConfig) -> Self {
        config.endpoint = normalize(config.endpoint);
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });
        Self { http, config }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, auth headers, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ── Submit ──────────────────────────────────────────────────────

    /// Submit a generation request.
    ///
    /// The request is validated first; an invalid request never reaches the
    /// network.
    pub async fn submit_request(
        &self,
        request: &GenerationRequest,
        media: MediaKind,
    ) -> Result<SubmitOutcome> {
        request.validate()?;

        let url = format!("{}{}", self.endpoint(), self.config.routes.submit(media));
        let resp = self
            .http
            .post(&url)
            .timeout(self.config.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| GenError::Submission {
                status: None,
                message: format!(
                    "Cannot reach generation service at {}: {}",
                    self.endpoint(),
                    e
                ),
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| GenError::Submission {
            status: Some(status.as_u16()),
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(GenError::Submission {
                status: Some(status.as_u16()),
                message: error_message(status, &text),
            });
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| GenError::Submission {
            status: Some(status.as_u16()),
            message: format!("Malformed response body: {}", e),
        })?;

        let outcome = parse_submit_body(&json).map_err(|message| GenError::Submission {
            status: Some(status.as_u16()),
            message,
        })?;

        match &outcome {
            SubmitOutcome::Immediate(record) => {
                tracing::info!(url = %record.url, "Generation finished immediately")
            }
            SubmitOutcome::Task(handle) => {
                tracing::info!(task_id = %handle.id, project_id = ?handle.project_id, "Generation queued")
            }
        }
        Ok(outcome)
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Perform a single status check for a task.
    pub async fn task_status(
        &self,
        handle: &TaskHandle,
        media: MediaKind,
    ) -> std::result::Result<StatusReport, StatusCheckError> {
        let url = status_url(self.endpoint(), self.config.routes.status(media), &handle.id)?;
        let resp = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| StatusCheckError::Network(format!("Failed to fetch task status: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StatusCheckError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| StatusCheckError::InvalidResponse(e.to_string()))?;
        Ok(parse_status_body(&json, media))
    }

    // ── Stream ──────────────────────────────────────────────────────

    /// Open a streaming generation. Only the connect phase is time-limited;
    /// the body may stay open as long as the service keeps it open.
    pub async fn open_progress_stream(&self, request: &GenerationRequest) -> Result<ByteStream> {
        request.validate()?;

        let url = format!("{}{}", self.endpoint(), self.config.routes.stream);
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| GenError::Stream(format!("Cannot open progress stream: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GenError::Stream(format!(
                "Progress stream refused with HTTP {}: {}",
                status.as_u16(),
                error_message(status, &text)
            )));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| GenError::Stream(format!("Connection interrupted: {}", e)))
            })
            .boxed())
    }
}

impl StatusSource for StudioClient {
    async fn fetch_status(
        &self,
        handle: &TaskHandle,
        media: MediaKind,
    ) -> std::result::Result<StatusReport, StatusCheckError> {
        self.task_status(handle, media).await
    }
}

impl GenerationService for StudioClient {
    async fn submit(&self, request: &GenerationRequest, media: MediaKind) -> Result<SubmitOutcome> {
        self.submit_request(request, media).await
    }

    async fn open_stream(&self, request: &GenerationRequest) -> Result<ByteStream> {
        self.open_progress_stream(request).await
    }
}

fn status_url(
    endpoint: &str,
    route: &str,
    task_id: &str,
) -> std::result::Result<Url, StatusCheckError> {
    let mut url = Url::parse(&format!("{}{}", endpoint, route))
        .map_err(|e| StatusCheckError::InvalidResponse(format!("Bad status URL: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| StatusCheckError::InvalidResponse("Status URL cannot have a path".into()))?
        .pop_if_empty()
        .push(task_id);
    Ok(url)
}

/// Human-readable message from an error body shaped `{ error, details? }`.
fn error_message(status: StatusCode, text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        if let Some(error) = json.get("error").and_then(|v| v.as_str()) {
            return match json.get("details").and_then(|v| v.as_str()) {
                Some(details) if !details.is_empty() => format!("{}: {}", error, details),
                _ => error.to_string(),
            };
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string()
    } else {
        trimmed.chars().take(300).collect()
    }
}

/// Interpret a successful submit response.
fn parse_submit_body(json: &Value) -> std::result::Result<SubmitOutcome, String> {
    if json.get("success").and_then(|v| v.as_bool()) == Some(false) {
        let msg = json
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("Service reported failure");
        return Err(msg.to_string());
    }

    let data = json.get("data").filter(|d| d.is_object()).unwrap_or(json);

    if let Some(images) = data.get("images").and_then(|v| v.as_array()) {
        if !images.is_empty() {
            return projector::record_from_value(data)
                .map(SubmitOutcome::Immediate)
                .ok_or_else(|| "Result entry is missing a url".to_string());
        }
    }

    let task_id = ["task_id", "taskId"]
        .iter()
        .find_map(|key| id_field(data.get(*key)).or_else(|| id_field(json.get(*key))));

    match task_id {
        Some(id) => {
            let project_id = ["project_id", "projectId"].iter().find_map(|key| {
                data.get(*key)
                    .or_else(|| json.get(*key))
                    .and_then(|v| v.as_i64())
            });
            Ok(SubmitOutcome::Task(TaskHandle { id, project_id }))
        }
        None => Err("Response contained neither a result nor a task id".to_string()),
    }
}

fn id_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Classify a status response as ready, failed, or pending.
fn parse_status_body(json: &Value, media: MediaKind) -> StatusReport {
    let data = json.get("data").filter(|d| d.is_object()).unwrap_or(json);
    let field = |key: &str| data.get(key).or_else(|| json.get(key));

    if let Some(url) = field(media.result_field()).and_then(|v| v.as_str()) {
        if !url.is_empty() {
            return StatusReport::Ready(projector::record_from_url(url));
        }
    }

    if field("status").and_then(|v| v.as_str()) == Some("failed") {
        let reason = field("failed_reason")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("The generation service reported a failure");
        return StatusReport::Failed(reason.to_string());
    }

    StatusReport::Pending
}
