// Talks to a running ComfyUI server over its HTTP API.
//
// - POST /prompt with {prompt, client_id}; the response carries the prompt_id.
// - GET /history/{prompt_id} until the entry shows up with outputs.
// - GET /view?filename=..&subfolder=..&type=.. for every output image.
// - POST /upload/image (multipart) to get input images onto the server.
//
// Completion is detected by polling. A timeout only stops *our* polling; whatever is queued
// on the server keeps running.

use std::{
    fmt::Debug,
    path::Path,
    time::Duration,
};

use log::{debug, info, trace, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_retry::RetryIf;

use crate::{
    config::RetryPolicy,
    error::{Error, Result},
    workflow::WorkflowGraph,
};

/// Per-request HTTP timeout. Generation itself is bounded by the poll deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed,
    /// ComfyUI reported an execution error.
    Failed(String),
    /// The deadline passed first. Not an error; the caller decides what to do.
    TimedOut,
}

/// Where an output image lives on the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_output_kind")]
    pub kind: String,
}

fn default_output_kind() -> String {
    "output".to_owned()
}

#[derive(Clone)]
pub struct OutputImage {
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
    pub bytes: Vec<u8>,
}

impl Debug for OutputImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputImage")
            .field("filename", &self.filename)
            .field("subfolder", &self.subfolder)
            .field("kind", &self.kind)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadOptions {
    pub image_type: String,
    pub subfolder: String,
    pub overwrite: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            image_type: "input".to_owned(),
            subfolder: String::new(),
            overwrite: false,
        }
    }
}

/// Everything the batch runners need from a generation server.
#[allow(async_fn_in_trait)]
pub trait GenerationServer {
    /// Queues `graph` and returns the server's run id.
    async fn submit(&self, graph: &WorkflowGraph) -> Result<String>;
    /// Polls until the run finishes or `timeout` passes.
    async fn poll(&self, run_id: &str, interval: Duration, timeout: Duration)
        -> Result<PollOutcome>;
    async fn fetch_outputs(&self, run_id: &str) -> Result<Vec<OutputImage>>;
    /// Uploads a local image and returns the name to put in a LoadImage node.
    async fn upload_image(&self, path: &Path, options: &UploadOptions) -> Result<String>;
    async fn is_alive(&self) -> bool;
}

/// Interprets a /history response.
/// `None` means the run is still queued or executing.
pub fn history_outcome(history: &Value, run_id: &str) -> Option<PollOutcome> {
    let entry = history.get(run_id)?;
    let status = entry.get("status");
    if status.and_then(|s| s.get("status_str")).and_then(Value::as_str) == Some("error") {
        return Some(PollOutcome::Failed(execution_error(status)));
    }
    entry.get("outputs").map(|_| PollOutcome::Completed)
}

// status.messages is a list of [event, payload] pairs.
fn execution_error(status: Option<&Value>) -> String {
    let payload = status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_array)
        .find(|m| m.first().and_then(Value::as_str) == Some("execution_error"))
        .and_then(|m| m.get(1));
    match payload {
        Some(p) => {
            let node = p.get("node_id").and_then(Value::as_str).unwrap_or("?");
            let class = p.get("node_type").and_then(Value::as_str).unwrap_or("?");
            let message = p
                .get("exception_message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            format!("node {} ({}): {}", node, class, message.trim())
        }
        None => "execution failed".to_owned(),
    }
}

/// Output images listed in a finished /history entry.
/// These are at history[run_id].outputs.<node_id>.images[].
/// Previews (type "temp") are skipped.
pub fn output_refs(history: &Value, run_id: &str) -> Result<Vec<OutputRef>> {
    let outputs = history
        .get(run_id)
        .and_then(|e| e.get("outputs"))
        .and_then(Value::as_object)
        .ok_or_else(|| Error::InvalidResponse(format!("history for {} has no outputs", run_id)))?;
    let mut refs = Vec::new();
    for (node_id, output) in outputs {
        let Some(images) = output.get("images").and_then(Value::as_array) else {
            continue;
        };
        for image in images {
            let r: OutputRef = serde_json::from_value(image.clone()).map_err(|e| {
                Error::InvalidResponse(format!("bad image record from node {}: {}", node_id, e))
            })?;
            if r.kind == "temp" {
                trace!("Skipping preview {}", r.filename);
                continue;
            }
            refs.push(r);
        }
    }
    Ok(refs)
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    prompt_id: String,
    #[serde(default)]
    number: Option<u64>,
    #[serde(default)]
    node_errors: Map<String, Value>,
}

#[derive(Deserialize)]
struct UploadResponse {
    name: String,
    #[serde(default)]
    subfolder: String,
}

pub struct ComfyClient {
    base_url: String,
    client_id: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ComfyClient {
    pub fn new(base_url: &str, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Connection {
                context: "failed to build HTTP client".to_owned(),
                source: e,
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client_id: uuid::Uuid::new_v4().to_string(),
            http,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}", self.base_url, route.trim_start_matches('/'))
    }

    fn connection(&self, what: &str, source: reqwest::Error) -> Error {
        Error::Connection {
            context: format!("{} ({})", what, self.base_url),
            source,
        }
    }

    /// Sends a request and reads the whole body; non-2xx becomes `Error::Http`.
    async fn send(&self, what: &str, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request.send().await.map_err(|e| self.connection(what, e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.connection(what, e))?;
        trace!("{} -> {}: {}", what, status, text);
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn submit_once(&self, body: &Value) -> Result<String> {
        let request = self.http.post(self.url("prompt")).json(body);
        let text = match self.send("failed to submit workflow", request).await {
            Ok(text) => text,
            // Validation failures come back as 400 with the offending nodes listed.
            Err(Error::Http { status, body }) => {
                let node_errors = serde_json::from_str::<Value>(&body)
                    .ok()
                    .and_then(|v| v.get("node_errors").cloned())
                    .filter(|v| v.as_object().map_or(false, |o| !o.is_empty()));
                return Err(match node_errors {
                    Some(errors) => Error::NodeErrors(errors.to_string()),
                    None => Error::Http { status, body },
                });
            }
            Err(e) => return Err(e),
        };
        let parsed: SubmitResponse = serde_json::from_str(&text)
            .map_err(|e| {
                Error::InvalidResponse(format!("unexpected /prompt response ({}): {}", e, text))
            })?;
        if !parsed.node_errors.is_empty() {
            return Err(Error::NodeErrors(Value::Object(parsed.node_errors).to_string()));
        }
        debug!("Got prompt ID {} (queue position {:?})", parsed.prompt_id, parsed.number);
        Ok(parsed.prompt_id)
    }

    async fn history(&self, run_id: &str) -> Result<Value> {
        let request = self.http.get(self.url(&format!("history/{}", run_id)));
        let text = self.send("failed to poll history", request).await?;
        serde_json::from_str(&text)
            .map_err(|e| Error::InvalidResponse(format!("history is not JSON: {}", e)))
    }

    async fn download(&self, r: &OutputRef) -> Result<Vec<u8>> {
        let what = format!("failed to download {}", r.filename);
        let response = self
            .http
            .get(self.url("view"))
            .query(&[("filename", &r.filename), ("subfolder", &r.subfolder), ("type", &r.kind)])
            .send()
            .await
            .map_err(|e| self.connection(&what, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await.map_err(|e| self.connection(&what, e))?;
        Ok(bytes.to_vec())
    }
}

impl GenerationServer for ComfyClient {
    async fn submit(&self, graph: &WorkflowGraph) -> Result<String> {
        let body = serde_json::json!({
            "prompt": graph,
            "client_id": self.client_id,
        });
        let condition = |e: &Error| {
            let retry = e.is_transient();
            if retry {
                warn!("Submission failed, retrying: {}", e);
            }
            retry
        };
        RetryIf::spawn(self.retry.strategy(), || self.submit_once(&body), condition).await
    }

    async fn poll(
        &self,
        run_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<PollOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.history(run_id).await {
                Ok(history) => {
                    if let Some(outcome) = history_outcome(&history, run_id) {
                        debug!("Run {} finished: {:?}", run_id, outcome);
                        return Ok(outcome);
                    }
                }
                // The server may be busy loading a model; keep going until the deadline.
                Err(e) if e.is_transient() => warn!("Polling {} failed: {}", run_id, e),
                Err(e) => return Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Run {} did not finish within {:?}", run_id, timeout);
                return Ok(PollOutcome::TimedOut);
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    async fn fetch_outputs(&self, run_id: &str) -> Result<Vec<OutputImage>> {
        let history = self.history(run_id).await?;
        let refs = output_refs(&history, run_id)?;
        trace!("Got {} images", refs.len());
        let mut images = Vec::with_capacity(refs.len());
        for r in refs {
            let bytes = self.download(&r).await?;
            images.push(OutputImage {
                filename: r.filename,
                subfolder: r.subfolder,
                kind: r.kind,
                bytes,
            });
        }
        Ok(images)
    }

    async fn upload_image(&self, path: &Path, options: &UploadOptions) -> Result<String> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::config(format!("{} has no usable file name", path.display())))?
            .to_owned();
        info!("Uploading {} bytes as {}", bytes.len(), file_name);
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(path))
            .map_err(|e| self.connection("failed to build upload", e))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", options.image_type.clone())
            .text("subfolder", options.subfolder.clone())
            .text("overwrite", options.overwrite.to_string());
        let request = self.http.post(self.url("upload/image")).multipart(form);
        let text = self.send("failed to upload image", request).await?;
        let parsed: UploadResponse = serde_json::from_str(&text)
            .map_err(|e| {
                Error::InvalidResponse(format!("unexpected upload response ({}): {}", e, text))
            })?;
        // LoadImage wants the subfolder as part of the name.
        Ok(if parsed.subfolder.is_empty() {
            parsed.name
        } else {
            format!("{}/{}", parsed.subfolder, parsed.name)
        })
    }

    async fn is_alive(&self) -> bool {
        match self.send("failed to reach ComfyUI", self.http.get(self.url("system_stats"))).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Liveness check failed: {}", e);
                false
            }
        }
    }
}
