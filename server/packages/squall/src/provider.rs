//! Sandbox provider interface.
//!
//! A provider hands out isolated, ephemeral execution environments. The
//! orchestrator only ever talks to this seam: provision, write files,
//! run a command with streamed output, destroy. [`HttpSandboxProvider`]
//! speaks an E2B-style REST API; [`MockSandboxProvider`] is a scripted
//! implementation used by the test suite and `squall serve --mock`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Capacity of the raw output channel between a provider and the event
/// pump. Small on purpose: backpressure from the event queue propagates
/// here, which in turn stalls the provider-side read.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 16;

/// Opaque handle to one provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub sandbox_id: String,
}

/// Parameters for provisioning one sandbox.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub template: String,
    /// Provider-side sandbox lifetime. The provider kills the sandbox
    /// when this elapses even if we never get to call destroy.
    pub timeout: Duration,
    pub envs: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// One file to write into a sandbox. Parent directories are created by
/// the provider; caller data only ever travels as file content, never
/// as command text.
#[derive(Debug, Clone)]
pub struct SandboxFile {
    pub path: String,
    pub data: String,
}

/// A chunk of process output. Chunks are not line-aligned.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// A command running inside a sandbox with its output streamed back.
#[derive(Debug)]
pub struct StreamingCommand {
    pub output: mpsc::Receiver<OutputChunk>,
    pub exit: JoinHandle<Result<i32, ProviderError>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The requested template does not exist. The only provider failure
    /// that triggers fallback provisioning.
    #[error("sandbox template {template:?} not found")]
    TemplateNotFound { template: String },

    /// The command exceeded the provider-side execution timeout.
    #[error("command timed out after {seconds}s")]
    CommandTimeout { seconds: u64 },

    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("provider transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait SandboxProvider: Send + Sync + fmt::Debug {
    async fn provision(&self, request: ProvisionRequest) -> Result<SandboxHandle, ProviderError>;

    async fn write_files(
        &self,
        handle: &SandboxHandle,
        files: Vec<SandboxFile>,
    ) -> Result<(), ProviderError>;

    async fn run_streaming(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<StreamingCommand, ProviderError>;

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError>;
}

// ---------------------------------------------------------------------
// HTTP provider

#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    template: &'a str,
    timeout_seconds: u64,
    env_vars: &'a HashMap<String, String>,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    sandbox_id: String,
}

#[derive(Debug, Serialize)]
struct WriteFilesBody {
    files: Vec<FileEntry>,
}

#[derive(Debug, Serialize)]
struct FileEntry {
    path: String,
    data_b64: String,
}

#[derive(Debug, Serialize)]
struct RunCommandBody<'a> {
    command: &'a str,
    timeout_seconds: u64,
}

/// One NDJSON frame of a streamed command response.
#[derive(Debug, Deserialize)]
struct CommandFrame {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    timed_out: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Provider client for an E2B-style sandbox REST API.
#[derive(Debug, Clone)]
pub struct HttpSandboxProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpSandboxProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Provider errors often come back as a JSON `{"message": ...}`
    /// body; fall back to the raw text.
    async fn api_error(status: StatusCode, response: reqwest::Response) -> ProviderError {
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or(text);
        ProviderError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn provision(&self, request: ProvisionRequest) -> Result<SandboxHandle, ProviderError> {
        let response = self
            .client
            .post(format!("{}/sandboxes", self.base_url))
            .header("X-API-Key", &self.api_key)
            .json(&ProvisionBody {
                template: &request.template,
                timeout_seconds: request.timeout.as_secs(),
                env_vars: &request.envs,
                metadata: &request.metadata,
            })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::TemplateNotFound {
                template: request.template,
            });
        }
        if !status.is_success() {
            return Err(Self::api_error(status, response).await);
        }
        let body: ProvisionResponse = response.json().await?;
        Ok(SandboxHandle {
            sandbox_id: body.sandbox_id,
        })
    }

    async fn write_files(
        &self,
        handle: &SandboxHandle,
        files: Vec<SandboxFile>,
    ) -> Result<(), ProviderError> {
        let body = WriteFilesBody {
            files: files
                .into_iter()
                .map(|file| FileEntry {
                    path: file.path,
                    data_b64: base64::engine::general_purpose::STANDARD.encode(file.data),
                })
                .collect(),
        };
        let response = self
            .client
            .post(format!(
                "{}/sandboxes/{}/files",
                self.base_url, handle.sandbox_id
            ))
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(status, response).await);
        }
        Ok(())
    }

    async fn run_streaming(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<StreamingCommand, ProviderError> {
        let timeout_seconds = timeout.as_secs();
        let response = self
            .client
            .post(format!(
                "{}/sandboxes/{}/commands",
                self.base_url, handle.sandbox_id
            ))
            .header("X-API-Key", &self.api_key)
            .json(&RunCommandBody {
                command,
                timeout_seconds,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(status, response).await);
        }

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let exit = tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let frame: CommandFrame = serde_json::from_str(line).map_err(|err| {
                        ProviderError::Api {
                            status: 502,
                            message: format!("malformed command frame: {err}"),
                        }
                    })?;
                    if let Some(message) = frame.error {
                        if frame.timed_out.unwrap_or(false) {
                            return Err(ProviderError::CommandTimeout {
                                seconds: timeout_seconds,
                            });
                        }
                        return Err(ProviderError::Api {
                            status: 502,
                            message,
                        });
                    }
                    if let Some(code) = frame.exit_code {
                        return Ok(code);
                    }
                    let data = frame.data.unwrap_or_default();
                    let chunk = match frame.stream.as_deref() {
                        Some("stderr") => OutputChunk::Stderr(data),
                        _ => OutputChunk::Stdout(data),
                    };
                    if tx.send(chunk).await.is_err() {
                        // Consumer is gone; stop reading.
                        return Ok(-1);
                    }
                }
            }
            Err(ProviderError::Api {
                status: 502,
                message: "command stream ended without an exit status".to_string(),
            })
        });

        Ok(StreamingCommand { output: rx, exit })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(format!(
                "{}/sandboxes/{}",
                self.base_url, handle.sandbox_id
            ))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        // Already gone counts as destroyed.
        if status == StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        Err(Self::api_error(status, response).await)
    }
}

// ---------------------------------------------------------------------
// Mock provider

/// One scripted output step for the mock provider.
#[derive(Debug, Clone)]
pub enum MockOutput {
    /// A full stdout line (newline appended when sent).
    StdoutLine(String),
    /// A raw stdout chunk, sent exactly as given.
    StdoutChunk(String),
    /// A stderr chunk.
    Stderr(String),
    /// Pause between steps.
    Delay(Duration),
}

#[derive(Debug, Default)]
struct MockCalls {
    provisions: Vec<ProvisionRequest>,
    commands: Vec<String>,
    files: Vec<SandboxFile>,
    destroys: Vec<String>,
}

/// Scripted in-memory sandbox provider.
///
/// Sessions against the mock never leave the process: `run_streaming`
/// plays back the configured script and the call log records what the
/// orchestrator did, which is what the lifecycle tests assert on.
#[derive(Debug, Default)]
pub struct MockSandboxProvider {
    missing_templates: HashSet<String>,
    provision_error: Option<String>,
    script: Vec<MockOutput>,
    exit_code: i32,
    /// Fail the command with a provider-side execution timeout after
    /// the script plays out, instead of reporting an exit status.
    command_timeout: Option<u64>,
    /// Keep the command stream open after the script: simulates an
    /// agent that never finishes.
    hold_open: bool,
    calls: Mutex<MockCalls>,
    destroyed: Notify,
}

impl MockSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a run that emits the given stdout lines and exits 0.
    pub fn with_stdout_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = lines
            .into_iter()
            .map(|line| MockOutput::StdoutLine(line.into()))
            .collect();
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn with_script(script: Vec<MockOutput>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn missing_template(mut self, template: impl Into<String>) -> Self {
        self.missing_templates.insert(template.into());
        self
    }

    pub fn failing_provision(mut self, message: impl Into<String>) -> Self {
        self.provision_error = Some(message.into());
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn command_timeout(mut self, seconds: u64) -> Self {
        self.command_timeout = Some(seconds);
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn provision_count(&self) -> usize {
        self.calls.lock().expect("mock calls lock").provisions.len()
    }

    pub fn provisioned_templates(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("mock calls lock")
            .provisions
            .iter()
            .map(|p| p.template.clone())
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().expect("mock calls lock").commands.clone()
    }

    pub fn written_paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("mock calls lock")
            .files
            .iter()
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn written_file(&self, path: &str) -> Option<String> {
        self.calls
            .lock()
            .expect("mock calls lock")
            .files
            .iter()
            .find(|f| f.path == path)
            .map(|f| f.data.clone())
    }

    pub fn destroy_count(&self) -> usize {
        self.calls.lock().expect("mock calls lock").destroys.len()
    }

    /// Resolves once the first destroy call lands.
    pub async fn wait_destroyed(&self) {
        if self.destroy_count() > 0 {
            return;
        }
        self.destroyed.notified().await;
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn provision(&self, request: ProvisionRequest) -> Result<SandboxHandle, ProviderError> {
        let template = request.template.clone();
        self.calls
            .lock()
            .expect("mock calls lock")
            .provisions
            .push(request);
        if let Some(message) = &self.provision_error {
            return Err(ProviderError::Api {
                status: 500,
                message: message.clone(),
            });
        }
        if self.missing_templates.contains(&template) {
            return Err(ProviderError::TemplateNotFound { template });
        }
        Ok(SandboxHandle {
            sandbox_id: format!("mock-{template}"),
        })
    }

    async fn write_files(
        &self,
        _handle: &SandboxHandle,
        files: Vec<SandboxFile>,
    ) -> Result<(), ProviderError> {
        self.calls
            .lock()
            .expect("mock calls lock")
            .files
            .extend(files);
        Ok(())
    }

    async fn run_streaming(
        &self,
        _handle: &SandboxHandle,
        command: &str,
        _timeout: Duration,
    ) -> Result<StreamingCommand, ProviderError> {
        self.calls
            .lock()
            .expect("mock calls lock")
            .commands
            .push(command.to_string());

        let script = self.script.clone();
        let exit_code = self.exit_code;
        let command_timeout = self.command_timeout;
        let hold_open = self.hold_open;
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let exit = tokio::spawn(async move {
            for step in script {
                let chunk = match step {
                    MockOutput::StdoutLine(line) => OutputChunk::Stdout(format!("{line}\n")),
                    MockOutput::StdoutChunk(chunk) => OutputChunk::Stdout(chunk),
                    MockOutput::Stderr(chunk) => OutputChunk::Stderr(chunk),
                    MockOutput::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                };
                if tx.send(chunk).await.is_err() {
                    return Ok(-1);
                }
            }
            if let Some(seconds) = command_timeout {
                return Err(ProviderError::CommandTimeout { seconds });
            }
            if hold_open {
                // Stay "running" until the session gives up on us.
                tx.closed().await;
                return Ok(-1);
            }
            Ok(exit_code)
        });
        Ok(StreamingCommand { output: rx, exit })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        self.calls
            .lock()
            .expect("mock calls lock")
            .destroys
            .push(handle.sandbox_id.clone());
        self.destroyed.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_plays_back_script_in_order() {
        let provider = MockSandboxProvider::with_stdout_lines(["a", "b"]);
        let handle = provider
            .provision(ProvisionRequest {
                template: "squall".to_string(),
                timeout: Duration::from_secs(60),
                envs: HashMap::new(),
                metadata: HashMap::new(),
            })
            .await
            .expect("provision");

        let mut command = provider
            .run_streaming(&handle, "echo", Duration::from_secs(10))
            .await
            .expect("run");
        assert_eq!(
            command.output.recv().await,
            Some(OutputChunk::Stdout("a\n".to_string()))
        );
        assert_eq!(
            command.output.recv().await,
            Some(OutputChunk::Stdout("b\n".to_string()))
        );
        assert_eq!(command.output.recv().await, None);
        assert_eq!(command.exit.await.expect("join").expect("exit"), 0);
    }

    #[tokio::test]
    async fn mock_provider_reports_missing_template() {
        let provider = MockSandboxProvider::new().missing_template("custom");
        let err = provider
            .provision(ProvisionRequest {
                template: "custom".to_string(),
                timeout: Duration::from_secs(60),
                envs: HashMap::new(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::TemplateNotFound { .. }));
    }
}
