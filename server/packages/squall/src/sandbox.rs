//! Sandbox lifecycle.
//!
//! [`SandboxSession`] owns exactly one provisioned sandbox for exactly
//! one session: provision, write inputs, start the agent, tear down.
//! Teardown is idempotent and runs on every exit path; a session that
//! is dropped while still holding a handle schedules a best-effort
//! destroy so no environment outlives its request.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use squall_error::SquallError;

use crate::config::EffectiveConfig;
use crate::credentials::{ResolvedCredentials, GCP_CREDENTIALS_SANDBOX_PATH};
use crate::provider::{
    ProviderError, ProvisionRequest, SandboxFile, SandboxHandle, SandboxProvider,
    StreamingCommand,
};
use crate::uploads::{ValidatedUpload, INPUT_ROOT};

/// Prebuilt template with the agent SDK installed. Overridable so
/// deployments can point at their own build.
pub const TEMPLATE_ENV: &str = "SQUALL_TEMPLATE";
pub const DEFAULT_TEMPLATE: &str = "squall";

/// Generic template used when the prebuilt one is unavailable; the SDK
/// is installed at runtime on top of it.
pub const FALLBACK_TEMPLATE: &str = "claude-code";

/// Agent SDK version installed during fallback provisioning.
pub const SDK_VERSION: &str = "0.2.42";

/// Where the runner and its configuration live inside the sandbox.
const RUNNER_DIR: &str = "/opt/agent-runner";
const RUNNER_PATH: &str = "/opt/agent-runner/runner.mjs";
const AGENT_CONFIG_PATH: &str = "/opt/agent-runner/agent_config.json";
const SETTINGS_PATH: &str = "/home/user/.claude/settings.json";
const SKILLS_ROOT: &str = "/home/user/.claude/skills";

/// Fixed wall-clock budget for the agent command itself, independent of
/// the caller-picked session timeout.
pub const RUNNER_TIMEOUT: Duration = Duration::from_secs(1800);

/// Budget for the fallback npm install.
const SDK_INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// The script that drives the agent SDK inside the sandbox.
const RUNNER_SCRIPT: &str = include_str!("../assets/runner.mjs");

/// Template pair used for provisioning.
#[derive(Debug, Clone)]
pub struct SandboxTemplates {
    pub primary: String,
    pub fallback: String,
}

impl Default for SandboxTemplates {
    fn default() -> Self {
        Self {
            primary: std::env::var(TEMPLATE_ENV).unwrap_or_else(|_| DEFAULT_TEMPLATE.to_string()),
            fallback: FALLBACK_TEMPLATE.to_string(),
        }
    }
}

/// One session's provisioned sandbox.
#[derive(Debug)]
pub struct SandboxSession {
    provider: Arc<dyn SandboxProvider>,
    request_id: String,
    handle: Option<SandboxHandle>,
}

impl SandboxSession {
    /// Provision a sandbox, preferring the prebuilt template.
    ///
    /// Fallback provisioning is triggered only by a missing-template
    /// failure; any other provider error is fatal as-is so real
    /// provisioning problems are never masked as a missing image.
    pub async fn provision(
        provider: Arc<dyn SandboxProvider>,
        templates: &SandboxTemplates,
        timeout: Duration,
        envs: HashMap<String, String>,
        request_id: &str,
    ) -> Result<Self, SquallError> {
        let metadata = HashMap::from([("request_id".to_string(), request_id.to_string())]);
        tracing::info!(request_id, template = %templates.primary, "creating sandbox");

        let handle = match provider
            .provision(ProvisionRequest {
                template: templates.primary.clone(),
                timeout,
                envs: envs.clone(),
                metadata: metadata.clone(),
            })
            .await
        {
            Ok(handle) => handle,
            Err(ProviderError::TemplateNotFound { template }) => {
                tracing::warn!(
                    request_id,
                    template = %template,
                    fallback = %templates.fallback,
                    "template not found, falling back (adds install overhead)"
                );
                let handle = provider
                    .provision(ProvisionRequest {
                        template: templates.fallback.clone(),
                        timeout,
                        envs,
                        metadata,
                    })
                    .await
                    .map_err(provision_error)?;
                let session = Self {
                    provider: provider.clone(),
                    request_id: request_id.to_string(),
                    handle: Some(handle),
                };
                session.install_sdk().await?;
                tracing::info!(request_id, sandbox_id = %session.sandbox_id(), "sandbox created");
                return Ok(session);
            }
            Err(err) => return Err(provision_error(err)),
        };

        tracing::info!(request_id, sandbox_id = %handle.sandbox_id, "sandbox created");
        Ok(Self {
            provider,
            request_id: request_id.to_string(),
            handle: Some(handle),
        })
    }

    pub fn sandbox_id(&self) -> &str {
        self.handle
            .as_ref()
            .map(|h| h.sandbox_id.as_str())
            .unwrap_or("destroyed")
    }

    fn handle(&self) -> Result<&SandboxHandle, SquallError> {
        self.handle.as_ref().ok_or_else(|| SquallError::ProvisionFailed {
            message: "sandbox already destroyed".to_string(),
        })
    }

    /// Install the agent SDK on top of the fallback template.
    async fn install_sdk(&self) -> Result<(), SquallError> {
        let command = format!(
            "mkdir -p {RUNNER_DIR} && cd {RUNNER_DIR} && npm init -y \
             && npm install @anthropic-ai/claude-agent-sdk@{SDK_VERSION}"
        );
        self.run_to_completion(&command, SDK_INSTALL_TIMEOUT)
            .await
            .map_err(|err| SquallError::ProvisionFailed {
                message: format!("agent SDK install failed: {err}"),
            })
    }

    /// Run a fixed command to completion, discarding output.
    async fn run_to_completion(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        let mut running = self
            .provider
            .run_streaming(self.handle().map_err(|_| ProviderError::Api {
                status: 500,
                message: "sandbox already destroyed".to_string(),
            })?, command, timeout)
            .await?;
        while running.output.recv().await.is_some() {}
        let code = running.exit.await.map_err(|err| ProviderError::Api {
            status: 500,
            message: format!("command task failed: {err}"),
        })??;
        if code != 0 {
            return Err(ProviderError::Api {
                status: 500,
                message: format!("command exited with status {code}"),
            });
        }
        Ok(())
    }

    /// Write validated uploads and skills into the sandbox.
    ///
    /// Everything caller-controlled travels as file content through the
    /// provider's file API; no shell command is ever built from it.
    pub async fn write_inputs(
        &self,
        uploads: &[ValidatedUpload],
        skills: &BTreeMap<String, String>,
    ) -> Result<(), SquallError> {
        let mut files = Vec::with_capacity(uploads.len() + skills.len());
        for upload in uploads {
            files.push(SandboxFile {
                path: format!("{INPUT_ROOT}/{}", upload.path),
                data: upload.content.clone(),
            });
        }
        for (name, content) in skills {
            files.push(SandboxFile {
                path: format!("{SKILLS_ROOT}/{name}/SKILL.md"),
                data: content.clone(),
            });
        }
        if files.is_empty() {
            return Ok(());
        }

        tracing::info!(
            request_id = %self.request_id,
            file_count = uploads.len(),
            skill_count = skills.len(),
            "uploading session inputs"
        );
        self.provider
            .write_files(self.handle()?, files)
            .await
            .map_err(|err| SquallError::ProvisionFailed {
                message: format!("failed to upload session inputs: {err}"),
            })
    }

    /// Write the agent configuration into the sandbox and start the
    /// runner process.
    ///
    /// The configuration reaches the process as a file it reads at
    /// startup; the command line is a fixed string with no request
    /// content in it.
    pub async fn start_agent(
        &self,
        config: &EffectiveConfig,
        credentials: &ResolvedCredentials,
    ) -> Result<StreamingCommand, SquallError> {
        let mut settings = json!({
            "permissions": {"allow": [], "deny": []},
        });
        if !config.has_skills {
            settings["env"] = json!({"CLAUDE_CODE_DISABLE_EXPERIMENTAL_BETAS": "1"});
        }

        let agent_config =
            serde_json::to_string(config).map_err(|err| SquallError::ProvisionFailed {
                message: format!("failed to serialize agent config: {err}"),
            })?;

        let mut files = vec![
            SandboxFile {
                path: SETTINGS_PATH.to_string(),
                data: settings.to_string(),
            },
            SandboxFile {
                path: RUNNER_PATH.to_string(),
                data: RUNNER_SCRIPT.to_string(),
            },
            SandboxFile {
                path: AGENT_CONFIG_PATH.to_string(),
                data: agent_config,
            },
        ];
        if let Some(gcp) = &credentials.gcp_credentials {
            tracing::info!(request_id = %self.request_id, "uploading GCP credentials");
            files.push(SandboxFile {
                path: GCP_CREDENTIALS_SANDBOX_PATH.to_string(),
                data: gcp.clone(),
            });
        }
        self.provider
            .write_files(self.handle()?, files)
            .await
            .map_err(|err| SquallError::ProvisionFailed {
                message: format!("failed to write agent configuration: {err}"),
            })?;

        tracing::info!(
            request_id = %self.request_id,
            model = config.model.as_deref().unwrap_or("default"),
            max_turns = ?config.max_turns,
            "starting agent"
        );
        self.provider
            .run_streaming(self.handle()?, runner_command(), RUNNER_TIMEOUT)
            .await
            .map_err(|err| SquallError::AgentProcessFailed {
                subtype: None,
                message: format!("failed to start agent process: {err}"),
            })
    }

    /// Destroy the sandbox. Safe to call more than once; failures are
    /// logged, never raised.
    pub async fn teardown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        tracing::info!(
            request_id = %self.request_id,
            sandbox_id = %handle.sandbox_id,
            "destroying sandbox"
        );
        if let Err(err) = self.provider.destroy(&handle).await {
            tracing::warn!(
                request_id = %self.request_id,
                sandbox_id = %handle.sandbox_id,
                error = %err,
                "sandbox destroy failed"
            );
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        // Normal paths tear down explicitly; this catches early returns
        // and panics so the sandbox never outlives the session.
        if let Some(handle) = self.handle.take() {
            let provider = self.provider.clone();
            let request_id = self.request_id.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    tracing::warn!(
                        request_id = %request_id,
                        sandbox_id = %handle.sandbox_id,
                        "sandbox dropped without teardown, destroying"
                    );
                    let _ = provider.destroy(&handle).await;
                });
            }
        }
    }
}

/// The fixed command that starts the agent runner.
pub fn runner_command() -> &'static str {
    "node /opt/agent-runner/runner.mjs"
}

fn provision_error(err: ProviderError) -> SquallError {
    SquallError::ProvisionFailed {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, QueryRequest, DEFAULT_TIMEOUT_SECS};
    use crate::provider::MockSandboxProvider;

    fn templates() -> SandboxTemplates {
        SandboxTemplates {
            primary: "squall".to_string(),
            fallback: "claude-code".to_string(),
        }
    }

    async fn provisioned(provider: Arc<MockSandboxProvider>) -> SandboxSession {
        SandboxSession::provision(
            provider,
            &templates(),
            Duration::from_secs(60),
            HashMap::new(),
            "req1",
        )
        .await
        .expect("provision")
    }

    fn effective_config() -> EffectiveConfig {
        let request = QueryRequest {
            prompt: "hello".to_string(),
            anthropic_api_key: None,
            openrouter_api_key: None,
            model: Some("sonnet".to_string()),
            max_turns: None,
            timeout: DEFAULT_TIMEOUT_SECS,
            files: None,
        };
        resolve(None, &request, false).expect("resolve")
    }

    fn no_credentials() -> ResolvedCredentials {
        ResolvedCredentials {
            envs: HashMap::new(),
            gcp_credentials: None,
        }
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let provider = Arc::new(MockSandboxProvider::new());
        let mut session = provisioned(provider.clone()).await;
        session.teardown().await;
        session.teardown().await;
        assert_eq!(provider.destroy_count(), 1);
    }

    #[tokio::test]
    async fn missing_template_falls_back_and_installs_sdk() {
        let provider = Arc::new(MockSandboxProvider::new().missing_template("squall"));
        let mut session = provisioned(provider.clone()).await;
        assert_eq!(
            provider.provisioned_templates(),
            vec!["squall".to_string(), "claude-code".to_string()]
        );
        let commands = provider.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("npm install @anthropic-ai/claude-agent-sdk"));
        session.teardown().await;
    }

    #[tokio::test]
    async fn non_notfound_provision_error_does_not_fall_back() {
        let provider = Arc::new(MockSandboxProvider::new().failing_provision("quota exceeded"));
        let err = SandboxSession::provision(
            provider.clone(),
            &templates(),
            Duration::from_secs(60),
            HashMap::new(),
            "req1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SquallError::ProvisionFailed { .. }));
        assert_eq!(provider.provision_count(), 1);
        assert_eq!(provider.destroy_count(), 0);
    }

    #[tokio::test]
    async fn start_agent_uses_a_fixed_command_and_a_config_file() {
        let provider = Arc::new(MockSandboxProvider::with_stdout_lines(
            [r#"{"type":"result","subtype":"success"}"#],
        ));
        let mut session = provisioned(provider.clone()).await;
        session
            .write_inputs(
                &[ValidatedUpload {
                    path: "src/app.py".to_string(),
                    content: "print('$(rm -rf /)')".to_string(),
                }],
                &BTreeMap::from([("review".to_string(), "# Review".to_string())]),
            )
            .await
            .expect("write inputs");
        let _running = session
            .start_agent(&effective_config(), &no_credentials())
            .await
            .expect("start agent");

        // Caller content only ever lands in files, never in a command.
        assert_eq!(provider.commands(), vec![runner_command().to_string()]);
        let paths = provider.written_paths();
        assert!(paths.contains(&"/home/user/src/app.py".to_string()));
        assert!(paths.contains(&"/home/user/.claude/skills/review/SKILL.md".to_string()));
        assert!(paths.contains(&AGENT_CONFIG_PATH.to_string()));

        let config = provider.written_file(AGENT_CONFIG_PATH).expect("config");
        let value: serde_json::Value = serde_json::from_str(&config).expect("json");
        assert_eq!(value["prompt"], "hello");
        assert_eq!(value["model"], "sonnet");
        assert_eq!(value["cwd"], INPUT_ROOT);

        let settings = provider.written_file(SETTINGS_PATH).expect("settings");
        let value: serde_json::Value = serde_json::from_str(&settings).expect("json");
        assert_eq!(value["env"]["CLAUDE_CODE_DISABLE_EXPERIMENTAL_BETAS"], "1");

        session.teardown().await;
    }

    #[tokio::test]
    async fn dropping_a_live_session_still_destroys_the_sandbox() {
        let provider = Arc::new(MockSandboxProvider::new());
        let session = provisioned(provider.clone()).await;
        drop(session);
        provider.wait_destroyed().await;
        assert_eq!(provider.destroy_count(), 1);
    }
}
