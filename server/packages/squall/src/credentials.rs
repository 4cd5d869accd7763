//! Credential resolution.
//!
//! Credentials are inputs to configuration, not orchestration logic:
//! this module turns request-supplied keys plus the host environment
//! into the environment variable set the sandbox is provisioned with.
//! The agent SDK inside the sandbox consumes these variables; squall
//! itself never interprets them beyond the rules below.

use std::collections::HashMap;
use std::path::PathBuf;

use squall_error::SquallError;

use crate::config::QueryRequest;

/// Provider env vars auto-forwarded from the host into the sandbox.
pub const PROVIDER_ENV_KEYS: [&str; 16] = [
    // Google Vertex AI
    "CLAUDE_CODE_USE_VERTEX",
    "CLOUD_ML_REGION",
    "ANTHROPIC_VERTEX_PROJECT_ID",
    // Amazon Bedrock
    "CLAUDE_CODE_USE_BEDROCK",
    "AWS_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    // Microsoft Azure / Foundry
    "CLAUDE_CODE_USE_FOUNDRY",
    "AZURE_FOUNDRY_RESOURCE",
    "AZURE_API_KEY",
    // Custom base URL (proxy, self-hosted, OpenRouter)
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_AUTH_TOKEN",
    // Model name overrides
    "ANTHROPIC_DEFAULT_SONNET_MODEL",
    "ANTHROPIC_DEFAULT_OPUS_MODEL",
    "ANTHROPIC_DEFAULT_HAIKU_MODEL",
];

/// Env vars that select an alternate model provider; any one of them
/// satisfies the auth requirement without an Anthropic API key.
pub const PROVIDER_TOGGLE_KEYS: [&str; 3] = [
    "CLAUDE_CODE_USE_VERTEX",
    "CLAUDE_CODE_USE_BEDROCK",
    "CLAUDE_CODE_USE_FOUNDRY",
];

/// Where GCP service-account JSON lands inside the sandbox.
pub const GCP_CREDENTIALS_SANDBOX_PATH: &str = "/home/user/.config/gcloud/service_account.json";

/// The credential material one session carries into its sandbox.
#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    /// Environment variables the sandbox is provisioned with.
    pub envs: HashMap<String, String>,
    /// Service-account JSON read eagerly on the host; uploaded into the
    /// sandbox as a file, never passed through a command line.
    pub gcp_credentials: Option<String>,
}

/// Resolve credentials from the request body and the host environment.
pub fn resolve_credentials(request: &QueryRequest) -> Result<ResolvedCredentials, SquallError> {
    let host_env: HashMap<String, String> = std::env::vars().collect();
    let gcp_credentials = read_gcp_credentials(&host_env)?;
    assemble(request, &host_env, gcp_credentials)
}

fn assemble(
    request: &QueryRequest,
    host_env: &HashMap<String, String>,
    gcp_credentials: Option<String>,
) -> Result<ResolvedCredentials, SquallError> {
    let anthropic_api_key = request
        .anthropic_api_key
        .clone()
        .or_else(|| non_empty(host_env, "ANTHROPIC_API_KEY"));
    let openrouter_api_key = request
        .openrouter_api_key
        .clone()
        .or_else(|| non_empty(host_env, "OPENROUTER_API_KEY"));

    let uses_alternate_provider = PROVIDER_TOGGLE_KEYS
        .iter()
        .any(|key| non_empty(host_env, key).is_some());
    let uses_custom_base_url = non_empty(host_env, "ANTHROPIC_BASE_URL").is_some();
    if anthropic_api_key.is_none() && !uses_alternate_provider && !uses_custom_base_url {
        return Err(SquallError::ConfigInvalid {
            message: "anthropic_api_key is required: pass it in the request body \
                      or set ANTHROPIC_API_KEY in the environment"
                .to_string(),
        });
    }

    let mut envs = HashMap::new();
    if let Some(key) = anthropic_api_key {
        envs.insert("ANTHROPIC_API_KEY".to_string(), key);
    }
    for key in PROVIDER_ENV_KEYS {
        if let Some(value) = non_empty(host_env, key) {
            envs.insert(key.to_string(), value);
        }
    }

    // A per-request OpenRouter key overrides any forwarded auth token.
    if let Some(key) = openrouter_api_key {
        envs.insert("ANTHROPIC_AUTH_TOKEN".to_string(), key);
    }

    // With a custom base URL plus auth token the SDK must not see a real
    // Anthropic key, or it validates model names against Anthropic's API
    // and rejects non-Claude models.
    if envs.contains_key("ANTHROPIC_BASE_URL") && envs.contains_key("ANTHROPIC_AUTH_TOKEN") {
        envs.insert("ANTHROPIC_API_KEY".to_string(), String::new());
    }

    if gcp_credentials.is_some() {
        envs.insert(
            "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
            GCP_CREDENTIALS_SANDBOX_PATH.to_string(),
        );
    }

    Ok(ResolvedCredentials {
        envs,
        gcp_credentials,
    })
}

/// Read GCP service-account JSON when Vertex AI is configured.
///
/// Read eagerly at resolution time so a missing key file fails the
/// request up front instead of mid-provisioning.
fn read_gcp_credentials(host_env: &HashMap<String, String>) -> Result<Option<String>, SquallError> {
    if non_empty(host_env, "CLAUDE_CODE_USE_VERTEX").is_none() {
        return Ok(None);
    }
    let Some(path) = non_empty(host_env, "GOOGLE_APPLICATION_CREDENTIALS") else {
        return Err(SquallError::ConfigInvalid {
            message: "GOOGLE_APPLICATION_CREDENTIALS is required when using Vertex AI: \
                      set it to the path of your GCP service account JSON key"
                .to_string(),
        });
    };
    let path = PathBuf::from(path);
    std::fs::read_to_string(&path)
        .map(Some)
        .map_err(|_| SquallError::ConfigInvalid {
            message: format!(
                "GOOGLE_APPLICATION_CREDENTIALS file not found: {}",
                path.display()
            ),
        })
}

fn non_empty(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key).filter(|v| !v.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TIMEOUT_SECS;

    fn request_with_key(key: Option<&str>) -> QueryRequest {
        QueryRequest {
            prompt: "hi".to_string(),
            anthropic_api_key: key.map(String::from),
            openrouter_api_key: None,
            model: None,
            max_turns: None,
            timeout: DEFAULT_TIMEOUT_SECS,
            files: None,
        }
    }

    fn env(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn request_key_lands_in_sandbox_envs() {
        let creds = assemble(&request_with_key(Some("sk-test")), &env(&[]), None).expect("creds");
        assert_eq!(creds.envs.get("ANTHROPIC_API_KEY").unwrap(), "sk-test");
    }

    #[test]
    fn missing_auth_is_a_config_error() {
        let err = assemble(&request_with_key(None), &env(&[]), None).unwrap_err();
        assert!(matches!(err, SquallError::ConfigInvalid { .. }));
    }

    #[test]
    fn provider_toggle_satisfies_auth_and_is_forwarded() {
        let host = env(&[
            ("CLAUDE_CODE_USE_BEDROCK", "1"),
            ("AWS_REGION", "us-east-1"),
            ("UNRELATED_VAR", "nope"),
        ]);
        let creds = assemble(&request_with_key(None), &host, None).expect("creds");
        assert_eq!(creds.envs.get("CLAUDE_CODE_USE_BEDROCK").unwrap(), "1");
        assert_eq!(creds.envs.get("AWS_REGION").unwrap(), "us-east-1");
        assert!(!creds.envs.contains_key("UNRELATED_VAR"));
    }

    #[test]
    fn custom_base_url_with_auth_token_blanks_the_api_key() {
        let host = env(&[
            ("ANTHROPIC_BASE_URL", "https://openrouter.ai/api"),
            ("ANTHROPIC_AUTH_TOKEN", "or-key"),
        ]);
        let creds = assemble(&request_with_key(Some("sk-real")), &host, None).expect("creds");
        assert_eq!(creds.envs.get("ANTHROPIC_API_KEY").unwrap(), "");
        assert_eq!(creds.envs.get("ANTHROPIC_AUTH_TOKEN").unwrap(), "or-key");
    }

    #[test]
    fn openrouter_request_key_overrides_forwarded_token() {
        let host = env(&[
            ("ANTHROPIC_BASE_URL", "https://openrouter.ai/api"),
            ("ANTHROPIC_AUTH_TOKEN", "stale"),
        ]);
        let mut request = request_with_key(None);
        request.openrouter_api_key = Some("fresh".to_string());
        let creds = assemble(&request, &host, None).expect("creds");
        assert_eq!(creds.envs.get("ANTHROPIC_AUTH_TOKEN").unwrap(), "fresh");
    }

    #[test]
    fn gcp_credentials_set_the_sandbox_path_env() {
        let creds = assemble(
            &request_with_key(Some("sk-test")),
            &env(&[]),
            Some("{\"type\":\"service_account\"}".to_string()),
        )
        .expect("creds");
        assert_eq!(
            creds.envs.get("GOOGLE_APPLICATION_CREDENTIALS").unwrap(),
            GCP_CREDENTIALS_SANDBOX_PATH
        );
        assert!(creds.gcp_credentials.is_some());
    }
}
