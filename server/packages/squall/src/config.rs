//! Configuration resolution.
//!
//! Two layers feed one session: the project document (`squall.json`,
//! loaded leniently with warnings for unknown or ill-typed fields) and
//! the per-request overrides in [`QueryRequest`]. [`resolve`] merges
//! them into one validated [`EffectiveConfig`]; everything downstream
//! assumes a fully validated structure and never re-checks.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use squall_error::SquallError;
use utoipa::ToSchema;

use crate::uploads::INPUT_ROOT;

/// Session timeout bounds, enforced before provisioning.
pub const MIN_TIMEOUT_SECS: u64 = 5;
pub const MAX_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Upper bound on prompt length, in bytes.
pub const MAX_PROMPT_BYTES: usize = 1_000_000;

/// Tool capability appended to the allow-list when skills are present.
pub const SKILL_TOOL: &str = "Skill";

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Body of `POST /query`: the request-level configuration layer.
#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
pub struct QueryRequest {
    /// The task for the agent to execute.
    pub prompt: String,
    /// Anthropic API key. Falls back to `ANTHROPIC_API_KEY`.
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    /// OpenRouter API key. Falls back to `OPENROUTER_API_KEY`.
    #[serde(default)]
    pub openrouter_api_key: Option<String>,
    /// Model override (e.g. "sonnet", "opus"). Overrides `squall.json`.
    #[serde(default)]
    pub model: Option<String>,
    /// Max conversation turns. Overrides `squall.json`.
    #[serde(default)]
    pub max_turns: Option<u64>,
    /// Session timeout in seconds (5-3600).
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Files to upload, keyed by path relative to the sandbox home.
    #[serde(default)]
    pub files: Option<BTreeMap<String, String>>,
}

/// The validated project-level configuration document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectConfig {
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u64>,
    pub output_format: Option<Value>,
    pub agents: Option<Value>,
    pub mcp_servers: Option<Value>,
    pub skills_dir: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
}

/// The merged configuration for one session. Serialized verbatim into
/// the sandbox as `agent_config.json`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EffectiveConfig {
    pub prompt: String,
    pub cwd: String,
    pub model: Option<String>,
    pub max_turns: Option<u64>,
    pub system_prompt: Option<String>,
    pub output_format: Option<Value>,
    pub agents: Option<Value>,
    pub mcp_servers: Option<Value>,
    pub has_skills: bool,
    pub allowed_tools: Option<Vec<String>>,
}

/// Merge the project document and the request overrides.
///
/// The merge is single-level: a request field, when present, replaces
/// the base field wholesale; absent fields fall through. Object-valued
/// fields come from the project document only. A wholly absent base is
/// an empty document.
pub fn resolve(
    base: Option<&ProjectConfig>,
    request: &QueryRequest,
    has_skills: bool,
) -> Result<EffectiveConfig, SquallError> {
    if request.prompt.is_empty() {
        return Err(SquallError::ConfigInvalid {
            message: "prompt must not be empty".to_string(),
        });
    }
    if request.prompt.len() > MAX_PROMPT_BYTES {
        return Err(SquallError::ConfigInvalid {
            message: format!(
                "prompt is {} bytes (max {MAX_PROMPT_BYTES})",
                request.prompt.len()
            ),
        });
    }

    let empty = ProjectConfig::default();
    let base = base.unwrap_or(&empty);

    let mut allowed_tools = base.allowed_tools.clone();
    if let Some(tools) = &mut allowed_tools {
        if has_skills && !tools.iter().any(|t| t == SKILL_TOOL) {
            tools.push(SKILL_TOOL.to_string());
        }
    }

    Ok(EffectiveConfig {
        prompt: request.prompt.clone(),
        cwd: INPUT_ROOT.to_string(),
        model: request.model.clone().or_else(|| base.model.clone()),
        max_turns: request.max_turns.or(base.max_turns),
        system_prompt: base.system_prompt.clone(),
        output_format: base.output_format.clone(),
        agents: base.agents.clone(),
        mcp_servers: base.mcp_servers.clone(),
        has_skills,
        allowed_tools,
    })
}

/// Validate the caller-supplied session timeout and turn it into a
/// deadline budget. Out-of-range values are rejected before any
/// sandbox is provisioned.
pub fn session_timeout(request: &QueryRequest) -> Result<Duration, SquallError> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&request.timeout) {
        return Err(SquallError::ConfigInvalid {
            message: format!(
                "timeout must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds, got {}",
                request.timeout
            ),
        });
    }
    Ok(Duration::from_secs(request.timeout))
}

/// Load `squall.json` from the given path, if present.
///
/// Unknown fields are ignored with a warning and ill-typed fields are
/// dropped with a warning; a malformed document is treated as absent.
/// Forward compatibility over strictness: a stale document must never
/// take the server down.
pub fn load_project_config(path: &Path) -> Option<ProjectConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return None,
    };
    let value: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "squall.json: invalid JSON");
            return None;
        }
    };
    let Value::Object(map) = value else {
        tracing::error!(path = %path.display(), "squall.json: expected a JSON object");
        return None;
    };

    let mut config = ProjectConfig::default();
    for (key, value) in map {
        match key.as_str() {
            "system_prompt" => config.system_prompt = take_string(&key, value),
            "model" => config.model = take_string(&key, value),
            "max_turns" => match value.as_u64() {
                Some(n) => config.max_turns = Some(n),
                None => warn_type(&key, "a positive integer", &value),
            },
            "output_format" => config.output_format = take_object(&key, value),
            "mcp_servers" => config.mcp_servers = take_object(&key, value),
            "agents" => {
                if value.is_object() || value.is_array() {
                    config.agents = Some(value);
                } else {
                    warn_type(&key, "an object or array", &value);
                }
            }
            "skills_dir" => config.skills_dir = take_string(&key, value),
            "allowed_tools" => match value {
                Value::Array(items)
                    if items.iter().all(|item| item.is_string()) =>
                {
                    config.allowed_tools = Some(
                        items
                            .into_iter()
                            .filter_map(|item| item.as_str().map(String::from))
                            .collect(),
                    );
                }
                other => warn_type(&key, "an array of strings", &other),
            },
            _ => {
                tracing::warn!(field = %key, "squall.json: unknown field, ignoring");
            }
        }
    }

    // A skills_dir that does not exist on disk is dropped here so the
    // rest of the pipeline can trust it.
    if let Some(dir) = &config.skills_dir {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if !base.join(dir).is_dir() {
            tracing::warn!(skills_dir = %dir, "squall.json: skills_dir does not exist, ignoring");
            config.skills_dir = None;
        }
    }

    Some(config)
}

fn take_string(key: &str, value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        other => {
            warn_type(key, "a string", &other);
            None
        }
    }
}

fn take_object(key: &str, value: Value) -> Option<Value> {
    if value.is_object() {
        Some(value)
    } else {
        warn_type(key, "an object", &value);
        None
    }
}

fn warn_type(key: &str, expected: &str, got: &Value) {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    tracing::warn!(
        field = %key,
        "squall.json: field should be {expected}, got {got}, skipping"
    );
}

/// Read `SKILL.md` files from the configured skills directory.
///
/// Only directory entries whose names are alphanumeric (plus `-`/`_`)
/// are considered; the names become paths inside the sandbox.
pub fn load_skills(config_dir: &Path, skills_dir: &str) -> BTreeMap<String, String> {
    let base = config_dir.join(skills_dir);
    let mut skills = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(&base) else {
        return skills;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_valid_skill_name(name) {
            tracing::warn!(skill = %name, "skills_dir: skipping entry with invalid name");
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(path.join("SKILL.md")) {
            skills.insert(name.to_string(), content);
        }
    }
    skills
}

fn is_valid_skill_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
