//! Error taxonomy for squall.
//!
//! Every failure a session can hit maps to exactly one [`SquallError`]
//! variant, and every variant carries a stable [`ErrorType`] tag that is
//! safe to expose to callers. Internal detail (provider payloads, stack
//! context) stays in server logs; callers only ever see the category tag
//! and a human-readable message.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Stable error category tags surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The merged configuration failed validation.
    ConfigInvalid,
    /// An uploaded file batch was rejected before provisioning.
    UploadRejected,
    /// The sandbox provider could not provision an environment.
    ProvisionFailed,
    /// The agent process inside the sandbox failed.
    AgentProcessFailed,
    /// The session or the underlying command exceeded its time budget.
    Timeout,
    /// The agent emitted a line that is not a well-formed event.
    StreamFraming,
    /// The caller went away mid-stream. Never surfaced to the caller.
    ClientDisconnected,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ConfigInvalid => "config_invalid",
            ErrorType::UploadRejected => "upload_rejected",
            ErrorType::ProvisionFailed => "provision_failed",
            ErrorType::AgentProcessFailed => "agent_process_failed",
            ErrorType::Timeout => "timeout",
            ErrorType::StreamFraming => "stream_framing",
            ErrorType::ClientDisconnected => "client_disconnected",
        }
    }
}

/// Why an upload batch was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UploadRejectReason {
    /// A normalized path escapes the sandbox input root.
    PathTraversal,
    /// The batch exceeds the maximum file count.
    TooManyFiles,
    /// A single file or the batch as a whole exceeds the byte limits.
    PayloadTooLarge,
}

/// RFC 7807-style problem document returned on pre-stream failures.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SquallError {
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("upload rejected: {message}")]
    UploadRejected {
        reason: UploadRejectReason,
        message: String,
    },

    #[error("sandbox provisioning failed: {message}")]
    ProvisionFailed { message: String },

    #[error("agent process failed: {message}")]
    AgentProcessFailed {
        /// Terminal classification forwarded from the agent process, when
        /// it reported one.
        subtype: Option<String>,
        message: String,
    },

    #[error("session timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("malformed event stream: {message}")]
    StreamFraming { message: String },

    #[error("client disconnected")]
    ClientDisconnected,
}

impl SquallError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            SquallError::ConfigInvalid { .. } => ErrorType::ConfigInvalid,
            SquallError::UploadRejected { .. } => ErrorType::UploadRejected,
            SquallError::ProvisionFailed { .. } => ErrorType::ProvisionFailed,
            SquallError::AgentProcessFailed { .. } => ErrorType::AgentProcessFailed,
            SquallError::Timeout { .. } => ErrorType::Timeout,
            SquallError::StreamFraming { .. } => ErrorType::StreamFraming,
            SquallError::ClientDisconnected => ErrorType::ClientDisconnected,
        }
    }

    /// HTTP status used when the failure happens before streaming begins.
    pub fn status(&self) -> u16 {
        match self {
            SquallError::ConfigInvalid { .. } => 400,
            SquallError::UploadRejected { reason, .. } => match reason {
                UploadRejectReason::PathTraversal => 400,
                UploadRejectReason::TooManyFiles => 400,
                UploadRejectReason::PayloadTooLarge => 413,
            },
            SquallError::ProvisionFailed { .. } => 502,
            SquallError::AgentProcessFailed { .. } => 500,
            SquallError::Timeout { .. } => 504,
            SquallError::StreamFraming { .. } => 502,
            SquallError::ClientDisconnected => 500,
        }
    }

    fn title(&self) -> &'static str {
        match self.error_type() {
            ErrorType::ConfigInvalid => "Invalid configuration",
            ErrorType::UploadRejected => "Upload rejected",
            ErrorType::ProvisionFailed => "Sandbox provisioning failed",
            ErrorType::AgentProcessFailed => "Agent process failed",
            ErrorType::Timeout => "Session timed out",
            ErrorType::StreamFraming => "Malformed event stream",
            ErrorType::ClientDisconnected => "Client disconnected",
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        ProblemDetails {
            error_type: self.error_type(),
            title: self.title().to_string(),
            status: self.status(),
            detail: self.to_string(),
            request_id: None,
        }
    }
}
