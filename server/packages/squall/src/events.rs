//! Agent event protocol.
//!
//! The agent process emits one JSON record per line on stdout. Each line
//! is parsed into an [`AgentEvent`] keyed by its `type` discriminator;
//! kinds we do not recognize are captured in [`AgentEvent::Unknown`] and
//! forwarded unchanged rather than dropped, so future agent SDK event
//! kinds pass through transparently.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use squall_error::{ErrorType, SquallError};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// One event on the session stream.
///
/// Agent-emitted events are forwarded to the caller as the raw line the
/// process printed; this parsed form only drives control decisions
/// (terminal detection, outcome classification). Synthetic events
/// (`error`, `stderr`, `keep_alive`) are produced by the server itself
/// and serialized from this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Emitted once when the agent initializes (`subtype: "init"`).
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
    },
    /// An assistant message turn.
    Assistant,
    /// Tool results fed back to the agent.
    User,
    /// Terminal event: the agent finished, successfully or not.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_turns: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
    },
    /// Terminal error, emitted by the server when a session fails after
    /// streaming has begun.
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<ErrorType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// A line the agent process wrote to its error channel.
    Stderr { data: String },
    /// Synthetic heartbeat keeping idle connections open through
    /// intermediaries.
    KeepAlive { time: String },
    /// Any event kind this server does not recognize.
    #[serde(untagged)]
    Unknown(Value),
}

/// How a terminal `result` event classifies the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultClass {
    Success,
    Failure { subtype: String },
}

impl AgentEvent {
    /// Terminal events end the stream: a `result` of any subtype, or an
    /// `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Result { .. } | AgentEvent::Error { .. })
    }

    /// Classification of a `result` event, `None` for everything else.
    pub fn result_class(&self) -> Option<ResultClass> {
        let AgentEvent::Result {
            subtype, is_error, ..
        } = self
        else {
            return None;
        };
        let subtype = subtype.as_deref().unwrap_or("unknown");
        if subtype == "success" && !is_error.unwrap_or(false) {
            return Some(ResultClass::Success);
        }
        // Unrecognized subtypes are still terminal, but never a success.
        Some(ResultClass::Failure {
            subtype: subtype.to_string(),
        })
    }

    pub fn keep_alive() -> Self {
        AgentEvent::KeepAlive {
            time: rfc3339_now(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        AgentEvent::Stderr { data: data.into() }
    }

    pub fn error(err: &SquallError, request_id: &str) -> Self {
        AgentEvent::Error {
            error: err.to_string(),
            error_type: Some(err.error_type()),
            request_id: Some(request_id.to_string()),
        }
    }

    pub fn to_line(&self) -> String {
        // Serialization of our own event types cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Parse one stdout line as an agent event.
///
/// A line that is not a JSON object is a stream framing error: the agent
/// contract is one JSON record per line, and silently dropping garbage
/// would hide protocol breakage from the caller.
pub fn parse_event_line(line: &str) -> Result<AgentEvent, SquallError> {
    let value: Value = serde_json::from_str(line).map_err(|err| SquallError::StreamFraming {
        message: format!("agent emitted a non-JSON line: {err}"),
    })?;
    if !value.is_object() {
        return Err(SquallError::StreamFraming {
            message: "agent emitted a JSON value that is not an object".to_string(),
        });
    }
    // Unknown kinds land in AgentEvent::Unknown, so this cannot fail for
    // an object.
    Ok(match serde_json::from_value(value.clone()) {
        Ok(event) => event,
        Err(_) => AgentEvent::Unknown(value),
    })
}

/// Current time as an RFC 3339 timestamp.
pub fn rfc3339_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
