//! Session orchestration.
//!
//! One `POST /query` request is one session: provision a sandbox, write
//! the inputs, start the agent, bridge its events to the caller, tear
//! the sandbox down. The whole pipeline races against the session
//! deadline and the caller's connection; whichever way it ends, teardown
//! runs exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use squall_error::SquallError;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bridge::{pump_events, BridgeEvent, PumpEnd, EVENT_QUEUE_CAPACITY};
use crate::config::EffectiveConfig;
use crate::credentials::ResolvedCredentials;
use crate::events::{AgentEvent, ResultClass};
use crate::provider::{ProviderError, SandboxProvider, StreamingCommand};
use crate::sandbox::{SandboxSession, SandboxTemplates};
use crate::uploads::ValidatedUpload;

/// Idle interval after which a synthetic keep-alive is emitted so
/// intermediaries do not cut the connection during long agent turns.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Extra provider-side sandbox lifetime beyond the session deadline.
/// If teardown never runs (host crash), the provider reaps the sandbox
/// itself after this margin.
const SANDBOX_LIFETIME_MARGIN: Duration = Duration::from_secs(60);

/// Budget for delivering the final error event to a slow consumer
/// before the stream is abandoned.
const FINAL_EVENT_GRACE: Duration = Duration::from_secs(5);

/// Everything a session needs, validated up front by the HTTP layer.
#[derive(Debug)]
pub struct SessionInputs {
    pub config: EffectiveConfig,
    pub credentials: ResolvedCredentials,
    pub uploads: Vec<ValidatedUpload>,
    pub skills: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Runs sessions against one sandbox provider.
#[derive(Debug, Clone)]
pub struct SessionOrchestrator {
    provider: Arc<dyn SandboxProvider>,
    templates: SandboxTemplates,
}

impl SessionOrchestrator {
    pub fn new(provider: Arc<dyn SandboxProvider>, templates: SandboxTemplates) -> Self {
        Self {
            provider,
            templates,
        }
    }

    /// Start a session and return its NDJSON line stream.
    ///
    /// The session runs in its own task; dropping the returned stream is
    /// how the caller's disconnect reaches it.
    pub fn start(
        &self,
        inputs: SessionInputs,
        request_id: String,
    ) -> impl Stream<Item = Result<String, std::convert::Infallible>> + Send + 'static {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let provider = self.provider.clone();
        let templates = self.templates.clone();
        tokio::spawn(async move {
            run_session(provider, templates, inputs, request_id, events_tx).await;
        });
        event_stream(events_rx)
    }
}

/// Turn the event queue into NDJSON lines, inserting keep-alives while
/// the queue is idle. The stream ends after the first terminal event.
fn event_stream(
    events_rx: mpsc::Receiver<BridgeEvent>,
) -> impl Stream<Item = Result<String, std::convert::Infallible>> + Send + 'static {
    futures::stream::unfold(Some(events_rx), |state| async move {
        let mut rx = state?;
        tokio::select! {
            event = rx.recv() => {
                let event = event?;
                let line = format!("{}\n", event.to_line());
                let next = if event.is_terminal() { None } else { Some(rx) };
                Some((Ok(line), next))
            }
            _ = tokio::time::sleep(KEEP_ALIVE_INTERVAL) => {
                let line = format!("{}\n", AgentEvent::keep_alive().to_line());
                Some((Ok(line), Some(rx)))
            }
        }
    })
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// The agent emitted a terminal event that was forwarded.
    Completed(Option<ResultClass>),
    /// The session failed; the error still owes the caller a final
    /// error event.
    Failed(SquallError),
    TimedOut(u64),
    Disconnected,
}

async fn run_session(
    provider: Arc<dyn SandboxProvider>,
    templates: SandboxTemplates,
    inputs: SessionInputs,
    request_id: String,
    events: mpsc::Sender<BridgeEvent>,
) {
    let deadline = Instant::now() + inputs.timeout;
    let timeout_secs = inputs.timeout.as_secs();
    let mut session: Option<SandboxSession> = None;

    // Completion outranks a simultaneous disconnect or deadline.
    let end = tokio::select! {
        biased;
        end = drive(provider, &templates, &inputs, &request_id, &events, &mut session) => end,
        _ = tokio::time::sleep_until(deadline) => SessionEnd::TimedOut(timeout_secs),
        _ = events.closed() => SessionEnd::Disconnected,
    };

    // Every exit path converges here before anything is reported.
    if let Some(mut session) = session.take() {
        session.teardown().await;
    }

    match end {
        SessionEnd::Completed(class) => match class {
            Some(ResultClass::Success) | None => {
                tracing::info!(%request_id, "session completed");
            }
            Some(ResultClass::Failure { subtype }) => {
                tracing::warn!(%request_id, %subtype, "session completed with agent error");
            }
        },
        SessionEnd::Failed(err) => {
            tracing::warn!(%request_id, error = %err, "session failed");
            send_final_error(&events, &err, &request_id).await;
        }
        SessionEnd::TimedOut(seconds) => {
            tracing::warn!(%request_id, seconds, "session timed out");
            let err = SquallError::Timeout { seconds };
            send_final_error(&events, &err, &request_id).await;
        }
        SessionEnd::Disconnected => {
            tracing::info!(%request_id, "client disconnected, session abandoned");
        }
    }
}

/// The happy-path pipeline. Runs inside the deadline/disconnect race;
/// the provisioned sandbox is parked in `slot` so the caller can tear
/// it down even when this future is cancelled mid-step.
async fn drive(
    provider: Arc<dyn SandboxProvider>,
    templates: &SandboxTemplates,
    inputs: &SessionInputs,
    request_id: &str,
    events: &mpsc::Sender<BridgeEvent>,
    slot: &mut Option<SandboxSession>,
) -> SessionEnd {
    let provisioned = SandboxSession::provision(
        provider,
        templates,
        inputs.timeout + SANDBOX_LIFETIME_MARGIN,
        inputs.credentials.envs.clone(),
        request_id,
    )
    .await;
    let session = match provisioned {
        Ok(session) => slot.insert(session),
        Err(err) => return SessionEnd::Failed(err),
    };

    if let Err(err) = session.write_inputs(&inputs.uploads, &inputs.skills).await {
        return SessionEnd::Failed(err);
    }

    let StreamingCommand { output, exit } =
        match session.start_agent(&inputs.config, &inputs.credentials).await {
            Ok(running) => running,
            Err(err) => return SessionEnd::Failed(err),
        };

    match pump_events(output, events.clone()).await {
        PumpEnd::Terminal(event) => {
            // The runner exits on its own after a terminal event; the
            // reader task must not outlive the session either way.
            exit.abort();
            SessionEnd::Completed(event.result_class())
        }
        PumpEnd::Eof => {
            // Output closed without a terminal event: the exit status is
            // the only signal left.
            let err = match exit.await {
                Ok(Ok(0)) => SquallError::AgentProcessFailed {
                    subtype: None,
                    message: "agent exited without a result event".to_string(),
                },
                Ok(Ok(code)) => SquallError::AgentProcessFailed {
                    subtype: None,
                    message: format!("agent exited with status {code}"),
                },
                Ok(Err(ProviderError::CommandTimeout { seconds })) => {
                    SquallError::Timeout { seconds }
                }
                Ok(Err(err)) => SquallError::AgentProcessFailed {
                    subtype: None,
                    message: err.to_string(),
                },
                Err(err) => SquallError::AgentProcessFailed {
                    subtype: None,
                    message: format!("agent output task failed: {err}"),
                },
            };
            SessionEnd::Failed(err)
        }
        PumpEnd::Framing(err) => {
            exit.abort();
            SessionEnd::Failed(err)
        }
        PumpEnd::Closed => {
            exit.abort();
            SessionEnd::Disconnected
        }
    }
}

/// Deliver the final error event, bounded so a stalled consumer cannot
/// pin the session task.
async fn send_final_error(events: &mpsc::Sender<BridgeEvent>, err: &SquallError, request_id: &str) {
    let event = BridgeEvent::Synthetic(AgentEvent::error(err, request_id));
    let _ = tokio::time::timeout(FINAL_EVENT_GRACE, events.send(event)).await;
}
