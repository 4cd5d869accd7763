//! Event bridge between the agent process and the response stream.
//!
//! The pump reassembles the provider's raw output chunks into lines,
//! parses each line as an agent event, and pushes it onto a bounded
//! queue. When the queue is full the pump suspends on `send` until the
//! consumer catches up, which stalls the provider-side read in turn.
//! Nothing is ever dropped to make room; a slow caller slows the agent
//! down instead of losing events.

use squall_error::SquallError;
use tokio::sync::mpsc;

use crate::events::{parse_event_line, AgentEvent};
use crate::provider::OutputChunk;

/// Capacity of the per-session event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// One entry on the session event queue.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// An event the agent process emitted. The raw line is forwarded to
    /// the caller verbatim; the parsed form only drives control flow.
    Agent { raw: String, event: AgentEvent },
    /// An event the server produced itself (stderr, errors,
    /// keep-alives).
    Synthetic(AgentEvent),
}

impl BridgeEvent {
    pub fn event(&self) -> &AgentEvent {
        match self {
            BridgeEvent::Agent { event, .. } => event,
            BridgeEvent::Synthetic(event) => event,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event().is_terminal()
    }

    /// The NDJSON line sent to the caller, without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            BridgeEvent::Agent { raw, .. } => raw.clone(),
            BridgeEvent::Synthetic(event) => event.to_line(),
        }
    }
}

/// Why the pump stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// A terminal event was forwarded; the stream is complete.
    Terminal(AgentEvent),
    /// The process closed its output without a terminal event.
    Eof,
    /// The agent broke the one-JSON-record-per-line contract. Terminal
    /// for the session; the offending line is not forwarded.
    Framing(SquallError),
    /// The queue's receiving side went away.
    Closed,
}

/// Pump agent output into the event queue until the stream ends.
///
/// Stdout is parsed line by line; chunks are not assumed to be
/// line-aligned. Stderr chunks become synthetic `stderr` events on the
/// same queue, so interleaving with stdout is preserved as observed.
pub async fn pump_events(
    mut output: mpsc::Receiver<OutputChunk>,
    queue: mpsc::Sender<BridgeEvent>,
) -> PumpEnd {
    let mut buffer = String::new();
    while let Some(chunk) = output.recv().await {
        match chunk {
            OutputChunk::Stdout(data) => {
                buffer.push_str(&data);
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    match forward_line(line.trim_end(), &queue).await {
                        LineOutcome::Forwarded => {}
                        LineOutcome::Skipped => {}
                        LineOutcome::End(end) => return end,
                    }
                }
            }
            OutputChunk::Stderr(data) => {
                // Blank stderr noise carries no signal, drop it.
                let text = data.trim();
                if text.is_empty() {
                    continue;
                }
                let event = AgentEvent::stderr(text);
                if queue.send(BridgeEvent::Synthetic(event)).await.is_err() {
                    return PumpEnd::Closed;
                }
            }
        }
    }
    // A final line without a trailing newline still counts.
    match forward_line(buffer.trim_end(), &queue).await {
        LineOutcome::End(end) => end,
        _ => PumpEnd::Eof,
    }
}

enum LineOutcome {
    Forwarded,
    Skipped,
    End(PumpEnd),
}

async fn forward_line(line: &str, queue: &mpsc::Sender<BridgeEvent>) -> LineOutcome {
    if line.is_empty() {
        return LineOutcome::Skipped;
    }
    let event = match parse_event_line(line) {
        Ok(event) => event,
        Err(err) => return LineOutcome::End(PumpEnd::Framing(err)),
    };
    let terminal = event.is_terminal();
    let bridged = BridgeEvent::Agent {
        raw: line.to_string(),
        event: event.clone(),
    };
    if queue.send(bridged).await.is_err() {
        return LineOutcome::End(PumpEnd::Closed);
    }
    if terminal {
        return LineOutcome::End(PumpEnd::Terminal(event));
    }
    LineOutcome::Forwarded
}
