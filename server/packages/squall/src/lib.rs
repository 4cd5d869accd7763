//! Squall: run coding agents in ephemeral sandboxes over HTTP.
//!
//! One `POST /query` provisions a sandbox, executes the agent against
//! the caller's prompt and files, streams agent events back as NDJSON,
//! and destroys the sandbox when the session ends.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod events;
pub mod provider;
pub mod router;
pub mod sandbox;
pub mod session;
pub mod telemetry;
pub mod uploads;
