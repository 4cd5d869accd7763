//! Command line entry point for the squall server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use crate::config::load_project_config;
use crate::provider::{HttpSandboxProvider, MockOutput, MockSandboxProvider, SandboxProvider};
use crate::router::{build_router, AppState};
use crate::sandbox::SandboxTemplates;
use crate::session::SessionOrchestrator;
use crate::telemetry::init_telemetry;

#[derive(Debug, Parser)]
#[command(name = "squall", version, about = "Run coding agents in ephemeral sandboxes")]
pub struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Path to the project configuration document.
    #[arg(long, default_value = "squall.json")]
    pub config: PathBuf,

    /// Base URL of the sandbox provider API.
    #[arg(long, env = "SQUALL_SANDBOX_API_URL", default_value = "https://api.e2b.dev")]
    pub sandbox_api_url: String,

    /// API key for the sandbox provider.
    #[arg(long, env = "SQUALL_SANDBOX_API_KEY", default_value = "")]
    pub sandbox_api_key: String,

    /// Serve scripted sessions from an in-process mock provider instead
    /// of a real sandbox API. For local development of clients.
    #[arg(long)]
    pub mock: bool,
}

pub fn run_squall() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_telemetry();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cli))
}

async fn serve(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let provider: Arc<dyn SandboxProvider> = if cli.mock {
        tracing::warn!("running with the mock sandbox provider, sessions are scripted");
        Arc::new(mock_provider())
    } else {
        if cli.sandbox_api_key.is_empty() {
            return Err("sandbox API key is required: pass --sandbox-api-key \
                        or set SQUALL_SANDBOX_API_KEY"
                .into());
        }
        Arc::new(HttpSandboxProvider::new(
            cli.sandbox_api_url,
            cli.sandbox_api_key,
        ))
    };

    let project_config = load_project_config(&cli.config);
    if project_config.is_some() {
        tracing::info!(path = %cli.config.display(), "loaded project configuration");
    }
    let config_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let orchestrator = SessionOrchestrator::new(provider, SandboxTemplates::default());
    let router = build_router(AppState::new(orchestrator, project_config, config_dir));

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "squall listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn mock_provider() -> MockSandboxProvider {
    use std::time::Duration;
    MockSandboxProvider::with_script(vec![
        MockOutput::StdoutLine(r#"{"type":"system","subtype":"init"}"#.to_string()),
        MockOutput::Delay(Duration::from_millis(200)),
        MockOutput::StdoutLine(r#"{"type":"assistant"}"#.to_string()),
        MockOutput::Delay(Duration::from_millis(200)),
        MockOutput::StdoutLine(
            r#"{"type":"result","subtype":"success","is_error":false,"num_turns":1,"total_cost_usd":0.01}"#
                .to_string(),
        ),
    ])
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown signal received");
    }
}
