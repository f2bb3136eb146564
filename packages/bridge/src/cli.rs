use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use acp_bridge_error::BridgeError;

use crate::agent_process::AgentLaunchSpec;
use crate::connection::{AcpConnection, Bridge};
use crate::history::HistoryStore;
use crate::settings::SettingsStore;

#[derive(Parser, Debug)]
#[command(name = "acp-bridge", bin_name = "acp-bridge")]
#[command(about = "ACP bridge for line-protocol coding agents", version)]
pub struct AcpBridgeCli {
    /// Agent program spawned per session.
    #[arg(long, default_value = "claude")]
    pub agent: PathBuf,

    /// Extra argument appended to the agent command line (repeatable).
    #[arg(long = "agent-arg")]
    pub agent_args: Vec<String>,

    /// Permission settings file consulted before prompting the user.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Directory holding session transcripts.
    #[arg(long = "state-dir")]
    pub state_dir: Option<PathBuf>,
}

pub fn run_bridge() -> Result<(), BridgeError> {
    let cli = AcpBridgeCli::parse();
    init_logging();

    let runtime = tokio::runtime::Runtime::new().map_err(|err| BridgeError::StreamError {
        message: format!("failed to start async runtime: {err}"),
    })?;
    runtime.block_on(run_async(cli))
}

// Logs go to stderr: stdout carries the client protocol.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
    ]
}

async fn run_async(cli: AcpBridgeCli) -> Result<(), BridgeError> {
    let settings = match &cli.settings {
        Some(path) => SettingsStore::load(path)?,
        None => SettingsStore::empty(),
    };
    let history = HistoryStore::new(
        cli.state_dir
            .clone()
            .unwrap_or_else(HistoryStore::default_root),
    )?;

    let mut args = default_agent_args();
    args.extend(cli.agent_args.clone());
    let launch = AgentLaunchSpec {
        program: cli.agent.clone(),
        args,
        env: Vec::new(),
        cwd: None,
    };

    let bridge = Bridge::new(
        AcpConnection::stdio(),
        launch,
        Arc::new(settings),
        Arc::new(history),
    );

    tracing::info!("acp-bridge listening on stdio");
    tokio::select! {
        result = bridge.run_stdio() => result,
        _ = tokio::signal::ctrl_c() => {
            bridge.shutdown().await;
            Ok(())
        }
    }
}
