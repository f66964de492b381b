//! claw-chat - chat gateway client
//!
//! Connects a bot account to the chat gateway and logs the events it
//! receives until interrupted.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use claw_chat_gateway::{GatewayConfig, GatewayConnection, GatewayError, GatewayEvent};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "claw-chat")]
#[command(about = "Chat gateway client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the gateway and log events
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-chat/config.json")]
        config: PathBuf,

        /// Bot token, overrides the config file
        #[arg(long, env = "CLAW_CHAT_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/claw-chat/config.json")]
        output: PathBuf,

        /// Gateway host
        #[arg(long)]
        host: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("claw_chat_gateway=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, token } => run(config, token).await?,
        Commands::InitConfig { output, host } => init_config(output, host)?,
    }

    Ok(())
}

async fn run(config_path: PathBuf, token: Option<String>) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting claw-chat");

    let config = GatewayConfig::load_with_token(&config_path, token)?;

    if !config.enabled {
        info!("gateway disabled in config, exiting");
        return Ok(());
    }
    info!(host = %config.host, intents = config.intents.bits(), "loaded config");

    let (gateway, mut events) = GatewayConnection::websocket(config);
    if let Err(e) = gateway.connect().await {
        // Recovery continues in the background unless the failure is terminal.
        warn!(error = %e, "initial connect failed");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                gateway.disconnect();
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if !log_event(&event) {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Log an event. Returns `false` once the connection has given up.
fn log_event(event: &GatewayEvent) -> bool {
    match event {
        GatewayEvent::Ready(ready) => info!(session_id = %ready.session_id, "ready"),
        GatewayEvent::Resumed => info!("session resumed"),
        GatewayEvent::Message(message) => info!(
            id = message.id().unwrap_or_default(),
            seq = ?message.sequence,
            content = message.content().unwrap_or_default(),
            "message"
        ),
        GatewayEvent::Disconnected {
            reason,
            will_reconnect,
        } => warn!(reason = %reason, will_reconnect, "disconnected"),
        GatewayEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay = ?delay, "reconnect scheduled");
        }
        GatewayEvent::Error(e @ GatewayError::ReconnectExhausted { .. }) => {
            error!(error = %e, "giving up");
            return false;
        }
        GatewayEvent::Error(e) => error!(error = %e, "gateway error"),
    }
    true
}

fn init_config(output: PathBuf, host: String) -> anyhow::Result<()> {
    let config = GatewayConfig::new("YOUR_BOT_TOKEN", host);
    let json = serde_json::to_string_pretty(&config)?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output, json)?;
    println!("Config written to {}", output.display());

    Ok(())
}
