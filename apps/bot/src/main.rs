use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{GatewayClient, GatewayEvent};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod players;
mod resolver;
mod rest;

use commands::Bot;
use config::load_settings;
use resolver::YtDlpResolver;
use rest::RestClient;

#[derive(Parser, Debug)]
struct Cli {
    /// Optional TOML settings file; environment variables override it.
    #[arg(long, default_value = "bot.toml")]
    config: PathBuf,
    /// Log filter, e.g. `info,client_core=debug`. `RUST_LOG` takes precedence.
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli.config)?;

    let filter = cli.log.as_deref().unwrap_or(&settings.log_filter);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
    settings.validate()?;

    let rest = RestClient::new(settings.api_base.clone(), &settings.token);
    let resolver = Arc::new(YtDlpResolver::new(settings.ytdlp_path.clone()));
    let (gateway, commands) = GatewayClient::connect(settings.gateway_config())
        .await
        .context("failed to connect to the gateway")?;
    tokio::spawn(log_gateway_events(gateway.subscribe_events()));
    info!(prefix = %settings.command_prefix, "bot started");

    let bot = Bot::new(
        Arc::clone(&gateway),
        rest,
        resolver,
        settings.transcoder_config(),
    );
    tokio::select! {
        _ = Arc::clone(&bot).run(commands) => warn!("gateway closed"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
    }

    bot.shutdown().await;
    gateway.close().await;
    Ok(())
}

async fn log_gateway_events(mut events: broadcast::Receiver<GatewayEvent>) {
    loop {
        match events.recv().await {
            Ok(GatewayEvent::Ready { user_id }) => info!(user_id = %user_id, "gateway ready"),
            Ok(GatewayEvent::GuildAvailable(guild_id)) => info!(guild_id = %guild_id, "guild available"),
            Ok(GatewayEvent::GuildRemoved(guild_id)) => info!(guild_id = %guild_id, "guild removed"),
            Ok(GatewayEvent::Reconnected) => info!("gateway reconnected"),
            Ok(GatewayEvent::Error(reason)) => warn!(reason = %reason, "gateway error"),
            Ok(GatewayEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "gateway event log lagged")
            }
        }
    }
}
