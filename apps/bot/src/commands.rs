use std::sync::Arc;

use anyhow::Context;
use client_core::{Command, GatewayClient};
use playback::{AudioPipeline, PlaybackOutcome, TranscoderConfig};
use shared::domain::{GuildId, Message};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{players::Players, resolver::SourceResolver, rest::RestClient};

/// Runs chat commands against the gateway; one playback per guild.
pub struct Bot {
    gateway: Arc<GatewayClient>,
    rest: RestClient,
    resolver: Arc<dyn SourceResolver>,
    transcoder: TranscoderConfig,
    players: Arc<Players>,
}

impl Bot {
    pub fn new(
        gateway: Arc<GatewayClient>,
        rest: RestClient,
        resolver: Arc<dyn SourceResolver>,
        transcoder: TranscoderConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            rest,
            resolver,
            transcoder,
            players: Arc::new(Players::default()),
        })
    }

    /// Handles commands until the gateway closes the queue.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            tokio::spawn(Arc::clone(&self).handle(command));
        }
        info!("command queue closed");
    }

    /// Stops every playback and leaves voice.
    pub async fn shutdown(&self) {
        self.players.stop_all().await;
    }

    async fn handle(self: Arc<Self>, command: Command) {
        let name = command.name().to_ascii_lowercase();
        info!(
            name = %name,
            author = %command.message.author.username,
            channel_id = %command.message.channel_id,
            "handling command"
        );
        let result = match name.as_str() {
            "ping" => self.ping(&command).await,
            "play" => self.play(&command).await,
            "stop" => self.stop(&command).await,
            "leave" => self.leave(&command).await,
            _ => {
                self.reply(&command.message, &format!("Unknown command `{}`", command.name()))
                    .await
            }
        };
        if let Err(err) = result {
            warn!(name = %name, error = %format!("{err:#}"), "command failed");
            if let Err(reply_err) = self.reply(&command.message, &format!("Failed: {err}")).await {
                warn!(error = %format!("{reply_err:#}"), "failed to report command error");
            }
        }
    }

    async fn ping(&self, command: &Command) -> anyhow::Result<()> {
        self.reply(&command.message, &format!("Pong! {}", command.rest(0)))
            .await
    }

    async fn play(self: &Arc<Self>, command: &Command) -> anyhow::Result<()> {
        let guild_id = guild_of(command)?;
        let reference = command.rest(0);
        if reference.is_empty() {
            return self
                .reply(&command.message, "Usage: `play <url or search>`")
                .await;
        }
        let _guild = self.players.lock(&guild_id).await;
        let channel_id = self
            .gateway
            .voice_state(&guild_id, &command.message.author.id)
            .await
            .and_then(|state| state.channel_id)
            .context("join a voice channel first")?;

        self.reply(&command.message, &format!("Preparing to play `{reference}`..."))
            .await?;
        let url = self.resolver.resolve(&reference).await?;
        let voice = self
            .gateway
            .join_voice(&guild_id, &channel_id)
            .await
            .context("failed to join voice channel")?;
        let sink = voice
            .sink()
            .context("voice connection has no audio stream")?;

        // The old pipeline must stop writing before the new one shares the sink.
        self.players.stop(&guild_id).await;
        let handle = AudioPipeline::new(sink)
            .play(&self.transcoder, &url)
            .context("failed to start audio stream")?;
        let outcome = self.players.start(guild_id.clone(), handle).await;
        info!(guild_id = %guild_id, reference = %reference, "playback started");

        tokio::spawn(Arc::clone(self).watch_playback(command.message.clone(), guild_id, outcome));
        self.reply(&command.message, &format!("Now playing: `{reference}`."))
            .await
    }

    async fn stop(&self, command: &Command) -> anyhow::Result<()> {
        let guild_id = guild_of(command)?;
        let _guild = self.players.lock(&guild_id).await;
        let content = if self.players.stop(&guild_id).await {
            "Stopped."
        } else {
            "Nothing is playing."
        };
        self.reply(&command.message, content).await
    }

    async fn leave(&self, command: &Command) -> anyhow::Result<()> {
        let guild_id = guild_of(command)?;
        let _guild = self.players.lock(&guild_id).await;
        self.players.stop(&guild_id).await;
        self.gateway
            .leave_voice(&guild_id)
            .await
            .context("failed to leave voice channel")?;
        self.reply(&command.message, "Bye.").await
    }

    /// Follows one playback. Stopped or replaced playbacks never report here.
    async fn watch_playback(
        self: Arc<Self>,
        origin: Message,
        guild_id: GuildId,
        outcome: oneshot::Receiver<PlaybackOutcome>,
    ) {
        let reason = match outcome.await {
            Ok(PlaybackOutcome::Finished) => {
                info!(guild_id = %guild_id, "playback finished");
                return;
            }
            Ok(PlaybackOutcome::Stopped) => {
                debug!(guild_id = %guild_id, "playback stopped");
                return;
            }
            Ok(PlaybackOutcome::Failed(reason)) => reason,
            Err(_) => {
                debug!(guild_id = %guild_id, "playback stopped or replaced");
                return;
            }
        };

        warn!(guild_id = %guild_id, reason = %reason, "playback failed");
        if let Err(err) = self
            .reply(&origin, "Something went wrong during playback")
            .await
        {
            warn!(error = %format!("{err:#}"), "failed to report playback error");
        }
        let _guild = self.players.lock(&guild_id).await;
        if self.players.is_playing(&guild_id).await {
            debug!(guild_id = %guild_id, "newer playback started, staying in voice");
            return;
        }
        if let Err(err) = self.gateway.leave_voice(&guild_id).await {
            warn!(guild_id = %guild_id, error = %err, "failed to leave after playback error");
        }
    }

    async fn reply(&self, to: &Message, content: &str) -> anyhow::Result<()> {
        self.rest.reply(to, content).await.map(|_| ())
    }
}

fn guild_of(command: &Command) -> anyhow::Result<GuildId> {
    command
        .message
        .guild_id
        .clone()
        .context("this command only works in a server")
}
