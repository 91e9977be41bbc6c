use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{json, Value};
use shared::{
    domain::{ChannelId, GuildId, Message, UserId, VoiceServer, VoiceState},
    protocol::{
        intents, DispatchKind, GatewayOpcode, GuildCreate, Hello, Identify, IdentifyProperties,
        InboundFrame, OutboundFrame, Ready, UnavailableGuild, UpdateVoiceState,
    },
};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    command::Command,
    error::{GatewayError, SessionError},
    session::{ConnectHook, Session, SessionConfig, SessionEvent},
    voice_client::{VoiceClient, VoiceConfig, VoiceConnectInfo},
};

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: u64,
    pub command_prefix: String,
    pub gateway_url: String,
    /// Reported as browser and device in the identify properties.
    pub client_name: String,
    /// Commands buffered for the consumer. A full queue stalls dispatch.
    pub command_capacity: usize,
    pub event_capacity: usize,
    pub reconnect_delay: Duration,
    /// Bounds the wait for the voice server and for voice readiness. `None`
    /// waits indefinitely.
    pub voice_join_timeout: Option<Duration>,
    pub self_deaf: bool,
    pub voice: VoiceConfig,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: intents::VOICE_BOT,
            command_prefix: ".".into(),
            gateway_url: DEFAULT_GATEWAY_URL.into(),
            client_name: "rtc-voice".into(),
            command_capacity: 25,
            event_capacity: 64,
            reconnect_delay: Duration::from_secs(5),
            voice_join_timeout: None,
            self_deaf: true,
            voice: VoiceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildState {
    pub id: GuildId,
    pub name: String,
    pub voice_states: HashMap<UserId, VoiceState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Ready { user_id: UserId },
    GuildAvailable(GuildId),
    GuildRemoved(GuildId),
    Reconnected,
    Error(String),
    Closed,
}

type VoiceSlot = Arc<Mutex<Option<Arc<VoiceClient>>>>;

struct GuildEntry {
    state: GuildState,
    /// Held for the whole join so concurrent joins for one guild collapse
    /// into a single handshake.
    voice: VoiceSlot,
}

#[derive(Default)]
struct GatewayState {
    user_id: Option<UserId>,
    guilds: HashMap<GuildId, GuildEntry>,
}

pub struct GatewayClient {
    config: GatewayConfig,
    session: Session,
    /// Last dispatch sequence; 0 until the first dispatch.
    sequence: Arc<AtomicU64>,
    state: RwLock<GatewayState>,
    pending_voice: Mutex<HashMap<GuildId, oneshot::Sender<VoiceServer>>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl GatewayClient {
    /// Connects and identifies. Prefixed chat messages arrive on the returned
    /// queue as [`Command`]s.
    pub async fn connect(
        config: GatewayConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Command>), GatewayError> {
        let identify = OutboundFrame::new(
            GatewayOpcode::Identify.code(),
            &Identify {
                token: config.token.clone(),
                intents: config.intents,
                properties: IdentifyProperties {
                    os: std::env::consts::OS.into(),
                    browser: config.client_name.clone(),
                    device: config.client_name.clone(),
                },
            },
        )
        .map_err(|source| SessionError::Encode {
            op: GatewayOpcode::Identify.code(),
            source,
        })?;
        let on_connect: ConnectHook = Arc::new(move || Some(identify.clone()));

        let session_config = SessionConfig {
            auto_reconnect: true,
            reconnect_delay: config.reconnect_delay,
            ..SessionConfig::new("gateway", config.gateway_url.clone())
        };
        info!(url = %config.gateway_url, "gateway: connecting");
        let (session, inbound) = Session::open(session_config, Some(on_connect)).await?;

        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let client = Arc::new(Self {
            config,
            session,
            sequence: Arc::new(AtomicU64::new(0)),
            state: RwLock::new(GatewayState::default()),
            pending_voice: Mutex::new(HashMap::new()),
            events,
        });
        tokio::spawn(Arc::clone(&client).dispatch(inbound, commands_tx));
        Ok((client, commands_rx))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn sequence(&self) -> Option<u64> {
        match self.sequence.load(Ordering::SeqCst) {
            0 => None,
            sequence => Some(sequence),
        }
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.state.read().await.user_id.clone()
    }

    pub async fn guild(&self, guild_id: &GuildId) -> Option<GuildState> {
        self.state
            .read()
            .await
            .guilds
            .get(guild_id)
            .map(|entry| entry.state.clone())
    }

    pub async fn guild_ids(&self) -> Vec<GuildId> {
        self.state.read().await.guilds.keys().cloned().collect()
    }

    pub async fn voice_state(&self, guild_id: &GuildId, user_id: &UserId) -> Option<VoiceState> {
        self.state
            .read()
            .await
            .guilds
            .get(guild_id)?
            .state
            .voice_states
            .get(user_id)
            .cloned()
    }

    /// The cached voice connection for a guild, if it is still open.
    pub async fn voice_client(&self, guild_id: &GuildId) -> Option<Arc<VoiceClient>> {
        let slot = self.voice_slot(guild_id).await.ok()?;
        let guard = slot.lock().await;
        guard.as_ref().filter(|client| !client.is_closed()).cloned()
    }

    /// Joins `channel_id` and returns a ready voice connection. Returns the
    /// cached connection when one is already open for the guild; concurrent
    /// callers for one guild share a single handshake.
    pub async fn join_voice(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> Result<Arc<VoiceClient>, GatewayError> {
        let slot = self.voice_slot(guild_id).await?;
        let mut slot = slot.lock().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
        }
        let user_id = self.user_id().await.ok_or(GatewayError::NotReady)?;

        let (server_tx, server_rx) = oneshot::channel();
        self.pending_voice
            .lock()
            .await
            .insert(guild_id.clone(), server_tx);
        info!(guild_id = %guild_id, channel_id = %channel_id, "gateway: joining voice");
        let request = UpdateVoiceState {
            guild_id: guild_id.clone(),
            channel_id: Some(channel_id.clone()),
            self_mute: false,
            self_deaf: self.config.self_deaf,
        };
        if let Err(err) = self
            .session
            .send(GatewayOpcode::VoiceStateUpdate.code(), &request)
            .await
        {
            self.pending_voice.lock().await.remove(guild_id);
            return Err(err.into());
        }

        let server = match self.config.voice_join_timeout {
            Some(limit) => match tokio::time::timeout(limit, server_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending_voice.lock().await.remove(guild_id);
                    return Err(GatewayError::VoiceServerTimeout {
                        guild_id: guild_id.clone(),
                        timeout: limit,
                    });
                }
            },
            None => server_rx.await,
        }
        .map_err(|_| GatewayError::JoinAbandoned(guild_id.clone()))?;

        let session_id = self.own_voice_session(guild_id, &user_id).await?;
        debug!(
            guild_id = %guild_id,
            endpoint = ?server.endpoint,
            "gateway: voice server received"
        );
        let client = VoiceClient::connect(
            VoiceConnectInfo {
                guild_id: guild_id.clone(),
                user_id,
                session_id,
                server,
            },
            self.config.voice.clone(),
        )
        .await?;

        if let Err(err) = client.wait_ready(self.config.voice_join_timeout).await {
            client.close().await;
            return Err(err.into());
        }
        info!(guild_id = %guild_id, "gateway: voice ready");
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Closes the guild's voice connection, if any, and leaves the channel.
    pub async fn leave_voice(&self, guild_id: &GuildId) -> Result<(), GatewayError> {
        let slot = self.voice_slot(guild_id).await?;
        let cached = slot.lock().await.take();
        if let Some(client) = cached {
            client.close().await;
        }
        info!(guild_id = %guild_id, "gateway: leaving voice");
        self.session
            .send(
                GatewayOpcode::VoiceStateUpdate.code(),
                &UpdateVoiceState {
                    guild_id: guild_id.clone(),
                    channel_id: None,
                    self_mute: false,
                    self_deaf: false,
                },
            )
            .await?;
        Ok(())
    }

    /// Closes every voice connection, then the gateway session.
    pub async fn close(&self) {
        let slots: Vec<VoiceSlot> = {
            let state = self.state.read().await;
            state
                .guilds
                .values()
                .map(|entry| Arc::clone(&entry.voice))
                .collect()
        };
        for slot in slots {
            let cached = slot.lock().await.take();
            if let Some(client) = cached {
                client.close().await;
            }
        }
        self.pending_voice.lock().await.clear();
        self.session.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    async fn voice_slot(&self, guild_id: &GuildId) -> Result<VoiceSlot, GatewayError> {
        self.state
            .read()
            .await
            .guilds
            .get(guild_id)
            .map(|entry| Arc::clone(&entry.voice))
            .ok_or_else(|| GatewayError::UnknownGuild(guild_id.clone()))
    }

    async fn own_voice_session(
        &self,
        guild_id: &GuildId,
        user_id: &UserId,
    ) -> Result<String, GatewayError> {
        let state = self.state.read().await;
        let guild = state
            .guilds
            .get(guild_id)
            .ok_or_else(|| GatewayError::UnknownGuild(guild_id.clone()))?;
        guild
            .state
            .voice_states
            .get(user_id)
            .map(|voice_state| voice_state.session_id.clone())
            .ok_or_else(|| GatewayError::MissingVoiceState(guild_id.clone()))
    }

    fn heartbeat_payload(sequence: &AtomicU64) -> Value {
        match sequence.load(Ordering::SeqCst) {
            0 => Value::Null,
            sequence => json!(sequence),
        }
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    async fn dispatch(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<SessionEvent>,
        commands: mpsc::Sender<Command>,
    ) {
        while let Some(event) = inbound.recv().await {
            match event {
                SessionEvent::Message(frame) => match self.handle(frame, &commands).await {
                    Ok(()) => {}
                    Err(GatewayError::Payload(err)) => {
                        self.abandon(format!("malformed payload: {err}")).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "gateway: failed to handle message");
                        self.emit(GatewayEvent::Error(err.to_string()));
                    }
                },
                SessionEvent::Malformed(reason) => self.abandon(reason).await,
                SessionEvent::Reconnected => {
                    info!("gateway: reconnected");
                    self.emit(GatewayEvent::Reconnected);
                }
                SessionEvent::Error { reason, terminal } => {
                    warn!(reason = %reason, terminal, "gateway: session error");
                    self.emit(GatewayEvent::Error(reason));
                }
                SessionEvent::Closed => break,
            }
        }
        info!("gateway: dispatch exited");
        self.emit(GatewayEvent::Closed);
    }

    /// A peer that sends garbage is not trusted with the session any longer.
    async fn abandon(&self, reason: String) {
        error!(reason = %reason, "gateway: protocol violation, closing");
        self.emit(GatewayEvent::Error(reason));
        self.session.close().await;
    }

    async fn handle(
        &self,
        frame: InboundFrame,
        commands: &mpsc::Sender<Command>,
    ) -> Result<(), GatewayError> {
        let op = match GatewayOpcode::try_from(frame.op) {
            Ok(op) => op,
            Err(op) => {
                debug!(op, "gateway: ignoring unknown opcode");
                return Ok(());
            }
        };

        match op {
            GatewayOpcode::Dispatch => {
                if let Some(sequence) = frame.s {
                    self.sequence.store(sequence, Ordering::SeqCst);
                }
                self.handle_dispatch(frame, commands).await?;
            }
            GatewayOpcode::Hello => {
                let hello: Hello = frame.decode()?;
                let sequence = Arc::clone(&self.sequence);
                self.session
                    .start_heartbeat(
                        Duration::from_millis(hello.heartbeat_interval),
                        GatewayOpcode::Heartbeat.code(),
                        move || Self::heartbeat_payload(&sequence),
                    )
                    .await;
                info!(interval_ms = hello.heartbeat_interval, "gateway: hello");
            }
            GatewayOpcode::Heartbeat => {
                self.session
                    .send(
                        GatewayOpcode::Heartbeat.code(),
                        &Self::heartbeat_payload(&self.sequence),
                    )
                    .await?;
            }
            GatewayOpcode::HeartbeatAck => debug!("gateway: heartbeat ack"),
            GatewayOpcode::InvalidSession => {
                error!("gateway: session is invalid, closing");
                self.emit(GatewayEvent::Error("invalid session".into()));
                self.session.close().await;
            }
            GatewayOpcode::Reconnect => {
                info!("gateway: reconnect requested by server");
                self.session.reconnect().await;
            }
            other => debug!(op = ?other, "gateway: ignoring opcode"),
        }
        Ok(())
    }

    async fn handle_dispatch(
        &self,
        frame: InboundFrame,
        commands: &mpsc::Sender<Command>,
    ) -> Result<(), GatewayError> {
        let Some(event) = frame.t.as_deref() else {
            debug!("gateway: dispatch without event type");
            return Ok(());
        };
        let Some(kind) = DispatchKind::parse(event) else {
            debug!(event, "gateway: unhandled event");
            return Ok(());
        };

        match kind {
            DispatchKind::Ready => {
                let ready: Ready = frame.decode()?;
                info!(
                    user_id = %ready.user.id,
                    username = %ready.user.username,
                    "gateway: logged in"
                );
                self.state.write().await.user_id = Some(ready.user.id.clone());
                self.emit(GatewayEvent::Ready {
                    user_id: ready.user.id,
                });
            }
            DispatchKind::GuildCreate => {
                let guild: GuildCreate = frame.decode()?;
                let voice_states = guild
                    .voice_states
                    .into_iter()
                    .map(|mut voice_state| {
                        voice_state.guild_id = Some(guild.id.clone());
                        (voice_state.user_id.clone(), voice_state)
                    })
                    .collect();
                let state = GuildState {
                    id: guild.id.clone(),
                    name: guild.name,
                    voice_states,
                };
                debug!(guild_id = %guild.id, name = %state.name, "gateway: guild available");
                match self.state.write().await.guilds.entry(guild.id.clone()) {
                    Entry::Occupied(mut entry) => entry.get_mut().state = state,
                    Entry::Vacant(entry) => {
                        entry.insert(GuildEntry {
                            state,
                            voice: Arc::new(Mutex::new(None)),
                        });
                    }
                }
                self.emit(GatewayEvent::GuildAvailable(guild.id));
            }
            DispatchKind::GuildDelete => {
                let gone: UnavailableGuild = frame.decode()?;
                let removed = self.state.write().await.guilds.remove(&gone.id);
                self.pending_voice.lock().await.remove(&gone.id);
                info!(guild_id = %gone.id, unavailable = gone.unavailable, "gateway: guild removed");
                if let Some(entry) = removed {
                    // A join may hold the slot; close off the dispatch task.
                    tokio::spawn(async move {
                        let cached = entry.voice.lock().await.take();
                        if let Some(client) = cached {
                            client.close().await;
                        }
                    });
                }
                self.emit(GatewayEvent::GuildRemoved(gone.id));
            }
            DispatchKind::VoiceStateUpdate => {
                let voice_state: VoiceState = frame.decode()?;
                let Some(guild_id) = voice_state.guild_id.clone() else {
                    debug!(user_id = %voice_state.user_id, "gateway: voice state without guild");
                    return Ok(());
                };
                let mut state = self.state.write().await;
                match state.guilds.get_mut(&guild_id) {
                    Some(entry) => {
                        debug!(
                            guild_id = %guild_id,
                            user_id = %voice_state.user_id,
                            channel_id = ?voice_state.channel_id,
                            "gateway: voice state updated"
                        );
                        entry
                            .state
                            .voice_states
                            .insert(voice_state.user_id.clone(), voice_state);
                    }
                    None => warn!(guild_id = %guild_id, "gateway: voice state for unknown guild"),
                }
            }
            DispatchKind::VoiceServerUpdate => {
                let server: VoiceServer = frame.decode()?;
                let pending = self.pending_voice.lock().await.remove(&server.guild_id);
                match pending {
                    Some(waiter) => {
                        let guild_id = server.guild_id.clone();
                        if waiter.send(server).is_err() {
                            debug!(guild_id = %guild_id, "gateway: voice join was abandoned");
                        }
                    }
                    None => {
                        info!(guild_id = %server.guild_id, "gateway: voice server update without a pending join");
                    }
                }
            }
            DispatchKind::MessageCreate => {
                let message: Message = frame.decode()?;
                if let Some(command) = Command::parse(message, &self.config.command_prefix) {
                    debug!(
                        name = command.name(),
                        channel_id = %command.message.channel_id,
                        "gateway: command received"
                    );
                    if commands.send(command).await.is_err() {
                        debug!("gateway: command consumer gone");
                    }
                }
            }
            DispatchKind::MessageUpdate => {}
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
