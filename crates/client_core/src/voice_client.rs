use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use serde_json::json;
use shared::{
    domain::{GuildId, UserId, VoiceServer},
    error::WireError,
    protocol::{
        InboundFrame, OutboundFrame, SelectProtocol, SelectProtocolData, SessionDescription,
        Speaking, VoiceHello, VoiceIdentify, VoiceOpcode, VoiceReady,
    },
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::{
    error::{SessionError, VoiceError},
    session::{ConnectHook, Session, SessionConfig, SessionEvent},
    voice_stream::{PlaybackState, StreamObserver, VoiceStream, ENCRYPTION_MODE},
};

/// Speaking flags sent while audio is flowing (microphone | priority).
const SPEAKING_ACTIVE: u8 = 5;

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub protocol_version: u8,
    pub event_capacity: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            protocol_version: 4,
            event_capacity: 32,
        }
    }
}

/// Everything the gateway learned that a voice connection needs.
#[derive(Debug, Clone)]
pub struct VoiceConnectInfo {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub session_id: String,
    pub server: VoiceServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicePhase {
    Connecting,
    Identifying,
    AwaitingReady,
    NegotiatingProtocol,
    AwaitingSessionDescription,
    Ready,
    Playing,
    Idle,
    Closed,
}

impl VoicePhase {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Playing | Self::Idle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Ready,
    Playing,
    Finished,
    Stopped,
    Error(String),
}

/// Builds the voice websocket URL; endpoints that already carry a scheme are
/// used as is.
pub fn voice_url(endpoint: &str, version: u8) -> String {
    let base = if endpoint.contains("://") {
        endpoint.trim_end_matches('/').to_owned()
    } else {
        format!("wss://{}", endpoint.trim_end_matches('/'))
    };
    format!("{base}/?v={version}")
}

struct SpeakingObserver {
    states: mpsc::Sender<PlaybackState>,
}

impl StreamObserver for SpeakingObserver {
    fn playback_changed(&self, state: PlaybackState) {
        if let Err(err) = self.states.try_send(state) {
            warn!(error = %err, "voice: dropped playback state change");
        }
    }
}

pub struct VoiceClient {
    guild_id: GuildId,
    session: Session,
    phase: watch::Sender<VoicePhase>,
    events: broadcast::Sender<VoiceEvent>,
    stream: OnceLock<Arc<VoiceStream>>,
    closed: AtomicBool,
    finished: watch::Receiver<bool>,
}

impl VoiceClient {
    /// Opens the voice websocket and identifies. Negotiation continues in the
    /// background; use [`VoiceClient::wait_ready`] or the event stream.
    pub async fn connect(
        info: VoiceConnectInfo,
        config: VoiceConfig,
    ) -> Result<Arc<Self>, VoiceError> {
        let endpoint = info
            .server
            .endpoint
            .as_deref()
            .ok_or(VoiceError::MissingEndpoint)?;
        let url = voice_url(endpoint, config.protocol_version);

        let identify = OutboundFrame::new(
            VoiceOpcode::Identify.code(),
            &VoiceIdentify {
                server_id: info.guild_id.clone(),
                user_id: info.user_id.clone(),
                session_id: info.session_id.clone(),
                token: info.server.token.clone(),
            },
        )
        .map_err(|source| SessionError::Encode {
            op: VoiceOpcode::Identify.code(),
            source,
        })?;

        let (phase, _) = watch::channel(VoicePhase::Connecting);
        let identifying = phase.clone();
        let on_connect: ConnectHook = Arc::new(move || {
            identifying.send_replace(VoicePhase::Identifying);
            Some(identify.clone())
        });

        let session_config = SessionConfig {
            auto_reconnect: false,
            ..SessionConfig::new(format!("voice:{}", info.guild_id), url)
        };
        let (session, inbound) = Session::open(session_config, Some(on_connect)).await?;
        phase.send_replace(VoicePhase::AwaitingReady);
        info!(guild_id = %info.guild_id, "voice: identified");

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (finished_tx, finished_rx) = watch::channel(false);
        let (states_tx, states_rx) = mpsc::channel(16);
        let client = Arc::new(Self {
            guild_id: info.guild_id,
            session,
            phase,
            events,
            stream: OnceLock::new(),
            closed: AtomicBool::new(false),
            finished: finished_rx,
        });

        tokio::spawn(Arc::clone(&client).dispatch(inbound, states_tx, finished_tx));
        tokio::spawn(Arc::clone(&client).speaking(states_rx));
        Ok(client)
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub fn phase(&self) -> VoicePhase {
        *self.phase.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.phase().is_ready()
    }

    pub fn is_playing(&self) -> bool {
        self.stream
            .get()
            .map(|stream| stream.is_playing())
            .unwrap_or(false)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Frame sink for an audio pipeline. `None` until protocol negotiation
    /// has bound the UDP channel.
    pub fn sink(&self) -> Option<Arc<VoiceStream>> {
        self.stream.get().cloned()
    }

    /// Resolves once the secret key is installed. `None` waits indefinitely.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<(), VoiceError> {
        let mut phase = self.phase.subscribe();
        let wait = async move {
            let reached = phase
                .wait_for(|phase| phase.is_ready() || *phase == VoicePhase::Closed)
                .await
                .map(|phase| phase.is_ready())
                .unwrap_or(false);
            if reached {
                Ok(())
            } else {
                Err(VoiceError::Closed)
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| VoiceError::ReadyTimeout(limit))?,
            None => wait.await,
        }
    }

    /// Tears down the UDP channel, then the websocket. Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(guild_id = %self.guild_id, "voice: closing");
            if let Some(stream) = self.stream.get() {
                stream.shutdown();
            }
        }
        self.session.close().await;
        self.phase.send_replace(VoicePhase::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.phase() == VoicePhase::Closed
    }

    /// Resolves once the dispatch task has exited.
    pub async fn closed(&self) {
        let mut finished = self.finished.clone();
        let _ = finished.wait_for(|finished| *finished).await;
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }

    async fn dispatch(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<SessionEvent>,
        states: mpsc::Sender<PlaybackState>,
        finished: watch::Sender<bool>,
    ) {
        let nonce: u64 = rand::random();
        while let Some(event) = inbound.recv().await {
            match event {
                SessionEvent::Message(frame) => {
                    if let Err(err) = self.handle(frame, nonce, &states).await {
                        error!(guild_id = %self.guild_id, error = %err, "voice: protocol error");
                        self.emit(VoiceEvent::Error(err.to_string()));
                        self.close().await;
                    }
                }
                // Voice connections are never resumed; any session error ends them.
                SessionEvent::Error { reason, .. } | SessionEvent::Malformed(reason) => {
                    error!(guild_id = %self.guild_id, reason = %reason, "voice: session error");
                    self.emit(VoiceEvent::Error(reason));
                    self.close().await;
                }
                SessionEvent::Reconnected => {
                    debug!(guild_id = %self.guild_id, "voice: session reconnected");
                }
                SessionEvent::Closed => break,
            }
        }

        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(stream) = self.stream.get() {
                stream.shutdown();
            }
        }
        self.phase.send_replace(VoicePhase::Closed);
        finished.send_replace(true);
        debug!(guild_id = %self.guild_id, "voice: dispatch exited");
    }

    async fn handle(
        &self,
        frame: InboundFrame,
        nonce: u64,
        states: &mpsc::Sender<PlaybackState>,
    ) -> Result<(), VoiceError> {
        let op = match VoiceOpcode::try_from(frame.op) {
            Ok(op) => op,
            Err(op) => {
                debug!(guild_id = %self.guild_id, op, "voice: ignoring unknown opcode");
                return Ok(());
            }
        };

        match op {
            VoiceOpcode::Hello => {
                let hello: VoiceHello = frame.decode()?;
                match Duration::try_from_secs_f64(hello.heartbeat_interval / 1000.0) {
                    Ok(interval) => {
                        self.session
                            .start_heartbeat(interval, VoiceOpcode::Heartbeat.code(), move || {
                                json!(nonce)
                            })
                            .await;
                    }
                    Err(err) => {
                        warn!(guild_id = %self.guild_id, error = %err, "voice: invalid heartbeat interval");
                    }
                }
            }
            VoiceOpcode::Ready => {
                let ready: VoiceReady = frame.decode()?;
                self.negotiate(ready, states).await?;
            }
            VoiceOpcode::SessionDescription => {
                let mut description: SessionDescription = frame.decode()?;
                let installed = match self.stream.get() {
                    Some(stream) => stream.install_key(&description.secret_key),
                    None => Err(VoiceError::NotInitialized),
                };
                description.secret_key.zeroize();
                installed?;
                self.phase.send_replace(VoicePhase::Ready);
                info!(guild_id = %self.guild_id, mode = %description.mode, "voice: ready");
                self.emit(VoiceEvent::Ready);
            }
            VoiceOpcode::HeartbeatAck => {
                debug!(guild_id = %self.guild_id, "voice: heartbeat ack");
            }
            other => {
                debug!(guild_id = %self.guild_id, op = ?other, "voice: ignoring message");
            }
        }
        Ok(())
    }

    async fn negotiate(
        &self,
        ready: VoiceReady,
        states: &mpsc::Sender<PlaybackState>,
    ) -> Result<(), VoiceError> {
        self.phase.send_replace(VoicePhase::NegotiatingProtocol);
        if !ready.modes.iter().any(|mode| mode == ENCRYPTION_MODE) {
            return Err(VoiceError::UnsupportedMode {
                offered: ready.modes,
            });
        }
        if self.stream.get().is_some() {
            warn!(guild_id = %self.guild_id, "voice: duplicate ready ignored");
            return Ok(());
        }

        let ip: IpAddr = ready
            .ip
            .parse()
            .map_err(|_| WireError::Address(format!("{:?} is not an IP address", ready.ip)))?;
        let observer = Arc::new(SpeakingObserver {
            states: states.clone(),
        });
        let stream = VoiceStream::connect(SocketAddr::new(ip, ready.port), ready.ssrc, observer).await?;
        let external = stream.external_address().clone();
        if self.stream.set(stream).is_err() {
            warn!(guild_id = %self.guild_id, "voice: stream already bound");
        }

        self.session
            .send(
                VoiceOpcode::SelectProtocol.code(),
                &SelectProtocol {
                    protocol: "udp".into(),
                    data: SelectProtocolData {
                        address: external.ip.to_string(),
                        port: external.port,
                        mode: ENCRYPTION_MODE.into(),
                    },
                },
            )
            .await?;
        self.phase.send_replace(VoicePhase::AwaitingSessionDescription);
        info!(
            guild_id = %self.guild_id,
            ssrc = ready.ssrc,
            address = %external.ip,
            port = external.port,
            "voice: protocol selected"
        );
        Ok(())
    }

    /// Mirrors stream playing-state transitions into speaking messages and
    /// public events.
    async fn speaking(self: Arc<Self>, mut states: mpsc::Receiver<PlaybackState>) {
        let mut phase = self.phase.subscribe();
        let mut speaking = false;
        loop {
            let state = tokio::select! {
                biased;
                _ = wait_closed(&mut phase) => break,
                state = states.recv() => match state {
                    Some(state) => state,
                    None => break,
                },
            };

            let now_speaking = state == PlaybackState::Playing;
            let event = match state {
                PlaybackState::Playing => VoiceEvent::Playing,
                PlaybackState::Finished => VoiceEvent::Finished,
                PlaybackState::Stopped => VoiceEvent::Stopped,
                PlaybackState::Failed(reason) => VoiceEvent::Error(reason),
            };
            if !self.is_closed() {
                self.phase.send_replace(if now_speaking {
                    VoicePhase::Playing
                } else {
                    VoicePhase::Idle
                });
            }
            if now_speaking != speaking {
                speaking = now_speaking;
                self.send_speaking(speaking).await;
            }
            self.emit(event);
        }
        debug!(guild_id = %self.guild_id, "voice: speaking task exited");
    }

    async fn send_speaking(&self, speaking: bool) {
        let Some(stream) = self.stream.get() else {
            return;
        };
        let payload = Speaking {
            speaking: if speaking { SPEAKING_ACTIVE } else { 0 },
            delay: 0,
            ssrc: stream.ssrc(),
        };
        if let Err(err) = self
            .session
            .send(VoiceOpcode::Speaking.code(), &payload)
            .await
        {
            warn!(guild_id = %self.guild_id, error = %err, "voice: failed to send speaking");
        }
    }
}

async fn wait_closed(phase: &mut watch::Receiver<VoicePhase>) {
    let _ = phase.wait_for(|phase| *phase == VoicePhase::Closed).await;
}

#[cfg(test)]
#[path = "tests/voice_client_tests.rs"]
mod tests;
