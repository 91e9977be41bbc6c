use shared::{
    domain::GuildId,
    error::{PayloadError, WireError},
};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("failed to connect websocket: {url}: {source}")]
    Connect {
        url: String,
        source: tungstenite::Error,
    },
    #[error("failed to encode frame for op {op}: {source}")]
    Encode { op: u8, source: serde_json::Error },
    #[error("websocket write failed: {0}")]
    Write(#[source] tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("voice server offered no supported encryption mode (offered {offered:?})")]
    UnsupportedMode { offered: Vec<String> },
    #[error("voice server endpoint is not known yet")]
    MissingEndpoint,
    #[error("ip discovery failed: {0}")]
    Discovery(#[from] WireError),
    #[error("ip discovery timed out after {0:?}")]
    DiscoveryTimeout(std::time::Duration),
    #[error("udp socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("secret key must be 32 bytes, got {0}")]
    InvalidKey(usize),
    #[error("secret key already installed")]
    KeyAlreadyInstalled,
    #[error("voice stream not initialized: no secret key installed")]
    NotInitialized,
    #[error("voice stream closed")]
    StreamClosed,
    #[error("failed to seal audio frame")]
    Encrypt,
    #[error("voice connection did not become ready within {0:?}")]
    ReadyTimeout(std::time::Duration),
    #[error("voice connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Voice(#[from] VoiceError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("unknown guild {0}")]
    UnknownGuild(GuildId),
    #[error("own user id unknown: READY not received yet")]
    NotReady,
    #[error("no voice state for the current user in guild {0}")]
    MissingVoiceState(GuildId),
    #[error("voice server update for guild {guild_id} did not arrive within {timeout:?}")]
    VoiceServerTimeout {
        guild_id: GuildId,
        timeout: std::time::Duration,
    },
    #[error("voice join for guild {0} was abandoned")]
    JoinAbandoned(GuildId),
}
