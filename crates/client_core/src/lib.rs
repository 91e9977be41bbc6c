//! Client side of a voice bot: the reconnecting websocket session, the chat
//! gateway, and per-guild voice connections with their encrypted RTP stream.

pub mod command;
pub mod error;
pub mod gateway;
pub mod session;
pub mod voice_client;
pub mod voice_stream;

pub use command::Command;
pub use error::{GatewayError, SessionError, VoiceError};
pub use gateway::{GatewayClient, GatewayConfig, GatewayEvent, GuildState};
pub use session::{Session, SessionConfig, SessionEvent, SessionState};
pub use voice_client::{VoiceClient, VoiceConfig, VoiceConnectInfo, VoiceEvent, VoicePhase};
pub use voice_stream::{PlaybackState, StreamObserver, VoiceStream};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
