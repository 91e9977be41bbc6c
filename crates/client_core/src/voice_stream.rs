use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use crypto_secretbox::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    XSalsa20Poly1305,
};
use playback::{AudioFrame, AudioSink};
use shared::rtp::{
    decode_ip_discovery_response, encode_ip_discovery_request, DiscoveredAddress, RtpHeader,
    IP_DISCOVERY_LEN, RTP_HEADER_LEN,
};
use tokio::{net::UdpSocket, sync::Mutex};
use tracing::{debug, info, warn};

use crate::error::VoiceError;

pub const ENCRYPTION_MODE: &str = "xsalsa20_poly1305";
pub const SECRET_KEY_LEN: usize = 32;
/// 20 ms at 48 kHz.
pub const SAMPLES_PER_FRAME: u32 = 960;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Finished,
    Stopped,
    Failed(String),
}

/// Receives the stream's playing-state transitions. Injected by whoever owns
/// the stream so the stream never refers back to its owner.
pub trait StreamObserver: Send + Sync {
    fn playback_changed(&self, state: PlaybackState);
}

struct Counters {
    sequence: u16,
    timestamp: u32,
}

/// Encrypted RTP sender bound to one voice server and one ssrc.
pub struct VoiceStream {
    socket: UdpSocket,
    remote: SocketAddr,
    ssrc: u32,
    external: DiscoveredAddress,
    cipher: OnceLock<XSalsa20Poly1305>,
    counters: Mutex<Counters>,
    playing: AtomicBool,
    closed: AtomicBool,
    observer: Arc<dyn StreamObserver>,
}

impl VoiceStream {
    /// Binds a UDP socket, connects it to `remote` and learns the externally
    /// visible address via IP discovery.
    pub async fn connect(
        remote: SocketAddr,
        ssrc: u32,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<Arc<Self>, VoiceError> {
        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;

        let external = discover(&socket, ssrc, remote.port()).await?;
        if external.ssrc != ssrc {
            warn!(expected = ssrc, got = external.ssrc, "voice: ip discovery answered for another ssrc");
        }
        info!(
            remote = %remote,
            ssrc,
            external_ip = %external.ip,
            external_port = external.port,
            "voice: udp channel ready"
        );

        Ok(Arc::new(Self {
            socket,
            remote,
            ssrc,
            external,
            cipher: OnceLock::new(),
            counters: Mutex::new(Counters {
                sequence: rand::random(),
                timestamp: rand::random(),
            }),
            playing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            observer,
        }))
    }

    /// Installs the session secret. Only one key is accepted per stream.
    pub fn install_key(&self, key: &[u8]) -> Result<(), VoiceError> {
        if key.len() != SECRET_KEY_LEN {
            return Err(VoiceError::InvalidKey(key.len()));
        }
        if self.cipher.get().is_some() {
            return Err(VoiceError::KeyAlreadyInstalled);
        }
        let cipher = XSalsa20Poly1305::new_from_slice(key)
            .map_err(|_| VoiceError::InvalidKey(key.len()))?;
        self.cipher
            .set(cipher)
            .map_err(|_| VoiceError::KeyAlreadyInstalled)
    }

    pub fn has_key(&self) -> bool {
        self.cipher.get().is_some()
    }

    /// Seals one Opus frame and sends it. Counters only advance once the
    /// datagram has been written.
    pub async fn send_opus(&self, frame: &[u8]) -> Result<(), VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::StreamClosed);
        }
        let cipher = self.cipher.get().ok_or(VoiceError::NotInitialized)?;

        let mut counters = self.counters.lock().await;
        let header = RtpHeader {
            sequence: counters.sequence.wrapping_add(1),
            timestamp: counters.timestamp,
            ssrc: self.ssrc,
        };
        let nonce = header.nonce();
        let sealed = cipher
            .encrypt(GenericArray::from_slice(&nonce), frame)
            .map_err(|_| VoiceError::Encrypt)?;

        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + sealed.len());
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(&sealed);
        self.socket.send(&packet).await?;

        counters.sequence = header.sequence;
        counters.timestamp = counters.timestamp.wrapping_add(SAMPLES_PER_FRAME);
        Ok(())
    }

    /// Last sequence number used; the next packet carries this plus one.
    pub async fn sequence(&self) -> u16 {
        self.counters.lock().await.sequence
    }

    pub async fn timestamp(&self) -> u32 {
        self.counters.lock().await.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// Address and port as seen by the voice server.
    pub fn external_address(&self) -> &DiscoveredAddress {
        &self.external
    }

    pub fn local_address(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Rejects further sends. The socket is released with the last reference.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.playing.store(false, Ordering::SeqCst);
            debug!(ssrc = self.ssrc, "voice: udp channel shut down");
        }
    }

    fn transition(&self, playing: bool, state: PlaybackState) {
        self.playing.store(playing, Ordering::SeqCst);
        self.observer.playback_changed(state);
    }
}

async fn discover(socket: &UdpSocket, ssrc: u32, port: u16) -> Result<DiscoveredAddress, VoiceError> {
    socket
        .send(&encode_ip_discovery_request(ssrc, port))
        .await?;

    let mut buf = [0u8; IP_DISCOVERY_LEN + 1];
    let len = tokio::time::timeout(DISCOVERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| VoiceError::DiscoveryTimeout(DISCOVERY_TIMEOUT))??;
    Ok(decode_ip_discovery_response(&buf[..len])?)
}

#[async_trait]
impl AudioSink for VoiceStream {
    fn on_begin(&self) {
        self.transition(true, PlaybackState::Playing);
    }

    fn on_finished(&self) {
        self.transition(false, PlaybackState::Finished);
    }

    fn on_stopped(&self) {
        self.transition(false, PlaybackState::Stopped);
    }

    fn on_failed(&self, reason: &str) {
        self.transition(false, PlaybackState::Failed(reason.to_owned()));
    }

    async fn send_frame(&self, frame: AudioFrame) -> Result<()> {
        self.send_opus(&frame.payload).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/voice_stream_tests.rs"]
mod tests;
