//! In-process fakes for the gateway/voice websocket servers and the voice UDP
//! endpoint.

use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::rtp::{encode_ip_discovery_response, IP_DISCOVERY_LEN, IP_DISCOVERY_REQUEST};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct FakeServer {
    pub url: String,
    connections: mpsc::Receiver<FakeConnection>,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                if tx.send(FakeConnection { ws }).await.is_err() {
                    break;
                }
            }
        });
        Self {
            url: format!("ws://{addr}"),
            connections: rx,
        }
    }

    /// Host and port without a scheme, the shape voice endpoints arrive in.
    pub fn endpoint(&self) -> String {
        self.url.trim_start_matches("ws://").to_owned()
    }

    pub async fn accept(&mut self) -> FakeConnection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("accept timed out")
            .expect("listener gone")
    }

    pub async fn try_accept(&mut self, within: Duration) -> Option<FakeConnection> {
        timeout(within, self.connections.recv()).await.ok().flatten()
    }
}

pub struct FakeConnection {
    ws: WebSocketStream<TcpStream>,
}

impl FakeConnection {
    /// Next JSON text frame, or `None` once the client closed.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            let message = timeout(WAIT, self.ws.next()).await.expect("recv timed out")?;
            match message.ok()? {
                Message::Text(text) => return Some(serde_json::from_str(&text).expect("json")),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    pub async fn recv(&mut self) -> Value {
        self.next_json().await.expect("connection closed")
    }

    /// Skips frames until one with `op` arrives.
    pub async fn recv_op(&mut self, op: u8) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["op"] == op {
                return frame;
            }
        }
    }

    pub async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .expect("send");
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned()))
            .await
            .expect("send");
    }

    /// Drops the TCP connection without a close handshake.
    pub fn drop_connection(self) {
        drop(self.ws);
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Answers IP discovery requests with the sender's address and forwards every
/// other datagram.
pub struct FakeVoiceUdp {
    pub addr: SocketAddr,
    pub packets: mpsc::Receiver<Vec<u8>>,
}

impl FakeVoiceUdp {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind udp");
        let addr = socket.local_addr().expect("addr");
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let packet = &buf[..len];
                let is_discovery = len == IP_DISCOVERY_LEN
                    && u16::from_be_bytes([packet[0], packet[1]]) == IP_DISCOVERY_REQUEST;
                if is_discovery {
                    let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
                    let reply =
                        encode_ip_discovery_response(ssrc, &peer.ip().to_string(), peer.port())
                            .expect("reply");
                    let _ = socket.send_to(&reply, peer).await;
                } else if tx.send(packet.to_vec()).await.is_err() {
                    break;
                }
            }
        });
        Self { addr, packets: rx }
    }

    pub async fn next_packet(&mut self) -> Vec<u8> {
        timeout(WAIT, self.packets.recv())
            .await
            .expect("udp recv timed out")
            .expect("udp server gone")
    }
}
