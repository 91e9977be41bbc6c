//! Reconnecting full-duplex JSON websocket with a pluggable heartbeat.
//!
//! A session owns one driver task that multiplexes outbound sends, heartbeat
//! ticks and link loss, plus one reader task per live connection that decodes
//! inbound frames into the consumer's queue. Every write goes through the
//! driver, so the socket has a single writer.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Serialize;
use serde_json::Value;
use shared::protocol::{InboundFrame, OutboundFrame};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SessionError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Produces the frame sent right after every successful dial (identify).
pub type ConnectHook = Arc<dyn Fn() -> Option<OutboundFrame> + Send + Sync>;
/// Produces the `d` field of each heartbeat.
pub type HeartbeatPayload = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label used in logs.
    pub name: String,
    pub url: String,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "session".into(),
            url: String::new(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            inbound_capacity: 25,
            outbound_capacity: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    ReconnectPending,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Message(InboundFrame),
    /// A new connection replaced a lost one; the connect hook has already run.
    Reconnected,
    Error {
        reason: String,
        terminal: bool,
    },
    /// A text frame that is not a valid envelope. The link stays up; owners
    /// treat this as a protocol violation.
    Malformed(String),
    Closed,
}

enum Control {
    Send(OutboundFrame),
    Heartbeat {
        interval: Duration,
        op: u8,
        payload: HeartbeatPayload,
    },
    Reconnect,
    Close,
}

struct Shared {
    name: String,
    control: mpsc::Sender<Control>,
    closed: AtomicBool,
    state: watch::Receiver<SessionState>,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Dials `config.url`, runs the connect hook, then hands the connection to
    /// a background driver.
    pub async fn open(
        config: SessionConfig,
        on_connect: Option<ConnectHook>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let url = Url::parse(&config.url).map_err(|source| SessionError::InvalidUrl {
            url: config.url.clone(),
            source,
        })?;
        let (events_tx, events_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let link = dial(&url, on_connect.as_ref(), &events_tx, &config.name).await?;
        state_tx.send_replace(SessionState::Open);
        info!(session = %config.name, url = %url, "session: connected");

        let name = config.name.clone();
        let driver = Driver {
            config,
            url,
            on_connect,
            control: control_rx,
            events: events_tx,
            state: state_tx,
            heartbeat: None,
            deferred: VecDeque::new(),
        };
        tokio::spawn(driver.run(link));

        Ok((
            Self {
                shared: Arc::new(Shared {
                    name,
                    control: control_tx,
                    closed: AtomicBool::new(false),
                    state: state_rx,
                }),
            },
            events_rx,
        ))
    }

    /// Queues a frame. On a closed session this logs and does nothing.
    pub async fn send<P: Serialize + ?Sized>(&self, op: u8, payload: &P) -> Result<(), SessionError> {
        let frame =
            OutboundFrame::new(op, payload).map_err(|source| SessionError::Encode { op, source })?;
        self.send_frame(frame).await;
        Ok(())
    }

    pub async fn send_frame(&self, frame: OutboundFrame) {
        if self.is_closed() {
            warn!(session = %self.shared.name, op = frame.op, "session: send on closed session ignored");
            return;
        }
        let op = frame.op;
        if self.shared.control.send(Control::Send(frame)).await.is_err() {
            warn!(session = %self.shared.name, op, "session: driver gone, send dropped");
        }
    }

    /// Starts (or replaces) the heartbeat. The first beat fires one interval
    /// from now.
    pub async fn start_heartbeat<F>(&self, interval: Duration, op: u8, payload: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.control(Control::Heartbeat {
            interval,
            op,
            payload: Arc::new(payload),
        })
        .await;
    }

    /// Drops the current connection and dials again immediately.
    pub async fn reconnect(&self) {
        self.control(Control::Reconnect).await;
    }

    /// Idempotent. Disables reconnection and resolves once the driver has
    /// exited.
    pub async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shared.control.send(Control::Close).await;
        }
        let mut state = self.shared.state.clone();
        let _ = state.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst) || self.state() == SessionState::Closed
    }

    async fn control(&self, control: Control) {
        if self.is_closed() {
            debug!(session = %self.shared.name, "session: control message on closed session ignored");
            return;
        }
        if self.shared.control.send(control).await.is_err() {
            debug!(session = %self.shared.name, "session: driver gone");
        }
    }
}

struct Heartbeat {
    ticker: Interval,
    op: u8,
    payload: HeartbeatPayload,
}

impl Heartbeat {
    fn frame(&self) -> OutboundFrame {
        OutboundFrame {
            op: self.op,
            d: (self.payload)(),
        }
    }
}

async fn heartbeat_due(heartbeat: &mut Option<Heartbeat>) -> OutboundFrame {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.ticker.tick().await;
            heartbeat.frame()
        }
        None => std::future::pending().await,
    }
}

/// One live websocket connection: the write half plus its reader task.
struct Link {
    sink: SplitSink<WsStream, Message>,
    shutdown: Option<oneshot::Sender<()>>,
    lost: oneshot::Receiver<String>,
    reader: JoinHandle<()>,
}

impl Link {
    async fn write(&mut self, frame: &OutboundFrame) -> Result<(), SessionError> {
        let text = serde_json::to_string(frame)
            .map_err(|source| SessionError::Encode { op: frame.op, source })?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(SessionError::Write)
    }

    async fn shutdown(mut self, graceful: bool) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if graceful {
            match tokio::time::timeout(CLOSE_TIMEOUT, self.sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "session: close handshake failed"),
                Err(_) => debug!("session: close handshake timed out"),
            }
        }
        let _ = self.reader.await;
    }
}

async fn dial(
    url: &Url,
    on_connect: Option<&ConnectHook>,
    events: &mpsc::Sender<SessionEvent>,
    name: &str,
) -> Result<Link, SessionError> {
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|source| SessionError::Connect {
            url: url.to_string(),
            source,
        })?;
    let (sink, stream) = ws.split();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (lost_tx, lost_rx) = oneshot::channel();
    let reader = tokio::spawn(read_loop(
        stream,
        events.clone(),
        shutdown_rx,
        lost_tx,
        name.to_owned(),
    ));
    let mut link = Link {
        sink,
        shutdown: Some(shutdown_tx),
        lost: lost_rx,
        reader,
    };

    if let Some(frame) = on_connect.and_then(|hook| hook()) {
        if let Err(err) = link.write(&frame).await {
            link.shutdown(false).await;
            return Err(err);
        }
    }
    Ok(link)
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown: oneshot::Receiver<()>,
    lost: oneshot::Sender<String>,
    name: String,
) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => return,
            next = stream.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => break format!("websocket receive failed: {err}"),
            None => break "connection closed by peer".to_owned(),
        };

        match message {
            Message::Text(text) => {
                let event = match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(frame) => SessionEvent::Message(frame),
                    Err(err) => {
                        warn!(session = %name, error = %err, "session: undecodable frame");
                        SessionEvent::Malformed(format!("invalid frame: {err}"))
                    }
                };
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    sent = events.send(event) => {
                        if sent.is_err() {
                            debug!(session = %name, "session: consumer gone, reader exiting");
                            return;
                        }
                    }
                }
            }
            Message::Close(frame) => {
                break match frame {
                    Some(frame) => format!("closed by peer: {} {}", frame.code, frame.reason),
                    None => "closed by peer".to_owned(),
                };
            }
            Message::Binary(bytes) => {
                warn!(session = %name, len = bytes.len(), "session: ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    };
    let _ = lost.send(reason);
}

enum Exit {
    Close,
    Reconnect,
    Lost(String),
}

struct Driver {
    config: SessionConfig,
    url: Url,
    on_connect: Option<ConnectHook>,
    control: mpsc::Receiver<Control>,
    events: mpsc::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
    heartbeat: Option<Heartbeat>,
    /// Control messages that arrived while an event was waiting for queue
    /// space. Served before the channel.
    deferred: VecDeque<Control>,
}

async fn next_control(
    deferred: &mut VecDeque<Control>,
    control: &mut mpsc::Receiver<Control>,
) -> Option<Control> {
    match deferred.pop_front() {
        Some(pending) => Some(pending),
        None => control.recv().await,
    }
}

impl Driver {
    async fn run(mut self, mut link: Link) {
        loop {
            let exit = self.serve(&mut link).await;
            let delay = match exit {
                Exit::Close => {
                    self.state.send_replace(SessionState::Closing);
                    link.shutdown(true).await;
                    break;
                }
                Exit::Reconnect => {
                    info!(session = %self.config.name, "session: reconnect requested");
                    link.shutdown(true).await;
                    Duration::ZERO
                }
                Exit::Lost(reason) => {
                    link.shutdown(false).await;
                    let terminal = !self.config.auto_reconnect;
                    warn!(session = %self.config.name, reason = %reason, terminal, "session: connection lost");
                    self.emit(SessionEvent::Error { reason, terminal }).await;
                    if terminal {
                        self.state.send_replace(SessionState::Closing);
                        break;
                    }
                    self.config.reconnect_delay
                }
            };

            match self.redial(delay).await {
                Some(next) => link = next,
                None => break,
            }
        }

        self.heartbeat = None;
        self.state.send_replace(SessionState::Closed);
        // The queue closing once the driver exits also tells the consumer.
        if let Err(err) = self.events.try_send(SessionEvent::Closed) {
            debug!(session = %self.config.name, error = %err, "session: closed event dropped");
        }
        info!(session = %self.config.name, "session: closed");
    }

    async fn serve(&mut self, link: &mut Link) -> Exit {
        loop {
            tokio::select! {
                biased;
                control = next_control(&mut self.deferred, &mut self.control) => match control {
                    None | Some(Control::Close) => return Exit::Close,
                    Some(Control::Reconnect) => return Exit::Reconnect,
                    Some(Control::Send(frame)) => match link.write(&frame).await {
                        Ok(()) => {}
                        Err(SessionError::Write(err)) => {
                            return Exit::Lost(format!("websocket send failed: {err}"));
                        }
                        Err(err) => warn!(session = %self.config.name, error = %err, "session: frame dropped"),
                    },
                    Some(Control::Heartbeat { interval, op, payload }) => {
                        self.set_heartbeat(interval, op, payload);
                    }
                },
                lost = &mut link.lost => {
                    return match lost {
                        Ok(reason) => Exit::Lost(reason),
                        Err(_) => Exit::Close,
                    };
                }
                frame = heartbeat_due(&mut self.heartbeat) => {
                    debug!(session = %self.config.name, op = frame.op, "session: heartbeat");
                    if let Err(err) = link.write(&frame).await {
                        return Exit::Lost(format!("heartbeat failed: {err}"));
                    }
                }
            }
        }
    }

    /// Waits `delay` then dials until a connection is up. `None` means the
    /// session should end.
    async fn redial(&mut self, mut delay: Duration) -> Option<Link> {
        // The server announces a fresh interval on every new connection.
        self.heartbeat = None;
        loop {
            self.state.send_replace(SessionState::ReconnectPending);
            if self.close_deferred() {
                self.state.send_replace(SessionState::Closing);
                return None;
            }
            if !delay.is_zero() && !self.wait_before_redial(delay).await {
                self.state.send_replace(SessionState::Closing);
                return None;
            }

            self.state.send_replace(SessionState::Connecting);
            match dial(
                &self.url,
                self.on_connect.as_ref(),
                &self.events,
                &self.config.name,
            )
            .await
            {
                Ok(link) => {
                    self.state.send_replace(SessionState::Open);
                    info!(session = %self.config.name, "session: reconnected");
                    self.emit(SessionEvent::Reconnected).await;
                    return Some(link);
                }
                Err(err) => {
                    let terminal = !self.config.auto_reconnect;
                    warn!(session = %self.config.name, error = %err, terminal, "session: redial failed");
                    self.emit(SessionEvent::Error {
                        reason: err.to_string(),
                        terminal,
                    })
                    .await;
                    if terminal {
                        self.state.send_replace(SessionState::Closing);
                        return None;
                    }
                    delay = self.config.reconnect_delay;
                }
            }
        }
    }

    /// Returns `false` if the session was closed during the wait.
    async fn wait_before_redial(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                control = next_control(&mut self.deferred, &mut self.control) => match control {
                    None | Some(Control::Close) => return false,
                    Some(Control::Reconnect) => return true,
                    Some(Control::Send(frame)) => {
                        warn!(session = %self.config.name, op = frame.op, "session: send dropped while reconnecting");
                    }
                    Some(Control::Heartbeat { .. }) => {
                        debug!(session = %self.config.name, "session: heartbeat ignored while reconnecting");
                    }
                },
                _ = &mut sleep => return true,
            }
        }
    }

    fn set_heartbeat(&mut self, interval: Duration, op: u8, payload: HeartbeatPayload) {
        if interval.is_zero() {
            warn!(session = %self.config.name, "session: ignoring zero heartbeat interval");
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(Heartbeat {
            ticker,
            op,
            payload,
        });
        debug!(
            session = %self.config.name,
            interval_ms = interval.as_millis() as u64,
            "session: heartbeat started"
        );
    }

    fn close_deferred(&self) -> bool {
        self.deferred
            .iter()
            .any(|control| matches!(control, Control::Close))
    }

    /// Waits for queue space so lifecycle events survive a slow consumer.
    /// Control messages arriving meanwhile are deferred; a close drops the
    /// event.
    async fn emit(&mut self, event: SessionEvent) {
        if self.close_deferred() {
            debug!(session = %self.config.name, "session: closing, event dropped");
            return;
        }
        loop {
            tokio::select! {
                biased;
                permit = self.events.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(event),
                        Err(_) => debug!(session = %self.config.name, "session: consumer gone, event dropped"),
                    }
                    return;
                }
                control = self.control.recv() => match control {
                    None | Some(Control::Close) => {
                        self.deferred.push_back(Control::Close);
                        debug!(session = %self.config.name, "session: closing, event dropped");
                        return;
                    }
                    Some(other) => self.deferred.push_back(other),
                },
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
