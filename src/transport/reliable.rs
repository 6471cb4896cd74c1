//! Reliable control and TTS channel over WebSocket
//!
//! A single task owns the socket. Callers enqueue outbound messages through
//! a [`ChannelHandle`] without blocking; inbound frames are typed and
//! forwarded as [`ChannelEvent`]s. On loss the task reconnects with
//! exponential backoff and re-announces the device with `session_start`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::backoff::ReconnectPolicy;
use super::messages::{
    AudioFormat, ClientMessage, ServerMessage, parse_binary, parse_text, timestamp_ms,
};
use crate::config::{FeedbackConfig, TransportConfig};
use crate::shutdown::Shutdown;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Keepalive pings that may go unanswered before the link is declared dead
const MAX_MISSED_PINGS: u32 = 2;

/// Reliable channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No endpoint yet, or the link dropped
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnect attempt `attempt`
    Backoff { attempt: u32, delay_ms: u64 },
    /// Reconnect attempts exhausted
    GaveUp,
}

/// Events emitted by the channel task
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: String },
    /// A connect attempt failed
    ConnectFailed { consecutive_failures: u32 },
    Message(ServerMessage),
    /// Malformed or unknown inbound frame
    PeerFault(String),
    GaveUp,
}

/// How the device announces itself on every (re)connect
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub room: String,
    pub capabilities: String,
}

impl DeviceIdentity {
    #[must_use]
    pub fn from_config(feedback: &FeedbackConfig, capabilities: &str) -> Self {
        Self {
            device_id: feedback.device_id.clone(),
            device_name: feedback.device_name.clone(),
            room: feedback.room.clone(),
            capabilities: capabilities.to_string(),
        }
    }

    fn session_start(&self) -> ClientMessage {
        ClientMessage::SessionStart {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            room: self.room.clone(),
            audio_format: AudioFormat::default(),
            capabilities: self.capabilities.clone(),
            timestamp: timestamp_ms(),
        }
    }
}

/// WebSocket URL for a server's control port
#[must_use]
pub fn control_url(host: &str, port: u16, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{host}]:{port}/{path}")
    } else {
        format!("ws://{host}:{port}/{path}")
    }
}

#[derive(Debug)]
struct Outbound {
    message: ClientMessage,
    enqueued_at: Instant,
}

/// Channel counters
#[derive(Debug, Default)]
pub struct ChannelStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections: AtomicU64,
    reconnect_attempts: AtomicU64,
    stale_dropped: AtomicU64,
    busy_rejections: AtomicU64,
    peer_faults: AtomicU64,
}

/// Point-in-time copy of [`ChannelStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
    pub reconnect_attempts: u64,
    pub stale_dropped: u64,
    pub busy_rejections: u64,
    pub peer_faults: u64,
}

impl ChannelStats {
    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            peer_faults: self.peer_faults.load(Ordering::Relaxed),
        }
    }
}

/// Caller side of the reliable channel
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::Sender<Outbound>,
    state: watch::Receiver<ConnectionState>,
    endpoint: Arc<watch::Sender<Option<String>>>,
    stats: Arc<ChannelStats>,
}

impl ChannelHandle {
    /// Enqueue a message without waiting
    ///
    /// Messages queue while disconnected and are flushed after reconnect.
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if the outbound queue is full, or
    /// `Error::TransportLost` if the channel task has stopped
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        let kind = message.kind();
        self.outbound
            .try_send(Outbound {
                message,
                enqueued_at: Instant::now(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.stats.busy_rejections.fetch_add(1, Ordering::Relaxed);
                    Error::Busy(format!("outbound queue full, dropped {kind}"))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::TransportLost("reliable channel stopped".to_string())
                }
            })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Point the channel at a new server URL, dropping any current link
    pub fn set_endpoint(&self, url: Option<String>) {
        self.endpoint.send_if_modified(|current| {
            if *current == url {
                false
            } else {
                tracing::info!(url = ?url, "reliable channel endpoint changed");
                *current = url;
                true
            }
        });
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint.borrow().clone()
    }

    #[must_use]
    pub fn stats(&self) -> ChannelSnapshot {
        self.stats.snapshot()
    }
}

/// The task that owns the socket
pub struct ReliableChannel {
    policy: ReconnectPolicy,
    keepalive: Duration,
    connection_timeout: Duration,
    write_timeout: Duration,
    metadata_max_age: Duration,
    max_peer_faults: u32,
    peer_fault_window: Duration,
    identity: DeviceIdentity,
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
    endpoint: watch::Receiver<Option<String>>,
    stats: Arc<ChannelStats>,
    shutdown: Shutdown,
}

impl ReliableChannel {
    /// Build the channel task and its handle
    ///
    /// The returned receiver yields every inbound event.
    #[must_use]
    pub fn new(
        config: &TransportConfig,
        identity: DeviceIdentity,
        endpoint: Option<String>,
        shutdown: Shutdown,
    ) -> (Self, ChannelHandle, mpsc::Receiver<ChannelEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_depth.max(1));
        let (events_tx, events_rx) = mpsc::channel(config.outbound_queue_depth.max(1) * 4);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (endpoint_tx, endpoint_rx) = watch::channel(endpoint);
        let stats = Arc::new(ChannelStats::default());

        let handle = ChannelHandle {
            outbound: outbound_tx,
            state: state_rx,
            endpoint: Arc::new(endpoint_tx),
            stats: Arc::clone(&stats),
        };

        let channel = Self {
            policy: ReconnectPolicy::from_config(config),
            keepalive: config.keepalive_interval(),
            connection_timeout: config.connection_timeout(),
            write_timeout: config.write_timeout(),
            metadata_max_age: Duration::from_millis(config.metadata_max_age_ms),
            max_peer_faults: config.max_peer_faults,
            peer_fault_window: Duration::from_millis(config.peer_fault_window_ms),
            identity,
            outbound: outbound_rx,
            events: events_tx,
            state: state_tx,
            endpoint: endpoint_rx,
            stats,
            shutdown,
        };

        (channel, handle, events_rx)
    }

    /// Run the channel on its own task
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect, serve and reconnect until shutdown
    pub async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            let current = self.endpoint.borrow_and_update().clone();
            let Some(url) = current else {
                self.set_state(ConnectionState::Disconnected);
                if self.wait_for_endpoint().await {
                    continue;
                }
                break;
            };

            self.set_state(ConnectionState::Connecting);
            tracing::info!(url = %url, attempt = failures, "connecting reliable channel");

            match tokio::time::timeout(self.connection_timeout, connect_async(url.as_str())).await {
                Ok(Ok((ws, _response))) => {
                    failures = 0;
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    self.emit(ChannelEvent::Connected).await;
                    tracing::info!(url = %url, "reliable channel connected");

                    let reason = self.serve(ws).await;

                    self.set_state(ConnectionState::Disconnected);
                    tracing::warn!(reason = %reason, "reliable channel disconnected");
                    self.emit(ChannelEvent::Disconnected { reason }).await;
                }
                Ok(Err(e)) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(url = %url, error = %e, failures, "reliable channel connect failed");
                    self.emit(ChannelEvent::ConnectFailed {
                        consecutive_failures: failures,
                    })
                    .await;
                }
                Err(_) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(url = %url, failures, "reliable channel connect timed out");
                    self.emit(ChannelEvent::ConnectFailed {
                        consecutive_failures: failures,
                    })
                    .await;
                }
            }

            if self.shutdown.is_triggered() {
                break;
            }
            if !self.policy.allows(failures) {
                tracing::error!(failures, "reliable channel giving up");
                self.set_state(ConnectionState::GaveUp);
                self.emit(ChannelEvent::GaveUp).await;
                break;
            }

            let delay = self.policy.delay_for_attempt(failures.saturating_sub(1));
            self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnectionState::Backoff {
                attempt: failures,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
            tracing::debug!(delay_ms = delay.as_millis(), "reconnect scheduled");

            tokio::select! {
                () = self.shutdown.wait() => break,
                () = tokio::time::sleep(delay) => {}
                changed = self.endpoint.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    failures = 0;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::debug!("reliable channel task stopped");
    }

    /// Park until an endpoint is configured, false on shutdown
    async fn wait_for_endpoint(&mut self) -> bool {
        tokio::select! {
            () = self.shutdown.wait() => false,
            changed = self.endpoint.changed() => changed.is_ok(),
        }
    }

    /// Serve one connection, returning why it ended
    async fn serve(&mut self, ws: WsStream) -> String {
        let (mut sink, mut stream) = ws.split();

        let hello = self.identity.session_start();
        if let Err(e) = self.write(&mut sink, &hello).await {
            return format!("session start failed: {e}");
        }

        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + self.keepalive,
            self.keepalive,
        );
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut missed_pings: u32 = 0;
        let mut faults: u32 = 0;
        let mut fault_window_start = Instant::now();

        loop {
            tokio::select! {
                () = self.shutdown.wait() => {
                    let _ = self.push(&mut sink, Message::Close(None)).await;
                    return "shutdown".to_string();
                }
                changed = self.endpoint.changed() => {
                    if changed.is_err() {
                        return "endpoint source closed".to_string();
                    }
                    let _ = self.push(&mut sink, Message::Close(None)).await;
                    return "endpoint changed".to_string();
                }
                outbound = self.outbound.recv() => {
                    let Some(outbound) = outbound else {
                        return "all handles dropped".to_string();
                    };
                    if outbound.message.is_audio_metadata()
                        && outbound.enqueued_at.elapsed() > self.metadata_max_age
                    {
                        self.stats.stale_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(kind = outbound.message.kind(), "dropping stale audio metadata");
                        continue;
                    }
                    if let Err(e) = self.write(&mut sink, &outbound.message).await {
                        return format!("send failed: {e}");
                    }
                }
                _ = keepalive.tick() => {
                    if missed_pings >= MAX_MISSED_PINGS {
                        return format!("{missed_pings} keepalive pings unanswered");
                    }
                    missed_pings += 1;
                    let ping = ClientMessage::Ping {
                        device_id: self.identity.device_id.clone(),
                        timestamp: timestamp_ms(),
                    };
                    if let Err(e) = self.write(&mut sink, &ping).await {
                        return format!("ping failed: {e}");
                    }
                }
                frame = stream.next() => {
                    let Some(frame) = frame else {
                        return "closed by peer".to_string();
                    };
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => return format!("read failed: {e}"),
                    };

                    let parsed = match frame {
                        Message::Text(text) => {
                            self.count_received(text.len());
                            parse_text(&text)
                        }
                        Message::Binary(bytes) => {
                            self.count_received(bytes.len());
                            parse_binary(&bytes).map(ServerMessage::TtsChunk)
                        }
                        Message::Ping(payload) => {
                            if let Err(e) = self.push(&mut sink, Message::Pong(payload)).await {
                                return format!("pong failed: {e}");
                            }
                            continue;
                        }
                        Message::Pong(_) => {
                            missed_pings = 0;
                            continue;
                        }
                        Message::Close(_) => return "closed by peer".to_string(),
                        Message::Frame(_) => continue,
                    };

                    match parsed {
                        Ok(ServerMessage::Ping { .. }) => {
                            missed_pings = 0;
                            let pong = ClientMessage::Pong {
                                device_id: self.identity.device_id.clone(),
                                timestamp: timestamp_ms(),
                            };
                            if let Err(e) = self.write(&mut sink, &pong).await {
                                return format!("pong failed: {e}");
                            }
                        }
                        Ok(ServerMessage::Pong { .. }) => missed_pings = 0,
                        Ok(message) => self.emit(ChannelEvent::Message(message)).await,
                        Err(e) => {
                            self.stats.peer_faults.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %e, "dropping malformed server frame");
                            self.emit(ChannelEvent::PeerFault(e.to_string())).await;

                            if fault_window_start.elapsed() > self.peer_fault_window {
                                fault_window_start = Instant::now();
                                faults = 0;
                            }
                            faults += 1;
                            if faults > self.max_peer_faults {
                                let _ = self.push(&mut sink, Message::Close(None)).await;
                                return format!("{faults} malformed frames from peer");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn write<S>(&self, sink: &mut S, message: &ClientMessage) -> Result<()>
    where
        S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let text = serde_json::to_string(message)?;
        let len = text.len();
        self.push(sink, Message::Text(text)).await?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        tracing::trace!(kind = message.kind(), bytes = len, "reliable message sent");
        Ok(())
    }

    /// Send one frame; a peer that stops reading fails it after
    /// `write_timeout`
    async fn push<S>(&self, sink: &mut S, frame: Message) -> Result<()>
    where
        S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        match tokio::time::timeout(self.write_timeout, sink.send(frame)).await {
            Ok(sent) => Ok(sent?),
            Err(_) => Err(Error::TimedOut(format!(
                "control write stalled for {} ms",
                self.write_timeout.as_millis()
            ))),
        }
    }

    fn count_received(&self, len: usize) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("channel event receiver dropped");
        }
    }
}
