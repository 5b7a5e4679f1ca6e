//! WebSocket channel to the transcription backend
//!
//! Manages the lifecycle of the persistent bidirectional connection shared by
//! the live streaming path and the upload path.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish the WebSocket (bounded retries with backoff)
//! 2. `ChannelHandle::send()` - Enqueue outbound events while connected
//! 3. `take_events()` - Consume inbound server events and lifecycle events
//! 4. `close()` - Shut the link down
//!
//! # Reconnect Strategy
//!
//! On a transport-level failure the supervisor retries establishment up to
//! the configured bound with exponential backoff. There is no payload replay:
//! sends made while the link is down fail fast with `NotConnected`, and any
//! payload the writer had accepted but could not deliver is reported as a
//! `DeliveryGap` event. Once the attempts are exhausted the channel is
//! terminally failed and every subsequent send fails fast.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ClientEvent, ServerEvent};
use super::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the outbound single-writer queue
const OUTBOUND_QUEUE: usize = 256;

/// Capacity of the inbound event queue
const EVENT_QUEUE: usize = 100;

/// Configuration for the channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint of the backend
    pub endpoint: String,
    /// Bound on connection attempts, both initial and mid-session
    pub reconnect_attempts: u32,
    /// Timeout for a single WebSocket handshake
    pub connect_timeout: Duration,
    /// Base delay for exponential backoff (doubles each retry)
    pub retry_base_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:5000/ws".to_string(),
            reconnect_attempts: 3,
            connect_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Observable state of the underlying link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link is up; sends are accepted
    Connected,
    /// Link is down; the supervisor may still reconnect
    Disconnected,
    /// Reconnection attempts exhausted; the channel is dead
    Failed,
}

/// Lifecycle and inbound events surfaced to the session
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Link established (initial or after reconnect)
    Connected,
    /// Link lost; reconnection may follow
    Disconnected { reason: String },
    /// A reconnection attempt is starting
    Reconnecting { attempt: u32 },
    /// A connection attempt failed
    ConnectError { message: String },
    /// Reconnection attempts exhausted; channel is terminally failed
    Failed { reason: String },
    /// Payloads accepted by the writer were lost to a dying link
    DeliveryGap { dropped: u64 },
    /// A parsed message from the backend
    Message(ServerEvent),
}

/// Cloneable sending side of the channel.
///
/// Shared by the chunk streamer and the upload encoder; the single writer
/// task behind it preserves arrival order.
#[derive(Clone)]
pub struct ChannelHandle {
    out_tx: mpsc::Sender<ClientEvent>,
    state: watch::Receiver<LinkState>,
}

impl ChannelHandle {
    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Whether the link is currently up.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Enqueue an event for delivery.
    ///
    /// Fails fast with `NotConnected` while the link is down or terminally
    /// failed; the payload is never silently queued for a dead link. The
    /// caller decides whether a failure is a reportable gap (live chunks) or
    /// a hard error (uploads).
    pub fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        match self.state() {
            LinkState::Connected => self.out_tx.try_send(event).map_err(|e| match e {
                TrySendError::Full(_) => {
                    TransportError::SendFailed("outbound queue full".to_string())
                }
                TrySendError::Closed(_) => TransportError::NotConnected,
            }),
            LinkState::Disconnected | LinkState::Failed => Err(TransportError::NotConnected),
        }
    }
}

/// Handle to an established channel.
///
/// Owns the supervisor task that drives the WebSocket; dropping the channel
/// aborts it.
pub struct Channel {
    handle: ChannelHandle,
    events_rx: Option<mpsc::Receiver<ChannelEvent>>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl Channel {
    /// Connect to the backend, retrying up to the configured bound.
    pub async fn connect(config: ChannelConfig) -> Result<Self, TransportError> {
        let mut last_error = None;

        for attempt in 0..config.reconnect_attempts.max(1) {
            if attempt > 0 {
                let delay = config.retry_base_delay * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    config.reconnect_attempts
                );
                tokio::time::sleep(delay).await;
            }

            match try_connect(&config).await {
                Ok(ws) => return Ok(Self::spawn(ws, config)),
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::ConnectionFailed("all connection attempts failed".to_string())
        }))
    }

    fn spawn(ws: WsStream, config: ChannelConfig) -> Self {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (state_tx, state_rx) = watch::channel(LinkState::Connected);

        let supervisor = tokio::spawn(run_link(ws, config, out_rx, events_tx, state_tx));

        Self {
            handle: ChannelHandle {
                out_tx,
                state: state_rx,
            },
            events_rx: Some(events_rx),
            supervisor,
        }
    }

    /// A cloneable sending handle.
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// Take ownership of the inbound event receiver.
    ///
    /// Returns `None` if already taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events_rx.take()
    }

    /// Shut the link down.
    pub async fn close(self) {
        log::info!("Closing backend channel");
        self.supervisor.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Ensure the supervisor dies with the channel
        self.supervisor.abort();
    }
}

/// Single connection attempt (no retries)
async fn try_connect(config: &ChannelConfig) -> Result<WsStream, TransportError> {
    let request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    log::info!("Connecting to {}...", config.endpoint);

    let (ws, _response) = timeout(
        config.connect_timeout,
        connect_async_with_config(
            request, None, true, // disable_nagle: chunks must not sit in the kernel
        ),
    )
    .await
    .map_err(|_| TransportError::ConnectionFailed("connection timeout".to_string()))?
    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    Ok(ws)
}

/// Supervisor: drives the link, reconnects within the bound, goes terminal.
async fn run_link(
    ws: WsStream,
    config: ChannelConfig,
    mut out_rx: mpsc::Receiver<ClientEvent>,
    events_tx: mpsc::Sender<ChannelEvent>,
    state_tx: watch::Sender<LinkState>,
) {
    let _ = events_tx.send(ChannelEvent::Connected).await;
    let mut ws = ws;

    loop {
        let (reason, lost_in_flight) = drive(ws, &mut out_rx, &events_tx).await;
        let _ = state_tx.send(LinkState::Disconnected);

        // No replay: whatever was queued when the link died is lost, and the
        // loss is reported rather than swallowed.
        let dropped = lost_in_flight + drain_pending(&mut out_rx);
        if dropped > 0 {
            let _ = events_tx.send(ChannelEvent::DeliveryGap { dropped }).await;
        }

        let reason = match reason {
            Some(r) => r,
            None => {
                // Local close (handle or event consumer dropped)
                log::debug!("Channel closed locally");
                return;
            }
        };

        log::warn!("Link lost: {}", reason);
        let _ = events_tx
            .send(ChannelEvent::Disconnected {
                reason: reason.clone(),
            })
            .await;

        match reestablish(&config, &events_tx).await {
            Some(new_ws) => {
                let _ = state_tx.send(LinkState::Connected);
                let _ = events_tx.send(ChannelEvent::Connected).await;
                ws = new_ws;
            }
            None => {
                let _ = state_tx.send(LinkState::Failed);
                log::error!(
                    "Reconnection attempts exhausted ({}), channel failed",
                    config.reconnect_attempts
                );
                let _ = events_tx.send(ChannelEvent::Failed { reason }).await;
                return;
            }
        }
    }
}

/// Drive one established connection until it dies or is closed locally.
///
/// Returns the disconnect reason (`None` for a local close) and the number of
/// accepted payloads lost in flight.
async fn drive(
    ws: WsStream,
    out_rx: &mut mpsc::Receiver<ClientEvent>,
    events_tx: &mpsc::Sender<ChannelEvent>,
) -> (Option<String>, u64) {
    let (mut write, mut read): (SplitSink<WsStream, Message>, SplitStream<WsStream>) = ws.split();

    loop {
        tokio::select! {
            cmd = out_rx.recv() => match cmd {
                Some(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            // An unserializable payload is still a loss to report
                            log::error!("Dropping unserializable event: {}", e);
                            let _ = events_tx.send(ChannelEvent::DeliveryGap { dropped: 1 }).await;
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        return (Some(format!("send failed: {}", e)), 1);
                    }
                }
                None => {
                    let _ = write.close().await;
                    return (None, 0);
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if events_tx.send(ChannelEvent::Message(event)).await.is_err() {
                                // Nobody is listening anymore
                                return (None, 0);
                            }
                        }
                        Err(e) => {
                            log::warn!("Failed to parse server event: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return (Some("closed by server".to_string()), 0);
                }
                Some(Ok(_)) => {} // Ignore ping/pong/binary
                Some(Err(e)) => {
                    return (Some(format!("websocket error: {}", e)), 0);
                }
                None => {
                    return (Some("stream ended".to_string()), 0);
                }
            },
        }
    }
}

/// Bounded reconnection with exponential backoff.
async fn reestablish(config: &ChannelConfig, events_tx: &mpsc::Sender<ChannelEvent>) -> Option<WsStream> {
    for attempt in 1..=config.reconnect_attempts {
        let delay = config.retry_base_delay * 2u32.pow(attempt - 1);
        log::info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt,
            config.reconnect_attempts
        );
        tokio::time::sleep(delay).await;

        let _ = events_tx.send(ChannelEvent::Reconnecting { attempt }).await;

        match try_connect(config).await {
            Ok(ws) => {
                log::info!("Reconnected on attempt {}", attempt);
                return Some(ws);
            }
            Err(e) => {
                log::warn!("Reconnect attempt {} failed: {}", attempt, e);
                let _ = events_tx
                    .send(ChannelEvent::ConnectError {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    None
}

#[cfg(test)]
impl ChannelHandle {
    /// Handle over a live queue, for exercising senders without a socket.
    /// Returns the handle, the receiving end of the queue, and the state
    /// sender (dropping it would freeze the observed state).
    pub(crate) fn connected_for_tests() -> (
        Self,
        mpsc::Receiver<ClientEvent>,
        watch::Sender<LinkState>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(LinkState::Connected);
        (
            Self {
                out_tx,
                state: state_rx,
            },
            out_rx,
            state_tx,
        )
    }

    /// Handle whose link is terminally failed; every send fails fast.
    pub(crate) fn failed_for_tests() -> Self {
        let (out_tx, _out_rx) = mpsc::channel(1);
        // A watch receiver keeps serving the last value after the sender
        // is gone, so Failed is permanent here
        let (_state_tx, state_rx) = watch::channel(LinkState::Failed);
        Self {
            out_tx,
            state: state_rx,
        }
    }
}

/// Drop everything still queued and count it.
fn drain_pending(out_rx: &mut mpsc::Receiver<ClientEvent>) -> u64 {
    let mut dropped = 0;
    while out_rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}
