//! meetscribe: streaming client for live meeting transcription
//!
//! The client side of the meeting-transcription product: a reconnecting
//! bidirectional channel to the backend, a live microphone pipeline, a
//! file-upload pipeline, and a small model-catalog client.
//!
//! [`Session`] wires the pieces together: it owns the single shared channel,
//! drives the streaming controller's state machine, applies backend status
//! reports to the upload registry, and publishes state snapshots over a
//! watch channel so observers subscribe instead of polling.

pub mod audio;
pub mod effects;
pub mod metrics;
pub mod models;
pub mod settings;
pub mod state_machine;
pub mod streaming;
pub mod upload;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use effects::{CaptureEffectRunner, EffectRunner};
use metrics::{MetricsCollector, MetricsSummary};
use settings::AppSettings;
use state_machine::{reduce, Effect, Event, State};
use streaming::{Channel, ChannelEvent, ServerEvent, TransportError};
use upload::{FileState, UploadError, UploadManager, UploadedFile};

/// Capacity of the controller event queue
const EVENT_QUEUE: usize = 32;

/// Capacity of the inbound observer queue
const INBOUND_QUEUE: usize = 100;

/// Observable snapshot of the streaming controller.
/// Tagged union format: `{ "status": "idle" }` or
/// `{ "status": "recording", "elapsedSecs": 5, ... }`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Arming,
    Recording {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
        #[serde(rename = "droppedChunks")]
        dropped_chunks: u64,
        notice: Option<String>,
    },
    Stopping,
    Error {
        message: String,
    },
}

/// Convert internal controller state to an observer snapshot
fn snapshot(state: &State) -> SessionState {
    match state {
        State::Idle => SessionState::Idle,
        State::Arming { .. } => SessionState::Arming,
        State::Recording {
            started_at,
            dropped_chunks,
            notice,
            ..
        } => SessionState::Recording {
            elapsed_secs: started_at.elapsed().as_secs(),
            dropped_chunks: *dropped_chunks,
            notice: notice.clone(),
        },
        State::Stopping { .. } => SessionState::Stopping,
        State::Error { message } => SessionState::Error {
            message: message.clone(),
        },
    }
}

/// A connected client session.
///
/// Owns the shared backend channel; the live streaming path and the upload
/// path both go through it. Dropping the session tears everything down.
pub struct Session {
    events_tx: mpsc::Sender<Event>,
    state_rx: watch::Receiver<SessionState>,
    uploads: Arc<Mutex<UploadManager>>,
    metrics: Arc<Mutex<MetricsCollector>>,
    inbound_rx: Option<mpsc::Receiver<ServerEvent>>,
    channel: Option<Channel>,
    loop_task: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Connect to the backend and start the session loop.
    pub async fn connect(settings: &AppSettings) -> Result<Self, TransportError> {
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let channel = Channel::connect(settings.channel_config()).await?;
        let runner: Arc<dyn EffectRunner> = CaptureEffectRunner::new(
            channel.handle(),
            settings.streamer_config(),
            metrics.clone(),
        );
        Self::build(channel, runner, metrics)
    }

    /// Same wiring with a caller-provided effect runner.
    ///
    /// Lets tests and simulations drive the full session loop without audio
    /// hardware.
    pub async fn connect_with_runner(
        settings: &AppSettings,
        runner: Arc<dyn EffectRunner>,
    ) -> Result<Self, TransportError> {
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let channel = Channel::connect(settings.channel_config()).await?;
        Self::build(channel, runner, metrics)
    }

    fn build(
        mut channel: Channel,
        runner: Arc<dyn EffectRunner>,
        metrics: Arc<Mutex<MetricsCollector>>,
    ) -> Result<Self, TransportError> {
        let channel_events = channel.take_events().ok_or_else(|| {
            TransportError::ProtocolError("channel events already taken".to_string())
        })?;

        let uploads = Arc::new(Mutex::new(UploadManager::new(channel.handle())));
        let (events_tx, events_rx) = mpsc::channel::<Event>(EVENT_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerEvent>(INBOUND_QUEUE);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let loop_task = tokio::spawn(run_session_loop(
            events_rx,
            events_tx.clone(),
            runner,
            channel_events,
            uploads.clone(),
            metrics.clone(),
            state_tx,
            inbound_tx,
        ));

        Ok(Self {
            events_tx,
            state_rx,
            uploads,
            metrics,
            inbound_rx: Some(inbound_rx),
            channel: Some(channel),
            loop_task,
        })
    }

    /// Request recording start.
    pub async fn start_recording(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.events_tx.send(Event::StartRecording).await
    }

    /// Request recording stop. Synchronous from the caller's view; the
    /// device release completes asynchronously underneath.
    pub async fn stop_recording(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.events_tx.send(Event::StopRecording).await
    }

    /// Cancel the current recording (or a still-pending start).
    pub async fn cancel(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.events_tx.send(Event::Cancel).await
    }

    /// Watch receiver for state snapshots.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Take ownership of the inbound server-event receiver (transcripts,
    /// summaries, participants). Returns `None` if already taken.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.inbound_rx.take()
    }

    /// Upload a file over the shared channel.
    pub async fn upload(&self, path: &Path) -> Result<Uuid, UploadError> {
        self.metrics.lock().await.upload_started();

        let result = self.uploads.lock().await.upload(path).await;

        if let Err(e) = &result {
            let mut m = self.metrics.lock().await;
            m.upload_failed();
            m.record_error("upload", &e.to_string());
        }

        result
    }

    /// Remove a local upload record. Idempotent.
    pub async fn remove_upload(&self, id: Uuid) -> bool {
        self.uploads.lock().await.remove(id)
    }

    /// Snapshot of the upload registry.
    pub async fn uploaded_files(&self) -> Vec<UploadedFile> {
        self.uploads.lock().await.files()
    }

    /// Whether every upload has reached a terminal state.
    pub async fn uploads_settled(&self) -> bool {
        self.uploads.lock().await.all_settled()
    }

    /// Point-in-time metrics.
    pub async fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.lock().await.summary()
    }

    /// Tear the session down.
    pub async fn shutdown(mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.loop_task.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.loop_task.abort();
    }
}

/// The session loop: drives the reducer and folds channel events in.
#[allow(clippy::too_many_arguments)]
async fn run_session_loop(
    mut events_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    runner: Arc<dyn EffectRunner>,
    mut channel_events: mpsc::Receiver<ChannelEvent>,
    uploads: Arc<Mutex<UploadManager>>,
    metrics: Arc<Mutex<MetricsCollector>>,
    state_tx: watch::Sender<SessionState>,
    inbound_tx: mpsc::Sender<ServerEvent>,
) {
    let mut state = State::default();
    let mut channel_open = true;

    // Publish the initial state
    let _ = state_tx.send(snapshot(&state));
    log::info!("Session loop started");

    loop {
        tokio::select! {
            maybe_event = events_rx.recv() => {
                let Some(event) = maybe_event else {
                    break;
                };
                dispatch(&mut state, event, &runner, &events_tx, &state_tx);
            }
            maybe_channel_event = channel_events.recv(), if channel_open => {
                let Some(channel_event) = maybe_channel_event else {
                    // Supervisor gone without a Failed event: local close
                    channel_open = false;
                    continue;
                };
                if let Some(event) = handle_channel_event(
                    channel_event,
                    &uploads,
                    &metrics,
                    &inbound_tx,
                ).await {
                    dispatch(&mut state, event, &runner, &events_tx, &state_tx);
                }
            }
        }
    }

    log::info!("Session loop ended");
}

/// Apply one channel event; returns a controller event when one is implied.
async fn handle_channel_event(
    event: ChannelEvent,
    uploads: &Arc<Mutex<UploadManager>>,
    metrics: &Arc<Mutex<MetricsCollector>>,
    inbound_tx: &mpsc::Sender<ServerEvent>,
) -> Option<Event> {
    match event {
        ChannelEvent::Connected => {
            log::info!("Backend channel connected");
            None
        }
        ChannelEvent::Disconnected { reason } => {
            log::warn!("Backend channel disconnected: {}", reason);
            metrics.lock().await.record_error("transport", &reason);
            None
        }
        ChannelEvent::Reconnecting { attempt } => {
            log::info!("Backend channel reconnecting (attempt {})", attempt);
            metrics.lock().await.record_reconnect();
            None
        }
        ChannelEvent::ConnectError { message } => {
            log::warn!("Backend connection attempt failed: {}", message);
            metrics.lock().await.record_error("transport", &message);
            None
        }
        ChannelEvent::Failed { reason } => {
            metrics.lock().await.record_error("transport", &reason);
            Some(Event::ChannelFailed { reason })
        }
        ChannelEvent::DeliveryGap { dropped } => {
            metrics.lock().await.record_gap(dropped);
            Some(Event::DeliveryGap { dropped })
        }
        ChannelEvent::Message(server_event) => {
            match server_event {
                ServerEvent::FileStatus {
                    id,
                    status,
                    duration,
                } => {
                    let applied = uploads.lock().await.apply_status(id, status, duration);
                    if applied {
                        let mut m = metrics.lock().await;
                        match status {
                            FileState::Completed => m.upload_completed(),
                            FileState::Error => m.upload_failed(),
                            FileState::Processing => {}
                        }
                    }
                }
                other => {
                    if let Some(message) = other.error_message() {
                        metrics.lock().await.record_error("backend", message);
                    }
                    // Surface to the observer; a missing or slow observer
                    // must not stall the session loop
                    if let Err(mpsc::error::TrySendError::Full(_)) = inbound_tx.try_send(other) {
                        log::warn!("Inbound observer queue full, dropping server event");
                    }
                }
            }
            None
        }
    }
}

/// Run one reducer step and execute its effects.
fn dispatch(
    state: &mut State,
    event: Event,
    runner: &Arc<dyn EffectRunner>,
    events_tx: &mpsc::Sender<Event>,
    state_tx: &watch::Sender<SessionState>,
) {
    log::debug!("Event: {:?}", event);

    let old_discriminant = std::mem::discriminant(state);
    let (next, effects) = reduce(state, event);
    let new_discriminant = std::mem::discriminant(&next);

    if old_discriminant != new_discriminant {
        log::info!("State transition: {:?} -> {:?}", state, next);
    }

    *state = next;

    for effect in effects {
        match effect {
            Effect::EmitState => {
                let _ = state_tx.send(snapshot(state));
            }
            other => runner.spawn(other, events_tx.clone()),
        }
    }
}
