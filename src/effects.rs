//! Effect runner for the streaming controller
//!
//! Executes the effects produced by the state machine: opening and releasing
//! the capture device, and running the chunk pipeline that feeds the shared
//! backend channel. Completion is reported back as events over the
//! controller's channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{CaptureError, CaptureSource};
use crate::metrics::MetricsCollector;
use crate::state_machine::{Effect, Event};
use crate::streaming::{ChannelHandle, ChunkStreamer, StreamStats, StreamerConfig};

/// Capacity of the capture-to-streamer sample queue
const SAMPLE_QUEUE: usize = 100;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Book-keeping for one live capture.
///
/// The cancellation token covers the window between a stop request and a
/// still-pending device grant: a stop that arrives first leaves a cancelled
/// marker, and the late-completing start releases the device immediately
/// instead of leaking a live microphone.
struct ActiveCapture {
    handle: Option<crate::audio::CaptureHandle>,
    streamer: Option<tokio::task::JoinHandle<StreamStats>>,
    cancel: CancellationToken,
}

/// Real effect runner: CPAL capture feeding the backend channel.
pub struct CaptureEffectRunner {
    channel: ChannelHandle,
    chunking: StreamerConfig,
    active: Arc<Mutex<HashMap<Uuid, ActiveCapture>>>,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl CaptureEffectRunner {
    pub fn new(
        channel: ChannelHandle,
        chunking: StreamerConfig,
        metrics: Arc<Mutex<MetricsCollector>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            chunking,
            active: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        })
    }
}

impl EffectRunner for CaptureEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartCapture { id } => {
                let channel = self.channel.clone();
                let chunking = self.chunking.clone();
                let active = self.active.clone();
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    let (samples_tx, samples_rx) = mpsc::channel::<Vec<i16>>(SAMPLE_QUEUE);
                    let (failure_tx, mut failure_rx) = mpsc::channel::<CaptureError>(4);

                    // Device access blocks; keep it off the async workers
                    let start_result = tokio::task::spawn_blocking(move || {
                        let source = CaptureSource::new()?;
                        let rate = source.sample_rate();
                        let handle = source.start(samples_tx, failure_tx)?;
                        Ok::<_, CaptureError>((handle, rate))
                    })
                    .await
                    .unwrap_or_else(|e| {
                        Err(CaptureError::DeviceUnavailable(format!(
                            "capture task failed: {}",
                            e
                        )))
                    });

                    match start_result {
                        Ok((handle, source_rate)) => {
                            let (gap_tx, mut gap_rx) = mpsc::channel::<u64>(SAMPLE_QUEUE);
                            let config = StreamerConfig {
                                source_sample_rate: source_rate,
                                ..chunking
                            };

                            let streamer =
                                ChunkStreamer::new(channel, samples_rx, gap_tx, config);
                            let metrics_for_stats = metrics.clone();
                            let streamer_task = tokio::spawn(async move {
                                let stats = streamer.run().await;
                                metrics_for_stats.lock().await.record_stream(stats);
                                stats
                            });

                            // Forward per-chunk delivery gaps to the controller
                            let gap_events = tx.clone();
                            let metrics_for_gaps = metrics.clone();
                            tokio::spawn(async move {
                                while let Some(dropped) = gap_rx.recv().await {
                                    metrics_for_gaps.lock().await.record_gap(dropped);
                                    if gap_events
                                        .send(Event::DeliveryGap { dropped })
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                            });

                            // Surface a device failure (unplug, revoked access)
                            let failure_events = tx.clone();
                            tokio::spawn(async move {
                                if let Some(err) = failure_rx.recv().await {
                                    let _ = failure_events
                                        .send(Event::CaptureFailed {
                                            id,
                                            err: err.to_string(),
                                        })
                                        .await;
                                }
                            });

                            // Register, honoring a stop that raced the start
                            {
                                let mut map = active.lock().await;
                                if map
                                    .get(&id)
                                    .map(|c| c.cancel.is_cancelled())
                                    .unwrap_or(false)
                                {
                                    map.remove(&id);
                                    drop(map);
                                    log::info!(
                                        "Capture {} stopped before start completed, releasing device",
                                        id
                                    );
                                    streamer_task.abort();
                                    let _ = tokio::task::spawn_blocking(move || handle.stop())
                                        .await;
                                    return;
                                }

                                map.insert(
                                    id,
                                    ActiveCapture {
                                        handle: Some(handle),
                                        streamer: Some(streamer_task),
                                        cancel: CancellationToken::new(),
                                    },
                                );
                            }

                            log::info!("Capture started for recording {}", id);
                            let _ = tx.send(Event::CaptureStartOk { id }).await;
                        }
                        Err(e) => {
                            log::error!("Failed to start capture: {}", e);
                            // Clear a cancelled marker left by a racing stop
                            active.lock().await.remove(&id);
                            metrics
                                .lock()
                                .await
                                .record_error("capture", &e.to_string());
                            let _ = tx
                                .send(Event::CaptureStartFail {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::StopCapture { id } => {
                let active = self.active.clone();

                tokio::spawn(async move {
                    let entry = { active.lock().await.remove(&id) };

                    let Some(mut capture) = entry else {
                        // Stop raced ahead of a still-pending start: leave a
                        // cancelled marker so the late starter releases the
                        // device immediately
                        let token = CancellationToken::new();
                        token.cancel();
                        active.lock().await.insert(
                            id,
                            ActiveCapture {
                                handle: None,
                                streamer: None,
                                cancel: token,
                            },
                        );
                        let _ = tx.send(Event::CaptureStopped { id }).await;
                        return;
                    };

                    capture.cancel.cancel();

                    if let Some(handle) = capture.handle.take() {
                        // Releases the device; the sample queue closes behind it
                        let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
                    }

                    // Wait for the pipeline to flush its final chunk and the
                    // end-of-stream marker
                    if let Some(streamer) = capture.streamer.take() {
                        match streamer.await {
                            Ok(stats) => {
                                log::info!(
                                    "Stream finished: {} chunks sent, {} dropped",
                                    stats.chunks_sent,
                                    stats.chunks_dropped
                                );
                            }
                            Err(e) => {
                                let _ = tx
                                    .send(Event::CaptureStopFail {
                                        id,
                                        err: format!("stream task failed: {}", e),
                                    })
                                    .await;
                                return;
                            }
                        }
                    }

                    let _ = tx.send(Event::CaptureStopped { id }).await;
                });
            }

            Effect::EmitState => {
                // Handled in the session loop, not here
                unreachable!("EmitState should be handled in the session loop");
            }
        }
    }
}

/// Stub effect runner for testing the session loop without audio hardware.
pub struct StubEffectRunner;

impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartCapture { id } => {
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    log::info!("Stub: capture started");
                    let _ = tx.send(Event::CaptureStartOk { id }).await;
                });
            }

            Effect::StopCapture { id } => {
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    log::info!("Stub: capture stopped");
                    let _ = tx.send(Event::CaptureStopped { id }).await;
                });
            }

            Effect::EmitState => {
                unreachable!("EmitState should be handled in the session loop");
            }
        }
    }
}
