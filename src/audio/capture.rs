//! Microphone capture using CPAL
//!
//! The CaptureSource opens the default input device and forwards PCM16
//! sample batches over a channel. The CPAL stream lives on a dedicated
//! audio thread (streams cannot move between threads); the handle returned
//! from `start()` is the scoped owner of the device and releases it on
//! `stop()` and on drop, so no exit path leaves the microphone engaged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

/// How long to wait for the audio thread to report stream startup
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during microphone capture.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// The platform refused access to the input device
    PermissionDenied(String),
    /// No usable input device, or the device went away
    DeviceUnavailable(String),
    /// The device's sample format cannot be turned into PCM16 chunks
    EncodingError(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::PermissionDenied(e) => {
                write!(f, "Microphone access denied: {}", e)
            }
            CaptureError::DeviceUnavailable(e) => {
                write!(f, "Audio input device unavailable: {}", e)
            }
            CaptureError::EncodingError(e) => {
                write!(f, "Cannot encode captured audio: {}", e)
            }
        }
    }
}

impl std::error::Error for CaptureError {}

/// Classify a backend-specific error string.
///
/// CPAL folds OS-level access failures into backend-specific errors, so the
/// description is the only signal separating a denied microphone from a
/// missing one.
fn classify_backend_error(description: &str) -> CaptureError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("access") {
        CaptureError::PermissionDenied(description.to_string())
    } else {
        CaptureError::DeviceUnavailable(description.to_string())
    }
}

fn map_stream_error(err: cpal::StreamError) -> CaptureError {
    match err {
        cpal::StreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("device disconnected".to_string())
        }
        cpal::StreamError::BackendSpecific { err } => classify_backend_error(&err.description),
        other => CaptureError::DeviceUnavailable(other.to_string()),
    }
}

/// Handle to an active capture.
///
/// Owns the audio thread that owns the CPAL stream. Stopping (or dropping)
/// the handle tears the stream down and releases the device.
pub struct CaptureHandle {
    active: Arc<AtomicBool>,
    stop_tx: std::sync::mpsc::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capturing and release the device.
    pub fn stop(mut self) {
        self.shutdown();
        log::info!("Capture stopped, device released");
    }

    fn shutdown(&mut self) {
        // Gate the callback first so no further batches are produced while
        // the stream teardown is in flight
        self.active.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Microphone capture source over the default input device.
pub struct CaptureSource {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl CaptureSource {
    /// Open the default input device.
    pub fn new() -> Result<Self, CaptureError> {
        let host = cpal::default_host();

        let device = host.default_input_device().ok_or_else(|| {
            CaptureError::DeviceUnavailable("no audio input device found".to_string())
        })?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable("device not available".to_string())
            }
            cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                CaptureError::EncodingError("input stream type not supported".to_string())
            }
            cpal::DefaultStreamConfigError::BackendSpecific { err } => {
                classify_backend_error(&err.description)
            }
            other => CaptureError::DeviceUnavailable(other.to_string()),
        })?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        Ok(Self {
            device,
            config,
            sample_format,
        })
    }

    /// Sample rate the device captures at.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Start capturing.
    ///
    /// Sample batches go out on `samples_tx`; a device failure after startup
    /// (unplugged, access revoked) is reported once on `failure_tx`.
    ///
    /// Blocks briefly while the audio thread opens the stream; call from a
    /// blocking-friendly context.
    pub fn start(
        &self,
        samples_tx: mpsc::Sender<Vec<i16>>,
        failure_tx: mpsc::Sender<CaptureError>,
    ) -> Result<CaptureHandle, CaptureError> {
        let active = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), CaptureError>>(1);

        let device = self.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let callback_active = active.clone();

        let thread = std::thread::spawn(move || {
            match build_stream(
                &device,
                &config,
                sample_format,
                samples_tx,
                failure_tx,
                callback_active,
            ) {
                Ok(stream) => {
                    if let Err(e) = stream.play() {
                        let mapped = match e {
                            cpal::PlayStreamError::DeviceNotAvailable => {
                                CaptureError::DeviceUnavailable("device not available".to_string())
                            }
                            cpal::PlayStreamError::BackendSpecific { err } => {
                                classify_backend_error(&err.description)
                            }
                            other => CaptureError::DeviceUnavailable(other.to_string()),
                        };
                        let _ = ready_tx.send(Err(mapped));
                        return;
                    }

                    let _ = ready_tx.send(Ok(()));

                    // The stream (and the device handle underneath it) lives
                    // for exactly this scope
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("Audio thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => {
                log::info!("Capture started");
                Ok(CaptureHandle {
                    active,
                    stop_tx,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::DeviceUnavailable(
                "capture thread did not start".to_string(),
            )),
        }
    }
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    samples_tx: mpsc::Sender<Vec<i16>>,
    failure_tx: mpsc::Sender<CaptureError>,
    active: Arc<AtomicBool>,
) -> Result<Stream, CaptureError> {
    match sample_format {
        SampleFormat::I16 => {
            build_stream_typed::<i16>(device, config, samples_tx, failure_tx, active)
        }
        SampleFormat::U16 => {
            build_stream_typed::<u16>(device, config, samples_tx, failure_tx, active)
        }
        SampleFormat::F32 => {
            build_stream_typed::<f32>(device, config, samples_tx, failure_tx, active)
        }
        other => Err(CaptureError::EncodingError(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    samples_tx: mpsc::Sender<Vec<i16>>,
    failure_tx: mpsc::Sender<CaptureError>,
    active: Arc<AtomicBool>,
) -> Result<Stream, CaptureError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Audio stream error: {}", err);
        let _ = failure_tx.try_send(map_stream_error(err));
    };

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::SeqCst) {
                    return;
                }

                let batch: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();

                // try_send: the callback must never block. A full queue means
                // the consumer is behind; the batch is dropped here and the
                // pipeline's own accounting covers delivery.
                if samples_tx.try_send(batch).is_err() {
                    log::warn!("Sample queue full, dropping capture batch");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable("device not available".to_string())
            }
            cpal::BuildStreamError::StreamConfigNotSupported => {
                CaptureError::EncodingError("stream config not supported".to_string())
            }
            cpal::BuildStreamError::InvalidArgument => {
                CaptureError::EncodingError("invalid stream argument".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } => {
                classify_backend_error(&err.description)
            }
            other => CaptureError::DeviceUnavailable(other.to_string()),
        })?;

    Ok(stream)
}

/// Convert any sample type to i16.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
