//! Microphone capture
//!
//! Wraps the platform's input-device access behind [`CaptureSource`]. The
//! capture produces PCM16 sample batches over a channel; the device is a
//! scoped resource released on every exit path via [`CaptureHandle`].

mod capture;

pub use capture::{CaptureError, CaptureHandle, CaptureSource};
