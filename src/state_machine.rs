//! State machine for the live streaming controller
//!
//! This module implements the recording workflow using a single-writer
//! pattern. All state transitions go through the `reduce()` function, which
//! returns a new state and a list of effects to execute.

use std::time::Instant;
use uuid::Uuid;

/// User-facing notice shown when chunks are lost to a downed link.
pub const DISCONNECTED_NOTICE: &str = "WebSocket disconnected while recording.";

/// Internal state of the streaming workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    /// Waiting for the device-access grant; the capture is not live yet
    Arming {
        recording_id: Uuid,
    },
    Recording {
        recording_id: Uuid,
        started_at: Instant,
        /// Chunks lost to delivery gaps so far
        dropped_chunks: u64,
        /// User-visible condition (delivery gap, link failure); recording continues
        notice: Option<String>,
    },
    /// Stop requested; waiting for the device release to complete
    Stopping {
        recording_id: Uuid,
    },
    Error {
        message: String,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// Events that can trigger state transitions.
/// These arrive from the public API, the capture effects, and the channel.
#[derive(Debug, Clone)]
pub enum Event {
    /// User requested recording start
    StartRecording,
    /// User requested recording stop
    StopRecording,
    /// User requested cancel (same teardown as stop; kept separate for intent)
    Cancel,

    // Capture events
    CaptureStartOk {
        id: Uuid,
    },
    CaptureStartFail {
        id: Uuid,
        err: String,
    },
    CaptureStopped {
        id: Uuid,
    },
    CaptureStopFail {
        id: Uuid,
        err: String,
    },
    /// Device lost mid-recording (unplugged, access revoked)
    CaptureFailed {
        id: Uuid,
        err: String,
    },

    // Transport events
    /// One or more chunks were produced while the link was down
    DeliveryGap {
        dropped: u64,
    },
    /// The channel exhausted its reconnection attempts
    ChannelFailed {
        reason: String,
    },
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    StartCapture {
        id: Uuid,
    },
    StopCapture {
        id: Uuid,
    },
    /// Signal to publish a state snapshot to observers
    EmitState,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale recording IDs
/// - Always emit EmitState after state changes
/// - The device must end up released on every path that leaves Recording
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    // Helper: extract current recording_id (if any)
    let current_id: Option<Uuid> = match state {
        Idle | Error { .. } => None,
        Arming { recording_id } => Some(*recording_id),
        Recording { recording_id, .. } => Some(*recording_id),
        Stopping { recording_id } => Some(*recording_id),
    };

    // Helper: check if event's ID is stale (doesn't match current workflow)
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Idle / Error
        // -----------------
        (Idle, StartRecording) | (Error { .. }, StartRecording) => {
            let id = Uuid::new_v4();
            (
                Arming { recording_id: id },
                vec![StartCapture { id }, EmitState],
            )
        }
        (Idle, StopRecording) | (Idle, Cancel) => (Idle, vec![]),
        (Error { .. }, Cancel) => (Idle, vec![EmitState]),

        // -----------------
        // Arming
        // -----------------
        (Arming { recording_id }, CaptureStartOk { id }) if *recording_id == id => (
            Recording {
                recording_id: id,
                started_at: Instant::now(),
                dropped_chunks: 0,
                notice: None,
            },
            vec![EmitState],
        ),
        (Arming { recording_id }, CaptureStartFail { id, err }) if *recording_id == id => {
            (Error { message: err }, vec![EmitState])
        }
        (Arming { recording_id }, StopRecording) | (Arming { recording_id }, Cancel) => (
            Idle,
            vec![
                // Stop capture in case it started between the cancel and
                // CaptureStartOk; the runner treats a missing handle as done
                StopCapture { id: *recording_id },
                EmitState,
            ],
        ),

        // -----------------
        // Recording
        // -----------------
        (Recording { recording_id, .. }, StopRecording)
        | (Recording { recording_id, .. }, Cancel) => (
            Stopping {
                recording_id: *recording_id,
            },
            vec![StopCapture { id: *recording_id }, EmitState],
        ),
        // Chunks lost while the link is down: surface the condition, keep
        // recording and keep attempting delivery
        (
            Recording {
                recording_id,
                started_at,
                dropped_chunks,
                ..
            },
            DeliveryGap { dropped },
        ) => (
            Recording {
                recording_id: *recording_id,
                started_at: *started_at,
                dropped_chunks: dropped_chunks + dropped,
                notice: Some(DISCONNECTED_NOTICE.to_string()),
            },
            vec![EmitState],
        ),
        (
            Recording {
                recording_id,
                started_at,
                dropped_chunks,
                ..
            },
            ChannelFailed { reason },
        ) => (
            Recording {
                recording_id: *recording_id,
                started_at: *started_at,
                dropped_chunks: *dropped_chunks,
                notice: Some(format!("Connection to backend failed: {}", reason)),
            },
            vec![EmitState],
        ),
        // Device lost mid-recording: surface the error and force teardown so
        // the microphone is released no matter which side failed
        (Recording { recording_id, .. }, CaptureFailed { id, err }) if *recording_id == id => (
            Error { message: err },
            vec![StopCapture { id }, EmitState],
        ),

        // -----------------
        // Stopping
        // -----------------
        (Stopping { recording_id }, CaptureStopped { id }) if *recording_id == id => {
            (Idle, vec![EmitState])
        }
        (Stopping { recording_id }, CaptureStopFail { id, err }) if *recording_id == id => {
            (Error { message: err }, vec![EmitState])
        }
        (Stopping { recording_id }, CaptureFailed { id, err }) if *recording_id == id => {
            (Error { message: err }, vec![EmitState])
        }

        // -----------------
        // Terminal channel failure outside recording
        // -----------------
        (Idle, ChannelFailed { reason }) | (Error { .. }, ChannelFailed { reason }) => (
            Error {
                message: format!("Connection to backend failed: {}", reason),
            },
            vec![EmitState],
        ),

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, CaptureStartOk { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureStartFail { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureStopped { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureStopFail { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_state(id: Uuid) -> State {
        State::Recording {
            recording_id: id,
            started_at: Instant::now(),
            dropped_chunks: 0,
            notice: None,
        }
    }

    #[test]
    fn idle_start_transitions_to_arming() {
        let (next, effects) = reduce(&State::Idle, Event::StartRecording);
        assert!(matches!(next, State::Arming { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartCapture { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitState)));
    }

    #[test]
    fn arming_capture_ok_transitions_to_recording() {
        let id = Uuid::new_v4();
        let state = State::Arming { recording_id: id };
        let (next, effects) = reduce(&state, Event::CaptureStartOk { id });
        assert!(matches!(next, State::Recording { .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitState)));
    }

    #[test]
    fn arming_capture_fail_surfaces_error() {
        let id = Uuid::new_v4();
        let state = State::Arming { recording_id: id };
        let (next, _) = reduce(
            &state,
            Event::CaptureStartFail {
                id,
                err: "Microphone access denied".to_string(),
            },
        );
        assert!(matches!(next, State::Error { .. }));
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let stale_id = Uuid::new_v4();
        let state = State::Arming { recording_id: id };
        let (next, effects) = reduce(&state, Event::CaptureStartOk { id: stale_id });
        // Should stay in Arming, no effects
        assert!(matches!(next, State::Arming { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn error_start_transitions_to_arming() {
        let state = State::Error {
            message: "test error".to_string(),
        };
        let (next, effects) = reduce(&state, Event::StartRecording);
        assert!(matches!(next, State::Arming { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    // =========================================================================
    // Cancel semantics
    // =========================================================================

    #[test]
    fn cancel_during_arming_stops_capture_and_returns_to_idle() {
        let id = Uuid::new_v4();
        let state = State::Arming { recording_id: id };
        let (next, effects) = reduce(&state, Event::Cancel);

        assert!(matches!(next, State::Idle));
        // Should issue StopCapture in case the device opened late
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn late_start_ok_after_cancel_is_dropped() {
        let id = Uuid::new_v4();
        let state = State::Arming { recording_id: id };
        let (after_cancel, _) = reduce(&state, Event::Cancel);

        // The pending grant completes after the cancel; it must not
        // resurrect the recording
        let (next, effects) = reduce(&after_cancel, Event::CaptureStartOk { id });
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());
    }

    // =========================================================================
    // Recording: gaps, failures, stop
    // =========================================================================

    #[test]
    fn delivery_gap_keeps_recording_and_accumulates() {
        let id = Uuid::new_v4();
        let (next, _) = reduce(&recording_state(id), Event::DeliveryGap { dropped: 2 });

        match next {
            State::Recording {
                dropped_chunks,
                notice,
                ..
            } => {
                assert_eq!(dropped_chunks, 2);
                assert_eq!(notice.as_deref(), Some(DISCONNECTED_NOTICE));
            }
            other => panic!("Expected Recording, got {:?}", other),
        }
    }

    #[test]
    fn channel_failure_during_recording_does_not_stop_it() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording_state(id),
            Event::ChannelFailed {
                reason: "attempts exhausted".to_string(),
            },
        );

        // No automatic stop: the recording continues with a visible notice
        assert!(matches!(next, State::Recording { notice: Some(_), .. }));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn capture_failure_during_recording_releases_device() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording_state(id),
            Event::CaptureFailed {
                id,
                err: "device disconnected".to_string(),
            },
        );

        assert!(matches!(next, State::Error { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn stop_goes_through_stopping_to_idle() {
        let id = Uuid::new_v4();
        let (stopping, effects) = reduce(&recording_state(id), Event::StopRecording);
        assert!(matches!(stopping, State::Stopping { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));

        let (next, _) = reduce(&stopping, Event::CaptureStopped { id });
        assert!(matches!(next, State::Idle));
    }

    #[test]
    fn stop_failure_surfaces_error() {
        let id = Uuid::new_v4();
        let state = State::Stopping { recording_id: id };
        let (next, _) = reduce(
            &state,
            Event::CaptureStopFail {
                id,
                err: "stream teardown failed".to_string(),
            },
        );
        assert!(matches!(next, State::Error { .. }));
    }

    #[test]
    fn delivery_gap_outside_recording_is_ignored() {
        let (next, effects) = reduce(&State::Idle, Event::DeliveryGap { dropped: 1 });
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn channel_failure_while_idle_surfaces_error() {
        let (next, _) = reduce(
            &State::Idle,
            Event::ChannelFailed {
                reason: "attempts exhausted".to_string(),
            },
        );
        assert!(matches!(next, State::Error { .. }));
    }
}
