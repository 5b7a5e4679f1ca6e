//! Integration tests for the streaming pipeline
//!
//! These tests run the real channel and chunk pipeline against an
//! in-process WebSocket server, so they need no backend, no network access
//! beyond loopback, and no audio hardware.
//!
//! ```bash
//! cargo test --test streaming_integration
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use meetscribe::effects::StubEffectRunner;
use meetscribe::settings::AppSettings;
use meetscribe::streaming::{
    Channel, ChannelConfig, ChannelEvent, ChunkStreamer, LinkState, StreamerConfig, TransportError,
};
use meetscribe::upload::FileState;
use meetscribe::Session;

/// A single-threaded loopback WebSocket server.
///
/// Serves connections one at a time, forwards every received text frame as
/// parsed JSON, and (when `ack_uploads` is set) answers each `fileUpload`
/// with a completed `fileStatus`. Aborting the task drops the listener and
/// any live connection, which is how the tests simulate a dying backend.
struct TestServer {
    url: String,
    frames: mpsc::UnboundedReceiver<Value>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(ack_uploads: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, frames) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (mut write, mut read) = ws.split();

                while let Some(Ok(msg)) = read.next().await {
                    let Message::Text(text) = msg else { continue };
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let _ = tx.send(value.clone());

                    if ack_uploads && value["type"] == "fileUpload" {
                        let reply = serde_json::json!({
                            "type": "fileStatus",
                            "payload": {
                                "id": value["payload"]["id"],
                                "status": "completed",
                                "duration": 4.2,
                            }
                        });
                        let _ = write.send(Message::Text(reply.to_string())).await;
                    }
                }
            }
        });

        Self {
            url: format!("ws://{}", addr),
            frames,
            task,
        }
    }

    async fn next_frame(&mut self) -> Value {
        timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("server task ended")
    }

    fn no_more_frames(&mut self) -> bool {
        self.frames.try_recv().is_err()
    }

    /// Simulate the backend dying: listener and live connection both drop.
    fn kill(&self) {
        self.task.abort();
    }
}

fn fast_channel_config(url: &str) -> ChannelConfig {
    ChannelConfig {
        endpoint: url.to_string(),
        reconnect_attempts: 2,
        connect_timeout: Duration::from_millis(500),
        retry_base_delay: Duration::from_millis(10),
    }
}

/// Decode the first PCM16 sample of a base64 `audio_stream` payload.
fn first_sample(frame: &Value) -> i16 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let audio = frame["payload"]["audio"].as_str().expect("audio payload");
    let bytes = STANDARD.decode(audio).expect("valid base64");
    i16::from_le_bytes([bytes[0], bytes[1]])
}

// ============================================================================
// Chunk pipeline
// ============================================================================

#[tokio::test]
async fn chunks_arrive_in_order_then_a_single_end_marker() {
    let mut server = TestServer::spawn(false).await;
    let mut channel = Channel::connect(fast_channel_config(&server.url))
        .await
        .expect("connect");
    let _events = channel.take_events().unwrap();

    // Same source and target rate: 2000 samples = one 250ms chunk at 8kHz
    let config = StreamerConfig {
        source_sample_rate: 8_000,
        target_sample_rate: 8_000,
        chunk_duration_ms: 250,
    };
    let samples_per_chunk = config.samples_per_chunk();

    let (samples_tx, samples_rx) = mpsc::channel(16);
    let (gap_tx, mut gap_rx) = mpsc::channel(16);
    let streamer = ChunkStreamer::new(channel.handle(), samples_rx, gap_tx, config);
    let streamer_task = tokio::spawn(streamer.run());

    // Three chunks, each tagged by its first sample value
    for value in 1..=3i16 {
        samples_tx
            .send(vec![value; samples_per_chunk])
            .await
            .unwrap();
    }
    drop(samples_tx);

    let stats = streamer_task.await.unwrap();
    assert_eq!(stats.chunks_sent, 3);
    assert_eq!(stats.chunks_dropped, 0);

    // Exactly 3 audio_stream frames, in production order
    for expected in 1..=3i16 {
        let frame = server.next_frame().await;
        assert_eq!(frame["type"], "audio_stream");
        assert_eq!(first_sample(&frame), expected);
    }

    // Followed by exactly one end-of-stream marker
    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "audio_stream_end");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.no_more_frames());
    assert!(gap_rx.try_recv().is_err(), "no gaps on a healthy link");

    channel.close().await;
    server.kill();
}

#[tokio::test]
async fn partial_final_chunk_is_flushed_before_end_marker() {
    let mut server = TestServer::spawn(false).await;
    let mut channel = Channel::connect(fast_channel_config(&server.url))
        .await
        .expect("connect");
    let _events = channel.take_events().unwrap();

    let config = StreamerConfig {
        source_sample_rate: 8_000,
        target_sample_rate: 8_000,
        chunk_duration_ms: 250,
    };

    let (samples_tx, samples_rx) = mpsc::channel(16);
    let (gap_tx, _gap_rx) = mpsc::channel(16);
    let streamer = ChunkStreamer::new(channel.handle(), samples_rx, gap_tx, config);
    let streamer_task = tokio::spawn(streamer.run());

    // Half a chunk, then stop
    samples_tx.send(vec![7i16; 1000]).await.unwrap();
    drop(samples_tx);

    let stats = streamer_task.await.unwrap();
    assert_eq!(stats.chunks_sent, 1);

    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "audio_stream");
    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "audio_stream_end");

    channel.close().await;
    server.kill();
}

// ============================================================================
// Disconnection and delivery gaps
// ============================================================================

#[tokio::test]
async fn exhausted_reconnects_fail_the_channel_and_sends_fail_fast() {
    let server = TestServer::spawn(false).await;
    let mut channel = Channel::connect(fast_channel_config(&server.url))
        .await
        .expect("connect");
    let mut events = channel.take_events().unwrap();
    let handle = channel.handle();

    assert_eq!(handle.state(), LinkState::Connected);

    // Backend dies; the port is gone, so both reconnect attempts must fail
    server.kill();

    let failed = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Failed { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await
    .expect("timed out waiting for Failed event");
    assert!(failed);

    assert_eq!(handle.state(), LinkState::Failed);

    // Terminal state: every send fails fast, no further retry
    let result = handle.send(meetscribe::streaming::ClientEvent::audio_stream_end());
    assert!(matches!(result, Err(TransportError::NotConnected)));
}

#[tokio::test]
async fn chunks_produced_during_a_gap_are_all_reported() {
    let server = TestServer::spawn(false).await;
    let mut channel = Channel::connect(fast_channel_config(&server.url))
        .await
        .expect("connect");
    let _events = channel.take_events().unwrap();
    let handle = channel.handle();

    server.kill();

    // Wait for the supervisor to notice the dead link
    timeout(Duration::from_secs(5), async {
        while handle.state() == LinkState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("link never observed the disconnect");

    let config = StreamerConfig {
        source_sample_rate: 8_000,
        target_sample_rate: 8_000,
        chunk_duration_ms: 250,
    };
    let samples_per_chunk = config.samples_per_chunk();

    let (samples_tx, samples_rx) = mpsc::channel(16);
    let (gap_tx, mut gap_rx) = mpsc::channel(16);
    let streamer = ChunkStreamer::new(handle, samples_rx, gap_tx, config);
    let streamer_task = tokio::spawn(streamer.run());

    for value in 1..=3i16 {
        samples_tx
            .send(vec![value; samples_per_chunk])
            .await
            .unwrap();
    }
    drop(samples_tx);

    let stats = streamer_task.await.unwrap();

    // Nothing delivered, nothing silently lost: every chunk is accounted for
    assert_eq!(stats.chunks_sent, 0);
    assert_eq!(stats.chunks_dropped, 3);

    let mut reported = 0;
    while let Ok(dropped) = gap_rx.try_recv() {
        reported += dropped;
    }
    assert_eq!(reported, 3, "each dropped chunk produces a gap report");
}

// ============================================================================
// Session-level upload flow
// ============================================================================

#[tokio::test]
async fn upload_id_round_trips_and_status_reaches_completed() {
    let mut server = TestServer::spawn(true).await;

    let settings = AppSettings {
        server_url: server.url.clone(),
        ..Default::default()
    };
    let session = Session::connect_with_runner(&settings, StubEffectRunner::new())
        .await
        .expect("session connect");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, b"meeting recording bytes").unwrap();

    let id = session.upload(file.path()).await.expect("upload");

    // The wire message carries exactly the id the caller got back
    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "fileUpload");
    assert_eq!(frame["payload"]["id"], id.to_string());

    // The backend ack flows into the local registry
    timeout(Duration::from_secs(2), async {
        loop {
            let files = session.uploaded_files().await;
            if files
                .iter()
                .any(|f| f.id == id && f.status == FileState::Completed)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upload never reached completed");

    let files = session.uploaded_files().await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].duration, 4.2);

    // Removing is local-only and idempotent
    assert!(session.remove_upload(id).await);
    assert!(!session.remove_upload(id).await);
    assert!(session.uploaded_files().await.is_empty());

    session.shutdown().await;
    server.kill();
}

#[tokio::test]
async fn unreadable_file_sends_no_upload_message() {
    let mut server = TestServer::spawn(true).await;

    let settings = AppSettings {
        server_url: server.url.clone(),
        ..Default::default()
    };
    let session = Session::connect_with_runner(&settings, StubEffectRunner::new())
        .await
        .expect("session connect");

    let result = session
        .upload(std::path::Path::new("/nonexistent/standup.wav"))
        .await;
    assert!(result.is_err());

    let files = session.uploaded_files().await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].status, FileState::Error);

    // Nothing may have reached the wire
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.no_more_frames());

    session.shutdown().await;
    server.kill();
}
