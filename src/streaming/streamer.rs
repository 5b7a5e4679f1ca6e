//! Chunk pipeline for live microphone streaming
//!
//! Bridges the CPAL audio callback (sync) to the backend channel (async).
//! Receives raw sample batches, downsamples to the backend rate, cuts
//! fixed-cadence chunks, and forwards them in production order.
//!
//! A chunk that cannot be delivered because the link is down is counted and
//! reported through the gap channel; the stream itself keeps running, so
//! recording survives a disconnected backend.

use tokio::sync::mpsc;

use super::channel::ChannelHandle;
use super::protocol::ClientEvent;
use super::TransportError;

/// Configuration for the chunk pipeline
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Source sample rate from CPAL (typically 48000)
    pub source_sample_rate: u32,
    /// Sample rate the backend expects
    pub target_sample_rate: u32,
    /// Chunk cadence in milliseconds
    pub chunk_duration_ms: u32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: 48_000,
            target_sample_rate: 16_000,
            chunk_duration_ms: 250,
        }
    }
}

impl StreamerConfig {
    /// Samples per chunk at the target sample rate
    pub fn samples_per_chunk(&self) -> usize {
        (self.target_sample_rate * self.chunk_duration_ms / 1000) as usize
    }
}

/// Outcome of a finished stream
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    /// Chunks delivered to the channel
    pub chunks_sent: u64,
    /// Chunks produced while the link was down (reported, not silently lost)
    pub chunks_dropped: u64,
}

/// Streams capture output to the backend channel.
///
/// The streamer borrows the shared channel handle and runs the complete
/// pipeline: receive samples → downsample → cut chunks → send in order.
pub struct ChunkStreamer {
    config: StreamerConfig,
    rx: mpsc::Receiver<Vec<i16>>,
    channel: ChannelHandle,
    /// Per-chunk delivery-gap reports for the controller
    gap_tx: mpsc::Sender<u64>,
    /// Accumulator for building fixed-cadence chunks
    buffer: Vec<i16>,
    samples_per_chunk: usize,
    stats: StreamStats,
}

impl ChunkStreamer {
    /// Create a new streamer over an established channel.
    ///
    /// # Arguments
    /// * `channel` - Sending handle of the shared backend channel
    /// * `rx` - Receiver end of the capture samples channel
    /// * `gap_tx` - Receives a count for every chunk lost to a downed link
    /// * `config` - Sample rates and chunk cadence
    pub fn new(
        channel: ChannelHandle,
        rx: mpsc::Receiver<Vec<i16>>,
        gap_tx: mpsc::Sender<u64>,
        config: StreamerConfig,
    ) -> Self {
        let samples_per_chunk = config.samples_per_chunk();
        log::info!(
            "ChunkStreamer: initialized ({}Hz → {}Hz, {}ms chunks = {} samples)",
            config.source_sample_rate,
            config.target_sample_rate,
            config.chunk_duration_ms,
            samples_per_chunk
        );

        Self {
            config,
            rx,
            channel,
            gap_tx,
            buffer: Vec::with_capacity(samples_per_chunk * 2),
            samples_per_chunk,
            stats: StreamStats::default(),
        }
    }

    /// Run the streaming loop until the capture channel closes.
    ///
    /// When the capture side stops, any remaining buffered samples go out as
    /// a final partial chunk followed by exactly one end-of-stream marker.
    /// Delivery failures never abort the loop; they are counted and reported.
    pub async fn run(mut self) -> StreamStats {
        log::info!("ChunkStreamer: starting streaming loop");

        while let Some(samples) = self.rx.recv().await {
            self.process_samples(samples).await;
        }

        // Capture stopped - flush the final partial chunk
        if !self.buffer.is_empty() {
            log::debug!(
                "ChunkStreamer: sending final partial chunk ({} samples)",
                self.buffer.len()
            );
            self.send_chunk().await;
        }

        // Signal end of stream; a failure here still ends the stream
        if let Err(e) = self.channel.send(ClientEvent::audio_stream_end()) {
            log::warn!("ChunkStreamer: failed to send end-of-stream marker: {}", e);
        }

        log::info!(
            "ChunkStreamer: streaming complete, {} chunks sent, {} dropped",
            self.stats.chunks_sent,
            self.stats.chunks_dropped
        );

        self.stats
    }

    /// Process one batch of samples from the audio callback.
    async fn process_samples(&mut self, samples: Vec<i16>) {
        let downsampled = downsample(
            &samples,
            self.config.source_sample_rate,
            self.config.target_sample_rate,
        );

        self.buffer.extend(downsampled);

        while self.buffer.len() >= self.samples_per_chunk {
            self.send_chunk().await;
        }
    }

    /// Cut one chunk off the buffer and forward it.
    async fn send_chunk(&mut self) {
        let chunk_size = self.buffer.len().min(self.samples_per_chunk);
        let chunk: Vec<i16> = self.buffer.drain(..chunk_size).collect();

        match self.channel.send(ClientEvent::audio_stream(&chunk)) {
            Ok(()) => {
                self.stats.chunks_sent += 1;

                // Periodic logging (every 40 chunks = ~10 seconds)
                if self.stats.chunks_sent % 40 == 0 {
                    log::debug!("ChunkStreamer: sent {} chunks", self.stats.chunks_sent);
                }
            }
            Err(TransportError::NotConnected) => {
                // The gap must surface; the recording itself continues
                self.stats.chunks_dropped += 1;
                let _ = self.gap_tx.send(1).await;
            }
            Err(e) => {
                log::warn!("ChunkStreamer: chunk delivery failed: {}", e);
                self.stats.chunks_dropped += 1;
                let _ = self.gap_tx.send(1).await;
            }
        }
    }
}

/// Downsample audio from source rate to target rate using simple averaging
///
/// Supports integer ratios only (e.g. 48kHz → 16kHz); other ratios return
/// the input unchanged.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;

    samples
        .chunks(ratio)
        .map(|chunk| {
            // i64 accumulator so a full chunk can't overflow
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streamer_config_default() {
        let config = StreamerConfig::default();
        assert_eq!(config.source_sample_rate, 48_000);
        assert_eq!(config.target_sample_rate, 16_000);
        assert_eq!(config.chunk_duration_ms, 250);
    }

    #[test]
    fn samples_per_chunk() {
        let config = StreamerConfig::default();
        // 16000 Hz * 250ms / 1000 = 4000 samples
        assert_eq!(config.samples_per_chunk(), 4000);

        let config = StreamerConfig {
            target_sample_rate: 8000,
            chunk_duration_ms: 100,
            ..Default::default()
        };
        // 8000 Hz * 100ms / 1000 = 800 samples
        assert_eq!(config.samples_per_chunk(), 800);
    }

    #[test]
    fn downsample_3x() {
        // 48kHz → 16kHz (3:1)
        let input = vec![100i16, 200, 300, 400, 500, 600];
        let output = downsample(&input, 48_000, 16_000);

        assert_eq!(output.len(), 2);
        assert_eq!(output[0], 200); // (100 + 200 + 300) / 3
        assert_eq!(output[1], 500); // (400 + 500 + 600) / 3
    }

    #[test]
    fn downsample_same_rate_is_identity() {
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 16_000, 16_000), input);
    }

    #[test]
    fn downsample_unsupported_ratio_returns_original() {
        // 44.1kHz → 16kHz is not an integer ratio
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 44_100, 16_000), input);
    }

    #[test]
    fn downsample_zero_rate_returns_original() {
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 48_000, 0), input);
        assert_eq!(downsample(&input, 0, 16_000), input);
    }

    #[tokio::test]
    async fn capture_channel_close_ends_loop() {
        // Closing the sample channel must end the run loop promptly; the full
        // pipeline is exercised in the integration tests.
        let (tx, rx) = mpsc::channel::<Vec<i16>>(10);
        drop(tx);

        let mut rx = rx;
        assert!(rx.recv().await.is_none());
    }
}
