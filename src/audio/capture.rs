//! # Capture Encoder
//!
//! Microphone → block-average downsample → 16-bit PCM → one outbound chunk per
//! device callback.
//!
//! ## Contexts:
//! - **Capture callback** ([`CaptureProcessor`]): owns the scratch buffer and the
//!   producer ends of the handoff rings. Never allocates, locks or logs.
//! - **Control context** ([`CaptureEncoder`]): opens and releases the device and
//!   collects finished chunks with [`CaptureEncoder::take_chunk`].
//!
//! ## Buffer Pool:
//! Chunk buffers are pre-allocated when capture starts and circulate between the
//! two contexts over a pair of SPSC rings: `free` (control → callback) and
//! `filled` (callback → control). When the callback finds no free buffer the
//! frame is dropped and counted instead of allocating.

use super::device::{ActiveStream, InputCallback, InputDevice};
use super::frame::{AudioFrame, EncodedChunk};
use super::{pcm, resampler};
use crate::config::AudioConfig;
use crate::error::AppResult;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Capture lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Capturing,
}

/// Capture tuning taken from [`AudioConfig`].
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Rate of the PCM sent to the server
    pub target_rate: u32,
    /// Number of chunk buffers in circulation
    pub pool_size: usize,
    /// Largest callback block the buffers are sized for
    pub max_block_frames: usize,
}

impl From<&AudioConfig> for CaptureConfig {
    fn from(audio: &AudioConfig) -> Self {
        Self {
            target_rate: audio.capture_target_rate,
            pool_size: audio.capture_pool_size.max(1),
            max_block_frames: audio.max_block_frames.max(1),
        }
    }
}

/// Counters bumped from the capture callback.
#[derive(Debug, Default)]
struct CaptureStats {
    frames_processed: AtomicU64,
    chunks_produced: AtomicU64,
    frames_dropped: AtomicU64,
    frames_ignored: AtomicU64,
}

/// Point-in-time copy of the capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStatsSnapshot {
    pub frames_processed: u64,
    pub chunks_produced: u64,
    /// Frames lost because no pooled buffer was free
    pub frames_dropped: u64,
    /// Non-mono frames that were skipped
    pub frames_ignored: u64,
}

impl CaptureStats {
    fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            chunks_produced: self.chunks_produced.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
        }
    }
}

/// Callback-side half of the encoder.
pub struct CaptureProcessor {
    target_rate: u32,
    scratch: Vec<f32>,
    free: HeapCons<Vec<u8>>,
    filled: HeapProd<Vec<u8>>,
    stats: Arc<CaptureStats>,
}

impl CaptureProcessor {
    /// Process one device frame into at most one filled chunk buffer.
    pub fn process(&mut self, frame: AudioFrame<'_>) {
        if !frame.is_mono() {
            self.stats.frames_ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(mut buffer) = self.free.try_pop() else {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        resampler::downsample_block_average(
            frame.samples,
            frame.sample_rate,
            self.target_rate,
            &mut self.scratch,
        );

        buffer.clear();
        pcm::encode_into(&self.scratch, &mut buffer);

        // Both rings are sized to the whole pool, so this cannot be full.
        let _ = self.filled.try_push(buffer);

        self.stats.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.stats.chunks_produced.fetch_add(1, Ordering::Relaxed);
    }
}

/// Control-side ends of a running capture pipeline.
struct Outbox {
    stream: ActiveStream,
    filled: HeapCons<Vec<u8>>,
    free: HeapProd<Vec<u8>>,
}

/// Microphone capture engine.
///
/// ## State Machine:
/// `Idle --start--> Capturing --stop--> Idle`. Repeated `start` or `stop` calls
/// are no-ops. A failed `start` leaves the encoder `Idle` and is not retried.
pub struct CaptureEncoder {
    config: CaptureConfig,
    device: Box<dyn InputDevice>,
    state: CaptureState,
    outbox: Option<Outbox>,
    stats: Arc<CaptureStats>,
}

impl CaptureEncoder {
    /// Idle encoder; the device is opened on `start`.
    pub fn new(config: CaptureConfig, device: Box<dyn InputDevice>) -> Self {
        Self {
            config,
            device,
            state: CaptureState::Idle,
            outbox: None,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Counters since the encoder was created.
    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.stats.snapshot()
    }

    /// Acquire the microphone and start producing chunks.
    pub fn start(&mut self) -> AppResult<()> {
        if self.state == CaptureState::Capturing {
            debug!("Capture already running");
            return Ok(());
        }

        let pool_size = self.config.pool_size;
        let chunk_bytes = self.config.max_block_frames * 2;

        let (mut free_prod, free_cons) = HeapRb::<Vec<u8>>::new(pool_size).split();
        let (filled_prod, filled_cons) = HeapRb::<Vec<u8>>::new(pool_size).split();
        for _ in 0..pool_size {
            let _ = free_prod.try_push(Vec::with_capacity(chunk_bytes));
        }

        let mut processor = CaptureProcessor {
            target_rate: self.config.target_rate,
            scratch: Vec::with_capacity(self.config.max_block_frames),
            free: free_cons,
            filled: filled_prod,
            stats: self.stats.clone(),
        };
        let callback: InputCallback = Box::new(move |frame| processor.process(frame));

        let stream = match self.device.open_input(callback) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Microphone unavailable, capture stays idle");
                return Err(e);
            }
        };

        self.outbox = Some(Outbox {
            stream,
            filled: filled_cons,
            free: free_prod,
        });
        self.state = CaptureState::Capturing;

        info!(
            target_rate = self.config.target_rate,
            pool_size, "Capture started"
        );
        Ok(())
    }

    /// Release the microphone. Chunks not yet collected are discarded.
    pub fn stop(&mut self) {
        if self.state == CaptureState::Idle {
            return;
        }

        if let Some(outbox) = self.outbox.take() {
            let pending = outbox.filled.occupied_len();
            drop(outbox.stream);
            if pending > 0 {
                debug!(pending, "Discarding uncollected capture chunks");
            }
        }

        self.state = CaptureState::Idle;
        info!(stats = ?self.stats.snapshot(), "Capture stopped");
    }

    /// Collect the next encoded chunk, oldest first.
    ///
    /// The pooled buffer is copied out and recycled to the callback. Chunks
    /// from callbacks too short to yield a sample are skipped.
    pub fn take_chunk(&mut self) -> Option<EncodedChunk> {
        let outbox = self.outbox.as_mut()?;

        while let Some(mut buffer) = outbox.filled.try_pop() {
            let chunk = (!buffer.is_empty()).then(|| EncodedChunk::new(buffer.clone()));
            buffer.clear();
            let _ = outbox.free.try_push(buffer);

            if chunk.is_some() {
                return chunk;
            }
        }

        None
    }
}

impl Drop for CaptureEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::super::device::testing::ManualInput;
    use super::*;
    use crate::error::KioskError;

    fn encoder(input: &ManualInput, pool_size: usize) -> CaptureEncoder {
        let config = CaptureConfig {
            target_rate: 16_000,
            pool_size,
            max_block_frames: 4096,
        };
        CaptureEncoder::new(config, Box::new(input.clone()))
    }

    #[test]
    fn test_constant_frame_encodes_to_expected_bytes() {
        let input = ManualInput::new();
        let mut encoder = encoder(&input, 4);
        encoder.start().unwrap();

        let samples = vec![0.5f32; 3072];
        assert!(input.feed(AudioFrame::mono(&samples, 48_000)));

        let chunk = encoder.take_chunk().expect("one chunk per callback");
        assert_eq!(chunk.sample_count(), 1024);
        assert!(chunk.as_bytes().chunks(2).all(|pair| pair == [0x00, 0x40]));
        assert!(encoder.take_chunk().is_none());
    }

    #[test]
    fn test_one_chunk_per_callback() {
        let input = ManualInput::new();
        let mut encoder = encoder(&input, 8);
        encoder.start().unwrap();

        let samples = vec![0.1f32; 480];
        for _ in 0..3 {
            input.feed(AudioFrame::mono(&samples, 48_000));
        }

        let chunks: Vec<_> = std::iter::from_fn(|| encoder.take_chunk()).collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.sample_count() == 160));
        assert_eq!(encoder.stats().chunks_produced, 3);
    }

    #[test]
    fn test_exhausted_pool_drops_frames() {
        let input = ManualInput::new();
        let mut encoder = encoder(&input, 2);
        encoder.start().unwrap();

        let samples = vec![0.0f32; 480];
        for _ in 0..5 {
            input.feed(AudioFrame::mono(&samples, 48_000));
        }

        let stats = encoder.stats();
        assert_eq!(stats.chunks_produced, 2);
        assert_eq!(stats.frames_dropped, 3);

        // collecting recycles the buffers
        assert!(encoder.take_chunk().is_some());
        input.feed(AudioFrame::mono(&samples, 48_000));
        assert_eq!(encoder.stats().chunks_produced, 3);
    }

    #[test]
    fn test_stereo_frames_are_ignored() {
        let input = ManualInput::new();
        let mut encoder = encoder(&input, 2);
        encoder.start().unwrap();

        let samples = vec![0.3f32; 960];
        input.feed(AudioFrame {
            samples: &samples,
            sample_rate: 48_000,
            channels: 2,
        });

        assert!(encoder.take_chunk().is_none());
        assert_eq!(encoder.stats().frames_ignored, 1);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let input = ManualInput::new();
        let mut encoder = encoder(&input, 2);

        encoder.stop();
        assert_eq!(encoder.state(), CaptureState::Idle);

        encoder.start().unwrap();
        encoder.start().unwrap();
        assert_eq!(input.open_count(), 1);
        assert_eq!(encoder.state(), CaptureState::Capturing);

        encoder.stop();
        encoder.stop();
        assert_eq!(encoder.state(), CaptureState::Idle);
        assert!(!input.is_open());
        assert!(encoder.take_chunk().is_none());
    }

    #[test]
    fn test_device_failure_leaves_encoder_idle() {
        let input = ManualInput::new();
        input.set_failing(true);
        let mut encoder = encoder(&input, 2);

        let result = encoder.start();
        assert!(matches!(result, Err(KioskError::DeviceUnavailable(_))));
        assert_eq!(encoder.state(), CaptureState::Idle);

        input.set_failing(false);
        encoder.start().unwrap();
        assert_eq!(encoder.state(), CaptureState::Capturing);
    }
}
