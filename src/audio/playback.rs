//! # Playback Engine
//!
//! Server PCM → decode → ring buffer → fractional interpolation → speaker.
//!
//! ## Contexts:
//! - **Render callback** ([`PlaybackRenderer`]): owns the [`RingBuffer`] and the
//!   [`Interpolator`]. Applies queued chunks and flushes at the top of every
//!   callback, then fills the output block completely.
//! - **Control context** ([`PlaybackEngine`]): opens and releases the output
//!   device, enqueues chunks, requests flushes and reads published state.
//!
//! ## Handoff:
//! Chunks move to the render side through an SPSC command ring, tagged with the
//! flush epoch current at enqueue time. A flush bumps the epoch; the renderer
//! clears its ring when it sees a newer epoch and discards chunks carrying an
//! older one. Spent byte buffers travel back on a second ring so they are freed
//! in the control context.
//!
//! Underflow is not an error: the output is silence, the cursor stays where it
//! is and playback resumes as soon as more audio arrives.

use super::device::{ActiveStream, OutputDevice, RenderCallback};
use super::pcm;
use super::resampler::Interpolator;
use super::ring_buffer::RingBuffer;
use crate::config::AppConfig;
use crate::error::AppResult;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Playback lifecycle, published by both contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            _ => PlaybackState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PlaybackState::Idle => 0,
            PlaybackState::Playing => 1,
        }
    }
}

/// Playback tuning.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    /// Rate of the PCM the server sends
    pub source_rate: u32,
    /// Ring buffer capacity in source samples
    pub capacity: usize,
    /// Chunks that can wait for the next render callback
    pub queue_capacity: usize,
}

impl From<&AppConfig> for PlaybackConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            source_rate: config.audio.playback_source_rate,
            capacity: config.playback_capacity(),
            queue_capacity: config.audio.command_queue_capacity.max(1),
        }
    }
}

/// State shared between the engine and its renderer.
#[derive(Debug, Default)]
struct PlaybackShared {
    state: AtomicU8,
    /// `f64` bits of the ring buffer's valid count after the last callback
    available: AtomicU64,
    flush_epoch: AtomicU64,
    device_rate: AtomicU32,
    decoded_samples: AtomicU64,
    overwritten_samples: AtomicU64,
    underruns: AtomicU64,
    dropped_chunks: AtomicU64,
}

impl PlaybackShared {
    fn set_state(&self, state: PlaybackState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn publish_available(&self, available: f64) {
        self.available.store(available.to_bits(), Ordering::Release);
    }
}

/// Point-in-time copy of the playback counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlaybackStatsSnapshot {
    pub decoded_samples: u64,
    /// Oldest samples lost to ring buffer overflow
    pub overwritten_samples: u64,
    /// Times the buffer ran dry while playing
    pub underruns: u64,
    /// Chunks rejected because the command queue was full
    pub dropped_chunks: u64,
    pub device_rate: u32,
    pub available: f64,
}

/// One inbound chunk on its way to the render context.
struct QueuedChunk {
    epoch: u64,
    bytes: Vec<u8>,
}

/// Render-side half of the engine, moved into the output callback.
pub struct PlaybackRenderer {
    ring: RingBuffer,
    interpolator: Interpolator,
    commands: HeapCons<QueuedChunk>,
    spent: HeapProd<Vec<u8>>,
    shared: Arc<PlaybackShared>,
    epoch: u64,
    starved: bool,
}

impl PlaybackRenderer {
    /// Fill `out` completely with the next mono samples.
    pub fn render(&mut self, out: &mut [f32]) {
        let requested = self.shared.flush_epoch.load(Ordering::Acquire);
        if requested > self.epoch {
            self.reset(requested);
        }

        self.apply_commands();

        let produced = if self.interpolator.is_unity() {
            self.ring.read(out)
        } else {
            let mut produced = 0;
            for slot in out.iter_mut() {
                match self.interpolator.next_sample(&mut self.ring) {
                    Some(sample) => {
                        *slot = sample;
                        produced += 1;
                    }
                    None => break,
                }
            }
            produced
        };
        out[produced..].fill(0.0);

        let starved = produced < out.len();
        if starved && !self.starved && self.is_playing() {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        self.starved = starved;

        self.shared.publish_available(self.ring.available());
    }

    fn apply_commands(&mut self) {
        while let Some(chunk) = self.commands.try_pop() {
            if chunk.epoch > self.epoch {
                self.reset(chunk.epoch);
            }

            if chunk.epoch == self.epoch {
                let ring = &mut self.ring;
                let mut overwritten = 0u64;
                let decoded = pcm::decode_into(&chunk.bytes, |sample| {
                    if ring.push(sample) {
                        overwritten += 1;
                    }
                });

                self.shared
                    .decoded_samples
                    .fetch_add(decoded as u64, Ordering::Relaxed);
                if overwritten > 0 {
                    self.shared
                        .overwritten_samples
                        .fetch_add(overwritten, Ordering::Relaxed);
                }
                if !self.ring.is_drained() {
                    self.shared.set_state(PlaybackState::Playing);
                }
            }

            // Full only if the control side stopped reclaiming; the buffer is then freed here.
            let _ = self.spent.try_push(chunk.bytes);
        }
    }

    fn reset(&mut self, epoch: u64) {
        self.ring.clear();
        self.epoch = epoch;
        self.starved = false;
        self.shared.set_state(PlaybackState::Idle);
    }

    fn is_playing(&self) -> bool {
        PlaybackState::from_u8(self.shared.state.load(Ordering::Acquire)) == PlaybackState::Playing
    }
}

/// Control-side ends of the command channel.
struct CommandChannel {
    commands: HeapProd<QueuedChunk>,
    spent: HeapCons<Vec<u8>>,
}

/// Speaker playback engine.
///
/// ## Lifecycle:
/// - `start` opens the output device and derives the interpolation step from its rate
/// - `enqueue` is valid in any state; decoded audio puts the engine in `Playing`
/// - `stop` / `flush` drop buffered audio and return to `Idle` with the device still open
/// - `shutdown` also releases the device; a later `start` initializes from scratch
pub struct PlaybackEngine {
    config: PlaybackConfig,
    device: Box<dyn OutputDevice>,
    stream: Option<ActiveStream>,
    parked: Option<PlaybackRenderer>,
    channel: CommandChannel,
    shared: Arc<PlaybackShared>,
}

impl PlaybackEngine {
    /// Idle engine; the device is opened on `start`.
    pub fn new(config: PlaybackConfig, device: Box<dyn OutputDevice>) -> Self {
        let shared = Arc::new(PlaybackShared::default());
        let (renderer, channel) = build_channel(&config, &shared);

        Self {
            config,
            device,
            stream: None,
            parked: Some(renderer),
            channel,
            shared,
        }
    }

    /// State as last published by either context.
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Valid samples in the ring buffer as of the last render callback.
    pub fn available(&self) -> f64 {
        f64::from_bits(self.shared.available.load(Ordering::Acquire))
    }

    /// True while the output device is held.
    pub fn is_started(&self) -> bool {
        self.stream.is_some()
    }

    /// Counters since the engine was created.
    pub fn stats(&self) -> PlaybackStatsSnapshot {
        PlaybackStatsSnapshot {
            decoded_samples: self.shared.decoded_samples.load(Ordering::Relaxed),
            overwritten_samples: self.shared.overwritten_samples.load(Ordering::Relaxed),
            underruns: self.shared.underruns.load(Ordering::Relaxed),
            dropped_chunks: self.shared.dropped_chunks.load(Ordering::Relaxed),
            device_rate: self.shared.device_rate.load(Ordering::Relaxed),
            available: self.available(),
        }
    }

    /// Acquire the output device and start rendering.
    pub fn start(&mut self) -> AppResult<()> {
        if self.stream.is_some() {
            debug!("Playback already started");
            return Ok(());
        }

        let device_rate = self.device.output_rate()?;

        let mut renderer = match self.parked.take() {
            Some(renderer) => renderer,
            None => self.rebuild_channel(),
        };
        renderer
            .interpolator
            .set_rates(self.config.source_rate, device_rate);
        let step = renderer.interpolator.step();

        let callback: RenderCallback = Box::new(move |out| renderer.render(out));
        match self.device.open_output(callback) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.shared.device_rate.store(device_rate, Ordering::Relaxed);
                info!(
                    source_rate = self.config.source_rate,
                    device_rate, step, "Playback started"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Speaker unavailable");
                // The renderer went down with the callback.
                let renderer = self.rebuild_channel();
                self.parked = Some(renderer);
                Err(e)
            }
        }
    }

    /// Hand one inbound PCM chunk to the render context.
    pub fn enqueue(&mut self, bytes: Vec<u8>) {
        self.reclaim();

        if bytes.len() < 2 {
            return;
        }

        let chunk = QueuedChunk {
            epoch: self.shared.flush_epoch.load(Ordering::Acquire),
            bytes,
        };
        if self.channel.commands.try_push(chunk).is_err() {
            self.shared.dropped_chunks.fetch_add(1, Ordering::Relaxed);
            warn!(
                capacity = self.config.queue_capacity,
                "Playback queue full, dropping chunk"
            );
        }
    }

    /// Stop playback: drop all buffered audio and render silence.
    pub fn stop(&mut self) {
        self.flush();
    }

    /// Drop all buffered and queued audio. Observed by the next render callback.
    pub fn flush(&mut self) {
        self.shared.flush_epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.set_state(PlaybackState::Idle);
        self.shared.publish_available(0.0);
        self.reclaim();
        debug!("Playback flushed");
    }

    /// Flush and release the output device.
    pub fn shutdown(&mut self) {
        self.flush();
        if let Some(stream) = self.stream.take() {
            drop(stream);
            let renderer = self.rebuild_channel();
            self.parked = Some(renderer);
            self.shared.device_rate.store(0, Ordering::Relaxed);
            info!(stats = ?self.stats(), "Playback shut down");
        }
    }

    /// Free buffers the renderer is done with.
    fn reclaim(&mut self) {
        while self.channel.spent.try_pop().is_some() {}
    }

    fn rebuild_channel(&mut self) -> PlaybackRenderer {
        let (renderer, channel) = build_channel(&self.config, &self.shared);
        self.channel = channel;
        renderer
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stream.take();
    }
}

fn build_channel(
    config: &PlaybackConfig,
    shared: &Arc<PlaybackShared>,
) -> (PlaybackRenderer, CommandChannel) {
    let (commands_prod, commands_cons) = HeapRb::<QueuedChunk>::new(config.queue_capacity).split();
    let (spent_prod, spent_cons) = HeapRb::<Vec<u8>>::new(config.queue_capacity * 2).split();

    let renderer = PlaybackRenderer {
        ring: RingBuffer::new(config.capacity),
        interpolator: Interpolator::new(config.source_rate, config.source_rate),
        commands: commands_cons,
        spent: spent_prod,
        shared: shared.clone(),
        epoch: shared.flush_epoch.load(Ordering::Acquire),
        starved: false,
    };

    (
        renderer,
        CommandChannel {
            commands: commands_prod,
            spent: spent_cons,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::super::device::testing::ManualOutput;
    use super::*;
    use crate::error::KioskError;

    fn engine(output: &ManualOutput, capacity: usize) -> PlaybackEngine {
        let config = PlaybackConfig {
            source_rate: 24_000,
            capacity,
            queue_capacity: 8,
        };
        PlaybackEngine::new(config, Box::new(output.clone()))
    }

    fn encode(samples: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        pcm::encode_into(samples, &mut bytes);
        bytes
    }

    #[test]
    fn test_unity_rate_plays_samples_then_silence() {
        let output = ManualOutput::new(24_000);
        let mut engine = engine(&output, 1024);
        engine.start().unwrap();

        engine.enqueue(encode(&[0.5, -0.5, 0.25]));
        let block = output.render(5).unwrap();
        assert_eq!(block, vec![0.5, -0.5, 0.25, 0.0, 0.0]);
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(engine.stats().underruns, 1);
    }

    #[test]
    fn test_upsampling_interpolates_between_samples() {
        let output = ManualOutput::new(48_000);
        let mut engine = engine(&output, 1024);
        engine.start().unwrap();

        engine.enqueue(encode(&[0.0, 0.5]));
        let block = output.render(4).unwrap();
        assert_eq!(block, vec![0.0, 0.25, 0.5, 0.0]);
    }

    #[test]
    fn test_stop_flushes_and_renders_silence() {
        let output = ManualOutput::new(24_000);
        let mut engine = engine(&output, 1024);
        engine.start().unwrap();

        engine.enqueue(encode(&[0.5; 64]));
        assert_eq!(output.render(8).unwrap(), vec![0.5; 8]);
        assert_eq!(engine.available(), 56.0);

        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert_eq!(engine.available(), 0.0);
        assert!(engine.is_started());

        assert_eq!(output.render(16).unwrap(), vec![0.0; 16]);
        assert_eq!(engine.available(), 0.0);
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_overflow_keeps_latest_samples() {
        let output = ManualOutput::new(24_000);
        let mut engine = engine(&output, 50);
        engine.start().unwrap();

        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 200.0).collect();
        engine.enqueue(encode(&samples[..30]));
        engine.enqueue(encode(&samples[30..]));

        output.render(0).unwrap();
        assert_eq!(engine.available(), 50.0);
        assert_eq!(engine.stats().overwritten_samples, 50);

        let expected: Vec<f32> = samples[50..]
            .iter()
            .map(|&s| pcm::decode_sample(pcm::encode_sample(s)))
            .collect();
        assert_eq!(output.render(50).unwrap(), expected);
    }

    #[test]
    fn test_chunks_queued_before_flush_are_discarded() {
        let output = ManualOutput::new(24_000);
        let mut engine = engine(&output, 1024);

        engine.enqueue(encode(&[0.5; 4]));
        engine.flush();
        engine.enqueue(encode(&[-0.5; 2]));

        engine.start().unwrap();
        assert_eq!(output.render(4).unwrap(), vec![-0.5, -0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_underrun_recovers_on_new_audio() {
        let output = ManualOutput::new(24_000);
        let mut engine = engine(&output, 1024);
        engine.start().unwrap();

        engine.enqueue(encode(&[0.25; 2]));
        output.render(4).unwrap();
        output.render(4).unwrap();
        assert_eq!(engine.stats().underruns, 1);

        engine.enqueue(encode(&[0.5; 4]));
        assert_eq!(output.render(4).unwrap(), vec![0.5; 4]);
        assert_eq!(engine.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_full_queue_drops_chunk() {
        let output = ManualOutput::new(24_000);
        let mut engine = engine(&output, 1024);

        for _ in 0..9 {
            engine.enqueue(encode(&[0.1; 4]));
        }
        assert_eq!(engine.stats().dropped_chunks, 1);
    }

    #[test]
    fn test_shutdown_releases_device_and_restarts_fresh() {
        let output = ManualOutput::new(24_000);
        let mut engine = engine(&output, 1024);

        engine.start().unwrap();
        engine.start().unwrap();
        engine.enqueue(encode(&[0.5; 4]));
        output.render(2).unwrap();

        engine.shutdown();
        assert!(!output.is_open());
        assert!(!engine.is_started());

        engine.start().unwrap();
        assert_eq!(output.render(4).unwrap(), vec![0.0; 4]);
        engine.enqueue(encode(&[0.25; 2]));
        assert_eq!(output.render(2).unwrap(), vec![0.25; 2]);
    }

    #[test]
    fn test_device_failure_is_reported() {
        let output = ManualOutput::new(24_000);
        output.set_failing(true);
        let mut engine = engine(&output, 1024);

        assert!(matches!(engine.start(), Err(KioskError::DeviceUnavailable(_))));
        assert!(!engine.is_started());

        output.set_failing(false);
        engine.start().unwrap();
        engine.enqueue(encode(&[0.5; 2]));
        assert_eq!(output.render(2).unwrap(), vec![0.5; 2]);
    }
}
