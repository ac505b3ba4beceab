//! # Audio Streaming Engine
//!
//! The on-device signal path of the kiosk, in both directions.
//!
//! ## Key Components:
//! - **RingBuffer**: fixed-capacity circular float storage with overwrite-oldest policy
//! - **Resampler**: block-average downsampling (capture) and fractional linear
//!   interpolation (playback)
//! - **PCM codec**: float ↔ 16-bit little-endian with saturation
//! - **CaptureEncoder**: microphone frames → resample → encode → outbound chunks
//! - **PlaybackEngine**: inbound chunks → decode → ring buffer → resample → speaker
//! - **Devices**: cpal-backed input/output streams behind small traits
//!
//! ## Audio Format on the Wire:
//! - **Encoding**: raw 16-bit signed little-endian PCM, no header
//! - **Channels**: mono
//! - **Rate**: capture target rate outbound (16 kHz default), playback source
//!   rate inbound (24 kHz default)
//!
//! ## Real-time Rules:
//! Code reachable from a device callback never allocates on the steady-state
//! path, never locks, never blocks and never logs. Cross-context traffic goes
//! through single-producer/single-consumer rings from `ringbuf`.

pub mod capture;
pub mod device;
pub mod frame;
pub mod pcm;
pub mod playback;
pub mod resampler;
pub mod ring_buffer;

pub use capture::{CaptureConfig, CaptureEncoder, CaptureState, CaptureStatsSnapshot};
pub use frame::{AudioFrame, EncodedChunk};
pub use playback::{PlaybackConfig, PlaybackEngine, PlaybackState, PlaybackStatsSnapshot};
pub use ring_buffer::RingBuffer;
