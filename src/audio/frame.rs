//! Audio data carried between the device, the engines and the transport.

/// One device callback's worth of normalized samples.
///
/// Borrowed from the callback that produced it and never kept past it.
#[derive(Debug, Clone, Copy)]
pub struct AudioFrame<'a> {
    /// Samples in [-1.0, 1.0], interleaved when `channels > 1`
    pub samples: &'a [f32],
    pub sample_rate: u32,
    pub channels: u16,
}

impl<'a> AudioFrame<'a> {
    /// Single-channel frame at `sample_rate`.
    pub fn mono(samples: &'a [f32], sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Only mono frames are encoded.
    pub fn is_mono(&self) -> bool {
        self.channels == 1
    }
}

/// Raw 16-bit little-endian PCM with no header.
///
/// Produced by the capture encoder and owned by the transport until sent; on the
/// inbound path the transport hands the bytes to the playback engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedChunk(Vec<u8>);

impl EncodedChunk {
    /// Wrap already encoded bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the PCM bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the bytes for a binary WebSocket message.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Number of complete 16-bit samples.
    pub fn sample_count(&self) -> usize {
        self.0.len() / 2
    }
}
