//! # Resampling
//!
//! Two independent strategies, one per direction:
//!
//! - **Capture**: block-average downsampling from the microphone rate to the
//!   server's input rate. Each output sample is the mean of its source window.
//! - **Playback**: fractional linear interpolation straight out of the
//!   playback [`RingBuffer`], advancing a fractional cursor by
//!   `source_rate / device_rate` per output sample.

use super::ring_buffer::RingBuffer;

/// Block-average `input` from `source_rate` down to `target_rate` into `out`.
///
/// `out` is cleared first and never reallocated when its capacity already
/// covers the result. Output sample `i` averages the source indices
/// `[round(i * r), round((i + 1) * r))` with `r = source_rate / target_rate`;
/// the output holds `floor(len / r)` samples and an empty window yields 0.
/// Equal rates copy the input unchanged.
pub fn downsample_block_average(
    input: &[f32],
    source_rate: u32,
    target_rate: u32,
    out: &mut Vec<f32>,
) {
    out.clear();
    if input.is_empty() || source_rate == 0 || target_rate == 0 {
        return;
    }

    if source_rate == target_rate {
        out.extend_from_slice(input);
        return;
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = (input.len() as f64 / ratio).floor() as usize;

    let mut window_start = 0usize;
    for i in 0..output_len {
        let window_end = (((i + 1) as f64) * ratio).round() as usize;
        let end = window_end.min(input.len());

        let value = if end > window_start {
            let sum: f64 = input[window_start..end].iter().map(|&s| s as f64).sum();
            (sum / (end - window_start) as f64) as f32
        } else {
            0.0
        };

        out.push(value);
        window_start = window_end;
    }
}

/// Playback interpolator state.
///
/// Only the step lives here. The fractional cursor is the ring buffer's read
/// position, so overflow discards move it along with the data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interpolator {
    step: f64,
}

impl Interpolator {
    /// Interpolator stepping `source_rate / output_rate` samples per output.
    pub fn new(source_rate: u32, output_rate: u32) -> Self {
        Self {
            step: step_for(source_rate, output_rate),
        }
    }

    /// Source samples consumed per output sample.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Re-derive the step after the output device rate became known.
    pub fn set_rates(&mut self, source_rate: u32, output_rate: u32) {
        self.step = step_for(source_rate, output_rate);
    }

    /// True when source and output rates match and block reads can be used.
    pub fn is_unity(&self) -> bool {
        self.step == 1.0
    }

    /// Produce one output sample, or `None` when less than one whole source
    /// sample is buffered. On `None` the cursor does not move.
    pub fn next_sample(&self, ring: &mut RingBuffer) -> Option<f32> {
        if ring.available() < 1.0 {
            return None;
        }
        let sample = ring.read_at(ring.cursor());
        ring.advance(self.step);
        Some(sample)
    }
}

fn step_for(source_rate: u32, output_rate: u32) -> f64 {
    if source_rate == 0 || output_rate == 0 {
        1.0
    } else {
        source_rate as f64 / output_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_signal_stays_constant() {
        let input = vec![0.25f32; 4800];
        let mut out = Vec::new();

        downsample_block_average(&input, 48_000, 16_000, &mut out);
        assert_eq!(out.len(), 1600);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));

        downsample_block_average(&input, 44_100, 16_000, &mut out);
        assert_eq!(out.len(), (4800.0 / (44_100.0 / 16_000.0)) as usize);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_block_average_windows() {
        let input = [1.0, 3.0, 5.0, 7.0, 9.0, 11.0];
        let mut out = Vec::new();
        downsample_block_average(&input, 48_000, 16_000, &mut out);
        assert_eq!(out, vec![3.0, 9.0]);
    }

    #[test]
    fn test_equal_rates_copy() {
        let input = [0.1, -0.2, 0.3];
        let mut out = vec![9.0; 10];
        downsample_block_average(&input, 16_000, 16_000, &mut out);
        assert_eq!(out, input.to_vec());
    }

    #[test]
    fn test_downsample_reuses_capacity() {
        let input = vec![0.5f32; 3072];
        let mut out = Vec::with_capacity(2048);
        let before = out.as_ptr();
        downsample_block_average(&input, 48_000, 16_000, &mut out);
        assert_eq!(out.len(), 1024);
        assert_eq!(out.as_ptr(), before);
    }

    #[test]
    fn test_unity_step_reproduces_input() {
        let mut ring = RingBuffer::new(16);
        let input = [0.1, 0.2, -0.3, 0.4, -0.5];
        ring.write(&input);

        let interpolator = Interpolator::new(24_000, 24_000);
        assert!(interpolator.is_unity());

        let produced: Vec<f32> = (0..5)
            .filter_map(|_| interpolator.next_sample(&mut ring))
            .collect();
        assert_eq!(produced, input.to_vec());
        assert_eq!(interpolator.next_sample(&mut ring), None);
    }

    #[test]
    fn test_half_step_interpolates_midpoints() {
        let mut ring = RingBuffer::new(16);
        ring.write(&[0.0, 1.0, 2.0]);

        // 24 kHz source on a 48 kHz device
        let interpolator = Interpolator::new(24_000, 48_000);
        assert_eq!(interpolator.step(), 0.5);

        let mut produced = Vec::new();
        while let Some(sample) = interpolator.next_sample(&mut ring) {
            produced.push(sample);
        }
        assert_eq!(produced, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert!(ring.available() < 1.0);
    }

    #[test]
    fn test_cursor_stays_put_when_starved() {
        let mut ring = RingBuffer::new(8);
        ring.write(&[0.5]);
        let interpolator = Interpolator::new(24_000, 44_100);

        assert!(interpolator.next_sample(&mut ring).is_some());
        let cursor = ring.cursor();
        assert_eq!(interpolator.next_sample(&mut ring), None);
        assert_eq!(ring.cursor(), cursor);
    }
}
