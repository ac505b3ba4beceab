//! # Playback Ring Buffer
//!
//! Fixed-capacity circular store of float samples owned by the render context.
//!
//! ## Cursors:
//! - **write position**: integer, where the next sample lands
//! - **read position**: fractional, so the playback interpolator can sit
//!   between two samples across callback boundaries
//! - **valid count**: fractional, because interpolated reads consume `step`
//!   samples at a time
//!
//! ## Overflow Policy:
//! Writing into a full buffer overwrites the oldest sample and moves the read
//! position forward by one, so the count never exceeds the capacity and the
//! writer never waits. Nothing here fails, blocks or allocates after `new`.

/// Circular float buffer with a fractional read cursor.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    samples: Box<[f32]>,
    write_pos: usize,
    read_pos: f64,
    valid: f64,
}

impl RingBuffer {
    /// Create a zero-filled buffer. A capacity of 0 is bumped to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0.0,
            valid: 0.0,
        }
    }

    /// Number of sample slots.
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Number of valid samples not yet consumed (may be fractional).
    pub fn available(&self) -> f64 {
        self.valid
    }

    /// True when less than one whole sample is left.
    pub fn is_drained(&self) -> bool {
        self.valid < 1.0
    }

    /// Current fractional read position.
    pub fn cursor(&self) -> f64 {
        self.read_pos
    }

    /// Append one sample. Returns true when the oldest sample was overwritten.
    pub fn push(&mut self, sample: f32) -> bool {
        let capacity = self.capacity();
        self.samples[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % capacity;
        self.valid += 1.0;

        if self.valid > capacity as f64 {
            self.read_pos = wrap(self.read_pos + 1.0, capacity);
            self.valid = capacity as f64;
            true
        } else {
            false
        }
    }

    /// Append samples. Returns how many old samples were overwritten.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        samples.iter().filter(|&&s| self.push(s)).count()
    }

    /// Block read of whole samples into `out`, oldest first.
    ///
    /// Reads `min(out.len(), floor(available))` samples and returns that count.
    /// The fractional part of the read position is preserved.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let capacity = self.capacity();
        let count = out.len().min(self.valid.floor() as usize);
        let start = self.read_pos.floor() as usize;

        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = self.samples[(start + i) % capacity];
        }

        self.read_pos = wrap(self.read_pos + count as f64, capacity);
        self.valid -= count as f64;
        count
    }

    /// Linearly interpolated sample at a fractional position (taken modulo capacity).
    pub fn read_at(&self, position: f64) -> f32 {
        let capacity = self.capacity();
        let position = wrap(position, capacity);
        let index = position.floor() as usize % capacity;
        let next = (index + 1) % capacity;
        let fraction = (position - position.floor()) as f32;

        let a = self.samples[index];
        let b = self.samples[next];
        a + (b - a) * fraction
    }

    /// Move the read cursor by a fractional step, consuming `step` samples.
    /// The valid count is clamped at zero.
    pub fn advance(&mut self, step: f64) {
        self.read_pos = wrap(self.read_pos + step, self.capacity());
        self.valid = (self.valid - step).max(0.0);
    }

    /// Drop all buffered audio and reset every cursor to zero.
    ///
    /// Storage is left as is. Reads are gated on at least one valid sample, so
    /// stale slots past the write position only ever get a zero weight.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.read_pos = 0.0;
        self.valid = 0.0;
    }
}

fn wrap(position: f64, capacity: usize) -> f64 {
    let wrapped = position.rem_euclid(capacity as f64);
    // rem_euclid can round up to exactly `capacity` for tiny negative inputs
    if wrapped >= capacity as f64 {
        0.0
    } else {
        wrapped
    }
}
