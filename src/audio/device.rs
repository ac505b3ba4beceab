//! # Audio Device Management
//!
//! Opens the microphone and speaker through cpal and adapts their native
//! formats to the mono float frames the engines work with.
//!
//! ## Key Concepts:
//! - **Device selection**: a configured device name is looked up first; when it is
//!   missing the host default is used instead
//! - **Format adaptation**: f32 and i16 devices are supported; interleaved input is
//!   mixed down to mono, mono output is duplicated to every channel
//! - **Ownership**: an [`ActiveStream`] keeps the device open; dropping it releases it
//!
//! Opening a device may block, so it only ever happens in the control context.
//! The callbacks handed to the device run in the audio context and must follow
//! the real-time rules: no allocation on the steady-state path, no locks, no logs.

use super::frame::AudioFrame;
use crate::error::{AppResult, KioskError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::Serialize;
use std::any::Any;
use tracing::{debug, info, warn};

/// Receives every captured block as a mono frame.
pub type InputCallback = Box<dyn FnMut(AudioFrame<'_>) + Send + 'static>;

/// Fills a mono output block completely.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// An open device stream. Dropping it stops the stream and releases the device.
pub struct ActiveStream {
    _handle: Box<dyn Any>,
}

impl ActiveStream {
    /// Keep `handle` alive until the stream is dropped.
    pub fn new<T: 'static>(handle: T) -> Self {
        Self {
            _handle: Box::new(handle),
        }
    }
}

impl std::fmt::Debug for ActiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ActiveStream")
    }
}

/// Source of microphone audio.
pub trait InputDevice {
    /// Acquire the device and start delivering frames to `callback`.
    fn open_input(&mut self, callback: InputCallback) -> AppResult<ActiveStream>;
}

/// Sink for rendered audio.
pub trait OutputDevice {
    /// Sample rate the device will render at. Known before the stream opens.
    fn output_rate(&mut self) -> AppResult<u32>;

    /// Acquire the device and start pulling blocks from `callback`.
    fn open_output(&mut self, callback: RenderCallback) -> AppResult<ActiveStream>;
}

/// Which devices the host exposes, for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub host: String,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
    pub input_devices: Vec<String>,
    pub output_devices: Vec<String>,
}

/// Enumerate the host's audio devices. May block; call it off the async executor.
pub fn device_summary() -> DeviceSummary {
    let host = cpal::default_host();

    DeviceSummary {
        host: format!("{:?}", host.id()),
        default_input: host.default_input_device().and_then(|d| d.name().ok()),
        default_output: host.default_output_device().and_then(|d| d.name().ok()),
        input_devices: device_names(host.input_devices()),
        output_devices: device_names(host.output_devices()),
    }
}

fn device_names<I>(devices: Result<I, cpal::DevicesError>) -> Vec<String>
where
    I: Iterator<Item = cpal::Device>,
{
    devices
        .map(|list| list.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

/// Microphone opened through the default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    device_name: Option<String>,
    max_block_frames: usize,
}

impl CpalInput {
    /// Named microphone, or the host default when `None` or not found.
    pub fn new(device_name: Option<String>, max_block_frames: usize) -> Self {
        Self {
            device_name,
            max_block_frames,
        }
    }
}

impl InputDevice for CpalInput {
    fn open_input(&mut self, mut callback: InputCallback) -> AppResult<ActiveStream> {
        let host = cpal::default_host();
        let device = select_device(
            self.device_name.as_deref(),
            host.input_devices().ok(),
            host.default_input_device(),
        )
        .ok_or_else(|| KioskError::DeviceUnavailable("No input device available".to_string()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| KioskError::DeviceUnavailable(format!("Input config: {}", e)))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels().max(1) as usize;
        let sample_format = supported.sample_format();
        let stream_config: cpal::StreamConfig = supported.into();

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate,
            channels,
            format = ?sample_format,
            "Opening input device"
        );

        let err_fn = |err: cpal::StreamError| {
            warn!(error = %err, "Input stream error");
        };

        let mut interleaved: Vec<f32> = Vec::with_capacity(self.max_block_frames * channels);
        let mut mono: Vec<f32> = Vec::with_capacity(self.max_block_frames);

        let stream = match sample_format {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    mix_to_mono(data, channels, &mut mono);
                    callback(AudioFrame::mono(&mono, sample_rate));
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    interleaved.clear();
                    interleaved.extend(data.iter().map(|&s| s as f32 / 32768.0));
                    mix_to_mono(&interleaved, channels, &mut mono);
                    callback(AudioFrame::mono(&mono, sample_rate));
                },
                err_fn,
                None,
            ),
            other => {
                return Err(KioskError::DeviceUnavailable(format!(
                    "Unsupported input sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| KioskError::DeviceUnavailable(format!("Input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| KioskError::DeviceUnavailable(format!("Input start: {}", e)))?;

        Ok(ActiveStream::new(stream))
    }
}

/// Speaker opened through the default cpal host.
#[derive(Default)]
pub struct CpalOutput {
    device_name: Option<String>,
    max_block_frames: usize,
    selected: Option<(cpal::Device, cpal::SupportedStreamConfig)>,
}

impl CpalOutput {
    /// Named speaker, or the host default when `None` or not found.
    pub fn new(device_name: Option<String>, max_block_frames: usize) -> Self {
        Self {
            device_name,
            max_block_frames,
            selected: None,
        }
    }

    fn select(&mut self) -> AppResult<&(cpal::Device, cpal::SupportedStreamConfig)> {
        if self.selected.is_none() {
            let host = cpal::default_host();
            let device = select_device(
                self.device_name.as_deref(),
                host.output_devices().ok(),
                host.default_output_device(),
            )
            .ok_or_else(|| {
                KioskError::DeviceUnavailable("No output device available".to_string())
            })?;

            let config = device
                .default_output_config()
                .map_err(|e| KioskError::DeviceUnavailable(format!("Output config: {}", e)))?;

            self.selected = Some((device, config));
        }

        self.selected
            .as_ref()
            .ok_or_else(|| KioskError::DeviceUnavailable("Output device not selected".to_string()))
    }
}

impl OutputDevice for CpalOutput {
    fn output_rate(&mut self) -> AppResult<u32> {
        Ok(self.select()?.1.sample_rate().0)
    }

    fn open_output(&mut self, mut callback: RenderCallback) -> AppResult<ActiveStream> {
        let max_block_frames = self.max_block_frames;
        let (device, supported) = self.select()?;

        let channels = supported.channels().max(1) as usize;
        let sample_format = supported.sample_format();
        let stream_config: cpal::StreamConfig = supported.config();

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = stream_config.sample_rate.0,
            channels,
            format = ?sample_format,
            "Opening output device"
        );

        let err_fn = |err: cpal::StreamError| {
            warn!(error = %err, "Output stream error");
        };

        let mut mono: Vec<f32> = vec![0.0; max_block_frames];

        let stream = match sample_format {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = render_mono(&mut callback, &mut mono, data.len() / channels);
                    for (frame, &sample) in data.chunks_mut(channels).zip(frames) {
                        frame.fill(sample);
                    }
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let frames = render_mono(&mut callback, &mut mono, data.len() / channels);
                    for (frame, &sample) in data.chunks_mut(channels).zip(frames) {
                        frame.fill(super::pcm::encode_sample(sample));
                    }
                },
                err_fn,
                None,
            ),
            other => {
                return Err(KioskError::DeviceUnavailable(format!(
                    "Unsupported output sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| KioskError::DeviceUnavailable(format!("Output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| KioskError::DeviceUnavailable(format!("Output start: {}", e)))?;

        Ok(ActiveStream::new(stream))
    }
}

/// Pick the named device, falling back to the default when it is not found.
fn select_device<I>(
    name: Option<&str>,
    devices: Option<I>,
    default: Option<cpal::Device>,
) -> Option<cpal::Device>
where
    I: Iterator<Item = cpal::Device>,
{
    if let Some(name) = name {
        let found = devices.and_then(|mut list| {
            list.find(|d| d.name().map(|n| n == name).unwrap_or(false))
        });
        match found {
            Some(device) => {
                debug!(device = name, "Using configured audio device");
                return Some(device);
            }
            None => warn!(device = name, "Configured audio device not found, using default"),
        }
    }
    default
}

/// Average interleaved channels into `mono`. Reuses `mono`'s allocation.
pub fn mix_to_mono(interleaved: &[f32], channels: usize, mono: &mut Vec<f32>) {
    mono.clear();
    if channels <= 1 {
        mono.extend_from_slice(interleaved);
        return;
    }
    let scale = 1.0 / channels as f32;
    mono.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() * scale),
    );
}

/// Run the render callback for `frames` samples, growing the scratch only when
/// the host hands over a block larger than configured.
fn render_mono<'a>(
    callback: &mut RenderCallback,
    scratch: &'a mut Vec<f32>,
    frames: usize,
) -> &'a [f32] {
    if scratch.len() < frames {
        scratch.resize(frames, 0.0);
    }
    let block = &mut scratch[..frames];
    callback(block);
    block
}

/// Hardware-free devices for exercising the engines.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Slot<T> = Arc<Mutex<Option<T>>>;

    struct Release<T>(Slot<T>);

    impl<T> Drop for Release<T> {
        fn drop(&mut self) {
            if let Ok(mut slot) = self.0.lock() {
                slot.take();
            }
        }
    }

    /// Input whose callback is driven by the test.
    #[derive(Clone, Default)]
    pub struct ManualInput {
        callback: Slot<InputCallback>,
        fail: Arc<Mutex<bool>>,
        opens: Arc<Mutex<usize>>,
    }

    impl ManualInput {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        pub fn is_open(&self) -> bool {
            self.callback.lock().unwrap().is_some()
        }

        pub fn open_count(&self) -> usize {
            *self.opens.lock().unwrap()
        }

        /// Deliver one frame. Returns false when the device is closed.
        pub fn feed(&self, frame: AudioFrame<'_>) -> bool {
            match self.callback.lock().unwrap().as_mut() {
                Some(callback) => {
                    callback(frame);
                    true
                }
                None => false,
            }
        }
    }

    impl InputDevice for ManualInput {
        fn open_input(&mut self, callback: InputCallback) -> AppResult<ActiveStream> {
            if *self.fail.lock().unwrap() {
                return Err(KioskError::DeviceUnavailable("permission denied".to_string()));
            }
            *self.opens.lock().unwrap() += 1;
            *self.callback.lock().unwrap() = Some(callback);
            Ok(ActiveStream::new(Release(self.callback.clone())))
        }
    }

    /// Output whose render callback is pulled by the test.
    #[derive(Clone)]
    pub struct ManualOutput {
        rate: u32,
        callback: Slot<RenderCallback>,
        fail: Arc<Mutex<bool>>,
    }

    impl ManualOutput {
        pub fn new(rate: u32) -> Self {
            Self {
                rate,
                callback: Arc::new(Mutex::new(None)),
                fail: Arc::new(Mutex::new(false)),
            }
        }

        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        pub fn is_open(&self) -> bool {
            self.callback.lock().unwrap().is_some()
        }

        /// Pull one block of `frames` samples. Returns None when the device is closed.
        pub fn render(&self, frames: usize) -> Option<Vec<f32>> {
            let mut guard = self.callback.lock().unwrap();
            let callback = guard.as_mut()?;
            let mut block = vec![f32::NAN; frames];
            callback(&mut block);
            Some(block)
        }
    }

    impl OutputDevice for ManualOutput {
        fn output_rate(&mut self) -> AppResult<u32> {
            Ok(self.rate)
        }

        fn open_output(&mut self, callback: RenderCallback) -> AppResult<ActiveStream> {
            if *self.fail.lock().unwrap() {
                return Err(KioskError::DeviceUnavailable("no speaker".to_string()));
            }
            *self.callback.lock().unwrap() = Some(callback);
            Ok(ActiveStream::new(Release(self.callback.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_to_mono_averages_channels() {
        let mut mono = Vec::with_capacity(4);
        mix_to_mono(&[0.5, 0.25, -1.0, 0.0], 2, &mut mono);
        assert_eq!(mono, vec![0.375, -0.5]);

        mix_to_mono(&[0.2, 0.4], 1, &mut mono);
        assert_eq!(mono, vec![0.2, 0.4]);
    }

    #[test]
    fn test_render_mono_grows_scratch_for_large_blocks() {
        let mut callback: RenderCallback = Box::new(|block: &mut [f32]| block.fill(0.25));
        let mut scratch = vec![0.0; 2];
        let rendered = render_mono(&mut callback, &mut scratch, 5);
        assert_eq!(rendered, &[0.25; 5]);
    }

    #[test]
    fn test_manual_input_release_on_drop() {
        let mut input = testing::ManualInput::new();
        let handle = input.clone();

        let stream = input.open_input(Box::new(|_| {})).unwrap();
        assert!(handle.is_open());
        drop(stream);
        assert!(!handle.is_open());
        assert!(!handle.feed(AudioFrame::mono(&[0.0], 16_000)));
    }
}
