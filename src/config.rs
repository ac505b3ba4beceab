//! # Configuration Management
//!
//! Loads the kiosk configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (`KIOSK_` prefix, `__` between nested keys)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` for the local API (deployment platforms set these)
//! 2. Environment variables, e.g. `KIOSK_TRANSPORT__STORE_ID=42`
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::error::{AppResult, KioskError};
use serde::{Deserialize, Serialize};
use std::env;

/// Highest device or server rate the engine accepts.
const MAX_SAMPLE_RATE: u32 = 192_000;

/// Complete kiosk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
}

/// Local status/control HTTP API.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only the kiosk shell on the same machine can reach it
/// - `port = 8090`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection to the ordering server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `ws://` base URL of the ordering server
    pub base_url: String,
    /// Store the kiosk belongs to
    pub store_id: String,
    /// Bearer token passed as the `accessToken` query parameter
    pub access_token: String,
    /// How long to keep the socket open after the order completes, so a
    /// trailing server utterance is not cut off
    pub close_drain_ms: u64,
    /// Give up on an unreachable server after this long
    pub connect_timeout_ms: u64,
}

/// Audio pipeline tuning.
///
/// ## Rates:
/// - `capture_target_rate`: rate of the PCM sent to the server (16 kHz or 24 kHz)
/// - `playback_source_rate`: rate of the PCM the server sends back
///
/// Device rates are whatever the host picks; the engine reconciles them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_target_rate: u32,
    pub playback_source_rate: u32,
    /// Playback ring buffer length in seconds of source audio
    pub playback_buffer_seconds: u32,
    /// How often the control context collects encoded capture chunks
    pub capture_poll_ms: u64,
    /// Number of pre-allocated capture chunk buffers
    pub capture_pool_size: usize,
    /// Largest device callback block the scratch buffers are sized for
    pub max_block_frames: usize,
    /// Capacity of the control → render chunk queue
    pub command_queue_capacity: usize,
    /// Input device name; the host default when unset
    pub input_device: Option<String>,
    /// Output device name; the host default when unset
    pub output_device: Option<String>,
}

/// Session lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Start a session immediately instead of waiting for a touch
    pub auto_start: bool,
    /// Pause between the end of one session and the next
    pub restart_delay_ms: u64,
    /// Caption shown once the order is complete
    pub completion_caption: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8090,
            },
            transport: TransportConfig {
                base_url: "ws://127.0.0.1:8080".to_string(),
                store_id: "1".to_string(),
                access_token: String::new(),
                close_drain_ms: 300,
                connect_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                capture_target_rate: 16_000,
                playback_source_rate: 24_000,
                playback_buffer_seconds: 10,
                capture_poll_ms: 10,
                capture_pool_size: 16,
                max_block_frames: 8192,
                command_queue_capacity: 256,
                input_device: None,
                output_device: None,
            },
            session: SessionConfig {
                auto_start: false,
                restart_delay_ms: 3000,
                completion_caption: "Thank you for your order.".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `KIOSK_TRANSPORT__BASE_URL=ws://10.0.0.5:8080`
    /// - `KIOSK_TRANSPORT__ACCESS_TOKEN=...`
    /// - `KIOSK_AUDIO__CAPTURE_TARGET_RATE=24000`
    /// - `HOST=0.0.0.0`, `PORT=9000`: local API bind address
    pub fn load() -> AppResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("KIOSK")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> AppResult<()> {
        if self.server.port == 0 {
            return Err(invalid("Server port cannot be 0"));
        }

        let base = self.transport.base_url.trim();
        if !base.starts_with("ws://") {
            return Err(invalid("Transport base_url must be a ws:// URL"));
        }

        if self.transport.connect_timeout_ms == 0 {
            return Err(invalid("Transport connect timeout must be greater than 0"));
        }

        if self.transport.store_id.trim().is_empty() {
            return Err(invalid("Transport store_id cannot be empty"));
        }

        for (name, rate) in [
            ("capture_target_rate", self.audio.capture_target_rate),
            ("playback_source_rate", self.audio.playback_source_rate),
        ] {
            if rate == 0 || rate > MAX_SAMPLE_RATE {
                return Err(invalid(&format!(
                    "Audio {} must be between 1 and {} Hz",
                    name, MAX_SAMPLE_RATE
                )));
            }
        }

        if self.audio.playback_buffer_seconds == 0 {
            return Err(invalid("Playback buffer must hold at least one second"));
        }

        if self.audio.capture_poll_ms == 0 {
            return Err(invalid("Capture poll interval must be greater than 0"));
        }

        if self.audio.capture_pool_size == 0
            || self.audio.max_block_frames == 0
            || self.audio.command_queue_capacity == 0
        {
            return Err(invalid("Audio pool, block and queue sizes must be greater than 0"));
        }

        Ok(())
    }

    /// Playback ring buffer capacity in samples.
    pub fn playback_capacity(&self) -> usize {
        self.audio.playback_source_rate as usize * self.audio.playback_buffer_seconds as usize
    }
}

impl TransportConfig {
    /// WebSocket URL for one kiosk session.
    ///
    /// ## Example:
    /// `ws://host:8080/stores/42/websocket/kioskSession?accessToken=abc%2Bdef`
    pub fn session_url(&self) -> String {
        format!(
            "{}/stores/{}/websocket/kioskSession?accessToken={}",
            self.base_url.trim().trim_end_matches('/'),
            self.store_id.trim(),
            urlencoding::encode(&self.access_token)
        )
    }

    /// Same URL with the token masked, for logs.
    pub fn redacted_session_url(&self) -> String {
        format!(
            "{}/stores/{}/websocket/kioskSession?accessToken=***",
            self.base_url.trim().trim_end_matches('/'),
            self.store_id.trim()
        )
    }
}

fn invalid(message: &str) -> KioskError {
    KioskError::ConfigError(message.to_string())
}
