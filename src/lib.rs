//! # Kiosk Voice Engine
//!
//! On-device audio streaming engine for a voice-ordering kiosk. Microphone audio
//! is downsampled and encoded to 16-bit PCM for the ordering server, and the
//! server's PCM replies are decoded, buffered and resampled to the speaker,
//! while a session coordinator keeps both directions in step with the order
//! conversation.
//!
//! ## Application Architecture:
//! - **audio**: ring buffer, resamplers, PCM codec, capture encoder, playback engine, devices
//! - **session**: conversation state machine, control protocol, WebSocket session runner
//! - **config**: configuration (TOML file + environment variables)
//! - **state**: shared state for the local status/control API
//! - **health** / **handlers**: local HTTP endpoints
//! - **error**: error taxonomy and HTTP error responses

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod session;
pub mod state;
