//! # Session Coordinator
//!
//! Keeps the capture and playback engines in step with the order conversation.
//!
//! ## Responsibilities:
//! - Applies server state directives and locally fired events to [`SessionState`]
//! - Gates audio in both directions: inbound PCM is dropped once the order is
//!   complete, capture only runs once the server is ready
//! - Forwards captions, cart snapshots and state changes to the UI sink
//! - Queues outbound traffic (encoded microphone audio, control messages, the
//!   final close) for the transport to pick up with [`SessionCoordinator::poll_outbound`]
//!
//! The coordinator never touches audio samples. It only holds the control ends
//! of the engines; everything real-time lives in the device callbacks.

use super::protocol::{self, ControlEvent, OutboundType};
use super::state::{SessionEvent, SessionState};
use super::ui::{UiEvent, UiSender};
use crate::audio::{
    CaptureEncoder, CaptureState, CaptureStatsSnapshot, EncodedChunk, PlaybackEngine,
    PlaybackState, PlaybackStatsSnapshot,
};
use crate::config::AppConfig;
use crate::error::{AppResult, KioskError};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Close reason sent once the order is complete.
pub const CLOSE_REASON_COMPLETED: &str = "Payment complete";

/// Session behaviour taken from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Time between entering `Completed` and closing the transport
    pub close_drain: Duration,
    /// Caption shown once the order is complete
    pub completion_caption: String,
}

impl From<&AppConfig> for SessionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            close_drain: Duration::from_millis(config.transport.close_drain_ms),
            completion_caption: config.session.completion_caption.clone(),
        }
    }
}

/// Next item for the transport to send.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Binary PCM message
    Audio(EncodedChunk),
    /// Text control message
    Control(String),
    /// Normal close with the given reason
    Close { reason: &'static str },
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SessionCounters {
    pub control_messages: u64,
    pub malformed_messages: u64,
    pub inbound_audio_chunks: u64,
    pub dropped_audio_chunks: u64,
    pub outbound_audio_chunks: u64,
    pub rejected_events: u64,
}

/// Serializable view of a session for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub previous_state: Option<SessionState>,
    pub transport_open: bool,
    pub transport_ready: bool,
    pub capture_state: CaptureState,
    pub playback_state: PlaybackState,
    pub close_pending: bool,
    pub capture: CaptureStatsSnapshot,
    pub playback: PlaybackStatsSnapshot,
    pub counters: SessionCounters,
}

/// Conversation state machine plus the engine control handles for one kiosk.
pub struct SessionCoordinator {
    settings: SessionSettings,
    capture: CaptureEncoder,
    playback: PlaybackEngine,
    ui: UiSender,

    state: SessionState,
    previous: Option<SessionState>,
    transport_open: bool,
    transport_ready: bool,
    capture_requested: bool,
    accepting_audio: bool,
    first_caption_chunk: bool,

    control_out: VecDeque<String>,
    close_at: Option<Instant>,
    counters: SessionCounters,
}

impl SessionCoordinator {
    /// Coordinator in `MenuSelection` with both engines idle.
    pub fn new(
        settings: SessionSettings,
        capture: CaptureEncoder,
        playback: PlaybackEngine,
        ui: UiSender,
    ) -> Self {
        Self {
            settings,
            capture,
            playback,
            ui,
            state: SessionState::MenuSelection,
            previous: None,
            transport_open: false,
            transport_ready: false,
            capture_requested: false,
            accepting_audio: true,
            first_caption_chunk: true,
            control_out: VecDeque::new(),
            close_at: None,
            counters: SessionCounters::default(),
        }
    }

    /// Current conversation state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Microphone engine state.
    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    /// Speaker engine state.
    pub fn playback_state(&self) -> PlaybackState {
        self.playback.state()
    }

    /// When the transport should be closed, if a close is pending.
    pub fn close_deadline(&self) -> Option<Instant> {
        self.close_at
    }

    /// Copy of the session for the status API.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            previous_state: self.previous,
            transport_open: self.transport_open,
            transport_ready: self.transport_ready,
            capture_state: self.capture.state(),
            playback_state: self.playback.state(),
            close_pending: self.close_at.is_some(),
            capture: self.capture.stats(),
            playback: self.playback.stats(),
            counters: self.counters,
        }
    }

    /// Start a session on a freshly opened transport.
    ///
    /// Opens the speaker and requests capture. The microphone itself is opened
    /// once the server reports it is ready.
    pub fn begin(&mut self) -> AppResult<()> {
        self.state = SessionState::MenuSelection;
        self.previous = None;
        self.transport_open = true;
        self.transport_ready = false;
        self.accepting_audio = true;
        self.first_caption_chunk = true;
        self.control_out.clear();
        self.close_at = None;

        self.playback.start()?;
        self.request_capture()?;

        info!(state = %self.state, "Session started");
        Ok(())
    }

    /// Ask for microphone capture. Before the server is ready the request is
    /// remembered and honoured on `SERVER_READY`.
    pub fn request_capture(&mut self) -> AppResult<()> {
        self.capture_requested = true;
        if self.transport_ready && self.accepting_audio {
            self.capture.start()?;
        } else {
            debug!("Capture requested before server ready, deferring");
        }
        Ok(())
    }

    /// Parse and apply one inbound text message.
    pub fn handle_control_text(&mut self, text: &str) -> AppResult<()> {
        self.counters.control_messages += 1;

        match protocol::parse_control(text) {
            Ok(Some(event)) => self.handle_control(event),
            Ok(None) => Ok(()),
            Err(e) => {
                self.counters.malformed_messages += 1;
                warn!(error = %e, "Dropping malformed control message");
                Err(e)
            }
        }
    }

    /// Apply one decoded control event.
    pub fn handle_control(&mut self, event: ControlEvent) -> AppResult<()> {
        match event {
            ControlEvent::SessionReady => {
                info!("Server ready");
                self.transport_ready = true;
                if self.capture_requested && self.accepting_audio {
                    self.capture.start()?;
                }
            }
            ControlEvent::CaptionChunk { text } => {
                if self.state == SessionState::Completed {
                    return Ok(());
                }
                if self.first_caption_chunk {
                    self.first_caption_chunk = false;
                    self.emit(UiEvent::CaptionReplace(text));
                } else {
                    self.emit(UiEvent::CaptionAppend(text));
                }
            }
            ControlEvent::CaptionResult { text } => {
                if self.state != SessionState::Completed {
                    self.emit(UiEvent::CaptionReplace(text));
                }
            }
            ControlEvent::CartUpdate(cart) => self.emit(UiEvent::Cart(cart)),
            ControlEvent::ChangeState { to } => {
                if !self.state.can_reach(to) && self.state != to {
                    warn!(from = %self.state, to = %to, "Server state change outside the transition table, applying");
                }
                self.enter(to);
            }
        }
        Ok(())
    }

    /// Route inbound PCM to playback. Dropped once the order is complete.
    pub fn handle_audio(&mut self, bytes: Vec<u8>) {
        if !self.accepting_audio || !self.transport_open {
            self.counters.dropped_audio_chunks += 1;
            return;
        }
        self.counters.inbound_audio_chunks += 1;
        self.playback.enqueue(bytes);
    }

    /// Apply a local event through the transition table.
    pub fn fire(&mut self, event: SessionEvent) -> AppResult<SessionState> {
        match self.state.next(event) {
            Some(next) => {
                self.enter(next);
                Ok(next)
            }
            None => {
                self.counters.rejected_events += 1;
                warn!(state = %self.state, event = ?event, "Event not allowed in current state");
                Err(KioskError::BadRequest(format!(
                    "{:?} is not allowed in {}",
                    event, self.state
                )))
            }
        }
    }

    /// The customer confirmed payment on the screen.
    pub fn request_payment(&mut self) -> AppResult<()> {
        if self.state != SessionState::PaymentConfirmation {
            return Err(KioskError::BadRequest(format!(
                "Payment can only be requested in {}, current state is {}",
                SessionState::PaymentConfirmation,
                self.state
            )));
        }
        if !self.transport_open {
            return Err(KioskError::TransportClosed(
                "No session connection for the payment request".to_string(),
            ));
        }

        self.control_out
            .push_back(protocol::outbound(OutboundType::ProcessPayment)?);
        info!("Payment requested");
        Ok(())
    }

    /// Next item for the transport: a due close first, then control messages,
    /// then microphone audio.
    pub fn poll_outbound(&mut self, now: Instant) -> Option<Outbound> {
        if !self.transport_open {
            return None;
        }

        if self.close_at.map_or(false, |deadline| now >= deadline) {
            self.close_at = None;
            return Some(Outbound::Close {
                reason: CLOSE_REASON_COMPLETED,
            });
        }

        if let Some(text) = self.control_out.pop_front() {
            return Some(Outbound::Control(text));
        }

        let chunk = self.capture.take_chunk()?;
        self.counters.outbound_audio_chunks += 1;
        Some(Outbound::Audio(chunk))
    }

    /// The transport went away: stop sending and silence the speaker.
    pub fn on_transport_closed(&mut self) {
        if !self.transport_open {
            return;
        }
        self.transport_open = false;
        self.transport_ready = false;
        self.close_at = None;
        self.control_out.clear();

        self.capture.stop();
        self.playback.flush();
        info!(state = %self.state, "Transport closed, audio degraded to silence");
    }

    /// Tear the session down and release both devices.
    pub fn end(&mut self) {
        self.transport_open = false;
        self.transport_ready = false;
        self.capture_requested = false;
        self.close_at = None;
        self.control_out.clear();

        self.capture.stop();
        self.playback.flush();
        self.playback.shutdown();
        debug!(counters = ?self.counters, "Session ended");
    }

    fn enter(&mut self, next: SessionState) {
        let from = self.state;
        self.previous = Some(from);
        self.state = next;
        self.first_caption_chunk = true;

        info!(from = %from, to = %next, "Session state changed");
        self.emit(UiEvent::State { from, to: next });

        if next == SessionState::Completed && from != SessionState::Completed {
            self.on_completed();
        } else if from == SessionState::Completed && next != SessionState::Completed {
            self.on_left_completed();
        }
    }

    fn on_completed(&mut self) {
        self.accepting_audio = false;
        self.capture.stop();
        self.playback.stop();
        self.emit(UiEvent::CaptionReplace(
            self.settings.completion_caption.clone(),
        ));

        if self.transport_open {
            self.close_at = Some(Instant::now() + self.settings.close_drain);
        }
    }

    fn on_left_completed(&mut self) {
        self.accepting_audio = true;
        self.close_at = None;

        if self.transport_ready && self.capture_requested {
            if let Err(e) = self.capture.start() {
                warn!(error = %e, "Could not resume capture");
            }
        }
    }

    fn emit(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            debug!("UI sink closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::testing::{ManualInput, ManualOutput};
    use crate::audio::{AudioFrame, CaptureConfig, PlaybackConfig};
    use crate::session::ui::{ui_channel, UiReceiver};

    struct Harness {
        coordinator: SessionCoordinator,
        input: ManualInput,
        output: ManualOutput,
        ui: UiReceiver,
    }

    fn harness() -> Harness {
        let input = ManualInput::new();
        let output = ManualOutput::new(24_000);
        let (ui_tx, ui) = ui_channel();

        let capture = CaptureEncoder::new(
            CaptureConfig {
                target_rate: 16_000,
                pool_size: 4,
                max_block_frames: 4096,
            },
            Box::new(input.clone()),
        );
        let playback = PlaybackEngine::new(
            PlaybackConfig {
                source_rate: 24_000,
                capacity: 24_000,
                queue_capacity: 16,
            },
            Box::new(output.clone()),
        );
        let settings = SessionSettings {
            close_drain: Duration::from_millis(300),
            completion_caption: "Thank you".to_string(),
        };

        Harness {
            coordinator: SessionCoordinator::new(settings, capture, playback, ui_tx),
            input,
            output,
            ui,
        }
    }

    fn pcm(samples: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        crate::audio::pcm::encode_into(samples, &mut bytes);
        bytes
    }

    fn drain_ui(ui: &mut UiReceiver) -> Vec<UiEvent> {
        std::iter::from_fn(|| ui.try_recv().ok()).collect()
    }

    fn ready(h: &mut Harness) {
        h.coordinator.begin().unwrap();
        h.coordinator
            .handle_control_text(r#"{"messageType":"SERVER_READY"}"#)
            .unwrap();
    }

    fn change_state(h: &mut Harness, to: &str) {
        let text = format!(
            r#"{{"messageType":"CHANGE_STATE","content":{{"to":"{}"}}}}"#,
            to
        );
        h.coordinator.handle_control_text(&text).unwrap();
    }

    #[tokio::test]
    async fn test_capture_waits_for_server_ready() {
        let mut h = harness();
        h.coordinator.begin().unwrap();

        assert_eq!(h.coordinator.capture_state(), CaptureState::Idle);
        assert!(h.output.is_open());

        h.coordinator
            .handle_control_text(r#"{"messageType":"SERVER_READY"}"#)
            .unwrap();
        assert_eq!(h.coordinator.capture_state(), CaptureState::Capturing);

        let samples = vec![0.5f32; 3072];
        h.input.feed(AudioFrame::mono(&samples, 48_000));
        match h.coordinator.poll_outbound(Instant::now()) {
            Some(Outbound::Audio(chunk)) => assert_eq!(chunk.sample_count(), 1024),
            other => panic!("expected audio, got {:?}", other),
        }
        assert_eq!(h.coordinator.poll_outbound(Instant::now()), None);
    }

    #[tokio::test]
    async fn test_process_payment_idles_both_engines() {
        let mut h = harness();
        ready(&mut h);
        h.coordinator.handle_audio(pcm(&[0.5; 32]));
        h.output.render(4).unwrap();
        assert_eq!(h.coordinator.playback_state(), PlaybackState::Playing);

        h.coordinator.fire(SessionEvent::ConfirmPayment).unwrap();
        let next = h.coordinator.fire(SessionEvent::ProcessPayment).unwrap();

        assert_eq!(next, SessionState::Completed);
        assert_eq!(h.coordinator.capture_state(), CaptureState::Idle);
        assert_eq!(h.coordinator.playback_state(), PlaybackState::Idle);
        assert!(!h.input.is_open());
        assert_eq!(h.output.render(8).unwrap(), vec![0.0; 8]);
    }

    #[tokio::test]
    async fn test_completed_drops_audio_and_schedules_close() {
        let mut h = harness();
        ready(&mut h);
        change_state(&mut h, "PAYMENT_CONFIRMATION");
        change_state(&mut h, "COMPLETED");

        h.coordinator.handle_audio(pcm(&[0.5; 16]));
        h.coordinator
            .handle_control_text(r#"{"messageType":"OUTPUT_TEXT_CHUNK","content":{"text":"late"}}"#)
            .unwrap();
        assert_eq!(h.output.render(4).unwrap(), vec![0.0; 4]);
        assert_eq!(h.coordinator.snapshot().counters.dropped_audio_chunks, 1);

        let events = drain_ui(&mut h.ui);
        assert_eq!(
            events.last(),
            Some(&UiEvent::CaptionReplace("Thank you".to_string()))
        );

        let deadline = h.coordinator.close_deadline().expect("close scheduled");
        assert_eq!(h.coordinator.poll_outbound(Instant::now()), None);
        assert_eq!(
            h.coordinator.poll_outbound(deadline),
            Some(Outbound::Close {
                reason: CLOSE_REASON_COMPLETED
            })
        );
        assert!(h.coordinator.close_deadline().is_none());
    }

    #[tokio::test]
    async fn test_leaving_completed_resumes_audio() {
        let mut h = harness();
        ready(&mut h);
        change_state(&mut h, "PAYMENT_CONFIRMATION");
        change_state(&mut h, "COMPLETED");

        h.coordinator.fire(SessionEvent::Cancel).unwrap();
        assert_eq!(h.coordinator.state(), SessionState::MenuSelection);
        assert!(h.coordinator.close_deadline().is_none());
        assert_eq!(h.coordinator.capture_state(), CaptureState::Capturing);

        h.coordinator.handle_audio(pcm(&[0.25; 4]));
        assert_eq!(h.output.render(4).unwrap(), vec![0.25; 4]);
    }

    #[tokio::test]
    async fn test_first_chunk_after_state_change_replaces_caption() {
        let mut h = harness();
        ready(&mut h);

        for text in ["Hello", " there"] {
            let message = format!(
                r#"{{"messageType":"OUTPUT_TEXT_CHUNK","content":{{"text":"{}"}}}}"#,
                text
            );
            h.coordinator.handle_control_text(&message).unwrap();
        }
        change_state(&mut h, "PAYMENT_CONFIRMATION");
        h.coordinator
            .handle_control_text(r#"{"messageType":"OUTPUT_TEXT_CHUNK","content":{"text":"Pay"}}"#)
            .unwrap();

        let events = drain_ui(&mut h.ui);
        assert_eq!(
            events,
            vec![
                UiEvent::CaptionReplace("Hello".to_string()),
                UiEvent::CaptionAppend(" there".to_string()),
                UiEvent::State {
                    from: SessionState::MenuSelection,
                    to: SessionState::PaymentConfirmation
                },
                UiEvent::CaptionReplace("Pay".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_event_keeps_state() {
        let mut h = harness();
        ready(&mut h);

        let result = h.coordinator.fire(SessionEvent::ProcessPayment);
        assert!(matches!(result, Err(KioskError::BadRequest(_))));
        assert_eq!(h.coordinator.state(), SessionState::MenuSelection);
        assert_eq!(h.coordinator.snapshot().counters.rejected_events, 1);
    }

    #[tokio::test]
    async fn test_server_directive_outside_table_is_applied() {
        let mut h = harness();
        ready(&mut h);

        change_state(&mut h, "COMPLETED");
        assert_eq!(h.coordinator.state(), SessionState::Completed);
        assert_eq!(h.coordinator.capture_state(), CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_malformed_message_leaves_state() {
        let mut h = harness();
        ready(&mut h);

        let result = h
            .coordinator
            .handle_control_text(r#"{"messageType":"CHANGE_STATE","content":{"to":"CART_CONFIRMATION"}}"#);
        assert!(matches!(result, Err(KioskError::MalformedControlMessage(_))));
        assert_eq!(h.coordinator.state(), SessionState::MenuSelection);
        assert_eq!(h.coordinator.snapshot().counters.malformed_messages, 1);
    }

    #[tokio::test]
    async fn test_payment_request_only_in_payment_confirmation() {
        let mut h = harness();
        ready(&mut h);

        assert!(h.coordinator.request_payment().is_err());

        change_state(&mut h, "PAYMENT_CONFIRMATION");
        h.coordinator.request_payment().unwrap();
        assert_eq!(
            h.coordinator.poll_outbound(Instant::now()),
            Some(Outbound::Control(
                r#"{"messageType":"PROCESS_PAYMENT"}"#.to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_transport_loss_degrades_to_silence() {
        let mut h = harness();
        ready(&mut h);
        h.coordinator.handle_audio(pcm(&[0.5; 16]));

        h.coordinator.on_transport_closed();
        assert_eq!(h.coordinator.capture_state(), CaptureState::Idle);
        assert_eq!(h.output.render(4).unwrap(), vec![0.0; 4]);

        h.coordinator.handle_audio(pcm(&[0.5; 16]));
        assert_eq!(h.output.render(4).unwrap(), vec![0.0; 4]);
        assert_eq!(h.coordinator.poll_outbound(Instant::now()), None);
    }

    #[tokio::test]
    async fn test_end_releases_devices() {
        let mut h = harness();
        ready(&mut h);

        h.coordinator.end();
        assert!(!h.input.is_open());
        assert!(!h.output.is_open());
    }

    #[tokio::test]
    async fn test_microphone_failure_reaches_caller() {
        let mut h = harness();
        h.input.set_failing(true);
        h.coordinator.begin().unwrap();

        let result = h
            .coordinator
            .handle_control_text(r#"{"messageType":"SERVER_READY"}"#);
        assert!(matches!(result, Err(KioskError::DeviceUnavailable(_))));
        assert_eq!(h.coordinator.capture_state(), CaptureState::Idle);
    }
}
