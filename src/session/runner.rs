//! # Session Runner
//!
//! Drives one WebSocket session per customer and restarts sessions for as long
//! as the kiosk runs.
//!
//! ## Session Loop:
//! 1. Connect to `{base}/stores/{store}/websocket/kioskSession?accessToken=...`
//! 2. `begin` the coordinator (speaker opens, capture is requested)
//! 3. `select!` over inbound messages, the outbound poll tick, user actions,
//!    the post-completion close deadline and shutdown
//! 4. On close or transport loss the coordinator degrades and the session ends
//!
//! Between sessions the runner waits `restart_delay_ms`, then either starts
//! again on its own (`auto_start`) or waits for a start request from the screen.

use super::coordinator::{Outbound, SessionCoordinator, SessionSettings};
use super::state::{SessionEvent, SessionState};
use crate::audio::device::{CpalInput, CpalOutput};
use crate::audio::{CaptureConfig, CaptureEncoder, PlaybackConfig, PlaybackEngine};
use crate::config::AppConfig;
use crate::error::{AppResult, KioskError};
use crate::state::AppState;
use futures_util::{Sink, SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

/// Close reason sent when the kiosk shuts down mid-session.
pub const CLOSE_REASON_SHUTDOWN: &str = "Client closed";

/// How often the session snapshot is republished for the status API.
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(500);

/// Something the customer did on the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Touch to start a new session
    StartSession,
    /// Confirm payment
    RequestPayment,
    /// A navigation button (previous, cancel, ...)
    Event(SessionEvent),
}

/// A [`UserAction`] together with the channel its result goes back on.
#[derive(Debug)]
pub struct UserRequest {
    pub action: UserAction,
    pub reply: oneshot::Sender<AppResult<SessionState>>,
}

impl UserRequest {
    /// Request plus the receiver its reply arrives on.
    pub fn new(action: UserAction) -> (Self, oneshot::Receiver<AppResult<SessionState>>) {
        let (reply, rx) = oneshot::channel();
        (Self { action, reply }, rx)
    }

    fn respond(self, result: AppResult<SessionState>) {
        if self.reply.send(result).is_err() {
            debug!(action = ?self.action, "Requester went away before the reply");
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The order completed and the kiosk closed the connection
    Completed,
    /// The server closed the connection
    ServerClosed,
    /// The connection failed
    TransportLost,
    /// The kiosk is shutting down
    Shutdown,
}

/// Run sessions until shutdown.
///
/// The coordinator and its engines live for the whole process; audio devices
/// are acquired at the start of every session and released at its end.
pub async fn run_kiosk(
    state: AppState,
    mut actions: mpsc::Receiver<UserRequest>,
    ui: super::ui::UiSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = state.config();
    let mut coordinator = build_coordinator(&config, ui);
    let restart_delay = Duration::from_millis(config.session.restart_delay_ms);

    loop {
        if !config.session.auto_start {
            info!("Waiting for a customer to start a session");
            if !wait_for_start(&mut coordinator, &mut actions, &mut shutdown).await {
                break;
            }
        }

        let session_id = state.session_started();
        info!(%session_id, "Starting kiosk session");

        let result = run_session(&mut coordinator, &config, &state, &mut actions, &mut shutdown).await;
        coordinator.end();
        state.publish_snapshot(coordinator.snapshot());

        match result {
            Ok(outcome) => {
                info!(%session_id, ?outcome, "Session finished");
                state.session_finished(outcome);
                if outcome == SessionOutcome::Shutdown {
                    break;
                }
            }
            Err(e) => {
                error!(%session_id, error = %e, "Session failed");
                state.session_failed(&e);
            }
        }

        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = time::sleep(restart_delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!("Kiosk session loop stopped");
}

fn build_coordinator(config: &AppConfig, ui: super::ui::UiSender) -> SessionCoordinator {
    let audio = &config.audio;
    let capture = CaptureEncoder::new(
        CaptureConfig::from(audio),
        Box::new(CpalInput::new(audio.input_device.clone(), audio.max_block_frames)),
    );
    let playback = PlaybackEngine::new(
        PlaybackConfig::from(config),
        Box::new(CpalOutput::new(audio.output_device.clone(), audio.max_block_frames)),
    );
    SessionCoordinator::new(SessionSettings::from(config), capture, playback, ui)
}

/// Block until a start request arrives. Returns false on shutdown.
async fn wait_for_start(
    coordinator: &mut SessionCoordinator,
    actions: &mut mpsc::Receiver<UserRequest>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            request = actions.recv() => match request {
                Some(request) if request.action == UserAction::StartSession => {
                    request.respond(Ok(SessionState::MenuSelection));
                    return true;
                }
                Some(request) => {
                    let result = idle_action(coordinator, request.action);
                    request.respond(result);
                }
                None => return false,
            },
            _ = shutdown.changed() => return false,
        }
    }
}

fn idle_action(coordinator: &SessionCoordinator, action: UserAction) -> AppResult<SessionState> {
    debug!(?action, state = %coordinator.state(), "Action outside a session");
    Err(KioskError::BadRequest("No active session".to_string()))
}

/// Run one session to completion.
pub async fn run_session(
    coordinator: &mut SessionCoordinator,
    config: &AppConfig,
    state: &AppState,
    actions: &mut mpsc::Receiver<UserRequest>,
    shutdown: &mut watch::Receiver<bool>,
) -> AppResult<SessionOutcome> {
    let transport = &config.transport;
    info!(url = %transport.redacted_session_url(), "Connecting to ordering server");

    let connect = time::timeout(
        Duration::from_millis(transport.connect_timeout_ms),
        tokio_tungstenite::connect_async(transport.session_url()),
    );
    let socket = tokio::select! {
        result = connect => match result {
            Ok(connected) => connected?.0,
            Err(_) => {
                return Err(KioskError::TransportClosed(format!(
                    "No answer from ordering server within {} ms",
                    transport.connect_timeout_ms
                )));
            }
        },
        _ = shutdown.changed() => {
            info!("Shutdown while connecting");
            return Ok(SessionOutcome::Shutdown);
        }
    };
    let (mut sink, mut stream) = socket.split();

    if let Err(e) = coordinator.begin() {
        if let Err(close_err) = close(&mut sink, CLOSE_REASON_SHUTDOWN).await {
            debug!(error = %close_err, "Close after failed start failed");
        }
        return Err(e);
    }

    let mut poll = time::interval(Duration::from_millis(config.audio.capture_poll_ms));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_snapshot = Instant::now();

    let outcome = loop {
        let deadline = coordinator.close_deadline();

        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(bytes))) => coordinator.handle_audio(bytes),
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = coordinator.handle_control_text(&text) {
                        if e.is_device_failure() {
                            error!(error = %e, "Microphone unavailable");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "Server closed the session");
                    break SessionOutcome::ServerClosed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Session transport error");
                    break SessionOutcome::TransportLost;
                }
                None => break SessionOutcome::TransportLost,
            },
            _ = poll.tick() => {
                if let Some(outcome) = flush_outbound(coordinator, &mut sink).await {
                    break outcome;
                }
                if last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
                    state.publish_snapshot(coordinator.snapshot());
                    last_snapshot = Instant::now();
                }
            }
            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(outcome) = flush_outbound(coordinator, &mut sink).await {
                    break outcome;
                }
            }
            Some(request) = actions.recv() => {
                let result = session_action(coordinator, request.action);
                request.respond(result);
                if let Some(outcome) = flush_outbound(coordinator, &mut sink).await {
                    break outcome;
                }
            }
            _ = shutdown.changed() => {
                if let Err(e) = close(&mut sink, CLOSE_REASON_SHUTDOWN).await {
                    debug!(error = %e, "Close on shutdown failed");
                }
                break SessionOutcome::Shutdown;
            }
        }
    };

    coordinator.on_transport_closed();
    Ok(outcome)
}

fn session_action(coordinator: &mut SessionCoordinator, action: UserAction) -> AppResult<SessionState> {
    match action {
        UserAction::StartSession => Ok(coordinator.state()),
        UserAction::RequestPayment => coordinator.request_payment().map(|_| coordinator.state()),
        UserAction::Event(event) => coordinator.fire(event),
    }
}

/// Send everything the coordinator has queued. Returns an outcome when the
/// session is over.
async fn flush_outbound<S>(coordinator: &mut SessionCoordinator, sink: &mut S) -> Option<SessionOutcome>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(item) = coordinator.poll_outbound(Instant::now()) {
        let sent = match item {
            Outbound::Audio(chunk) => sink.send(Message::Binary(chunk.into_bytes())).await,
            Outbound::Control(text) => sink.send(Message::Text(text)).await,
            Outbound::Close { reason } => {
                info!(reason, "Closing session");
                if let Err(e) = close(sink, reason).await {
                    debug!(error = %e, "Close failed");
                }
                return Some(SessionOutcome::Completed);
            }
        };

        if let Err(e) = sent {
            warn!(error = %e, "Failed to send to ordering server");
            return Some(SessionOutcome::TransportLost);
        }
    }
    None
}

async fn close<S>(sink: &mut S, reason: &'static str) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed(reason),
    })))
    .await
}
