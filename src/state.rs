//! # Application State Management
//!
//! State shared between the session runner and the local HTTP handlers.
//!
//! ## Who writes what:
//! - **session runner**: session snapshots and session metrics
//! - **UI task**: the folded [`UiView`] (caption, cart, state)
//! - **HTTP handlers**: only read, and send [`UserRequest`]s to the runner
//!
//! ## Arc<RwLock<T>> Pattern
//! Every mutable piece is wrapped in `Arc<RwLock<T>>` so the handlers (running on
//! actix worker threads) and the runner can share it. The runner is the only
//! owner of the audio engines; handlers reach them through the action channel.

use crate::config::AppConfig;
use crate::error::{AppResult, KioskError};
use crate::session::runner::{SessionOutcome, UserAction, UserRequest};
use crate::session::{SessionSnapshot, SessionState, UiEvent, UiView};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long an HTTP handler waits for the session runner to answer.
const ACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state, cloned into every HTTP worker.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Effective configuration (read-only after startup)
    pub config: Arc<AppConfig>,

    /// Latest snapshot published by the session runner
    pub session: Arc<RwLock<Option<SessionSnapshot>>>,

    /// What the screen currently shows
    pub view: Arc<RwLock<UiView>>,

    /// Session counters
    pub metrics: Arc<RwLock<KioskMetrics>>,

    /// Channel into the session runner
    actions: mpsc::Sender<UserRequest>,

    /// When the process started
    pub start_time: Instant,
}

/// Counters across all sessions since startup.
#[derive(Debug, Default, Clone, Serialize)]
pub struct KioskMetrics {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_closed_by_server: u64,
    pub transport_losses: u64,
    pub sessions_failed: u64,
    pub current_session: Option<Uuid>,
    pub last_session_started: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AppState {
    /// Shared state for the local API and the session loop.
    pub fn new(config: AppConfig, actions: mpsc::Sender<UserRequest>) -> Self {
        Self {
            config: Arc::new(config),
            session: Arc::new(RwLock::new(None)),
            view: Arc::new(RwLock::new(UiView::default())),
            metrics: Arc::new(RwLock::new(KioskMetrics::default())),
            actions,
            start_time: Instant::now(),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> AppConfig {
        self.config.as_ref().clone()
    }

    /// Seconds since startup.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Latest session snapshot, if a session has run.
    pub fn session_snapshot(&self) -> Option<SessionSnapshot> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the published session snapshot.
    pub fn publish_snapshot(&self, snapshot: SessionSnapshot) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    /// What the screen currently shows.
    pub fn view_snapshot(&self) -> UiView {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fold one UI event into the screen view.
    pub fn apply_ui_event(&self, event: &UiEvent) {
        self.view
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(event);
    }

    /// Copy of the kiosk metrics.
    pub fn metrics_snapshot(&self) -> KioskMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record a new session and return its id.
    pub fn session_started(&self) -> Uuid {
        let id = Uuid::new_v4();
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.sessions_started += 1;
        metrics.current_session = Some(id);
        metrics.last_session_started = Some(Utc::now());
        drop(metrics);

        *self.view.write().unwrap_or_else(PoisonError::into_inner) = UiView::default();
        id
    }

    /// Record how a session ended.
    pub fn session_finished(&self, outcome: SessionOutcome) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.current_session = None;
        match outcome {
            SessionOutcome::Completed => metrics.sessions_completed += 1,
            SessionOutcome::ServerClosed => metrics.sessions_closed_by_server += 1,
            SessionOutcome::TransportLost => metrics.transport_losses += 1,
            SessionOutcome::Shutdown => {}
        }
    }

    /// Record a session that ended with an error.
    pub fn session_failed(&self, error: &KioskError) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.current_session = None;
        metrics.sessions_failed += 1;
        metrics.last_error = Some(error.to_string());
    }

    /// Hand a user action to the session runner and wait for its answer.
    pub async fn dispatch(&self, action: UserAction) -> AppResult<SessionState> {
        let (request, reply) = UserRequest::new(action);

        self.actions
            .send(request)
            .await
            .map_err(|_| KioskError::Internal("Session runner is not running".to_string()))?;

        match tokio::time::timeout(ACTION_TIMEOUT, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KioskError::Internal(
                "Session runner dropped the request".to_string(),
            )),
            Err(_) => Err(KioskError::Internal(
                "Session runner did not answer in time".to_string(),
            )),
        }
    }
}
