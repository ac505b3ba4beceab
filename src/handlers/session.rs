//! Session endpoints used by the kiosk screen.

use crate::error::KioskError;
use crate::session::{SessionEvent, UserAction};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// `GET /api/v1/session`: current state, caption, cart and engine status.
pub async fn get_session(state: web::Data<AppState>) -> Result<HttpResponse, KioskError> {
    let metrics = state.metrics_snapshot();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session_id": metrics.current_session,
        "view": state.view_snapshot(),
        "session": state.session_snapshot()
    })))
}

/// `POST /api/v1/session/start`: touch to start.
pub async fn start_session(state: web::Data<AppState>) -> Result<HttpResponse, KioskError> {
    let session_state = state.dispatch(UserAction::StartSession).await?;
    info!("Session start requested from the screen");

    Ok(HttpResponse::Accepted().json(json!({
        "status": "started",
        "state": session_state
    })))
}

/// `POST /api/v1/session/payment`: the customer confirmed payment.
pub async fn request_payment(state: web::Data<AppState>) -> Result<HttpResponse, KioskError> {
    let session_state = state.dispatch(UserAction::RequestPayment).await?;

    Ok(HttpResponse::Accepted().json(json!({
        "status": "payment_requested",
        "state": session_state
    })))
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub event: SessionEvent,
}

/// `POST /api/v1/session/event`: a navigation button, e.g. `{"event": "PREVIOUS"}`.
pub async fn fire_event(
    state: web::Data<AppState>,
    body: web::Json<EventRequest>,
) -> Result<HttpResponse, KioskError> {
    let event = body.into_inner().event;
    let session_state = state.dispatch(UserAction::Event(event)).await?;

    Ok(HttpResponse::Ok().json(json!({
        "event": event,
        "state": session_state
    })))
}
