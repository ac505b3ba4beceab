//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness, session summary, audio devices
//! - `GET /api/v1/metrics`: capture, playback and transport counters

use crate::audio::device;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};
use tracing::warn;

/// Service health with session and audio device status.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.config.clone();
    let metrics = state.metrics_snapshot();
    let session = state.session_snapshot();

    // cpal enumeration can block on some hosts
    let devices = match web::block(device::device_summary).await {
        Ok(summary) => json!(summary),
        Err(e) => {
            warn!(error = %e, "Audio device enumeration failed");
            Value::Null
        }
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "session": {
            "active": metrics.current_session.is_some(),
            "id": metrics.current_session,
            "state": session.as_ref().map(|s| s.state),
            "transport_open": session.as_ref().map_or(false, |s| s.transport_open),
            "capture": session.as_ref().map(|s| s.capture_state),
            "playback": session.as_ref().map(|s| s.playback_state)
        },
        "audio_devices": devices,
        "memory": get_memory_info()
    }))
}

/// Audio and session counters for monitoring.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let session = state.session_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let completion_rate = if metrics.sessions_started > 0 {
        metrics.sessions_completed as f64 / metrics.sessions_started as f64
    } else {
        0.0
    };

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "started": metrics.sessions_started,
            "completed": metrics.sessions_completed,
            "closed_by_server": metrics.sessions_closed_by_server,
            "transport_losses": metrics.transport_losses,
            "failed": metrics.sessions_failed,
            "completion_rate": completion_rate,
            "last_started": metrics.last_session_started,
            "last_error": metrics.last_error
        },
        "capture": session.as_ref().map(|s| json!(s.capture)),
        "playback": session.as_ref().map(|s| json!(s.playback)),
        "transport": session.as_ref().map(|s| json!(s.counters)),
        "memory": get_memory_info()
    }))
}

/// Resident and virtual memory of this process, from `/proc` on Linux.
fn get_memory_info() -> Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field_bytes = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({ "available": false })
}
