use crate::{error::KioskError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration with the access token masked.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, KioskError> {
    let config = state.config();
    let token_set = !config.transport.access_token.is_empty();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": config.server,
            "transport": {
                "base_url": config.transport.base_url,
                "store_id": config.transport.store_id,
                "access_token": if token_set { "***" } else { "" },
                "close_drain_ms": config.transport.close_drain_ms,
                "connect_timeout_ms": config.transport.connect_timeout_ms,
                "session_url": config.transport.redacted_session_url()
            },
            "audio": config.audio,
            "session": config.session
        }
    })))
}
