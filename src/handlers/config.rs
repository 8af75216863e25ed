use crate::config::{AppConfig, IntercomMode};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

/// Branding and timing the web client needs before it connects.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(client_config(&state.config))
}

pub fn client_config(config: &AppConfig) -> Value {
    let mut body = json!({
        "app_name": config.branding.app_name,
        "favicon_letter": config.branding.favicon_letter,
        "favicon_bg_color": config.branding.favicon_bg_color,
        "favicon_text_color": config.branding.favicon_text_color,
        "mode": config.intercom.mode
    });

    match config.intercom.mode {
        IntercomMode::Queue => {
            body["max_recording_seconds"] = json!(config.intercom.max_recording_seconds);
        }
        IntercomMode::Live => {
            body["broadcast_timeout_seconds"] = json!(config.intercom.broadcast_timeout_seconds);
        }
    }

    body
}
