use crate::intercom::broadcast::GetState;
use crate::state::{AppState, Intercom};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::warn;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;

    let (status, intercom) = match &state.intercom {
        Intercom::Live(broadcaster) => match broadcaster.send(GetState).await {
            Ok(broadcast) => ("healthy", json!({ "broadcast": broadcast })),
            Err(err) => {
                warn!(error = %err, "Broadcaster unreachable");
                ("degraded", json!({ "broadcast": null }))
            }
        },
        Intercom::Queue(service) => (
            "healthy",
            json!({
                "queue": {
                    "depth": service.queue().len(),
                    "capacity": service.queue().capacity()
                }
            }),
        ),
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "mode": state.intercom.mode(),
        "dry_run": config.playback.dry_run,
        "connected_clients": state.registry.len(),
        "intercom": intercom
    }))
}
