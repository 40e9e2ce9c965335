use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn config_body(config: &crate::config::AppConfig) -> serde_json::Value {
    // The token itself never leaves the server; only its path is reported.
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "recognizer": {
            "url": config.recognizer.url,
            "credentials_path": config.recognizer.credentials_path
        },
        "relay": {
            "max_concurrent_sessions": config.relay.max_concurrent_sessions
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_body(&config)
    })))
}

/// Apply a partial configuration update. Running sessions keep the settings
/// they started with; only new sessions see the update.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ConfigInvalid(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ConfigInvalid)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_body(&current_config)
    })))
}
