use crate::handlers::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
    Degraded,
}

/// Individual component health details
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    pub database: ComponentHealth,
    pub fee_config: ComponentHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub details: HealthDetails,
    pub response_time_ms: u128,
}

/// Tracks application start time for uptime calculation
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call this on application startup)
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn get_uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

fn component(result: Result<(), String>, latency_ms: u64, down: ComponentStatus) -> ComponentHealth {
    match result {
        Ok(()) => ComponentHealth {
            status: ComponentStatus::Up,
            message: "ok".into(),
            latency_ms: Some(latency_ms),
        },
        Err(message) => ComponentHealth {
            status: down,
            message,
            latency_ms: Some(latency_ms),
        },
    }
}

/// Database reachability decides liveness; an unreadable fee config only
/// degrades the service.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();

    let db_start = Instant::now();
    let db_result = crate::db::check_connection(&state.db)
        .await
        .map_err(|e| e.response_message());
    let database = component(
        db_result,
        db_start.elapsed().as_millis() as u64,
        ComponentStatus::Down,
    );

    let fee_start = Instant::now();
    let fee_result = state
        .fee_store
        .get_config(false)
        .await
        .map(|_| ())
        .map_err(|e| e.response_message());
    let fee_config = component(
        fee_result,
        fee_start.elapsed().as_millis() as u64,
        ComponentStatus::Degraded,
    );

    let status = match (database.status, fee_config.status) {
        (ComponentStatus::Down, _) => ComponentStatus::Down,
        (_, ComponentStatus::Up) => ComponentStatus::Up,
        _ => ComponentStatus::Degraded,
    };
    let code = if status == ComponentStatus::Down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: get_uptime_secs(),
        details: HealthDetails {
            database,
            fee_config,
        },
        response_time_ms: start.elapsed().as_millis(),
    };

    (code, Json(response))
}
