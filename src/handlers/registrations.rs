use crate::auth::GuestToken;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::registration::{Registration, RegistrationRequest};
use crate::ApiResponse;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{delete, post},
    Router,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct CanceledRegistration {
    pub attendance_id: Uuid,
    pub removed_payments: u64,
}

async fn register(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Json(request): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Registration>>), ServiceError> {
    let registration = state.registrations.register(event_id, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(registration))))
}

async fn cancel_registration(
    State(state): State<AppState>,
    GuestToken(token): GuestToken,
    Path(attendance_id): Path<Uuid>,
) -> Result<Json<ApiResponse<CanceledRegistration>>, ServiceError> {
    let removed_payments = state
        .registrations
        .cancel_registration(attendance_id, &token)
        .await?;
    Ok(Json(ApiResponse::success(CanceledRegistration {
        attendance_id,
        removed_payments,
    })))
}

pub fn registration_routes() -> Router<AppState> {
    Router::new()
        .route("/events/:id/registrations", post(register))
        .route("/attendances/:id", delete(cancel_registration))
}
