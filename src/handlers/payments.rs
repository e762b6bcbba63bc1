use crate::auth::{AuthenticatedOrganizer, GuestToken};
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::models::{payment, PaymentStatus};
use crate::services::{payment_gateway::CardSession, reconciliation::Verification};
use crate::ApiResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateCashPaymentRequest {
    /// Minor currency units
    #[validate(range(min = 1))]
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedPayment {
    pub payment_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatePaymentStatusRequest {
    pub status: PaymentStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifySessionQuery {
    pub session_id: String,
    pub attendance_id: Uuid,
}

/// Organizer records a cash charge for an attendance.
async fn create_cash_payment(
    State(state): State<AppState>,
    organizer: AuthenticatedOrganizer,
    Path(attendance_id): Path<Uuid>,
    Json(request): Json<CreateCashPaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CreatedPayment>>), ServiceError> {
    request.validate()?;

    let payment_id = state
        .gateway
        .create_cash_payment_for_organizer(organizer.organizer_id, attendance_id, request.amount)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreatedPayment { payment_id })),
    ))
}

/// Guest starts (or resumes) card checkout for their attendance.
async fn create_card_session(
    State(state): State<AppState>,
    GuestToken(token): GuestToken,
    Path(attendance_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ApiResponse<CardSession>>), ServiceError> {
    let session = state
        .gateway
        .checkout_for_guest(attendance_id, &token)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(session))))
}

async fn update_payment_status(
    State(state): State<AppState>,
    organizer: AuthenticatedOrganizer,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<UpdatePaymentStatusRequest>,
) -> Result<Json<ApiResponse<payment::Model>>, ServiceError> {
    let updated = state
        .state_machine
        .update_cash_status(payment_id, organizer.organizer_id, request.status)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// Guest return page: cross-checks the session with the processor.
async fn verify_session(
    State(state): State<AppState>,
    GuestToken(token): GuestToken,
    Query(query): Query<VerifySessionQuery>,
) -> Result<Json<ApiResponse<Verification>>, ServiceError> {
    let verification = state
        .verifier
        .verify(&query.session_id, query.attendance_id, &token)
        .await?;
    Ok(Json(ApiResponse::success(verification)))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/attendances/:id/payments/cash",
            post(create_cash_payment),
        )
        .route(
            "/attendances/:id/payments/card",
            post(create_card_session),
        )
        .route("/payments/verify", get(verify_session))
        .route("/payments/:id/status", patch(update_payment_status))
}
