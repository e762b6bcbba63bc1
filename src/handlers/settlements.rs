use crate::auth::AuthenticatedOrganizer;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::settlement::{ExportFilter, SettlementOutcome};
use crate::ApiResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use uuid::Uuid;

pub const EXPORT_TRUNCATED_HEADER: &str = "x-export-truncated";

fn outcome_status(outcome: &SettlementOutcome) -> StatusCode {
    if outcome.already_exists {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}

async fn generate_settlement(
    State(state): State<AppState>,
    organizer: AuthenticatedOrganizer,
    Path(event_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ApiResponse<SettlementOutcome>>), ServiceError> {
    let outcome = state
        .settlements
        .generate(event_id, organizer.organizer_id)
        .await?;
    Ok((outcome_status(&outcome), Json(ApiResponse::success(outcome))))
}

async fn regenerate_settlement(
    State(state): State<AppState>,
    organizer: AuthenticatedOrganizer,
    Path(event_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ApiResponse<SettlementOutcome>>), ServiceError> {
    let outcome = state
        .settlements
        .regenerate_after_refund_or_dispute(event_id, organizer.organizer_id)
        .await?;
    Ok((outcome_status(&outcome), Json(ApiResponse::success(outcome))))
}

/// CSV download of the caller's settlement snapshots.
async fn export_settlements(
    State(state): State<AppState>,
    organizer: AuthenticatedOrganizer,
    Query(filter): Query<ExportFilter>,
) -> Result<Response, ServiceError> {
    let export = state
        .settlements
        .export_csv(organizer.organizer_id, filter)
        .await?;

    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/csv; charset=utf-8"),
        ),
        (
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"settlements.csv\""),
        ),
        (
            HeaderName::from_static(EXPORT_TRUNCATED_HEADER),
            HeaderValue::from_static(if export.truncated { "true" } else { "false" }),
        ),
    ];
    Ok((StatusCode::OK, headers, export.csv).into_response())
}

pub fn settlement_routes() -> Router<AppState> {
    Router::new()
        .route("/events/:id/settlements", post(generate_settlement))
        .route(
            "/events/:id/settlements/regenerate",
            post(regenerate_settlement),
        )
        .route("/settlements/export", get(export_settlements))
}
