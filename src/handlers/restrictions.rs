use crate::auth::AuthenticatedOrganizer;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::restrictions::{EventFormData, RestrictionReport};
use crate::ApiResponse;
use axum::{
    extract::{Json, Path, State},
    routing::post,
    Router,
};
use uuid::Uuid;

/// Evaluates a proposed edit of an event against the edit restrictions.
async fn evaluate_restrictions(
    State(state): State<AppState>,
    organizer: AuthenticatedOrganizer,
    Path(event_id): Path<Uuid>,
    Json(form): Json<EventFormData>,
) -> Result<Json<ApiResponse<RestrictionReport>>, ServiceError> {
    let report = state
        .restrictions
        .evaluate_for_event(event_id, organizer.organizer_id, &form)
        .await?;
    Ok(Json(ApiResponse::success(report)))
}

pub fn restriction_routes() -> Router<AppState> {
    Router::new().route("/events/:id/restrictions", post(evaluate_restrictions))
}
