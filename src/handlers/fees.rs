use crate::auth::AdminUser;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::fee_calculator::{FeeBreakdown, FeeConfig};
use crate::ApiResponse;
use axum::{
    extract::{Json, State},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct FeePreviewRequest {
    #[validate(length(min = 1, max = 100))]
    pub amounts: Vec<i64>,
}

/// Platform fee for each candidate amount, priced against one config read.
async fn preview_fees(
    State(state): State<AppState>,
    Json(request): Json<FeePreviewRequest>,
) -> Result<Json<ApiResponse<Vec<FeeBreakdown>>>, ServiceError> {
    request.validate()?;
    let breakdowns = state.fees.calculate_batch(&request.amounts).await?;
    Ok(Json(ApiResponse::success(breakdowns)))
}

async fn get_fee_config(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<ApiResponse<FeeConfig>>, ServiceError> {
    let config = state.fee_store.get_config(true).await?;
    Ok(Json(ApiResponse::success(config)))
}

async fn update_fee_config(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(config): Json<FeeConfig>,
) -> Result<Json<ApiResponse<FeeConfig>>, ServiceError> {
    let saved = state.fee_store.update_config(config).await?;
    info!(admin_id = %admin.organizer_id, "Fee configuration updated");
    Ok(Json(ApiResponse::success(saved)))
}

async fn invalidate_fee_config(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<ApiResponse<&'static str>>, ServiceError> {
    state.fee_store.invalidate().await;
    Ok(Json(ApiResponse::success("invalidated")))
}

pub fn fee_routes() -> Router<AppState> {
    Router::new()
        .route("/fees/preview", post(preview_fees))
        .route(
            "/admin/fee-config",
            get(get_fee_config).put(update_fee_config),
        )
        .route("/admin/fee-config/invalidate", post(invalidate_fee_config))
}
