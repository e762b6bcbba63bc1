pub mod fees;
pub mod health;
pub mod payments;
pub mod registrations;
pub mod restrictions;
pub mod settlements;

use axum::Router;

pub use crate::AppState;

/// Every `/api/v1` route.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(payments::payment_routes())
        .merge(registrations::registration_routes())
        .merge(settlements::settlement_routes())
        .merge(restrictions::restriction_routes())
        .merge(fees::fee_routes())
}
