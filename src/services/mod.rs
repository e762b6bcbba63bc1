// Fees
pub mod fee_calculator;
pub mod fee_config_store;

// Payment lifecycle
pub mod payment_gateway;
pub mod payment_state_machine;
pub mod reconciliation;
pub mod registration;

// Payouts and event editing
pub mod restrictions;
pub mod settlement;

use crate::{
    errors::ServiceError,
    models::{attendance, event},
};
use sea_orm::{ConnectionTrait, EntityTrait};
use uuid::Uuid;

/// Loads an attendance together with the event it belongs to.
pub(crate) async fn load_attendance_and_event<C: ConnectionTrait>(
    conn: &C,
    attendance_id: Uuid,
) -> Result<(attendance::Model, event::Model), ServiceError> {
    let (attendance, event) = attendance::Entity::find_by_id(attendance_id)
        .find_also_related(event::Entity)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound("Attendance not found".into()))?;

    let event = event.ok_or_else(|| ServiceError::NotFound("Event not found".into()))?;
    Ok((attendance, event))
}
