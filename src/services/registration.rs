use crate::{
    auth::constant_time_eq,
    db::with_transaction,
    errors::ServiceError,
    models::{attendance, event, payment, AttendanceStatus, EventStatus, PaymentMethod, PaymentStatus},
};
use chrono::Utc;
use metrics::counter;
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::payment_gateway::insert_cash_payment;

fn default_status() -> AttendanceStatus {
    AttendanceStatus::Attending
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegistrationRequest {
    #[validate(length(min = 1, max = 50))]
    pub nickname: String,
    #[validate(email)]
    pub email: Option<String>,
    pub user_id: Option<Uuid>,
    #[serde(default = "default_status")]
    pub status: AttendanceStatus,
    /// Required when attending a paid event
    pub payment_method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub attendance_id: Uuid,
    /// Shown once; lets the guest check their own payment later
    pub guest_token: String,
    pub payment_id: Option<Uuid>,
    pub payment_required: bool,
}

pub fn generate_guest_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Combined attendance + payment registration boundary.
#[derive(Clone)]
pub struct RegistrationService {
    db: Arc<DatabaseConnection>,
}

impl RegistrationService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Registers a participant. Attending a paid event with the cash method
    /// also creates the pending cash payment; card payments are created at
    /// checkout. Free events never create a payment.
    #[instrument(skip(self, request), fields(nickname = %request.nickname))]
    pub async fn register(
        &self,
        event_id: Uuid,
        request: RegistrationRequest,
    ) -> Result<Registration, ServiceError> {
        request.validate()?;
        let guest_token = generate_guest_token();

        let registration = with_transaction(&self.db, move |txn| {
            Box::pin(async move {
                let event = event::Entity::find_by_id(event_id)
                    .one(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| ServiceError::NotFound("Event not found".into()))?;

                if event.status != EventStatus::Upcoming {
                    return Err(ServiceError::InvalidOperation(format!(
                        "Registration is closed for {} events",
                        event.status
                    )));
                }

                let attending = request.status == AttendanceStatus::Attending;
                if attending {
                    if let Some(limit) = event.capacity.filter(|c| *c > 0) {
                        let taken = attendance::Entity::find()
                            .filter(attendance::Column::EventId.eq(event.id))
                            .filter(attendance::Column::Status.eq(AttendanceStatus::Attending))
                            .count(txn)
                            .await
                            .map_err(ServiceError::db_error)?;
                        if taken >= limit as u64 {
                            return Err(ServiceError::Conflict("Event is full".into()));
                        }
                    }
                }

                let method = match (attending && event.is_paid(), request.payment_method) {
                    (false, _) => None,
                    (true, None) => {
                        return Err(ServiceError::ValidationError(
                            "A payment method is required for this event".into(),
                        ))
                    }
                    (true, Some(m)) if !event.accepts(m) => {
                        return Err(ServiceError::InvalidOperation(format!(
                            "This event does not accept {m} payments"
                        )))
                    }
                    (true, Some(m)) => Some(m),
                };

                let now = Utc::now();
                let attendance = attendance::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    event_id: Set(event.id),
                    user_id: Set(request.user_id),
                    nickname: Set(request.nickname.trim().to_string()),
                    email: Set(request.email.clone()),
                    guest_token: Set(guest_token.clone()),
                    status: Set(request.status),
                    created_at: Set(now),
                }
                .insert(txn)
                .await
                .map_err(ServiceError::db_error)?;

                let payment_id = match method {
                    Some(PaymentMethod::Cash) => {
                        Some(insert_cash_payment(txn, attendance.id, event.fee, now).await?.id)
                    }
                    _ => None,
                };

                Ok(Registration {
                    attendance_id: attendance.id,
                    guest_token,
                    payment_id,
                    payment_required: event.is_paid(),
                })
            })
        })
        .await?;

        counter!("eventpay_registrations.created", 1);
        info!(
            %event_id,
            attendance_id = %registration.attendance_id,
            payment_id = ?registration.payment_id,
            "Registration recorded"
        );
        Ok(registration)
    }

    /// Guest-initiated withdrawal before any payment has started.
    pub async fn cancel_registration(
        &self,
        attendance_id: Uuid,
        guest_token: &str,
    ) -> Result<u64, ServiceError> {
        let owned = attendance::Entity::find_by_id(attendance_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .is_some_and(|a| constant_time_eq(&a.guest_token, guest_token));
        if !owned {
            return Err(ServiceError::NotFound("Attendance not found".into()));
        }
        self.rollback_registration(attendance_id).await
    }

    /// Undoes a registration whose payment never started. Rows that have
    /// progressed past `pending` are kept for audit and block the rollback.
    #[instrument(skip(self))]
    pub async fn rollback_registration(&self, attendance_id: Uuid) -> Result<u64, ServiceError> {
        with_transaction(&self.db, move |txn| {
            Box::pin(async move {
                let payments = payment::Entity::find()
                    .filter(payment::Column::AttendanceId.eq(attendance_id))
                    .all(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                if let Some(progressed) = payments
                    .iter()
                    .find(|p| p.status != PaymentStatus::Pending || p.processor_session_id.is_some())
                {
                    return Err(ServiceError::InvalidOperation(format!(
                        "Payment {} has already started and cannot be rolled back",
                        progressed.id
                    )));
                }

                let removed = payment::Entity::delete_many()
                    .filter(payment::Column::AttendanceId.eq(attendance_id))
                    .filter(payment::Column::Status.eq(PaymentStatus::Pending))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .rows_affected;

                let deleted = attendance::Entity::delete_by_id(attendance_id)
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                if deleted.rows_affected == 0 {
                    return Err(ServiceError::NotFound("Attendance not found".into()));
                }

                info!(%attendance_id, removed, "Registration rolled back");
                Ok(removed)
            })
        })
        .await
    }
}
