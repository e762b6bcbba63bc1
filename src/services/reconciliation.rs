use crate::{
    auth::constant_time_eq,
    errors::ServiceError,
    models::{attendance, event, payment, PaymentStatus},
    processor::{CheckoutSession, PaymentProcessor, SessionPaymentStatus, SessionStatus},
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::payment_state_machine::{apply_transition, Actor, TransitionEffects};

/// Outcome reported to the returning guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerifiedStatus {
    Success,
    Pending,
    Processing,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub payment_status: VerifiedStatus,
    pub payment_required: bool,
    pub payment_id: Uuid,
}

/// Maps the processor's view of a session onto the guest-facing status.
pub fn map_session_status(session: &CheckoutSession) -> VerifiedStatus {
    match session.payment_status {
        SessionPaymentStatus::Paid | SessionPaymentStatus::NoPaymentRequired => {
            VerifiedStatus::Success
        }
        SessionPaymentStatus::Unpaid if session.status == SessionStatus::Expired => {
            VerifiedStatus::Canceled
        }
        SessionPaymentStatus::Unpaid => VerifiedStatus::Pending,
        SessionPaymentStatus::Unknown => VerifiedStatus::Processing,
    }
}

/// Cross-checks a checkout session against the local payment record.
#[derive(Clone)]
pub struct ReconciliationVerifier {
    db: Arc<DatabaseConnection>,
    processor: Arc<dyn PaymentProcessor>,
}

impl ReconciliationVerifier {
    pub fn new(db: Arc<DatabaseConnection>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { db, processor }
    }

    #[instrument(skip(self, guest_token))]
    pub async fn verify(
        &self,
        session_id: &str,
        attendance_id: Uuid,
        guest_token: &str,
    ) -> Result<Verification, ServiceError> {
        let attendance = attendance::Entity::find_by_id(attendance_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|a| constant_time_eq(&a.guest_token, guest_token))
            .ok_or(ServiceError::SessionNotFound)?;

        let event = event::Entity::find_by_id(attendance.event_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::SessionNotFound)?;

        let local = payment::Entity::find()
            .filter(payment::Column::AttendanceId.eq(attendance.id))
            .filter(payment::Column::ProcessorSessionId.eq(session_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let session = self.processor.retrieve_session(session_id).await?;

        let payment = match local {
            Some(payment) => payment,
            None => self.match_by_reference(&session, attendance.id).await?,
        };

        let mut status = map_session_status(&session);
        if status == VerifiedStatus::Success && !payment.status.is_success() {
            debug!(payment_id = %payment.id, "Processor reports success ahead of local ledger");
            status = VerifiedStatus::Processing;
        }

        if status == VerifiedStatus::Canceled && payment.status == PaymentStatus::Pending {
            self.cancel_expired(&payment).await;
        }

        Ok(Verification {
            payment_status: status,
            payment_required: event.is_paid(),
            payment_id: payment.id,
        })
    }

    /// Fallback match through the payment id recorded on the session.
    async fn match_by_reference(
        &self,
        session: &CheckoutSession,
        attendance_id: Uuid,
    ) -> Result<payment::Model, ServiceError> {
        let candidate = session
            .referenced_payment_id()
            .ok_or(ServiceError::SessionNotFound)?;

        let payment = payment::Entity::find_by_id(candidate)
            .filter(payment::Column::AttendanceId.eq(attendance_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::SessionNotFound)?;

        match payment.processor_session_id.as_deref() {
            Some(current) if current != session.id => {
                info!(
                    payment_id = %payment.id,
                    session_id = %session.id,
                    "Session superseded by a newer checkout attempt"
                );
                Err(ServiceError::SessionOutdated)
            }
            Some(_) => Ok(payment),
            None => {
                self.backfill_session_reference(&payment, &session.id).await;
                Ok(payment::Model {
                    processor_session_id: Some(session.id.clone()),
                    ..payment
                })
            }
        }
    }

    async fn backfill_session_reference(&self, payment: &payment::Model, session_id: &str) {
        let result = payment::Entity::update_many()
            .col_expr(
                payment::Column::ProcessorSessionId,
                Expr::value(Some(session_id.to_string())),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::ProcessorSessionId.is_null())
            .exec(&*self.db)
            .await;

        match result {
            Ok(_) => info!(payment_id = %payment.id, %session_id, "Backfilled missing session reference"),
            Err(e) => warn!(payment_id = %payment.id, error = %e, "Session reference backfill failed"),
        }
    }

    /// Expired sessions release the payment so the guest can start over.
    async fn cancel_expired(&self, payment: &payment::Model) {
        let result = apply_transition(
            &*self.db,
            payment,
            PaymentStatus::Canceled,
            Actor::Verifier,
            TransitionEffects::default(),
            Utc::now(),
        )
        .await;

        if let Err(e) = result {
            warn!(payment_id = %payment.id, error = %e, "Could not cancel payment for expired session");
        }
    }
}
