use crate::{
    auth::constant_time_eq,
    config::AppConfig,
    db::is_unique_violation,
    errors::ServiceError,
    models::{attendance, event, payment, AttendanceStatus, PaymentMethod, PaymentStatus},
    processor::{
        create_session_with_retry,
        idempotency::{derive_key, IdempotencyKeyParts, IdempotencyWindow, CREATE_CHECKOUT_SESSION},
        CheckoutSessionRequest, PaymentProcessor, RetryPolicy,
    },
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    fee_calculator::{FeeBreakdown, FeeCalculator},
    load_attendance_and_event,
    payment_state_machine::{apply_transition, Actor, TransitionEffects},
};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub currency: String,
    pub public_base_url: String,
    pub idempotency_window: IdempotencyWindow,
    pub session_expiry: chrono::Duration,
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for GatewaySettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            currency: cfg.currency.clone(),
            public_base_url: cfg.public_base_url.trim_end_matches('/').to_string(),
            idempotency_window: IdempotencyWindow::new(cfg.idempotency_window_secs),
            session_expiry: cfg.checkout_session_expiry(),
            retry: RetryPolicy {
                max_attempts: cfg.processor_max_attempts,
                base_delay: cfg.processor_retry_base_delay(),
            },
        }
    }
}

/// Checkout session handed back to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSession {
    pub payment_id: Uuid,
    pub session_id: String,
    pub session_url: Option<String>,
}

/// Inserts a pending cash payment. A second active payment for the same
/// attendance is rejected by the active-payment unique index.
pub(crate) async fn insert_cash_payment<C: ConnectionTrait>(
    conn: &C,
    attendance_id: Uuid,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<payment::Model, ServiceError> {
    ensure_positive(amount)?;
    new_payment(attendance_id, PaymentMethod::Cash, amount, None, now)
        .insert(conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::PaymentAlreadyExists(attendance_id)
            } else {
                ServiceError::db_error(e)
            }
        })
}

fn new_payment(
    attendance_id: Uuid,
    method: PaymentMethod,
    amount: i64,
    fees: Option<&FeeBreakdown>,
    now: DateTime<Utc>,
) -> payment::ActiveModel {
    payment::ActiveModel {
        id: Set(Uuid::new_v4()),
        attendance_id: Set(attendance_id),
        method: Set(method),
        amount: Set(amount),
        status: Set(PaymentStatus::Pending),
        processor_session_id: Set(None),
        processor_payment_intent_id: Set(None),
        application_fee_amount: Set(fees.map(|f| f.platform_fee)),
        processor_fee_amount: Set(fees.map(|f| f.processor_fee_estimate)),
        refunded_amount: Set(0),
        disputed_amount: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        paid_at: Set(None),
    }
}

fn ensure_positive(amount: i64) -> Result<(), ServiceError> {
    if amount <= 0 {
        return Err(ServiceError::ValidationError(
            "Payment amount must be a positive number of minor units".into(),
        ));
    }
    Ok(())
}

pub(crate) async fn find_active_payment<C: ConnectionTrait>(
    conn: &C,
    attendance_id: Uuid,
) -> Result<Option<payment::Model>, ServiceError> {
    payment::Entity::find()
        .filter(payment::Column::AttendanceId.eq(attendance_id))
        .filter(payment::Column::Status.ne(PaymentStatus::Canceled))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Creates payment rows and checkout sessions.
#[derive(Clone)]
pub struct PaymentGateway {
    db: Arc<DatabaseConnection>,
    processor: Arc<dyn PaymentProcessor>,
    fees: FeeCalculator,
    settings: GatewaySettings,
}

impl PaymentGateway {
    pub fn new(
        db: Arc<DatabaseConnection>,
        processor: Arc<dyn PaymentProcessor>,
        fees: FeeCalculator,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            db,
            processor,
            fees,
            settings,
        }
    }

    #[instrument(skip(self))]
    pub async fn create_cash_payment(
        &self,
        attendance_id: Uuid,
        amount: i64,
    ) -> Result<Uuid, ServiceError> {
        attendance::Entity::find_by_id(attendance_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Attendance not found".into()))?;

        let created = insert_cash_payment(&*self.db, attendance_id, amount, Utc::now()).await?;

        counter!("eventpay_payments.created", 1, "method" => "cash");
        info!(payment_id = %created.id, %attendance_id, amount, "Cash payment created");
        Ok(created.id)
    }

    /// Organizer-initiated cash charge; only the event owner may record one.
    pub async fn create_cash_payment_for_organizer(
        &self,
        organizer_id: Uuid,
        attendance_id: Uuid,
        amount: i64,
    ) -> Result<Uuid, ServiceError> {
        let (_, event) = load_attendance_and_event(&*self.db, attendance_id).await?;
        if event.organizer_id != organizer_id {
            return Err(ServiceError::Forbidden(
                "Only the event organizer can record cash payments".into(),
            ));
        }
        self.create_cash_payment(attendance_id, amount).await
    }

    pub async fn create_card_session(
        &self,
        attendance: &attendance::Model,
        amount: i64,
        event: &event::Model,
    ) -> Result<CardSession, ServiceError> {
        self.create_card_session_at(attendance, amount, event, Utc::now())
            .await
    }

    /// Guest checkout: the guest token must match the attendance, and the
    /// charge is always the event's current fee.
    #[instrument(skip(self, guest_token))]
    pub async fn checkout_for_guest(
        &self,
        attendance_id: Uuid,
        guest_token: &str,
    ) -> Result<CardSession, ServiceError> {
        let (attendance, event) = load_attendance_and_event(&*self.db, attendance_id).await?;
        if !constant_time_eq(&attendance.guest_token, guest_token) {
            return Err(ServiceError::NotFound("Attendance not found".into()));
        }
        if attendance.status != AttendanceStatus::Attending {
            return Err(ServiceError::InvalidOperation(
                "Only attending participants can pay".into(),
            ));
        }
        if !event.is_paid() {
            return Err(ServiceError::InvalidOperation(
                "This event does not charge a fee".into(),
            ));
        }
        self.create_card_session(&attendance, event.fee, &event).await
    }

    #[instrument(skip(self, attendance, event, now), fields(attendance_id = %attendance.id, event_id = %event.id))]
    pub async fn create_card_session_at(
        &self,
        attendance: &attendance::Model,
        amount: i64,
        event: &event::Model,
        now: DateTime<Utc>,
    ) -> Result<CardSession, ServiceError> {
        ensure_positive(amount)?;
        if attendance.event_id != event.id {
            return Err(ServiceError::InvalidOperation(
                "Attendance does not belong to this event".into(),
            ));
        }
        if !event.accepts(PaymentMethod::Card) {
            return Err(ServiceError::InvalidOperation(
                "This event does not accept card payments".into(),
            ));
        }
        let destination = event.processor_account_id.clone().ok_or_else(|| {
            ServiceError::InvalidOperation(
                "The organizer has not connected a payout account".into(),
            )
        })?;

        let fees = self.fees.calculate(amount).await?;
        let payment = self
            .reserve_card_payment(attendance.id, amount, &fees, now)
            .await?;

        let key = derive_key(
            &IdempotencyKeyParts {
                operation: CREATE_CHECKOUT_SESSION,
                event_id: event.id,
                subject_id: attendance.user_id.unwrap_or(attendance.id),
                amount,
                currency: &self.settings.currency,
            },
            self.settings.idempotency_window.bucket(now),
        );

        let request = CheckoutSessionRequest {
            payment_id: payment.id,
            attendance_id: attendance.id,
            event_id: event.id,
            product_name: event.title.clone(),
            amount,
            currency: self.settings.currency.clone(),
            success_url: format!(
                "{}/payments/complete?session_id={{CHECKOUT_SESSION_ID}}&attendance_id={}",
                self.settings.public_base_url, attendance.id
            ),
            cancel_url: format!(
                "{}/events/{}?payment=canceled",
                self.settings.public_base_url, event.id
            ),
            customer_email: attendance.email.clone(),
            application_fee_amount: fees.platform_fee,
            destination_account: destination,
            transfer_group: transfer_group(event.id),
            // Anchored to the bucket so an idempotent replay sends identical parameters
            expires_at: self.settings.idempotency_window.bucket_end(now) + self.settings.session_expiry,
        };

        let session = create_session_with_retry(
            self.processor.as_ref(),
            &request,
            &key,
            self.settings.retry,
        )
        .await
        .map_err(|e| {
            warn!(payment_id = %payment.id, error = %e, "Checkout session could not be created");
            ServiceError::from(e)
        })?;

        self.persist_session_reference(&payment, &session.id).await;

        info!(
            payment_id = %payment.id,
            session_id = %session.id,
            platform_fee = fees.platform_fee,
            "Checkout session issued"
        );

        Ok(CardSession {
            payment_id: payment.id,
            session_id: session.id,
            session_url: session.url,
        })
    }

    /// Finds or creates the single active card payment for an attendance.
    async fn reserve_card_payment(
        &self,
        attendance_id: Uuid,
        amount: i64,
        fees: &FeeBreakdown,
        now: DateTime<Utc>,
    ) -> Result<payment::Model, ServiceError> {
        if let Some(existing) = find_active_payment(&*self.db, attendance_id).await? {
            return self.reuse_payment(existing, amount, fees, now).await;
        }

        let inserted = new_payment(attendance_id, PaymentMethod::Card, amount, Some(fees), now)
            .insert(&*self.db)
            .await;

        match inserted {
            Ok(created) => {
                counter!("eventpay_payments.created", 1, "method" => "card");
                Ok(created)
            }
            Err(e) if is_unique_violation(&e) => {
                info!(%attendance_id, "Concurrent payment insert detected; reconciling with existing row");
                let existing = find_active_payment(&*self.db, attendance_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::Conflict(
                            "Payment changed concurrently; retry the checkout".into(),
                        )
                    })?;
                self.reuse_payment(existing, amount, fees, now).await
            }
            Err(e) => Err(ServiceError::db_error(e)),
        }
    }

    async fn reuse_payment(
        &self,
        existing: payment::Model,
        amount: i64,
        fees: &FeeBreakdown,
        now: DateTime<Utc>,
    ) -> Result<payment::Model, ServiceError> {
        if existing.status.is_success() || existing.method != PaymentMethod::Card {
            return Err(ServiceError::PaymentAlreadyExists(existing.attendance_id));
        }

        let effects = TransitionEffects {
            amount: Some(amount),
            application_fee_amount: Some(fees.platform_fee),
            processor_fee_amount: Some(fees.processor_fee_estimate),
            clear_processor_refs: true,
            processor_payment_intent_id: None,
        };

        match existing.status {
            PaymentStatus::Failed => {
                apply_transition(
                    &*self.db,
                    &existing,
                    PaymentStatus::Pending,
                    Actor::Gateway,
                    effects,
                    now,
                )
                .await
            }
            _ => self.reset_pending(&existing, effects, now).await,
        }
    }

    /// Refreshes a pending card payment for a new checkout attempt without
    /// changing its status.
    async fn reset_pending(
        &self,
        existing: &payment::Model,
        effects: TransitionEffects,
        now: DateTime<Utc>,
    ) -> Result<payment::Model, ServiceError> {
        let result = payment::Entity::update_many()
            .col_expr(payment::Column::Amount, Expr::value(effects.amount.unwrap_or(existing.amount)))
            .col_expr(
                payment::Column::ApplicationFeeAmount,
                Expr::value(effects.application_fee_amount),
            )
            .col_expr(
                payment::Column::ProcessorFeeAmount,
                Expr::value(effects.processor_fee_amount),
            )
            .col_expr(
                payment::Column::ProcessorSessionId,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                payment::Column::ProcessorPaymentIntentId,
                Expr::value(Option::<String>::None),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(existing.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "Payment changed concurrently; retry the checkout".into(),
            ));
        }

        info!(payment_id = %existing.id, "Reusing pending payment for a new checkout attempt");
        super::payment_state_machine::load_payment(&*self.db, existing.id).await
    }

    /// Stores the session id on the payment reserved for this attempt.
    ///
    /// The write only lands while the row is exactly as reserved: still
    /// pending, without a session, and not refreshed by a later attempt. A
    /// lost write is logged and left for reconciliation; the session itself
    /// stays valid.
    async fn persist_session_reference(&self, reserved: &payment::Model, session_id: &str) {
        let payment_id = reserved.id;
        let result = payment::Entity::update_many()
            .col_expr(
                payment::Column::ProcessorSessionId,
                Expr::value(Some(session_id.to_string())),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .filter(payment::Column::ProcessorSessionId.is_null())
            .filter(payment::Column::UpdatedAt.eq(reserved.updated_at))
            .exec(&*self.db)
            .await;

        match result {
            Ok(r) if r.rows_affected == 1 => {}
            Ok(_) => {
                counter!("eventpay_payments.session_reference_lost", 1);
                warn!(
                    %payment_id,
                    %session_id,
                    "Payment changed after reservation; a newer checkout attempt owns it"
                );
            }
            Err(e) => {
                counter!("eventpay_payments.session_reference_lost", 1);
                error!(
                    %payment_id,
                    %session_id,
                    error = %e,
                    "Failed to store checkout session reference; needs reconciliation"
                );
            }
        }
    }
}

pub fn transfer_group(event_id: Uuid) -> String {
    format!("event_{event_id}")
}
