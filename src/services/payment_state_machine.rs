use crate::{
    errors::ServiceError,
    models::{attendance, event, payment, PaymentMethod, PaymentStatus},
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Who is asking for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Actor {
    /// Event owner acting on cash payments
    Organizer,
    /// Processor-confirmed events delivered by the webhook handler
    Processor,
    /// Session reconciliation on the guest return path
    Verifier,
    /// Checkout retry reopening a failed card payment
    Gateway,
}

struct Edge {
    method: PaymentMethod,
    from: PaymentStatus,
    to: PaymentStatus,
    actors: &'static [Actor],
}

const fn edge(
    method: PaymentMethod,
    from: PaymentStatus,
    to: PaymentStatus,
    actors: &'static [Actor],
) -> Edge {
    Edge {
        method,
        from,
        to,
        actors,
    }
}

use PaymentMethod::{Card, Cash};
use PaymentStatus::{Canceled, Failed, Paid, Pending, Received, Waived};

const ORGANIZER: &[Actor] = &[Actor::Organizer];
const PROCESSOR_OR_VERIFIER: &[Actor] = &[Actor::Processor, Actor::Verifier];

const TRANSITIONS: &[Edge] = &[
    edge(Cash, Pending, Received, ORGANIZER),
    edge(Cash, Pending, Waived, ORGANIZER),
    edge(Cash, Pending, Canceled, ORGANIZER),
    edge(Cash, Received, Pending, ORGANIZER),
    edge(Cash, Waived, Pending, ORGANIZER),
    edge(Cash, Failed, Pending, ORGANIZER),
    edge(Card, Pending, Paid, PROCESSOR_OR_VERIFIER),
    edge(Card, Pending, Failed, PROCESSOR_OR_VERIFIER),
    edge(Card, Pending, Canceled, PROCESSOR_OR_VERIFIER),
    edge(Card, Paid, Canceled, &[Actor::Processor]),
    edge(Card, Failed, Pending, &[Actor::Gateway]),
];

fn drives(actor: Actor, method: PaymentMethod) -> bool {
    match method {
        Cash => actor == Actor::Organizer,
        Card => actor != Actor::Organizer,
    }
}

fn status_belongs_to(status: PaymentStatus, method: PaymentMethod) -> bool {
    match status {
        Paid => method == Card,
        Received | Waived => method == Cash,
        Pending | Failed | Canceled => true,
    }
}

/// Validates a status change against the transition table.
pub fn check_transition(
    method: PaymentMethod,
    from: PaymentStatus,
    to: PaymentStatus,
    actor: Actor,
) -> Result<(), ServiceError> {
    if !drives(actor, method) {
        return Err(ServiceError::InvalidOperation(format!(
            "{actor} cannot change the status of a {method} payment"
        )));
    }
    if !status_belongs_to(to, method) {
        return Err(ServiceError::InvalidOperation(format!(
            "status {to} does not apply to {method} payments"
        )));
    }

    let edge = TRANSITIONS
        .iter()
        .find(|e| e.method == method && e.from == from && e.to == to)
        .ok_or_else(|| ServiceError::invalid_transition(from, to))?;

    if !edge.actors.contains(&actor) {
        return Err(ServiceError::InvalidOperation(format!(
            "{actor} cannot move a {method} payment from {from} to {to}"
        )));
    }
    Ok(())
}

/// Column changes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionEffects {
    pub amount: Option<i64>,
    pub application_fee_amount: Option<i64>,
    pub processor_fee_amount: Option<i64>,
    /// Drops session and intent references ahead of a new checkout session
    pub clear_processor_refs: bool,
    pub processor_payment_intent_id: Option<String>,
}

/// Writes `to` only if the row still has the status it was read with.
pub(crate) async fn apply_transition<C: ConnectionTrait>(
    conn: &C,
    current: &payment::Model,
    to: PaymentStatus,
    actor: Actor,
    effects: TransitionEffects,
    now: DateTime<Utc>,
) -> Result<payment::Model, ServiceError> {
    check_transition(current.method, current.status, to, actor)?;

    let mut update = payment::Entity::update_many()
        .col_expr(payment::Column::Status, Expr::value(to.to_value()))
        .col_expr(payment::Column::UpdatedAt, Expr::value(now));

    if to.records_payment() {
        update = update.col_expr(payment::Column::PaidAt, Expr::value(Some(now)));
    } else if to == Pending {
        update = update.col_expr(
            payment::Column::PaidAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        );
    }

    update = with_effects(update, effects);

    let result = update
        .filter(payment::Column::Id.eq(current.id))
        .filter(payment::Column::Status.eq(current.status))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        warn!(
            payment_id = %current.id,
            observed = %current.status,
            "Payment changed concurrently; transition not applied"
        );
        return Err(ServiceError::Conflict(format!(
            "Payment {} was modified concurrently; reload and retry",
            current.id
        )));
    }

    counter!("eventpay_payments.transitions", 1, "to" => to.to_string());
    info!(
        payment_id = %current.id,
        method = %current.method,
        from = %current.status,
        to = %to,
        actor = %actor,
        "Payment status changed"
    );

    load_payment(conn, current.id).await
}

fn with_effects(
    mut update: sea_orm::UpdateMany<payment::Entity>,
    effects: TransitionEffects,
) -> sea_orm::UpdateMany<payment::Entity> {
    if let Some(amount) = effects.amount {
        update = update.col_expr(payment::Column::Amount, Expr::value(amount));
    }
    if effects.clear_processor_refs {
        update = update
            .col_expr(
                payment::Column::ProcessorSessionId,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                payment::Column::ProcessorPaymentIntentId,
                Expr::value(Option::<String>::None),
            );
    }
    if let Some(fee) = effects.application_fee_amount {
        update = update.col_expr(payment::Column::ApplicationFeeAmount, Expr::value(Some(fee)));
    }
    if let Some(fee) = effects.processor_fee_amount {
        update = update.col_expr(payment::Column::ProcessorFeeAmount, Expr::value(Some(fee)));
    }
    if let Some(intent) = effects.processor_payment_intent_id {
        update = update.col_expr(
            payment::Column::ProcessorPaymentIntentId,
            Expr::value(Some(intent)),
        );
    }
    update
}

pub(crate) async fn load_payment<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
) -> Result<payment::Model, ServiceError> {
    payment::Entity::find_by_id(payment_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or(ServiceError::PaymentNotFound(payment_id))
}

#[derive(Debug, Clone, Copy)]
enum Adjustment {
    Refund,
    Dispute,
}

/// Authoritative entry point for payment status changes.
#[derive(Clone)]
pub struct PaymentStateMachine {
    db: Arc<DatabaseConnection>,
}

impl PaymentStateMachine {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, effects))]
    pub async fn transition(
        &self,
        payment_id: Uuid,
        to: PaymentStatus,
        actor: Actor,
        effects: TransitionEffects,
    ) -> Result<payment::Model, ServiceError> {
        let current = load_payment(&*self.db, payment_id).await?;
        apply_transition(&*self.db, &current, to, actor, effects, Utc::now()).await
    }

    /// Entry point for the webhook handler: applies a processor-confirmed status.
    pub async fn apply_processor_event(
        &self,
        payment_id: Uuid,
        to: PaymentStatus,
        processor_payment_intent_id: Option<String>,
    ) -> Result<payment::Model, ServiceError> {
        self.transition(
            payment_id,
            to,
            Actor::Processor,
            TransitionEffects {
                processor_payment_intent_id,
                ..Default::default()
            },
        )
        .await
    }

    /// Organizer-driven cash status change (received, waived, canceled, or back to pending).
    #[instrument(skip(self))]
    pub async fn update_cash_status(
        &self,
        payment_id: Uuid,
        organizer_id: Uuid,
        to: PaymentStatus,
    ) -> Result<payment::Model, ServiceError> {
        let current = load_payment(&*self.db, payment_id).await?;

        let attendance = attendance::Entity::find_by_id(current.attendance_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Attendance not found".into()))?;
        let event = event::Entity::find_by_id(attendance.event_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Event not found".into()))?;

        if event.organizer_id != organizer_id {
            warn!(%payment_id, %organizer_id, "Cash status change by non-owner rejected");
            return Err(ServiceError::Forbidden(
                "Only the event organizer can update this payment".into(),
            ));
        }

        apply_transition(
            &*self.db,
            &current,
            to,
            Actor::Organizer,
            TransitionEffects::default(),
            Utc::now(),
        )
        .await
    }

    /// Adds a refund to a captured card payment. Status is unchanged.
    pub async fn record_refund(
        &self,
        payment_id: Uuid,
        amount: i64,
    ) -> Result<payment::Model, ServiceError> {
        self.adjust(payment_id, amount, Adjustment::Refund).await
    }

    /// Adds a disputed amount to a captured card payment. Status is unchanged.
    pub async fn record_dispute(
        &self,
        payment_id: Uuid,
        amount: i64,
    ) -> Result<payment::Model, ServiceError> {
        self.adjust(payment_id, amount, Adjustment::Dispute).await
    }

    #[instrument(skip(self))]
    async fn adjust(
        &self,
        payment_id: Uuid,
        amount: i64,
        kind: Adjustment,
    ) -> Result<payment::Model, ServiceError> {
        if amount <= 0 {
            return Err(ServiceError::ValidationError(
                "Adjustment amount must be positive".into(),
            ));
        }

        let current = load_payment(&*self.db, payment_id).await?;
        if current.method != Card || current.status != Paid {
            return Err(ServiceError::InvalidOperation(format!(
                "Only paid card payments can be refunded or disputed (payment is {} {})",
                current.method, current.status
            )));
        }

        let (column, observed) = match kind {
            Adjustment::Refund => (payment::Column::RefundedAmount, current.refunded_amount),
            Adjustment::Dispute => (payment::Column::DisputedAmount, current.disputed_amount),
        };
        let total = observed.saturating_add(amount);
        if total > current.amount {
            return Err(ServiceError::ValidationError(format!(
                "Cumulative {kind:?} of {total} exceeds payment amount {}",
                current.amount
            )));
        }

        let result = payment::Entity::update_many()
            .col_expr(column, Expr::value(total))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment_id))
            .filter(column.eq(observed))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "Payment {payment_id} was modified concurrently; reload and retry"
            )));
        }

        info!(%payment_id, ?kind, amount, total, "Payment adjustment recorded");
        load_payment(&*self.db, payment_id).await
    }
}
