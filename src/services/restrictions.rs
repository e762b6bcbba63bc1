//! Edit restrictions for events that already have attendees or payments.
//!
//! Rules are plain values in a registry. Each one targets a single form field
//! and carries a level:
//!
//! * `structural` rules block a change outright while their condition holds;
//! * `conditional` rules block a change only when a numeric constraint fails;
//! * `advisory` rules never block, they only attach a warning.
//!
//! Evaluation results are memoized per rule on the values the rule reads, so
//! re-evaluating a form after every keystroke stays cheap.

use crate::{
    errors::ServiceError,
    models::{
        attendance, event, event::parse_payment_methods, payment, AttendanceStatus, EventStatus,
        PaymentMethod, PaymentStatus,
    },
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, JoinType, PaginatorTrait, QueryFilter,
    QuerySelect, RelationTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventField {
    Title,
    Date,
    Location,
    Fee,
    Capacity,
    PaymentMethods,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RestrictionLevel {
    Structural,
    Conditional,
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Ok,
    Blocked,
    Warning,
}

/// Editable event fields as submitted by the organizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFormData {
    pub title: String,
    pub date: DateTime<Utc>,
    pub location: Option<String>,
    pub fee: i64,
    /// None or 0 means unlimited
    pub capacity: Option<i32>,
    #[serde(default)]
    pub payment_methods: BTreeSet<PaymentMethod>,
}

impl From<&event::Model> for EventFormData {
    fn from(event: &event::Model) -> Self {
        Self {
            title: event.title.clone(),
            date: event.date,
            location: event.location.clone(),
            fee: event.fee,
            capacity: event.capacity,
            payment_methods: parse_payment_methods(&event.payment_methods),
        }
    }
}

impl EventFormData {
    fn fingerprint(&self, field: EventField) -> String {
        match field {
            EventField::Title => self.title.clone(),
            EventField::Date => self.date.timestamp().to_string(),
            EventField::Location => self.location.clone().unwrap_or_default(),
            EventField::Fee => self.fee.to_string(),
            EventField::Capacity => self.capacity.unwrap_or(0).to_string(),
            EventField::PaymentMethods => self
                .payment_methods
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("+"),
        }
    }

    fn capacity_limit(&self) -> Option<i64> {
        self.capacity.filter(|c| *c > 0).map(i64::from)
    }
}

/// Snapshot of an event's state used for one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictionContext {
    pub has_attendees: bool,
    pub attendee_count: i64,
    pub has_captured_card_payment: bool,
    pub event_status: EventStatus,
    pub original: EventFormData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub is_restricted: bool,
    pub status: RuleStatus,
    pub message: Option<String>,
}

impl RuleOutcome {
    fn ok() -> Self {
        Self {
            is_restricted: false,
            status: RuleStatus::Ok,
            message: None,
        }
    }

    fn blocked(message: impl Into<String>) -> Self {
        Self {
            is_restricted: true,
            status: RuleStatus::Blocked,
            message: Some(message.into()),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            is_restricted: false,
            status: RuleStatus::Warning,
            message: Some(message.into()),
        }
    }
}

pub type RuleEvaluator = fn(&RestrictionContext, &EventFormData) -> RuleOutcome;

#[derive(Clone)]
pub struct RestrictionRule {
    pub id: &'static str,
    pub field: EventField,
    pub level: RestrictionLevel,
    /// Proposed fields the evaluator reads; used for cache keys and invalidation
    pub reads: &'static [EventField],
    pub evaluate: RuleEvaluator,
}

fn fee_locked_after_capture(ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    if ctx.has_captured_card_payment && form.fee != ctx.original.fee {
        RuleOutcome::blocked("The fee cannot change after a card payment has been captured")
    } else {
        RuleOutcome::ok()
    }
}

fn methods_locked_after_capture(ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    if ctx.has_captured_card_payment && form.payment_methods != ctx.original.payment_methods {
        RuleOutcome::blocked(
            "Payment methods cannot change after a card payment has been captured",
        )
    } else {
        RuleOutcome::ok()
    }
}

fn capacity_below_attendees(ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    match form.capacity_limit() {
        Some(limit) if ctx.has_attendees && limit < ctx.attendee_count => {
            RuleOutcome::blocked(format!(
                "Capacity cannot be lower than the {} people already attending",
                ctx.attendee_count
            ))
        }
        _ => RuleOutcome::ok(),
    }
}

fn warn_on_change(
    ctx: &RestrictionContext,
    changed: bool,
    message: &'static str,
) -> RuleOutcome {
    if ctx.has_attendees && changed {
        RuleOutcome::warning(message)
    } else {
        RuleOutcome::ok()
    }
}

fn title_changed(ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    warn_on_change(
        ctx,
        form.title != ctx.original.title,
        "Attendees will see the new title",
    )
}

fn date_changed(ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    warn_on_change(
        ctx,
        form.date != ctx.original.date,
        "Changing the date may affect people who already registered",
    )
}

fn location_changed(ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    warn_on_change(
        ctx,
        form.location != ctx.original.location,
        "Changing the location may affect people who already registered",
    )
}

fn fee_changed(ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    warn_on_change(
        ctx,
        form.fee != ctx.original.fee,
        "Existing registrations keep the amount they were charged",
    )
}

fn methods_on_free_event(_: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    if form.fee == 0 && !form.payment_methods.is_empty() {
        RuleOutcome::warning("Payment methods are ignored for free events")
    } else {
        RuleOutcome::ok()
    }
}

fn paid_event_without_methods(_: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    if form.fee > 0 && form.payment_methods.is_empty() {
        RuleOutcome::warning("Select at least one payment method for a paid event")
    } else {
        RuleOutcome::ok()
    }
}

fn capacity_lowered(ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
    let lowered = match (form.capacity_limit(), ctx.original.capacity_limit()) {
        (Some(new), Some(old)) => new < old,
        (Some(_), None) => true,
        _ => false,
    };
    let fits = form
        .capacity_limit()
        .map_or(true, |limit| limit >= ctx.attendee_count);

    if ctx.has_attendees && lowered && fits {
        RuleOutcome::warning("Capacity is lower than before; new registrations may close sooner")
    } else {
        RuleOutcome::ok()
    }
}

/// The rules every event form is checked against.
pub fn canonical_rules() -> Vec<RestrictionRule> {
    use EventField::*;
    use RestrictionLevel::*;

    vec![
        RestrictionRule {
            id: "fee_locked_after_capture",
            field: Fee,
            level: Structural,
            reads: &[Fee],
            evaluate: fee_locked_after_capture,
        },
        RestrictionRule {
            id: "payment_methods_locked_after_capture",
            field: PaymentMethods,
            level: Structural,
            reads: &[PaymentMethods],
            evaluate: methods_locked_after_capture,
        },
        RestrictionRule {
            id: "capacity_below_attendees",
            field: Capacity,
            level: Conditional,
            reads: &[Capacity],
            evaluate: capacity_below_attendees,
        },
        RestrictionRule {
            id: "title_changed_with_attendees",
            field: Title,
            level: Advisory,
            reads: &[Title],
            evaluate: title_changed,
        },
        RestrictionRule {
            id: "date_changed_with_attendees",
            field: Date,
            level: Advisory,
            reads: &[Date],
            evaluate: date_changed,
        },
        RestrictionRule {
            id: "location_changed_with_attendees",
            field: Location,
            level: Advisory,
            reads: &[Location],
            evaluate: location_changed,
        },
        RestrictionRule {
            id: "fee_changed_with_attendees",
            field: Fee,
            level: Advisory,
            reads: &[Fee],
            evaluate: fee_changed,
        },
        RestrictionRule {
            id: "payment_methods_on_free_event",
            field: PaymentMethods,
            level: Advisory,
            reads: &[Fee, PaymentMethods],
            evaluate: methods_on_free_event,
        },
        RestrictionRule {
            id: "paid_event_without_payment_methods",
            field: PaymentMethods,
            level: Advisory,
            reads: &[Fee, PaymentMethods],
            evaluate: paid_event_without_methods,
        },
        RestrictionRule {
            id: "capacity_lowered",
            field: Capacity,
            level: Advisory,
            reads: &[Capacity],
            evaluate: capacity_lowered,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFinding {
    pub rule_id: String,
    pub level: RestrictionLevel,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRestriction {
    pub editable: bool,
    pub is_restricted: bool,
    pub violations: Vec<RuleFinding>,
    pub warnings: Vec<RuleFinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictionReport {
    pub fields: BTreeMap<EventField, FieldRestriction>,
    /// False when any field carries a blocking violation
    pub can_save: bool,
}

impl RestrictionReport {
    pub fn field(&self, field: EventField) -> Option<&FieldRestriction> {
        self.fields.get(&field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    rule_id: &'static str,
    fingerprint: String,
}

/// Default cap on memoized rule outcomes.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 1000;

/// Rule registry with a memoized evaluation cache.
///
/// The cache holds at most `max_cache_entries` outcomes; reaching the cap
/// flushes it before the next insert.
pub struct RestrictionEngine {
    rules: Vec<RestrictionRule>,
    cache: DashMap<CacheKey, RuleOutcome>,
    max_cache_entries: usize,
}

impl Default for RestrictionEngine {
    fn default() -> Self {
        Self::with_rules(canonical_rules())
    }
}

impl RestrictionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<RestrictionRule>) -> Self {
        Self {
            rules,
            cache: DashMap::new(),
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
        }
    }

    /// Overrides the outcome cache cap (at least one entry).
    pub fn with_cache_limit(mut self, max_entries: usize) -> Self {
        self.max_cache_entries = max_entries.max(1);
        self
    }

    pub fn register(&mut self, rule: RestrictionRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[RestrictionRule] {
        &self.rules
    }

    fn cache_key(rule: &RestrictionRule, ctx: &RestrictionContext, form: &EventFormData) -> CacheKey {
        let proposed = rule
            .reads
            .iter()
            .map(|f| form.fingerprint(*f))
            .collect::<Vec<_>>()
            .join("|");
        let original = rule
            .reads
            .iter()
            .map(|f| ctx.original.fingerprint(*f))
            .collect::<Vec<_>>()
            .join("|");

        CacheKey {
            rule_id: rule.id,
            fingerprint: format!(
                "{proposed}#{original}#{}:{}:{}:{}",
                ctx.has_attendees, ctx.attendee_count, ctx.has_captured_card_payment, ctx.event_status
            ),
        }
    }

    fn outcome(&self, rule: &RestrictionRule, ctx: &RestrictionContext, form: &EventFormData) -> RuleOutcome {
        let key = Self::cache_key(rule, ctx, form);
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }
        let outcome = (rule.evaluate)(ctx, form);
        if self.cache.len() >= self.max_cache_entries {
            debug!(
                entries = self.cache.len(),
                "restriction cache full, flushing"
            );
            self.cache.clear();
        }
        self.cache.insert(key, outcome.clone());
        outcome
    }

    /// Evaluates every rule and folds the outcomes per field.
    pub fn evaluate(&self, ctx: &RestrictionContext, form: &EventFormData) -> RestrictionReport {
        use strum::IntoEnumIterator;

        let mut fields: BTreeMap<EventField, FieldRestriction> = EventField::iter()
            .map(|f| {
                (
                    f,
                    FieldRestriction {
                        editable: true,
                        ..Default::default()
                    },
                )
            })
            .collect();

        for rule in &self.rules {
            let outcome = self.outcome(rule, ctx, form);
            if outcome.status == RuleStatus::Ok {
                continue;
            }

            let entry = fields.entry(rule.field).or_default();
            let finding = RuleFinding {
                rule_id: rule.id.to_string(),
                level: rule.level,
                message: outcome.message.clone(),
            };

            match rule.level {
                RestrictionLevel::Structural | RestrictionLevel::Conditional
                    if outcome.is_restricted =>
                {
                    entry.is_restricted = true;
                    entry.editable = false;
                    entry.violations.push(finding);
                }
                _ => entry.warnings.push(finding),
            }
        }

        let can_save = fields.values().all(|f| !f.is_restricted);
        RestrictionReport { fields, can_save }
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    /// Drops cached outcomes of every rule that reads `field`.
    pub fn invalidate_field(&self, field: EventField) {
        let affected: BTreeSet<&'static str> = self
            .rules
            .iter()
            .filter(|r| r.field == field || r.reads.contains(&field))
            .map(|r| r.id)
            .collect();
        self.cache.retain(|key, _| !affected.contains(key.rule_id));
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_limit(&self) -> usize {
        self.max_cache_entries
    }
}

/// Builds restriction contexts from stored event data.
#[derive(Clone)]
pub struct RestrictionService {
    db: Arc<DatabaseConnection>,
    engine: Arc<RestrictionEngine>,
}

impl RestrictionService {
    pub fn new(db: Arc<DatabaseConnection>, engine: Arc<RestrictionEngine>) -> Self {
        Self { db, engine }
    }

    pub fn engine(&self) -> &RestrictionEngine {
        &self.engine
    }

    #[instrument(skip(self))]
    pub async fn build_context(
        &self,
        event_id: Uuid,
    ) -> Result<(event::Model, RestrictionContext), ServiceError> {
        let event = event::Entity::find_by_id(event_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Event not found".into()))?;

        let attendee_count = attendance::Entity::find()
            .filter(attendance::Column::EventId.eq(event_id))
            .filter(attendance::Column::Status.eq(AttendanceStatus::Attending))
            .count(&*self.db)
            .await
            .map_err(ServiceError::db_error)? as i64;

        let captured = payment::Entity::find()
            .join(JoinType::InnerJoin, payment::Relation::Attendance.def())
            .filter(attendance::Column::EventId.eq(event_id))
            .filter(payment::Column::Method.eq(PaymentMethod::Card))
            .filter(payment::Column::Status.eq(PaymentStatus::Paid))
            .count(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let ctx = RestrictionContext {
            has_attendees: attendee_count > 0,
            attendee_count,
            has_captured_card_payment: captured > 0,
            event_status: event.status,
            original: EventFormData::from(&event),
        };
        debug!(%event_id, attendee_count, captured, "Restriction context built");
        Ok((event, ctx))
    }

    pub async fn evaluate_for_event(
        &self,
        event_id: Uuid,
        organizer_id: Uuid,
        form: &EventFormData,
    ) -> Result<RestrictionReport, ServiceError> {
        let (event, ctx) = self.build_context(event_id).await?;
        if event.organizer_id != organizer_id {
            return Err(ServiceError::Forbidden(
                "Only the event organizer can edit this event".into(),
            ));
        }
        Ok(self.engine.evaluate(&ctx, form))
    }
}
