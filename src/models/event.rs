use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::payment::PaymentMethod;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventStatus {
    #[sea_orm(string_value = "upcoming")]
    Upcoming,
    #[sea_orm(string_value = "ended")]
    Ended,
    #[sea_orm(string_value = "canceled")]
    Canceled,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub organizer_id: Uuid,
    pub title: String,
    pub date: DateTime<Utc>,
    pub location: Option<String>,
    /// Participation fee in minor units; 0 means free
    pub fee: i64,
    /// None or 0 means unlimited
    pub capacity: Option<i32>,
    /// Comma-separated payment methods, e.g. "card,cash"
    pub payment_methods: String,
    /// Connected processor account receiving destination charges
    pub processor_account_id: Option<String>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::attendance::Entity")]
    Attendance,
    #[sea_orm(has_many = "super::settlement_report::Entity")]
    SettlementReport,
}

impl Related<super::attendance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attendance.def()
    }
}

impl Related<super::settlement_report::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SettlementReport.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_paid(&self) -> bool {
        self.fee > 0
    }

    pub fn accepted_methods(&self) -> BTreeSet<PaymentMethod> {
        parse_payment_methods(&self.payment_methods)
    }

    pub fn accepts(&self, method: PaymentMethod) -> bool {
        self.accepted_methods().contains(&method)
    }
}

/// Parses the stored method list, ignoring unknown or blank entries.
pub fn parse_payment_methods(raw: &str) -> BTreeSet<PaymentMethod> {
    raw.split(',')
        .filter_map(|m| m.trim().parse::<PaymentMethod>().ok())
        .collect()
}

pub fn format_payment_methods<'a>(methods: impl IntoIterator<Item = &'a PaymentMethod>) -> String {
    methods
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
