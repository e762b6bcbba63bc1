use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
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
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "cash")]
    Cash,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Card payment captured by the processor
    #[sea_orm(string_value = "paid")]
    Paid,
    /// Cash handed to the organizer
    #[sea_orm(string_value = "received")]
    Received,
    /// Cash charge forgiven by the organizer
    #[sea_orm(string_value = "waived")]
    Waived,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "canceled")]
    Canceled,
}

impl PaymentStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Paid | Self::Received | Self::Waived)
    }

    /// Rows counted against the one-active-payment-per-attendance constraint.
    pub fn is_active(self) -> bool {
        self != Self::Canceled
    }

    /// Statuses that stamp `paid_at`: every success state, waivers included.
    pub fn records_payment(self) -> bool {
        self.is_success()
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub attendance_id: Uuid,
    pub method: PaymentMethod,
    /// Minor currency units
    pub amount: i64,
    pub status: PaymentStatus,
    pub processor_session_id: Option<String>,
    pub processor_payment_intent_id: Option<String>,
    pub application_fee_amount: Option<i64>,
    pub processor_fee_amount: Option<i64>,
    pub refunded_amount: i64,
    pub disputed_amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::attendance::Entity",
        from = "Column::AttendanceId",
        to = "super::attendance::Column::Id",
        on_delete = "Restrict"
    )]
    Attendance,
}

impl Related<super::attendance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attendance.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
