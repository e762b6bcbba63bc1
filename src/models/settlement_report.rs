use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Point-in-time payout snapshot of one event for one calendar day.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "settlement_reports")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub event_id: Uuid,
    pub event_title: String,
    pub event_date: DateTime<Utc>,
    pub organizer_id: Uuid,
    pub processor_account_id: Option<String>,
    pub transfer_group: String,
    pub generated_at: DateTime<Utc>,
    pub generated_on: NaiveDate,
    pub total_sales: i64,
    pub total_processor_fee: i64,
    pub total_platform_fee: i64,
    pub net_payout: i64,
    pub payment_count: i64,
    pub refund_count: i64,
    pub refund_amount: i64,
    pub dispute_count: i64,
    pub dispute_amount: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::event::Entity",
        from = "Column::EventId",
        to = "super::event::Column::Id",
        on_delete = "Cascade"
    )]
    Event,
}

impl Related<super::event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Event.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
