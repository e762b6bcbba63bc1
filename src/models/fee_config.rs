use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Singleton fee configuration row (id = 1). Rates are stored in basis points.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fee_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    pub processor_rate_bps: i32,
    pub processor_fixed_fee: i64,
    pub platform_rate_bps: i32,
    pub platform_fixed_fee: i64,
    pub platform_minimum_fee: i64,
    /// 0 means unbounded
    pub platform_maximum_fee: i64,
    pub minimum_payout_amount: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub const SINGLETON_ID: i32 = 1;
