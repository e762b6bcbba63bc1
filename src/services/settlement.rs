use crate::{
    config::AppConfig,
    db::with_transaction,
    errors::ServiceError,
    models::{attendance, event, payment, settlement_report, PaymentMethod, PaymentStatus},
};
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Utc};
use sea_orm::{
    sea_query::{Expr, OnConflict, SimpleExpr},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, FromQueryResult, JoinType,
    QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{fee_config_store::FeeConfigStore, payment_gateway::transfer_group};

#[derive(Debug, Clone, Default, PartialEq, Eq, FromQueryResult)]
pub struct SettlementTotals {
    pub total_sales: i64,
    pub total_platform_fee: i64,
    pub total_processor_fee: i64,
    pub payment_count: i64,
    pub refund_count: i64,
    pub refund_amount: i64,
    pub dispute_count: i64,
    pub dispute_amount: i64,
}

impl SettlementTotals {
    pub fn net_payout(&self) -> i64 {
        (self.total_sales
            - self.refund_amount
            - self.dispute_amount
            - self.total_platform_fee
            - self.total_processor_fee)
            .max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub report_id: Uuid,
    pub already_exists: bool,
    /// None when the fee configuration could not be read
    pub meets_minimum_payout: Option<bool>,
    pub report: settlement_report::Model,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportFilter {
    pub event_id: Option<Uuid>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementExport {
    pub csv: String,
    pub row_count: usize,
    pub truncated: bool,
}

const CSV_HEADER: [&str; 18] = [
    "report_id",
    "event_id",
    "event_title",
    "event_date",
    "organizer_id",
    "processor_account_id",
    "transfer_group",
    "generated_at",
    "generated_on",
    "total_sales",
    "total_processor_fee",
    "total_platform_fee",
    "net_payout",
    "payment_count",
    "refund_count",
    "refund_amount",
    "dispute_count",
    "dispute_amount",
];

/// Sums an expression over the selected payments, portable across backends.
fn sum(expr: &str) -> SimpleExpr {
    Expr::cust(format!("CAST(COALESCE(SUM({expr}), 0) AS BIGINT)"))
}

/// Aggregates captured card payments of one event.
pub(crate) async fn aggregate_event_payments<C: ConnectionTrait>(
    conn: &C,
    event_id: Uuid,
) -> Result<SettlementTotals, ServiceError> {
    let totals = payment::Entity::find()
        .select_only()
        .column_as(sum("payments.amount"), "total_sales")
        .column_as(sum("COALESCE(payments.application_fee_amount, 0)"), "total_platform_fee")
        .column_as(sum("COALESCE(payments.processor_fee_amount, 0)"), "total_processor_fee")
        .column_as(sum("1"), "payment_count")
        .column_as(
            sum("CASE WHEN payments.refunded_amount > 0 THEN 1 ELSE 0 END"),
            "refund_count",
        )
        .column_as(sum("payments.refunded_amount"), "refund_amount")
        .column_as(
            sum("CASE WHEN payments.disputed_amount > 0 THEN 1 ELSE 0 END"),
            "dispute_count",
        )
        .column_as(sum("payments.disputed_amount"), "dispute_amount")
        .join(JoinType::InnerJoin, payment::Relation::Attendance.def())
        .filter(attendance::Column::EventId.eq(event_id))
        .filter(payment::Column::Method.eq(PaymentMethod::Card))
        .filter(payment::Column::Status.eq(PaymentStatus::Paid))
        .into_model::<SettlementTotals>()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(totals.unwrap_or_default())
}

/// Per-day payout snapshots for finished events.
#[derive(Clone)]
pub struct SettlementReportGenerator {
    db: Arc<DatabaseConnection>,
    fee_store: Arc<FeeConfigStore>,
    offset: FixedOffset,
    export_max_rows: u64,
}

impl SettlementReportGenerator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        fee_store: Arc<FeeConfigStore>,
        offset: FixedOffset,
        export_max_rows: u64,
    ) -> Self {
        Self {
            db,
            fee_store,
            offset,
            export_max_rows: export_max_rows.max(1),
        }
    }

    pub fn from_config(
        db: Arc<DatabaseConnection>,
        fee_store: Arc<FeeConfigStore>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            db,
            fee_store,
            config.settlement_offset(),
            config.settlement_export_max_rows,
        )
    }

    pub async fn generate(
        &self,
        event_id: Uuid,
        organizer_id: Uuid,
    ) -> Result<SettlementOutcome, ServiceError> {
        self.generate_at(event_id, organizer_id, Utc::now()).await
    }

    /// Re-runs generation so refunds and disputes recorded since the last
    /// snapshot are reflected.
    pub async fn regenerate_after_refund_or_dispute(
        &self,
        event_id: Uuid,
        organizer_id: Uuid,
    ) -> Result<SettlementOutcome, ServiceError> {
        self.generate(event_id, organizer_id).await
    }

    #[instrument(skip(self))]
    pub async fn generate_at(
        &self,
        event_id: Uuid,
        organizer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, ServiceError> {
        let generated_on = now.with_timezone(&self.offset).date_naive();

        let (report, already_exists) = with_transaction(&self.db, move |txn| {
            Box::pin(async move {
                let event = event::Entity::find_by_id(event_id)
                    .one(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| ServiceError::NotFound("Event not found".into()))?;

                if event.organizer_id != organizer_id {
                    return Err(ServiceError::Forbidden(
                        "Only the event organizer can generate settlements".into(),
                    ));
                }
                if event.date > now {
                    return Err(ServiceError::InvalidOperation(
                        "Settlement is available once the event has taken place".into(),
                    ));
                }

                let totals = aggregate_event_payments(txn, event_id).await?;
                let existing = find_for_day(txn, event_id, generated_on).await?;
                let already_exists = existing.is_some();

                let row = settlement_report::ActiveModel {
                    id: Set(existing.map(|r| r.id).unwrap_or_else(Uuid::new_v4)),
                    event_id: Set(event.id),
                    event_title: Set(event.title.clone()),
                    event_date: Set(event.date),
                    organizer_id: Set(event.organizer_id),
                    processor_account_id: Set(event.processor_account_id.clone()),
                    transfer_group: Set(transfer_group(event.id)),
                    generated_at: Set(now),
                    generated_on: Set(generated_on),
                    total_sales: Set(totals.total_sales),
                    total_processor_fee: Set(totals.total_processor_fee),
                    total_platform_fee: Set(totals.total_platform_fee),
                    net_payout: Set(totals.net_payout()),
                    payment_count: Set(totals.payment_count),
                    refund_count: Set(totals.refund_count),
                    refund_amount: Set(totals.refund_amount),
                    dispute_count: Set(totals.dispute_count),
                    dispute_amount: Set(totals.dispute_amount),
                };

                settlement_report::Entity::insert(row)
                    .on_conflict(
                        OnConflict::columns([
                            settlement_report::Column::EventId,
                            settlement_report::Column::GeneratedOn,
                        ])
                        .update_columns([
                            settlement_report::Column::EventTitle,
                            settlement_report::Column::EventDate,
                            settlement_report::Column::OrganizerId,
                            settlement_report::Column::ProcessorAccountId,
                            settlement_report::Column::TransferGroup,
                            settlement_report::Column::GeneratedAt,
                            settlement_report::Column::TotalSales,
                            settlement_report::Column::TotalProcessorFee,
                            settlement_report::Column::TotalPlatformFee,
                            settlement_report::Column::NetPayout,
                            settlement_report::Column::PaymentCount,
                            settlement_report::Column::RefundCount,
                            settlement_report::Column::RefundAmount,
                            settlement_report::Column::DisputeCount,
                            settlement_report::Column::DisputeAmount,
                        ])
                        .to_owned(),
                    )
                    .exec_without_returning(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                let report = find_for_day(txn, event_id, generated_on)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError("Settlement snapshot missing after upsert".into())
                    })?;

                Ok((report, already_exists))
            })
        })
        .await?;

        let meets_minimum_payout = match self.fee_store.get_config(false).await {
            Ok(config) => Some(report.net_payout >= config.minimum_payout_amount),
            Err(e) => {
                warn!(%event_id, error = %e, "Minimum payout check skipped; fee configuration unavailable");
                None
            }
        };

        info!(
            %event_id,
            report_id = %report.id,
            %generated_on,
            already_exists,
            total_sales = report.total_sales,
            net_payout = report.net_payout,
            "Settlement report generated"
        );

        Ok(SettlementOutcome {
            report_id: report.id,
            already_exists,
            meets_minimum_payout,
            report,
        })
    }

    /// Renders the organizer's snapshots, newest first, as CSV.
    #[instrument(skip(self))]
    pub async fn export_csv(
        &self,
        organizer_id: Uuid,
        filter: ExportFilter,
    ) -> Result<SettlementExport, ServiceError> {
        let limit = filter
            .limit
            .unwrap_or(self.export_max_rows)
            .clamp(1, self.export_max_rows);

        let mut query = settlement_report::Entity::find()
            .filter(settlement_report::Column::OrganizerId.eq(organizer_id));
        if let Some(event_id) = filter.event_id {
            query = query.filter(settlement_report::Column::EventId.eq(event_id));
        }

        let mut rows = query
            .order_by_desc(settlement_report::Column::GeneratedAt)
            .order_by_asc(settlement_report::Column::EventId)
            .limit(limit.saturating_add(1))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let truncated = rows.len() as u64 > limit;
        if truncated {
            rows.truncate(limit as usize);
            warn!(%organizer_id, limit, "Settlement export truncated");
        }

        Ok(SettlementExport {
            csv: render_csv(&rows, &self.offset),
            row_count: rows.len(),
            truncated,
        })
    }
}

async fn find_for_day<C: ConnectionTrait>(
    conn: &C,
    event_id: Uuid,
    day: NaiveDate,
) -> Result<Option<settlement_report::Model>, ServiceError> {
    settlement_report::Entity::find()
        .filter(settlement_report::Column::EventId.eq(event_id))
        .filter(settlement_report::Column::GeneratedOn.eq(day))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

fn escape_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        let escaped = value.replace('"', "\"\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

fn timestamp(value: DateTime<Utc>, offset: &FixedOffset) -> String {
    value
        .with_timezone(offset)
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub fn render_csv(rows: &[settlement_report::Model], offset: &FixedOffset) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push('\n');

    for r in rows {
        let fields = [
            r.id.to_string(),
            r.event_id.to_string(),
            escape_field(&r.event_title),
            timestamp(r.event_date, offset),
            r.organizer_id.to_string(),
            escape_field(r.processor_account_id.as_deref().unwrap_or_default()),
            escape_field(&r.transfer_group),
            timestamp(r.generated_at, offset),
            r.generated_on.to_string(),
            r.total_sales.to_string(),
            r.total_processor_fee.to_string(),
            r.total_platform_fee.to_string(),
            r.net_payout.to_string(),
            r.payment_count.to_string(),
            r.refund_count.to_string(),
            r.refund_amount.to_string(),
            r.dispute_count.to_string(),
            r.dispute_amount.to_string(),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}
