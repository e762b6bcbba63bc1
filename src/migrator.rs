use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_events_tables::Migration),
            Box::new(m20250301_000002_create_payments_table::Migration),
            Box::new(m20250301_000003_create_fee_configs_table::Migration),
            Box::new(m20250301_000004_create_settlement_reports_table::Migration),
        ]
    }
}

mod m20250301_000001_create_events_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000001_create_events_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Events::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Events::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Events::OrganizerId).uuid().not_null())
                        .col(ColumnDef::new(Events::Title).string().not_null())
                        .col(
                            ColumnDef::new(Events::Date)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Events::Location).string().null())
                        .col(
                            ColumnDef::new(Events::Fee)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Events::Capacity).integer().null())
                        .col(
                            ColumnDef::new(Events::PaymentMethods)
                                .string()
                                .not_null()
                                .default(""),
                        )
                        .col(ColumnDef::new(Events::ProcessorAccountId).string().null())
                        .col(
                            ColumnDef::new(Events::Status)
                                .string_len(16)
                                .not_null()
                                .default("upcoming"),
                        )
                        .col(
                            ColumnDef::new(Events::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Events::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_events_organizer_id")
                        .table(Events::Table)
                        .col(Events::OrganizerId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Attendances::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Attendances::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Attendances::EventId).uuid().not_null())
                        .col(ColumnDef::new(Attendances::UserId).uuid().null())
                        .col(ColumnDef::new(Attendances::Nickname).string().not_null())
                        .col(ColumnDef::new(Attendances::Email).string().null())
                        .col(ColumnDef::new(Attendances::GuestToken).string().not_null())
                        .col(
                            ColumnDef::new(Attendances::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Attendances::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_attendances_event_id")
                                .from(Attendances::Table, Attendances::EventId)
                                .to(Events::Table, Events::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_attendances_event_id")
                        .table(Attendances::Table)
                        .col(Attendances::EventId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("uq_attendances_guest_token")
                        .table(Attendances::Table)
                        .col(Attendances::GuestToken)
                        .unique()
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Attendances::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Events::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Events {
        Table,
        Id,
        OrganizerId,
        Title,
        Date,
        Location,
        Fee,
        Capacity,
        PaymentMethods,
        ProcessorAccountId,
        Status,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub enum Attendances {
        Table,
        Id,
        EventId,
        UserId,
        Nickname,
        Email,
        GuestToken,
        Status,
        CreatedAt,
    }
}

mod m20250301_000002_create_payments_table {
    use super::m20250301_000001_create_events_tables::Attendances;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000002_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Payments::AttendanceId).uuid().not_null())
                        .col(ColumnDef::new(Payments::Method).string_len(16).not_null())
                        .col(ColumnDef::new(Payments::Amount).big_integer().not_null())
                        .col(ColumnDef::new(Payments::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Payments::ProcessorSessionId).string().null())
                        .col(
                            ColumnDef::new(Payments::ProcessorPaymentIntentId)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Payments::ApplicationFeeAmount)
                                .big_integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Payments::ProcessorFeeAmount)
                                .big_integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Payments::RefundedAmount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Payments::DisputedAmount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_attendance_id")
                                .from(Payments::Table, Payments::AttendanceId)
                                .to(Attendances::Table, Attendances::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            // One active payment per attendance; canceled rows are history.
            manager
                .get_connection()
                .execute_unprepared(
                    "CREATE UNIQUE INDEX IF NOT EXISTS uq_payments_active_attendance \
                     ON payments (attendance_id) WHERE status <> 'canceled'",
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_payments_processor_session_id")
                        .table(Payments::Table)
                        .col(Payments::ProcessorSessionId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        AttendanceId,
        Method,
        Amount,
        Status,
        ProcessorSessionId,
        ProcessorPaymentIntentId,
        ApplicationFeeAmount,
        ProcessorFeeAmount,
        RefundedAmount,
        DisputedAmount,
        CreatedAt,
        UpdatedAt,
        PaidAt,
    }
}

mod m20250301_000003_create_fee_configs_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000003_create_fee_configs_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(FeeConfigs::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(FeeConfigs::Id)
                                .integer()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FeeConfigs::ProcessorRateBps)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FeeConfigs::ProcessorFixedFee)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FeeConfigs::PlatformRateBps)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FeeConfigs::PlatformFixedFee)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FeeConfigs::PlatformMinimumFee)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FeeConfigs::PlatformMaximumFee)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FeeConfigs::MinimumPayoutAmount)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FeeConfigs::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            let seed = Query::insert()
                .into_table(FeeConfigs::Table)
                .columns([
                    FeeConfigs::Id,
                    FeeConfigs::ProcessorRateBps,
                    FeeConfigs::ProcessorFixedFee,
                    FeeConfigs::PlatformRateBps,
                    FeeConfigs::PlatformFixedFee,
                    FeeConfigs::PlatformMinimumFee,
                    FeeConfigs::PlatformMaximumFee,
                    FeeConfigs::MinimumPayoutAmount,
                    FeeConfigs::UpdatedAt,
                ])
                .values_panic([
                    1.into(),
                    360.into(),
                    0i64.into(),
                    300.into(),
                    30i64.into(),
                    50i64.into(),
                    500i64.into(),
                    100i64.into(),
                    chrono::Utc::now().into(),
                ])
                .to_owned();

            let backend = manager.get_database_backend();
            manager
                .get_connection()
                .execute(backend.build(&seed))
                .await
                .map(|_| ())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(FeeConfigs::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum FeeConfigs {
        Table,
        Id,
        ProcessorRateBps,
        ProcessorFixedFee,
        PlatformRateBps,
        PlatformFixedFee,
        PlatformMinimumFee,
        PlatformMaximumFee,
        MinimumPayoutAmount,
        UpdatedAt,
    }
}

mod m20250301_000004_create_settlement_reports_table {
    use super::m20250301_000001_create_events_tables::Events;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000004_create_settlement_reports_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let amount = |col: SettlementReports| {
                ColumnDef::new(col)
                    .big_integer()
                    .not_null()
                    .default(0)
                    .to_owned()
            };

            manager
                .create_table(
                    Table::create()
                        .table(SettlementReports::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SettlementReports::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SettlementReports::EventId).uuid().not_null())
                        .col(
                            ColumnDef::new(SettlementReports::EventTitle)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementReports::EventDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementReports::OrganizerId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementReports::ProcessorAccountId)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SettlementReports::TransferGroup)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementReports::GeneratedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementReports::GeneratedOn)
                                .date()
                                .not_null(),
                        )
                        .col(amount(SettlementReports::TotalSales))
                        .col(amount(SettlementReports::TotalProcessorFee))
                        .col(amount(SettlementReports::TotalPlatformFee))
                        .col(amount(SettlementReports::NetPayout))
                        .col(amount(SettlementReports::PaymentCount))
                        .col(amount(SettlementReports::RefundCount))
                        .col(amount(SettlementReports::RefundAmount))
                        .col(amount(SettlementReports::DisputeCount))
                        .col(amount(SettlementReports::DisputeAmount))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_settlement_reports_event_id")
                                .from(SettlementReports::Table, SettlementReports::EventId)
                                .to(Events::Table, Events::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("uq_settlement_reports_event_day")
                        .table(SettlementReports::Table)
                        .col(SettlementReports::EventId)
                        .col(SettlementReports::GeneratedOn)
                        .unique()
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_settlement_reports_organizer_id")
                        .table(SettlementReports::Table)
                        .col(SettlementReports::OrganizerId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SettlementReports::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden, Clone, Copy)]
    enum SettlementReports {
        Table,
        Id,
        EventId,
        EventTitle,
        EventDate,
        OrganizerId,
        ProcessorAccountId,
        TransferGroup,
        GeneratedAt,
        GeneratedOn,
        TotalSales,
        TotalProcessorFee,
        TotalPlatformFee,
        NetPayout,
        PaymentCount,
        RefundCount,
        RefundAmount,
        DisputeCount,
        DisputeAmount,
    }
}
