mod common;

use assert_matches::assert_matches;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use common::{test_config, TestApp};
use eventpay_api::{
    errors::ServiceError,
    models::{event, PaymentStatus},
    services::settlement::ExportFilter,
};
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

fn event_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 18, 0, 0).unwrap()
}

/// Finished event with two captured card payments of 1000, one received cash
/// payment and one abandoned card checkout.
async fn finished_event(app: &TestApp, organizer: Uuid) -> event::Model {
    let event = app
        .create_event(organizer, 1000, "card,cash", event_day())
        .await;

    for _ in 0..2 {
        let attendance = app.create_attendance(event.id, None).await;
        let session = app
            .state
            .gateway
            .create_card_session(&attendance, 1000, &event)
            .await
            .unwrap();
        app.state
            .state_machine
            .apply_processor_event(session.payment_id, PaymentStatus::Paid, None)
            .await
            .unwrap();
    }

    let cash_attendee = app.create_attendance(event.id, None).await;
    let cash = app
        .state
        .gateway
        .create_cash_payment(cash_attendee.id, 1000)
        .await
        .unwrap();
    app.state
        .state_machine
        .update_cash_status(cash, organizer, PaymentStatus::Received)
        .await
        .unwrap();

    let abandoned = app.create_attendance(event.id, None).await;
    app.state
        .gateway
        .create_card_session(&abandoned, 1000, &event)
        .await
        .unwrap();

    event
}

#[tokio::test]
async fn report_totals_only_captured_card_payments() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = finished_event(&app, organizer).await;

    let outcome = app
        .state
        .settlements
        .generate(event.id, organizer)
        .await
        .unwrap();

    let report = &outcome.report;
    assert!(!outcome.already_exists);
    assert_eq!(report.payment_count, 2);
    assert_eq!(report.total_sales, 2000);
    // 3% + 30 platform fee and 3.6% processor estimate per 1000
    assert_eq!(report.total_platform_fee, 120);
    assert_eq!(report.total_processor_fee, 72);
    assert_eq!(report.net_payout, 1808);
    assert_eq!(report.transfer_group, format!("event_{}", event.id));
    assert_eq!(outcome.meets_minimum_payout, Some(true));
}

#[tokio::test]
async fn same_day_generation_returns_the_existing_snapshot() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = finished_event(&app, organizer).await;
    let morning = Utc.with_ymd_and_hms(2026, 3, 20, 9, 0, 0).unwrap();

    let first = app
        .state
        .settlements
        .generate_at(event.id, organizer, morning)
        .await
        .unwrap();
    let second = app
        .state
        .settlements
        .generate_at(event.id, organizer, morning + Duration::hours(5))
        .await
        .unwrap();

    assert!(second.already_exists);
    assert_eq!(first.report_id, second.report_id);
    assert_eq!(first.report.total_sales, second.report.total_sales);
    assert_eq!(first.report.net_payout, second.report.net_payout);
    assert_eq!(second.report.generated_at, morning + Duration::hours(5));
}

#[tokio::test]
async fn a_new_day_produces_a_new_snapshot() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = finished_event(&app, organizer).await;
    let day_one = Utc.with_ymd_and_hms(2026, 3, 20, 9, 0, 0).unwrap();

    let first = app
        .state
        .settlements
        .generate_at(event.id, organizer, day_one)
        .await
        .unwrap();
    let second = app
        .state
        .settlements
        .generate_at(event.id, organizer, day_one + Duration::days(1))
        .await
        .unwrap();

    assert!(!second.already_exists);
    assert_ne!(first.report_id, second.report_id);
    assert_eq!(
        second.report.generated_on,
        NaiveDate::from_ymd_opt(2026, 3, 21).unwrap()
    );

    let export = app
        .state
        .settlements
        .export_csv(organizer, ExportFilter::default())
        .await
        .unwrap();
    assert_eq!(export.row_count, 2);
}

#[tokio::test]
async fn refunds_are_reflected_on_regeneration() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = finished_event(&app, organizer).await;

    let before = app
        .state
        .settlements
        .generate(event.id, organizer)
        .await
        .unwrap();

    let paid = app
        .payments_for_event_with_status(event.id, PaymentStatus::Paid)
        .await;
    app.state
        .state_machine
        .record_refund(paid[0], 400)
        .await
        .unwrap();

    let after = app
        .state
        .settlements
        .regenerate_after_refund_or_dispute(event.id, organizer)
        .await
        .unwrap();

    assert_eq!(after.report_id, before.report_id);
    assert_eq!(after.report.refund_count, 1);
    assert_eq!(after.report.refund_amount, 400);
    assert_eq!(after.report.net_payout, before.report.net_payout - 400);
}

#[tokio::test]
async fn only_the_organizer_may_settle() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = app.create_event(organizer, 1000, "card", event_day()).await;

    let err = app
        .state
        .settlements
        .generate(event.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));
}

#[tokio::test]
async fn upcoming_event_cannot_be_settled() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = app.create_paid_event(organizer, 1000).await;

    let err = app
        .state
        .settlements
        .generate(event.id, organizer)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn event_without_sales_reports_zero_and_misses_minimum_payout() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = app.create_event(organizer, 1000, "card", event_day()).await;

    let outcome = app
        .state
        .settlements
        .generate(event.id, organizer)
        .await
        .unwrap();
    assert_eq!(outcome.report.total_sales, 0);
    assert_eq!(outcome.report.payment_count, 0);
    assert_eq!(outcome.report.net_payout, 0);
    assert_eq!(outcome.meets_minimum_payout, Some(false));
}

#[tokio::test]
async fn settlement_day_follows_the_configured_offset() {
    let mut cfg = test_config();
    cfg.settlement_utc_offset_minutes = 9 * 60;
    let app = TestApp::with_config(cfg).await;
    let organizer = Uuid::new_v4();
    let event = app.create_event(organizer, 1000, "card", event_day()).await;

    let late_utc = Utc.with_ymd_and_hms(2026, 3, 20, 20, 0, 0).unwrap();
    let outcome = app
        .state
        .settlements
        .generate_at(event.id, organizer, late_utc)
        .await
        .unwrap();
    assert_eq!(
        outcome.report.generated_on,
        NaiveDate::from_ymd_opt(2026, 3, 21).unwrap()
    );
}

#[tokio::test]
async fn csv_export_escapes_fields_and_reports_truncation() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = app.create_event(organizer, 1000, "card", event_day()).await;
    let mut renamed: event::ActiveModel = event.clone().into();
    renamed.title = Set("Futsal, \"night\" edition".to_string());
    renamed.update(app.db()).await.unwrap();

    let day_one = Utc.with_ymd_and_hms(2026, 3, 20, 9, 0, 0).unwrap();
    for offset in 0..3 {
        app.state
            .settlements
            .generate_at(event.id, organizer, day_one + Duration::days(offset))
            .await
            .unwrap();
    }

    let export = app
        .state
        .settlements
        .export_csv(
            organizer,
            ExportFilter {
                event_id: Some(event.id),
                limit: Some(2),
            },
        )
        .await
        .unwrap();

    assert!(export.truncated);
    assert_eq!(export.row_count, 2);
    let lines: Vec<&str> = export.csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("report_id,event_id,event_title"));
    assert!(lines[1].contains("\"Futsal, \"\"night\"\" edition\""));
    // Newest snapshot first
    assert!(lines[1].contains(",2026-03-22,"));

    let other = app
        .state
        .settlements
        .export_csv(Uuid::new_v4(), ExportFilter::default())
        .await
        .unwrap();
    assert_eq!(other.row_count, 0);
    assert!(!other.truncated);
}
