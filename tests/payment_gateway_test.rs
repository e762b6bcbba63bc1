mod common;

use assert_matches::assert_matches;
use chrono::{Duration, TimeZone, Utc};
use common::{TestApp, CONNECTED_ACCOUNT};
use eventpay_api::{
    errors::ServiceError,
    models::{PaymentMethod, PaymentStatus},
};
use uuid::Uuid;

#[tokio::test]
async fn card_session_creates_one_pending_payment_with_fees() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = app.create_paid_event(organizer, 1000).await;
    let attendance = app.create_attendance(event.id, None).await;

    let session = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &event)
        .await
        .expect("session created");

    let payments = app.payments_for(attendance.id).await;
    assert_eq!(payments.len(), 1);
    let payment = &payments[0];
    assert_eq!(payment.id, session.payment_id);
    assert_eq!(payment.method, PaymentMethod::Card);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.processor_session_id.as_deref(), Some(session.session_id.as_str()));
    // Seeded config: 3% + 30, min 50, max 500
    assert_eq!(payment.application_fee_amount, Some(60));

    let request = app.processor.last_request().expect("processor called");
    assert_eq!(request.payment_id, payment.id);
    assert_eq!(request.application_fee_amount, 60);
    assert_eq!(request.destination_account, CONNECTED_ACCOUNT);
    assert_eq!(request.transfer_group, format!("event_{}", event.id));
    assert!(request.success_url.contains(&attendance.id.to_string()));
}

#[tokio::test]
async fn repeated_checkout_in_same_window_reuses_row_and_session() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1500).await;
    let attendance = app.create_attendance(event.id, Some(Uuid::new_v4())).await;
    let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 3, 0).unwrap();

    let first = app
        .state
        .gateway
        .create_card_session_at(&attendance, 1500, &event, now)
        .await
        .unwrap();
    let second = app
        .state
        .gateway
        .create_card_session_at(&attendance, 1500, &event, now + Duration::minutes(2))
        .await
        .unwrap();

    assert_eq!(first.payment_id, second.payment_id);
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(app.payments_for(attendance.id).await.len(), 1);
}

#[tokio::test]
async fn checkout_in_a_later_window_opens_a_new_session_on_the_same_row() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1500).await;
    let attendance = app.create_attendance(event.id, None).await;
    let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 3, 0).unwrap();

    let first = app
        .state
        .gateway
        .create_card_session_at(&attendance, 1500, &event, now)
        .await
        .unwrap();
    let later = app
        .state
        .gateway
        .create_card_session_at(&attendance, 1500, &event, now + Duration::minutes(45))
        .await
        .unwrap();

    assert_eq!(first.payment_id, later.payment_id);
    assert_ne!(first.session_id, later.session_id);
    let payment = app.payment(later.payment_id).await;
    assert_eq!(payment.processor_session_id, Some(later.session_id));
}

#[tokio::test]
async fn slow_checkout_attempt_cannot_overwrite_a_newer_session() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1500).await;
    let attendance = app.create_attendance(event.id, None).await;
    let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 3, 0).unwrap();

    let hold = app.processor.hold_next_create();
    let gateway = app.state.gateway.clone();
    let (att, ev) = (attendance.clone(), event.clone());
    let slow = tokio::spawn(async move {
        gateway.create_card_session_at(&att, 1500, &ev, now).await
    });
    hold.entered.notified().await;

    let fresh = app
        .state
        .gateway
        .create_card_session_at(&attendance, 1500, &event, now + Duration::minutes(45))
        .await
        .unwrap();
    hold.release.notify_one();
    let slow = slow.await.expect("slow attempt task").unwrap();

    assert_eq!(slow.payment_id, fresh.payment_id);
    assert_ne!(slow.session_id, fresh.session_id);
    let payment = app.payment(fresh.payment_id).await;
    assert_eq!(payment.processor_session_id.as_deref(), Some(fresh.session_id.as_str()));

    let verified = app
        .state
        .verifier
        .verify(&fresh.session_id, attendance.id, &attendance.guest_token)
        .await
        .unwrap();
    assert_eq!(verified.payment_id, fresh.payment_id);
    let err = app
        .state
        .verifier
        .verify(&slow.session_id, attendance.id, &attendance.guest_token)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::SessionOutdated);
}

#[tokio::test]
async fn concurrent_checkouts_leave_exactly_one_active_payment() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 2000).await;
    let attendance = app.create_attendance(event.id, None).await;

    let gateway_a = app.state.gateway.clone();
    let gateway_b = app.state.gateway.clone();
    let (att_a, att_b) = (attendance.clone(), attendance.clone());
    let (ev_a, ev_b) = (event.clone(), event.clone());

    let (a, b) = tokio::join!(
        tokio::spawn(async move { gateway_a.create_card_session(&att_a, 2000, &ev_a).await }),
        tokio::spawn(async move { gateway_b.create_card_session(&att_b, 2000, &ev_b).await }),
    );
    let a = a.expect("task a").expect("session a");
    let b = b.expect("task b").expect("session b");

    assert_eq!(a.payment_id, b.payment_id);
    assert_eq!(a.session_id, b.session_id);

    let active: Vec<_> = app
        .payments_for(attendance.id)
        .await
        .into_iter()
        .filter(|p| p.status.is_active())
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].processor_session_id.as_deref(), Some(a.session_id.as_str()));
}

#[tokio::test]
async fn failed_card_payment_is_reopened_on_retry() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1000).await;
    let attendance = app.create_attendance(event.id, None).await;
    let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();

    let first = app
        .state
        .gateway
        .create_card_session_at(&attendance, 1000, &event, now)
        .await
        .unwrap();
    app.state
        .state_machine
        .apply_processor_event(first.payment_id, PaymentStatus::Failed, None)
        .await
        .unwrap();

    let retry = app
        .state
        .gateway
        .create_card_session_at(&attendance, 1000, &event, now + Duration::hours(1))
        .await
        .unwrap();

    assert_eq!(retry.payment_id, first.payment_id);
    let payment = app.payment(retry.payment_id).await;
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.processor_session_id, Some(retry.session_id));
    assert_eq!(app.payments_for(attendance.id).await.len(), 1);
}

#[tokio::test]
async fn checkout_after_capture_is_rejected() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1000).await;
    let attendance = app.create_attendance(event.id, None).await;

    let session = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &event)
        .await
        .unwrap();
    app.state
        .state_machine
        .apply_processor_event(session.payment_id, PaymentStatus::Paid, Some("pi_1".into()))
        .await
        .unwrap();

    let err = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &event)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentAlreadyExists(id) if id == attendance.id);
}

#[tokio::test]
async fn card_checkout_is_rejected_while_a_cash_payment_is_active() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1000).await;
    let attendance = app.create_attendance(event.id, None).await;

    app.state
        .gateway
        .create_cash_payment(attendance.id, 1000)
        .await
        .unwrap();

    let err = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &event)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentAlreadyExists(_));
    assert_eq!(app.processor.create_count(), 0);
}

#[tokio::test]
async fn second_cash_payment_for_attendance_is_rejected() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1000).await;
    let attendance = app.create_attendance(event.id, None).await;

    app.state
        .gateway
        .create_cash_payment(attendance.id, 1000)
        .await
        .unwrap();
    let err = app
        .state
        .gateway
        .create_cash_payment(attendance.id, 1000)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentAlreadyExists(id) if id == attendance.id);
}

#[tokio::test]
async fn canceled_payment_frees_the_attendance_for_a_new_one() {
    let app = TestApp::new().await;
    let organizer = Uuid::new_v4();
    let event = app.create_paid_event(organizer, 1000).await;
    let attendance = app.create_attendance(event.id, None).await;

    let cash = app
        .state
        .gateway
        .create_cash_payment(attendance.id, 1000)
        .await
        .unwrap();
    app.state
        .state_machine
        .update_cash_status(cash, organizer, PaymentStatus::Canceled)
        .await
        .unwrap();

    let session = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &event)
        .await
        .unwrap();
    assert_ne!(session.payment_id, cash);
    assert_eq!(app.payments_for(attendance.id).await.len(), 2);
}

#[tokio::test]
async fn transient_processor_failures_are_retried_with_the_same_key() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1000).await;
    let attendance = app.create_attendance(event.id, None).await;
    app.processor.fail_next(2);

    let session = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &event)
        .await
        .expect("third attempt succeeds");

    assert_eq!(app.processor.create_count(), 3);
    assert_eq!(
        app.payment(session.payment_id).await.processor_session_id,
        Some(session.session_id)
    );
}

#[tokio::test]
async fn exhausted_retries_surface_a_retryable_error_and_keep_the_row_pending() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 1000).await;
    let attendance = app.create_attendance(event.id, None).await;
    app.processor.fail_next(10);

    let err = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &event)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let payments = app.payments_for(attendance.id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert!(payments[0].processor_session_id.is_none());
}

#[tokio::test]
async fn card_checkout_preconditions() {
    let app = TestApp::new().await;
    let cash_only = app
        .create_event(Uuid::new_v4(), 1000, "cash", Utc::now() + Duration::days(3))
        .await;
    let attendance = app.create_attendance(cash_only.id, None).await;

    let err = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &cash_only)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let err = app
        .state
        .gateway
        .create_card_session(&attendance, 0, &cash_only)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let other = app.create_paid_event(Uuid::new_v4(), 1000).await;
    let err = app
        .state
        .gateway
        .create_card_session(&attendance, 1000, &other)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn guest_checkout_checks_the_token_and_charges_the_event_fee() {
    let app = TestApp::new().await;
    let event = app.create_paid_event(Uuid::new_v4(), 2500).await;
    let attendance = app.create_attendance(event.id, None).await;

    let err = app
        .state
        .gateway
        .checkout_for_guest(attendance.id, "not-the-token")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    let session = app
        .state
        .gateway
        .checkout_for_guest(attendance.id, &attendance.guest_token)
        .await
        .unwrap();
    assert_eq!(app.payment(session.payment_id).await.amount, 2500);
}
