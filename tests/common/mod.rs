#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use eventpay_api::{
    auth::ADMIN_ROLE,
    build_router,
    config::AppConfig,
    db,
    models::{attendance, event, payment, AttendanceStatus, EventStatus, PaymentStatus},
    processor::{
        CheckoutSession, CheckoutSessionRequest, PaymentIntentRef, PaymentProcessor,
        ProcessorError, SessionPaymentStatus, SessionStatus,
    },
    services::registration::generate_guest_token,
    AppState,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, JoinType, QueryFilter, QueryOrder, QuerySelect,
    RelationTrait, Set,
};
use serde_json::Value;
use tokio::sync::Notify;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const CONNECTED_ACCOUNT: &str = "acct_test_organizer";

/// In-memory processor double. Honors idempotency keys the way the real
/// processor does: the same key always yields the same session.
#[derive(Default)]
pub struct FakeProcessor {
    by_key: Mutex<HashMap<String, String>>,
    sessions: Mutex<HashMap<String, CheckoutSession>>,
    requests: Mutex<Vec<CheckoutSessionRequest>>,
    transient_failures: AtomicUsize,
    pub create_calls: AtomicUsize,
    counter: AtomicUsize,
    hold: Mutex<Option<Arc<CreateHold>>>,
}

/// Pauses one create call after the session exists but before it is returned.
#[derive(Default)]
pub struct CreateHold {
    pub entered: Notify,
    pub release: Notify,
}

impl FakeProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `n` create calls fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Holds the next create call until `release` is notified.
    pub fn hold_next_create(&self) -> Arc<CreateHold> {
        let hold = Arc::new(CreateHold::default());
        *self.hold.lock().unwrap() = Some(hold.clone());
        hold
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CheckoutSessionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn set_state(&self, session_id: &str, status: SessionStatus, payment: SessionPaymentStatus) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(session_id).expect("unknown session");
        session.status = status;
        session.payment_status = payment;
    }

    /// Registers a session that did not come through `create_checkout_session`.
    pub fn insert_session(&self, session: CheckoutSession) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session);
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ProcessorError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProcessorError::Transient("simulated 503".into()));
        }

        if let Some(existing) = self.by_key.lock().unwrap().get(idempotency_key) {
            let sessions = self.sessions.lock().unwrap();
            return Ok(sessions[existing].clone());
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("cs_test_{n}");
        let metadata: HashMap<String, String> = request
            .metadata()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let session = CheckoutSession {
            id: id.clone(),
            url: Some(format!("https://checkout.test/pay/{id}")),
            status: SessionStatus::Open,
            payment_status: SessionPaymentStatus::Unpaid,
            client_reference_id: Some(request.payment_id.to_string()),
            metadata: metadata.clone(),
            payment_intent: Some(PaymentIntentRef {
                id: format!("pi_test_{n}"),
                metadata,
            }),
        };

        self.by_key
            .lock()
            .unwrap()
            .insert(idempotency_key.to_string(), id.clone());
        self.sessions.lock().unwrap().insert(id, session.clone());

        let hold = self.hold.lock().unwrap().take();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        Ok(session)
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, ProcessorError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(session_id.to_string()))
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        TEST_SECRET.to_string(),
        "test".to_string(),
    );
    // One connection keeps every query on the same in-memory database.
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.processor_retry_base_delay_ms = 1;
    cfg.public_base_url = "https://eventpay.test".to_string();
    cfg
}

/// Helper harness for spinning up an application state backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub processor: Arc<FakeProcessor>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let processor = FakeProcessor::new();
        let state = AppState::new(Arc::new(pool), cfg, processor.clone());
        let router = build_router(state.clone());

        Self {
            router,
            state,
            processor,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    pub async fn create_event(
        &self,
        organizer_id: Uuid,
        fee: i64,
        payment_methods: &str,
        date: DateTime<Utc>,
    ) -> event::Model {
        let now = Utc::now();
        event::ActiveModel {
            id: Set(Uuid::new_v4()),
            organizer_id: Set(organizer_id),
            title: Set("Friday futsal".to_string()),
            date: Set(date),
            location: Set(Some("Gym B".to_string())),
            fee: Set(fee),
            capacity: Set(None),
            payment_methods: Set(payment_methods.to_string()),
            processor_account_id: Set(Some(CONNECTED_ACCOUNT.to_string())),
            status: Set(EventStatus::Upcoming),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert event")
    }

    /// A paid card+cash event a week out.
    pub async fn create_paid_event(&self, organizer_id: Uuid, fee: i64) -> event::Model {
        self.create_event(organizer_id, fee, "card,cash", Utc::now() + Duration::days(7))
            .await
    }

    pub async fn create_attendance(
        &self,
        event_id: Uuid,
        user_id: Option<Uuid>,
    ) -> attendance::Model {
        attendance::ActiveModel {
            id: Set(Uuid::new_v4()),
            event_id: Set(event_id),
            user_id: Set(user_id),
            nickname: Set("guest".to_string()),
            email: Set(Some("guest@example.com".to_string())),
            guest_token: Set(generate_guest_token()),
            status: Set(AttendanceStatus::Attending),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert attendance")
    }

    pub async fn payments_for(&self, attendance_id: Uuid) -> Vec<payment::Model> {
        payment::Entity::find()
            .filter(payment::Column::AttendanceId.eq(attendance_id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(self.db())
            .await
            .expect("load payments")
    }

    pub async fn payments_for_event_with_status(
        &self,
        event_id: Uuid,
        status: PaymentStatus,
    ) -> Vec<Uuid> {
        payment::Entity::find()
            .join(JoinType::InnerJoin, payment::Relation::Attendance.def())
            .filter(attendance::Column::EventId.eq(event_id))
            .filter(payment::Column::Status.eq(status))
            .all(self.db())
            .await
            .expect("load event payments")
            .into_iter()
            .map(|p| p.id)
            .collect()
    }

    pub async fn payment(&self, payment_id: Uuid) -> payment::Model {
        payment::Entity::find_by_id(payment_id)
            .one(self.db())
            .await
            .expect("load payment")
            .expect("payment exists")
    }

    pub fn organizer_token(&self, organizer_id: Uuid) -> String {
        self.state
            .auth
            .issue_token(organizer_id, &[], Duration::minutes(10))
            .expect("issue token")
    }

    pub fn admin_token(&self, organizer_id: Uuid) -> String {
        self.state
            .auth
            .issue_token(organizer_id, &[ADMIN_ROLE], Duration::minutes(10))
            .expect("issue token")
    }

    /// Send a request against the router with extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("response is json")
}

pub async fn response_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}
