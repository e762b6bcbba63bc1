//! EventPay API Library
//!
//! Payment lifecycle, fee calculation, reconciliation and settlement for
//! pay-at-the-link event registration.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod migrator;
pub mod models;
pub mod processor;
pub mod services;

use axum::{extract::FromRef, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{
    auth::AuthService,
    processor::PaymentProcessor,
    services::{
        fee_calculator::FeeCalculator,
        fee_config_store::{DbFeeConfigSource, FeeCachePolicy, FeeConfigStore},
        payment_gateway::{GatewaySettings, PaymentGateway},
        payment_state_machine::PaymentStateMachine,
        reconciliation::ReconciliationVerifier,
        registration::RegistrationService,
        restrictions::{RestrictionEngine, RestrictionService},
        settlement::SettlementReportGenerator,
    },
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub auth: Arc<AuthService>,
    pub fee_store: Arc<FeeConfigStore>,
    pub fees: FeeCalculator,
    pub gateway: Arc<PaymentGateway>,
    pub state_machine: Arc<PaymentStateMachine>,
    pub verifier: Arc<ReconciliationVerifier>,
    pub settlements: Arc<SettlementReportGenerator>,
    pub restrictions: Arc<RestrictionService>,
    pub registrations: Arc<RegistrationService>,
}

impl AppState {
    /// Wires every service against one database pool and processor client.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        processor: Arc<dyn PaymentProcessor>,
    ) -> Self {
        let auth = Arc::new(AuthService::new(&config.jwt_secret, config.auth_issuer.clone()));
        let fee_store = Arc::new(FeeConfigStore::new(
            Arc::new(DbFeeConfigSource::new(db.clone())),
            config.environment.clone(),
            FeeCachePolicy::from(&config),
        ));
        let fees = FeeCalculator::new(fee_store.clone());

        let gateway = PaymentGateway::new(
            db.clone(),
            processor.clone(),
            fees.clone(),
            GatewaySettings::from(&config),
        );
        let settlements =
            SettlementReportGenerator::from_config(db.clone(), fee_store.clone(), &config);
        let restrictions =
            RestrictionService::new(db.clone(), Arc::new(RestrictionEngine::new()));

        Self {
            auth,
            fees,
            gateway: Arc::new(gateway),
            state_machine: Arc::new(PaymentStateMachine::new(db.clone())),
            verifier: Arc::new(ReconciliationVerifier::new(db.clone(), processor)),
            settlements: Arc::new(settlements),
            restrictions: Arc::new(restrictions),
            registrations: Arc::new(RegistrationService::new(db.clone())),
            fee_store,
            config: Arc::new(config),
            db,
        }
    }
}

impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Full HTTP surface: `/health` plus the versioned API.
pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.is_development() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", handlers::api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
