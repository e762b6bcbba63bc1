//! Payment processor collaborator.
//!
//! The rest of the crate talks to the processor only through the
//! [`PaymentProcessor`] trait. [`http::HttpPaymentProcessor`] is the
//! production implementation; tests plug in doubles.

pub mod http;
pub mod idempotency;

use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub use http::HttpPaymentProcessor;

/// Metadata key carrying the local payment id on sessions and payment intents.
pub const PAYMENT_ID_METADATA_KEY: &str = "payment_id";

/// Everything needed to open a hosted checkout session for one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSessionRequest {
    pub payment_id: Uuid,
    pub attendance_id: Uuid,
    pub event_id: Uuid,
    pub product_name: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub application_fee_amount: i64,
    /// Connected account receiving the destination charge
    pub destination_account: String,
    pub transfer_group: String,
    pub expires_at: DateTime<Utc>,
}

impl CheckoutSessionRequest {
    /// Metadata attached to both the session and its payment intent.
    pub fn metadata(&self) -> Vec<(&'static str, String)> {
        vec![
            (PAYMENT_ID_METADATA_KEY, self.payment_id.to_string()),
            ("attendance_id", self.attendance_id.to_string()),
            ("event_id", self.event_id.to_string()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Complete,
    Expired,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentRef {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Processor-side view of a checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub status: SessionStatus,
    pub payment_status: SessionPaymentStatus,
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub payment_intent: Option<PaymentIntentRef>,
}

impl CheckoutSession {
    /// Local payment id recorded on the session, looked up in order:
    /// client reference, session metadata, payment intent metadata.
    pub fn referenced_payment_id(&self) -> Option<Uuid> {
        let parse = |raw: Option<&String>| raw.and_then(|v| Uuid::parse_str(v.trim()).ok());

        parse(self.client_reference_id.as_ref())
            .or_else(|| parse(self.metadata.get(PAYMENT_ID_METADATA_KEY)))
            .or_else(|| {
                self.payment_intent
                    .as_ref()
                    .and_then(|pi| parse(pi.metadata.get(PAYMENT_ID_METADATA_KEY)))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// Network failures, timeouts, rate limits and 5xx responses
    #[error("transient processor failure: {0}")]
    Transient(String),
    #[error("processor rejected request: {0}")]
    Permanent(String),
    #[error("processor resource not found: {0}")]
    NotFound(String),
}

impl ProcessorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ProcessorError> for ServiceError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::NotFound(_) => ServiceError::SessionNotFound,
            ProcessorError::Transient(message) => ServiceError::ProcessorApiError {
                message,
                retryable: true,
            },
            ProcessorError::Permanent(message) => ServiceError::ProcessorApiError {
                message,
                retryable: false,
            },
        }
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Creates a hosted checkout session. Repeating a call with the same
    /// idempotency key returns the originally created session.
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ProcessorError>;

    /// Retrieves a session with its payment intent expanded.
    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, ProcessorError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): base, 2x base, 4x base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Creates a checkout session, retrying transient failures with the same
/// idempotency key so that a retry can never open a second session.
pub async fn create_session_with_retry(
    processor: &dyn PaymentProcessor,
    request: &CheckoutSessionRequest,
    idempotency_key: &str,
    policy: RetryPolicy,
) -> Result<CheckoutSession, ProcessorError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match processor
            .create_checkout_session(request, idempotency_key)
            .await
        {
            Ok(session) => return Ok(session),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                counter!("eventpay_processor.retries", 1);
                let backoff = policy.backoff(attempt);
                warn!(
                    payment_id = %request.payment_id,
                    error = %err,
                    "Checkout session creation failed (attempt {}/{}), retrying in {:?}",
                    attempt,
                    max_attempts,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
