use super::{
    CheckoutSession, CheckoutSessionRequest, PaymentIntentRef, PaymentProcessor, ProcessorError,
    SessionPaymentStatus, SessionStatus,
};
use crate::config::AppConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Checkout client speaking the processor's form-encoded REST API.
#[derive(Clone)]
pub struct HttpPaymentProcessor {
    client: reqwest::Client,
    api_base: String,
    secret_key: Option<String>,
}

impl HttpPaymentProcessor {
    pub fn new(
        api_base: impl Into<String>,
        secret_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProcessorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessorError::Permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ProcessorError> {
        Self::new(
            config.processor_api_base.clone(),
            config.processor_secret_key.clone(),
            config.processor_timeout(),
        )
    }

    fn secret(&self) -> Result<&str, ProcessorError> {
        self.secret_key
            .as_deref()
            .ok_or_else(|| ProcessorError::Permanent("processor secret key is not configured".into()))
    }

    fn session_form(request: &CheckoutSessionRequest) -> Vec<(String, String)> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "line_items[0][price_data][currency]".into(),
                request.currency.clone(),
            ),
            (
                "line_items[0][price_data][unit_amount]".into(),
                request.amount.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".into(),
                request.product_name.clone(),
            ),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
            (
                "client_reference_id".into(),
                request.payment_id.to_string(),
            ),
            (
                "expires_at".into(),
                request.expires_at.timestamp().to_string(),
            ),
            (
                "payment_intent_data[application_fee_amount]".into(),
                request.application_fee_amount.to_string(),
            ),
            (
                "payment_intent_data[transfer_data][destination]".into(),
                request.destination_account.clone(),
            ),
            (
                "payment_intent_data[transfer_group]".into(),
                request.transfer_group.clone(),
            ),
        ];

        if let Some(email) = &request.customer_email {
            form.push(("customer_email".into(), email.clone()));
        }

        for (key, value) in request.metadata() {
            form.push((format!("metadata[{key}]"), value.clone()));
            form.push((format!("payment_intent_data[metadata][{key}]"), value));
        }

        form
    }

    async fn decode(response: reqwest::Response) -> Result<CheckoutSession, ProcessorError> {
        let status = response.status();
        if status.is_success() {
            let raw: RawCheckoutSession = response
                .json()
                .await
                .map_err(|e| ProcessorError::Permanent(format!("malformed session payload: {e}")))?;
            return Ok(raw.into());
        }

        let message = response
            .json::<ApiErrorEnvelope>()
            .await
            .ok()
            .and_then(|body| body.error.message)
            .unwrap_or_else(|| format!("processor responded with {status}"));

        Err(classify_status(status, message))
    }
}

/// Maps an unsuccessful HTTP status to the retry class of the failure.
pub(crate) fn classify_status(status: StatusCode, message: String) -> ProcessorError {
    match status {
        StatusCode::NOT_FOUND => ProcessorError::NotFound(message),
        // 409 is returned while a request with the same idempotency key is in flight
        StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS => ProcessorError::Transient(message),
        s if s.is_server_error() => ProcessorError::Transient(message),
        _ => ProcessorError::Permanent(message),
    }
}

fn classify_transport(err: reqwest::Error) -> ProcessorError {
    if err.is_builder() {
        ProcessorError::Permanent(err.to_string())
    } else {
        ProcessorError::Transient(err.to_string())
    }
}

#[async_trait]
impl PaymentProcessor for HttpPaymentProcessor {
    #[instrument(skip(self, request, idempotency_key), fields(payment_id = %request.payment_id))]
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ProcessorError> {
        let url = format!("{}/v1/checkout/sessions", self.api_base);
        debug!("Creating checkout session");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.secret()?)
            .header("Idempotency-Key", idempotency_key)
            .form(&Self::session_form(request))
            .send()
            .await
            .map_err(classify_transport)?;

        Self::decode(response).await.map_err(|e| {
            warn!(error = %e, "Checkout session creation failed");
            e
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, ProcessorError> {
        let url = format!("{}/v1/checkout/sessions/{}", self.api_base, session_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.secret()?)
            .query(&[("expand[]", "payment_intent")])
            .send()
            .await
            .map_err(classify_transport)?;

        Self::decode(response).await
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

/// Payment intents come back as a bare id unless expanded.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPaymentIntent {
    Expanded {
        id: String,
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    Id(String),
}

#[derive(Debug, Deserialize)]
struct RawCheckoutSession {
    id: String,
    url: Option<String>,
    status: Option<SessionStatus>,
    payment_status: SessionPaymentStatus,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
    payment_intent: Option<RawPaymentIntent>,
}

impl From<RawCheckoutSession> for CheckoutSession {
    fn from(raw: RawCheckoutSession) -> Self {
        let payment_intent = raw.payment_intent.map(|pi| match pi {
            RawPaymentIntent::Expanded { id, metadata } => PaymentIntentRef { id, metadata },
            RawPaymentIntent::Id(id) => PaymentIntentRef {
                id,
                metadata: HashMap::new(),
            },
        });

        Self {
            id: raw.id,
            url: raw.url,
            status: raw.status.unwrap_or(SessionStatus::Unknown),
            payment_status: raw.payment_status,
            client_reference_id: raw.client_reference_id,
            metadata: raw.metadata.unwrap_or_default(),
            payment_intent,
        }
    }
}
