use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "SUCCEEDED" => Ok(PaymentStatus::Succeeded),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

/// Result of starting a checkout with the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentSession {
    pub reference: String,
    pub payment_url: String,
    pub gateway_uid: String,
    pub status_token: String,
}

/// Gateway answer to a status check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentCheck {
    pub status: PaymentStatus,
    pub gateway_uid: Option<String>,
    pub amount: Option<f64>,
    pub failure_code: Option<String>,
    pub raw: serde_json::Value,
}

/// Authenticated callback parsed by the gateway adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEvent {
    pub reference: String,
    pub gateway_uid: Option<String>,
    pub amount: f64,
    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    /// Set when the gateway reports a failure the user cannot retry.
    pub terminal: bool,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefundReceipt {
    pub refund_id: String,
    /// True when the gateway settled the refund synchronously.
    pub settled: bool,
    pub raw: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("Payment gateway timed out")]
    Timeout,
    #[error("Payment gateway rejected request: {0}")]
    Rejected(String),
    #[error("Webhook signature verification failed")]
    InvalidSignature,
    #[error("Malformed gateway payload: {0}")]
    MalformedPayload(String),
}

/// Swappable payment provider. Call failures never change intent status;
/// only explicit gateway answers (webhook or status check) do.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Start a checkout for `amount` under our `reference`.
    async fn initiate_payment(
        &self,
        amount: f64,
        currency: &str,
        reference: &str,
    ) -> Result<PaymentSession, GatewayError>;

    /// Ask the gateway for the current state of a checkout.
    async fn check_status(&self, status_token: &str) -> Result<PaymentCheck, GatewayError>;

    /// Authenticate and parse a raw callback body.
    fn parse_webhook(&self, signature: Option<&str>, raw: &[u8]) -> Result<WebhookEvent, GatewayError>;

    async fn refund(
        &self,
        gateway_uid: &str,
        amount: f64,
        currency: &str,
    ) -> Result<RefundReceipt, GatewayError>;
}
