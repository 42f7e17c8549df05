use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::payment::PaymentStatus;
use crate::StoreResult;

/// Amounts closer than this are treated as equal.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

pub fn amounts_match(expected: f64, received: f64) -> bool {
    (expected - received).abs() < AMOUNT_TOLERANCE
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAuditEvent {
    Initiated,
    GatewayResponse,
    WebhookReceived,
    StatusCheck,
    Success,
    Failure,
    RefundInitiated,
    RefundCompleted,
    ReconciliationMismatch,
}

impl PaymentAuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentAuditEvent::Initiated => "initiated",
            PaymentAuditEvent::GatewayResponse => "gateway_response",
            PaymentAuditEvent::WebhookReceived => "webhook_received",
            PaymentAuditEvent::StatusCheck => "status_check",
            PaymentAuditEvent::Success => "success",
            PaymentAuditEvent::Failure => "failure",
            PaymentAuditEvent::RefundInitiated => "refund_initiated",
            PaymentAuditEvent::RefundCompleted => "refund_completed",
            PaymentAuditEvent::ReconciliationMismatch => "reconciliation_mismatch",
        }
    }
}

impl FromStr for PaymentAuditEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(PaymentAuditEvent::Initiated),
            "gateway_response" => Ok(PaymentAuditEvent::GatewayResponse),
            "webhook_received" => Ok(PaymentAuditEvent::WebhookReceived),
            "status_check" => Ok(PaymentAuditEvent::StatusCheck),
            "success" => Ok(PaymentAuditEvent::Success),
            "failure" => Ok(PaymentAuditEvent::Failure),
            "refund_initiated" => Ok(PaymentAuditEvent::RefundInitiated),
            "refund_completed" => Ok(PaymentAuditEvent::RefundCompleted),
            "reconciliation_mismatch" => Ok(PaymentAuditEvent::ReconciliationMismatch),
            other => Err(format!("unknown audit event: {}", other)),
        }
    }
}

/// One immutable row of the payment ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentAudit {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub user_id: Uuid,
    pub event: PaymentAuditEvent,
    pub gateway: Option<String>,
    pub gateway_reference: Option<String>,
    pub gateway_uid: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    pub expected_amount: Option<f64>,
    pub received_amount: Option<f64>,
    pub amounts_match: Option<bool>,
    pub currency: Option<String>,
    pub request_payload: Option<serde_json::Value>,
    pub response_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentAudit {
    pub fn builder(intent_id: Uuid, user_id: Uuid, event: PaymentAuditEvent) -> PaymentAuditBuilder {
        PaymentAuditBuilder {
            intent_id,
            user_id,
            event,
            gateway: None,
            gateway_reference: None,
            gateway_uid: None,
            payment_status: None,
            expected_amount: None,
            received_amount: None,
            currency: None,
            request_payload: None,
            response_payload: None,
            error_message: None,
        }
    }
}

/// Collects audit fields by value and produces the finished row in `build`,
/// so no partially filled record is ever shared.
#[derive(Debug, Clone)]
pub struct PaymentAuditBuilder {
    intent_id: Uuid,
    user_id: Uuid,
    event: PaymentAuditEvent,
    gateway: Option<String>,
    gateway_reference: Option<String>,
    gateway_uid: Option<String>,
    payment_status: Option<PaymentStatus>,
    expected_amount: Option<f64>,
    received_amount: Option<f64>,
    currency: Option<String>,
    request_payload: Option<serde_json::Value>,
    response_payload: Option<serde_json::Value>,
    error_message: Option<String>,
}

impl PaymentAuditBuilder {
    pub fn gateway(mut self, name: impl Into<String>) -> Self {
        self.gateway = Some(name.into());
        self
    }

    pub fn reference(mut self, reference: Option<&str>) -> Self {
        self.gateway_reference = reference.map(str::to_owned);
        self
    }

    pub fn gateway_uid(mut self, uid: Option<&str>) -> Self {
        self.gateway_uid = uid.map(str::to_owned);
        self
    }

    pub fn status(mut self, status: PaymentStatus) -> Self {
        self.payment_status = Some(status);
        self
    }

    pub fn expected(mut self, amount: f64, currency: impl Into<String>) -> Self {
        self.expected_amount = Some(amount);
        self.currency = Some(currency.into());
        self
    }

    pub fn received(mut self, amount: Option<f64>) -> Self {
        self.received_amount = amount;
        self
    }

    pub fn request(mut self, payload: serde_json::Value) -> Self {
        self.request_payload = Some(payload);
        self
    }

    pub fn response(mut self, payload: serde_json::Value) -> Self {
        self.response_payload = Some(payload);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn build(self, at: DateTime<Utc>) -> PaymentAudit {
        let amounts_match = match (self.expected_amount, self.received_amount) {
            (Some(expected), Some(received)) => Some(amounts_match(expected, received)),
            _ => None,
        };

        PaymentAudit {
            id: Uuid::new_v4(),
            intent_id: self.intent_id,
            user_id: self.user_id,
            event: self.event,
            gateway: self.gateway,
            gateway_reference: self.gateway_reference,
            gateway_uid: self.gateway_uid,
            payment_status: self.payment_status,
            expected_amount: self.expected_amount,
            received_amount: self.received_amount,
            amounts_match,
            currency: self.currency,
            request_payload: self.request_payload,
            response_payload: self.response_payload,
            error_message: self.error_message,
            created_at: at,
        }
    }
}

/// Append-only payment ledger.
#[async_trait]
pub trait PaymentAuditLog: Send + Sync {
    async fn append(&self, audit: &PaymentAudit) -> StoreResult<()>;
    async fn list_for_intent(&self, intent_id: Uuid) -> StoreResult<Vec<PaymentAudit>>;
}
