//! Sandbox payment gateway. Checkouts live in memory and are completed by
//! calling [`MockPaymentGateway::complete`]; callbacks are authenticated with
//! an HMAC-SHA256 of the raw body under the shared webhook secret.

use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use transit_core::payment::{
    GatewayError, PaymentCheck, PaymentGateway, PaymentSession, PaymentStatus, RefundReceipt, WebhookEvent,
};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Failure codes after which the customer cannot retry the same checkout.
const TERMINAL_FAILURE_CODES: &[&str] = &["card_blocked", "fraud_suspected", "do_not_honor"];

#[derive(Debug, Clone)]
struct Checkout {
    reference: String,
    gateway_uid: String,
    amount: f64,
    captured: Option<f64>,
    status: PaymentStatus,
    failure_code: Option<String>,
}

/// Callback body posted by the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxCallback {
    pub reference: String,
    #[serde(default)]
    pub gateway_uid: Option<String>,
    pub amount: f64,
    pub status: PaymentStatus,
    #[serde(default)]
    pub failure_code: Option<String>,
}

pub struct MockPaymentGateway {
    webhook_secret: String,
    checkout_base_url: String,
    checkouts: DashMap<String, Checkout>,
    tokens: DashMap<String, String>,
    unavailable: AtomicBool,
    settle_refunds: AtomicBool,
}

impl MockPaymentGateway {
    pub fn new(webhook_secret: impl Into<String>, checkout_base_url: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            checkout_base_url: checkout_base_url.into(),
            checkouts: DashMap::new(),
            tokens: DashMap::new(),
            unavailable: AtomicBool::new(false),
            settle_refunds: AtomicBool::new(true),
        }
    }

    /// Every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// When false, refunds are accepted but settle later.
    pub fn settle_refunds(&self, settle: bool) {
        self.settle_refunds.store(settle, Ordering::SeqCst);
    }

    /// Simulates the customer finishing checkout. `amount` defaults to the
    /// amount the checkout was opened for.
    pub fn complete(&self, reference: &str, status: PaymentStatus, amount: Option<f64>) -> bool {
        self.complete_with_code(reference, status, amount, None)
    }

    pub fn complete_with_code(
        &self,
        reference: &str,
        status: PaymentStatus,
        amount: Option<f64>,
        failure_code: Option<&str>,
    ) -> bool {
        let Some(token) = self.tokens.get(reference).map(|t| t.value().clone()) else {
            return false;
        };
        match self.checkouts.get_mut(&token) {
            Some(mut checkout) => {
                let captured = amount.unwrap_or(checkout.amount);
                checkout.status = status;
                checkout.captured = match status {
                    PaymentStatus::Succeeded => Some(captured),
                    _ => None,
                };
                checkout.failure_code = failure_code.map(str::to_string);
                true
            }
            None => false,
        }
    }

    /// Builds a signed callback for a checkout as the sandbox would post it.
    pub fn callback_for(&self, reference: &str) -> Option<(Vec<u8>, String)> {
        let token = self.tokens.get(reference).map(|t| t.value().clone())?;
        let checkout = self.checkouts.get(&token)?.value().clone();
        let body = SandboxCallback {
            reference: checkout.reference,
            gateway_uid: Some(checkout.gateway_uid),
            amount: checkout.captured.unwrap_or(checkout.amount),
            status: checkout.status,
            failure_code: checkout.failure_code,
        };
        let raw = serde_json::to_vec(&body).ok()?;
        let signature = self.sign(&raw);
        Some((raw, signature))
    }

    /// Hex HMAC-SHA256 of `raw` under the webhook secret.
    pub fn sign(&self, raw: &[u8]) -> String {
        match HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) {
            Ok(mut mac) => {
                mac.update(raw);
                hex::encode(mac.finalize().into_bytes())
            }
            Err(_) => String::new(),
        }
    }

    fn verify(&self, signature: &str, raw: &[u8]) -> Result<(), GatewayError> {
        let provided = hex::decode(signature.trim()).map_err(|_| GatewayError::InvalidSignature)?;
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| GatewayError::InvalidSignature)?;
        mac.update(raw);
        mac.verify_slice(&provided).map_err(|_| GatewayError::InvalidSignature)
    }

    fn ensure_available(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("sandbox gateway offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    fn name(&self) -> &str {
        "sandbox"
    }

    async fn initiate_payment(
        &self,
        amount: f64,
        currency: &str,
        reference: &str,
    ) -> Result<PaymentSession, GatewayError> {
        self.ensure_available()?;
        if amount <= 0.0 {
            return Err(GatewayError::Rejected(format!("invalid amount {} {}", amount, currency)));
        }

        let gateway_uid = format!("sbx_{}", Uuid::new_v4().simple());
        let status_token = format!("tok_{}", Uuid::new_v4().simple());
        self.checkouts.insert(
            status_token.clone(),
            Checkout {
                reference: reference.to_string(),
                gateway_uid: gateway_uid.clone(),
                amount,
                captured: None,
                status: PaymentStatus::Pending,
                failure_code: None,
            },
        );
        self.tokens.insert(reference.to_string(), status_token.clone());

        Ok(PaymentSession {
            reference: reference.to_string(),
            payment_url: format!("{}/{}", self.checkout_base_url.trim_end_matches('/'), gateway_uid),
            gateway_uid,
            status_token,
        })
    }

    async fn check_status(&self, status_token: &str) -> Result<PaymentCheck, GatewayError> {
        self.ensure_available()?;
        let checkout = self
            .checkouts
            .get(status_token)
            .map(|c| c.value().clone())
            .ok_or_else(|| GatewayError::Rejected(format!("unknown status token {}", status_token)))?;

        Ok(PaymentCheck {
            status: checkout.status,
            gateway_uid: Some(checkout.gateway_uid.clone()),
            amount: checkout.captured,
            failure_code: checkout.failure_code.clone(),
            raw: serde_json::json!({
                "reference": checkout.reference,
                "uid": checkout.gateway_uid,
                "status": checkout.status,
                "amount": checkout.captured,
            }),
        })
    }

    fn parse_webhook(&self, signature: Option<&str>, raw: &[u8]) -> Result<WebhookEvent, GatewayError> {
        let signature = signature.ok_or(GatewayError::InvalidSignature)?;
        self.verify(signature, raw)?;

        let body: SandboxCallback =
            serde_json::from_slice(raw).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
        let raw_json = serde_json::from_slice(raw).unwrap_or(serde_json::Value::Null);
        let terminal = body
            .failure_code
            .as_deref()
            .is_some_and(|code| TERMINAL_FAILURE_CODES.contains(&code));

        Ok(WebhookEvent {
            reference: body.reference,
            gateway_uid: body.gateway_uid,
            amount: body.amount,
            status: body.status,
            failure_code: body.failure_code,
            terminal,
            raw: raw_json,
        })
    }

    async fn refund(&self, gateway_uid: &str, amount: f64, currency: &str) -> Result<RefundReceipt, GatewayError> {
        self.ensure_available()?;
        let mut checkout = self
            .checkouts
            .iter_mut()
            .find(|c| c.gateway_uid == gateway_uid)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown payment {}", gateway_uid)))?;

        if checkout.status != PaymentStatus::Succeeded && checkout.status != PaymentStatus::Refunded {
            return Err(GatewayError::Rejected(format!("payment {} was not captured", gateway_uid)));
        }
        let settled = self.settle_refunds.load(Ordering::SeqCst);
        if settled {
            checkout.status = PaymentStatus::Refunded;
        }

        Ok(RefundReceipt {
            refund_id: format!("rf_{}", Uuid::new_v4().simple()),
            settled,
            raw: serde_json::json!({ "uid": gateway_uid, "amount": amount, "currency": currency, "settled": settled }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> MockPaymentGateway {
        MockPaymentGateway::new("whsec_test", "https://sandbox.example/checkout")
    }

    #[tokio::test]
    async fn test_checkout_lifecycle() {
        let gw = gateway();
        let session = gw.initiate_payment(1500.0, "LKR", "TRN-1").await.unwrap();
        assert!(session.payment_url.ends_with(&session.gateway_uid));

        let pending = gw.check_status(&session.status_token).await.unwrap();
        assert_eq!(pending.status, PaymentStatus::Pending);
        assert_eq!(pending.amount, None);

        assert!(gw.complete("TRN-1", PaymentStatus::Succeeded, None));
        let paid = gw.check_status(&session.status_token).await.unwrap();
        assert_eq!(paid.status, PaymentStatus::Succeeded);
        assert_eq!(paid.amount, Some(1500.0));
    }

    #[tokio::test]
    async fn test_webhook_signature_is_checked() {
        let gw = gateway();
        gw.initiate_payment(900.0, "LKR", "TRN-2").await.unwrap();
        gw.complete_with_code("TRN-2", PaymentStatus::Failed, None, Some("card_blocked"));

        let (raw, signature) = gw.callback_for("TRN-2").unwrap();
        let event = gw.parse_webhook(Some(&signature), &raw).unwrap();
        assert_eq!(event.status, PaymentStatus::Failed);
        assert!(event.terminal);

        assert!(matches!(
            gw.parse_webhook(Some("deadbeef"), &raw),
            Err(GatewayError::InvalidSignature)
        ));
        assert!(matches!(gw.parse_webhook(None, &raw), Err(GatewayError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_unavailable_gateway_fails_calls() {
        let gw = gateway();
        gw.set_unavailable(true);
        assert!(matches!(
            gw.initiate_payment(100.0, "LKR", "TRN-3").await,
            Err(GatewayError::Unavailable(_))
        ));
    }
}
