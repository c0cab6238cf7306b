//! Payment gateway trait and in-memory implementation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{Currency, Money};
use domain::PaymentSessionData;

use crate::error::AdapterError;

/// Request for a hosted payment session.
#[derive(Debug, Clone)]
pub struct PaymentSessionRequest {
    pub amount: Money,
    pub currency: Currency,
    /// Merchant reference, unique per checkout attempt.
    pub reference: String,
    /// Where the shopper is sent after paying.
    pub return_url: String,
    pub country: String,
}

/// Opaque proof of payment returned to us by the shopper's client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentProof(String);

impl PaymentProof {
    pub fn new(proof: impl Into<String>) -> Self {
        Self(proof.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of verifying a payment with the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentVerification {
    /// Gateway-assigned payment identifier (PSP reference).
    pub payment_id: String,
    pub succeeded: bool,
    /// Gateway's refusal reason when `succeeded` is false.
    pub reason: Option<String>,
}

/// Trait for payment gateway operations.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a hosted payment session for the given amount.
    async fn create_session(
        &self,
        request: &PaymentSessionRequest,
    ) -> Result<PaymentSessionData, AdapterError>;

    /// Verifies a payment against the amount, currency and reference it must match.
    ///
    /// A declined payment is `Ok` with `succeeded == false`; `Err` means the
    /// gateway could not be asked.
    async fn verify(
        &self,
        proof: &PaymentProof,
        amount: Money,
        currency: &Currency,
        reference: &str,
    ) -> Result<PaymentVerification, AdapterError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    sessions: HashMap<String, (Money, Currency, String)>,
    declined_proofs: HashSet<String>,
    next_id: u32,
    verify_calls: usize,
    fail_on_create: bool,
    fail_on_verify: bool,
}

/// In-memory payment gateway for testing.
///
/// Any proof verifies successfully unless it was marked declined, or the
/// amount or currency differ from the session created for the reference.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentGateway {
    /// Creates a new in-memory payment gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures session creation to fail.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.write().fail_on_create = fail;
    }

    /// Configures verification to fail with a transport error.
    pub fn set_fail_on_verify(&self, fail: bool) {
        self.write().fail_on_verify = fail;
    }

    /// Makes the gateway decline this proof.
    pub fn decline(&self, proof: &str) {
        self.write().declined_proofs.insert(proof.to_string());
    }

    /// Returns the number of payment sessions created.
    pub fn session_count(&self) -> usize {
        self.read().sessions.len()
    }

    /// Returns the number of verification calls received.
    pub fn verify_count(&self) -> usize {
        self.read().verify_calls
    }

    /// Returns the return URL registered for a reference.
    pub fn return_url(&self, reference: &str) -> Option<String> {
        self.read()
            .sessions
            .get(reference)
            .map(|(_, _, url)| url.clone())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryPaymentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn create_session(
        &self,
        request: &PaymentSessionRequest,
    ) -> Result<PaymentSessionData, AdapterError> {
        let mut state = self.write();
        if state.fail_on_create {
            return Err(AdapterError::Unavailable("payment gateway".to_string()));
        }
        state.sessions.insert(
            request.reference.clone(),
            (
                request.amount,
                request.currency.clone(),
                request.return_url.clone(),
            ),
        );

        let client_config = BTreeMap::from([
            ("environment".to_string(), "test".to_string()),
            ("clientKey".to_string(), "test_client_key".to_string()),
            ("countryCode".to_string(), request.country.clone()),
        ]);
        Ok(PaymentSessionData {
            session_token: format!("session-{}", request.reference),
            client_config,
        })
    }

    async fn verify(
        &self,
        proof: &PaymentProof,
        amount: Money,
        currency: &Currency,
        reference: &str,
    ) -> Result<PaymentVerification, AdapterError> {
        let mut state = self.write();
        state.verify_calls += 1;
        if state.fail_on_verify {
            return Err(AdapterError::Unavailable("payment gateway".to_string()));
        }

        state.next_id += 1;
        let payment_id = format!("psp-{:06}", state.next_id);
        let refusal = match state.sessions.get(reference) {
            None => Some("unknown reference".to_string()),
            Some((expected, _, _)) if *expected != amount => {
                Some(format!("amount mismatch: expected {expected}, got {amount}"))
            }
            Some((_, expected, _)) if expected != currency => {
                Some(format!("currency mismatch: expected {expected}, got {currency}"))
            }
            Some(_) if proof.as_str().is_empty() => Some("missing proof".to_string()),
            Some(_) if state.declined_proofs.contains(proof.as_str()) => {
                Some("Refused".to_string())
            }
            Some(_) => None,
        };

        Ok(PaymentVerification {
            payment_id,
            succeeded: refusal.is_none(),
            reason: refusal,
        })
    }
}
