//! In-memory collaborators for tests: a settable clock, recording notifier and
//! group membership, and a provider whose answers are scripted.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::payments::demo::{has_generic_shape, parse_generic};
use crate::payments::provider::random_hex16;
use crate::payments::signature::verify_hex;
use crate::payments::{
    BillingInterval, InboundPayment, PaymentProvider, PaymentRequest, PaymentResult, ProviderError,
    ProviderPaymentStatus, SubscriptionResult,
};
use crate::subscription::effects::{CollaboratorError, GroupMembership, Notification, Notifier};
use crate::subscription::policy::Clock;

pub const TEST_WEBHOOK_SECRET: &str = "test_webhook_secret";

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *locked(&self.now) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = locked(&self.now);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *locked(&self.now)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(i64, Notification)>>,
    failing: Mutex<HashSet<i64>>,
}

impl RecordingNotifier {
    /// Sends to `user_id` fail from now on.
    pub fn fail_for(&self, user_id: i64) {
        locked(&self.failing).insert(user_id);
    }

    pub fn recover(&self, user_id: i64) {
        locked(&self.failing).remove(&user_id);
    }

    pub fn sent(&self) -> Vec<(i64, Notification)> {
        locked(&self.sent).clone()
    }

    pub fn kinds_for(&self, user_id: i64) -> Vec<&'static str> {
        locked(&self.sent)
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, n)| n.kind())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: i64, notification: &Notification) -> Result<(), CollaboratorError> {
        if locked(&self.failing).contains(&user_id) {
            return Err(CollaboratorError::Other(format!("chat {} unreachable", user_id)));
        }
        locked(&self.sent).push((user_id, notification.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMembership {
    revoked: Mutex<Vec<i64>>,
    restored: Mutex<Vec<i64>>,
    failing: Mutex<HashSet<i64>>,
}

impl RecordingMembership {
    pub fn fail_for(&self, user_id: i64) {
        locked(&self.failing).insert(user_id);
    }

    pub fn revoked(&self) -> Vec<i64> {
        locked(&self.revoked).clone()
    }

    pub fn restored(&self) -> Vec<i64> {
        locked(&self.restored).clone()
    }
}

#[async_trait]
impl GroupMembership for RecordingMembership {
    async fn revoke(&self, user_id: i64) -> Result<(), CollaboratorError> {
        if locked(&self.failing).contains(&user_id) {
            return Err(CollaboratorError::Other("not enough rights to ban".into()));
        }
        locked(&self.revoked).push(user_id);
        Ok(())
    }

    async fn restore(&self, user_id: i64) -> Result<(), CollaboratorError> {
        locked(&self.restored).push(user_id);
        Ok(())
    }
}

/// Provider with queued answers for stored-method charges.
///
/// With an empty queue charges succeed. Subscription intents are captured
/// with a saved method unless `capture_subscriptions(false)` was set; one-time
/// payments always return a link. Webhooks are signed with
/// [`TEST_WEBHOOK_SECRET`] and use the generic JSON shape.
pub struct ScriptedProvider {
    charges: Mutex<VecDeque<Result<PaymentResult, ProviderError>>>,
    charge_delay: Mutex<Option<Duration>>,
    capture_subscriptions: Mutex<bool>,
    charge_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            charges: Mutex::new(VecDeque::new()),
            charge_delay: Mutex::new(None),
            capture_subscriptions: Mutex::new(true),
            charge_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_charge(&self, result: PaymentResult) {
        locked(&self.charges).push_back(Ok(result));
    }

    pub fn push_charge_error(&self, error: ProviderError) {
        locked(&self.charges).push_back(Err(error));
    }

    pub fn decline_next_charges(&self, count: usize, reason: &str) {
        for _ in 0..count {
            self.push_charge(PaymentResult::declined(reason));
        }
    }

    /// Every charge sleeps this long before answering.
    pub fn set_charge_delay(&self, delay: Duration) {
        *locked(&self.charge_delay) = Some(delay);
    }

    pub fn capture_subscriptions(&self, capture: bool) {
        *locked(&self.capture_subscriptions) = capture;
    }

    pub fn charge_calls(&self) -> usize {
        self.charge_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    fn link(payment_id: String) -> PaymentResult {
        PaymentResult {
            success: true,
            payment_url: Some(format!("https://pay.example/{}", payment_id)),
            payment_id: Some(payment_id),
            status: ProviderPaymentStatus::Pending,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create_one_time_payment(&self, _request: &PaymentRequest) -> Result<PaymentResult, ProviderError> {
        Ok(Self::link(format!("pay_{}", random_hex16())))
    }

    async fn create_subscription_intent(
        &self,
        _request: &PaymentRequest,
        _interval: BillingInterval,
    ) -> Result<PaymentResult, ProviderError> {
        let payment_id = format!("sub_{}", random_hex16());
        if !*locked(&self.capture_subscriptions) {
            return Ok(Self::link(payment_id));
        }
        Ok(PaymentResult {
            success: true,
            payment_url: None,
            charge_id: Some(payment_id.clone()),
            payment_id: Some(payment_id),
            status: ProviderPaymentStatus::Succeeded,
            payment_method_ref: Some(format!("pm_{}", random_hex16())),
            error: None,
        })
    }

    async fn cancel_subscription(
        &self,
        _subscription_id: &str,
        _reason: Option<&str>,
    ) -> Result<SubscriptionResult, ProviderError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SubscriptionResult::ok())
    }

    async fn charge_stored_method(
        &self,
        payment_method_ref: &str,
        _request: &PaymentRequest,
    ) -> Result<PaymentResult, ProviderError> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *locked(&self.charge_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = locked(&self.charges).pop_front();
        match scripted {
            Some(result) => result,
            None => {
                let charge_id = format!("chg_{}", random_hex16());
                Ok(PaymentResult {
                    success: true,
                    payment_id: Some(charge_id.clone()),
                    charge_id: Some(charge_id),
                    status: ProviderPaymentStatus::Succeeded,
                    payment_method_ref: Some(payment_method_ref.to_string()),
                    ..Default::default()
                })
            }
        }
    }

    fn verify_inbound_event(&self, raw_payload: &[u8], signature: Option<&str>) -> bool {
        let Some(signature) = signature else {
            return false;
        };
        verify_hex(TEST_WEBHOOK_SECRET.as_bytes(), raw_payload, signature)
            && serde_json::from_slice::<Value>(raw_payload)
                .map(|payload| has_generic_shape(&payload))
                .unwrap_or(false)
    }

    fn parse_inbound_event(&self, raw_payload: &[u8]) -> Result<InboundPayment, ProviderError> {
        let payload: Value =
            serde_json::from_slice(raw_payload).map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;
        parse_generic(&payload)
    }
}
