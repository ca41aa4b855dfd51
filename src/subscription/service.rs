//! The subscription engine.
//!
//! Wires the pure state machine to storage, the payment provider and the
//! user-facing collaborators. Every read-modify-write of a user record runs
//! under that user's lock and commits with a revision check; side effects
//! run after the lock is released.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use crate::core::metrics;
use crate::payments::{
    BillingInterval, InboundPayment, PaymentMetadata, PaymentProvider, PaymentRequest, ProviderError,
    ProviderPaymentStatus, Tariff, TariffCatalog,
};
use crate::storage::{
    CommitOutcome, DbPool, IntentStatus, IntentStore, PaymentEvent, PaymentIntent, PaymentKind, PriceStore, StoreError,
    TariffPrice, UserRecordStore, UserSubscriptionRecord,
};
use crate::subscription::effects::{execute_effects, GroupMembership, Notifier, SideEffect};
use crate::subscription::error::{ServiceError, ServiceResult, TransitionError, WebhookError};
use crate::subscription::locks::UserLocks;
use crate::subscription::machine::{
    renewal_due, revocation_due, transition, ConfirmedPayment, FailedPayment, LifecycleEvent, Outcome,
    RenewalAttempt, RenewalOutcome,
};
use crate::subscription::policy::{Clock, LifecyclePolicy, SystemClock};
use crate::subscription::pricing::{self, Quote};

/// Revision conflicts come from other processes; re-reading is enough to resolve them.
const MAX_COMMIT_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// The provider captured the payment right away
    Activated(UserSubscriptionRecord),
    /// The user has to finish paying at `payment_url`
    AwaitingPayment {
        order_ref: String,
        payment_id: Option<String>,
        payment_url: String,
    },
    Declined {
        order_ref: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Applied(UserSubscriptionRecord),
    Duplicate(UserSubscriptionRecord),
    Ignored(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { active_until: Option<DateTime<Utc>> },
    /// Nothing to cancel; informational, not an error
    NotActive,
}

impl CancelOutcome {
    pub fn message(&self) -> String {
        match self {
            CancelOutcome::Cancelled {
                active_until: Some(end),
            } => format!("Auto-renewal cancelled. Access stays until {}.", end.format("%Y-%m-%d")),
            CancelOutcome::Cancelled { active_until: None } => "Auto-renewal cancelled.".to_string(),
            CancelOutcome::NotActive => "Auto-renewal is not active, nothing to cancel.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalResult {
    Renewed { end_date: DateTime<Utc> },
    Failed { attempts: u32 },
    /// Last allowed attempt failed; auto-renewal is now off
    Disabled,
    Skipped,
}

/// Read-only view for the status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub user_id: i64,
    pub active: bool,
    pub end_date: Option<DateTime<Utc>>,
    pub days_left: i64,
    pub auto_renewal: bool,
    pub tariff: Option<String>,
    pub payments: usize,
}

impl SubscriptionStatus {
    pub fn render(&self) -> String {
        if !self.active {
            return match self.end_date {
                Some(end) => format!(
                    "No active subscription. The last one ended on {}. Use /subscribe to renew.",
                    end.format("%Y-%m-%d")
                ),
                None => "No active subscription. Use /subscribe to get access.".to_string(),
            };
        }
        let end = self
            .end_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        format!(
            "Subscription: {}\nActive until: {} ({} days left)\nAuto-renewal: {}\nPayments: {}",
            self.tariff.as_deref().unwrap_or("-"),
            end,
            self.days_left,
            if self.auto_renewal { "on" } else { "off" },
            self.payments
        )
    }
}

/// One line of the administrators' price list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceListEntry {
    pub tariff: Tariff,
    pub regular_minor: i64,
    pub returning_minor: i64,
    pub overridden: bool,
}

struct Committed {
    outcome: Outcome,
    record: UserSubscriptionRecord,
    effects: Vec<SideEffect>,
}

pub struct SubscriptionService {
    users: UserRecordStore,
    intents: IntentStore,
    prices: PriceStore,
    admins: Vec<i64>,
    provider: Arc<dyn PaymentProvider>,
    tariffs: TariffCatalog,
    notifier: Arc<dyn Notifier>,
    membership: Arc<dyn GroupMembership>,
    clock: Arc<dyn Clock>,
    policy: LifecyclePolicy,
    locks: UserLocks,
}

impl SubscriptionService {
    pub fn new(
        pool: DbPool,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        membership: Arc<dyn GroupMembership>,
    ) -> Self {
        Self {
            users: UserRecordStore::new(pool.clone()),
            intents: IntentStore::new(pool.clone()),
            prices: PriceStore::new(pool),
            admins: Vec::new(),
            provider,
            tariffs: TariffCatalog::default(),
            notifier,
            membership,
            clock: Arc::new(SystemClock),
            policy: LifecyclePolicy::default(),
            locks: UserLocks::new(),
        }
    }

    pub fn with_tariffs(mut self, tariffs: TariffCatalog) -> Self {
        self.tariffs = tariffs;
        self
    }

    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Telegram user ids allowed to change prices.
    pub fn with_admins(mut self, admins: Vec<i64>) -> Self {
        self.admins = admins;
        self
    }

    pub fn users(&self) -> &UserRecordStore {
        &self.users
    }

    pub fn intents(&self) -> &IntentStore {
        &self.intents
    }

    pub fn tariffs(&self) -> &TariffCatalog {
        &self.tariffs
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn supports_manual_completion(&self) -> bool {
        self.provider.supports_manual_completion()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// First contact: makes sure the user has a record.
    pub fn start(&self, user_id: i64) -> ServiceResult<UserSubscriptionRecord> {
        Ok(self.users.ensure(user_id, self.clock.now())?)
    }

    /// Recurring plan: the first charge tries to save a reusable method.
    pub async fn subscribe(&self, user_id: i64, tariff_id: Option<&str>) -> ServiceResult<CheckoutOutcome> {
        self.checkout(user_id, tariff_id, PaymentKind::Subscription).await
    }

    /// One period, no auto-renewal.
    pub async fn purchase(&self, user_id: i64, tariff_id: Option<&str>) -> ServiceResult<CheckoutOutcome> {
        self.checkout(user_id, tariff_id, PaymentKind::OneTime).await
    }

    async fn checkout(&self, user_id: i64, tariff_id: Option<&str>, kind: PaymentKind) -> ServiceResult<CheckoutOutcome> {
        let tariff = self.resolve_tariff(tariff_id)?;
        let now = self.clock.now();
        let record = self.users.ensure(user_id, now)?;
        let quote = self.quote_for(&record, &tariff)?;

        let intent = PaymentIntent {
            order_ref: new_order_ref("ord"),
            user_id,
            tariff: tariff.id.clone(),
            amount_minor: quote.amount_minor,
            currency: tariff.currency.clone(),
            kind,
            provider_payment_id: None,
            status: IntentStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.intents.create(&intent)?;
        let request = payment_request(&intent, &tariff);

        let called = match kind {
            PaymentKind::Subscription => {
                let interval = BillingInterval {
                    days: tariff.period_days,
                };
                self.call_provider(self.provider.create_subscription_intent(&request, interval))
                    .await
            }
            _ => self.call_provider(self.provider.create_one_time_payment(&request)).await,
        };
        let result = match called {
            Ok(result) => result,
            Err(e) => {
                log::error!("Provider {} failed to create payment for user {}: {}", self.provider.name(), user_id, e);
                self.intents.mark(&intent.order_ref, IntentStatus::Failed, self.clock.now())?;
                return Err(e.into());
            }
        };

        if let Some(payment_id) = &result.payment_id {
            self.intents
                .set_provider_payment_id(&intent.order_ref, payment_id, self.clock.now())?;
        }

        if !result.success {
            let reason = result.error.unwrap_or_else(|| "declined by provider".to_string());
            log::info!("Payment {} for user {} declined: {}", intent.order_ref, user_id, reason);
            let event = LifecycleEvent::PaymentFailed(FailedPayment {
                order_ref: Some(intent.order_ref.clone()),
                charge_id: None,
                amount_minor: intent.amount_minor,
                currency: intent.currency.clone(),
                tariff: Some(intent.tariff.clone()),
                kind,
                reason: reason.clone(),
                cancelled: false,
                timestamp: self.clock.now(),
            });
            self.apply(user_id, event, Some((intent.order_ref.as_str(), IntentStatus::Failed)))
                .await?;
            return Ok(CheckoutOutcome::Declined {
                order_ref: intent.order_ref,
                reason,
            });
        }

        if result.is_captured() {
            let charge_id = result
                .charge_id
                .clone()
                .or_else(|| result.payment_id.clone())
                .unwrap_or_else(|| intent.order_ref.clone());
            let recurring = kind == PaymentKind::Subscription && result.payment_method_ref.is_some();
            let event = LifecycleEvent::PaymentConfirmed(ConfirmedPayment {
                order_ref: Some(intent.order_ref.clone()),
                charge_id,
                amount_minor: intent.amount_minor,
                currency: intent.currency.clone(),
                tariff: tariff.id.clone(),
                period: tariff.period(),
                kind,
                payment_method_ref: result.payment_method_ref,
                provider_subscription_id: if recurring { result.payment_id } else { None },
                timestamp: self.clock.now(),
            });
            let committed = self
                .apply(user_id, event, Some((intent.order_ref.as_str(), IntentStatus::Completed)))
                .await?;
            return Ok(CheckoutOutcome::Activated(committed.record));
        }

        match result.payment_url {
            Some(payment_url) => Ok(CheckoutOutcome::AwaitingPayment {
                order_ref: intent.order_ref,
                payment_id: result.payment_id,
                payment_url,
            }),
            None => {
                self.intents.mark(&intent.order_ref, IntentStatus::Failed, self.clock.now())?;
                Err(ProviderError::InvalidPayload("provider returned neither a capture nor a payment link".into()).into())
            }
        }
    }

    /// Verifies, parses and applies a raw provider webhook.
    pub async fn handle_webhook(&self, raw_payload: &[u8], signature: Option<&str>) -> Result<InboundOutcome, WebhookError> {
        if !self.provider.verify_inbound_event(raw_payload, signature) {
            log::warn!("Rejected unverifiable {} webhook ({} bytes)", self.provider.name(), raw_payload.len());
            metrics::record_webhook("rejected");
            return Err(WebhookError::Authenticity);
        }

        let inbound = self.provider.parse_inbound_event(raw_payload).map_err(|e| {
            metrics::record_webhook("malformed");
            WebhookError::Malformed(e.to_string())
        })?;

        match self.apply_inbound(inbound).await {
            Ok(outcome) => {
                metrics::record_webhook(match outcome {
                    InboundOutcome::Applied(_) => "applied",
                    InboundOutcome::Duplicate(_) => "duplicate",
                    InboundOutcome::Ignored(_) => "ignored",
                });
                Ok(outcome)
            }
            Err(e) => {
                let err = WebhookError::from(e);
                log::warn!("Webhook not applied: {}", err);
                metrics::record_webhook("error");
                Err(err)
            }
        }
    }

    /// Applies a normalized provider event, matching it to its user through the
    /// intent. Structured metadata is used only when no intent is known, and
    /// must agree with the intent when both exist.
    pub async fn apply_inbound(&self, inbound: InboundPayment) -> ServiceResult<InboundOutcome> {
        let mut intent = match inbound.order_ref.as_deref() {
            Some(order_ref) => self.intents.get(order_ref)?,
            None => None,
        };
        if intent.is_none() {
            if let Some(payment_id) = inbound.provider_payment_id.as_deref() {
                intent = self.intents.find_by_provider_id(payment_id)?;
            }
        }

        let user_id = match (&intent, inbound.user_id) {
            (Some(intent), Some(event_user)) if intent.user_id != event_user => {
                return Err(TransitionError::OrderUserMismatch {
                    order_ref: intent.order_ref.clone(),
                    intent_user: intent.user_id,
                    event_user,
                }
                .into());
            }
            (Some(intent), _) => intent.user_id,
            (None, Some(user_id)) => user_id,
            (None, None) => {
                return Err(match inbound.order_ref {
                    Some(order_ref) => TransitionError::UnknownOrder(order_ref),
                    None => TransitionError::MissingMetadata("order reference or user id"),
                }
                .into());
            }
        };

        let tariff_id = intent
            .as_ref()
            .map(|i| i.tariff.clone())
            .or_else(|| inbound.tariff.clone());
        let tariff = self.resolve_tariff(tariff_id.as_deref())?;
        let kind = match &intent {
            Some(intent) => intent.kind,
            None if inbound.payment_method_ref.is_some() => PaymentKind::Subscription,
            None => PaymentKind::OneTime,
        };
        let amount_minor = inbound
            .amount_minor
            .or_else(|| intent.as_ref().map(|i| i.amount_minor))
            .unwrap_or(tariff.price_minor);
        let currency = inbound
            .currency
            .clone()
            .or_else(|| intent.as_ref().map(|i| i.currency.clone()))
            .unwrap_or_else(|| tariff.currency.clone());
        if let Some(intent) = &intent {
            if intent.amount_minor != amount_minor {
                log::warn!(
                    "Order {} paid {} {} but intent expected {} {}",
                    intent.order_ref,
                    amount_minor,
                    currency,
                    intent.amount_minor,
                    intent.currency
                );
            }
        }
        let order_ref = intent
            .as_ref()
            .map(|i| i.order_ref.clone())
            .or_else(|| inbound.order_ref.clone());
        let now = self.clock.now();

        let (event, intent_status) = match inbound.status {
            ProviderPaymentStatus::Pending => {
                log::info!("Payment {:?} for user {} still pending, nothing to apply", order_ref, user_id);
                return Ok(InboundOutcome::Ignored("payment still pending"));
            }
            ProviderPaymentStatus::Succeeded => {
                let charge_id = inbound
                    .charge_id
                    .clone()
                    .or_else(|| inbound.provider_payment_id.clone())
                    .or_else(|| order_ref.clone())
                    .ok_or(TransitionError::MissingMetadata("charge id"))?;
                let recurring = kind == PaymentKind::Subscription && inbound.payment_method_ref.is_some();
                let event = LifecycleEvent::PaymentConfirmed(ConfirmedPayment {
                    order_ref: order_ref.clone(),
                    charge_id,
                    amount_minor,
                    currency,
                    tariff: tariff.id.clone(),
                    period: tariff.period(),
                    kind,
                    payment_method_ref: inbound.payment_method_ref,
                    provider_subscription_id: if recurring { inbound.provider_payment_id } else { None },
                    timestamp: now,
                });
                (event, IntentStatus::Completed)
            }
            status @ (ProviderPaymentStatus::Failed | ProviderPaymentStatus::Cancelled) => {
                let cancelled = status == ProviderPaymentStatus::Cancelled;
                let reason = inbound.reason.unwrap_or_else(|| {
                    if cancelled {
                        "payment cancelled".to_string()
                    } else {
                        "payment failed".to_string()
                    }
                });
                let event = LifecycleEvent::PaymentFailed(FailedPayment {
                    order_ref: order_ref.clone(),
                    charge_id: inbound.charge_id.or(inbound.provider_payment_id),
                    amount_minor,
                    currency,
                    tariff: Some(tariff.id.clone()),
                    kind,
                    reason,
                    cancelled,
                    timestamp: now,
                });
                let status = if cancelled {
                    IntentStatus::Cancelled
                } else {
                    IntentStatus::Failed
                };
                (event, status)
            }
        };

        let intent_update = order_ref.as_deref().map(|o| (o, intent_status));
        let committed = self.apply(user_id, event, intent_update).await?;
        Ok(match committed.outcome {
            Outcome::Applied => InboundOutcome::Applied(committed.record),
            Outcome::Duplicate => InboundOutcome::Duplicate(committed.record),
            Outcome::Skipped(reason) => InboundOutcome::Ignored(reason),
        })
    }

    /// Demo-mode completion of a pending payment by its payer.
    pub async fn complete_manual_payment(&self, user_id: i64, payment_id: &str) -> ServiceResult<InboundOutcome> {
        if !self.provider.supports_manual_completion() {
            return Err(ServiceError::ManualCompletionUnsupported);
        }
        let intent = self
            .intents
            .find_by_provider_id(payment_id)?
            .ok_or_else(|| TransitionError::UnknownOrder(payment_id.to_string()))?;
        if intent.user_id != user_id {
            return Err(TransitionError::OrderUserMismatch {
                order_ref: intent.order_ref,
                intent_user: intent.user_id,
                event_user: user_id,
            }
            .into());
        }
        if intent.status == IntentStatus::Completed {
            log::info!("Payment {} of user {} is already completed", payment_id, user_id);
            let record = self.users.ensure(user_id, self.clock.now())?;
            return Ok(InboundOutcome::Duplicate(record));
        }

        let inbound = self
            .call_provider(self.provider.complete_manual_payment(payment_id))
            .await?;
        self.apply_inbound(inbound).await
    }

    pub async fn cancel_auto_renewal(&self, user_id: i64) -> ServiceResult<CancelOutcome> {
        let guard = self.lock(user_id).await?;
        let now = self.clock.now();
        let record = self.users.ensure(user_id, now)?;

        if !record.auto_renewal && record.payment_method_ref.is_none() && record.provider_subscription_id.is_none() {
            log::info!("User {} asked to cancel auto-renewal, but it is not active", user_id);
            return Ok(CancelOutcome::NotActive);
        }

        if let Some(subscription_id) = &record.provider_subscription_id {
            let result = self
                .call_provider(self.provider.cancel_subscription(subscription_id, Some("requested by user")))
                .await?;
            if !result.success {
                let reason = result.error.unwrap_or_else(|| "no reason given".to_string());
                log::warn!("Provider refused to cancel {} for user {}: {}", subscription_id, user_id, reason);
                return Err(ServiceError::CancelRejected(reason));
            }
        }

        let mut committed = self.commit_transition(user_id, &LifecycleEvent::AutoRenewalCancelled, now)?;
        drop(guard);
        log::info!("User {}: auto_renewal_cancelled -> {:?}", user_id, committed.outcome);
        self.run_effects(std::mem::take(&mut committed.effects)).await;

        Ok(match committed.outcome {
            Outcome::Applied => CancelOutcome::Cancelled {
                active_until: record.subscription_end_date.filter(|_| record.subscription_active),
            },
            _ => CancelOutcome::NotActive,
        })
    }

    /// Does not create a record for unknown users.
    pub fn status(&self, user_id: i64) -> ServiceResult<SubscriptionStatus> {
        let now = self.clock.now();
        let status = match self.users.get(user_id)? {
            Some(record) => SubscriptionStatus {
                user_id,
                active: record.subscription_active,
                end_date: record.subscription_end_date,
                days_left: if record.subscription_active { record.days_left(now) } else { 0 },
                auto_renewal: record.auto_renewal,
                tariff: record.tariff.clone(),
                payments: record.payment_history.len(),
            },
            None => SubscriptionStatus {
                user_id,
                active: false,
                end_date: None,
                days_left: 0,
                auto_renewal: false,
                tariff: None,
                payments: 0,
            },
        };
        Ok(status)
    }

    /// Most recent first.
    pub fn history(&self, user_id: i64, limit: usize) -> ServiceResult<Vec<PaymentEvent>> {
        Ok(self
            .users
            .get(user_id)?
            .map(|record| record.payment_history.into_iter().rev().take(limit).collect())
            .unwrap_or_default())
    }

    /// Whether a pre-checkout for `order_ref` matches an open intent of this user.
    pub fn validate_invoice(&self, order_ref: &str, user_id: i64, amount_minor: i64, currency: &str) -> ServiceResult<bool> {
        let Some(intent) = self.intents.get(order_ref)? else {
            return Ok(false);
        };
        Ok(intent.user_id == user_id
            && intent.status.is_open()
            && intent.amount_minor == amount_minor
            && intent.currency.eq_ignore_ascii_case(currency))
    }

    /// What `user_id` would pay for `tariff_id` right now.
    pub fn quote(&self, user_id: i64, tariff_id: Option<&str>) -> ServiceResult<Quote> {
        let tariff = self.resolve_tariff(tariff_id)?;
        let record = self.users.get(user_id)?;
        self.quote_with(user_id, record.as_ref(), &tariff)
    }

    fn quote_for(&self, record: &UserSubscriptionRecord, tariff: &Tariff) -> ServiceResult<Quote> {
        self.quote_with(record.user_id, Some(record), tariff)
    }

    fn quote_with(&self, user_id: i64, record: Option<&UserSubscriptionRecord>, tariff: &Tariff) -> ServiceResult<Quote> {
        let tariff_price = self.prices.tariff_price(&tariff.id)?;
        let personal = self.prices.user_price(user_id)?;
        let quote = pricing::quote(tariff, tariff_price.as_ref(), personal, pricing::is_returning(record));
        if quote.amount_minor != tariff.price_minor {
            log::debug!(
                "User {} pays {} for {} ({})",
                user_id,
                quote.amount_minor,
                tariff.id,
                <&'static str>::from(quote.source)
            );
        }
        Ok(quote)
    }

    fn require_admin(&self, admin_id: i64) -> ServiceResult<()> {
        if self.is_admin(admin_id) {
            return Ok(());
        }
        log::warn!("User {} tried to change prices without admin rights", admin_id);
        Err(ServiceError::NotAdmin(admin_id))
    }

    /// Overrides a tariff's price. Without `returning_minor` returning
    /// customers pay the regular price.
    pub fn set_tariff_price(
        &self,
        admin_id: i64,
        tariff_id: &str,
        regular_minor: i64,
        returning_minor: Option<i64>,
    ) -> ServiceResult<TariffPrice> {
        self.require_admin(admin_id)?;
        let tariff = self.resolve_tariff(Some(tariff_id))?;
        let returning_minor = returning_minor.unwrap_or(regular_minor);
        if regular_minor <= 0 || returning_minor <= 0 {
            return Err(ServiceError::InvalidPrice("prices must be positive".to_string()));
        }

        let price = TariffPrice {
            tariff: tariff.id,
            regular_minor,
            returning_minor,
            updated_by: admin_id,
            updated_at: self.clock.now(),
        };
        self.prices.set_tariff_price(&price)?;
        Ok(price)
    }

    /// Personal price for `user_id` on every tariff; `None` removes it.
    pub fn set_user_price(&self, admin_id: i64, user_id: i64, price_minor: Option<i64>) -> ServiceResult<()> {
        self.require_admin(admin_id)?;
        if price_minor.is_some_and(|p| p <= 0) {
            return Err(ServiceError::InvalidPrice("price must be positive".to_string()));
        }
        self.prices.set_user_price(user_id, price_minor, admin_id, self.clock.now())?;
        Ok(())
    }

    /// Current regular and returning price of every tariff.
    pub fn price_list(&self, admin_id: i64) -> ServiceResult<Vec<PriceListEntry>> {
        self.require_admin(admin_id)?;
        self.tariffs
            .all()
            .iter()
            .map(|tariff| -> ServiceResult<PriceListEntry> {
                let entry = match self.prices.tariff_price(&tariff.id)? {
                    Some(price) => PriceListEntry {
                        tariff: tariff.clone(),
                        regular_minor: price.regular_minor,
                        returning_minor: price.returning_minor,
                        overridden: true,
                    },
                    None => PriceListEntry {
                        tariff: tariff.clone(),
                        regular_minor: tariff.price_minor,
                        returning_minor: tariff.price_minor,
                        overridden: false,
                    },
                };
                Ok(entry)
            })
            .collect()
    }

    /// One unattended charge of the stored method. The user's lock is held
    /// across the charge so that concurrent attempts extend the period once.
    pub async fn renew(&self, user_id: i64) -> ServiceResult<RenewalResult> {
        let guard = self.lock(user_id).await?;
        let now = self.clock.now();
        let Some(record) = self.users.get(user_id)? else {
            return Ok(RenewalResult::Skipped);
        };
        if !renewal_due(&record, &self.policy, now) {
            log::debug!("Renewal for user {} not due", user_id);
            return Ok(RenewalResult::Skipped);
        }
        let Some(method) = record.payment_method_ref.clone() else {
            return Ok(RenewalResult::Skipped);
        };
        let tariff = match self.tariffs.resolve(record.tariff.as_deref()) {
            Some(tariff) => tariff.clone(),
            None => self.resolve_tariff(None)?,
        };

        let quote = self.quote_for(&record, &tariff)?;

        let intent = PaymentIntent {
            order_ref: new_order_ref("ren"),
            user_id,
            tariff: tariff.id.clone(),
            amount_minor: quote.amount_minor,
            currency: tariff.currency.clone(),
            kind: PaymentKind::Renewal,
            provider_payment_id: None,
            status: IntentStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.intents.create(&intent)?;
        let request = payment_request(&intent, &tariff);

        let outcome = match self.call_provider(self.provider.charge_stored_method(&method, &request)).await {
            Ok(result) => {
                if let Some(payment_id) = &result.payment_id {
                    self.intents
                        .set_provider_payment_id(&intent.order_ref, payment_id, self.clock.now())?;
                }
                if result.is_captured() {
                    RenewalOutcome::Charged {
                        charge_id: result
                            .charge_id
                            .or(result.payment_id)
                            .unwrap_or_else(|| intent.order_ref.clone()),
                    }
                } else {
                    RenewalOutcome::Failed {
                        reason: result.error.unwrap_or_else(|| "charge was not captured".to_string()),
                        charge_id: result.charge_id.or(result.payment_id),
                    }
                }
            }
            Err(e) => {
                if matches!(e, ProviderError::Timeout(_)) {
                    metrics::record_renewal("timeout");
                }
                log::warn!("Renewal charge for user {} failed: {}", user_id, e);
                RenewalOutcome::Failed {
                    reason: e.to_string(),
                    charge_id: None,
                }
            }
        };
        let charged = matches!(outcome, RenewalOutcome::Charged { .. });

        let event = LifecycleEvent::RenewalAttempted(RenewalAttempt {
            outcome,
            order_ref: Some(intent.order_ref.clone()),
            amount_minor: intent.amount_minor,
            currency: tariff.currency.clone(),
            tariff: tariff.id.clone(),
            period: tariff.period(),
        });
        let now = self.clock.now();
        let mut committed = match self.commit_transition(user_id, &event, now) {
            Ok(committed) => committed,
            Err(e) => {
                if charged {
                    log::error!(
                        "User {} was charged for order {} but the renewal could not be stored: {}",
                        user_id,
                        intent.order_ref,
                        e
                    );
                }
                return Err(e);
            }
        };
        let intent_status = if charged {
            IntentStatus::Completed
        } else {
            IntentStatus::Failed
        };
        self.intents.mark(&intent.order_ref, intent_status, now)?;
        drop(guard);

        let result = match (&committed.outcome, charged) {
            (Outcome::Applied, true) => match committed.record.subscription_end_date {
                Some(end_date) => RenewalResult::Renewed { end_date },
                None => RenewalResult::Skipped,
            },
            (Outcome::Applied, false) if !committed.record.auto_renewal => RenewalResult::Disabled,
            (Outcome::Applied, false) => RenewalResult::Failed {
                attempts: committed.record.billing_attempts,
            },
            _ => RenewalResult::Skipped,
        };
        match result {
            RenewalResult::Renewed { .. } => {
                metrics::record_renewal("renewed");
                metrics::record_payment("completed", &tariff.id);
                metrics::record_revenue(&tariff.currency, intent.amount_minor);
            }
            RenewalResult::Failed { .. } => metrics::record_renewal("failed"),
            RenewalResult::Disabled => metrics::record_renewal("disabled"),
            RenewalResult::Skipped => {}
        }
        log::info!("User {}: renewal_attempted -> {:?}", user_id, result);

        self.run_effects(std::mem::take(&mut committed.effects)).await;
        Ok(result)
    }

    /// Active -> Lapsed once the end date passed with nothing to renew it.
    pub async fn expire(&self, user_id: i64) -> ServiceResult<bool> {
        let committed = self.apply(user_id, LifecycleEvent::Expired, None).await?;
        Ok(committed.outcome == Outcome::Applied)
    }

    /// Removes a lapsed user from the group, then records it. Nothing is
    /// recorded if the removal fails.
    pub async fn revoke_access(&self, user_id: i64) -> ServiceResult<bool> {
        let _guard = self.lock(user_id).await?;
        let now = self.clock.now();
        let Some(record) = self.users.get(user_id)? else {
            return Ok(false);
        };
        if !revocation_due(&record, &self.policy, now) {
            return Ok(false);
        }

        if let Err(e) = self.membership.revoke(user_id).await {
            metrics::record_revocation("failed");
            return Err(e.into());
        }
        metrics::record_revocation("revoked");

        let committed = self.commit_transition(user_id, &LifecycleEvent::AccessRevoked, now)?;
        log::info!("User {}: access_revoked -> {:?}", user_id, committed.outcome);
        Ok(committed.outcome == Outcome::Applied)
    }

    pub fn renewal_candidates(&self) -> ServiceResult<Vec<i64>> {
        let today = self.clock.now().date_naive();
        Ok(self
            .users
            .find_due_for_renewal(today, self.policy.max_billing_attempts)?)
    }

    pub fn expiry_candidates(&self) -> ServiceResult<Vec<i64>> {
        Ok(self.users.find_expired_unrenewed(self.clock.now())?)
    }

    pub fn revocation_candidates(&self) -> ServiceResult<Vec<i64>> {
        Ok(self
            .users
            .find_lapsed_beyond(self.clock.now(), self.policy.grace_period_days)?)
    }

    /// Marks intents that never got an answer as expired.
    pub fn expire_stale_intents(&self) -> ServiceResult<usize> {
        let now = self.clock.now();
        let expired = self.intents.expire_stale(now - self.policy.intent_ttl, now)?;
        if expired > 0 {
            log::info!("Expired {} stale payment intents", expired);
        }
        Ok(expired)
    }

    fn resolve_tariff(&self, tariff_id: Option<&str>) -> ServiceResult<Tariff> {
        self.tariffs
            .resolve(tariff_id)
            .cloned()
            .ok_or_else(|| TransitionError::UnknownTariff(tariff_id.unwrap_or_default().to_string()).into())
    }

    async fn lock(&self, user_id: i64) -> ServiceResult<OwnedMutexGuard<()>> {
        self.locks
            .acquire(user_id, self.policy.user_lock_timeout)
            .await
            .ok_or(ServiceError::Busy(user_id))
    }

    async fn call_provider<T, F>(&self, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.policy.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.policy.provider_timeout)),
        }
    }

    async fn run_effects(&self, effects: Vec<SideEffect>) {
        if effects.is_empty() {
            return;
        }
        execute_effects(self.notifier.as_ref(), self.membership.as_ref(), effects).await;
    }

    /// Lock, transition, commit, update the intent, unlock, run effects.
    async fn apply(
        &self,
        user_id: i64,
        event: LifecycleEvent,
        intent_update: Option<(&str, IntentStatus)>,
    ) -> ServiceResult<Committed> {
        let guard = self.lock(user_id).await?;
        let now = self.clock.now();
        let mut committed = self.commit_transition(user_id, &event, now)?;

        if !matches!(committed.outcome, Outcome::Skipped(_)) {
            if let Some((order_ref, status)) = intent_update {
                self.intents.mark(order_ref, status, now)?;
            }
        }
        drop(guard);

        log::info!("User {}: {} -> {:?}", user_id, event.name(), committed.outcome);
        record_payment_metrics(&event, &committed.outcome);
        self.run_effects(std::mem::take(&mut committed.effects)).await;
        Ok(committed)
    }

    /// Re-reads the record, runs the transition and commits it with a revision
    /// check. Callers hold the user's lock.
    fn commit_transition(&self, user_id: i64, event: &LifecycleEvent, now: DateTime<Utc>) -> ServiceResult<Committed> {
        let mut retries = 0;
        loop {
            let record = self.users.ensure(user_id, now)?;
            let decision = transition(&record, event.clone(), &self.policy, now);
            if !decision.is_applied() {
                if let Outcome::Skipped(reason) = decision.outcome {
                    log::debug!("User {}: {} skipped ({})", user_id, event.name(), reason);
                }
                return Ok(Committed {
                    outcome: decision.outcome,
                    record,
                    effects: Vec::new(),
                });
            }

            match self.users.commit(
                user_id,
                &decision.patch,
                decision.append.as_ref(),
                Some(record.revision),
                now,
            ) {
                Ok(CommitOutcome::Applied(record)) => {
                    return Ok(Committed {
                        outcome: Outcome::Applied,
                        record,
                        effects: decision.effects,
                    });
                }
                Ok(CommitOutcome::Duplicate(record)) => {
                    return Ok(Committed {
                        outcome: Outcome::Duplicate,
                        record,
                        effects: Vec::new(),
                    });
                }
                Err(StoreError::Conflict(_)) if retries < MAX_COMMIT_RETRIES => {
                    retries += 1;
                    log::info!("User {}: revision conflict on {}, retry {}", user_id, event.name(), retries);
                }
                Err(e) => {
                    log::error!("User {}: failed to commit {}: {}", user_id, event.name(), e);
                    return Err(e.into());
                }
            }
        }
    }
}

fn record_payment_metrics(event: &LifecycleEvent, outcome: &Outcome) {
    match (event, outcome) {
        (LifecycleEvent::PaymentConfirmed(payment), Outcome::Applied) => {
            metrics::record_payment("completed", &payment.tariff);
            metrics::record_revenue(&payment.currency, payment.amount_minor);
        }
        (LifecycleEvent::PaymentConfirmed(payment), Outcome::Duplicate) => {
            metrics::record_payment("duplicate", &payment.tariff);
        }
        (LifecycleEvent::PaymentFailed(payment), Outcome::Applied) => {
            let outcome = if payment.cancelled { "cancelled" } else { "failed" };
            metrics::record_payment(outcome, payment.tariff.as_deref().unwrap_or("unknown"));
        }
        _ => {}
    }
}

fn new_order_ref(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

fn payment_request(intent: &PaymentIntent, tariff: &Tariff) -> PaymentRequest {
    PaymentRequest {
        user_id: intent.user_id,
        amount_minor: intent.amount_minor,
        currency: intent.currency.clone(),
        description: tariff.description(),
        metadata: PaymentMetadata {
            order_ref: intent.order_ref.clone(),
            user_id: intent.user_id,
            tariff: tariff.id.clone(),
        },
    }
}
