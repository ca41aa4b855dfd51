//! Shared harness for the integration tests
//!
//! Builds a `SubscriptionService` over an in-memory database with a fixed
//! clock, a scripted provider and recording collaborators.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use subgate::payments::signature::sign_hex;
use subgate::storage::{create_memory_pool, SubscriptionPatch, UserSubscriptionRecord};
use subgate::subscription::testing::{
    FixedClock, RecordingMembership, RecordingNotifier, ScriptedProvider, TEST_WEBHOOK_SECRET,
};
use subgate::subscription::{LifecyclePolicy, SubscriptionService};

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
}

pub struct Harness {
    pub service: Arc<SubscriptionService>,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub membership: Arc<RecordingMembership>,
    pub provider: Arc<ScriptedProvider>,
}

impl Harness {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_policy(now, LifecyclePolicy::default())
    }

    pub fn with_policy(now: DateTime<Utc>, policy: LifecyclePolicy) -> Self {
        let clock = Arc::new(FixedClock::new(now));
        let notifier = Arc::new(RecordingNotifier::default());
        let membership = Arc::new(RecordingMembership::default());
        let provider = Arc::new(ScriptedProvider::new());

        let service = SubscriptionService::new(
            create_memory_pool().unwrap(),
            provider.clone(),
            notifier.clone(),
            membership.clone(),
        )
        .with_clock(clock.clone())
        .with_policy(policy);

        Self {
            service: Arc::new(service),
            clock,
            notifier,
            membership,
            provider,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.service.now()
    }

    pub fn seed(&self, user_id: i64, patch: SubscriptionPatch) -> UserSubscriptionRecord {
        self.service.users().upsert(user_id, &patch, self.now()).unwrap()
    }

    /// Active subscriber ending at `end`, auto-renewing when `method` is set.
    pub fn seed_active(&self, user_id: i64, end: DateTime<Utc>, method: Option<&str>) -> UserSubscriptionRecord {
        let patch = SubscriptionPatch {
            subscription_active: Some(true),
            subscription_end_date: Some(Some(end)),
            tariff: Some(Some("basic".to_string())),
            ..Default::default()
        };
        let patch = match method {
            Some(method) => patch.enable_auto_renewal(method.to_string()),
            None => patch,
        };
        self.seed(user_id, patch)
    }

    /// Former subscriber whose period ended at `end` and who is still in the group.
    pub fn seed_lapsed(&self, user_id: i64, end: DateTime<Utc>) -> UserSubscriptionRecord {
        self.seed(
            user_id,
            SubscriptionPatch {
                subscription_active: Some(false),
                subscription_end_date: Some(Some(end)),
                ..Default::default()
            },
        )
    }

    pub fn record(&self, user_id: i64) -> UserSubscriptionRecord {
        self.service.users().get(user_id).unwrap().unwrap()
    }
}

/// Body plus the signature the scripted provider accepts.
pub fn signed(body: &Value) -> (Vec<u8>, String) {
    let raw = body.to_string().into_bytes();
    let signature = sign_hex(TEST_WEBHOOK_SECRET.as_bytes(), &raw);
    (raw, signature)
}
