//! Subscription lifecycle: state machine, engine, reminders and the sweeper

pub mod effects;
pub mod error;
pub mod locks;
pub mod machine;
pub mod policy;
pub mod pricing;
pub mod reminders;
pub mod service;
pub mod sweeper;
pub mod testing;

pub use effects::{CollaboratorError, DisableReason, GroupMembership, Notification, Notifier, SideEffect};
pub use error::{ServiceError, ServiceResult, TransitionError, WebhookError};
pub use machine::{lifecycle_state, transition, Decision, LifecycleEvent, LifecycleState, Outcome};
pub use policy::{Clock, LifecyclePolicy, SystemClock};
pub use pricing::{PriceSource, Quote};
pub use reminders::{ReminderReport, ReminderScheduler};
pub use service::{
    CancelOutcome, CheckoutOutcome, InboundOutcome, PriceListEntry, RenewalResult, SubscriptionService,
    SubscriptionStatus,
};
pub use sweeper::{start_scheduler, RenewalSweeper, SweepReport};
