use thiserror::Error;

use crate::payments::ProviderError;
use crate::storage::StoreError;
use crate::subscription::effects::CollaboratorError;

/// An event that cannot be applied as given. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("unknown tariff '{0}'")]
    UnknownTariff(String),

    #[error("no payment intent for order {0}")]
    UnknownOrder(String),

    #[error("order {order_ref} belongs to user {intent_user}, event names user {event_user}")]
    OrderUserMismatch {
        order_ref: String,
        intent_user: i64,
        event_user: i64,
    },

    #[error("event carries no usable {0}")]
    MissingMetadata(&'static str),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("payment provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("group membership error: {0}")]
    Membership(#[from] CollaboratorError),

    #[error("user {0} is busy, lock wait exceeded")]
    Busy(i64),

    #[error("the payment provider does not support manual completion")]
    ManualCompletionUnsupported,

    #[error("provider refused to cancel the subscription: {0}")]
    CancelRejected(String),

    #[error("user {0} is not an administrator")]
    NotAdmin(i64),

    #[error("invalid price: {0}")]
    InvalidPrice(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Failures that may succeed if the same request is repeated later.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Store(e) => e.is_retryable(),
            ServiceError::Provider(e) => e.is_transient(),
            ServiceError::Busy(_) | ServiceError::Membership(_) => true,
            _ => false,
        }
    }

    /// Text safe to show the user. Internal details stay in the log.
    pub fn user_message(&self) -> String {
        match self {
            ServiceError::Transition(TransitionError::UnknownTariff(id)) => {
                format!("There is no tariff called '{}'. See /help for the list.", id)
            }
            ServiceError::Transition(_) => "This payment could not be matched to your account.".to_string(),
            ServiceError::ManualCompletionUnsupported => {
                "Manual completion is only available in demo mode.".to_string()
            }
            ServiceError::CancelRejected(_) => {
                "The payment provider did not confirm the cancellation. Auto-renewal is still on, please try again later."
                    .to_string()
            }
            ServiceError::NotAdmin(_) => "This command is only available to administrators.".to_string(),
            ServiceError::InvalidPrice(reason) => format!("Price not changed: {}.", reason),
            ServiceError::Provider(ProviderError::Unsupported { .. }) => {
                "This action is not available with the current payment provider.".to_string()
            }
            _ => "Something went wrong on our side. Please try again in a few minutes.".to_string(),
        }
    }
}

/// Rejections of inbound payment webhooks, each with its HTTP status.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("webhook failed verification")]
    Authenticity,

    #[error("malformed webhook: {0}")]
    Malformed(String),

    #[error(transparent)]
    Logic(TransitionError),

    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl WebhookError {
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::Authenticity => 403,
            WebhookError::Malformed(_) => 400,
            WebhookError::Logic(_) => 422,
            WebhookError::Storage(_) => 503,
        }
    }
}

impl From<ServiceError> for WebhookError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Transition(e) => WebhookError::Logic(e),
            ServiceError::Provider(ProviderError::InvalidPayload(msg)) => WebhookError::Malformed(msg),
            other => WebhookError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_status_codes() {
        assert_eq!(WebhookError::Authenticity.status_code(), 403);
        assert_eq!(WebhookError::Malformed("x".into()).status_code(), 400);
        assert_eq!(
            WebhookError::from(ServiceError::Transition(TransitionError::UnknownOrder("ord_1".into()))).status_code(),
            422
        );
        assert_eq!(
            WebhookError::from(ServiceError::Store(StoreError::Unavailable("busy".into()))).status_code(),
            503
        );
    }

    #[test]
    fn test_transient_errors_get_retry_later_text() {
        let err = ServiceError::Busy(5);
        assert!(err.is_transient());
        assert!(err.user_message().contains("try again"));
        assert!(!ServiceError::ManualCompletionUnsupported.is_transient());
    }

    #[test]
    fn test_admin_errors_are_permanent() {
        assert!(!ServiceError::NotAdmin(7).is_transient());
        assert!(ServiceError::InvalidPrice("must be positive".into())
            .user_message()
            .contains("must be positive"));
    }
}
