//! HTTP endpoint for payment provider webhooks.
//!
//! - `POST /webhook/payment` - signed provider notification (`X-Signature` header)
//! - `GET /health` - liveness with uptime
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::Instant;

use crate::core::metrics;
use crate::subscription::{InboundOutcome, SubscriptionService};

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Clone)]
struct AppState {
    service: Arc<SubscriptionService>,
    start_time: Instant,
}

pub fn router(service: Arc<SubscriptionService>) -> Router {
    let state = AppState {
        service,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/webhook/payment", post(payment_webhook_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(state))
}

/// Binds `bind_addr` and serves the webhook router until the task is dropped.
pub async fn serve(service: Arc<SubscriptionService>, bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr.parse()?;
    let listener = TcpListener::bind(&addr).await?;

    log::info!("Starting webhook server on http://{}", addr);
    log::info!("  /webhook/payment - payment notifications");
    log::info!("  /health          - liveness");
    log::info!("  /metrics         - Prometheus metrics");

    axum::serve(listener, router(service)).await?;
    Ok(())
}

async fn payment_webhook_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state.service.handle_webhook(&body, signature).await {
        Ok(outcome) => {
            let (status, detail) = match &outcome {
                InboundOutcome::Applied(_) => ("applied", None),
                InboundOutcome::Duplicate(_) => ("duplicate", None),
                InboundOutcome::Ignored(reason) => ("ignored", Some(*reason)),
            };
            (StatusCode::OK, Json(json!({ "status": status, "detail": detail }))).into_response()
        }
        Err(e) => {
            let code = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (code, Json(json!({ "status": "rejected", "error": e.to_string() }))).into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_status = json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "provider": state.service.provider_name(),
        "service": "subgate",
        "version": env!("CARGO_PKG_VERSION"),
    });

    (StatusCode::OK, Json(health_status))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::signature::sign_hex;
    use crate::storage::create_memory_pool;
    use crate::subscription::testing::{RecordingMembership, RecordingNotifier, ScriptedProvider, TEST_WEBHOOK_SECRET};
    use crate::subscription::CheckoutOutcome;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn service() -> Arc<SubscriptionService> {
        Arc::new(SubscriptionService::new(
            create_memory_pool().unwrap(),
            Arc::new(ScriptedProvider::new()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingMembership::default()),
        ))
    }

    fn signed_request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook/payment")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_signed_webhook_activates_pending_order() {
        let service = service();
        let CheckoutOutcome::AwaitingPayment { order_ref, .. } = service.purchase(42, None).await.unwrap() else {
            panic!("expected a payment link");
        };

        let body = json!({
            "order_id": order_ref,
            "payment_id": "pay_1",
            "status": "succeeded",
            "amount": 40000,
            "currency": "RUB"
        })
        .to_string();
        let signature = sign_hex(TEST_WEBHOOK_SECRET.as_bytes(), body.as_bytes());

        let response = router(Arc::clone(&service))
            .oneshot(signed_request(&body, Some(signature.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "applied");
        assert!(service.status(42).unwrap().active);

        // Redelivery is acknowledged without a second history entry
        let response = router(Arc::clone(&service))
            .oneshot(signed_request(&body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "duplicate");
        assert_eq!(service.status(42).unwrap().payments, 1);
    }

    #[tokio::test]
    async fn test_bad_signature_is_forbidden_and_changes_nothing() {
        let service = service();
        let body = json!({"order_id": "ord_x", "status": "succeeded", "metadata": {"user_id": "42"}}).to_string();

        let response = router(Arc::clone(&service))
            .oneshot(signed_request(&body, Some("00".repeat(32))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = router(Arc::clone(&service))
            .oneshot(signed_request(&body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(service.users().get(42).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_order_is_unprocessable() {
        let body = json!({"order_id": "ord_missing", "status": "succeeded"}).to_string();
        let signature = sign_hex(TEST_WEBHOOK_SECRET.as_bytes(), body.as_bytes());

        let response = router(service()).oneshot(signed_request(&body, Some(signature))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let app = router(service());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health = body_json(response).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["provider"], "scripted");

        metrics::record_webhook("applied");
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("subgate_webhooks_total"));
    }
}
