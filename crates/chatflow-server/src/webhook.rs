//! Inbound event webhook - the gateway's event feed entry point

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use chatflow_core::events::signature;
use chatflow_core::GatewayEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Shared webhook state
#[derive(Clone)]
pub struct WebhookState {
    tx: mpsc::Sender<GatewayEvent>,
    secret: Option<String>,
}

impl WebhookState {
    pub fn new(tx: mpsc::Sender<GatewayEvent>, secret: Option<String>) -> Self {
        Self { tx, secret }
    }
}

/// Build the webhook router
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(receive_event))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn receive_event(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = &state.secret {
        let Some(provided) = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            warn!("Webhook payload without signature rejected");
            return StatusCode::UNAUTHORIZED;
        };
        if !signature::verify(secret, &body, provided) {
            warn!("Webhook payload with bad signature rejected");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let event: GatewayEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Undecodable webhook payload");
            return StatusCode::UNPROCESSABLE_ENTITY;
        }
    };

    debug!("Webhook event accepted");
    if state.tx.send(event).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn signed_headers(secret: &str, payload: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&signature::sign(secret, payload)).unwrap(),
        );
        headers
    }

    fn event_payload() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "type": "connection_state_changed",
            "account_id": uuid::Uuid::new_v4(),
            "state": "disconnected",
            "reason": "phone offline",
            "session_blob": null,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn valid_signature_enqueues_the_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let state = WebhookState::new(tx, Some("secret".to_string()));
        let payload = event_payload();

        let status = receive_event(
            State(state),
            signed_headers("secret", &payload),
            Bytes::from(payload),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::ConnectionStateChanged { .. })
        ));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (tx, mut rx) = mpsc::channel(4);
        let state = WebhookState::new(tx, Some("secret".to_string()));
        let payload = event_payload();

        let status = receive_event(
            State(state),
            signed_headers("wrong-secret", &payload),
            Bytes::from(payload),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn undecodable_payload_is_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let state = WebhookState::new(tx, None);

        let status = receive_event(
            State(state),
            HeaderMap::new(),
            Bytes::from_static(b"not json"),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
