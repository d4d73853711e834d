//! Webhook endpoints
//!
//! `GET /webhooks` answers the subscription handshake, `POST /webhooks`
//! takes deliveries. Once a delivery is authenticated it is always
//! acknowledged with 200; processing problems are logged so upstream does
//! not redeliver in a loop.

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::instagram::signature::SIGNATURE_HEADER;
use crate::instagram::webhook::WebhookPayload;
use crate::metrics::WEBHOOK_DELIVERIES_TOTAL;

pub fn webhook_router() -> Router<AppState> {
    Router::new().route("/webhooks", get(verify_subscription).post(receive_delivery))
}

#[derive(Debug, Deserialize)]
struct HubQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /webhooks
///
/// Echo `hub.challenge` when the verify token matches a configured one.
async fn verify_subscription(
    State(state): State<AppState>,
    Query(query): Query<HubQuery>,
) -> Response {
    let accepted = query.mode.as_deref() == Some("subscribe")
        && query.verify_token.as_deref().is_some_and(|token| {
            state
                .config
                .instagram
                .webhook_verify_tokens
                .iter()
                .any(|configured| !configured.is_empty() && configured == token)
        });

    match (accepted, query.challenge) {
        (true, Some(challenge)) => {
            tracing::info!("Webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        _ => {
            tracing::warn!(mode = ?query.mode, "Webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// POST /webhooks
async fn receive_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if state.verifier.has_secrets() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        if !state.verifier.verify(&body, signature) {
            WEBHOOK_DELIVERIES_TOTAL
                .with_label_values(&["rejected"])
                .inc();
            return Err(AppError::InvalidSignature);
        }
    }

    match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => {
            state.ingestor.ingest(payload).await;
        }
        Err(error) => {
            WEBHOOK_DELIVERIES_TOTAL
                .with_label_values(&["malformed"])
                .inc();
            tracing::warn!(%error, bytes = body.len(), "Unparseable webhook delivery");
        }
    }

    Ok((StatusCode::OK, "EVENT_RECEIVED").into_response())
}
