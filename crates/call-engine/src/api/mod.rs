//! Internal HTTP API and inbound provider webhooks

mod error;

pub use error::{ApiError, ErrorResponse};

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::call_log::{CallFilter, CallRecord};
use crate::error::CallEngineError;
use crate::orchestrator::{CallOptions, CallOrchestrator, CancelOutcome, WebhookAck};
use crate::types::{AttemptId, OrderId};
use crate::webhook::{InboundWebhook, WebhookSource};

pub const TELEPHONY_SIGNATURE_HEADER: &str = "x-twilio-signature";
pub const VOICE_SIGNATURE_HEADER: &str = "elevenlabs-signature";

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<CallOrchestrator>,
}

/// Calls recorded for one order plus its attempt accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCalls {
    pub order_id: OrderId,
    pub attempts: u32,
    pub last_call_at: Option<DateTime<Utc>>,
    pub calls: Vec<CallRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub order_id: OrderId,
    pub outcome: CancelOutcome,
}

pub fn build_router(orchestrator: Arc<CallOrchestrator>) -> Router {
    Router::new()
        .route(
            "/v1/orders/:order_id/calls",
            post(initiate_call).delete(cancel_call).get(order_calls),
        )
        .route("/v1/calls", get(list_calls))
        .route("/v1/calls/stats", get(call_stats))
        .route("/v1/calls/:attempt_id", get(get_call))
        .route("/v1/webhooks/telephony", post(telephony_webhook))
        .route("/v1/webhooks/voice", post(voice_webhook))
        // Providers fetch the answer document with POST by default
        .route(
            "/v1/conversations/:attempt_id/twiml",
            get(conversation_twiml).post(conversation_twiml),
        )
        .route("/v1/conversations/:attempt_id/audio", get(conversation_audio))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(ApiState { orchestrator })
}

async fn initiate_call(
    State(state): State<ApiState>,
    Path(order_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let options = if body.iter().all(u8::is_ascii_whitespace) {
        CallOptions::default()
    } else {
        serde_json::from_slice::<CallOptions>(&body)
            .map_err(|e| CallEngineError::validation(format!("Invalid request body: {}", e)))?
    };

    let summary = state
        .orchestrator
        .initiate_call(&OrderId::new(order_id), options)
        .await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn cancel_call(
    State(state): State<ApiState>,
    Path(order_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let order_id = OrderId::new(order_id);
    let outcome = state.orchestrator.cancel_call(&order_id).await?;
    Ok(Json(CancelResponse { order_id, outcome }))
}

async fn order_calls(
    State(state): State<ApiState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderCalls>, ApiError> {
    let order_id = OrderId::new(order_id);
    let calls = state.orchestrator.calls_for_order(&order_id).await?;
    let (attempts, last_call_at) = state.orchestrator.attempts().accounting(&order_id).await?;
    Ok(Json(OrderCalls {
        order_id,
        attempts,
        last_call_at,
        calls,
    }))
}

async fn list_calls(
    State(state): State<ApiState>,
    Query(filter): Query<CallFilter>,
) -> Result<Json<Vec<CallRecord>>, ApiError> {
    Ok(Json(state.orchestrator.list_calls(&filter).await?))
}

async fn call_stats(
    State(state): State<ApiState>,
    Query(filter): Query<CallFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.call_stats(&filter).await?))
}

async fn get_call(
    State(state): State<ApiState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<CallRecord>, ApiError> {
    Ok(Json(state.orchestrator.get_call(&AttemptId(attempt_id)).await?))
}

async fn telephony_webhook(
    State(state): State<ApiState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/v1/webhooks/telephony");
    let url = public_url(&state, path);
    let webhook = InboundWebhook {
        source: WebhookSource::Telephony,
        url: &url,
        body: &body,
        signature: header_str(&headers, TELEPHONY_SIGNATURE_HEADER),
    };
    Ok(Json(state.orchestrator.handle_webhook(&webhook).await?))
}

async fn voice_webhook(
    State(state): State<ApiState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let url = public_url(&state, uri.path());
    let webhook = InboundWebhook {
        source: WebhookSource::Voice,
        url: &url,
        body: &body,
        signature: header_str(&headers, VOICE_SIGNATURE_HEADER),
    };
    Ok(Json(state.orchestrator.handle_webhook(&webhook).await?))
}

async fn conversation_twiml(
    State(state): State<ApiState>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt_id = AttemptId(attempt_id);
    // Only answer for attempts that actually have audio
    state.orchestrator.conversation_asset(&attempt_id).await?;

    let audio_url = public_url(&state, &format!("/v1/conversations/{}/audio", attempt_id));
    let document = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Play>{}</Play></Response>",
        xml_escape(&audio_url)
    );
    Ok(([(header::CONTENT_TYPE, "application/xml")], document))
}

async fn conversation_audio(
    State(state): State<ApiState>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let asset = state.orchestrator.conversation_asset(&AttemptId(attempt_id)).await?;
    Ok(([(header::CONTENT_TYPE, asset.content_type)], asset.audio))
}

fn public_url(state: &ApiState, path: &str) -> String {
    format!(
        "{}{}",
        state.orchestrator.config().general.public_base_url.trim_end_matches('/'),
        path
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("https://a.test/x?a=1&b=<2>"), "https://a.test/x?a=1&amp;b=&lt;2&gt;");
    }
}
