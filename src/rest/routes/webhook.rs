//! Webhook inspection and testing handlers (§6.1 `/webhook/*`).

use axum::extract::State;
use axum::Json;

use crate::rest::dto::{
    OkResponse, ProbeReceiverRequest, ProbeReceiverResponse, WebhookStatusResponse,
};
use crate::rest::state::ApiState;
use crate::webhook::TestWebhookInput;

#[utoipa::path(
    get,
    path = "/api/v1/webhook/status",
    tag = "Webhook",
    responses((status = 200, description = "Delivery counters and recent attempts", body = WebhookStatusResponse))
)]
pub async fn webhook_status(State(state): State<ApiState>) -> Json<WebhookStatusResponse> {
    Json(WebhookStatusResponse {
        counters: state.webhook.counters(),
        recent_attempts: state.webhook.recent_attempts(),
    })
}

#[utoipa::path(
    post,
    path = "/api/v1/webhook/test",
    tag = "Webhook",
    request_body = TestWebhookInput,
    responses((status = 200, description = "Whether the synthetic delivery succeeded", body = OkResponse))
)]
pub async fn webhook_test(
    State(state): State<ApiState>,
    Json(req): Json<TestWebhookInput>,
) -> Json<OkResponse> {
    let ok = state.webhook.send_test(req).await;
    Json(OkResponse { ok })
}

#[utoipa::path(
    post,
    path = "/api/v1/webhook/probe-receiver",
    tag = "Webhook",
    request_body = ProbeReceiverRequest,
    responses((status = 200, description = "Whether the receiver URL accepted a probe POST", body = ProbeReceiverResponse))
)]
pub async fn probe_receiver(
    State(state): State<ApiState>,
    Json(req): Json<ProbeReceiverRequest>,
) -> Json<ProbeReceiverResponse> {
    let (ok, status, error) = state.webhook.probe_receiver(&req.url, req.token.as_deref()).await;
    Json(ProbeReceiverResponse { ok, status, error })
}
