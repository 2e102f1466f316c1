//! Subscription listing (§6.1 `GET /subscriptions`).

use axum::extract::State;
use axum::Json;

use crate::rest::dto::SubscriptionSummary;
use crate::rest::state::ApiState;

#[utoipa::path(
    get,
    path = "/api/v1/subscriptions",
    tag = "Subscriptions",
    responses((status = 200, description = "Configured credential profiles", body = [SubscriptionSummary]))
)]
pub async fn list_subscriptions(State(state): State<ApiState>) -> Json<Vec<SubscriptionSummary>> {
    let summaries = state
        .config
        .subscriptions
        .iter()
        .map(|s| SubscriptionSummary {
            id: s.id.clone(),
            provider: s.provider.clone(),
            enabled: s.enabled,
        })
        .collect();
    Json(summaries)
}
