use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::AppState;

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Runs one probe pass against the managed services.
pub async fn service_health(State(state): State<AppState>) -> Json<Value> {
    let report = state.ctx.health.check().await;
    let mut body = report.summary_json();
    body["environment"] = json!(state.ctx.environment());
    body["rounds"] = json!(report.rounds);
    body["results"] = json!(report.results);
    Json(body)
}
