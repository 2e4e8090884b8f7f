use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub environment: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let runs = state
        .ctx
        .state
        .list_runs(query.environment.as_deref(), query.limit.unwrap_or(50).min(500))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match state.ctx.state.get_run(&id) {
        Ok(Some(run)) => Ok(Json(run)),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("run {id} not found"))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
