use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub environment: Option<String>,
}

pub async fn list_artifacts(
    State(state): State<AppState>,
    Query(query): Query<ArtifactQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let artifacts = state
        .ctx
        .store
        .list(query.environment.as_deref())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "artifacts": artifacts })))
}

pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let artifact = state
        .ctx
        .store
        .get(&id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("artifact {id} not found")))?;
    let refs = state
        .ctx
        .store
        .ref_count(&id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let expired = artifact.is_expired(Utc::now());
    Ok(Json(serde_json::json!({ "artifact": artifact, "references": refs, "expired": expired })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::ArtifactStore;
    use crate::models::artifact::{ArtifactKind, ArtifactStatus, BackupArtifact};
    use crate::testing::{self, FakeControl};
    use std::sync::Arc;

    #[tokio::test]
    async fn held_artifact_past_retention_reports_expired() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = testing::context(testing::config(dir.path()), vec![], FakeControl::new(), vec![], vec![]);
        let state = AppState { ctx: Arc::new(ctx) };

        let created_at = Utc::now() - chrono::Duration::days(10);
        let id = ArtifactStore::new_artifact_id(ArtifactKind::Manual);
        let archive = state.ctx.store.write_component(&id, "postgres", true, b"rows").unwrap();
        let mut artifact = BackupArtifact {
            id: id.clone(),
            kind: ArtifactKind::Manual,
            environment: "staging".into(),
            created_at,
            expires_at: created_at + chrono::Duration::days(7),
            components: vec![archive],
            total_size: 0,
            status: ArtifactStatus::Unusable,
        };
        artifact.refresh_status();
        state.ctx.store.save(&artifact).unwrap();
        let _lease = state.ctx.store.acquire(&id, "rollback-1").unwrap();

        let resp = get_artifact(State(state.clone()), Path(id)).await.unwrap().into_response();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["expired"], true);
        assert_eq!(body["references"], 1);

        let missing = get_artifact(State(state), Path("nope".into())).await.err().unwrap();
        assert_eq!(missing.0, StatusCode::NOT_FOUND);
    }
}
