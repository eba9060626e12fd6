use axum::{
    extract::{Path, State},
    Json,
};
use courier_transfer::{AttachOutcome, RemoteFile, RemoteIndex};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{fetch, ApiError, ApiResult};
use crate::{metrics, state::AppState};

const DEFAULT_INDEX_NAME: &str = "Document Store";

#[derive(Debug, Default, Deserialize)]
pub struct CreateIndexRequest {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IndexList {
    object: &'static str,
    data: Vec<RemoteFile>,
}

pub async fn create_index(
    State(state): State<AppState>,
    body: Option<Json<CreateIndexRequest>>,
) -> ApiResult<RemoteIndex> {
    let name = body
        .and_then(|Json(request)| request.name)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string());
    let index = fetch(&state, "index creation", || {
        state.service().create_index(&name)
    })
    .await?;
    info!(index_id = %index.id, name = %name, "index created");
    Ok(Json(index))
}

pub async fn get_index(
    State(state): State<AppState>,
    Path(index_id): Path<String>,
) -> ApiResult<RemoteIndex> {
    let subject = format!("index {index_id}");
    let index = fetch(&state, &subject, || state.service().get_index(&index_id)).await?;
    Ok(Json(index))
}

pub async fn list_index_files(
    State(state): State<AppState>,
    Path(index_id): Path<String>,
) -> ApiResult<IndexList> {
    let subject = format!("index {index_id}");
    let data = fetch(&state, &subject, || {
        state.service().list_index_files(&index_id)
    })
    .await?;
    Ok(Json(IndexList {
        object: "list",
        data,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachRequest {
    file_id: String,
}

pub async fn attach_file(
    State(state): State<AppState>,
    Path(index_id): Path<String>,
    Json(request): Json<AttachRequest>,
) -> ApiResult<AttachOutcome> {
    if request.file_id.trim().is_empty() {
        return Err(ApiError::bad_request("fileId is required"));
    }
    let outcome = state
        .linker()
        .attach(&index_id, &request.file_id)
        .await
        .map_err(|err| ApiError::transfer(err, &state))?;
    if !outcome.file_ready {
        metrics::POLL_DEADLINES.with_label_values(&["file"]).inc();
    }
    Ok(Json(outcome))
}
