use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use batch_common::job::new_file_id;

use crate::error::ApiError;

use super::AppState;

#[derive(Serialize)]
pub struct FileUploadResponse {
    pub id: String,
    pub bytes: u64,
    pub purpose: String,
}

/// `POST /v1/files`: multipart upload of a JSONL input file.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<FileUploadResponse>, ApiError> {
    let mut contents: Option<Vec<u8>> = None;
    let mut purpose = "batch".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::invalid_input(format!("invalid multipart body: {}", err)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let bytes = field.bytes().await.map_err(|err| {
                    ApiError::invalid_input(format!("failed to read file field: {}", err))
                })?;
                contents = Some(bytes.to_vec());
            }
            Some("purpose") => {
                purpose = field.text().await.map_err(|err| {
                    ApiError::invalid_input(format!("failed to read purpose field: {}", err))
                })?;
            }
            _ => {}
        }
    }

    let contents = contents.ok_or_else(|| ApiError::invalid_input("missing file field"))?;
    if purpose != "batch" {
        return Err(ApiError::invalid_input(format!(
            "unsupported purpose {}",
            purpose
        )));
    }

    let file_id = new_file_id();
    let bytes = state.store.put(&file_id, &contents)?;
    metrics::counter!("files_uploaded_total").increment(1);

    Ok(Json(FileUploadResponse {
        id: file_id,
        bytes,
        purpose,
    }))
}

/// `GET /v1/files/{id}/content`: raw JSONL, input or output.
pub async fn content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let contents = state.store.get(&id)?;
    Ok((
        [(header::CONTENT_TYPE, "application/jsonl")],
        contents,
    )
        .into_response())
}
