use axum::{
    extract::{Multipart, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentOwner;
use crate::core::state::AppState;
use crate::db::types::SheetStatus;
use crate::repositories;
use crate::schemas::sheet::{
    ListSheetsQuery, SheetDetailResponse, SheetResponse, SubmitSheetResponse,
};
use crate::services::ingestion::{self, NewSheet};


pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_sheet).get(list_sheets))
        .route("/:sheet_id", get(get_sheet_detail).delete(withdraw_sheet))
}

async fn submit_sheet(
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitSheetResponse>, ApiError> {
    let mut title: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;
    let mut content_type: Option<String> = None;
    let max_bytes = state.settings().storage().max_upload_size_mb * 1024 * 1024;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            file_name = field.file_name().map(|s| s.to_string());
            content_type = field.content_type().map(|s| s.to_string());
            let mut bytes = Vec::new();
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|_| ApiError::BadRequest("Failed to read file".to_string()))?
            {
                let next_size = bytes.len() as u64 + chunk.len() as u64;
                if next_size > max_bytes {
                    return Err(ApiError::BadRequest(format!(
                        "File size exceeds {}MB limit",
                        state.settings().storage().max_upload_size_mb
                    )));
                }
                bytes.extend_from_slice(&chunk);
            }
            file_bytes = Some(bytes);
        } else if name == "title" {
            let text = field
                .text()
                .await
                .map_err(|_| ApiError::BadRequest("Invalid title".to_string()))?;
            title = Some(text);
        }
    }

    let title = title.ok_or_else(|| ApiError::BadRequest("Title is required".to_string()))?;
    let file_bytes =
        file_bytes.ok_or_else(|| ApiError::BadRequest("File is required".to_string()))?;
    let file_name = file_name.unwrap_or_else(|| "sheet.jpg".to_string());
    let mime_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());

    let sheet_id = ingestion::submit(
        &state,
        &owner_id,
        NewSheet { title, file_name, mime_type, bytes: file_bytes },
    )
    .await?;

    Ok(Json(SubmitSheetResponse { id: sheet_id, status: SheetStatus::Pending }))
}

async fn list_sheets(
    Query(query): Query<ListSheetsQuery>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<Vec<SheetResponse>>, ApiError> {
    query.validate().map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let limit = query.limit.unwrap_or(10);

    let sheets = repositories::sheets::list_by_owner(state.db(), &owner_id, limit)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch sheets"))?;

    Ok(Json(sheets.into_iter().map(SheetResponse::from).collect()))
}

async fn get_sheet_detail(
    Path(sheet_id): Path<String>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<SheetDetailResponse>, ApiError> {
    let sheet = repositories::sheets::find_by_id(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch sheet"))?
        .ok_or_else(|| ApiError::NotFound("Sheet not found".to_string()))?;

    if sheet.owner_id != owner_id {
        return Err(ApiError::Forbidden("Access denied"));
    }

    let result = repositories::results::find_by_sheet(state.db(), &sheet.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch grading result"))?;

    let artifact_url =
        state.storage().map(|storage| storage.public_url(&sheet.artifact_key));

    Ok(Json(SheetDetailResponse {
        sheet: sheet.into(),
        artifact_url,
        result: result.map(|result| result.into()),
    }))
}

async fn withdraw_sheet(
    Path(sheet_id): Path<String>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = repositories::sheets::delete_pending(state.db(), &owner_id, &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to withdraw sheet"))?;

    let Some(artifact_key) = deleted else {
        // Figure out why the guarded delete matched nothing.
        let sheet = repositories::sheets::find_by_id(state.db(), &sheet_id)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to fetch sheet"))?
            .ok_or_else(|| ApiError::NotFound("Sheet not found".to_string()))?;

        if sheet.owner_id != owner_id {
            return Err(ApiError::Forbidden("Access denied"));
        }

        return Err(ApiError::Conflict("Sheet is already being processed".to_string()));
    };

    if let Some(storage) = state.storage() {
        if let Err(err) = storage.delete_object(&artifact_key).await {
            tracing::warn!(sheet_id, error = %err, "Failed to delete withdrawn artifact");
        }
    }

    tracing::info!(sheet_id, owner_id, "Sheet withdrawn");

    Ok(Json(serde_json::json!({ "message": "Sheet withdrawn" })))
}
