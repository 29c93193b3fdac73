use std::path::Path;

use thiserror::Error;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::repositories;

#[derive(Debug, Error)]
pub(crate) enum IngestError {
    #[error("{0}")]
    Validation(String),
    #[error("artifact storage is not configured")]
    StorageUnavailable,
    #[error("artifact upload failed: {0}")]
    Storage(String),
    #[error("failed to record sheet")]
    Persistence(#[source] sqlx::Error),
}

#[derive(Debug)]
pub(crate) struct NewSheet {
    pub(crate) title: String,
    pub(crate) file_name: String,
    pub(crate) mime_type: String,
    pub(crate) bytes: Vec<u8>,
}

/// Records a submission: artifact first, metadata row second. If the row
/// insert fails the artifact is deleted again, so a caller either gets a
/// pending sheet or nothing.
pub(crate) async fn submit(
    state: &AppState,
    owner_id: &str,
    sheet: NewSheet,
) -> Result<String, IngestError> {
    let title = sheet.title.trim();
    validate_upload(state.settings(), title, &sheet.file_name, &sheet.mime_type, sheet.bytes.len())?;

    let storage = state.storage().ok_or(IngestError::StorageUnavailable)?;

    let sheet_id = Uuid::new_v4().to_string();
    let key = format!("sheets/{}/{}_{}", owner_id, sheet_id, sanitized_filename(&sheet.file_name));

    let (file_size, _hash) = storage
        .upload_bytes(&key, &sheet.mime_type, sheet.bytes)
        .await
        .map_err(|err| IngestError::Storage(err.to_string()))?;

    let insert = repositories::sheets::insert(
        state.db(),
        repositories::sheets::CreateSheet {
            id: &sheet_id,
            owner_id,
            title,
            file_name: &sheet.file_name,
            artifact_key: &key,
            file_size,
            mime_type: &sheet.mime_type,
            uploaded_at: primitive_now_utc(),
        },
    )
    .await;

    if let Err(insert_err) = insert {
        if let Err(cleanup_err) = storage.delete_object(&key).await {
            tracing::error!(
                sheet_id,
                key,
                error = %cleanup_err,
                "Failed to remove artifact after insert failure"
            );
        }
        return Err(IngestError::Persistence(insert_err));
    }

    metrics::counter!("sheets_submitted_total").increment(1);
    tracing::info!(sheet_id, owner_id, "Sheet submitted");

    Ok(sheet_id)
}

pub(crate) fn validate_upload(
    settings: &Settings,
    title: &str,
    file_name: &str,
    mime_type: &str,
    size_bytes: usize,
) -> Result<(), IngestError> {
    if title.is_empty() {
        return Err(IngestError::Validation("Sheet title must not be empty".to_string()));
    }

    if size_bytes == 0 {
        return Err(IngestError::Validation("Uploaded file is empty".to_string()));
    }

    let max_bytes = settings.storage().max_upload_size_mb * 1024 * 1024;
    if size_bytes as u64 > max_bytes {
        return Err(IngestError::Validation(format!(
            "File size exceeds {}MB limit",
            settings.storage().max_upload_size_mb
        )));
    }

    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .ok_or_else(|| IngestError::Validation("File must have an extension".to_string()))?;

    if !settings.storage().allowed_sheet_extensions.iter().any(|allowed| allowed == &extension) {
        return Err(IngestError::Validation(format!(
            "File extension '{extension}' is not allowed"
        )));
    }

    let mime = mime_type.trim().to_ascii_lowercase();
    if mime_allowed_for_extension(&mime, &extension) {
        Ok(())
    } else {
        Err(IngestError::Validation(format!(
            "MIME type '{mime}' does not match extension '.{extension}'"
        )))
    }
}

pub(crate) fn sanitized_filename(file_name: &str) -> String {
    file_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') { ch } else { '_' })
        .collect()
}

fn mime_allowed_for_extension(mime: &str, extension: &str) -> bool {
    match extension {
        "jpg" | "jpeg" => matches!(mime, "image/jpeg" | "image/jpg"),
        "png" => mime == "image/png",
        "webp" => mime == "image/webp",
        "pdf" => mime == "application/pdf",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Settings;
    use crate::test_support;

    async fn settings() -> Settings {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        Settings::load().expect("settings")
    }

    #[tokio::test]
    async fn empty_title_is_rejected() {
        let settings = settings().await;
        let err = validate_upload(&settings, "", "sheet.png", "image/png", 128).expect_err("title");
        assert!(matches!(err, IngestError::Validation(message) if message.contains("title")));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let settings = settings().await;
        let too_big = (settings.storage().max_upload_size_mb as usize) * 1024 * 1024 + 1;
        let err = validate_upload(&settings, "Midterm", "sheet.png", "image/png", too_big)
            .expect_err("size");
        assert!(matches!(err, IngestError::Validation(message) if message.contains("limit")));
    }

    #[tokio::test]
    async fn disallowed_extension_is_rejected() {
        let settings = settings().await;
        let err = validate_upload(&settings, "Midterm", "sheet.exe", "image/png", 128)
            .expect_err("extension");
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[tokio::test]
    async fn mime_must_match_extension() {
        let settings = settings().await;
        let err = validate_upload(&settings, "Midterm", "sheet.png", "application/pdf", 128)
            .expect_err("mime");
        assert!(matches!(err, IngestError::Validation(message) if message.contains("MIME")));
    }

    #[tokio::test]
    async fn pdf_uploads_are_accepted() {
        let settings = settings().await;
        validate_upload(&settings, "Midterm", "sheet.pdf", "application/pdf", 128).expect("pdf");
    }

    #[test]
    fn sanitized_filename_replaces_unsafe_characters() {
        assert_eq!(sanitized_filename("math exam (final).png"), "math_exam__final_.png");
        assert_eq!(sanitized_filename("простой.pdf"), "_______.pdf");
    }
}
