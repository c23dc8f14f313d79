//! Typed client for the external blob (files) service.
//!
//! The files service is the system of record for bytes; ids are opaque
//! tokens. This client never parallelizes on its own — batching decisions
//! belong to callers.

use base64::Engine;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Timeout for single-file operations
const SINGLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for batch operations
const BATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Storage categories understood by the files service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Original,
    Preview,
    Result,
    Archive,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Original => "ANALYSIS_ORIGINAL",
            FileKind::Preview => "ANALYSIS_PREVIEW",
            FileKind::Result => "ANALYSIS_RESULT",
            FileKind::Archive => "ANALYSIS_ARCHIVE",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    #[error("files service unavailable: {0}")]
    Unavailable(String),
    #[error("file not found")]
    NotFound,
    #[error("payload exceeds the files service size limit")]
    Oversize,
    #[error("files service rejected the request: {0}")]
    BadRequest(String),
    #[error("files service error ({status}): {detail}")]
    Upstream { status: u16, detail: String },
    #[error("files service response could not be decoded: {0}")]
    Decode(String),
}

/// Reference to a stored blob
#[derive(Debug, Clone, Deserialize)]
pub struct BlobRef {
    pub id: Uuid,
    pub file_name: String,
    pub file_size: i64,
}

/// Blob metadata without the payload
#[derive(Debug, Clone, Deserialize)]
pub struct BlobMetadata {
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
}

/// One file in a batch upload request
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub content_type: String,
}

/// Batch upload result; partial success is reported per item upstream
#[derive(Debug, Clone, Deserialize)]
pub struct BatchUploadOutcome {
    pub files: Vec<BlobRef>,
    pub total: i64,
    #[serde(default)]
    pub failed: i64,
}

/// One downloaded file from a batch request, payload already decoded
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub file_id: Uuid,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct BatchDownloadResponse {
    files: Vec<BatchDownloadItem>,
}

#[derive(Debug, Deserialize)]
struct BatchDownloadItem {
    file_id: Uuid,
    file_name: String,
    content_base64: String,
}

#[derive(Clone)]
pub struct FilesClient {
    base_url: String,
    http: reqwest::Client,
}

impl FilesClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    #[tracing::instrument(name = "files.upload", skip(self, bytes), fields(file_name = %file_name, size = bytes.len(), file_kind = file_kind.as_str()))]
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        content_type: &str,
        project_id: &str,
        file_kind: FileKind,
    ) -> Result<BlobRef, FilesError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)
            .map_err(|e| FilesError::Decode(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("project_id", project_id.to_string())
            .text("file_type", file_kind.as_str());

        let response = self
            .http
            .post(format!("{}/files/upload", self.base_url))
            .timeout(SINGLE_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(transport_err)?;

        let response = check_status(response).await?;
        response
            .json::<BlobRef>()
            .await
            .map_err(|e| FilesError::Decode(e.to_string()))
    }

    /// Upload many files in one round trip
    #[tracing::instrument(name = "files.batch_upload", skip(self, items), fields(file_count = items.len(), file_kind = file_kind.as_str()))]
    pub async fn batch_upload(
        &self,
        items: Vec<UploadItem>,
        project_id: &str,
        file_kind: FileKind,
    ) -> Result<BatchUploadOutcome, FilesError> {
        let mut form = reqwest::multipart::Form::new()
            .text("project_id", project_id.to_string())
            .text("file_type", file_kind.as_str());
        for item in items {
            let part = reqwest::multipart::Part::bytes(item.bytes)
                .file_name(item.file_name)
                .mime_str(&item.content_type)
                .map_err(|e| FilesError::Decode(e.to_string()))?;
            form = form.part("files", part);
        }

        let response = self
            .http
            .post(format!("{}/files/batch-upload", self.base_url))
            .timeout(BATCH_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(transport_err)?;

        let response = check_status(response).await?;
        response
            .json::<BatchUploadOutcome>()
            .await
            .map_err(|e| FilesError::Decode(e.to_string()))
    }

    #[tracing::instrument(name = "files.download", skip(self), fields(file_id = %file_id))]
    pub async fn download(&self, file_id: Uuid) -> Result<Vec<u8>, FilesError> {
        let response = self
            .http
            .get(format!("{}/files/{}/download", self.base_url, file_id))
            .timeout(SINGLE_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;

        let response = check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FilesError::Decode(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Download many files in one round trip. Payloads travel base64-encoded
    /// over JSON; they are decoded here.
    #[tracing::instrument(name = "files.batch_download", skip(self, file_ids), fields(file_count = file_ids.len()))]
    pub async fn batch_download(
        &self,
        file_ids: &[Uuid],
    ) -> Result<Vec<DownloadedFile>, FilesError> {
        let response = self
            .http
            .post(format!("{}/files/batch-download", self.base_url))
            .timeout(BATCH_TIMEOUT)
            .json(&serde_json::json!({ "file_ids": file_ids }))
            .send()
            .await
            .map_err(transport_err)?;

        let response = check_status(response).await?;
        let body: BatchDownloadResponse = response
            .json()
            .await
            .map_err(|e| FilesError::Decode(e.to_string()))?;

        body.files
            .into_iter()
            .map(|item| {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&item.content_base64)
                    .map_err(|e| FilesError::Decode(e.to_string()))?;
                Ok(DownloadedFile {
                    file_id: item.file_id,
                    file_name: item.file_name,
                    bytes,
                })
            })
            .collect()
    }

    #[tracing::instrument(name = "files.get_metadata", skip(self), fields(file_id = %file_id))]
    pub async fn get_metadata(&self, file_id: Uuid) -> Result<BlobMetadata, FilesError> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.base_url, file_id))
            .timeout(SINGLE_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;

        let response = check_status(response).await?;
        response
            .json::<BlobMetadata>()
            .await
            .map_err(|e| FilesError::Decode(e.to_string()))
    }

    /// Delete a blob. With `ignore_missing`, a 404 reports `false` instead
    /// of failing, which makes cleanup sweeps idempotent.
    #[tracing::instrument(name = "files.delete", skip(self), fields(file_id = %file_id))]
    pub async fn delete(&self, file_id: Uuid, ignore_missing: bool) -> Result<bool, FilesError> {
        let response = self
            .http
            .delete(format!("{}/files/{}", self.base_url, file_id))
            .timeout(SINGLE_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND && ignore_missing {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }
}

fn transport_err(e: reqwest::Error) -> FilesError {
    FilesError::Unavailable(e.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, FilesError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = error_detail(response).await;
    Err(match status.as_u16() {
        404 => FilesError::NotFound,
        413 => FilesError::Oversize,
        code if (400..500).contains(&code) => FilesError::BadRequest(detail),
        code => FilesError::Upstream {
            status: code,
            detail,
        },
    })
}

/// Prefer the upstream's `detail` field, fall back to the raw body
async fn error_detail(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_wire_names() {
        assert_eq!(FileKind::Original.as_str(), "ANALYSIS_ORIGINAL");
        assert_eq!(FileKind::Preview.as_str(), "ANALYSIS_PREVIEW");
        assert_eq!(FileKind::Result.as_str(), "ANALYSIS_RESULT");
        assert_eq!(FileKind::Archive.as_str(), "ANALYSIS_ARCHIVE");
    }

    #[test]
    fn test_batch_download_payload_decoding() {
        let file_id = Uuid::new_v4();
        let raw = serde_json::json!({
            "files": [{
                "file_id": file_id,
                "file_name": "tower.jpg",
                "content_base64": base64::engine::general_purpose::STANDARD.encode(b"bytes"),
                "mime_type": "image/jpeg",
                "file_size": 5
            }],
            "total": 1,
            "failed": 0
        });
        let parsed: BatchDownloadResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.files.len(), 1);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&parsed.files[0].content_base64)
            .unwrap();
        assert_eq!(decoded, b"bytes");
    }
}
