//! Typed client for the external annotation-overlay service.

use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use crate::summary::ManualBox;

const ANNOTATE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum AnnotatorError {
    #[error("annotation service unavailable: {0}")]
    Unavailable(String),
    #[error("annotation service error ({status}): {detail}")]
    Upstream { status: u16, detail: String },
    #[error("annotation service response could not be decoded: {0}")]
    Decode(String),
}

/// Result of an overlay request; `file_id` points at the newly stored image
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationOutcome {
    pub success: bool,
    pub file_id: Option<Uuid>,
    pub filename: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct AnnotatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl AnnotatorClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Draw the given boxes onto the blob `file_id` and store the result as
    /// a new blob under `project_id`.
    #[tracing::instrument(name = "annotator.annotate", skip(self, boxes), fields(file_id = %file_id, box_count = boxes.len()))]
    pub async fn annotate(
        &self,
        file_id: Uuid,
        boxes: &[ManualBox],
        project_id: &str,
        file_type: &str,
    ) -> Result<AnnotationOutcome, AnnotatorError> {
        let response = self
            .http
            .post(format!("{}/annotations/annotate", self.base_url))
            .timeout(ANNOTATE_TIMEOUT)
            .json(&serde_json::json!({
                "file_id": file_id,
                "bboxes": boxes,
                "project_id": project_id,
                "file_type": file_type,
            }))
            .send()
            .await
            .map_err(|e| AnnotatorError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
                .unwrap_or(text);
            return Err(AnnotatorError::Upstream {
                status: status.as_u16(),
                detail,
            });
        }

        response
            .json::<AnnotationOutcome>()
            .await
            .map_err(|e| AnnotatorError::Decode(e.to_string()))
    }
}
