//! Typed client for the external object-detection service.

use std::time::Duration;

use crate::config::BatchLimitsConfig;
use crate::models::ImageSummary;

/// Detector requests time out after 60 s; a whole batch is bounded by the
/// worker's sequential loop, not by this client.
const PREDICT_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// The detector applies this threshold when the query parameter is absent
const DETECTOR_DEFAULT_CONFIDENCE: f64 = 0.25;

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("detector request timed out")]
    Timeout,
    #[error("detector service unavailable: {0}")]
    Unavailable(String),
    #[error("image exceeds the detector payload cap of {max_mb} MB")]
    Oversize { max_mb: u64 },
    #[error("detector error ({status}): {detail}")]
    Upstream { status: u16, detail: String },
    #[error("detector response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Clone)]
pub struct DetectorClient {
    base_url: String,
    http: reqwest::Client,
    max_file_size_bytes: u64,
    max_file_size_mb: u64,
}

impl DetectorClient {
    pub fn new(base_url: &str, http: reqwest::Client, limits: &BatchLimitsConfig) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            max_file_size_bytes: limits.max_detector_file_size_bytes(),
            max_file_size_mb: limits.max_detector_file_size_mb,
        }
    }

    /// Run detection over one image buffer. The threshold is passed
    /// verbatim, except when it matches the detector's own default.
    #[tracing::instrument(name = "detector.predict", skip(self, bytes), fields(file_name = %file_name, size = bytes.len(), conf = confidence_threshold))]
    pub async fn predict(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
        confidence_threshold: f64,
    ) -> Result<ImageSummary, DetectorError> {
        if bytes.len() as u64 > self.max_file_size_bytes {
            return Err(DetectorError::Oversize {
                max_mb: self.max_file_size_mb,
            });
        }

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)
            .map_err(|e| DetectorError::Decode(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut request = self
            .http
            .post(format!("{}/predict", self.base_url))
            .timeout(PREDICT_TIMEOUT)
            .multipart(form);
        if confidence_threshold != DETECTOR_DEFAULT_CONFIDENCE {
            request = request.query(&[("conf", confidence_threshold)]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DetectorError::Timeout
            } else {
                DetectorError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
                .unwrap_or(text);
            return Err(DetectorError::Upstream {
                status: status.as_u16(),
                detail,
            });
        }

        response
            .json::<ImageSummary>()
            .await
            .map_err(|e| DetectorError::Decode(e.to_string()))
    }

    /// Dependency probe used by the health endpoint
    pub async fn health(&self) -> serde_json::Value {
        let result = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => response
                .json()
                .await
                .unwrap_or_else(|_| serde_json::json!({ "status": "unhealthy" })),
            Ok(_) | Err(_) => serde_json::json!({ "status": "unhealthy" }),
        }
    }
}
