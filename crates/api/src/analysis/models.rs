use actix_multipart::form::{MultipartForm, bytes::Bytes};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use lineguard_core::models::{AnalysisImage, AnalysisStatus, AnalysisTask, Detection, ImageSummary};
use lineguard_core::summary::ManualBox;

type UtcDateTime = chrono::DateTime<chrono::Utc>;

/// Multipart body of a batch submission
#[derive(MultipartForm, ToSchema)]
pub(crate) struct BatchUpload {
    #[multipart(rename = "files", limit = "10GiB")]
    #[schema(value_type = Vec<String>, format = Binary)]
    pub(crate) files: Vec<Bytes>,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct BatchQuery {
    /// Confidence threshold forwarded to the detector
    #[serde(default = "default_confidence")]
    pub(crate) conf: f64,
    /// Optional route label (≤ 250 characters)
    #[serde(default)]
    pub(crate) route_name: Option<String>,
    /// How many previews to keep for the history view (1..=10)
    #[serde(default)]
    pub(crate) preview_limit: Option<i64>,
}

fn default_confidence() -> f64 {
    0.35
}

#[derive(Serialize, ToSchema)]
pub(crate) struct TaskCreateResponse {
    pub(crate) task_id: Uuid,
    pub(crate) status: AnalysisStatus,
}

/// Image row as exposed in task and pagination responses
#[derive(Serialize, ToSchema)]
pub(crate) struct TaskImageResponse {
    pub(crate) id: Uuid,
    pub(crate) file_id: Uuid,
    pub(crate) file_name: String,
    pub(crate) file_size: i64,
    pub(crate) status: AnalysisStatus,
    pub(crate) is_preview: bool,
    #[schema(value_type = Option<Object>)]
    pub(crate) summary: Option<ImageSummary>,
    pub(crate) result_file_id: Option<Uuid>,
    pub(crate) error_message: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    pub(crate) created_at: UtcDateTime,
    /// Viewer link for the original image
    pub(crate) original_url: String,
    /// Viewer link for the annotated result, when one exists
    pub(crate) result_url: Option<String>,
    /// Base64 JPEG data URI, present when thumbnails were requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) thumbnail: Option<String>,
}

impl TaskImageResponse {
    pub(crate) fn from_row(image: AnalysisImage, thumbnail: Option<String>) -> Self {
        Self {
            id: image.image_id,
            file_id: image.file_id,
            file_name: image.file_name,
            file_size: image.file_size,
            status: image.status,
            is_preview: image.is_preview,
            summary: image.summary,
            result_file_id: image.result_file_id,
            error_message: image.error_message,
            created_at: image.created_at,
            original_url: format!("/api/files/{}/view", image.file_id),
            result_url: image
                .result_file_id
                .map(|id| format!("/api/files/{}/view", id)),
            thumbnail,
        }
    }
}

/// Full task view including its preview rows
#[derive(Serialize, ToSchema)]
pub(crate) struct TaskResponse {
    pub(crate) id: Uuid,
    pub(crate) status: AnalysisStatus,
    pub(crate) route_name: Option<String>,
    pub(crate) total_files: i32,
    pub(crate) total_bytes: i64,
    pub(crate) processed_files: i32,
    pub(crate) failed_files: i32,
    pub(crate) defects_found: i32,
    pub(crate) confidence_threshold: f64,
    pub(crate) preview_limit: i32,
    pub(crate) message: Option<String>,
    pub(crate) originals_archive_file_id: Option<Uuid>,
    pub(crate) results_archive_file_id: Option<Uuid>,
    #[schema(value_type = String, format = DateTime)]
    pub(crate) created_at: UtcDateTime,
    #[schema(value_type = String, format = DateTime)]
    pub(crate) updated_at: UtcDateTime,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub(crate) completed_at: Option<UtcDateTime>,
    #[schema(value_type = Option<Object>)]
    pub(crate) metadata: Option<serde_json::Value>,
    pub(crate) preview_files: Vec<TaskImageResponse>,
}

impl TaskResponse {
    pub(crate) fn from_task(task: AnalysisTask, previews: Vec<AnalysisImage>) -> Self {
        Self {
            id: task.task_id,
            status: task.status,
            route_name: task.route_name,
            total_files: task.total_files,
            total_bytes: task.total_bytes,
            processed_files: task.processed_files,
            failed_files: task.failed_files,
            defects_found: task.defects_found,
            confidence_threshold: task.confidence_threshold,
            preview_limit: task.preview_limit,
            message: task.message,
            originals_archive_file_id: task.originals_archive_file_id,
            results_archive_file_id: task.results_archive_file_id,
            created_at: task.created_at,
            updated_at: task.updated_at,
            completed_at: task.completed_at,
            metadata: task.task_metadata,
            preview_files: previews
                .into_iter()
                .map(|image| TaskImageResponse::from_row(image, None))
                .collect(),
        }
    }
}

/// Compact history entry
#[derive(Serialize, ToSchema)]
pub(crate) struct TaskListItem {
    pub(crate) id: Uuid,
    pub(crate) status: AnalysisStatus,
    pub(crate) route_name: Option<String>,
    pub(crate) total_files: i32,
    pub(crate) processed_files: i32,
    pub(crate) defects_found: i32,
    #[schema(value_type = String, format = DateTime)]
    pub(crate) created_at: UtcDateTime,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub(crate) completed_at: Option<UtcDateTime>,
}

impl From<AnalysisTask> for TaskListItem {
    fn from(task: AnalysisTask) -> Self {
        Self {
            id: task.task_id,
            status: task.status,
            route_name: task.route_name,
            total_files: task.total_files,
            processed_files: task.processed_files,
            defects_found: task.defects_found,
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub(crate) limit: i64,
}

fn default_history_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct TaskImagesQuery {
    #[serde(default)]
    pub(crate) skip: i64,
    #[serde(default = "default_images_limit")]
    pub(crate) limit: i64,
    #[serde(default)]
    pub(crate) include_thumbnails: bool,
}

fn default_images_limit() -> i64 {
    100
}

#[derive(Serialize, ToSchema)]
pub(crate) struct TaskImagesResponse {
    pub(crate) total: i64,
    pub(crate) skip: i64,
    pub(crate) limit: i64,
    pub(crate) images: Vec<TaskImageResponse>,
}

/// Body of the annotate endpoint
#[derive(Deserialize, ToSchema)]
pub(crate) struct AnnotateRequest {
    pub(crate) bboxes: Vec<ManualBox>,
    #[serde(default)]
    pub(crate) project_id: Option<String>,
    #[serde(default)]
    pub(crate) file_type: Option<String>,
}

/// One object metric as exchanged with the UI metrics editor
#[derive(Serialize, Deserialize, ToSchema)]
pub(crate) struct ImageMetric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) detection_id: Option<String>,
    pub(crate) class_name: String,
    #[serde(default)]
    pub(crate) class_name_ru: Option<String>,
    pub(crate) confidence: f64,
    /// `[x1, y1, x2, y2]` in absolute pixels
    pub(crate) bbox: Vec<f64>,
    /// "damage", "missing" or "normal"
    #[serde(default)]
    pub(crate) defect_type: Option<String>,
    #[serde(default)]
    pub(crate) severity: Option<String>,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    pub(crate) is_manual: bool,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct ImageMetricsRequest {
    pub(crate) metrics: Vec<ImageMetric>,
    #[serde(default)]
    pub(crate) total_objects: Option<i64>,
    #[serde(default)]
    pub(crate) defects_count: Option<i64>,
    #[serde(default)]
    pub(crate) has_defects: Option<bool>,
    #[serde(default)]
    pub(crate) statistics: Option<std::collections::BTreeMap<String, i64>>,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct ImageMetricsSaved {
    pub(crate) image_id: Uuid,
    pub(crate) metrics_count: usize,
    pub(crate) total_objects: i64,
    pub(crate) defects_count: i64,
    pub(crate) has_defects: bool,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct ImageMetricsResponse {
    pub(crate) image_id: Uuid,
    pub(crate) metrics: Vec<ImageMetric>,
    pub(crate) total_objects: i64,
    pub(crate) defects_count: i64,
    pub(crate) has_defects: bool,
    pub(crate) statistics: std::collections::BTreeMap<String, i64>,
}

impl ImageMetric {
    /// Convert a metric into the stored detection shape
    pub(crate) fn into_detection(self) -> Detection {
        let is_damage = matches!(self.defect_type.as_deref(), Some("damage") | Some("missing"));
        let bbox: Vec<i64> = self.bbox.iter().map(|v| v.round() as i64).collect();
        let (width, height) = match bbox[..] {
            [x1, y1, x2, y2] => (x2 - x1, y2 - y1),
            _ => (0, 0),
        };
        let class_localized = self.class_name_ru.unwrap_or_else(|| self.class_name.clone());
        Detection {
            class_name: self.class_name,
            class_localized,
            confidence: self.confidence,
            bbox,
            bbox_size: lineguard_core::models::BboxSize::from_dimensions(width, height),
            defect_summary: lineguard_core::models::DefectSummary {
                kind: if is_damage {
                    lineguard_core::summary::DEFECT_KIND_DAMAGED.to_string()
                } else {
                    lineguard_core::summary::DEFECT_KIND_NORMAL.to_string()
                },
                severity: self
                    .severity
                    .or_else(|| Some(if is_damage { "high" } else { "none" }.to_string())),
                description: self.description.unwrap_or_default(),
            },
            is_manual: self.is_manual,
            detection_id: self.detection_id,
        }
    }

    /// Project a stored detection back into the metric shape
    pub(crate) fn from_detection(detection: &Detection) -> Self {
        let defect_type = if detection.defect_summary.kind == lineguard_core::summary::DEFECT_KIND_NORMAL
        {
            "normal"
        } else if detection
            .defect_summary
            .kind
            .to_lowercase()
            .contains("повреж")
        {
            "damage"
        } else {
            "missing"
        };
        Self {
            detection_id: detection.detection_id.clone(),
            class_name: detection.class_name.clone(),
            class_name_ru: Some(detection.class_localized.clone()),
            confidence: detection.confidence,
            bbox: detection.bbox.iter().map(|&v| v as f64).collect(),
            defect_type: Some(defect_type.to_string()),
            severity: detection.defect_summary.severity.clone(),
            description: Some(detection.defect_summary.description.clone()),
            is_manual: detection.is_manual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineguard_core::models::{BboxSize, DefectSummary};

    #[test]
    fn test_metric_to_detection_conversion() {
        let metric = ImageMetric {
            detection_id: None,
            class_name: "bad_insulator".to_string(),
            class_name_ru: None,
            confidence: 0.4,
            bbox: vec![0.0, 0.0, 10.0, 20.0],
            defect_type: Some("damage".to_string()),
            severity: None,
            description: None,
            is_manual: true,
        };
        let detection = metric.into_detection();
        assert_eq!(detection.bbox, vec![0, 0, 10, 20]);
        assert_eq!(detection.bbox_size.width, 10);
        assert_eq!(detection.bbox_size.height, 20);
        assert_eq!(detection.defect_summary.kind, "Повреждение");
        assert_eq!(detection.defect_summary.severity.as_deref(), Some("high"));
        assert!(detection.is_manual);
    }

    #[test]
    fn test_detection_to_metric_defect_type() {
        let detection = Detection {
            class_name: "insulator".to_string(),
            class_localized: "Изолятор".to_string(),
            confidence: 0.9,
            bbox: vec![1, 2, 3, 4],
            bbox_size: BboxSize::from_dimensions(2, 2),
            defect_summary: DefectSummary {
                kind: "Норма".to_string(),
                severity: Some("none".to_string()),
                description: String::new(),
            },
            is_manual: false,
            detection_id: None,
        };
        let metric = ImageMetric::from_detection(&detection);
        assert_eq!(metric.defect_type.as_deref(), Some("normal"));

        let damaged = Detection {
            defect_summary: DefectSummary {
                kind: "Повреждение".to_string(),
                severity: Some("high".to_string()),
                description: String::new(),
            },
            ..detection
        };
        let metric = ImageMetric::from_detection(&damaged);
        assert_eq!(metric.defect_type.as_deref(), Some("damage"));
    }
}
